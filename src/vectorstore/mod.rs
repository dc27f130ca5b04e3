mod memory;
mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::QdrantVectorStore;

use crate::config::VectorStoreConfig;
use crate::domain::types::Payload;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One stored record. The id is the domain id (e.g. `chk-…`), the payload
/// the closed tagged union for the collection's kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    /// In [0, 1], descending over a result set.
    pub score: f32,
    pub payload: Payload,
}

/// Typed payload filter. Caller-provided strings are only ever values —
/// nothing here is string-interpolated into a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub must: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { field: String, value: FieldValue },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
}

impl Filter {
    pub fn none() -> Self {
        Filter::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.must.push(Condition::Eq {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Evaluate against a payload serialized to JSON. Fields are looked up
    /// at the top level of the payload object.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|cond| match cond {
            Condition::Eq { field, value } => match (payload.get(field), value) {
                (Some(Value::String(s)), FieldValue::Str(want)) => s == want,
                (Some(Value::Bool(b)), FieldValue::Bool(want)) => b == want,
                (Some(v), FieldValue::Int(want)) => v.as_i64() == Some(*want),
                _ => false,
            },
        })
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

/// Uniform contract over any ANN backend with payload filters. The
/// backend is chosen once at startup; collections are dimension-stamped
/// at creation and a vector of any other dimension is a fatal error.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    /// Idempotent: same id and equal payload leave a single record.
    async fn upsert(&self, collection: &str, point: Point) -> Result<()>;

    /// Top-k by similarity; missing collections yield an empty result so
    /// layered reads over not-yet-written branch collections stay cheap.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>>;

    /// Returns whether a record was actually removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Filtered page in stable id order.
    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Point>>;
}

/// Build the configured backend. `memory` needs no infrastructure and is
/// the default; `qdrant` talks to a running server over REST.
pub fn from_config(cfg: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match cfg.provider.as_str() {
        "memory" => Ok(Arc::new(MemoryVectorStore::new())),
        "qdrant" => Ok(Arc::new(QdrantVectorStore::new(
            cfg.url.clone(),
            cfg.timeout_secs,
        ))),
        other => Err(Error::invalid_argument(format!(
            "unknown vectorstore provider {other:?} (expected memory or qdrant)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_typed_values() {
        let payload = json!({
            "kind": "remediation",
            "category": "runtime",
            "auto_created": true,
            "version": 3,
        });
        assert!(Filter::none().matches(&payload));
        assert!(Filter::none().eq("category", "runtime").matches(&payload));
        assert!(!Filter::none().eq("category", "compile").matches(&payload));
        assert!(Filter::none().eq("auto_created", true).matches(&payload));
        assert!(Filter::none().eq("version", 3i64).matches(&payload));
        assert!(!Filter::none().eq("missing", "x").matches(&payload));
        assert!(Filter::none()
            .eq("category", "runtime")
            .eq("auto_created", true)
            .matches(&payload));
    }

    #[test]
    fn test_filter_values_are_not_interpolated() {
        // A hostile value stays a value; it can never widen the filter.
        let payload = json!({"category": "runtime"});
        let hostile = Filter::none().eq("category", "runtime\" OR 1=1");
        assert!(!hostile.matches(&payload));
    }
}
