use super::{Condition, FieldValue, Filter, Point, ScoredPoint, VectorStore};
use crate::domain::types::Payload;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Qdrant over its REST API. Collection names from the naming grammar
/// contain `/`, which is percent-encoded into the URL path; point ids are
/// deterministic UUIDs derived from the domain id, with the domain id
/// kept in the payload under `_id`.
pub struct QdrantVectorStore {
    http: Client,
    base_url: String,
}

impl QdrantVectorStore {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(timeout_secs.max(1)))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self, name: &str) -> String {
        // Only '/' needs escaping; the grammar keeps the rest URL-safe.
        format!(
            "{}/collections/{}",
            self.base_url,
            name.replace('/', "%2F")
        )
    }

    async fn check_ok(resp: reqwest::Response, what: &str) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!("qdrant {what} ({status}): {body}")));
        }
        Ok(resp.json().await?)
    }
}

/// Deterministic qdrant point id for a domain id.
fn point_uuid(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let bytes: [u8; 16] = digest[..16].try_into().expect("sha256 yields 32 bytes");
    uuid::Uuid::from_bytes(bytes).to_string()
}

fn filter_json(filter: &Filter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|cond| match cond {
            Condition::Eq { field, value } => {
                let v = match value {
                    FieldValue::Str(s) => json!(s),
                    FieldValue::Bool(b) => json!(b),
                    FieldValue::Int(i) => json!(i),
                };
                json!({ "key": field, "match": { "value": v } })
            }
        })
        .collect();
    Some(json!({ "must": must }))
}

fn encode_payload(id: &str, payload: &Payload) -> Result<Value> {
    let mut value = serde_json::to_value(payload)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::internal("payload did not serialize to an object"))?;
    obj.insert("_id".to_string(), json!(id));
    Ok(value)
}

fn decode_payload(mut value: Value) -> Result<(String, Payload)> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::internal("qdrant payload is not an object"))?;
    let id = obj
        .remove("_id")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| Error::internal("qdrant payload missing _id"))?;
    let payload: Payload = serde_json::from_value(value)?;
    Ok((id, payload))
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let url = self.collection_url(name);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            let body = json!({ "vectors": { "size": dim, "distance": "Cosine" } });
            let resp = self.http.put(&url).json(&body).send().await?;
            Self::check_ok(resp, "create collection").await?;
            return Ok(());
        }
        let info = Self::check_ok(resp, "get collection").await?;
        let existing = info["result"]["config"]["params"]["vectors"]["size"]
            .as_u64()
            .unwrap_or(0) as usize;
        if existing != dim {
            return Err(Error::internal(format!(
                "collection {name} is stamped dim {existing}, requested {dim}"
            )));
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: Point) -> Result<()> {
        let url = format!("{}/points?wait=true", self.collection_url(collection));
        let body = json!({
            "points": [{
                "id": point_uuid(&point.id),
                "vector": point.vector,
                "payload": encode_payload(&point.id, &point.payload)?,
            }]
        });
        let resp = self.http.put(&url).json(&body).send().await?;
        Self::check_ok(resp, "upsert").await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>> {
        let url = format!("{}/points/search", self.collection_url(collection));
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(f) = filter_json(filter) {
            body["filter"] = f;
        }
        let resp = self.http.post(&url).json(&body).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let value = Self::check_ok(resp, "search").await?;
        let mut hits = Vec::new();
        let Some(results) = value["result"].as_array() else {
            return Ok(hits);
        };
        for hit in results {
            let score = hit["score"].as_f64().unwrap_or(0.0) as f32;
            let Some(payload) = hit.get("payload").cloned() else {
                continue;
            };
            match decode_payload(payload) {
                Ok((id, payload)) => hits.push(ScoredPoint {
                    id,
                    score: score.clamp(0.0, 1.0),
                    payload,
                }),
                Err(e) => {
                    // Reads skip malformed records instead of failing whole.
                    tracing::warn!("skipping malformed qdrant payload: {e}");
                }
            }
        }
        Ok(hits)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>> {
        let url = format!("{}/points", self.collection_url(collection));
        let body = json!({
            "ids": [point_uuid(id)],
            "with_payload": true,
            "with_vector": true,
        });
        let resp = self.http.post(&url).json(&body).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = Self::check_ok(resp, "get").await?;
        let Some(first) = value["result"].as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };
        let vector: Vec<f32> = serde_json::from_value(first["vector"].clone())?;
        let (decoded_id, payload) = decode_payload(
            first
                .get("payload")
                .cloned()
                .ok_or_else(|| Error::internal("qdrant point missing payload"))?,
        )?;
        Ok(Some(Point {
            id: decoded_id,
            vector,
            payload,
        }))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let existed = self.get(collection, id).await?.is_some();
        if !existed {
            return Ok(false);
        }
        let url = format!(
            "{}/points/delete?wait=true",
            self.collection_url(collection)
        );
        let body = json!({ "points": [point_uuid(id)] });
        let resp = self.http.post(&url).json(&body).send().await?;
        Self::check_ok(resp, "delete").await?;
        Ok(true)
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Point>> {
        let url = format!("{}/points/scroll", self.collection_url(collection));
        let mut body = json!({
            "limit": offset + limit,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(f) = filter_json(filter) {
            body["filter"] = f;
        }
        let resp = self.http.post(&url).json(&body).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let value = Self::check_ok(resp, "scroll").await?;
        let mut points = Vec::new();
        let Some(results) = value["result"]["points"].as_array() else {
            return Ok(points);
        };
        for item in results {
            let Some(payload) = item.get("payload").cloned() else {
                continue;
            };
            let vector: Vec<f32> =
                serde_json::from_value(item["vector"].clone()).unwrap_or_default();
            match decode_payload(payload) {
                Ok((id, payload)) => points.push(Point {
                    id,
                    vector,
                    payload,
                }),
                Err(e) => {
                    tracing::warn!("skipping malformed qdrant payload: {e}");
                }
            }
        }
        points.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(points.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BranchContext, FoldRecord};

    #[test]
    fn test_point_uuid_deterministic() {
        assert_eq!(point_uuid("chk-abc"), point_uuid("chk-abc"));
        assert_ne!(point_uuid("chk-abc"), point_uuid("chk-abd"));
        assert!(uuid::Uuid::parse_str(&point_uuid("x")).is_ok());
    }

    #[test]
    fn test_collection_url_escapes_slashes() {
        let store = QdrantVectorStore::new("http://localhost:6333".into(), 5);
        assert_eq!(
            store.collection_url("owner_ab/project_cd/main"),
            "http://localhost:6333/collections/owner_ab%2Fproject_cd%2Fmain"
        );
    }

    #[test]
    fn test_filter_json_shape() {
        let f = Filter::none().eq("category", "runtime").eq("version", 2i64);
        let v = filter_json(&f).unwrap();
        assert_eq!(v["must"][0]["key"], "category");
        assert_eq!(v["must"][0]["match"]["value"], "runtime");
        assert_eq!(v["must"][1]["match"]["value"], 2);
        assert!(filter_json(&Filter::none()).is_none());
    }

    #[test]
    fn test_payload_encode_decode_roundtrip() {
        let payload = Payload::Fold(FoldRecord {
            branch_id: "b1".into(),
            session_id: "s1".into(),
            description: "d".into(),
            summary: "sum".into(),
            branch_context: BranchContext {
                branch_id: "b1".into(),
                parent_branch_id: None,
                depth: 1,
                tokens_folded: 100,
                operations_count: 2,
                secrets_scrubbed: 0,
            },
            created_at: 1,
        });
        let encoded = encode_payload("fold-b1", &payload).unwrap();
        assert_eq!(encoded["_id"], "fold-b1");
        let (id, decoded) = decode_payload(encoded).unwrap();
        assert_eq!(id, "fold-b1");
        assert_eq!(decoded, payload);
    }
}
