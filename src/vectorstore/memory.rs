use super::{Filter, Point, ScoredPoint, VectorStore};
use crate::embeddings::cosine_similarity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-process vector store: exact cosine scan over a `BTreeMap` per
/// collection. No infrastructure, deterministic ordering — the test seam
/// and the zero-setup local mode.
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemCollection>>,
}

struct MemCollection {
    dim: usize,
    points: BTreeMap<String, Point>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        match collections.get(name) {
            Some(existing) if existing.dim != dim => Err(Error::internal(format!(
                "collection {name} is stamped dim {}, requested {dim}",
                existing.dim
            ))),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    MemCollection {
                        dim,
                        points: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, point: Point) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection {collection}")))?;
        if point.vector.len() != coll.dim {
            return Err(Error::internal(format!(
                "vector dim {} does not match collection {collection} dim {}",
                point.vector.len(),
                coll.dim
            )));
        }
        coll.points.insert(point.id.clone(), point);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if vector.len() != coll.dim {
            return Err(Error::internal(format!(
                "query dim {} does not match collection {collection} dim {}",
                vector.len(),
                coll.dim
            )));
        }
        let mut hits: Vec<ScoredPoint> = Vec::new();
        for point in coll.points.values() {
            if !filter.is_empty() {
                let payload_json = serde_json::to_value(&point.payload)?;
                if !filter.matches(&payload_json) {
                    continue;
                }
            }
            let score = cosine_similarity(vector, &point.vector).clamp(0.0, 1.0);
            hits.push(ScoredPoint {
                id: point.id.clone(),
                score,
                payload: point.payload.clone(),
            });
        }
        // Descending score; ties broken by id for determinism.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Point>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|coll| coll.points.get(id).cloned()))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .map(|coll| coll.points.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Point>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for point in coll.points.values() {
            if !filter.is_empty() {
                let payload_json = serde_json::to_value(&point.payload)?;
                if !filter.matches(&payload_json) {
                    continue;
                }
            }
            out.push(point.clone());
        }
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BranchContext, FoldRecord, Payload};

    fn fold_point(id: &str, summary: &str, vector: Vec<f32>) -> Point {
        Point {
            id: id.to_string(),
            vector,
            payload: Payload::Fold(FoldRecord {
                branch_id: id.to_string(),
                session_id: "s1".into(),
                description: "d".into(),
                summary: summary.to_string(),
                branch_context: BranchContext {
                    branch_id: id.to_string(),
                    parent_branch_id: None,
                    depth: 1,
                    tokens_folded: 10,
                    operations_count: 1,
                    secrets_scrubbed: 0,
                },
                created_at: 0,
            }),
        }
    }

    #[tokio::test]
    async fn test_upsert_search_roundtrip() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", fold_point("a", "x", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert("c", fold_point("b", "y", vec![0.0, 1.0]))
            .await
            .unwrap();
        let hits = store
            .search("c", &[1.0, 0.1], 10, &Filter::none())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let p = fold_point("a", "x", vec![1.0, 0.0]);
        store.upsert("c", p.clone()).await.unwrap();
        store.upsert("c", p).await.unwrap();
        let all = store.list("c", &Filter::none(), 100, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let err = store
            .upsert("c", fold_point("a", "x", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(store.ensure_collection("c", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_search_missing_collection_is_empty() {
        let store = MemoryVectorStore::new();
        let hits = store
            .search("nope", &[1.0], 5, &Filter::none())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_filtered_search() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", fold_point("a", "x", vec![1.0, 0.0]))
            .await
            .unwrap();
        let hits = store
            .search(
                "c",
                &[1.0, 0.0],
                10,
                &Filter::none().eq("session_id", "s1"),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let none = store
            .search(
                "c",
                &[1.0, 0.0],
                10,
                &Filter::none().eq("session_id", "other"),
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_get() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 1).await.unwrap();
        store
            .upsert("c", fold_point("a", "x", vec![1.0]))
            .await
            .unwrap();
        assert!(store.get("c", "a").await.unwrap().is_some());
        assert!(store.delete("c", "a").await.unwrap());
        assert!(!store.delete("c", "a").await.unwrap());
        assert!(store.get("c", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_pagination_stable_order() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 1).await.unwrap();
        for id in ["c3", "a1", "b2"] {
            store
                .upsert("c", fold_point(id, "x", vec![1.0]))
                .await
                .unwrap();
        }
        let page1 = store.list("c", &Filter::none(), 2, 0).await.unwrap();
        let page2 = store.list("c", &Filter::none(), 2, 2).await.unwrap();
        let ids: Vec<_> = page1.iter().chain(page2.iter()).map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["a1", "b2", "c3"]);
    }
}
