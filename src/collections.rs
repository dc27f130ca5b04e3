use crate::error::Result;
use crate::fingerprint::{self, ProjectLeaf, SharedKind};
use crate::vectorstore::{Filter, Point, ScoredPoint, VectorStore};
use std::sync::Arc;

/// Resolved tenancy of a request: every read and write goes through one
/// of these. No record is ever addressable across an owner boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub owner_id: String,
    pub project_hash: String,
    /// Cleaned absolute project path (allowlist lookup, payload stamping).
    pub project_path: String,
}

impl Tenant {
    pub fn resolve(principal: &str, project_path: &str) -> Result<Self> {
        let cleaned = fingerprint::clean_abs_path(project_path)?;
        Ok(Self {
            owner_id: fingerprint::owner_id(principal),
            project_hash: fingerprint::project_hash(project_path)?,
            project_path: cleaned.to_string_lossy().to_string(),
        })
    }
}

/// One layer of a layered search: a collection, the filter to apply
/// there, and the label results from this layer carry (e.g. "project").
#[derive(Debug, Clone)]
pub struct SearchLayer {
    pub collection: String,
    pub filter: Filter,
    pub origin: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayeredHit {
    pub origin: &'static str,
    pub hit: ScoredPoint,
}

/// Routes reads and writes to the correct tenant collection and merges
/// layered reads with stable id-deduplication.
pub struct CollectionManager {
    store: Arc<dyn VectorStore>,
    dim: usize,
}

impl CollectionManager {
    pub fn new(store: Arc<dyn VectorStore>, dim: usize) -> Self {
        Self { store, dim }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------

    pub fn main_collection(&self, t: &Tenant) -> String {
        fingerprint::project_collection(&t.owner_id, &t.project_hash, ProjectLeaf::Main)
    }

    pub fn branch_collection(&self, t: &Tenant, branch_token: &str) -> String {
        fingerprint::project_collection(
            &t.owner_id,
            &t.project_hash,
            ProjectLeaf::Branch(branch_token),
        )
    }

    pub fn archive_collection(&self, t: &Tenant) -> String {
        fingerprint::project_collection(&t.owner_id, &t.project_hash, ProjectLeaf::Archive)
    }

    pub fn shared_collection(&self, t: &Tenant, kind: SharedKind) -> String {
        fingerprint::shared_collection(&t.owner_id, kind)
    }

    /// Candidate list for a project-scoped read: the branch delta first
    /// (when on a branch), then main. First occurrence wins on merge, so
    /// branch-native records never rank below their main counterparts.
    pub fn project_read_candidates(&self, t: &Tenant, branch_token: Option<&str>) -> Vec<String> {
        match branch_token {
            Some(token) => vec![
                self.branch_collection(t, token),
                self.main_collection(t),
            ],
            None => vec![self.main_collection(t)],
        }
    }

    // ------------------------------------------------------------------
    // Storage operations
    // ------------------------------------------------------------------

    /// Create-if-missing with the gateway's dimension stamped.
    pub async fn ensure(&self, collection: &str) -> Result<()> {
        self.store.ensure_collection(collection, self.dim).await
    }

    pub async fn upsert(&self, collection: &str, point: Point) -> Result<()> {
        self.ensure(collection).await?;
        self.store.upsert(collection, point).await
    }

    /// Search each layer in order and merge. Deduplication is stable over
    /// id: the first (highest-ranked) layer's record wins and its score is
    /// preserved. The merged set is then ordered by score.
    pub async fn layered_search(
        &self,
        layers: &[SearchLayer],
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<LayeredHit>> {
        let mut merged: Vec<LayeredHit> = Vec::new();
        for layer in layers {
            let hits = self
                .store
                .search(&layer.collection, vector, top_k, &layer.filter)
                .await?;
            for hit in hits {
                if merged.iter().any(|existing| existing.hit.id == hit.id) {
                    continue;
                }
                merged.push(LayeredHit {
                    origin: layer.origin,
                    hit,
                });
            }
        }
        merged.sort_by(|a, b| {
            b.hit
                .score
                .partial_cmp(&a.hit.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(top_k);
        Ok(merged)
    }

    /// First hit for `id` across candidates, in candidate order.
    pub async fn get_first(&self, candidates: &[String], id: &str) -> Result<Option<Point>> {
        for collection in candidates {
            if let Some(point) = self.store.get(collection, id).await? {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BranchContext, FoldRecord, Payload};
    use crate::vectorstore::MemoryVectorStore;

    fn tenant() -> Tenant {
        Tenant::resolve("alice", "/w/a").unwrap()
    }

    fn point(id: &str, vector: Vec<f32>) -> Point {
        Point {
            id: id.to_string(),
            vector,
            payload: Payload::Fold(FoldRecord {
                branch_id: id.to_string(),
                session_id: "s".into(),
                description: String::new(),
                summary: "s".into(),
                branch_context: BranchContext {
                    branch_id: id.to_string(),
                    parent_branch_id: None,
                    depth: 1,
                    tokens_folded: 0,
                    operations_count: 0,
                    secrets_scrubbed: 0,
                },
                created_at: 0,
            }),
        }
    }

    fn manager() -> CollectionManager {
        CollectionManager::new(Arc::new(MemoryVectorStore::new()), 2)
    }

    #[test]
    fn test_tenant_resolution_is_deterministic() {
        let a = tenant();
        let b = tenant();
        assert_eq!(a, b);
        assert_ne!(a.project_hash, Tenant::resolve("alice", "/w/b").unwrap().project_hash);
        assert!(Tenant::resolve("alice", "relative").is_err());
    }

    #[test]
    fn test_candidate_lists() {
        let cm = manager();
        let t = tenant();
        assert_eq!(
            cm.project_read_candidates(&t, None),
            vec![cm.main_collection(&t)]
        );
        assert_eq!(
            cm.project_read_candidates(&t, Some("fix-login")),
            vec![
                cm.branch_collection(&t, "fix-login"),
                cm.main_collection(&t)
            ]
        );
    }

    #[tokio::test]
    async fn test_layered_search_dedup_first_layer_wins() {
        let cm = manager();
        let t = tenant();
        let branch = cm.branch_collection(&t, "b");
        let main = cm.main_collection(&t);

        // Same id in both layers with identical vectors: the branch copy
        // must win and keep its score.
        cm.upsert(&branch, point("shared-id", vec![1.0, 0.0]))
            .await
            .unwrap();
        cm.upsert(&main, point("shared-id", vec![1.0, 0.0]))
            .await
            .unwrap();
        cm.upsert(&main, point("main-only", vec![0.9, 0.1]))
            .await
            .unwrap();

        let layers = vec![
            SearchLayer {
                collection: branch,
                filter: Filter::none(),
                origin: "branch",
            },
            SearchLayer {
                collection: main,
                filter: Filter::none(),
                origin: "main",
            },
        ];
        let hits = cm.layered_search(&layers, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].hit.id, "shared-id");
        assert_eq!(hits[0].origin, "branch");
        assert_eq!(hits[1].hit.id, "main-only");
    }

    #[tokio::test]
    async fn test_layered_search_is_subset_of_layer_results() {
        let cm = manager();
        let t = tenant();
        let main = cm.main_collection(&t);
        cm.upsert(&main, point("a", vec![1.0, 0.0])).await.unwrap();
        cm.upsert(&main, point("b", vec![0.0, 1.0])).await.unwrap();

        let layers = vec![SearchLayer {
            collection: main.clone(),
            filter: Filter::none(),
            origin: "main",
        }];
        let hits = cm.layered_search(&layers, &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].hit.id, "a");
    }

    #[tokio::test]
    async fn test_layered_search_missing_branch_collection() {
        let cm = manager();
        let t = tenant();
        let main = cm.main_collection(&t);
        cm.upsert(&main, point("a", vec![1.0, 0.0])).await.unwrap();

        // Branch collection never written — search must still succeed.
        let layers = vec![
            SearchLayer {
                collection: cm.branch_collection(&t, "ghost"),
                filter: Filter::none(),
                origin: "branch",
            },
            SearchLayer {
                collection: main,
                filter: Filter::none(),
                origin: "main",
            },
        ];
        let hits = cm.layered_search(&layers, &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].origin, "main");
    }

    #[tokio::test]
    async fn test_get_first_prefers_earlier_candidate() {
        let cm = manager();
        let t = tenant();
        let branch = cm.branch_collection(&t, "b");
        let main = cm.main_collection(&t);
        cm.upsert(&main, point("x", vec![0.0, 1.0])).await.unwrap();
        assert!(cm
            .get_first(&[branch.clone(), main.clone()], "x")
            .await
            .unwrap()
            .is_some());
        assert!(cm
            .get_first(&[branch, main], "missing")
            .await
            .unwrap()
            .is_none());
    }
}
