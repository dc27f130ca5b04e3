mod ollama;
mod openai;

pub use ollama::OllamaEmbeddings;
pub use openai::OpenAiEmbeddings;

use crate::config::EmbeddingsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Text-to-vector provider. The dimension is provider-fixed and stamped
/// on every collection; failure is always propagated — a zero-vector
/// fallback would poison similarity search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dim(&self) -> usize;
}

struct CachedVec {
    at: Instant,
    vec: Arc<Vec<f32>>,
}

/// Process-local gateway in front of any provider: bounded LRU keyed by
/// SHA-256 of the input, with a TTL. Never persisted.
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<[u8; 32], CachedVec>>,
    ttl: Duration,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn from_config(cfg: &EmbeddingsConfig) -> Result<Self> {
        let provider: Arc<dyn EmbeddingProvider> = match cfg.provider.as_str() {
            "ollama" => Arc::new(OllamaEmbeddings::new(
                cfg.url.clone(),
                cfg.model.clone(),
                cfg.dim,
            )),
            "openai" => Arc::new(OpenAiEmbeddings::new(
                cfg.url.clone(),
                cfg.model.clone(),
                cfg.api_key.clone(),
                cfg.dim,
            )),
            other => {
                return Err(Error::invalid_argument(format!(
                    "unknown embeddings provider {other:?} (expected ollama or openai)"
                )))
            }
        };
        Ok(Self::new(
            provider,
            cfg.cache_entries,
            Duration::from_secs(cfg.cache_ttl_secs),
        ))
    }

    pub fn dim(&self) -> usize {
        self.provider.dim()
    }

    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let key: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        {
            let mut cache = self.cache.lock().expect("embedding cache poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.at.elapsed() < self.ttl {
                    return Ok(entry.vec.clone());
                }
                cache.pop(&key);
            }
        }
        let vec = Arc::new(self.provider.embed(text).await?);
        let mut cache = self.cache.lock().expect("embedding cache poisoned");
        cache.put(
            key,
            CachedVec {
                at: Instant::now(),
                vec: vec.clone(),
            },
        );
        Ok(vec)
    }
}

/// Cosine similarity in [-1, 1]; 0 for degenerate inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Deterministic offline provider for tests: the vector is expanded from
/// the SHA-256 stream of the text and normalized.
#[cfg(test)]
pub struct MockEmbeddings {
    pub dim: usize,
}

#[cfg(test)]
#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.dim);
        let mut counter = 0u32;
        while out.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            for byte in hasher.finalize() {
                if out.len() == self.dim {
                    break;
                }
                out.push((byte as f32 - 127.5) / 127.5);
            }
            counter += 1;
        }
        let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut out {
                *v /= norm;
            }
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
