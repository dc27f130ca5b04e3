use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Embeddings over the Ollama HTTP API (`POST /api/embeddings`).
#[derive(Clone)]
pub struct OllamaEmbeddings {
    http: Client,
    base_url: String,
    model: String,
    dim: usize,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String, dim: usize) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dim,
        }
    }
}

#[async_trait]
impl super::EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let req = EmbeddingsRequest {
            model: &self.model,
            prompt: text,
        };
        let resp = self.http.post(url).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!("ollama error ({status}): {body}")));
        }
        let payload: EmbeddingsResponse = resp.json().await?;
        if payload.embedding.len() != self.dim {
            return Err(Error::internal(format!(
                "embedding dimension mismatch: provider returned {}, collections are stamped {}",
                payload.embedding.len(),
                self.dim
            )));
        }
        Ok(payload.embedding)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
