use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Embeddings over an OpenAI-compatible HTTP API (`POST /v1/embeddings`).
/// Works against OpenAI itself and the many servers that mirror the shape.
#[derive(Clone)]
pub struct OpenAiEmbeddings {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dim: usize,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingObject>,
}

#[derive(Deserialize)]
struct EmbeddingObject {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddings {
    pub fn new(base_url: String, model: String, api_key: Option<String>, dim: usize) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            dim,
        }
    }
}

#[async_trait]
impl super::EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let req = EmbeddingsRequest {
            model: &self.model,
            input: text,
        };
        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::internal(format!("openai error ({status}): {body}")));
        }
        let payload: EmbeddingsResponse = resp.json().await?;
        let first = payload
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("openai returned no embedding"))?;
        if first.embedding.len() != self.dim {
            return Err(Error::internal(format!(
                "embedding dimension mismatch: provider returned {}, collections are stamped {}",
                first.embedding.len(),
                self.dim
            )));
        }
        Ok(first.embedding)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
