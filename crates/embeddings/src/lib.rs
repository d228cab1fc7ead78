//! Embedding-Modul für postloop.
//!
//! Stellt den Trait für Text-Embeddings bereit, aus denen der Kontextvektor
//! des Banditen gebaut wird, sowie einen Client für Ollama.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Trait für Embedding-Anbieter.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Erstellt Embeddings für mehrere Texte, in Eingabereihenfolge.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Bequemlichkeit für genau einen Text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            bail!("cannot embed empty text");
        }
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .context("embedding provider returned no vector")
    }
}

/// Client-Implementierung für Ollama-Embeddings.
///
/// Spricht `POST {base_url}/api/embed` eines Ollama-Servers an.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    base_url: Url,
    model: String,
    http: reqwest::Client,
}

/// Request-Struktur für Ollama-Embedding-API.
#[derive(Debug, Serialize)]
pub struct OllamaEmbedRequest<'a> {
    /// Name des zu verwendenden Modells.
    pub model: &'a str,
    /// Liste der Texte, für die Embeddings erstellt werden sollen.
    pub input: &'a [String],
}

/// Response-Struktur von Ollama-Embedding-API.
#[derive(Debug, Deserialize)]
pub struct OllamaEmbedResponse {
    /// Liste der Embedding-Vektoren.
    pub embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Erstellt einen neuen OllamaEmbedder.
    ///
    /// # Argumente
    ///
    /// * `base_url` - Basis-URL des Ollama-Servers
    /// * `model` - Name des zu verwendenden Embedding-Modells
    /// * `timeout` - Obergrenze pro Anfrage
    pub fn new(base_url: Url, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build embedding http client")?;
        Ok(Self {
            base_url,
            model: model.into(),
            http,
        })
    }

    /// Gibt die Basis-URL des Embedders zurück.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Gibt den Modellnamen zurück.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> Result<Url> {
        self.base_url
            .join("api/embed")
            .with_context(|| format!("invalid embedding base url {}", self.base_url))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(self.endpoint()?)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .context("embedding request failed")?
            .error_for_status()
            .context("embedding provider returned an error status")?
            .json::<OllamaEmbedResponse>()
            .await
            .context("embedding response was not valid JSON")?;

        if response.embeddings.len() != texts.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                response.embeddings.len(),
                texts.len()
            );
        }
        Ok(response.embeddings)
    }
}
