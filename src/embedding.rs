//! Embedding collaborators used to rank search results
//!
//! Ranking is the only consumer; sync, locking and conflict handling never
//! depend on embeddings.

use async_trait::async_trait;

use crate::error::Result;

/// Turns text into a vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;
}

/// Cosine similarity, 0.0 for mismatched or zero vectors
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Deterministic feature-hashing embedder. Needs no model download, so it
/// is the default for the server and for tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);

        for token in tokens {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            let index = (bucket % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(feature = "fastembed")]
pub use local::FastEmbedder;

#[cfg(feature = "fastembed")]
mod local {
    use std::sync::Arc;

    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tokio::sync::Mutex;

    use super::Embedder;
    use crate::config::Config;
    use crate::error::{Error, Result};

    /// Local sentence embeddings through fastembed
    pub struct FastEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
        dimensions: usize,
    }

    impl FastEmbedder {
        pub fn new(config: &Config) -> Result<Self> {
            // all-MiniLM-L6-v2, 384 dimensions; downloads to ~/.cache/fastembed on first use
            let model = TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(true),
            )
            .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                dimensions: config.embedding_dimensions,
            })
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut guard = self.model.lock().await;
            let embeddings = guard
                .embed(vec![text.to_string()], None)
                .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;

            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| Error::embedding("No embedding returned"))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut guard = self.model.lock().await;
            guard
                .embed(texts.to_vec(), None)
                .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}
