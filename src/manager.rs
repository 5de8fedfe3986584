//! Text-level front door: embed, then hand vectors to a store.

use crate::error::{Result, VectorError};
use crate::store::{IndexStats, Match, VectorStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Source of embeddings, e.g. an on-device sentence model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector returned by `embed`.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

pub struct IndexManager<E> {
    embedder: E,
    store: Arc<dyn VectorStore>,
}

impl<E: Embedder> IndexManager<E> {
    pub fn new(embedder: E, store: Arc<dyn VectorStore>) -> Result<Self> {
        VectorError::check_dimension(store.dimension(), embedder.dimension())?;
        Ok(Self { embedder, store })
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(text)
            .await
            .map_err(|e| VectorError::Embedding(format!("{e:#}")))
    }

    #[instrument(skip(self, text))]
    pub async fn index_text(&self, id: &str, text: &str) -> Result<()> {
        let vector = self.embed(text).await?;
        self.store.upsert(id, &vector).await
    }

    /// Embed every item first, then upsert the batch.
    pub async fn index_batch(&self, items: &[(String, String)]) -> Result<usize> {
        let mut vectors = Vec::with_capacity(items.len());
        for (id, text) in items {
            vectors.push((id.clone(), self.embed(text).await?));
        }
        debug!(items = vectors.len(), "embedded batch");
        self.store.bulk_upsert(&vectors).await
    }

    #[instrument(skip(self, text))]
    pub async fn search_text(&self, text: &str, top_k: usize) -> Result<Vec<Match>> {
        let query = self.embed(text).await?;
        self.store.search(&query, top_k).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.store.remove(id).await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.store.stats().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}
