//! Retrieval contract shared by the durable index and the snapshot store.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A search hit: smaller distance means more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub shard_count: usize,
    pub live_items: u64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dimension(&self) -> usize;

    /// Insert or replace the vector stored under `id`.
    async fn upsert(&self, id: &str, vector: &[f32]) -> Result<()>;

    /// Upsert in order, stopping at the first failure. Items before the
    /// failing one stay applied.
    async fn bulk_upsert(&self, items: &[(String, Vec<f32>)]) -> Result<usize> {
        for (id, vector) in items {
            self.upsert(id, vector).await?;
        }
        Ok(items.len())
    }

    /// Remove `id`. Unknown ids are a no-op; returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Up to `top_k` matches, ascending by L2 distance.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>>;

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Make pending state durable.
    async fn flush(&self) -> Result<()>;
}
