//! Durable sharded index.
//!
//! Each identifier lives in exactly one shard, chosen by a 64-bit FNV-1a hash
//! of its bytes. Shards are independent single-writer domains; global search
//! and stats fan out to all of them and join before merging.

use crate::distance;
use crate::error::{Result, VectorError};
use crate::shard::Shard;
use crate::store::{IndexStats, Match, VectorStore};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, instrument};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Unsalted, so routing is stable across restarts.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn shard_for(id: &str, shard_count: usize) -> usize {
    (fnv1a64(id.as_bytes()) % shard_count as u64) as usize
}

type Slot = Arc<Mutex<Option<Shard>>>;

pub struct DurableIndex {
    dir: PathBuf,
    dimension: usize,
    slots: Vec<Slot>,
}

impl DurableIndex {
    /// Open (or create) the collection directory `root/collection`.
    /// Shards are opened lazily on first use.
    pub fn open(
        root: impl AsRef<Path>,
        collection: &str,
        dimension: usize,
        shard_count: usize,
    ) -> Result<Self> {
        if dimension == 0 || dimension > u16::MAX as usize {
            return Err(VectorError::Config(format!(
                "dimension must be between 1 and {}, got {dimension}",
                u16::MAX
            )));
        }
        if shard_count == 0 {
            return Err(VectorError::Config("shard count must be positive".into()));
        }
        validate_collection(collection)?;

        let dir = root.as_ref().join(collection);
        fs::create_dir_all(&dir).map_err(|e| VectorError::io(&dir, "create collection", e))?;

        info!(collection, shards = shard_count, dimension, "opened durable index");
        Ok(Self {
            dir,
            dimension,
            slots: (0..shard_count).map(|_| Arc::new(Mutex::new(None))).collect(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_count(&self) -> usize {
        self.slots.len()
    }

    /// Run `f` against shard `index` on the blocking pool, opening it first if needed.
    async fn with_shard<T, F>(&self, index: usize, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Shard) -> Result<T> + Send + 'static,
    {
        let slot = Arc::clone(&self.slots[index]);
        let dir = self.dir.clone();
        let dimension = self.dimension;

        task::spawn_blocking(move || {
            let mut guard = slot.blocking_lock();
            let shard = match guard.take() {
                Some(shard) => shard,
                None => {
                    debug!(shard = index, "opening shard on first touch");
                    Shard::open(&dir, index, dimension)?
                }
            };
            f(guard.insert(shard))
        })
        .await
        .map_err(|e| VectorError::Task(e.to_string()))?
    }

    /// Run `f` on every shard concurrently; the first failure aborts the merge.
    async fn fan_out<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut Shard) -> Result<T> + Send + Sync + Clone + 'static,
    {
        let tasks = (0..self.slots.len()).map(|index| self.with_shard(index, f.clone()));
        try_join_all(tasks).await
    }

    pub async fn compact(&self) -> Result<usize> {
        let compacted = self.fan_out(|shard| shard.compact()).await?;
        Ok(compacted.into_iter().filter(|&c| c).count())
    }
}

#[async_trait]
impl VectorStore for DurableIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[instrument(skip(self, vector), fields(shard = tracing::field::Empty))]
    async fn upsert(&self, id: &str, vector: &[f32]) -> Result<()> {
        VectorError::check_dimension(self.dimension, vector.len())?;
        let index = shard_for(id, self.slots.len());
        tracing::Span::current().record("shard", index);

        let id = id.to_string();
        let vector = vector.to_vec();
        self.with_shard(index, move |shard| shard.upsert(&id, &vector))
            .await
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: &str) -> Result<bool> {
        let index = shard_for(id, self.slots.len());
        let id = id.to_string();
        self.with_shard(index, move |shard| shard.remove(&id)).await
    }

    #[instrument(skip(self, query))]
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>> {
        VectorError::check_dimension(self.dimension, query.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query: Arc<[f32]> = Arc::from(query);
        let partials = self
            .fan_out(move |shard| shard.search(&query, top_k))
            .await?;
        Ok(distance::merge(partials, top_k))
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let index = shard_for(id, self.slots.len());
        let id = id.to_string();
        self.with_shard(index, move |shard| shard.get(&id)).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        let counts = self.fan_out(|shard| Ok(shard.live_count())).await?;
        Ok(IndexStats {
            shard_count: self.slots.len(),
            live_items: counts.into_iter().sum(),
        })
    }

    /// Every write is already synced before it returns.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn validate_collection(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if !valid {
        return Err(VectorError::Config(format!(
            "invalid collection name {name:?}"
        )));
    }
    Ok(())
}
