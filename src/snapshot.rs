//! Whole-file snapshot store.
//!
//! The full vector table lives in memory and is written out as one binary
//! snapshot on `persist`. Layout (little-endian):
//! `[count: u64]` then per entry `[id_len: u16][id][vector: f32 * dimension]`.

use crate::codec::put_vector;
use crate::distance::{l2_squared, TopK};
use crate::error::{Result, VectorError};
use crate::store::{IndexStats, Match, VectorStore};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, instrument, warn};

/// Tables smaller than this are scanned on the calling thread.
#[cfg(feature = "parallel")]
const PARALLEL_MIN_ITEMS: usize = 2048;

#[derive(Debug, Default)]
struct Table {
    vectors: BTreeMap<String, Vec<f32>>,
    dirty: bool,
}

pub struct SnapshotStore {
    path: PathBuf,
    dimension: usize,
    table: Arc<Mutex<Table>>,
}

impl SnapshotStore {
    /// Load the snapshot at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self> {
        let path = path.into();
        if dimension == 0 {
            return Err(VectorError::Config("dimension must be positive".into()));
        }

        let vectors = match fs::read(&path) {
            Ok(data) => decode_snapshot(&path, &data, dimension)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(VectorError::io(&path, "read snapshot", e)),
        };

        info!(path = %path.display(), items = vectors.len(), "loaded snapshot");
        Ok(Self {
            path,
            dimension,
            table: Arc::new(Mutex::new(Table {
                vectors,
                dirty: false,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.vectors.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.vectors.is_empty()
    }

    pub async fn is_dirty(&self) -> bool {
        self.table.lock().await.dirty
    }

    /// Write the table out if it changed since the last successful persist.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn persist(&self) -> Result<()> {
        let mut table = Arc::clone(&self.table).lock_owned().await;
        if !table.dirty {
            return Ok(());
        }

        let path = self.path.clone();
        let dimension = self.dimension;
        let (items, bytes) = task::spawn_blocking(move || {
            let body = encode_snapshot(&table.vectors, dimension)?;
            write_atomic(&path, &body)?;
            table.dirty = false;
            Ok::<_, VectorError>((table.vectors.len(), body.len()))
        })
        .await
        .map_err(|e| VectorError::Task(e.to_string()))??;

        debug!(items, bytes, "persisted snapshot");
        Ok(())
    }

    fn check_id(id: &str) -> Result<()> {
        if id.len() > u16::MAX as usize {
            return Err(VectorError::InvalidId(format!(
                "identifier is {} bytes, longer than the format allows",
                id.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SnapshotStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, id: &str, vector: &[f32]) -> Result<()> {
        VectorError::check_dimension(self.dimension, vector.len())?;
        Self::check_id(id)?;
        let mut table = self.table.lock().await;
        table.vectors.insert(id.to_string(), vector.to_vec());
        table.dirty = true;
        Ok(())
    }

    /// Items are applied in order; a bad item stops the batch but leaves the
    /// earlier ones in place. Only `persist` is all-or-nothing.
    async fn bulk_upsert(&self, items: &[(String, Vec<f32>)]) -> Result<usize> {
        let mut table = self.table.lock().await;
        for (applied, (id, vector)) in items.iter().enumerate() {
            if let Err(e) = VectorError::check_dimension(self.dimension, vector.len())
                .and_then(|_| Self::check_id(id))
            {
                if applied > 0 {
                    table.dirty = true;
                }
                return Err(e);
            }
            table.vectors.insert(id.clone(), vector.clone());
        }
        if !items.is_empty() {
            table.dirty = true;
        }
        Ok(items.len())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut table = self.table.lock().await;
        let removed = table.vectors.remove(id).is_some();
        if removed {
            table.dirty = true;
        }
        Ok(removed)
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>> {
        VectorError::check_dimension(self.dimension, query.len())?;
        let table = Arc::clone(&self.table).lock_owned().await;
        if table.vectors.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query = query.to_vec();
        task::spawn_blocking(move || {
            let mut top = TopK::new(top_k);
            for (id, squared) in squared_distances(&table.vectors, &query) {
                top.offer(squared, || id.clone());
            }
            top.into_sorted()
                .into_iter()
                .map(|m| Match {
                    distance: m.distance.sqrt(),
                    ..m
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| VectorError::Task(e.to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.table.lock().await.vectors.get(id).cloned())
    }

    async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            shard_count: 1,
            live_items: self.table.lock().await.vectors.len() as u64,
        })
    }

    async fn flush(&self) -> Result<()> {
        self.persist().await
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        let dirty = self.table.try_lock().map(|t| t.dirty).unwrap_or(false);
        if dirty {
            warn!(path = %self.path.display(), "snapshot dropped with unpersisted changes");
        }
    }
}

/// Squared distance from `query` to every stored vector, in id order.
fn squared_distances<'a>(
    vectors: &'a BTreeMap<String, Vec<f32>>,
    query: &[f32],
) -> Vec<(&'a String, f32)> {
    #[cfg(feature = "parallel")]
    if vectors.len() >= PARALLEL_MIN_ITEMS {
        use rayon::prelude::*;
        return vectors
            .par_iter()
            .map(|(id, v)| (id, l2_squared(query, v)))
            .collect();
    }

    vectors
        .iter()
        .map(|(id, v)| (id, l2_squared(query, v)))
        .collect()
}

fn encode_snapshot(vectors: &BTreeMap<String, Vec<f32>>, dimension: usize) -> Result<BytesMut> {
    let entry_len = |id: &String| 2 + id.len() + dimension * 4;
    let mut buf = BytesMut::with_capacity(8 + vectors.keys().map(entry_len).sum::<usize>());

    buf.put_u64_le(vectors.len() as u64);
    for (id, vector) in vectors {
        let id_len = u16::try_from(id.len())
            .map_err(|_| VectorError::InvalidId(format!("identifier is {} bytes", id.len())))?;
        buf.put_u16_le(id_len);
        buf.put_slice(id.as_bytes());
        put_vector(&mut buf, vector);
    }
    Ok(buf)
}

fn decode_snapshot(
    path: &Path,
    mut data: &[u8],
    dimension: usize,
) -> Result<BTreeMap<String, Vec<f32>>> {
    let corrupt = |reason: String| VectorError::corrupt_file(path, reason);

    if data.remaining() < 8 {
        return Err(corrupt(format!(
            "need 8 bytes for entry count, {} available",
            data.remaining()
        )));
    }
    let count = data.get_u64_le();

    // Every entry needs at least its length prefix and vector bytes.
    let min_entry = 2 + dimension * 4;
    if count > (data.remaining() / min_entry) as u64 {
        return Err(corrupt(format!(
            "entry count {count} exceeds what {} remaining bytes can hold",
            data.remaining()
        )));
    }

    let mut vectors = BTreeMap::new();
    for entry in 0..count {
        if data.remaining() < 2 {
            return Err(corrupt(format!("entry {entry}: truncated id length")));
        }
        let id_len = data.get_u16_le() as usize;

        if data.remaining() < id_len {
            return Err(corrupt(format!(
                "entry {entry}: id length {id_len} exceeds remaining {} bytes",
                data.remaining()
            )));
        }
        let id = std::str::from_utf8(&data[..id_len])
            .map_err(|_| corrupt(format!("entry {entry}: id is not valid UTF-8")))?
            .to_string();
        data.advance(id_len);

        let vector_len = dimension * 4;
        if data.remaining() < vector_len {
            return Err(corrupt(format!(
                "entry {entry}: vector needs {vector_len} bytes, {} remaining",
                data.remaining()
            )));
        }
        let vector = crate::codec::decode_vector(&data[..vector_len]);
        data.advance(vector_len);

        if vectors.insert(id, vector).is_some() {
            return Err(corrupt(format!("entry {entry}: duplicate identifier")));
        }
    }

    if data.has_remaining() {
        return Err(corrupt(format!(
            "{} trailing bytes after {count} entries",
            data.remaining()
        )));
    }
    Ok(vectors)
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| VectorError::io(dir, "create snapshot directory", e))?;

    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| VectorError::io(path, "create snapshot", e))?;
    tmp.write_all(body)
        .map_err(|e| VectorError::io(path, "write snapshot", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| VectorError::io(path, "flush snapshot", e))?;
    tmp.persist(path)
        .map_err(|e| VectorError::io(path, "rename snapshot", e.error))?;
    Ok(())
}
