//! One shard of the durable index: an append-only record file plus its
//! offset sidecar.
//!
//! Mutations never punch holes: a superseded or removed record is tombstoned
//! in place and new data is appended. Every mutation follows the same order:
//! 1. write record bytes (tombstone + append),
//! 2. sync the shard file,
//! 3. persist the sidecar,
//! 4. rewrite the header live count.
//!
//! A crash between steps leaves the sidecar stale, pointing at the previous
//! record, never at bytes that were not synced. The record file is the
//! source of truth: open rebuilds a sidecar that lags it, and search scans
//! every live record regardless of the sidecar.

pub mod meta;

#[cfg(test)]
mod tests;

use crate::codec::{
    self, CodecError, RecordHeader, RecordIter, ShardHeader, HEADER_LEN, LIVE_COUNT_OFFSET,
    RECORD_HEADER_LEN,
};
use crate::distance::{l2_squared_le_bytes, TopK};
use crate::error::{Result, VectorError};
use crate::store::Match;
use memmap2::Mmap;
use meta::ShardMeta;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub fn shard_file_name(index: usize) -> String {
    format!("shard_{index}.shard")
}

pub fn meta_file_name(index: usize) -> String {
    format!("shard_{index}.meta")
}

fn pending_meta_name(index: usize) -> String {
    format!("shard_{index}.meta.pending")
}

#[derive(Debug)]
pub struct Shard {
    index: usize,
    path: PathBuf,
    pending_meta_path: PathBuf,
    meta: ShardMeta,
    dimension: usize,
}

impl Shard {
    /// Open shard `index` inside `dir`, creating it if absent.
    pub fn open(dir: &Path, index: usize, dimension: usize) -> Result<Self> {
        let path = dir.join(shard_file_name(index));
        let meta_path = dir.join(meta_file_name(index));
        let pending_meta_path = dir.join(pending_meta_name(index));

        if !path.exists() {
            return Self::create(index, path, meta_path, pending_meta_path, dimension);
        }

        let header = read_header(&path)?;
        if header.dimension as usize != dimension {
            return Err(VectorError::corrupt_shard(
                &path,
                format!(
                    "header dimension {} does not match configured dimension {}",
                    header.dimension, dimension
                ),
            ));
        }

        recover_pending_meta(&path, &meta_path, &pending_meta_path)?;

        let meta = match ShardMeta::load(&meta_path)? {
            Some(meta) => meta,
            None => {
                warn!(shard = index, "metadata sidecar missing, rebuilding from records");
                let meta = ShardMeta::empty(&meta_path);
                meta.persist()?;
                meta
            }
        };

        let mut shard = Self {
            index,
            path,
            pending_meta_path,
            meta,
            dimension,
        };
        shard.reconcile(header.live_count)?;

        debug!(shard = index, live = shard.meta.len(), "opened shard");
        Ok(shard)
    }

    fn create(
        index: usize,
        path: PathBuf,
        meta_path: PathBuf,
        pending_meta_path: PathBuf,
        dimension: usize,
    ) -> Result<Self> {
        let header = ShardHeader::new(dimension).map_err(|e| corrupt(&path, e))?;

        // Header lands under a temporary name so a crash never leaves an
        // empty shard file behind.
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp =
            NamedTempFile::new_in(dir).map_err(|e| VectorError::io(&path, "create shard", e))?;
        tmp.write_all(&header.encode())
            .map_err(|e| VectorError::io(&path, "write header", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| VectorError::io(&path, "flush header", e))?;
        tmp.persist_noclobber(&path)
            .map_err(|e| VectorError::io(&path, "create shard", e.error))?;

        let meta = ShardMeta::empty(meta_path);
        meta.persist()?;

        info!(shard = index, path = %path.display(), "created shard");
        Ok(Self {
            index,
            path,
            pending_meta_path,
            meta,
            dimension,
        })
    }

    /// Point the sidecar at the newest live record of every id and rewrite
    /// the header count if either lags the record file.
    fn reconcile(&mut self, header_count: u64) -> Result<()> {
        let latest = {
            let map = self.map()?;
            latest_live_offsets(&map, self.dimension).map_err(|e| corrupt(&self.path, e))?
        };

        let stale = latest.len() != self.meta.len()
            || latest.iter().any(|(id, &offset)| self.meta.get(id) != Some(offset));
        if stale {
            warn!(
                shard = self.index,
                metadata = self.meta.len(),
                records = latest.len(),
                "metadata lags shard records, rebuilding"
            );
            let rebuilt = ShardMeta::with_offsets(self.meta.path(), latest);
            rebuilt.persist()?;
            self.meta = rebuilt;
        }

        if header_count != self.live_count() {
            warn!(
                shard = self.index,
                header = header_count,
                live = self.live_count(),
                "rewriting stale live count"
            );
            self.with_writer("rewrite live count", |shard, file| shard.write_live_count(file))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn live_count(&self) -> u64 {
        self.meta.len() as u64
    }

    pub fn upsert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        VectorError::check_dimension(self.dimension, vector.len())?;
        let record = codec::encode_record(id, vector)
            .map_err(|e| VectorError::InvalidId(e.to_string()))?;

        self.with_writer("upsert", |shard, file| {
            if let Some(previous) = shard.meta.get(id) {
                shard.tombstone_at(file, previous)?;
            }

            let offset = file
                .seek(SeekFrom::End(0))
                .map_err(|e| VectorError::io(&shard.path, "seek end", e))?;
            file.write_all(&record)
                .map_err(|e| VectorError::io(&shard.path, "append record", e))?;
            file.sync_data()
                .map_err(|e| VectorError::io(&shard.path, "flush shard", e))?;

            shard.meta.insert(id, offset);
            shard.meta.persist()?;
            shard.write_live_count(file)
        })
    }

    /// Tombstone `id`. Returns `false` if it was not present.
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(offset) = self.meta.get(id) else {
            return Ok(false);
        };

        self.with_writer("remove", |shard, file| {
            shard.tombstone_at(file, offset)?;
            file.sync_data()
                .map_err(|e| VectorError::io(&shard.path, "flush shard", e))?;

            shard.meta.remove(id);
            shard.meta.persist()?;
            shard.write_live_count(file)
        })?;
        Ok(true)
    }

    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Match>> {
        VectorError::check_dimension(self.dimension, query.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let map = self.map()?;
        self.validate_header(&map)?;

        let mut top = TopK::new(top_k);
        for record in RecordIter::new(&map, self.dimension) {
            let record = record.map_err(|e| corrupt(&self.path, e))?;
            if !record.is_live() {
                continue;
            }
            let distance = l2_squared_le_bytes(query, record.vector_bytes).sqrt();
            top.offer(distance, || record.id.to_string());
        }
        Ok(top.into_sorted())
    }

    /// Latest live vector stored under `id`.
    pub fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let Some(offset) = self.meta.get(id) else {
            return Ok(None);
        };

        let map = self.map()?;
        let record =
            codec::decode_record_at(&map, offset, self.dimension).map_err(|e| corrupt(&self.path, e))?;
        if record.id != id {
            return Err(VectorError::corrupt_shard(
                &self.path,
                format!("metadata offset {offset} for {id:?} holds {:?}", record.id),
            ));
        }
        if !record.is_live() {
            warn!(shard = self.index, id, offset, "metadata points at a tombstone");
            return Ok(None);
        }
        Ok(Some(record.vector()))
    }

    /// Rewrite the shard without dead records. Every id keeps its newest
    /// live record, listed in the sidecar or not. Returns `false` if there
    /// was nothing to reclaim.
    pub fn compact(&mut self) -> Result<bool> {
        let (body, offsets, dead) = {
            let map = self.map()?;
            self.validate_header(&map)?;
            let latest =
                latest_live_offsets(&map, self.dimension).map_err(|e| corrupt(&self.path, e))?;

            let mut body = Vec::with_capacity(map.len());
            let mut offsets = HashMap::with_capacity(latest.len());
            let mut dead = 0usize;
            for record in RecordIter::new(&map, self.dimension) {
                let record = record.map_err(|e| corrupt(&self.path, e))?;
                if latest.get(record.id) != Some(&record.offset) {
                    dead += 1;
                    continue;
                }
                offsets.insert(record.id.to_string(), (HEADER_LEN + body.len()) as u64);
                let start = record.offset as usize;
                body.extend_from_slice(&map[start..start + record.encoded_len()]);
            }
            (body, offsets, dead)
        };

        if dead == 0 {
            return Ok(false);
        }

        let compacted = ShardMeta::with_offsets(self.meta.path(), offsets);
        let mut header = ShardHeader::new(self.dimension).map_err(|e| corrupt(&self.path, e))?;
        header.live_count = compacted.len() as u64;

        // Pending sidecar first, so an interrupted swap can be finished on open.
        compacted.persist_to(&self.pending_meta_path)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| VectorError::io(&self.path, "create compacted shard", e))?;
        tmp.write_all(&header.encode())
            .and_then(|_| tmp.write_all(&body))
            .map_err(|e| VectorError::io(&self.path, "write compacted shard", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| VectorError::io(&self.path, "flush compacted shard", e))?;
        tmp.persist(&self.path)
            .map_err(|e| VectorError::io(&self.path, "swap compacted shard", e.error))?;

        fs::rename(&self.pending_meta_path, compacted.path())
            .map_err(|e| VectorError::io(compacted.path(), "swap compacted metadata", e))?;
        self.meta = compacted;

        info!(shard = self.index, reclaimed = dead, live = self.meta.len(), "compacted shard");
        Ok(true)
    }

    /// Open a handle, run `op`, then close the handle explicitly so a failed
    /// close is reported rather than dropped.
    fn with_writer<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Self, &mut File) -> Result<T>,
    ) -> Result<T> {
        self.with_writer_closed_by(op, close, f)
    }

    fn with_writer_closed_by<T>(
        &mut self,
        op: &'static str,
        closer: impl FnOnce(File) -> io::Result<()>,
        f: impl FnOnce(&mut Self, &mut File) -> Result<T>,
    ) -> Result<T> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| VectorError::io(&self.path, "open shard", e))?;

        let outcome = f(self, &mut file);
        let closed = closer(file);

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close)) => Err(VectorError::io(&self.path, "close shard", close)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close)) => Err(VectorError::CloseFailed {
                path: self.path.clone(),
                op,
                source: Box::new(e),
                close,
            }),
        }
    }

    fn tombstone_at(&self, file: &mut File, offset: u64) -> Result<()> {
        let mut raw = [0u8; RECORD_HEADER_LEN];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut raw))
            .map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => VectorError::corrupt_shard(
                    &self.path,
                    format!("metadata offset {offset} is past end of file"),
                ),
                _ => VectorError::io(&self.path, "read record header", e),
            })?;

        let header = RecordHeader::decode(&raw, offset).map_err(|e| corrupt(&self.path, e))?;
        if header.is_tombstoned() {
            debug!(shard = self.index, offset, "record already tombstoned");
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(&header.tombstoned().encode()))
            .map_err(|e| VectorError::io(&self.path, "tombstone record", e))
    }

    fn write_live_count(&self, file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(LIVE_COUNT_OFFSET))
            .and_then(|_| file.write_all(&self.live_count().to_le_bytes()))
            .map_err(|e| VectorError::io(&self.path, "update live count", e))
    }

    fn map(&self) -> Result<Mmap> {
        let file = File::open(&self.path).map_err(|e| VectorError::io(&self.path, "open shard", e))?;
        // SAFETY: the shard file is only written by this shard, which holds
        // `&self` for the lifetime of the map.
        unsafe { Mmap::map(&file) }.map_err(|e| VectorError::io(&self.path, "map shard", e))
    }

    fn validate_header(&self, data: &[u8]) -> Result<ShardHeader> {
        let header = ShardHeader::decode(data).map_err(|e| corrupt(&self.path, e))?;
        if header.dimension as usize != self.dimension {
            return Err(VectorError::corrupt_shard(
                &self.path,
                format!(
                    "header dimension {} does not match configured dimension {}",
                    header.dimension, self.dimension
                ),
            ));
        }
        Ok(header)
    }
}

fn corrupt(path: &Path, e: CodecError) -> VectorError {
    VectorError::corrupt_shard(path, e.to_string())
}

/// Dropping a `File` discards any error from `close(2)`, so the checked step
/// is `sync_all`, which reports the deferred write-back failures a close
/// would otherwise hide.
fn close(file: File) -> io::Result<()> {
    file.sync_all()?;
    drop(file);
    Ok(())
}

/// Offset of the newest live record for every id in `data`.
fn latest_live_offsets(
    data: &[u8],
    dimension: usize,
) -> std::result::Result<HashMap<String, u64>, CodecError> {
    let mut latest = HashMap::new();
    for record in RecordIter::new(data, dimension) {
        let record = record?;
        if record.is_live() {
            latest.insert(record.id.to_string(), record.offset);
        }
    }
    Ok(latest)
}

fn read_header(path: &Path) -> Result<ShardHeader> {
    let mut raw = [0u8; HEADER_LEN];
    let mut file = File::open(path).map_err(|e| VectorError::io(path, "open shard", e))?;
    file.read_exact(&mut raw).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => VectorError::corrupt_shard(path, "file shorter than header"),
        _ => VectorError::io(path, "read header", e),
    })?;
    ShardHeader::decode(&raw).map_err(|e| corrupt(path, e))
}

/// Finish or discard a compaction that stopped between its two renames.
fn recover_pending_meta(shard_path: &Path, meta_path: &Path, pending_path: &Path) -> Result<()> {
    let Some(pending) = ShardMeta::load(pending_path)? else {
        return Ok(());
    };

    let data = fs::read(shard_path).map_err(|e| VectorError::io(shard_path, "read shard", e))?;
    if pending.matches_shard(&data) {
        warn!(path = %shard_path.display(), "completing interrupted compaction");
        fs::rename(pending_path, meta_path)
            .map_err(|e| VectorError::io(meta_path, "swap compacted metadata", e))?;
    } else {
        warn!(path = %shard_path.display(), "discarding metadata from interrupted compaction");
        fs::remove_file(pending_path)
            .map_err(|e| VectorError::io(pending_path, "remove pending metadata", e))?;
    }
    Ok(())
}
