//! Offset sidecar: identifier -> byte offset of its latest live record.
//!
//! Stored as a JSON object next to the shard file. Writes go through a
//! temporary file and a rename so a reader never sees a half-written sidecar.

use crate::codec::{decode_record_at, ShardHeader};
use crate::error::{Result, VectorError};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug)]
pub struct ShardMeta {
    path: PathBuf,
    offsets: HashMap<String, u64>,
}

impl ShardMeta {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: HashMap::new(),
        }
    }

    pub fn with_offsets(path: impl Into<PathBuf>, offsets: HashMap<String, u64>) -> Self {
        Self {
            path: path.into(),
            offsets,
        }
    }

    /// Load the sidecar, or `None` if it does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Option<Self>> {
        let path = path.into();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VectorError::io(&path, "read metadata", e)),
        };
        let offsets = serde_json::from_slice(&raw).map_err(|source| VectorError::Metadata {
            path: path.clone(),
            source,
        })?;
        Ok(Some(Self { path, offsets }))
    }

    pub fn persist(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.offsets)
    }

    /// Write these offsets to `path` instead of the sidecar's own location.
    pub fn persist_to(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, &self.offsets)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<u64> {
        self.offsets.get(id).copied()
    }

    pub fn insert(&mut self, id: &str, offset: u64) -> Option<u64> {
        self.offsets.insert(id.to_string(), offset)
    }

    pub fn remove(&mut self, id: &str) -> Option<u64> {
        self.offsets.remove(id)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// True when every offset names a live record with the matching id in
    /// `data`, a whole shard file.
    pub fn matches_shard(&self, data: &[u8]) -> bool {
        let Ok(header) = ShardHeader::decode(data) else {
            return false;
        };
        let dimension = header.dimension as usize;
        self.offsets.iter().all(|(id, &offset)| {
            matches!(
                decode_record_at(data, offset, dimension),
                Ok(view) if view.is_live() && view.id == id
            )
        })
    }
}

fn write_json_atomic(path: &Path, offsets: &HashMap<String, u64>) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let body = serde_json::to_vec(offsets).map_err(|source| VectorError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| VectorError::io(path, "create metadata", e))?;
    tmp.write_all(&body)
        .map_err(|e| VectorError::io(path, "write metadata", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| VectorError::io(path, "flush metadata", e))?;
    tmp.persist(path)
        .map_err(|e| VectorError::io(path, "rename metadata", e.error))?;
    Ok(())
}
