//! Store configuration: TOML file, then `MOMENT_INDEX_*` environment overrides.

use crate::error::{Result, VectorError};
use crate::index::DurableIndex;
use crate::snapshot::SnapshotStore;
use crate::store::VectorStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const ENV_PREFIX: &str = "MOMENT_INDEX_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Sharded append-log files, durable per write.
    Durable,
    /// One in-memory table, written out on flush.
    Snapshot,
}

impl std::str::FromStr for Backend {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "durable" => Ok(Backend::Durable),
            "snapshot" => Ok(Backend::Snapshot),
            other => Err(VectorError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub root: PathBuf,
    pub collection: String,
    pub dimension: usize,
    pub shard_count: usize,
    pub backend: Backend,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/vectors"),
            collection: "moments".to_string(),
            dimension: 384,
            shard_count: 8,
            backend: Backend::Durable,
        }
    }
}

impl IndexConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| VectorError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VectorError::io(path, "read config", e))?;
        Self::from_toml_str(&raw)
    }

    /// Defaults (or `path`, if given), then `.env`, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        dotenv::dotenv().ok();
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MOMENT_INDEX_*` pairs; other keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "ROOT" => self.root = PathBuf::from(value),
                "COLLECTION" => self.collection = value.to_string(),
                "DIMENSION" => self.dimension = parse_number(name, value)?,
                "SHARD_COUNT" => self.shard_count = parse_number(name, value)?,
                "BACKEND" => self.backend = value.parse()?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension > u16::MAX as usize {
            return Err(VectorError::Config(format!(
                "dimension must be between 1 and {}, got {}",
                u16::MAX,
                self.dimension
            )));
        }
        if self.shard_count == 0 {
            return Err(VectorError::Config("shard_count must be positive".into()));
        }
        if self.collection.trim().is_empty() {
            return Err(VectorError::Config("collection must not be empty".into()));
        }
        Ok(())
    }

    /// Snapshot file used by the snapshot backend.
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(format!("{}.snap", self.collection))
    }

    pub fn open_store(&self) -> Result<Arc<dyn VectorStore>> {
        self.validate()?;
        info!(backend = ?self.backend, collection = %self.collection, "opening vector store");
        Ok(match self.backend {
            Backend::Durable => Arc::new(DurableIndex::open(
                &self.root,
                &self.collection,
                self.dimension,
                self.shard_count,
            )?),
            Backend::Snapshot => Arc::new(SnapshotStore::open(self.snapshot_path(), self.dimension)?),
        })
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| VectorError::Config(format!("{ENV_PREFIX}{name} is not a number: {value:?}")))
}
