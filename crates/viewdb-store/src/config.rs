use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Durability of journal appends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fdatasync` after every commit (safest, highest latency).
    EveryCommit,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Configuration for [`Database::open`](crate::Database::open).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory holding the journal and checkpoint. `None` keeps the
    /// database purely in memory.
    pub path: Option<PathBuf>,
    /// Journal sync strategy.
    pub sync_mode: SyncMode,
    /// Capacity of the changeset broadcast channel.
    pub channel_capacity: usize,
    /// Hook nesting allowed to issue writes. `1` permits exactly one hop:
    /// hooks fired by a caller's write may write, hooks fired by those
    /// writes may not.
    pub max_hook_depth: usize,
    /// Write a checkpoint and truncate the journal on close.
    pub checkpoint_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_mode: SyncMode::default(),
            channel_capacity: 256,
            max_hook_depth: 1,
            checkpoint_on_close: true,
        }
    }
}

impl StoreConfig {
    /// In-memory database with default settings.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable database rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Parse from TOML. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.channel_capacity == 0 {
            return Err(StoreError::Config("channel_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub(crate) fn journal_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|dir| dir.join("journal.log"))
    }

    pub(crate) fn checkpoint_path(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|dir| dir.join("checkpoint.bin"))
    }
}
