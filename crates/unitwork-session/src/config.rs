//! Persistence context configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use unitwork_core::Result;

/// When pending changes are flushed implicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Before queries touching types with pending changes, and before commit.
    #[default]
    Auto,
    /// Only before commit.
    Commit,
    /// Only on explicit `flush()`.
    Manual,
}

/// How the context interacts with the second-level cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only; writes only invalidate.
    Get,
    /// Write only; never read.
    Put,
    /// Neither read nor write; writes still invalidate.
    Ignore,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub const fn writes(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put)
    }
}

/// Configuration for persistence context behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Reject NULL in non-nullable properties before any SQL executes.
    pub check_nullability: bool,
    pub cache_mode: CacheMode,
    /// Order actions of the same kind by entity type name before
    /// registration order.
    pub order_by_table: bool,
    /// Lock wait passed to locking reads.
    pub default_lock_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            check_nullability: true,
            cache_mode: CacheMode::Normal,
            order_by_table: false,
            default_lock_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    #[must_use]
    pub fn check_nullability(mut self, value: bool) -> Self {
        self.check_nullability = value;
        self
    }

    #[must_use]
    pub fn order_by_table(mut self, value: bool) -> Self {
        self.order_by_table = value;
        self
    }

    #[must_use]
    pub fn lock_timeout_ms(mut self, value: Option<u64>) -> Self {
        self.default_lock_timeout_ms = value;
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.default_lock_timeout_ms.map(Duration::from_millis)
    }
}
