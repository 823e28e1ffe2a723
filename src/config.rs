//! Process-wide configuration snapshot.
//!
//! Mirrors `config::core`'s `static CONFIG: Lazy<ArcSwap<ConfigAndUsers>>` /
//! `config()` / `load()` trio: a new snapshot can be installed at runtime
//! without restarting the process, and callers that need a consistent view
//! across an `await` point hold an `Arc` clone rather than re-reading the
//! global cell mid-operation.

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consumer::WriteUnit;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Default `write_unit` assigned to a shape that has no dependencies and
/// isn't a subquery shape (the common case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteUnitConfig {
    Txn,
    TxnFragment,
}

impl From<WriteUnitConfig> for WriteUnit {
    fn from(value: WriteUnitConfig) -> Self {
        match value {
            WriteUnitConfig::Txn => WriteUnit::Txn,
            WriteUnitConfig::TxnFragment => WriteUnit::TxnFragment,
        }
    }
}

/// Recognized configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Write mode assigned to a standalone shape; outer/subquery shapes
    /// always get `Txn` regardless of this setting.
    #[serde(default = "Config::write_unit")]
    pub write_unit: WriteUnitConfig,

    /// Name of the Postgres publication this core's shapes are drawn from.
    /// The publication-configuration SQL layer itself is out of scope; this
    /// is carried through for the out-of-scope layer to read.
    #[serde(default = "Config::publication_name")]
    pub publication_name: String,

    /// Whether to force `REPLICA IDENTITY FULL` on tracked tables. Out of
    /// scope to enforce here; carried through for the connection layer.
    #[serde(default)]
    pub replica_identity_check: bool,

    /// Base directory under which each shape gets its own log directory.
    #[serde(default = "Config::storage_root")]
    pub storage_root: String,

    /// How long the Dispatcher's supervisor waits for an ack before
    /// considering a consumer slow and requesting its restart.
    #[serde(default = "Config::dispatcher_slow_consumer_timeout_ms")]
    pub dispatcher_slow_consumer_timeout_ms: u64,

    /// Bound on the pending-notification channel between a Materializer and
    /// its outer-consumer subscribers.
    #[serde(default = "Config::materializer_channel_capacity")]
    pub materializer_channel_capacity: usize,
}

impl Config {
    fn write_unit() -> WriteUnitConfig {
        WriteUnitConfig::TxnFragment
    }

    fn publication_name() -> String {
        "shape_sync".into()
    }

    fn storage_root() -> String {
        "./shapes".into()
    }

    fn dispatcher_slow_consumer_timeout_ms() -> u64 {
        30_000
    }

    fn materializer_channel_capacity() -> usize {
        1024
    }

    pub fn dispatcher_slow_consumer_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher_slow_consumer_timeout_ms)
    }

    /// Parse a TOML config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| Error::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_unit: Self::write_unit(),
            publication_name: Self::publication_name(),
            replica_identity_check: false,
            storage_root: Self::storage_root(),
            dispatcher_slow_consumer_timeout_ms: Self::dispatcher_slow_consumer_timeout_ms(),
            materializer_channel_capacity: Self::materializer_channel_capacity(),
        }
    }
}

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// The current configuration snapshot. Cheap to call repeatedly; clone the
/// returned `Arc` once per logical operation rather than calling this at
/// every use site, so a concurrent `set` can't be observed partway through
/// one operation.
pub fn config() -> std::sync::Arc<Config> {
    CONFIG.load_full()
}

/// Install a new configuration snapshot. Existing `Arc<Config>` clones held
/// by in-flight consumers/materializers keep observing the old snapshot
/// until they next call [`config()`].
pub fn set(new: Config) {
    CONFIG.store(std::sync::Arc::new(new));
}

/// Load `path` and install it as the current snapshot.
pub fn load(path: impl AsRef<Path>) -> Result<std::sync::Arc<Config>, Error> {
    let parsed = Config::load(path)?;
    set(parsed);
    Ok(config())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.write_unit, WriteUnitConfig::TxnFragment);
        assert_eq!(config.publication_name, "shape_sync");
        assert!(!config.replica_identity_check);
    }

    #[test]
    fn test_parses_partial_toml() {
        let parsed: Config = toml::from_str(r#"publication_name = "my_pub""#).unwrap();
        assert_eq!(parsed.publication_name, "my_pub");
        // Everything else falls back to its default.
        assert_eq!(parsed.write_unit, WriteUnitConfig::TxnFragment);
    }

    #[test]
    fn test_set_and_get_roundtrip() {
        let mut custom = Config::default();
        custom.publication_name = "override_pub".into();
        set(custom);
        assert_eq!(config().publication_name, "override_pub");
        // Restore the default for other tests in this binary.
        set(Config::default());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = Config::load("/nonexistent/path/shape-sync.toml").unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }
}
