//! Bridge configuration.
//!
//! Everything is optional in the TOML file; defaults match a small
//! single-node deployment. The swap store backend is selected here, and a
//! configuration that enables eviction over a non-durable backend is
//! rejected outright: evicting into a store that forgets the archive loses
//! the project.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::swap::{FsSwapStore, InMemorySwapStore, NoopSwapStore, SwapJobConfig, SwapStore};

pub const DEFAULT_POSTBACK_TIMEOUT_MS: u64 = 6 * 60 * 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("swap is enabled but the {backend} swap store does not persist data")]
    UnsafeSwapStore { backend: &'static str },
    #[error("failed to initialize swap store: {0}")]
    SwapStoreInit(#[source] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Root directory holding one repository directory per project.
    pub root_dir: PathBuf,
    /// Metadata database location; defaults to inside the root.
    pub db_path: Option<PathBuf>,
    pub postback_timeout_ms: u64,
    /// Reject pushes with more files than this.
    pub max_file_count: Option<u64>,
    /// Reject individual files larger than this, on pull and push.
    pub max_file_size: Option<u64>,
    /// Whether the background eviction loop runs at all.
    pub swap_enabled: bool,
    /// Test-only escape hatch for pairing eviction with a volatile store.
    pub allow_unsafe_swap_store: bool,
    pub swap: SwapJobConfig,
    pub swap_store: SwapStoreChoice,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/snapbridge"),
            db_path: None,
            postback_timeout_ms: DEFAULT_POSTBACK_TIMEOUT_MS,
            max_file_count: Some(2_000),
            max_file_size: Some(50 * (1 << 20)),
            swap_enabled: false,
            allow_unsafe_swap_store: false,
            swap: SwapJobConfig::default(),
            swap_store: SwapStoreChoice::Noop,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root_dir.join(".bridge").join("bridge.db"))
    }

    pub fn postback_timeout(&self) -> Duration {
        Duration::from_millis(self.postback_timeout_ms)
    }

    /// Builds the configured swap store, refusing non-durable backends when
    /// eviction is enabled.
    pub fn build_swap_store(&self) -> Result<Arc<dyn SwapStore>, ConfigError> {
        let store = self.swap_store.build()?;
        if self.swap_enabled && !store.is_safe() && !self.allow_unsafe_swap_store {
            return Err(ConfigError::UnsafeSwapStore {
                backend: self.swap_store.backend_name(),
            });
        }
        Ok(store)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SwapStoreChoice {
    Noop,
    Memory,
    Fs { dir: PathBuf },
}

impl SwapStoreChoice {
    fn backend_name(&self) -> &'static str {
        match self {
            SwapStoreChoice::Noop => "noop",
            SwapStoreChoice::Memory => "memory",
            SwapStoreChoice::Fs { .. } => "fs",
        }
    }

    fn build(&self) -> Result<Arc<dyn SwapStore>, ConfigError> {
        Ok(match self {
            SwapStoreChoice::Noop => Arc::new(NoopSwapStore),
            SwapStoreChoice::Memory => Arc::new(InMemorySwapStore::new()),
            SwapStoreChoice::Fs { dir } => Arc::new(
                FsSwapStore::new(dir.clone()).map_err(|err| match err {
                    crate::swap::SwapStoreError::Io(io) => ConfigError::SwapStoreInit(io),
                    other => ConfigError::SwapStoreInit(std::io::Error::other(other)),
                })?,
            ),
        })
    }
}
