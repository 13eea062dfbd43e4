//! Engine-wide tunables, loaded from `config.json` in the data directory.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    chunking::ChunkingConfig,
    composer::ComposerConfig,
    error::{Error, Result},
    memory::MemoryConfig,
    retrieval::RetrievalConfig,
    session::ContextConfig,
};

/// Every tunable of the engine. Missing fields take their defaults, so a
/// partial file such as `{"retrieval": {"similarity_threshold": 0.4}}` is
/// valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub context: ContextConfig,
    pub composer: ComposerConfig,
}

impl EngineConfig {
    /// Read the config at `path`, or the defaults if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Write the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
