/// `config.rs` — engine settings and logger setup
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{error::ScriptError, scripting::sandbox::TrustLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Standard libraries given to every new context.
    pub trust: TrustLevel,
    /// How long one `poll` waits for a host event.
    pub poll_timeout_ms: u64,
    /// Per-handler budget enforced by the watchdog. `None` disables it.
    pub handler_timeout_ms: Option<u64>,
    /// Entries kept in each script's log buffer.
    pub log_buffer_limit: usize,
    /// Scripts loaded by `ScriptEngine::start_configured`.
    pub scripts: Vec<PathBuf>,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            trust: TrustLevel::Basic,
            poll_timeout_ms: 250,
            handler_timeout_ms: None,
            log_buffer_limit: 200,
            scripts: Vec::new(),
        }
    }
}

impl ScriptingConfig {
    pub fn from_json(text: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(text).map_err(|e| ScriptError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

/// Install `env_logger`, honouring `RUST_LOG` over `default_filter`.
/// Safe to call more than once.
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}
