pub mod config;
pub mod error;
pub mod host;
pub mod node;
pub mod scripting;

pub use config::{init_logging, ScriptingConfig};
pub use error::{CodecError, ScriptError};
pub use host::{memory::MemoryHost, Host, HostEvent};
pub use node::{Format, Node};
pub use scripting::{ContextId, ScriptEngine, StartupReport};

use std::sync::Arc;

/// Load the configured scripts against `host` and run the event loop until
/// the host shuts down. Returns the number of events dispatched.
pub fn run(host: Arc<dyn Host>, config: ScriptingConfig) -> Result<u64, ScriptError> {
    let mut engine = ScriptEngine::new(host, config)?;
    let report = engine.start_configured()?;
    for discarded in &report.discarded {
        log::warn!("[startup] continuing without {}", discarded.path.display());
    }
    Ok(engine.run())
}
