/// `scripting/` — Lua script contexts hosted inside the player
///
/// Each script runs in its own isolated Lua VM (mlua) with its own host
/// client. `ScriptEngine` owns the contexts; `dispatch` feeds them host
/// events one context at a time. Script errors are caught and logged and
/// never take down sibling scripts.
pub mod api;
pub mod builtin;
pub mod codec;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod sandbox;

pub use context::{ActiveContextHandle, ContextId, ContextSwitch, ScriptContext, ScriptStats};
pub use dispatch::DispatchReport;
pub use engine::{Discarded, LoadStage, ScriptEngine, ScriptInfo, StartupReport};
pub use sandbox::TrustLevel;
