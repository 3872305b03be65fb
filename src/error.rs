use std::path::PathBuf;

use thiserror::Error;

use crate::host::{HostError, HostErrorKind};
use crate::scripting::context::ContextId;

/// Failures while moving a value across the host/script boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("map keys must be strings, found {0}")]
    NonStringKey(&'static str),
    #[error("array tables may only hold indices 1..n, found key {0}")]
    InvalidArrayKey(String),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("cannot convert a Lua {0} into a host value")]
    Unsupported(&'static str),
    #[error("value nests deeper than {0} levels (cyclic table?)")]
    TooDeep(usize),
    #[error("{0} is not representable in JSON")]
    NonFiniteDouble(f64),
    #[error("expected a {expected} value for format {format}, got {found}")]
    FormatMismatch {
        format: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("json: {0}")]
    Json(String),
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("{}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    #[error("{}: script does not expose mp.process_event", path.display())]
    Contract { path: PathBuf },

    #[error("{message}")]
    Command { kind: HostErrorKind, message: String },

    #[error("{message}")]
    Property {
        name: String,
        kind: HostErrorKind,
        message: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown event: {0}")]
    InvalidEvent(String),

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("observation id {0} is already registered")]
    DuplicateObservation(u64),

    #[error("context {0} called into the host while not active")]
    InactiveContext(ContextId),

    #[error("cannot activate context {requested} while context {active} is active")]
    Reentrant {
        active: ContextId,
        requested: ContextId,
    },

    #[error("unknown script context {0}")]
    UnknownContext(ContextId),

    #[error("builtin module {module} failed: {message}")]
    Bootstrap { module: &'static str, message: String },

    #[error("all {0} requested scripts failed to load")]
    AllScriptsFailed(usize),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl ScriptError {
    pub fn command(err: HostError) -> Self {
        ScriptError::Command {
            kind: err.kind,
            message: err.message,
        }
    }

    pub fn property(name: &str, err: HostError) -> Self {
        ScriptError::Property {
            name: name.to_string(),
            kind: err.kind,
            message: err.message,
        }
    }
}
