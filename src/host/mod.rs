/// `host/` — the player-side collaborator contract
///
/// The scripting layer never touches player internals directly. Everything
/// goes through `Host`: commands, the property tree, the event source, the
/// log sink, config lookup and input sections.
pub mod event;
pub mod memory;

use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::{Format, Node};

pub use event::{EventKind, EventPayload, HostEvent};

/// Host-assigned identity of one script client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandle {
    pub id: ClientId,
    pub name: String,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorKind {
    InvalidParameter,
    PropertyNotFound,
    PropertyFormat,
    PropertyUnavailable,
    PropertyError,
    Command,
    NotFound,
}

impl HostErrorKind {
    /// The host's canonical message for this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            HostErrorKind::InvalidParameter => "invalid parameter",
            HostErrorKind::PropertyNotFound => "property not found",
            HostErrorKind::PropertyFormat => "unsupported format for accessing property",
            HostErrorKind::PropertyUnavailable => "property unavailable",
            HostErrorKind::PropertyError => "error accessing property",
            HostErrorKind::Command => "error running command",
            HostErrorKind::NotFound => "not found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind) -> Self {
        Self {
            kind,
            message: kind.as_str().to_string(),
        }
    }

    pub fn with_message(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ── Log levels ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    V,
    Debug,
    Trace,
}

impl LogLevel {
    pub const ALL: [LogLevel; 7] = [
        LogLevel::Fatal,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::V,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::V => "v",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn from_name(name: &str) -> Option<LogLevel> {
        LogLevel::ALL.into_iter().find(|l| l.as_str() == name)
    }

    /// Parse a message-subscription threshold. `"no"` turns delivery off.
    pub fn parse_threshold(name: &str) -> Option<Option<LogLevel>> {
        if name == "no" {
            return Some(None);
        }
        LogLevel::from_name(name).map(Some)
    }

    pub fn to_log(self) -> log::Level {
        match self {
            LogLevel::Fatal | LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::V | LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Input sections ────────────────────────────────────────────────────────────

pub mod input_flags {
    /// Unbound keys in this section do not fall through to other sections.
    pub const EXCLUSIVE: u32 = 1;
    pub const ON_TOP: u32 = 2;
    pub const ALLOW_VO_DRAGGING: u32 = 4;
    pub const ALLOW_HIDE_CURSOR: u32 = 8;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSection {
    pub name: String,
    pub location: String,
    pub contents: String,
    pub builtin: bool,
    pub owner: String,
}

// ── Host ──────────────────────────────────────────────────────────────────────

/// Everything the scripting layer consumes from the player.
pub trait Host: Send + Sync {
    fn create_client(&self, name: &str) -> Result<ClientHandle, HostError>;
    fn destroy_client(&self, client: &ClientHandle);

    fn run_structured(&self, client: &ClientHandle, command: &Node) -> Result<Node, HostError>;
    fn run_string(&self, client: &ClientHandle, text: &str) -> Result<(), HostError>;
    fn run_vector(&self, client: &ClientHandle, argv: &[String]) -> Result<(), HostError>;

    fn get_property(&self, client: &ClientHandle, name: &str, format: Format) -> Result<Node, HostError>;
    fn set_property(
        &self,
        client: &ClientHandle,
        name: &str,
        format: Format,
        value: &Node,
    ) -> Result<(), HostError>;
    fn delete_property(&self, client: &ClientHandle, name: &str) -> Result<(), HostError>;
    fn observe_property(
        &self,
        client: &ClientHandle,
        id: u64,
        name: &str,
        format: Format,
    ) -> Result<(), HostError>;
    fn unobserve_property(&self, client: &ClientHandle, id: u64) -> Result<(), HostError>;

    /// Block up to `timeout` for the next event across all clients.
    fn wait_event(&self, timeout: Duration) -> Option<HostEvent>;
    fn request_event(&self, client: &ClientHandle, kind: EventKind, enable: bool) -> Result<(), HostError>;
    fn request_log_messages(&self, client: &ClientHandle, level: Option<LogLevel>) -> Result<(), HostError>;

    fn log(&self, client: &ClientHandle, level: LogLevel, text: &str);
    fn find_config_file(&self, name: &str) -> Option<PathBuf>;

    fn define_section(&self, section: InputSection) -> Result<(), HostError>;
    fn enable_section(&self, name: &str, flags: u32) -> Result<(), HostError>;
}
