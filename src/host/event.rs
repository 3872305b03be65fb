/// `host/event.rs` — events emitted by the host
///
/// Ids and names follow the host's own event table; gaps are ids the host
/// no longer emits.
use serde::{Deserialize, Serialize};

use super::{ClientId, LogLevel};
use crate::node::{Format, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Shutdown,
    LogMessage,
    GetPropertyReply,
    SetPropertyReply,
    CommandReply,
    StartFile,
    EndFile,
    FileLoaded,
    Idle,
    Tick,
    ClientMessage,
    VideoReconfig,
    AudioReconfig,
    Seek,
    PlaybackRestart,
    PropertyChange,
    QueueOverflow,
    Hook,
}

impl EventKind {
    pub const ALL: [EventKind; 18] = [
        EventKind::Shutdown,
        EventKind::LogMessage,
        EventKind::GetPropertyReply,
        EventKind::SetPropertyReply,
        EventKind::CommandReply,
        EventKind::StartFile,
        EventKind::EndFile,
        EventKind::FileLoaded,
        EventKind::Idle,
        EventKind::Tick,
        EventKind::ClientMessage,
        EventKind::VideoReconfig,
        EventKind::AudioReconfig,
        EventKind::Seek,
        EventKind::PlaybackRestart,
        EventKind::PropertyChange,
        EventKind::QueueOverflow,
        EventKind::Hook,
    ];

    pub fn id(self) -> i64 {
        match self {
            EventKind::Shutdown => 1,
            EventKind::LogMessage => 2,
            EventKind::GetPropertyReply => 3,
            EventKind::SetPropertyReply => 4,
            EventKind::CommandReply => 5,
            EventKind::StartFile => 6,
            EventKind::EndFile => 7,
            EventKind::FileLoaded => 8,
            EventKind::Idle => 11,
            EventKind::Tick => 14,
            EventKind::ClientMessage => 16,
            EventKind::VideoReconfig => 17,
            EventKind::AudioReconfig => 18,
            EventKind::Seek => 20,
            EventKind::PlaybackRestart => 21,
            EventKind::PropertyChange => 22,
            EventKind::QueueOverflow => 24,
            EventKind::Hook => 25,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Shutdown => "shutdown",
            EventKind::LogMessage => "log-message",
            EventKind::GetPropertyReply => "get-property-reply",
            EventKind::SetPropertyReply => "set-property-reply",
            EventKind::CommandReply => "command-reply",
            EventKind::StartFile => "start-file",
            EventKind::EndFile => "end-file",
            EventKind::FileLoaded => "file-loaded",
            EventKind::Idle => "idle",
            EventKind::Tick => "tick",
            EventKind::ClientMessage => "client-message",
            EventKind::VideoReconfig => "video-reconfig",
            EventKind::AudioReconfig => "audio-reconfig",
            EventKind::Seek => "seek",
            EventKind::PlaybackRestart => "playback-restart",
            EventKind::PropertyChange => "property-change",
            EventKind::QueueOverflow => "queue-overflow",
            EventKind::Hook => "hook",
        }
    }

    pub fn from_id(id: i64) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.id() == id)
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    ClientMessage {
        args: Vec<String>,
    },
    PropertyChange {
        name: String,
        format: Format,
        value: Node,
    },
    LogMessage {
        prefix: String,
        level: LogLevel,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub kind: EventKind,
    /// Destination client; `None` means every client receives it.
    pub client: Option<ClientId>,
    pub reply_userdata: u64,
    pub payload: EventPayload,
}

impl HostEvent {
    pub fn broadcast(kind: EventKind) -> Self {
        Self {
            kind,
            client: None,
            reply_userdata: 0,
            payload: EventPayload::None,
        }
    }

    pub fn shutdown() -> Self {
        Self::broadcast(EventKind::Shutdown)
    }

    pub fn client_message(client: Option<ClientId>, args: Vec<String>) -> Self {
        Self {
            kind: EventKind::ClientMessage,
            client,
            reply_userdata: 0,
            payload: EventPayload::ClientMessage { args },
        }
    }

    pub fn property_change(client: ClientId, id: u64, name: &str, format: Format, value: Node) -> Self {
        Self {
            kind: EventKind::PropertyChange,
            client: Some(client),
            reply_userdata: id,
            payload: EventPayload::PropertyChange {
                name: name.to_string(),
                format,
                value,
            },
        }
    }

    pub fn log_message(prefix: &str, level: LogLevel, text: &str) -> Self {
        Self {
            kind: EventKind::LogMessage,
            client: None,
            reply_userdata: 0,
            payload: EventPayload::LogMessage {
                prefix: prefix.to_string(),
                level,
                text: text.to_string(),
            },
        }
    }
}
