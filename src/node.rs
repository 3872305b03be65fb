/// `node.rs` — the host's tagged exchange value
///
/// Every command, property value and event payload crosses the host/script
/// boundary as a `Node`. Maps keep insertion order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Node {
    None,
    Flag(bool),
    Int64(i64),
    Double(f64),
    String(String),
    Array(Vec<Node>),
    Map(IndexMap<String, Node>),
}

impl Node {
    pub fn tag(&self) -> &'static str {
        match self {
            Node::None => "none",
            Node::Flag(_) => "flag",
            Node::Int64(_) => "int64",
            Node::Double(_) => "double",
            Node::String(_) => "string",
            Node::Array(_) => "array",
            Node::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    /// Build an array node from anything string-like (argv style commands).
    pub fn argv<I, S>(args: I) -> Node
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Node::Array(args.into_iter().map(|a| Node::String(a.into())).collect())
    }

    // ── JSON bridge ───────────────────────────────────────────────────────

    pub fn from_json(value: serde_json::Value) -> Node {
        match value {
            serde_json::Value::Null => Node::None,
            serde_json::Value::Bool(b) => Node::Flag(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Node::Int64(i),
                None => Node::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Node::String(s),
            serde_json::Value::Array(items) => {
                Node::Array(items.into_iter().map(Node::from_json).collect())
            }
            serde_json::Value::Object(obj) => Node::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, Node::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, CodecError> {
        Ok(match self {
            Node::None => serde_json::Value::Null,
            Node::Flag(b) => serde_json::Value::Bool(*b),
            Node::Int64(i) => serde_json::Value::from(*i),
            Node::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .ok_or(CodecError::NonFiniteDouble(*d))?,
            Node::String(s) => serde_json::Value::String(s.clone()),
            Node::Array(items) => serde_json::Value::Array(
                items.iter().map(Node::to_json).collect::<Result<_, _>>()?,
            ),
            Node::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(obj)
            }
        })
    }

    pub fn parse_json(text: &str) -> Result<Node, CodecError> {
        serde_json::from_str(text)
            .map(Node::from_json)
            .map_err(|e| CodecError::Json(e.to_string()))
    }

    pub fn format_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(&self.to_json()?).map_err(|e| CodecError::Json(e.to_string()))
    }

    /// Plain-text rendering used when a host needs a command argument or a
    /// string-format property value.
    pub fn to_text(&self) -> String {
        match self {
            Node::None => String::new(),
            Node::Flag(true) => "yes".to_string(),
            Node::Flag(false) => "no".to_string(),
            Node::Int64(i) => i.to_string(),
            Node::Double(d) => format!("{d:.6}"),
            Node::String(s) => s.clone(),
            Node::Array(_) | Node::Map(_) => self.format_json().unwrap_or_default(),
        }
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Node::Flag(v)
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Int64(v)
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Double(v)
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::String(v.to_string())
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Node::String(v)
    }
}

// ── Format ────────────────────────────────────────────────────────────────────

/// The representation a caller asks the host for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    None,
    String,
    OsdString,
    Flag,
    Int64,
    Double,
    Node,
}

impl Format {
    pub const ALL: [Format; 7] = [
        Format::None,
        Format::String,
        Format::OsdString,
        Format::Flag,
        Format::Int64,
        Format::Double,
        Format::Node,
    ];

    pub fn id(self) -> i64 {
        match self {
            Format::None => 0,
            Format::String => 1,
            Format::OsdString => 2,
            Format::Flag => 3,
            Format::Int64 => 4,
            Format::Double => 5,
            Format::Node => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::None => "none",
            Format::String => "string",
            Format::OsdString => "osd",
            Format::Flag => "flag",
            Format::Int64 => "int64",
            Format::Double => "double",
            Format::Node => "node",
        }
    }

    pub fn from_id(id: i64) -> Option<Format> {
        Format::ALL.into_iter().find(|f| f.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Format> {
        match name {
            "native" => Some(Format::Node),
            "osd_string" | "osd-string" => Some(Format::OsdString),
            "bool" => Some(Format::Flag),
            _ => Format::ALL.into_iter().find(|f| f.name() == name),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
