/// `host/memory.rs` — headless in-process host
///
/// Implements the full `Host` contract over plain data: a typed property
/// table, a small command set, an event queue, captured log lines and input
/// sections. Embedders use it to run scripts without a player; the crate's
/// own tests drive everything through it.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;

use super::{
    input_flags, ClientHandle, ClientId, EventKind, Host, HostError, HostErrorKind, HostEvent,
    InputSection, LogLevel,
};
use crate::node::{Format, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub client: String,
    pub level: LogLevel,
    pub text: String,
}

#[derive(Debug, Clone)]
struct Observer {
    client: ClientId,
    id: u64,
    name: String,
    format: Format,
}

#[derive(Default)]
struct MemoryState {
    next_client: u64,
    clients: IndexMap<ClientId, String>,
    destroyed: Vec<String>,
    properties: IndexMap<String, Node>,
    observers: Vec<Observer>,
    events: VecDeque<HostEvent>,
    log: Vec<LogLine>,
    commands: Vec<Vec<String>>,
    osd: Vec<String>,
    config_files: HashMap<String, PathBuf>,
    sections: IndexMap<String, InputSection>,
    enabled_sections: Vec<(String, u32)>,
    disabled_events: HashMap<ClientId, HashSet<EventKind>>,
    log_levels: HashMap<ClientId, LogLevel>,
    keypress_depth: usize,
}

/// Nesting limit for bindings that press further keys.
const MAX_KEYPRESS_DEPTH: usize = 8;

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
    ready: Condvar,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a property; its initial value fixes its type.
    pub fn with_property(self, name: &str, value: impl Into<Node>) -> Self {
        self.lock().properties.insert(name.to_string(), value.into());
        self
    }

    pub fn with_config_file(self, name: &str, path: impl AsRef<Path>) -> Self {
        self.lock()
            .config_files
            .insert(name.to_string(), path.as_ref().to_path_buf());
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_event(&self, event: HostEvent) {
        self.lock().events.push_back(event);
        self.ready.notify_all();
    }

    pub fn pending_events(&self) -> usize {
        self.lock().events.len()
    }

    pub fn property(&self, name: &str) -> Option<Node> {
        self.lock().properties.get(name).cloned()
    }

    pub fn client_id(&self, name: &str) -> Option<ClientId> {
        self.lock().client_by_name(name)
    }

    pub fn clients(&self) -> Vec<String> {
        self.lock().clients.values().cloned().collect()
    }

    /// Client names in the order they were destroyed.
    pub fn destroyed_clients(&self) -> Vec<String> {
        self.lock().destroyed.clone()
    }

    pub fn log_lines(&self) -> Vec<LogLine> {
        self.lock().log.clone()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock().commands.clone()
    }

    pub fn osd_messages(&self) -> Vec<String> {
        self.lock().osd.clone()
    }

    pub fn section(&self, name: &str) -> Option<InputSection> {
        self.lock().sections.get(name).cloned()
    }

    pub fn enabled_sections(&self) -> Vec<(String, u32)> {
        self.lock().enabled_sections.clone()
    }

    /// `(client, id, property)` for every live observation.
    pub fn observers(&self) -> Vec<(ClientId, u64, String)> {
        self.lock()
            .observers
            .iter()
            .map(|o| (o.client, o.id, o.name.clone()))
            .collect()
    }

    pub fn event_enabled(&self, client: ClientId, kind: EventKind) -> bool {
        self.lock()
            .disabled_events
            .get(&client)
            .map_or(true, |set| !set.contains(&kind))
    }

    /// Simulate a key press against the enabled input sections.
    pub fn press_key(&self, key: &str) -> Result<(), HostError> {
        let result = self.lock().keypress(key);
        self.ready.notify_all();
        result
    }
}

impl MemoryState {
    fn client_by_name(&self, name: &str) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    fn client_name(&self, id: ClientId) -> String {
        self.clients.get(&id).cloned().unwrap_or_default()
    }

    fn notify(&mut self, name: &str) {
        let value = self.properties.get(name).cloned();
        let events: Vec<HostEvent> = self
            .observers
            .iter()
            .filter(|o| o.name == name)
            .map(|o| {
                let data = value
                    .as_ref()
                    .and_then(|v| read_as(v, o.format).ok())
                    .unwrap_or(Node::None);
                HostEvent::property_change(o.client, o.id, name, o.format, data)
            })
            .collect();
        self.events.extend(events);
    }

    fn set(&mut self, name: &str, format: Format, value: &Node) -> Result<(), HostError> {
        let current = self
            .properties
            .get(name)
            .ok_or_else(|| HostError::new(HostErrorKind::PropertyNotFound))?;
        let next = write_as(current, format, value)?;
        if *current != next {
            self.properties.insert(name.to_string(), next);
            self.notify(name);
        }
        Ok(())
    }

    fn run_argv(&mut self, client: ClientId, args: &[String]) -> Result<Node, HostError> {
        self.commands.push(args.to_vec());
        let arg = |i: usize| {
            args.get(i)
                .map(String::as_str)
                .ok_or_else(|| HostError::new(HostErrorKind::InvalidParameter))
        };
        let command_failed = |_| HostError::new(HostErrorKind::Command);

        match arg(0)? {
            "ignore" => Ok(Node::None),
            "set" => {
                let value = Node::String(arg(2)?.to_string());
                self.set(arg(1)?, Format::String, &value)
                    .map_err(command_failed)?;
                Ok(Node::None)
            }
            "add" => {
                let name = arg(1)?;
                let delta = args.get(2).map(String::as_str).unwrap_or("1");
                let next = match self.properties.get(name) {
                    Some(Node::Int64(i)) => Node::Int64(
                        i + delta.parse::<i64>().map_err(|_| HostError::new(HostErrorKind::Command))?,
                    ),
                    Some(Node::Double(d)) => Node::Double(
                        d + delta.parse::<f64>().map_err(|_| HostError::new(HostErrorKind::Command))?,
                    ),
                    _ => return Err(HostError::new(HostErrorKind::Command)),
                };
                self.set(name, Format::Node, &next).map_err(command_failed)?;
                Ok(Node::None)
            }
            "cycle" => {
                let name = arg(1)?;
                let next = match self.properties.get(name) {
                    Some(Node::Flag(b)) => Node::Flag(!b),
                    _ => return Err(HostError::new(HostErrorKind::Command)),
                };
                self.set(name, Format::Flag, &next).map_err(command_failed)?;
                Ok(Node::None)
            }
            "show-text" => {
                self.osd.push(arg(1)?.to_string());
                Ok(Node::None)
            }
            "print-text" => {
                let line = LogLine {
                    client: self.client_name(client),
                    level: LogLevel::Info,
                    text: arg(1)?.to_string(),
                };
                self.log.push(line);
                Ok(Node::None)
            }
            "expand-text" => Ok(Node::String(self.expand(arg(1)?))),
            "script-message" => {
                self.events
                    .push_back(HostEvent::client_message(None, args[1..].to_vec()));
                Ok(Node::None)
            }
            "script-message-to" => {
                let target = self.client_by_name(arg(1)?).ok_or_else(|| {
                    HostError::with_message(HostErrorKind::Command, format!("no client named {}", args[1]))
                })?;
                self.events
                    .push_back(HostEvent::client_message(Some(target), args[2..].to_vec()));
                Ok(Node::None)
            }
            "script-binding" => {
                let spec = arg(1)?;
                let (owner, binding) = spec.split_once('/').unwrap_or(("", spec));
                let target = if owner.is_empty() {
                    None
                } else {
                    Some(self.client_by_name(owner).ok_or_else(|| HostError::new(HostErrorKind::Command))?)
                };
                let message = vec!["key-binding".to_string(), binding.to_string(), "p-".to_string()];
                self.events.push_back(HostEvent::client_message(target, message));
                Ok(Node::None)
            }
            "keypress" => {
                self.keypress(arg(1)?)?;
                Ok(Node::None)
            }
            "quit" => {
                self.events.push_back(HostEvent::shutdown());
                Ok(Node::None)
            }
            _ => Err(HostError::new(HostErrorKind::InvalidParameter)),
        }
    }

    /// Resolve a key through the enabled sections, most recently enabled
    /// first. The bound command runs as the section's owner.
    fn keypress(&mut self, key: &str) -> Result<(), HostError> {
        if self.keypress_depth >= MAX_KEYPRESS_DEPTH {
            return Err(HostError::with_message(
                HostErrorKind::Command,
                format!("key {key}: bindings nest deeper than {MAX_KEYPRESS_DEPTH}"),
            ));
        }
        let mut found = None;
        for (name, flags) in self.enabled_sections.iter().rev() {
            let Some(section) = self.sections.get(name) else {
                continue;
            };
            let hit = section.contents.lines().find_map(|line| {
                let (k, cmd) = line.trim().split_once(char::is_whitespace)?;
                (k == key).then(|| cmd.trim().to_string())
            });
            if let Some(command) = hit {
                found = Some((command, section.owner.clone()));
                break;
            }
            if flags & input_flags::EXCLUSIVE != 0 {
                break;
            }
        }
        let (command, owner) = found.ok_or_else(|| {
            HostError::with_message(HostErrorKind::Command, format!("key {key} is not bound"))
        })?;
        // Sections whose owner has gone run as the host itself.
        let client = self.client_by_name(&owner).unwrap_or(ClientId(0));

        self.keypress_depth += 1;
        let result = self.run_argv(client, &tokenize(&command));
        self.keypress_depth -= 1;
        result.map(|_| ())
    }

    fn expand(&self, text: &str) -> String {
        let mut out = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    if let Some(v) = self.properties.get(name) {
                        out.push_str(&v.to_text());
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl Host for MemoryHost {
    fn create_client(&self, name: &str) -> Result<ClientHandle, HostError> {
        if name.is_empty() {
            return Err(HostError::new(HostErrorKind::InvalidParameter));
        }
        let mut state = self.lock();
        let mut unique = name.to_string();
        let mut n = 2;
        while state.client_by_name(&unique).is_some() {
            unique = format!("{name}{n}");
            n += 1;
        }
        state.next_client += 1;
        let id = ClientId(state.next_client);
        state.clients.insert(id, unique.clone());
        Ok(ClientHandle { id, name: unique })
    }

    fn destroy_client(&self, client: &ClientHandle) {
        let mut state = self.lock();
        if state.clients.shift_remove(&client.id).is_some() {
            state.destroyed.push(client.name.clone());
        }
        state.observers.retain(|o| o.client != client.id);
        state.log_levels.remove(&client.id);
        state.disabled_events.remove(&client.id);
    }

    fn run_structured(&self, client: &ClientHandle, command: &Node) -> Result<Node, HostError> {
        let args: Vec<String> = match command {
            Node::Array(items) => items.iter().map(Node::to_text).collect(),
            Node::Map(map) => {
                let name = map
                    .get("name")
                    .and_then(Node::as_str)
                    .ok_or_else(|| HostError::new(HostErrorKind::InvalidParameter))?;
                let mut args = vec![name.to_string()];
                match map.get("args") {
                    Some(Node::Array(items)) => args.extend(items.iter().map(Node::to_text)),
                    Some(_) => return Err(HostError::new(HostErrorKind::InvalidParameter)),
                    None => {}
                }
                args
            }
            _ => return Err(HostError::new(HostErrorKind::InvalidParameter)),
        };
        let result = self.lock().run_argv(client.id, &args);
        self.ready.notify_all();
        result
    }

    fn run_string(&self, client: &ClientHandle, text: &str) -> Result<(), HostError> {
        let result = self.lock().run_argv(client.id, &tokenize(text));
        self.ready.notify_all();
        result.map(|_| ())
    }

    fn run_vector(&self, client: &ClientHandle, argv: &[String]) -> Result<(), HostError> {
        let result = self.lock().run_argv(client.id, argv);
        self.ready.notify_all();
        result.map(|_| ())
    }

    fn get_property(&self, _client: &ClientHandle, name: &str, format: Format) -> Result<Node, HostError> {
        let state = self.lock();
        let value = state
            .properties
            .get(name)
            .ok_or_else(|| HostError::new(HostErrorKind::PropertyNotFound))?;
        read_as(value, format)
    }

    fn set_property(
        &self,
        _client: &ClientHandle,
        name: &str,
        format: Format,
        value: &Node,
    ) -> Result<(), HostError> {
        let result = self.lock().set(name, format, value);
        self.ready.notify_all();
        result
    }

    fn delete_property(&self, _client: &ClientHandle, name: &str) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.properties.shift_remove(name).is_none() {
            return Err(HostError::new(HostErrorKind::PropertyNotFound));
        }
        state.notify(name);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn observe_property(
        &self,
        client: &ClientHandle,
        id: u64,
        name: &str,
        format: Format,
    ) -> Result<(), HostError> {
        let mut state = self.lock();
        state.observers.push(Observer {
            client: client.id,
            id,
            name: name.to_string(),
            format,
        });
        let initial = state
            .properties
            .get(name)
            .and_then(|v| read_as(v, format).ok())
            .unwrap_or(Node::None);
        state
            .events
            .push_back(HostEvent::property_change(client.id, id, name, format, initial));
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn unobserve_property(&self, client: &ClientHandle, id: u64) -> Result<(), HostError> {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|o| !(o.client == client.id && o.id == id));
        if state.observers.len() == before {
            return Err(HostError::new(HostErrorKind::InvalidParameter));
        }
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Option<HostEvent> {
        let guard = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |s| s.events.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        state.events.pop_front()
    }

    fn request_event(&self, client: &ClientHandle, kind: EventKind, enable: bool) -> Result<(), HostError> {
        let mut state = self.lock();
        let set = state.disabled_events.entry(client.id).or_default();
        if enable {
            set.remove(&kind);
        } else {
            set.insert(kind);
        }
        Ok(())
    }

    fn request_log_messages(&self, client: &ClientHandle, level: Option<LogLevel>) -> Result<(), HostError> {
        let mut state = self.lock();
        match level {
            Some(level) => state.log_levels.insert(client.id, level),
            None => state.log_levels.remove(&client.id),
        };
        Ok(())
    }

    fn log(&self, client: &ClientHandle, level: LogLevel, text: &str) {
        let mut state = self.lock();
        state.log.push(LogLine {
            client: client.name.clone(),
            level,
            text: text.to_string(),
        });
        // Subscribers other than the author get a copy as a log-message event.
        let subscribers: Vec<ClientId> = state
            .log_levels
            .iter()
            .filter(|(id, max)| **id != client.id && level <= **max)
            .map(|(id, _)| *id)
            .collect();
        for id in subscribers {
            let mut event = HostEvent::log_message(&client.name, level, text);
            event.client = Some(id);
            state.events.push_back(event);
        }
        drop(state);
        self.ready.notify_all();
    }

    fn find_config_file(&self, name: &str) -> Option<PathBuf> {
        self.lock().config_files.get(name).cloned()
    }

    fn define_section(&self, section: InputSection) -> Result<(), HostError> {
        if section.name.is_empty() {
            return Err(HostError::new(HostErrorKind::InvalidParameter));
        }
        self.lock().sections.insert(section.name.clone(), section);
        Ok(())
    }

    fn enable_section(&self, name: &str, flags: u32) -> Result<(), HostError> {
        let mut state = self.lock();
        if !state.sections.contains_key(name) {
            return Err(HostError::new(HostErrorKind::InvalidParameter));
        }
        state.enabled_sections.retain(|(n, _)| n != name);
        state.enabled_sections.push((name.to_string(), flags));
        Ok(())
    }
}

// ── Property conversion ───────────────────────────────────────────────────────

fn read_as(value: &Node, format: Format) -> Result<Node, HostError> {
    let mismatch = || HostError::new(HostErrorKind::PropertyFormat);
    match format {
        Format::None => Ok(Node::None),
        Format::Node => Ok(value.clone()),
        Format::String | Format::OsdString => Ok(Node::String(value.to_text())),
        Format::Flag => match value {
            Node::Flag(b) => Ok(Node::Flag(*b)),
            _ => Err(mismatch()),
        },
        Format::Int64 => match value {
            Node::Int64(i) => Ok(Node::Int64(*i)),
            _ => Err(mismatch()),
        },
        Format::Double => match value {
            Node::Double(d) => Ok(Node::Double(*d)),
            Node::Int64(i) => Ok(Node::Double(*i as f64)),
            _ => Err(mismatch()),
        },
    }
}

/// Convert an incoming value to the declared type of `current`.
fn write_as(current: &Node, format: Format, value: &Node) -> Result<Node, HostError> {
    match (format, value) {
        (Format::String | Format::OsdString, Node::String(s)) => parse_text(current, s),
        (Format::Flag, Node::Flag(_))
        | (Format::Int64, Node::Int64(_))
        | (Format::Double, Node::Double(_))
        | (Format::Node, _) => coerce(current, value),
        _ => Err(HostError::new(HostErrorKind::InvalidParameter)),
    }
}

fn coerce(current: &Node, value: &Node) -> Result<Node, HostError> {
    match (current, value) {
        (Node::None, v) => Ok(v.clone()),
        (Node::Flag(_), Node::Flag(b)) => Ok(Node::Flag(*b)),
        (Node::Int64(_), Node::Int64(i)) => Ok(Node::Int64(*i)),
        (Node::Double(_), Node::Double(d)) => Ok(Node::Double(*d)),
        (Node::Double(_), Node::Int64(i)) => Ok(Node::Double(*i as f64)),
        (Node::Int64(_), Node::Double(d)) if d.fract() == 0.0 => Ok(Node::Int64(*d as i64)),
        (Node::String(_), Node::String(s)) => Ok(Node::String(s.clone())),
        (Node::Array(_), Node::Array(_)) | (Node::Map(_), Node::Map(_)) => Ok(value.clone()),
        (_, Node::String(s)) => parse_text(current, s),
        _ => Err(HostError::new(HostErrorKind::PropertyFormat)),
    }
}

fn parse_text(current: &Node, text: &str) -> Result<Node, HostError> {
    let invalid = || HostError::new(HostErrorKind::PropertyError);
    let text = text.trim();
    match current {
        Node::Flag(_) => match text {
            "yes" | "true" => Ok(Node::Flag(true)),
            "no" | "false" => Ok(Node::Flag(false)),
            _ => Err(invalid()),
        },
        Node::Int64(_) => text.parse().map(Node::Int64).map_err(|_| invalid()),
        Node::Double(_) => text.parse().map(Node::Double).map_err(|_| invalid()),
        Node::None | Node::String(_) => Ok(Node::String(text.to_string())),
        Node::Array(_) | Node::Map(_) => {
            let parsed = Node::parse_json(text).map_err(|_| invalid())?;
            if parsed.tag() == current.tag() {
                Ok(parsed)
            } else {
                Err(invalid())
            }
        }
    }
}

/// Split a command line on whitespace; double quotes group, `\"` escapes.
fn tokenize(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    out.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(host: &MemoryHost, name: &str) -> ClientHandle {
        host.create_client(name).unwrap()
    }

    #[test]
    fn int_property_round_trips_and_coerces_strings() {
        let host = MemoryHost::new().with_property("volume", 100i64);
        let c = client(&host, "a");
        host.set_property(&c, "volume", Format::Int64, &Node::Int64(50)).unwrap();
        assert_eq!(host.get_property(&c, "volume", Format::Int64).unwrap(), Node::Int64(50));

        host.set_property(&c, "volume", Format::String, &Node::from("75")).unwrap();
        assert_eq!(host.property("volume"), Some(Node::Int64(75)));

        let err = host
            .set_property(&c, "volume", Format::String, &Node::from("loud"))
            .unwrap_err();
        assert_eq!(err.kind, HostErrorKind::PropertyError);

        let err = host.get_property(&c, "volume", Format::Flag).unwrap_err();
        assert_eq!(err.kind, HostErrorKind::PropertyFormat);
        let err = host.get_property(&c, "nope", Format::Int64).unwrap_err();
        assert_eq!(err.kind, HostErrorKind::PropertyNotFound);
    }

    #[test]
    fn duplicate_client_names_get_suffixes() {
        let host = MemoryHost::new();
        assert_eq!(client(&host, "osc").name, "osc");
        assert_eq!(client(&host, "osc").name, "osc2");
        assert_eq!(client(&host, "osc").name, "osc3");
    }

    #[test]
    fn observers_get_initial_and_change_events() {
        let host = MemoryHost::new().with_property("pause", false);
        let c = client(&host, "a");
        host.observe_property(&c, 7, "pause", Format::Flag).unwrap();
        let initial = host.wait_event(Duration::ZERO).unwrap();
        assert_eq!(
            initial,
            HostEvent::property_change(c.id, 7, "pause", Format::Flag, Node::Flag(false))
        );

        host.run_string(&c, "cycle pause").unwrap();
        let changed = host.wait_event(Duration::ZERO).unwrap();
        assert_eq!(changed.reply_userdata, 7);
        assert!(matches!(
            changed.payload,
            crate::host::EventPayload::PropertyChange { value: Node::Flag(true), .. }
        ));

        // Setting the same value again is not a change.
        host.set_property(&c, "pause", Format::Flag, &Node::Flag(true)).unwrap();
        assert!(host.wait_event(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn structured_commands_accept_arrays_and_maps() {
        let host = MemoryHost::new().with_property("title", "Song");
        let c = client(&host, "a");
        let out = host
            .run_structured(&c, &Node::argv(["expand-text", "now: ${title}"]))
            .unwrap();
        assert_eq!(out, Node::from("now: Song"));

        let mut map = IndexMap::new();
        map.insert("name".to_string(), Node::from("show-text"));
        map.insert("args".to_string(), Node::argv(["hello"]));
        host.run_structured(&c, &Node::Map(map)).unwrap();
        assert_eq!(host.osd_messages(), vec!["hello".to_string()]);

        let err = host.run_structured(&c, &Node::argv(["frobnicate"])).unwrap_err();
        assert_eq!(err.to_string(), "invalid parameter");
    }

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(
            tokenize(r#"show-text "hello \"big\" world" 2000"#),
            vec!["show-text", r#"hello "big" world"#, "2000"]
        );
        assert_eq!(tokenize(r#"set title """#), vec!["set", "title", ""]);
    }

    #[test]
    fn keypress_runs_binding_from_top_section() {
        let host = MemoryHost::new();
        let c = client(&host, "osc");
        host.define_section(InputSection {
            name: "input_osc".into(),
            location: "script:osc".into(),
            contents: "x script-binding osc/toggle".into(),
            builtin: true,
            owner: "osc".into(),
        })
        .unwrap();
        host.enable_section("input_osc", input_flags::ON_TOP).unwrap();
        host.press_key("x").unwrap();
        let event = host.wait_event(Duration::ZERO).unwrap();
        assert_eq!(
            event,
            HostEvent::client_message(
                Some(c.id),
                vec!["key-binding".into(), "toggle".into(), "p-".into()]
            )
        );
        assert!(host.press_key("y").is_err());
    }

    #[test]
    fn bound_commands_run_as_the_section_owner() {
        let host = MemoryHost::new();
        client(&host, "first");
        client(&host, "owner");
        host.define_section(InputSection {
            name: "input_owner".into(),
            location: "script:owner".into(),
            contents: "p print-text pressed\nk keypress p".into(),
            builtin: false,
            owner: "owner".into(),
        })
        .unwrap();
        host.enable_section("input_owner", input_flags::ON_TOP).unwrap();
        host.press_key("k").unwrap();
        let lines = host.log_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].client, "owner");
        assert_eq!(lines[0].text, "pressed");
    }

    #[test]
    fn self_pressing_binding_stops_at_the_nesting_limit() {
        let host = MemoryHost::new();
        client(&host, "loop");
        host.define_section(InputSection {
            name: "input_loop".into(),
            location: "script:loop".into(),
            contents: "k keypress k".into(),
            builtin: false,
            owner: "loop".into(),
        })
        .unwrap();
        host.enable_section("input_loop", 0).unwrap();
        let err = host.press_key("k").unwrap_err();
        assert!(err.to_string().contains("nest deeper"), "{err}");
        assert_eq!(host.commands().len(), MAX_KEYPRESS_DEPTH);

        // The guard unwinds, so a later press starts from zero again.
        assert!(host.press_key("k").is_err());
        assert_eq!(host.commands().len(), 2 * MAX_KEYPRESS_DEPTH);
    }

    #[test]
    fn log_lines_fan_out_to_other_subscribers() {
        let host = MemoryHost::new();
        let a = client(&host, "a");
        let b = client(&host, "b");
        host.request_log_messages(&b, Some(LogLevel::Info)).unwrap();
        host.request_log_messages(&a, Some(LogLevel::Info)).unwrap();
        host.log(&a, LogLevel::Warn, "careful");
        host.log(&a, LogLevel::Debug, "noise");
        let event = host.wait_event(Duration::ZERO).unwrap();
        assert_eq!(event.client, Some(b.id));
        assert!(host.wait_event(Duration::from_millis(5)).is_none());
        assert_eq!(host.log_lines().len(), 2);
    }
}
