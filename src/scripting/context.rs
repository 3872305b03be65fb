/// `scripting/context.rs` — per-script state and context activation
///
/// A `ScriptContext` owns one Lua VM plus the environment record its host
/// bindings close over. Only one context may be active at a time; the
/// `ContextSwitch` enforces that and every binding checks it before touching
/// the host.
use std::{
    collections::{HashSet, VecDeque},
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;
use mlua::Lua;
use serde::Serialize;

use super::{engine::LoadStage, sandbox::Watchdog};
use crate::{
    error::ScriptError,
    host::{ClientHandle, EventKind, Host, LogLevel},
    node::Format,
};

/// Stable identifier of a script context. Never reused within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Activation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ContextSwitch {
    active: Arc<Mutex<Option<ContextId>>>,
}

impl ContextSwitch {
    pub fn current(&self) -> Option<ContextId> {
        *lock(&self.active)
    }

    /// Make `id` the active context. Fails if another context is active.
    pub fn activate(&self, id: ContextId) -> Result<ActiveContextHandle, ScriptError> {
        let mut active = lock(&self.active);
        if let Some(current) = *active {
            return Err(ScriptError::Reentrant {
                active: current,
                requested: id,
            });
        }
        *active = Some(id);
        Ok(ActiveContextHandle {
            id,
            switch: self.clone(),
        })
    }

    pub fn deactivate(&self, handle: ActiveContextHandle) -> ContextId {
        handle.id
    }

    pub fn ensure_active(&self, id: ContextId) -> Result<(), ScriptError> {
        if self.current() == Some(id) {
            Ok(())
        } else {
            Err(ScriptError::InactiveContext(id))
        }
    }

    /// Park whatever is active so a broadcast can cycle through contexts.
    pub(crate) fn suspend(&self) -> Option<ContextId> {
        lock(&self.active).take()
    }

    pub(crate) fn resume(&self, previous: Option<ContextId>) {
        *lock(&self.active) = previous;
    }
}

/// Proof that a context is active. Dropping it deactivates the context.
#[must_use = "dropping the handle deactivates the context immediately"]
#[derive(Debug)]
pub struct ActiveContextHandle {
    id: ContextId,
    switch: ContextSwitch,
}

impl ActiveContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Drop for ActiveContextHandle {
    fn drop(&mut self) {
        let mut active = lock(&self.switch.active);
        if *active == Some(self.id) {
            *active = None;
        }
    }
}

// ── Observation registry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub name: String,
    pub format: Format,
}

/// Caller-assigned observation ids for one context, in registration order.
#[derive(Debug, Default)]
pub struct ObservationRegistry {
    entries: IndexMap<u64, Observation>,
}

impl ObservationRegistry {
    pub fn insert(&mut self, id: u64, name: &str, format: Format) -> Result<(), ScriptError> {
        if self.entries.contains_key(&id) {
            return Err(ScriptError::DuplicateObservation(id));
        }
        self.entries.insert(
            id,
            Observation {
                name: name.to_string(),
                format,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Observation> {
        self.entries.shift_remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Observation> {
        self.entries.get(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Environment record ────────────────────────────────────────────────────────

/// Per-script log output (host.log calls), newest last.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: i64,
}

/// Fixed per-context environment shared by the context's host bindings.
/// Running totals for one script's event handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScriptStats {
    pub events_delivered: u64,
    pub handler_failures: u64,
    /// Wall time spent inside `mp.process_event`.
    pub handler_time: Duration,
}

pub struct ContextEnv {
    pub id: ContextId,
    pub client: ClientHandle,
    pub filename: PathBuf,
    pub host: Arc<dyn Host>,
    pub switch: ContextSwitch,
    observations: Mutex<ObservationRegistry>,
    disabled_events: Mutex<HashSet<EventKind>>,
    log_threshold: Mutex<Option<LogLevel>>,
    log: Mutex<VecDeque<ScriptLogEntry>>,
    log_limit: usize,
    stats: Mutex<ScriptStats>,
}

impl ContextEnv {
    pub fn new(
        id: ContextId,
        client: ClientHandle,
        filename: &Path,
        host: Arc<dyn Host>,
        switch: ContextSwitch,
        log_limit: usize,
    ) -> Self {
        Self {
            id,
            client,
            filename: filename.to_path_buf(),
            host,
            switch,
            observations: Mutex::new(ObservationRegistry::default()),
            disabled_events: Mutex::new(HashSet::new()),
            log_threshold: Mutex::new(None),
            log: Mutex::new(VecDeque::new()),
            log_limit,
            stats: Mutex::new(ScriptStats::default()),
        }
    }

    pub fn ensure_active(&self) -> Result<(), ScriptError> {
        self.switch.ensure_active(self.id)
    }

    pub fn observations(&self) -> MutexGuard<'_, ObservationRegistry> {
        lock(&self.observations)
    }

    pub fn event_enabled(&self, kind: EventKind) -> bool {
        !lock(&self.disabled_events).contains(&kind)
    }

    pub fn set_event_enabled(&self, kind: EventKind, enable: bool) {
        let mut disabled = lock(&self.disabled_events);
        if enable {
            disabled.remove(&kind);
        } else {
            disabled.insert(kind);
        }
    }

    pub fn log_threshold(&self) -> Option<LogLevel> {
        *lock(&self.log_threshold)
    }

    pub fn set_log_threshold(&self, level: Option<LogLevel>) {
        *lock(&self.log_threshold) = level;
    }

    pub fn record_log(&self, level: LogLevel, message: &str) {
        let mut log = lock(&self.log);
        log.push_back(ScriptLogEntry {
            level,
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        while log.len() > self.log_limit {
            log.pop_front();
        }
    }

    pub fn stats(&self) -> ScriptStats {
        *lock(&self.stats)
    }

    pub fn add_handler_time(&self, elapsed: Duration) {
        lock(&self.stats).handler_time += elapsed;
    }

    pub fn count_delivery(&self, ok: bool) {
        let mut stats = lock(&self.stats);
        if ok {
            stats.events_delivered += 1;
        } else {
            stats.handler_failures += 1;
        }
    }

    pub fn log_tail(&self, limit: usize) -> Vec<ScriptLogEntry> {
        let log = lock(&self.log);
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }
}

// ── Script context ────────────────────────────────────────────────────────────

pub struct ScriptContext {
    pub(crate) lua: Lua,
    pub(crate) env: Arc<ContextEnv>,
    pub(crate) watchdog: Option<Watchdog>,
    pub(crate) stage: LoadStage,
}

impl ScriptContext {
    pub fn id(&self) -> ContextId {
        self.env.id
    }

    pub fn client(&self) -> &ClientHandle {
        &self.env.client
    }

    pub fn filename(&self) -> &Path {
        &self.env.filename
    }

    pub fn stage(&self) -> LoadStage {
        self.stage
    }

    pub fn env(&self) -> &ContextEnv {
        &self.env
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("id", &self.env.id)
            .field("client", &self.env.client.name)
            .field("filename", &self.env.filename)
            .field("stage", &self.stage)
            .finish()
    }
}
