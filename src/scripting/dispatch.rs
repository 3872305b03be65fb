/// `scripting/dispatch.rs` — event loop
///
/// Pulls events from the host and hands each one to the right contexts:
/// broadcasts go to every live context in registration order, targeted
/// events (those carrying a client id) to exactly one. Exactly one context
/// is active while its handler runs. A handler error is logged and never
/// stops delivery to the remaining contexts.
use std::time::{Duration, Instant};

use mlua::{Lua, Result as LuaResult, Table};

use super::{
    codec,
    context::{ContextId, ScriptContext},
    engine::ScriptEngine,
};
use crate::{
    error::ScriptError,
    host::{ClientId, EventKind, EventPayload, HostEvent, LogLevel},
    node::Node,
};

/// Which contexts an event reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<ContextId>,
    pub failed: Vec<ContextId>,
}

/// Build the table passed to `mp.process_event`.
pub fn event_table(lua: &Lua, event: &HostEvent) -> LuaResult<Table> {
    let tbl = lua.create_table()?;
    tbl.set("event", event.kind.name())?;
    tbl.set("id", event.reply_userdata)?;
    match &event.payload {
        EventPayload::None => {}
        EventPayload::ClientMessage { args } => {
            tbl.set("args", codec::decode(lua, &Node::argv(args.iter().cloned()))?)?;
        }
        EventPayload::PropertyChange { name, value, .. } => {
            tbl.set("name", name.as_str())?;
            tbl.set("data", codec::decode(lua, value)?)?;
        }
        EventPayload::LogMessage {
            prefix,
            level,
            text,
        } => {
            tbl.set("prefix", prefix.as_str())?;
            tbl.set("level", level.as_str())?;
            tbl.set("text", text.as_str())?;
        }
    }
    Ok(tbl)
}

impl ScriptEngine {
    /// Block up to `timeout` for the next host event.
    pub fn poll(&self, timeout: Duration) -> Option<HostEvent> {
        self.host.wait_event(timeout)
    }

    /// Deliver one event. A shutdown event reaches every context and then
    /// tears the engine down.
    pub fn dispatch(&mut self, event: &HostEvent) -> DispatchReport {
        let report = match event.client {
            Some(client) if event.kind != EventKind::Shutdown => self.dispatch_targeted(client, event),
            _ => self.dispatch_broadcast(event),
        };
        if event.kind == EventKind::Shutdown {
            self.shutdown();
        }
        report
    }

    fn dispatch_broadcast(&self, event: &HostEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let parked = self.switch.suspend();
        for id in &self.order {
            let Some(ctx) = self.contexts.get(id) else {
                continue;
            };
            if !accepts(ctx, event) {
                continue;
            }
            self.record(ctx, event, &mut report);
        }
        self.switch.resume(parked);
        report
    }

    fn dispatch_targeted(&self, client: ClientId, event: &HostEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let target = self
            .order
            .iter()
            .filter_map(|id| self.contexts.get(id))
            .find(|ctx| ctx.client().id == client);
        let Some(ctx) = target else {
            log::debug!("[dispatch] dropping {} for unknown {client}", event.kind.name());
            return report;
        };
        if event.kind == EventKind::PropertyChange
            && ctx.env.observations().get(event.reply_userdata).is_none()
        {
            log::debug!(
                "[dispatch] {}: stale observation {}",
                ctx.client().name,
                event.reply_userdata
            );
            return report;
        }
        if accepts(ctx, event) {
            self.record(ctx, event, &mut report);
        }
        report
    }

    fn record(&self, ctx: &ScriptContext, event: &HostEvent, report: &mut DispatchReport) {
        let result = self.deliver(ctx, event);
        ctx.env.count_delivery(result.is_ok());
        match result {
            Ok(()) => report.delivered.push(ctx.id()),
            Err(e) => {
                log::error!(
                    "[script:{}] {} handler failed: {e}",
                    ctx.client().name,
                    event.kind.name()
                );
                ctx.env.record_log(LogLevel::Error, &e.to_string());
                report.failed.push(ctx.id());
            }
        }
    }

    fn deliver(&self, ctx: &ScriptContext, event: &HostEvent) -> Result<(), ScriptError> {
        let active = self.switch.activate(ctx.id())?;
        let entry = Self::entry_point(ctx)?;
        let tbl = event_table(&ctx.lua, event)?;
        if let (Some(watchdog), Some(budget)) = (&ctx.watchdog, self.config.handler_timeout()) {
            watchdog.arm(budget);
        }
        let started = Instant::now();
        let result = entry.call::<()>(tbl);
        ctx.env.add_handler_time(started.elapsed());
        if let Some(watchdog) = &ctx.watchdog {
            watchdog.disarm();
        }
        self.switch.deactivate(active);
        result.map_err(ScriptError::from)
    }

    /// Poll and dispatch until a shutdown event arrives or no context is
    /// left. Returns the number of events dispatched.
    pub fn run(&mut self) -> u64 {
        let timeout = self.config.poll_timeout();
        let mut dispatched = 0;
        log::info!("[dispatch] event loop running with {} scripts", self.order.len());
        while !self.shut_down && !self.order.is_empty() {
            let Some(event) = self.poll(timeout) else {
                continue;
            };
            self.dispatch(&event);
            dispatched += 1;
        }
        if !self.shut_down {
            self.shutdown();
        }
        log::info!("[dispatch] event loop stopped after {dispatched} events");
        dispatched
    }

    /// Run the loop on tokio's blocking pool.
    pub fn spawn(mut self) -> tokio::task::JoinHandle<u64> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

/// Event mask and log threshold checks. Shutdown always passes.
fn accepts(ctx: &ScriptContext, event: &HostEvent) -> bool {
    match (&event.kind, &event.payload) {
        (EventKind::Shutdown, _) => true,
        (EventKind::LogMessage, EventPayload::LogMessage { level, .. }) => {
            ctx.env.event_enabled(EventKind::LogMessage)
                && ctx.env.log_threshold().is_some_and(|max| *level <= max)
        }
        (EventKind::LogMessage, _) => false,
        (kind, _) => ctx.env.event_enabled(*kind),
    }
}
