/// `scripting/engine.rs` — script context lifecycle
///
/// `ScriptEngine` owns every script context. Each script gets its own Lua VM
/// and host client, then walks
/// `Requested → ContextCreated → BootstrapLoaded → UserCodeLoaded → Running`.
/// A failure at any step discards that script alone; siblings keep running.
/// Contexts are addressed by stable `ContextId`; `order` keeps registration
/// order for broadcasts and teardown.
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use mlua::{Function, Table, Value};
use serde::Serialize;
use thiserror::Error;

use super::{
    api::register_all,
    builtin,
    context::{ContextEnv, ContextId, ContextSwitch, ScriptContext, ScriptLogEntry, ScriptStats},
    sandbox::{create_sandboxed_vm, Watchdog},
};
use crate::{config::ScriptingConfig, error::ScriptError, host::Host};

// ── Load stages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStage {
    Requested,
    ContextCreated,
    BootstrapLoaded,
    UserCodeLoaded,
    Running,
    Unloaded,
    Discarded,
}

impl LoadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadStage::Requested => "requested",
            LoadStage::ContextCreated => "context-created",
            LoadStage::BootstrapLoaded => "bootstrap-loaded",
            LoadStage::UserCodeLoaded => "user-code-loaded",
            LoadStage::Running => "running",
            LoadStage::Unloaded => "unloaded",
            LoadStage::Discarded => "discarded",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LoadStage::Unloaded | LoadStage::Discarded)
    }
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// A script that failed to load. `stage` is the last stage it reached.
#[derive(Debug, Error)]
#[error("script {client} ({}) discarded at stage {stage}: {error}", path.display())]
pub struct Discarded {
    pub path: PathBuf,
    pub client: String,
    pub stage: LoadStage,
    #[source]
    pub error: ScriptError,
}

#[derive(Debug, Default)]
pub struct StartupReport {
    pub loaded: Vec<ContextId>,
    pub discarded: Vec<Discarded>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptInfo {
    /// Position among live scripts, contiguous from 0.
    pub index: usize,
    pub id: ContextId,
    pub client_name: String,
    pub path: PathBuf,
}

// ── ScriptEngine ──────────────────────────────────────────────────────────────

pub struct ScriptEngine {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) config: ScriptingConfig,
    pub(crate) switch: ContextSwitch,
    pub(crate) contexts: HashMap<ContextId, ScriptContext>,
    pub(crate) order: Vec<ContextId>,
    next_id: u64,
    pub(crate) shut_down: bool,
}

impl ScriptEngine {
    /// Fails with `ScriptError::Bootstrap` if a builtin module does not compile.
    pub fn new(host: Arc<dyn Host>, config: ScriptingConfig) -> Result<Self, ScriptError> {
        builtin::verify()?;
        log::debug!(
            "[engine] builtins verified ({} modules), trust={:?}",
            builtin::BUILTIN_MODULES.len(),
            config.trust
        );
        Ok(Self {
            host,
            config,
            switch: ContextSwitch::default(),
            contexts: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
            shut_down: false,
        })
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // ── Startup ───────────────────────────────────────────────────────────

    /// Load every path in order. Individual failures are reported and
    /// skipped; if every requested script fails the engine tears down and
    /// returns `AllScriptsFailed`.
    pub fn start<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<StartupReport, ScriptError> {
        let mut report = StartupReport::default();
        for path in paths {
            match self.load_script(path.as_ref()) {
                Ok(id) => report.loaded.push(id),
                Err(discarded) => report.discarded.push(discarded),
            }
        }
        if !paths.is_empty() && report.loaded.is_empty() {
            log::error!("[engine] all {} requested scripts failed to load", paths.len());
            self.shutdown();
            return Err(ScriptError::AllScriptsFailed(paths.len()));
        }
        log::info!(
            "[engine] started {} scripts ({} discarded)",
            report.loaded.len(),
            report.discarded.len()
        );
        Ok(report)
    }

    /// `start` with the paths listed in the config.
    pub fn start_configured(&mut self) -> Result<StartupReport, ScriptError> {
        let paths = self.config.scripts.clone();
        self.start(&paths)
    }

    /// Create, bootstrap, load and validate one script.
    pub fn load_script(&mut self, path: &Path) -> Result<ContextId, Discarded> {
        let mut ctx = self.create_context(path).map_err(|error| {
            let discarded = Discarded {
                path: path.to_path_buf(),
                client: client_name_for(path),
                stage: LoadStage::Requested,
                error,
            };
            log::error!("[engine] {discarded}");
            discarded
        })?;

        let loaded = self
            .load_bootstrap(&mut ctx)
            .and_then(|_| self.load_user_script(&mut ctx))
            .and_then(|_| self.validate(&ctx))
            .and_then(|_| self.finish(&mut ctx));

        match loaded {
            Ok(()) => {
                let id = ctx.id();
                log::info!(
                    "[engine] loaded {} as {} ({})",
                    ctx.filename().display(),
                    ctx.client().name,
                    id
                );
                self.contexts.insert(id, ctx);
                self.order.push(id);
                Ok(id)
            }
            Err(error) => Err(self.discard(ctx, error)),
        }
    }

    pub fn create_context(&mut self, path: &Path) -> Result<ScriptContext, ScriptError> {
        let id = ContextId(self.next_id);
        self.next_id += 1;

        let client = self
            .host
            .create_client(&client_name_for(path))
            .map_err(ScriptError::command)?;
        let env = Arc::new(ContextEnv::new(
            id,
            client,
            path,
            Arc::clone(&self.host),
            self.switch.clone(),
            self.config.log_buffer_limit,
        ));

        let built = create_sandboxed_vm(self.config.trust).and_then(|lua| {
            register_all(&lua, Arc::clone(&env))?;
            let watchdog = match self.config.handler_timeout() {
                Some(_) => Some(Watchdog::install(&lua)?),
                None => None,
            };
            Ok((lua, watchdog))
        });
        let (lua, watchdog) = match built {
            Ok(built) => built,
            Err(e) => {
                self.host.destroy_client(&env.client);
                return Err(e.into());
            }
        };

        Ok(ScriptContext {
            lua,
            env,
            watchdog,
            stage: LoadStage::ContextCreated,
        })
    }

    pub fn load_bootstrap(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        let _active = self.switch.activate(ctx.id())?;
        builtin::run(&ctx.lua, builtin::DEFAULTS)?;
        ctx.stage = LoadStage::BootstrapLoaded;
        Ok(())
    }

    /// Directories load the `main.lua` inside them.
    pub fn load_user_script(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        let mut path = ctx.filename().to_path_buf();
        if path.is_dir() {
            path = path.join("main.lua");
        }
        if !path.is_file() {
            return Err(ScriptError::NotFound(path.display().to_string()));
        }
        let source = std::fs::read(&path).map_err(|e| ScriptError::Load {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let _active = self.switch.activate(ctx.id())?;
        if let (Some(watchdog), Some(budget)) = (&ctx.watchdog, self.config.handler_timeout()) {
            watchdog.arm(budget);
        }
        let result = ctx
            .lua
            .load(&source[..])
            .set_name(format!("@{}", path.display()))
            .exec();
        if let Some(watchdog) = &ctx.watchdog {
            watchdog.disarm();
        }
        result.map_err(|e| ScriptError::Load {
            path,
            message: e.to_string(),
        })?;
        ctx.stage = LoadStage::UserCodeLoaded;
        Ok(())
    }

    /// The dispatch loop needs `mp.process_event` to be callable.
    pub fn validate(&self, ctx: &ScriptContext) -> Result<(), ScriptError> {
        let contract = || ScriptError::Contract {
            path: ctx.filename().to_path_buf(),
        };
        let mp = match ctx.lua.globals().get::<Value>("mp")? {
            Value::Table(t) => t,
            _ => return Err(contract()),
        };
        match mp.get::<Value>("process_event")? {
            Value::Function(_) => Ok(()),
            _ => Err(contract()),
        }
    }

    fn finish(&self, ctx: &mut ScriptContext) -> Result<(), ScriptError> {
        let _active = self.switch.activate(ctx.id())?;
        builtin::run(&ctx.lua, builtin::FINISH).map_err(|e| ScriptError::Load {
            path: ctx.filename().to_path_buf(),
            message: e.to_string(),
        })?;
        ctx.stage = LoadStage::Running;
        Ok(())
    }

    fn discard(&self, mut ctx: ScriptContext, error: ScriptError) -> Discarded {
        let discarded = Discarded {
            path: ctx.filename().to_path_buf(),
            client: ctx.client().name.clone(),
            stage: ctx.stage,
            error,
        };
        log::error!("[engine] {discarded}");
        ctx.stage = LoadStage::Discarded;
        self.release(ctx);
        discarded
    }

    /// Drop host-side registrations, then the client, then the VM.
    fn release(&self, ctx: ScriptContext) {
        let ids = ctx.env.observations().ids();
        for id in ids {
            ctx.env.observations().remove(id);
            if let Err(e) = self.host.unobserve_property(&ctx.env.client, id) {
                log::debug!("[engine] {}: unobserve {id}: {e}", ctx.client().name);
            }
        }
        self.host.destroy_client(&ctx.env.client);
        log::debug!("[engine] released {} at stage {}", ctx.client().name, ctx.stage);
        drop(ctx);
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    pub fn unload(&mut self, id: ContextId) -> Result<(), ScriptError> {
        let mut ctx = self
            .contexts
            .remove(&id)
            .ok_or(ScriptError::UnknownContext(id))?;
        self.order.retain(|live| *live != id);
        log::info!("[engine] unloading {} ({id})", ctx.client().name);
        ctx.stage = LoadStage::Unloaded;
        self.release(ctx);
        Ok(())
    }

    /// Deactivate whatever is active, then release every context in
    /// registration order. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(active) = self.switch.suspend() {
            log::warn!("[engine] shutdown while {active} was active");
        }
        let order = std::mem::take(&mut self.order);
        if !order.is_empty() {
            log::info!("[engine] shutting down {} scripts", order.len());
        }
        for id in order {
            if let Some(mut ctx) = self.contexts.remove(&id) {
                ctx.stage = LoadStage::Unloaded;
                self.release(ctx);
            }
        }
        self.shut_down = true;
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn live(&self) -> Vec<ScriptInfo> {
        self.order
            .iter()
            .filter_map(|id| self.contexts.get(id))
            .enumerate()
            .map(|(index, ctx)| ScriptInfo {
                index,
                id: ctx.id(),
                client_name: ctx.client().name.clone(),
                path: ctx.filename().to_path_buf(),
            })
            .collect()
    }

    pub fn context(&self, id: ContextId) -> Option<&ScriptContext> {
        self.contexts.get(&id)
    }

    pub fn script_log(&self, id: ContextId, limit: usize) -> Result<Vec<ScriptLogEntry>, ScriptError> {
        self.contexts
            .get(&id)
            .map(|ctx| ctx.env.log_tail(limit))
            .ok_or(ScriptError::UnknownContext(id))
    }

    pub fn stats(&self, id: ContextId) -> Result<ScriptStats, ScriptError> {
        self.contexts
            .get(&id)
            .map(|ctx| ctx.env.stats())
            .ok_or(ScriptError::UnknownContext(id))
    }

    /// Run `f` with context `id` active.
    pub fn with_context<R>(
        &self,
        id: ContextId,
        f: impl FnOnce(&ScriptContext) -> R,
    ) -> Result<R, ScriptError> {
        let ctx = self.contexts.get(&id).ok_or(ScriptError::UnknownContext(id))?;
        let _active = self.switch.activate(id)?;
        Ok(f(ctx))
    }

    /// The context's `mp.process_event`.
    pub(crate) fn entry_point(ctx: &ScriptContext) -> Result<Function, ScriptError> {
        let mp: Table = ctx.lua.globals().get("mp")?;
        Ok(mp.get::<Function>("process_event")?)
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shutdown();
        }
    }
}

/// File stem, or the directory name for directory scripts.
fn client_name_for(path: &Path) -> String {
    let name = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    name.map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "script".to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::host::memory::MemoryHost;

    fn write(dir: &Path, name: &str, src: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, src).unwrap();
        path
    }

    fn engine(host: &Arc<MemoryHost>) -> ScriptEngine {
        ScriptEngine::new(host.clone(), ScriptingConfig::default()).unwrap()
    }

    #[test]
    fn missing_script_is_discarded_and_survivors_are_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.lua", "");
        let c = write(dir.path(), "c.lua", "");
        let missing = dir.path().join("b.lua");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);

        let report = engine.start(&[a.clone(), missing.clone(), c.clone()]).unwrap();
        assert_eq!(report.loaded.len(), 2);
        assert_eq!(report.discarded.len(), 1);
        let discarded = &report.discarded[0];
        assert_eq!(discarded.path, missing);
        assert_eq!(discarded.stage, LoadStage::BootstrapLoaded);
        assert!(matches!(discarded.error, ScriptError::NotFound(_)));
        assert!(discarded.to_string().contains("b.lua"));

        let live = engine.live();
        assert_eq!(live.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(live[0].path, a);
        assert_eq!(live[1].path, c);
        assert_eq!(host.clients(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(host.destroyed_clients(), vec!["b".to_string()]);
    }

    #[test]
    fn every_script_failing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write(dir.path(), "broken.lua", "this is not lua");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);

        let err = engine
            .start(&[broken, dir.path().join("gone.lua")])
            .unwrap_err();
        assert!(matches!(err, ScriptError::AllScriptsFailed(2)));
        assert!(engine.live().is_empty());
        assert!(engine.is_shut_down());
        assert!(host.clients().is_empty());
    }

    #[test]
    fn stages_are_reported_per_failure() {
        let dir = tempfile::tempdir().unwrap();
        let syntax = write(dir.path(), "syntax.lua", "local x = ");
        let raising = write(dir.path(), "raising.lua", "error('boom at load')");
        let no_entry = write(dir.path(), "no_entry.lua", "mp = nil");
        let ok = write(dir.path(), "ok.lua", "");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);

        let report = engine.start(&[syntax, raising, no_entry, ok]).unwrap();
        assert_eq!(report.loaded.len(), 1);
        let kinds: Vec<_> = report
            .discarded
            .iter()
            .map(|d| (d.client.as_str(), d.stage))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("syntax", LoadStage::BootstrapLoaded),
                ("raising", LoadStage::BootstrapLoaded),
                ("no_entry", LoadStage::UserCodeLoaded),
            ]
        );
        assert!(matches!(report.discarded[0].error, ScriptError::Load { .. }));
        assert!(report.discarded[1].error.to_string().contains("boom at load"));
        assert!(matches!(report.discarded[2].error, ScriptError::Contract { .. }));
    }

    #[test]
    fn directory_scripts_load_main_lua() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("osc");
        fs::create_dir(&pkg).unwrap();
        write(&pkg, "main.lua", "mp.msg.info('hello from', mp.get_script_name())");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);

        engine.start(&[pkg]).unwrap();
        assert_eq!(engine.live()[0].client_name, "osc");
        let lines = host.log_lines();
        assert_eq!(lines[0].text, "hello from osc");
    }

    #[test]
    fn contexts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.lua", "shared = 'from a'; string.secret = 1");
        let b = write(dir.path(), "b.lua", "");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);
        let report = engine.start(&[a, b]).unwrap();

        let (seen, secret): (Option<String>, Option<i64>) = engine
            .with_context(report.loaded[1], |ctx| {
                ctx.lua()
                    .load("return shared, string.secret")
                    .eval()
                    .unwrap()
            })
            .unwrap();
        assert_eq!(seen, None);
        assert_eq!(secret, None);
    }

    #[test]
    fn with_context_refuses_nested_activation() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.lua", "");
        let host = Arc::new(MemoryHost::new());
        let mut engine = engine(&host);
        let id = engine.start(&[a]).unwrap().loaded[0];

        let nested = engine
            .with_context(id, |_| engine.with_context(id, |_| ()))
            .unwrap();
        assert!(matches!(nested, Err(ScriptError::Reentrant { .. })));
        assert!(matches!(
            engine.with_context(ContextId(99), |_| ()),
            Err(ScriptError::UnknownContext(ContextId(99)))
        ));
    }

    #[test]
    fn unload_and_shutdown_release_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = ["one", "two", "three"]
            .iter()
            .map(|n| {
                write(
                    dir.path(),
                    &format!("{n}.lua"),
                    "mp.observe_property('pause', 'flag', function() end)",
                )
            })
            .collect();
        let host = Arc::new(MemoryHost::new().with_property("pause", false));
        let mut engine = engine(&host);
        let report = engine.start(&paths).unwrap();
        assert_eq!(host.observers().len(), 3);

        engine.unload(report.loaded[1]).unwrap();
        assert!(matches!(
            engine.unload(report.loaded[1]),
            Err(ScriptError::UnknownContext(_))
        ));
        assert_eq!(engine.live().len(), 2);
        assert_eq!(engine.live()[1].index, 1);

        engine.shutdown();
        assert_eq!(
            host.destroyed_clients(),
            vec!["two".to_string(), "one".to_string(), "three".to_string()]
        );
        assert!(host.observers().is_empty());
        engine.shutdown();
    }

    #[test]
    fn script_log_keeps_the_newest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.lua", "for i = 1, 5 do mp.msg.warn('line', i) end");
        let host = Arc::new(MemoryHost::new());
        let config = ScriptingConfig {
            log_buffer_limit: 3,
            ..ScriptingConfig::default()
        };
        let mut engine = ScriptEngine::new(host.clone(), config).unwrap();
        let id = engine.start(&[a]).unwrap().loaded[0];

        let tail = engine.script_log(id, 10).unwrap();
        let messages: Vec<_> = tail.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["line 3", "line 4", "line 5"]);
        assert_eq!(engine.script_log(id, 1).unwrap()[0].message, "line 5");
    }

    #[test]
    fn runaway_top_level_code_is_stopped_by_the_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let spin = write(dir.path(), "spin.lua", "while true do end");
        let ok = write(dir.path(), "ok.lua", "");
        let host = Arc::new(MemoryHost::new());
        let config = ScriptingConfig {
            handler_timeout_ms: Some(50),
            ..ScriptingConfig::default()
        };
        let mut engine = ScriptEngine::new(host.clone(), config).unwrap();
        let report = engine.start(&[spin, ok]).unwrap();
        assert_eq!(report.loaded.len(), 1);
        assert!(report.discarded[0].error.to_string().contains("watchdog"));
    }

    #[test]
    fn caught_watchdog_errors_still_discard_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let spin = write(
            dir.path(),
            "spin.lua",
            "local n = 0 while n < 2000 do pcall(function() while true do end end) n = n + 1 end",
        );
        let host = Arc::new(MemoryHost::new());
        let config = ScriptingConfig {
            handler_timeout_ms: Some(20),
            ..ScriptingConfig::default()
        };
        let mut engine = ScriptEngine::new(host.clone(), config).unwrap();
        let err = engine.load_script(&spin).unwrap_err();
        assert!(err.to_string().contains("watchdog"), "{err}");
        assert!(engine.live().is_empty());
    }

    #[test]
    fn prelude_observers_skip_ids_taken_directly() {
        let dir = tempfile::tempdir().unwrap();
        let script = write(
            dir.path(),
            "obs.lua",
            r#"
            assert(host.observe_property("pause", "flag", 1))
            assert(host.observe_property("pause", "flag", 3))
            first = mp.observe_property("pause", "flag", function() end)
            second = mp.observe_property("pause", "flag", function() end)
            third = mp.observe_property("pause", "flag", function() end)
            "#,
        );
        let host = Arc::new(MemoryHost::new().with_property("pause", false));
        let mut engine = engine(&host);
        let id = engine.load_script(&script).unwrap();
        let ids: (u64, u64, u64) = engine
            .with_context(id, |ctx| {
                ctx.lua().load("return first, second, third").eval().unwrap()
            })
            .unwrap();
        assert_eq!(ids, (2, 4, 5));
        assert_eq!(host.observers().len(), 5);
    }
}
