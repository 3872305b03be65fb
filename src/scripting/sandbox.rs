/// `scripting/sandbox.rs` — Lua VM construction per script
///
/// Every script context gets its own VM created here. The trust level picks
/// the standard libraries; `debug` and `ffi` are never loaded.
/// An optional watchdog aborts handlers that run past a deadline.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use mlua::{HookTriggers, Lua, LuaOptions, Result as LuaResult, StdLib, VmState};
use serde::{Deserialize, Serialize};

/// Controls which Lua standard libraries are available to a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// string, table, math, utf8, coroutine; no I/O or OS
    #[default]
    Basic,
    /// Basic + io (scripts reading their own data files)
    FileRead,
    /// Basic + io, os and package (`require`)
    Elevated,
}

impl TrustLevel {
    pub fn libs(self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::FileRead => basic | StdLib::IO,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS | StdLib::PACKAGE,
        }
    }
}

/// Creates a new Lua VM with sandbox restrictions applied.
pub fn create_sandboxed_vm(trust: TrustLevel) -> LuaResult<Lua> {
    Lua::new_with(trust.libs(), LuaOptions::default())
}

// ── Watchdog ──────────────────────────────────────────────────────────────────

const WATCHDOG_INSTRUCTIONS: u32 = 10_000;
const WATCHDOG_MESSAGE: &str = "watchdog: handler exceeded its time budget";

/// Rewraps the protected-call primitives so a caught watchdog error is raised
/// again as soon as the protected call returns.
const GUARD_PROTECTED_CALLS: &str = r#"
local expired, message = ...
local pack, unpack = table.pack, table.unpack
local function guard(protected)
    return function(...)
        local results = pack(protected(...))
        if expired() then error(message, 0) end
        return unpack(results, 1, results.n)
    end
end
pcall = guard(pcall)
xpcall = guard(xpcall)
if coroutine then coroutine.resume = guard(coroutine.resume) end
"#;

/// Deadline shared between the dispatcher and a VM's instruction hook.
///
/// Expiry is sticky: once the deadline passes, every protected call in the VM
/// re-raises the watchdog error until `disarm`.
#[derive(Debug, Clone, Default)]
pub struct Watchdog {
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl Watchdog {
    /// Install the hook and the protected-call guards on `lua`. Until `arm`
    /// is called both are no-ops.
    pub fn install(lua: &Lua) -> LuaResult<Self> {
        let watchdog = Watchdog::default();

        let hooked = watchdog.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(WATCHDOG_INSTRUCTIONS),
            move |_lua, _debug| {
                if hooked.expired() {
                    return Err(mlua::Error::RuntimeError(WATCHDOG_MESSAGE.to_string()));
                }
                Ok(VmState::Continue)
            },
        );

        let polled = watchdog.clone();
        let expired = lua.create_function(move |_, ()| Ok(polled.expired()))?;
        lua.load(GUARD_PROTECTED_CALLS)
            .set_name("=watchdog")
            .call::<()>((expired, WATCHDOG_MESSAGE))?;
        Ok(watchdog)
    }

    pub fn arm(&self, budget: Duration) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + budget);
    }

    pub fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn expired(&self) -> bool {
        matches!(
            *self.deadline.lock().unwrap_or_else(PoisonError::into_inner),
            Some(d) if Instant::now() >= d
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_trust_has_no_io_or_os() {
        let lua = create_sandboxed_vm(TrustLevel::Basic).unwrap();
        let (io, os, string): (bool, bool, bool) = lua
            .load("return io ~= nil, os ~= nil, string ~= nil")
            .eval()
            .unwrap();
        assert!(!io && !os && string);
    }

    #[test]
    fn elevated_trust_loads_os_and_require() {
        let lua = create_sandboxed_vm(TrustLevel::Elevated).unwrap();
        let (os, require): (bool, bool) = lua
            .load("return os ~= nil, require ~= nil")
            .eval()
            .unwrap();
        assert!(os && require);
    }

    #[test]
    fn armed_watchdog_stops_runaway_loop() {
        let lua = create_sandboxed_vm(TrustLevel::Basic).unwrap();
        let watchdog = Watchdog::install(&lua).unwrap();
        watchdog.arm(Duration::from_millis(20));
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(err.to_string().contains("watchdog"), "{err}");
        watchdog.disarm();
        lua.load("for i = 1, 100000 do end").exec().unwrap();
    }

    #[test]
    fn protected_calls_cannot_swallow_an_expired_budget() {
        let lua = create_sandboxed_vm(TrustLevel::Basic).unwrap();
        let watchdog = Watchdog::install(&lua).unwrap();
        let spin = r#"
            local n = 0
            while n < 2000 do
                pcall(function() while true do end end)
                n = n + 1
            end
            return n
        "#;
        watchdog.arm(Duration::from_millis(20));
        let err = lua.load(spin).eval::<i64>().unwrap_err();
        assert!(err.to_string().contains("watchdog"), "{err}");

        watchdog.arm(Duration::from_millis(20));
        let err = lua
            .load("return xpcall(function() while true do end end, function(e) return e end)")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("watchdog"), "{err}");

        watchdog.arm(Duration::from_millis(20));
        let err = lua
            .load("return coroutine.resume(coroutine.create(function() while true do end end))")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("watchdog"), "{err}");
        watchdog.disarm();
    }

    #[test]
    fn guarded_pcall_still_reports_ordinary_errors() {
        let lua = create_sandboxed_vm(TrustLevel::Basic).unwrap();
        let watchdog = Watchdog::install(&lua).unwrap();
        watchdog.arm(Duration::from_secs(60));
        let (ok, msg, extra): (bool, String, Option<i64>) = lua
            .load("local ok, e = pcall(error, 'boom', 0) ; return ok, e, select('#', pcall(function() return 1, nil end))")
            .eval()
            .unwrap();
        assert!(!ok);
        assert_eq!(msg, "boom");
        assert_eq!(extra, Some(3));
        watchdog.disarm();
    }
}
