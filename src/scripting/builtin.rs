/// `scripting/builtin.rs` — prelude sources compiled into the crate
///
/// Read-only for the life of the process; shared by every context without
/// locking.
use mlua::Lua;

use super::sandbox::{create_sandboxed_vm, TrustLevel};
use crate::error::ScriptError;

pub const DEFAULTS: &str = "@/defaults.lua";
pub const FINISH: &str = "@/finish.lua";

/// Virtual module name → source text.
pub static BUILTIN_MODULES: &[(&str, &str)] = &[
    (DEFAULTS, include_str!("lua/defaults.lua")),
    (FINISH, include_str!("lua/finish.lua")),
];

pub fn source(name: &str) -> Option<&'static str> {
    BUILTIN_MODULES
        .iter()
        .find(|(module, _)| *module == name)
        .map(|(_, src)| *src)
}

/// Compile every builtin module in a throwaway VM.
pub fn verify() -> Result<(), ScriptError> {
    let lua = create_sandboxed_vm(TrustLevel::Basic)?;
    for &(module, src) in BUILTIN_MODULES {
        lua.load(src)
            .set_name(module)
            .into_function()
            .map_err(|e| ScriptError::Bootstrap {
                module,
                message: e.to_string(),
            })?;
    }
    Ok(())
}

/// Run builtin `module` inside `lua`.
pub fn run(lua: &Lua, module: &'static str) -> Result<(), ScriptError> {
    let src = source(module).ok_or_else(|| ScriptError::Bootstrap {
        module,
        message: "no such builtin module".to_string(),
    })?;
    lua.load(src)
        .set_name(module)
        .exec()
        .map_err(|e| ScriptError::Bootstrap {
            module,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_compile() {
        verify().unwrap();
        assert!(source(DEFAULTS).unwrap().contains("process_event"));
        assert!(source("@/missing.lua").is_none());
    }

    #[test]
    fn unknown_module_is_a_bootstrap_error() {
        let lua = Lua::new();
        let err = run(&lua, "@/missing.lua").unwrap_err();
        assert!(matches!(err, ScriptError::Bootstrap { module: "@/missing.lua", .. }));
    }
}
