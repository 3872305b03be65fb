/// `scripting/api.rs` — registers the `host` global table
///
/// Provides the host-binding surface to each script VM:
///   commands, properties, observation, events, log, config lookup,
///   input sections, JSON utils
///
/// Every function that reaches the host first checks that its context is the
/// active one. Failures are raised as Lua errors carrying the `ScriptError`.
use std::sync::Arc;

use mlua::{
    FromLuaMulti, Function, IntoLuaMulti, Lua, Result as LuaResult, Table, Value, Variadic,
};

use super::{codec, context::ContextEnv};
use crate::{
    error::{CodecError, ScriptError},
    host::{EventKind, InputSection, LogLevel},
    node::{Format, Node},
};

fn raise(err: impl Into<ScriptError>) -> mlua::Error {
    mlua::Error::external(err.into())
}

/// Wrap a binding so it only runs while its context is active.
fn bind<A, R, F>(lua: &Lua, env: &Arc<ContextEnv>, f: F) -> LuaResult<Function>
where
    A: FromLuaMulti,
    R: IntoLuaMulti,
    F: Fn(&Lua, &ContextEnv, A) -> LuaResult<R> + Send + 'static,
{
    let env = Arc::clone(env);
    lua.create_function(move |lua, args: A| {
        env.ensure_active().map_err(raise)?;
        f(lua, &env, args)
    })
}

/// Register the binding table as the global `host` on `lua`.
pub fn register_all(lua: &Lua, env: Arc<ContextEnv>) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    tbl.set("client_name", env.client.name.as_str())?;
    tbl.set("filename", env.filename.to_string_lossy().as_ref())?;
    tbl.set("null", Value::NULL)?;

    register_commands(lua, &env, &tbl)?;
    register_properties(lua, &env, &tbl)?;
    register_events(lua, &env, &tbl)?;
    register_log(lua, &env, &tbl)?;
    register_input(lua, &env, &tbl)?;
    register_utils(lua, &tbl)?;

    lua.globals().set("host", tbl)?;
    Ok(())
}

// ── commands ──────────────────────────────────────────────────────────────────

fn register_commands(lua: &Lua, env: &Arc<ContextEnv>, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "command",
        bind(lua, env, |lua, env, value: Value| {
            if !matches!(value, Value::Table(_)) {
                return Err(raise(ScriptError::BadArgument(format!(
                    "command expects a table, got {}",
                    value.type_name()
                ))));
            }
            let node = codec::encode(&value).map_err(raise)?;
            let result = env
                .host
                .run_structured(&env.client, &node)
                .map_err(|e| raise(ScriptError::command(e)))?;
            codec::decode(lua, &result)
        })?,
    )?;

    tbl.set(
        "command_string",
        bind(lua, env, |_, env, text: String| {
            env.host
                .run_string(&env.client, &text)
                .map_err(|e| raise(ScriptError::command(e)))?;
            Ok(true)
        })?,
    )?;

    tbl.set(
        "commandv",
        bind(lua, env, |_, env, list: Table| {
            let argv = list
                .sequence_values::<Value>()
                .map(|v| match v? {
                    Value::String(s) => s
                        .to_str()
                        .map(|s| s.to_string())
                        .map_err(|_| raise(CodecError::InvalidUtf8)),
                    other => Err(raise(ScriptError::BadArgument(format!(
                        "command arguments must be strings, got {}",
                        other.type_name()
                    )))),
                })
                .collect::<LuaResult<Vec<String>>>()?;
            if argv.is_empty() {
                return Err(raise(ScriptError::BadArgument("empty command".to_string())));
            }
            env.host
                .run_vector(&env.client, &argv)
                .map_err(|e| raise(ScriptError::command(e)))?;
            Ok(true)
        })?,
    )?;
    Ok(())
}

// ── properties ────────────────────────────────────────────────────────────────

/// Formats may be passed by id (`4`) or by name (`"int64"`); nil means node.
fn parse_format(value: &Value) -> Result<Format, ScriptError> {
    let found = match value {
        Value::Nil => Some(Format::Node),
        Value::Integer(id) => Format::from_id(*id),
        Value::String(s) => s.to_str().ok().and_then(|s| Format::from_name(&s)),
        _ => None,
    };
    found.ok_or_else(|| ScriptError::BadArgument(format!("unknown property format {value:?}")))
}

/// Encode `value` and check it has the shape `format` requires.
fn encode_for(format: Format, value: &Value) -> Result<Node, ScriptError> {
    let node = codec::encode(value)?;
    let expected = match format {
        Format::Node => return Ok(node),
        Format::None => {
            return Err(ScriptError::BadArgument(
                "cannot set a property with format none".to_string(),
            ))
        }
        Format::Flag => "flag",
        Format::Int64 => "int64",
        Format::Double => "double",
        Format::String | Format::OsdString => "string",
    };
    match (format, node) {
        (Format::Double, Node::Int64(i)) => Ok(Node::Double(i as f64)),
        (_, node) if node.tag() == expected => Ok(node),
        (format, node) => Err(CodecError::FormatMismatch {
            format: format.name(),
            expected,
            found: node.tag(),
        }
        .into()),
    }
}

fn register_properties(lua: &Lua, env: &Arc<ContextEnv>, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "get_property",
        bind(lua, env, |lua, env, (name, format): (String, Value)| {
            let format = parse_format(&format).map_err(raise)?;
            if format == Format::None {
                return Ok(Value::Nil);
            }
            let node = env
                .host
                .get_property(&env.client, &name, format)
                .map_err(|e| raise(ScriptError::property(&name, e)))?;
            codec::decode(lua, &node)
        })?,
    )?;

    tbl.set(
        "set_property",
        bind(lua, env, |_, env, (name, format, value): (String, Value, Value)| {
            let format = parse_format(&format).map_err(raise)?;
            let node = encode_for(format, &value).map_err(raise)?;
            env.host
                .set_property(&env.client, &name, format, &node)
                .map_err(|e| raise(ScriptError::property(&name, e)))?;
            Ok(true)
        })?,
    )?;

    tbl.set(
        "del_property",
        bind(lua, env, |_, env, name: String| {
            env.host
                .delete_property(&env.client, &name)
                .map_err(|e| raise(ScriptError::property(&name, e)))?;
            Ok(true)
        })?,
    )?;

    tbl.set(
        "observe_property",
        bind(lua, env, |_, env, (name, format, id): (String, Value, u64)| {
            let format = parse_format(&format).map_err(raise)?;
            env.observations().insert(id, &name, format).map_err(raise)?;
            if let Err(e) = env.host.observe_property(&env.client, id, &name, format) {
                env.observations().remove(id);
                return Err(raise(ScriptError::property(&name, e)));
            }
            Ok(true)
        })?,
    )?;

    tbl.set(
        "unobserve_property",
        bind(lua, env, |_, env, id: u64| {
            let Some(observation) = env.observations().remove(id) else {
                return Ok(false);
            };
            env.host
                .unobserve_property(&env.client, id)
                .map_err(|e| raise(ScriptError::property(&observation.name, e)))?;
            Ok(true)
        })?,
    )?;

    tbl.set(
        "observing",
        bind(lua, env, |_, env, id: u64| Ok(env.observations().get(id).is_some()))?,
    )?;
    Ok(())
}

// ── events ────────────────────────────────────────────────────────────────────

fn parse_event(value: &Value) -> Result<EventKind, ScriptError> {
    let found = match value {
        Value::Integer(id) => EventKind::from_id(*id),
        Value::String(s) => s.to_str().ok().and_then(|s| EventKind::from_name(&s)),
        _ => None,
    };
    found.ok_or_else(|| {
        let shown = match value {
            Value::String(s) => s.to_string_lossy().to_string(),
            Value::Integer(i) => i.to_string(),
            other => other.type_name().to_string(),
        };
        ScriptError::InvalidEvent(shown)
    })
}

fn register_events(lua: &Lua, env: &Arc<ContextEnv>, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "request_event",
        bind(lua, env, |_, env, (event, enable): (Value, bool)| {
            let kind = parse_event(&event).map_err(raise)?;
            env.host
                .request_event(&env.client, kind, enable)
                .map_err(|e| raise(ScriptError::command(e)))?;
            env.set_event_enabled(kind, enable);
            Ok(true)
        })?,
    )?;

    tbl.set(
        "enable_messages",
        bind(lua, env, |_, env, level: String| {
            let threshold = LogLevel::parse_threshold(&level)
                .ok_or_else(|| raise(ScriptError::InvalidLevel(level.clone())))?;
            env.host
                .request_log_messages(&env.client, threshold)
                .map_err(|e| raise(ScriptError::command(e)))?;
            env.set_log_threshold(threshold);
            Ok(true)
        })?,
    )?;
    Ok(())
}

// ── log ───────────────────────────────────────────────────────────────────────

fn register_log(lua: &Lua, env: &Arc<ContextEnv>, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "log",
        bind(lua, env, |_, env, (level, parts): (String, Variadic<Value>)| {
            let level = LogLevel::from_name(&level)
                .ok_or_else(|| raise(ScriptError::InvalidLevel(level.clone())))?;
            let mut words = Vec::with_capacity(parts.len());
            for part in parts.iter() {
                match part {
                    Value::String(s) => words.push(s.to_string_lossy().to_string()),
                    other => {
                        return Err(raise(ScriptError::BadArgument(format!(
                            "log parts must be strings, got {}",
                            other.type_name()
                        ))))
                    }
                }
            }
            if words.is_empty() {
                return Ok(());
            }
            let line = words.join(" ");
            log::log!(target: "script", level.to_log(), "[script:{}] {}", env.client.name, line);
            env.host.log(&env.client, level, &line);
            env.record_log(level, &line);
            Ok(())
        })?,
    )?;

    tbl.set(
        "find_config_file",
        bind(lua, env, |_, env, name: String| {
            match env.host.find_config_file(&name) {
                Some(path) => Ok(path.to_string_lossy().to_string()),
                None => Err(raise(ScriptError::NotFound(name))),
            }
        })?,
    )?;
    Ok(())
}

// ── input sections ────────────────────────────────────────────────────────────

fn register_input(lua: &Lua, env: &Arc<ContextEnv>, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "input_define_section",
        bind(
            lua,
            env,
            |_,
             env,
             (name, location, contents, builtin, owner): (
                String,
                String,
                String,
                Option<bool>,
                Option<String>,
            )| {
                let section = InputSection {
                    name,
                    location,
                    contents,
                    builtin: builtin.unwrap_or(false),
                    owner: owner.unwrap_or_else(|| env.client.name.clone()),
                };
                env.host
                    .define_section(section)
                    .map_err(|e| raise(ScriptError::command(e)))?;
                Ok(true)
            },
        )?,
    )?;

    tbl.set(
        "input_enable_section",
        bind(lua, env, |_, env, (name, flags): (String, Option<u32>)| {
            env.host
                .enable_section(&name, flags.unwrap_or(0))
                .map_err(|e| raise(ScriptError::command(e)))?;
            Ok(true)
        })?,
    )?;
    Ok(())
}

// ── utils ─────────────────────────────────────────────────────────────────────

fn register_utils(lua: &Lua, tbl: &Table) -> LuaResult<()> {
    tbl.set(
        "format_json",
        lua.create_function(|_, value: Value| {
            let node = codec::encode(&value).map_err(raise)?;
            node.format_json().map_err(raise)
        })?,
    )?;
    tbl.set(
        "parse_json",
        lua.create_function(|lua, text: String| {
            let node = Node::parse_json(&text).map_err(raise)?;
            codec::decode(lua, &node)
        })?,
    )?;
    tbl.set(
        "array",
        lua.create_function(|lua, t: Table| {
            codec::mark_array(lua, &t)?;
            Ok(t)
        })?,
    )?;
    tbl.set(
        "map",
        lua.create_function(|lua, t: Table| {
            codec::mark_map(lua, &t)?;
            Ok(t)
        })?,
    )?;
    Ok(())
}
