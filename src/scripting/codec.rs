/// `scripting/codec.rs` — Lua value ⇄ host `Node`
///
/// Arrays and maps are both Lua tables, so decoded tables carry a metatable
/// recording what they were: a shared `{__type = "array"}` table, or a
/// per-map `{__type = "map", __order = {...}}` that remembers key order.
/// Unmarked tables written by scripts are classified by shape.
///
/// `None` is `nil` at the top level and `host.null` (a NULL light userdata)
/// inside containers, where `nil` would punch a hole.
use std::collections::BTreeMap;

use indexmap::IndexMap;
use mlua::{Lua, Result as LuaResult, Table, Value};

use crate::{error::CodecError, node::Node};

pub const MAX_DEPTH: usize = 256;

const TYPE_KEY: &str = "__type";
const ORDER_KEY: &str = "__order";
const ARRAY_MT: &str = "player_script_host.array_mt";

enum Marker {
    Array,
    Map(Vec<String>),
}

// ── encode: Lua → Node ────────────────────────────────────────────────────────

pub fn encode(value: &Value) -> Result<Node, CodecError> {
    encode_at(value, 0)
}

fn encode_at(value: &Value, depth: usize) -> Result<Node, CodecError> {
    match value {
        Value::Nil => Ok(Node::None),
        Value::LightUserData(ud) if ud.0.is_null() => Ok(Node::None),
        Value::Boolean(b) => Ok(Node::Flag(*b)),
        Value::Integer(i) => Ok(Node::Int64(*i)),
        Value::Number(n) => Ok(Node::Double(*n)),
        Value::String(s) => Ok(Node::String(lua_str(s)?)),
        Value::Table(t) => encode_table(t, depth + 1),
        other => Err(CodecError::Unsupported(other.type_name())),
    }
}

fn lua_str(s: &mlua::String) -> Result<String, CodecError> {
    s.to_str()
        .map(|s| s.to_string())
        .map_err(|_| CodecError::InvalidUtf8)
}

fn encode_table(t: &Table, depth: usize) -> Result<Node, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep(MAX_DEPTH));
    }
    match marker(t) {
        Some(Marker::Array) => {
            let pairs = pairs(t);
            if !is_sequence(&pairs) {
                let stray = pairs
                    .iter()
                    .map(|(k, _)| k)
                    .find(|k| !in_range(k, pairs.len()))
                    .map(describe_key)
                    .unwrap_or_default();
                return Err(CodecError::InvalidArrayKey(stray));
            }
            encode_sequence(&pairs, depth)
        }
        Some(Marker::Map(order)) => encode_map(pairs(t), &order, depth),
        None => {
            let pairs = pairs(t);
            if is_sequence(&pairs) {
                encode_sequence(&pairs, depth)
            } else {
                encode_map(pairs, &[], depth)
            }
        }
    }
}

fn pairs(t: &Table) -> Vec<(Value, Value)> {
    t.clone()
        .pairs::<Value, Value>()
        .filter_map(|p| p.ok())
        .collect()
}

fn in_range(key: &Value, n: usize) -> bool {
    matches!(key, Value::Integer(i) if *i >= 1 && *i <= n as i64)
}

/// Keys are exactly `1..=n` (the empty table counts as an array).
fn is_sequence(pairs: &[(Value, Value)]) -> bool {
    pairs.iter().all(|(k, _)| in_range(k, pairs.len()))
}

/// Caller has checked `is_sequence`, so every slot gets filled.
fn encode_sequence(pairs: &[(Value, Value)], depth: usize) -> Result<Node, CodecError> {
    let mut items = vec![Node::None; pairs.len()];
    for (k, v) in pairs {
        if let Value::Integer(i) = k {
            items[(*i - 1) as usize] = encode_at(v, depth)?;
        }
    }
    Ok(Node::Array(items))
}

fn describe_key(key: &Value) -> String {
    match key {
        Value::String(s) => format!("{:?}", s.to_string_lossy()),
        Value::Integer(i) => i.to_string(),
        other => other.type_name().to_string(),
    }
}

fn encode_map(pairs: Vec<(Value, Value)>, order: &[String], depth: usize) -> Result<Node, CodecError> {
    let mut entries = BTreeMap::new();
    for (k, v) in pairs {
        let key = match &k {
            Value::String(s) => lua_str(s)?,
            other => return Err(CodecError::NonStringKey(other.type_name())),
        };
        entries.insert(key, v);
    }

    let mut map = IndexMap::with_capacity(entries.len());
    for key in order {
        if let Some(v) = entries.remove(key) {
            map.insert(key.clone(), encode_at(&v, depth)?);
        }
    }
    for (key, v) in entries {
        map.insert(key, encode_at(&v, depth)?);
    }
    Ok(Node::Map(map))
}

fn marker(t: &Table) -> Option<Marker> {
    let mt = t.metatable()?;
    let kind: Option<String> = mt.raw_get(TYPE_KEY).ok().flatten();
    match kind.as_deref() {
        Some("array") => Some(Marker::Array),
        Some("map") => {
            let order = mt
                .raw_get::<Option<Table>>(ORDER_KEY)
                .ok()
                .flatten()
                .map(|o| o.sequence_values::<String>().filter_map(|k| k.ok()).collect())
                .unwrap_or_default();
            Some(Marker::Map(order))
        }
        _ => None,
    }
}

// ── decode: Node → Lua ────────────────────────────────────────────────────────

pub fn decode(lua: &Lua, node: &Node) -> LuaResult<Value> {
    match node {
        Node::None => Ok(Value::Nil),
        other => decode_nested(lua, other),
    }
}

fn decode_nested(lua: &Lua, node: &Node) -> LuaResult<Value> {
    Ok(match node {
        Node::None => Value::NULL,
        Node::Flag(b) => Value::Boolean(*b),
        Node::Int64(i) => Value::Integer(*i),
        Node::Double(d) => Value::Number(*d),
        Node::String(s) => Value::String(lua.create_string(s)?),
        Node::Array(items) => {
            let t = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                t.raw_set(i + 1, decode_nested(lua, item)?)?;
            }
            t.set_metatable(Some(array_metatable(lua)?));
            Value::Table(t)
        }
        Node::Map(map) => {
            let t = lua.create_table()?;
            for (k, v) in map {
                t.raw_set(k.as_str(), decode_nested(lua, v)?)?;
            }
            let order = lua.create_sequence_from(map.keys().map(String::as_str))?;
            t.set_metatable(Some(map_metatable(lua, Some(order))?));
            Value::Table(t)
        }
    })
}

fn array_metatable(lua: &Lua) -> LuaResult<Table> {
    if let Some(mt) = lua.named_registry_value::<Option<Table>>(ARRAY_MT)? {
        return Ok(mt);
    }
    let mt = lua.create_table()?;
    mt.raw_set(TYPE_KEY, "array")?;
    lua.set_named_registry_value(ARRAY_MT, &mt)?;
    Ok(mt)
}

fn map_metatable(lua: &Lua, order: Option<Table>) -> LuaResult<Table> {
    let mt = lua.create_table()?;
    mt.raw_set(TYPE_KEY, "map")?;
    if let Some(order) = order {
        mt.raw_set(ORDER_KEY, order)?;
    }
    Ok(mt)
}

/// Tag a script-built table as an array (so `{}` is not ambiguous).
pub fn mark_array(lua: &Lua, t: &Table) -> LuaResult<()> {
    t.set_metatable(Some(array_metatable(lua)?));
    Ok(())
}

/// Tag a script-built table as a map; keys encode in sorted order.
pub fn mark_map(lua: &Lua, t: &Table) -> LuaResult<()> {
    t.set_metatable(Some(map_metatable(lua, None)?));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eval(lua: &Lua, src: &str) -> Value {
        lua.load(src).eval::<Value>().unwrap()
    }

    fn arb_node() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            Just(Node::None),
            any::<bool>().prop_map(Node::Flag),
            any::<i64>().prop_map(Node::Int64),
            any::<f64>()
                .prop_filter("NaN never compares equal", |d| !d.is_nan())
                .prop_map(Node::Double),
            "[a-zA-Z0-9 äß€]{0,8}".prop_map(Node::String),
        ];
        leaf.prop_recursive(5, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Node::Array),
                prop::collection::vec(("[a-z]{1,6}", inner), 0..6)
                    .prop_map(|kv| Node::Map(kv.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_then_encode_is_identity(node in arb_node()) {
            let lua = Lua::new();
            let value = decode(&lua, &node).unwrap();
            let back = encode(&value).unwrap();
            // Debug output also pins map key order.
            prop_assert_eq!(format!("{back:?}"), format!("{node:?}"));
            prop_assert_eq!(back, node);
        }
    }

    #[test]
    fn scalars_keep_their_tags() {
        let lua = Lua::new();
        assert_eq!(encode(&eval(&lua, "return 3")).unwrap(), Node::Int64(3));
        assert_eq!(encode(&eval(&lua, "return 3.0")).unwrap(), Node::Double(3.0));
        assert_eq!(encode(&eval(&lua, "return nil")).unwrap(), Node::None);
        assert_eq!(encode(&eval(&lua, "return 'x'")).unwrap(), Node::from("x"));

        let v = decode(&lua, &Node::Double(2.0)).unwrap();
        assert!(matches!(v, Value::Number(n) if n == 2.0));
        let v = decode(&lua, &Node::Int64(i64::MAX)).unwrap();
        assert!(matches!(v, Value::Integer(i64::MAX)));
        assert!(decode(&lua, &Node::None).unwrap().is_nil());
    }

    #[test]
    fn nested_none_survives_as_null() {
        let lua = Lua::new();
        let node = Node::Array(vec![Node::None, Node::Int64(1), Node::None]);
        let value = decode(&lua, &node).unwrap();
        lua.globals().set("v", value.clone()).unwrap();
        assert_eq!(lua.load("return #v").eval::<i64>().unwrap(), 3);
        assert_eq!(encode(&value).unwrap(), node);
    }

    #[test]
    fn unmarked_tables_classify_by_shape() {
        let lua = Lua::new();
        assert_eq!(
            encode(&eval(&lua, "return {'a', 'b'}")).unwrap(),
            Node::argv(["a", "b"])
        );
        assert_eq!(encode(&eval(&lua, "return {}")).unwrap(), Node::Array(vec![]));

        let node = encode(&eval(&lua, "return {b = 1, a = {x = true}}")).unwrap();
        let Node::Map(map) = node else { panic!("expected map") };
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(map["b"], Node::Int64(1));
    }

    #[test]
    fn non_string_keys_are_rejected() {
        let lua = Lua::new();
        let err = encode(&eval(&lua, "return {[1] = 'a', x = 'b'}")).unwrap_err();
        assert_eq!(err, CodecError::NonStringKey("integer"));
        let err = encode(&eval(&lua, "return {ok = {[true] = 1}}")).unwrap_err();
        assert_eq!(err, CodecError::NonStringKey("boolean"));
        let err = encode(&eval(&lua, "return {[2] = 'gap'}")).unwrap_err();
        assert_eq!(err, CodecError::NonStringKey("integer"));
    }

    #[test]
    fn invalid_utf8_and_unsupported_values_fail() {
        let lua = Lua::new();
        let bad = Value::String(lua.create_string([0xffu8, 0xfe]).unwrap());
        assert_eq!(encode(&bad).unwrap_err(), CodecError::InvalidUtf8);
        let f = eval(&lua, "return function() end");
        assert_eq!(encode(&f).unwrap_err(), CodecError::Unsupported("function"));
    }

    #[test]
    fn marked_arrays_reject_keys_outside_their_indices() {
        let lua = Lua::new();
        let t: Table = lua.load("return { 10 }").eval().unwrap();
        t.set("extra", "lost").unwrap();
        mark_array(&lua, &t).unwrap();
        assert_eq!(
            encode(&Value::Table(t)).unwrap_err(),
            CodecError::InvalidArrayKey("\"extra\"".to_string())
        );

        let holes: Table = lua.load("return { 1, nil, 3 }").eval().unwrap();
        mark_array(&lua, &holes).unwrap();
        assert!(matches!(
            encode(&Value::Table(holes)),
            Err(CodecError::InvalidArrayKey(_))
        ));

        let ok: Table = lua.load("return { 'a' }").eval().unwrap();
        ok.raw_set(2, Value::NULL).unwrap();
        mark_array(&lua, &ok).unwrap();
        assert_eq!(
            encode(&Value::Table(ok)).unwrap(),
            Node::Array(vec![Node::from("a"), Node::None])
        );
    }

    #[test]
    fn cyclic_table_hits_depth_limit() {
        let lua = Lua::new();
        let v = eval(&lua, "local t = {} ; t.self = t ; return t");
        assert_eq!(encode(&v).unwrap_err(), CodecError::TooDeep(MAX_DEPTH));
    }

    #[test]
    fn script_mutated_map_keeps_recorded_order_first() {
        let lua = Lua::new();
        let mut map = IndexMap::new();
        map.insert("zeta".to_string(), Node::Int64(1));
        map.insert("alpha".to_string(), Node::Int64(2));
        lua.globals().set("m", decode(&lua, &Node::Map(map)).unwrap()).unwrap();
        lua.load("m.beta = 3 ; m.alpha = nil ; m.aardvark = 4").exec().unwrap();
        let Node::Map(out) = encode(&lua.globals().get::<Value>("m").unwrap()).unwrap() else {
            panic!("expected map");
        };
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["zeta", "aardvark", "beta"]);
    }

    #[test]
    fn marked_empty_containers_keep_their_kind() {
        let lua = Lua::new();
        let arr = decode(&lua, &Node::Array(vec![])).unwrap();
        let map = decode(&lua, &Node::Map(IndexMap::new())).unwrap();
        assert_eq!(encode(&arr).unwrap(), Node::Array(vec![]));
        assert_eq!(encode(&map).unwrap(), Node::Map(IndexMap::new()));

        let t = lua.create_table().unwrap();
        mark_map(&lua, &t).unwrap();
        assert_eq!(encode(&Value::Table(t)).unwrap(), Node::Map(IndexMap::new()));
    }
}
