//! JSON <-> Lua conversions.

use deckhost_core::Message;
use mlua::{Lua, LuaSerdeExt, Result as LuaResult, SerializeOptions, Value};

/// Convert JSON to Lua. `null` becomes `nil`.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<Value> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    lua.to_value_with(value, options)
}

/// Convert a Lua value to JSON.
pub fn lua_to_json(lua: &Lua, value: Value) -> LuaResult<serde_json::Value> {
    lua.from_value(value)
}

/// Build a message an app passed to `ctx.send`. `app` defaults to the
/// sending app's name.
pub fn message_from_app(app: &str, value: serde_json::Value) -> Result<Message, String> {
    let mut object = match value {
        serde_json::Value::Object(object) => object,
        other => return Err(format!("message must be a table, got {}", other)),
    };
    object
        .entry("app")
        .or_insert_with(|| serde_json::Value::String(app.to_string()));
    serde_json::from_value(serde_json::Value::Object(object)).map_err(|e| e.to_string())
}
