//! Bidirectional value conversion between [`JsValue`] and engine values.
//!
//! This layer runs on every boundary crossing: binding arguments, binding
//! results, and evaluation results. Host→script conversion widens numbers
//! into the engine's numeric tags and materializes `Map`/`Set`/`Error`
//! through their script constructors. Script→host conversion dispatches on
//! the engine tag and keeps an identity stack of the containers on the
//! current path, so self-referencing script values fail with
//! [`Error::CircularReference`] instead of recursing forever.

use indexmap::IndexMap;
use rquickjs::{Array, Coerced, Ctx, FromJs, Function, IntoJs, Object, Value};

use crate::runtime::error::{Error, Result, ScriptError};
use crate::runtime::js_value::JsValue;

// Glue helpers installed by the engine bootstrap script.
pub(crate) const CONSTRUCT_HELPER: &str = "__jsbridge_construct";
pub(crate) const COLLECT_HELPER: &str = "__jsbridge_collect";
pub(crate) const SEEN_ENTER_HELPER: &str = "__jsbridge_seen_enter";
pub(crate) const SEEN_EXIT_HELPER: &str = "__jsbridge_seen_exit";

/// Map an engine-level failure onto the crate taxonomy. A pending exception
/// becomes a script error; anything else is an engine-internal failure.
pub(crate) fn engine_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> Error {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        Error::Script(script_error_from_value(ctx, &caught))
    } else {
        Error::Script(ScriptError::new("InternalError", err.to_string()))
    }
}

/// Reconstruct a [`ScriptError`] from a thrown script value.
pub(crate) fn script_error_from_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> ScriptError {
    if value.is_error() {
        if let Some(obj) = value.as_object() {
            let name = obj
                .get::<_, Coerced<String>>("name")
                .map(|c| c.0)
                .unwrap_or_else(|_| "Error".to_string());
            let message = obj
                .get::<_, Coerced<String>>("message")
                .map(|c| c.0)
                .unwrap_or_default();
            return ScriptError {
                name,
                message,
                stack: read_stack(obj),
            };
        }
    }
    let message = Coerced::<String>::from_js(ctx, value.clone())
        .map(|c| c.0)
        .unwrap_or_else(|_| "unknown script exception".to_string());
    ScriptError::new("Error", message)
}

/// Read a script error's stack as frame strings. The engine reports a single
/// newline-separated string; errors built by this crate carry an array.
fn read_stack(obj: &Object<'_>) -> Vec<String> {
    match obj.get::<_, Value>("stack") {
        Ok(stack) => {
            if let Some(s) = stack.as_string() {
                match s.to_string() {
                    Ok(text) => text
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect(),
                    Err(_) => Vec::new(),
                }
            } else if let Some(arr) = stack.as_array() {
                let mut frames = Vec::with_capacity(arr.len());
                for i in 0..arr.len() {
                    if let Ok(Coerced(line)) = arr.get::<Coerced<String>>(i) {
                        frames.push(line);
                    }
                }
                frames
            } else {
                Vec::new()
            }
        }
        Err(_) => Vec::new(),
    }
}

/// Convert a host value into a script value.
pub(crate) fn js_value_to_script<'js>(ctx: &Ctx<'js>, value: &JsValue) -> Result<Value<'js>> {
    match value {
        JsValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
        JsValue::Null => Ok(Value::new_null(ctx.clone())),
        JsValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        JsValue::Int(i) => Ok(int_to_script(ctx, *i)),
        JsValue::Float(f) => Ok(Value::new_float(ctx.clone(), *f)),
        JsValue::String(s) => s.clone().into_js(ctx).map_err(|e| engine_error(ctx, e)),
        JsValue::Array(items) => {
            let arr = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
            for (i, item) in items.iter().enumerate() {
                let element = js_value_to_script(ctx, item)?;
                arr.set(i, element).map_err(|e| engine_error(ctx, e))?;
            }
            Ok(arr.into_value())
        }
        JsValue::Object(map) => {
            let obj = Object::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
            for (key, val) in map {
                let element = js_value_to_script(ctx, val)?;
                obj.set(key.as_str(), element)
                    .map_err(|e| engine_error(ctx, e))?;
            }
            Ok(obj.into_value())
        }
        JsValue::Map(entries) => {
            // A Map materializes from an array of [key, value] entries fed to
            // the script Map constructor.
            let arr = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
            for (i, (key, val)) in entries.iter().enumerate() {
                let pair = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
                pair.set(0, js_value_to_script(ctx, key)?)
                    .map_err(|e| engine_error(ctx, e))?;
                pair.set(1, js_value_to_script(ctx, val)?)
                    .map_err(|e| engine_error(ctx, e))?;
                arr.set(i, pair).map_err(|e| engine_error(ctx, e))?;
            }
            construct_from_global(ctx, "Map", arr.into_value())
        }
        JsValue::Set(items) => {
            let arr = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, js_value_to_script(ctx, item)?)
                    .map_err(|e| engine_error(ctx, e))?;
            }
            construct_from_global(ctx, "Set", arr.into_value())
        }
        JsValue::Error(e) => script_error_to_script(ctx, e),
    }
}

/// 32-bit integers keep the engine's integer tag; wider ones widen to double.
fn int_to_script<'js>(ctx: &Ctx<'js>, i: i64) -> Value<'js> {
    match i32::try_from(i) {
        Ok(small) => Value::new_int(ctx.clone(), small),
        Err(_) => Value::new_float(ctx.clone(), i as f64),
    }
}

/// Invoke a constructor found on the global object with a single argument.
fn construct_from_global<'js>(ctx: &Ctx<'js>, name: &str, arg: Value<'js>) -> Result<Value<'js>> {
    let ctor: Value = ctx
        .globals()
        .get(name)
        .map_err(|e| engine_error(ctx, e))?;
    if ctor.is_undefined() || ctor.is_null() {
        return Err(Error::TypeMapping {
            type_name: format!("script constructor '{name}'"),
        });
    }
    let construct: Function = ctx
        .globals()
        .get(CONSTRUCT_HELPER)
        .map_err(|e| engine_error(ctx, e))?;
    construct
        .call((ctor, arg))
        .map_err(|e| engine_error(ctx, e))
}

/// Build a script `Error` object with `name`, `message`, and a stack that is
/// always an array of frame strings (empty when unavailable, never null).
pub(crate) fn script_error_to_script<'js>(
    ctx: &Ctx<'js>,
    error: &ScriptError,
) -> Result<Value<'js>> {
    let message = error
        .message
        .clone()
        .into_js(ctx)
        .map_err(|e| engine_error(ctx, e))?;
    let value = construct_from_global(ctx, "Error", message)?;
    let obj = value.as_object().ok_or_else(|| Error::TypeMapping {
        type_name: "script Error object".to_string(),
    })?;
    obj.set("name", error.name.as_str())
        .map_err(|e| engine_error(ctx, e))?;
    let stack = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
    for (i, frame) in error.stack.iter().enumerate() {
        stack
            .set(i, frame.as_str())
            .map_err(|e| engine_error(ctx, e))?;
    }
    obj.set("stack", stack).map_err(|e| engine_error(ctx, e))?;
    Ok(value)
}

/// Build the script `Error` for a host-side failure crossing into the engine.
pub(crate) fn host_error_to_script<'js>(ctx: &Ctx<'js>, err: &Error) -> Result<Value<'js>> {
    let shaped = ScriptError {
        name: err.script_name().to_string(),
        message: err.script_message(),
        stack: err.script_stack(),
    };
    script_error_to_script(ctx, &shaped)
}

struct Helpers<'js> {
    seen_enter: Function<'js>,
    seen_exit: Function<'js>,
    collect: Function<'js>,
}

impl<'js> Helpers<'js> {
    fn fetch(ctx: &Ctx<'js>) -> Result<Self> {
        let globals = ctx.globals();
        Ok(Self {
            seen_enter: globals
                .get(SEEN_ENTER_HELPER)
                .map_err(|e| engine_error(ctx, e))?,
            seen_exit: globals
                .get(SEEN_EXIT_HELPER)
                .map_err(|e| engine_error(ctx, e))?,
            collect: globals
                .get(COLLECT_HELPER)
                .map_err(|e| engine_error(ctx, e))?,
        })
    }

    /// Push a container onto the identity stack; a container already on the
    /// path is a cycle.
    fn enter(&self, ctx: &Ctx<'js>, seen: &Array<'js>, value: &Value<'js>) -> Result<()> {
        let fresh: bool = self
            .seen_enter
            .call((seen.clone(), value.clone()))
            .map_err(|e| engine_error(ctx, e))?;
        if fresh {
            Ok(())
        } else {
            Err(Error::CircularReference)
        }
    }

    fn exit(&self, ctx: &Ctx<'js>, seen: &Array<'js>) -> Result<()> {
        self.seen_exit
            .call::<_, ()>((seen.clone(),))
            .map_err(|e| engine_error(ctx, e))
    }
}

/// Convert a script value into a host value.
pub(crate) fn script_to_js_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<JsValue> {
    let helpers = Helpers::fetch(ctx)?;
    let seen = Array::new(ctx.clone()).map_err(|e| engine_error(ctx, e))?;
    convert_script_value(ctx, value, &helpers, &seen)
}

fn convert_script_value<'js>(
    ctx: &Ctx<'js>,
    value: &Value<'js>,
    helpers: &Helpers<'js>,
    seen: &Array<'js>,
) -> Result<JsValue> {
    if value.is_undefined() {
        return Ok(JsValue::Undefined);
    }
    if value.is_null() {
        return Ok(JsValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(JsValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(JsValue::Int(i64::from(i)));
    }
    if let Some(f) = value.as_float() {
        return Ok(JsValue::Float(f));
    }
    if let Some(s) = value.as_string() {
        return s
            .to_string()
            .map(JsValue::String)
            .map_err(|e| engine_error(ctx, e));
    }
    if value.is_error() {
        return Ok(JsValue::Error(script_error_from_value(ctx, value)));
    }
    if let Some(arr) = value.as_array() {
        helpers.enter(ctx, seen, value)?;
        let mut items = Vec::with_capacity(arr.len());
        for i in 0..arr.len() {
            let element: Value = arr.get(i).map_err(|e| engine_error(ctx, e))?;
            items.push(convert_script_value(ctx, &element, helpers, seen)?);
        }
        helpers.exit(ctx, seen)?;
        return Ok(JsValue::Array(items));
    }
    if value.is_function() {
        return Err(Error::TypeMapping {
            type_name: "function".to_string(),
        });
    }
    if value.as_promise().is_some() {
        return Err(Error::TypeMapping {
            type_name: "promise".to_string(),
        });
    }
    if let Some(obj) = value.as_object() {
        return match constructor_name(obj).as_deref() {
            Some("Map") => {
                helpers.enter(ctx, seen, value)?;
                let entries: Array = helpers
                    .collect
                    .call((value.clone(),))
                    .map_err(|e| engine_error(ctx, e))?;
                let mut pairs = Vec::with_capacity(entries.len());
                for i in 0..entries.len() {
                    let entry: Array = entries.get(i).map_err(|e| engine_error(ctx, e))?;
                    let key: Value = entry.get(0).map_err(|e| engine_error(ctx, e))?;
                    let val: Value = entry.get(1).map_err(|e| engine_error(ctx, e))?;
                    pairs.push((
                        convert_script_value(ctx, &key, helpers, seen)?,
                        convert_script_value(ctx, &val, helpers, seen)?,
                    ));
                }
                helpers.exit(ctx, seen)?;
                Ok(JsValue::Map(pairs))
            }
            Some("Set") => {
                helpers.enter(ctx, seen, value)?;
                let members: Array = helpers
                    .collect
                    .call((value.clone(),))
                    .map_err(|e| engine_error(ctx, e))?;
                let mut items = Vec::with_capacity(members.len());
                for i in 0..members.len() {
                    let member: Value = members.get(i).map_err(|e| engine_error(ctx, e))?;
                    items.push(convert_script_value(ctx, &member, helpers, seen)?);
                }
                helpers.exit(ctx, seen)?;
                Ok(JsValue::Set(items))
            }
            _ => {
                helpers.enter(ctx, seen, value)?;
                let mut map = IndexMap::new();
                for prop in obj.props::<String, Value>() {
                    let (key, val) = prop.map_err(|e| engine_error(ctx, e))?;
                    map.insert(key, convert_script_value(ctx, &val, helpers, seen)?);
                }
                helpers.exit(ctx, seen)?;
                Ok(JsValue::Object(map))
            }
        };
    }
    Err(Error::TypeMapping {
        type_name: script_type_label(value).to_string(),
    })
}

fn constructor_name(obj: &Object<'_>) -> Option<String> {
    let ctor: Object = obj.get::<_, Option<Object>>("constructor").ok().flatten()?;
    ctor.get::<_, Option<String>>("name").ok().flatten()
}

fn script_type_label(value: &Value<'_>) -> &'static str {
    if value.is_symbol() {
        "symbol"
    } else {
        "unsupported script value"
    }
}
