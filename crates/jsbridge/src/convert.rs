//! Conversion between boundary [`Value`]s and engine values.
//!
//! Runtime thread only. Host-to-engine conversion materializes data values,
//! resolves function references through the handle table, wraps native
//! objects through the script-side proxy factory, and turns host callbacks
//! into engine functions whose trampoline routes back through the callback
//! table. Engine-to-host conversion walks the value graph with cycle
//! detection and depth/size limits, capturing functions as durable handles.

use deno_core::v8;

use crate::error::{BridgeError, ScriptError};
use crate::ext::{with_tables, BridgeTables, ScriptHandle};
use crate::handles::HandleId;
use crate::value::{FunctionRef, Value};

/// Conversion guards; a runaway graph fails loudly instead of exhausting
/// memory.
pub(crate) const MAX_DEPTH: usize = 100;
pub(crate) const MAX_BYTES: usize = 10 * 1024 * 1024;

/// Property carrying the proxy id on wrapped native objects. Installed by
/// the script-side wrapper factory, read back here to unwrap.
const PROXY_ID_KEY: &str = "__jsbridgeProxyId";

/// Global function installed by the prelude that builds proxy wrappers.
const WRAP_FACTORY_KEY: &str = "__jsbridgeWrapNative";

/// Tracks recursion depth and accumulated size during conversion.
pub(crate) struct LimitTracker {
    depth: usize,
    max_depth: usize,
    bytes: usize,
    max_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
            bytes: 0,
            max_bytes,
        }
    }

    pub fn enter(&mut self) -> Result<(), BridgeError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(BridgeError::marshal(format!(
                "value graph exceeds maximum depth of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.depth -= 1;
    }

    pub fn add_bytes(&mut self, n: usize) -> Result<(), BridgeError> {
        self.bytes += n;
        if self.bytes > self.max_bytes {
            return Err(BridgeError::marshal(format!(
                "value graph exceeds maximum size of {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Message of the pending exception in `tc`, or a placeholder when the
/// engine gives none.
pub(crate) fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    tc.exception()
        .and_then(|e| e.to_string(tc))
        .map(|s| s.to_rust_string_lossy(tc))
        .unwrap_or_else(|| "unknown script exception".to_string())
}

/// Converts a boundary value into an engine value.
pub(crate) fn to_v8<'s>(
    tables: &BridgeTables,
    scope: &mut v8::HandleScope<'s>,
    value: &Value,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    Ok(match value {
        Value::Undefined => v8::undefined(scope).into(),
        Value::Null => v8::null(scope).into(),
        Value::Bool(b) => v8::Boolean::new(scope, *b).into(),
        Value::Int(n) => {
            if let Ok(small) = i32::try_from(*n) {
                v8::Integer::new(scope, small).into()
            } else {
                v8::Number::new(scope, *n as f64).into()
            }
        }
        Value::Float(x) => v8::Number::new(scope, *x).into(),
        Value::String(s) => v8::String::new(scope, s)
            .ok_or_else(|| BridgeError::marshal("string too large for the engine"))?
            .into(),
        Value::Utf16(s) => s
            .materialize(scope)
            .ok_or_else(|| BridgeError::marshal("utf16 buffer too large for the engine"))?
            .into(),
        Value::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (i, item) in items.iter().enumerate() {
                let element = to_v8(tables, scope, item)?;
                array.set_index(scope, i as u32, element);
            }
            array.into()
        }
        Value::Object(map) => {
            let object = v8::Object::new(scope);
            for (key, item) in map {
                let key = v8::String::new(scope, key)
                    .ok_or_else(|| BridgeError::marshal("key too large for the engine"))?;
                let element = to_v8(tables, scope, item)?;
                object.set(scope, key.into(), element);
            }
            object.into()
        }
        Value::Function(reference) => {
            let handles = tables.handles.borrow();
            let handle = handles.unwrap(HandleId(reference.id))?;
            v8::Local::new(scope, &handle.value)
        }
        Value::Native(object) => wrap_native(tables, scope, object)?,
        Value::Callback(f) => {
            let id = tables.callbacks.borrow_mut().insert(f.clone());
            let data = v8::Integer::new_from_unsigned(scope, id);
            let function = v8::Function::builder(host_callback_trampoline)
                .data(data.into())
                .build(scope)
                .ok_or_else(|| BridgeError::marshal("failed to build host callback"))?;
            function.into()
        }
    })
}

/// Builds (or fetches from cache) the script-side wrapper for a native
/// object by calling the prelude's wrapper factory.
pub(crate) fn wrap_native<'s>(
    tables: &BridgeTables,
    scope: &mut v8::HandleScope<'s>,
    object: &std::sync::Arc<dyn crate::proxy::NativeObject>,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    let id = tables.proxies.borrow_mut().intern(object.clone());
    if let Some(cached) = tables.proxies.borrow().wrapper(id) {
        return Ok(v8::Local::new(scope, cached).into());
    }

    let descriptor = tables.proxies.borrow_mut().descriptor_json(object);
    let payload = serde_json::json!({ "id": id, "descriptor": descriptor });
    let payload = deno_core::serde_v8::to_v8(scope, payload)
        .map_err(|e| BridgeError::marshal(e.to_string()))?;

    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, WRAP_FACTORY_KEY)
        .ok_or_else(|| BridgeError::marshal("failed to intern factory key"))?;
    let factory = global
        .get(scope, key.into())
        .and_then(|v| v8::Local::<v8::Function>::try_from(v).ok())
        .ok_or_else(|| BridgeError::marshal("proxy wrapper factory is not installed"))?;

    let recv: v8::Local<v8::Value> = v8::undefined(scope).into();
    let tc = &mut v8::TryCatch::new(scope);
    let wrapper = match factory.call(tc, recv, &[payload]) {
        Some(w) => w,
        None => {
            let message = exception_message(tc);
            return Err(ScriptError::new(message).into());
        }
    };
    if let Ok(wrapper_object) = v8::Local::<v8::Object>::try_from(wrapper) {
        let pinned = v8::Global::new(tc, wrapper_object);
        tables.proxies.borrow_mut().cache_wrapper(id, pinned);
    }
    Ok(wrapper)
}

/// Converts an engine value into a boundary value.
pub(crate) fn from_v8<'s>(
    tables: &BridgeTables,
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<Value, BridgeError> {
    let mut path = Vec::new();
    let mut tracker = LimitTracker::new(MAX_DEPTH, MAX_BYTES);
    from_v8_inner(tables, scope, value, &mut path, &mut tracker, None)
}

fn from_v8_inner<'s>(
    tables: &BridgeTables,
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    path: &mut Vec<v8::Local<'s, v8::Value>>,
    tracker: &mut LimitTracker,
    receiver: Option<v8::Global<v8::Value>>,
) -> Result<Value, BridgeError> {
    tracker.enter()?;
    let result = convert_one(tables, scope, value, path, tracker, receiver);
    tracker.exit();
    result
}

fn convert_one<'s>(
    tables: &BridgeTables,
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    path: &mut Vec<v8::Local<'s, v8::Value>>,
    tracker: &mut LimitTracker,
    receiver: Option<v8::Global<v8::Value>>,
) -> Result<Value, BridgeError> {
    if value.is_undefined() {
        return Ok(Value::Undefined);
    }
    if value.is_null() {
        return Ok(Value::Null);
    }
    if value.is_boolean() {
        return Ok(Value::Bool(value.boolean_value(scope)));
    }
    if value.is_number() {
        let number = value
            .to_number(scope)
            .ok_or_else(|| BridgeError::marshal("failed to read number"))?
            .value();
        tracker.add_bytes(8)?;
        if number.fract() == 0.0 && number.is_finite() {
            let as_int = number as i64;
            if as_int as f64 == number {
                return Ok(Value::Int(as_int));
            }
        }
        return Ok(Value::Float(number));
    }
    if value.is_string() {
        let s = value
            .to_string(scope)
            .ok_or_else(|| BridgeError::marshal("failed to read string"))?
            .to_rust_string_lossy(scope);
        tracker.add_bytes(s.len())?;
        return Ok(Value::String(s));
    }
    if value.is_big_int() {
        let bigint = v8::Local::<v8::BigInt>::try_from(value)
            .map_err(|_| BridgeError::marshal("failed to read bigint"))?;
        let (n, lossless) = bigint.i64_value();
        if lossless {
            return Ok(Value::Int(n));
        }
        return Err(BridgeError::marshal("bigint does not fit in 64 bits"));
    }
    if value.is_function() {
        let function = v8::Local::<v8::Function>::try_from(value)
            .map_err(|_| BridgeError::marshal("failed to read function"))?;
        let as_value: v8::Local<v8::Value> = function.into();
        let pinned: v8::Global<v8::Value> = v8::Global::new(scope, as_value);
        let id = tables.handles.borrow_mut().create(
            ScriptHandle {
                value: pinned,
                receiver,
            },
            true,
        )?;
        return Ok(Value::Function(FunctionRef { id: id.0 }));
    }
    if value.is_symbol() {
        return Err(BridgeError::marshal("symbols cannot cross the boundary"));
    }
    if value.is_array() {
        // Identity comparison against the ancestors on the current path;
        // a repeated sibling is fine, a repeated ancestor is a cycle.
        if path.iter().any(|ancestor| ancestor.strict_equals(value)) {
            return Err(BridgeError::marshal("circular reference in value graph"));
        }
        path.push(value);

        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| BridgeError::marshal("failed to read array"))?;
        let mut items = Vec::with_capacity(array.length() as usize);
        for i in 0..array.length() {
            let element = array
                .get_index(scope, i)
                .ok_or_else(|| BridgeError::marshal(format!("failed to read index {i}")))?;
            items.push(from_v8_inner(tables, scope, element, path, tracker, None)?);
        }

        path.pop();
        return Ok(Value::Array(items));
    }
    if value.is_object() {
        let object = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| BridgeError::marshal("failed to read object"))?;

        // A wrapped native object unwraps back to its host reference.
        if let Some(id) = proxy_id(scope, object) {
            let native = tables.proxies.borrow().unwrap(id)?;
            return Ok(Value::Native(native));
        }

        if path.iter().any(|ancestor| ancestor.strict_equals(value)) {
            return Err(BridgeError::marshal("circular reference in value graph"));
        }
        path.push(value);

        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| BridgeError::marshal("failed to list properties"))?;

        let mut map = indexmap::IndexMap::new();
        for i in 0..names.length() {
            let key = names
                .get_index(scope, i)
                .ok_or_else(|| BridgeError::marshal("failed to read property name"))?;
            let key_str = key
                .to_string(scope)
                .ok_or_else(|| BridgeError::marshal("failed to read property name"))?
                .to_rust_string_lossy(scope);
            let property = object
                .get(scope, key)
                .ok_or_else(|| BridgeError::marshal(format!("failed to read `{key_str}`")))?;

            // A function property keeps its object as the receiver so a
            // later call binds `this` correctly.
            let receiver_for_property = if property.is_function() {
                let as_value: v8::Local<v8::Value> = object.into();
                Some(v8::Global::new(scope, as_value))
            } else {
                None
            };

            tracker.add_bytes(key_str.len())?;
            map.insert(
                key_str,
                from_v8_inner(tables, scope, property, path, tracker, receiver_for_property)?,
            );
        }

        path.pop();
        return Ok(Value::Object(map));
    }

    // Anything else degrades to its string form.
    let s = value
        .to_string(scope)
        .ok_or_else(|| BridgeError::marshal("failed to stringify value"))?
        .to_rust_string_lossy(scope);
    tracker.add_bytes(s.len())?;
    Ok(Value::String(s))
}

/// Reads the proxy id marker off an object, if present.
fn proxy_id(scope: &mut v8::HandleScope, object: v8::Local<v8::Object>) -> Option<u32> {
    let key = v8::String::new(scope, PROXY_ID_KEY)?;
    if object.has_own_property(scope, key.into()) != Some(true) {
        return None;
    }
    let raw = object.get(scope, key.into())?;
    let id = raw.to_uint32(scope)?;
    Some(id.value())
}

/// Engine entry point for host callbacks. The callback id travels in the
/// function's data slot.
fn host_callback_trampoline<'a>(
    scope: &mut v8::HandleScope<'a>,
    args: v8::FunctionCallbackArguments<'a>,
    mut rv: v8::ReturnValue,
) {
    let id = v8::Local::<v8::Integer>::try_from(args.data())
        .map(|n| n.value() as u32)
        .unwrap_or(0);

    let outcome: Result<v8::Global<v8::Value>, String> = (|| {
        let tables = with_tables(Clone::clone).ok_or("host callback tables are gone")?;
        let callback = tables
            .callbacks
            .borrow()
            .get(id)
            .ok_or("host callback was released")?;

        let mut host_args = Vec::with_capacity(args.length() as usize);
        for i in 0..args.length() {
            let converted =
                from_v8(&tables, scope, args.get(i)).map_err(|e| e.to_string())?;
            host_args.push(converted);
        }

        let result = callback(host_args);
        let result = to_v8(&tables, scope, &result).map_err(|e| e.to_string())?;
        Ok(v8::Global::new(scope, result))
    })();

    match outcome {
        Ok(result) => {
            let local = v8::Local::new(scope, &result);
            rv.set(local);
        }
        Err(message) => {
            if let Some(text) = v8::String::new(scope, &message) {
                let exception = v8::Exception::type_error(scope, text);
                scope.throw_exception(exception);
            }
        }
    }
}
