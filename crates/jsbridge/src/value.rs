//! Boundary value representation.
//!
//! [`Value`] is what crosses between host threads and the script runtime:
//! plain data is carried by value, script functions are carried as durable
//! references into the persistent handle table, and host objects/callbacks
//! are carried as shared trait objects that the runtime thread wraps into
//! script proxies on first sight.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::proxy::NativeObject;
use crate::string::ExternalUtf16;

/// A host function callable from script. Runs on the runtime thread, so it
/// must be `Send + Sync`; anything long-running should hand off to its own
/// executor and return promptly.
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// Durable reference to a script function captured during conversion. The
/// id resolves in the persistent handle table of the bridge that produced
/// it; invoking it through another bridge is a lifecycle error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    pub(crate) id: u32,
}

/// A value crossing the host/script boundary.
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// UTF-16 buffer handed to the engine without a byte copy.
    Utf16(ExternalUtf16),
    Array(Vec<Value>),
    /// Insertion order is preserved across the boundary.
    Object(IndexMap<String, Value>),
    /// A script function pinned in the handle table.
    Function(FunctionRef),
    /// A host object exposed to script through the proxy bridge.
    Native(Arc<dyn NativeObject>),
    /// A host closure exposed to script as a callable.
    Callback(HostFn),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view: integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FunctionRef> {
        match self {
            Value::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Short tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Utf16(_) => "utf16",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Native(_) => "native",
            Value::Callback(_) => "callback",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Value::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::Utf16(s) => f.debug_tuple("Utf16").field(&s.to_string_lossy()).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Value::Function(fr) => f.debug_tuple("Function").field(&fr.id).finish(),
            Value::Native(obj) => f.debug_tuple("Native").field(&obj.class_name()).finish(),
            Value::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Structural equality for data; functions, natives, and callbacks compare
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Utf16(a), Value::Utf16(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Callback(a), Value::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ExternalUtf16> for Value {
    fn from(s: ExternalUtf16) -> Self {
        Value::Utf16(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
