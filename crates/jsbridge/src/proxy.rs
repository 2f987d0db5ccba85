//! Native-object proxy bridge.
//!
//! Host objects implement [`NativeObject`]; the runtime thread interns each
//! distinct object into a [`ProxyTable`] and hands script a wrapper whose
//! accessors and methods route back through ops by proxy id. Property
//! payloads cross the op boundary as JSON; a nested native object is carried
//! as a `__nativeProxy` marker and revived into a wrapper on the script side.

use std::collections::HashMap;
use std::sync::Arc;

use deno_core::v8;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;

use crate::error::{HandleError, ScriptError};
use crate::value::Value;

/// Property flags mirrored from host-side introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropFlags(pub u16);

impl PropFlags {
    pub const UNSUPPORTED: PropFlags = PropFlags(1);
    pub const READABLE: PropFlags = PropFlags(2);
    pub const WRITABLE: PropFlags = PropFlags(4);
    pub const RETURNS_REFERENCE: PropFlags = PropFlags(8);
    pub const RETAIN: PropFlags = PropFlags(16);
    pub const COPY: PropFlags = PropFlags(32);
    pub const NON_ATOMIC: PropFlags = PropFlags(64);
    pub const DYNAMIC: PropFlags = PropFlags(128);
    pub const WEAK: PropFlags = PropFlags(256);
    pub const COLLECTOR_ELIGIBLE: PropFlags = PropFlags(512);

    pub const fn contains(self, other: PropFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PropFlags {
    type Output = PropFlags;
    fn bitor(self, rhs: PropFlags) -> PropFlags {
        PropFlags(self.0 | rhs.0)
    }
}

/// One introspected property of a native class.
#[derive(Debug, Clone)]
pub struct PropSpec {
    pub name: String,
    pub flags: PropFlags,
}

impl PropSpec {
    pub fn readable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: PropFlags::READABLE,
        }
    }

    pub fn read_write(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: PropFlags::READABLE | PropFlags::WRITABLE,
        }
    }
}

/// Shape of a native class as seen from script: which properties become
/// accessors and which method names become callables.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    pub class_name: String,
    pub properties: Vec<PropSpec>,
    pub methods: Vec<String>,
}

impl ClassSpec {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn property(mut self, prop: PropSpec) -> Self {
        self.properties.push(prop);
        self
    }

    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }
}

// Wire form of a class descriptor consumed by the script-side wrapper
// factory. Unsupported properties are dropped here, not errored.
#[derive(Serialize)]
struct DescriptorProp<'a> {
    name: &'a str,
    readable: bool,
    writable: bool,
}

#[derive(Serialize)]
struct Descriptor<'a> {
    #[serde(rename = "className")]
    class_name: &'a str,
    properties: Vec<DescriptorProp<'a>>,
    methods: &'a [String],
}

/// A host object exposed to script. All three accessors run on the runtime
/// thread; implementations use interior mutability for `set`.
pub trait NativeObject: Send + Sync {
    fn class_name(&self) -> &str;

    /// Properties and methods to expose. Called once per class, then cached.
    fn descriptor(&self) -> ClassSpec;

    fn get(&self, property: &str) -> Result<Value, ScriptError>;

    fn set(&self, property: &str, value: Value) -> Result<(), ScriptError>;

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ScriptError>;
}

/// Runtime-thread table of interned native objects.
///
/// Interning is keyed by object identity so wrapping the same host object
/// twice yields the same proxy id (and, through the wrapper cache, the same
/// script object). Descriptors are cached per class name.
pub(crate) struct ProxyTable {
    objects: HashMap<u32, Arc<dyn NativeObject>>,
    by_identity: HashMap<*const (), u32>,
    wrappers: HashMap<u32, v8::Global<v8::Object>>,
    descriptors: HashMap<String, serde_json::Value>,
    next_id: u32,
}

impl ProxyTable {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            by_identity: HashMap::new(),
            wrappers: HashMap::new(),
            descriptors: HashMap::new(),
            next_id: 1,
        }
    }

    fn identity(object: &Arc<dyn NativeObject>) -> *const () {
        Arc::as_ptr(object) as *const ()
    }

    /// Interns `object`, reusing the existing id when the same host object
    /// was wrapped before. The table keeps the object alive for as long as
    /// the id is live.
    pub fn intern(&mut self, object: Arc<dyn NativeObject>) -> u32 {
        let key = Self::identity(&object);
        if let Some(&id) = self.by_identity.get(&key) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_identity.insert(key, id);
        self.objects.insert(id, object);
        id
    }

    /// Inverse of [`intern`](Self::intern): resolves a proxy id carried in a
    /// script payload back to its host object.
    pub fn unwrap(&self, id: u32) -> Result<Arc<dyn NativeObject>, HandleError> {
        self.objects.get(&id).cloned().ok_or(HandleError::NotAProxy)
    }

    /// Class descriptor as wire JSON, cached per class name.
    pub fn descriptor_json(&mut self, object: &Arc<dyn NativeObject>) -> serde_json::Value {
        let class = object.class_name().to_owned();
        if let Some(cached) = self.descriptors.get(&class) {
            return cached.clone();
        }
        let spec = object.descriptor();
        let descriptor = Descriptor {
            class_name: &spec.class_name,
            properties: spec
                .properties
                .iter()
                .filter(|p| !p.flags.contains(PropFlags::UNSUPPORTED))
                .map(|p| DescriptorProp {
                    name: &p.name,
                    readable: p.flags.contains(PropFlags::READABLE),
                    writable: p.flags.contains(PropFlags::WRITABLE),
                })
                .collect(),
            methods: &spec.methods,
        };
        // Serialize of plain strings and bools cannot fail.
        let value = serde_json::to_value(&descriptor).unwrap_or(serde_json::Value::Null);
        self.descriptors.insert(class, value.clone());
        value
    }

    pub fn cache_wrapper(&mut self, id: u32, wrapper: v8::Global<v8::Object>) {
        self.wrappers.insert(id, wrapper);
    }

    pub fn wrapper(&self, id: u32) -> Option<&v8::Global<v8::Object>> {
        self.wrappers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Drops every interned object and cached wrapper at shutdown.
    pub fn release_all(&mut self) {
        self.objects.clear();
        self.by_identity.clear();
        self.wrappers.clear();
    }
}

/// Converts a boundary value into the JSON wire form used by the proxy ops.
/// Nested native objects are interned and carried as `__nativeProxy` markers;
/// functions and callbacks cannot cross the property route.
pub(crate) fn json_from_value(
    table: &mut ProxyTable,
    value: &Value,
) -> Result<serde_json::Value, ScriptError> {
    Ok(match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(n) => json!(n),
        Value::Float(x) => json!(x),
        Value::String(s) => json!(s),
        Value::Utf16(s) => json!(s.to_string_lossy()),
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| json_from_value(table, v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), json_from_value(table, v)?);
            }
            serde_json::Value::Object(out)
        }
        Value::Native(object) => {
            let id = table.intern(object.clone());
            let descriptor = table.descriptor_json(object);
            json!({ "__nativeProxy": { "id": id, "descriptor": descriptor } })
        }
        Value::Function(_) | Value::Callback(_) => {
            return Err(ScriptError::new(format!(
                "a {} cannot cross a proxy property",
                value.kind()
            )))
        }
    })
}

/// Inverse of [`json_from_value`]: revives proxy markers back into the host
/// objects they stand for.
pub(crate) fn value_from_json(
    table: &ProxyTable,
    json: &serde_json::Value,
) -> Result<Value, HandleError> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| value_from_json(table, v))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            if let Some(marker) = map.get("__nativeProxy") {
                let id = marker
                    .get("id")
                    .and_then(|v| v.as_u64())
                    .ok_or(HandleError::NotAProxy)?;
                return Ok(Value::Native(table.unwrap(id as u32)?));
            }
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), value_from_json(table, v)?);
            }
            Value::Object(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter {
        count: Mutex<i64>,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: Mutex::new(0),
            })
        }
    }

    impl NativeObject for Counter {
        fn class_name(&self) -> &str {
            "Counter"
        }

        fn descriptor(&self) -> ClassSpec {
            ClassSpec::new("Counter")
                .property(PropSpec::read_write("count"))
                .property(PropSpec {
                    name: "secret".into(),
                    flags: PropFlags::UNSUPPORTED,
                })
                .method("increment")
        }

        fn get(&self, property: &str) -> Result<Value, ScriptError> {
            match property {
                "count" => Ok(Value::Int(*self.count.lock().unwrap())),
                other => Err(ScriptError::new(format!("no property `{other}`"))),
            }
        }

        fn set(&self, property: &str, value: Value) -> Result<(), ScriptError> {
            match (property, value.as_int()) {
                ("count", Some(n)) => {
                    *self.count.lock().unwrap() = n;
                    Ok(())
                }
                _ => Err(ScriptError::new("count must be an integer")),
            }
        }

        fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<Value, ScriptError> {
            match method {
                "increment" => {
                    let mut count = self.count.lock().unwrap();
                    *count += 1;
                    Ok(Value::Int(*count))
                }
                other => Err(ScriptError::new(format!("no method `{other}`"))),
            }
        }
    }

    #[test]
    fn interning_is_keyed_by_identity() {
        let mut table = ProxyTable::new();
        let a = Counter::new();
        let b = Counter::new();
        let id_a = table.intern(a.clone());
        assert_eq!(table.intern(a.clone()), id_a);
        assert_ne!(table.intern(b), id_a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unwrap_unknown_id_is_not_a_proxy() {
        let table = ProxyTable::new();
        assert!(matches!(table.unwrap(99), Err(HandleError::NotAProxy)));
    }

    #[test]
    fn descriptor_drops_unsupported_properties() {
        let mut table = ProxyTable::new();
        let counter = Counter::new();
        let object: Arc<dyn NativeObject> = counter;
        let descriptor = table.descriptor_json(&object);
        let props = descriptor["properties"].as_array().unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0]["name"], "count");
        assert_eq!(props[0]["writable"], true);
        assert_eq!(descriptor["methods"][0], "increment");
    }

    #[test]
    fn nested_native_round_trips_to_the_same_object() {
        let mut table = ProxyTable::new();
        let counter = Counter::new();
        let value = Value::Object(IndexMap::from([(
            "counter".to_string(),
            Value::Native(counter.clone()),
        )]));
        let wire = json_from_value(&mut table, &value).unwrap();
        let id = wire["counter"]["__nativeProxy"]["id"].as_u64().unwrap();
        let revived = value_from_json(&table, &wire).unwrap();
        match revived.as_object().unwrap().get("counter") {
            Some(Value::Native(object)) => {
                assert_eq!(table.intern(object.clone()), id as u32);
            }
            other => panic!("expected native, got {other:?}"),
        }
    }

    #[test]
    fn functions_cannot_cross_a_property() {
        let mut table = ProxyTable::new();
        let value = Value::Callback(Arc::new(|_| Value::Undefined));
        assert!(json_from_value(&mut table, &value).is_err());
    }

    #[test]
    fn flags_compose() {
        let flags = PropFlags::READABLE | PropFlags::WRITABLE | PropFlags::COPY;
        assert!(flags.contains(PropFlags::READABLE));
        assert!(flags.contains(PropFlags::COPY));
        assert!(!flags.contains(PropFlags::WEAK));
    }
}
