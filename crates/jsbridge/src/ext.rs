//! Engine extension: shared runtime-thread tables and the ops that script
//! code uses to reach the host.
//!
//! Everything here runs on the runtime thread. The tables live behind
//! `Rc<RefCell<..>>` cells shared between the runtime core, the op state,
//! and the host-callback trampolines (which reach them through a
//! thread-local because the engine hands trampolines no other context).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use deno_core::error::AnyError;
use deno_core::{extension, op2, v8, OpState};

use crate::error::BridgeError;
use crate::handles::{HandleTable, ObjectRegistry};
use crate::proxy::{json_from_value, value_from_json, ProxyTable};
use crate::value::HostFn;

/// A pinned script value plus the receiver to call it with when it was
/// captured as a property of an object.
pub(crate) struct ScriptHandle {
    pub value: v8::Global<v8::Value>,
    pub receiver: Option<v8::Global<v8::Value>>,
}

/// Host closures exposed to script as plain functions. Keyed by the id
/// embedded in each trampoline's data slot.
pub(crate) struct CallbackTable {
    map: HashMap<u32, HostFn>,
    next_id: u32,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, f: HostFn) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, f);
        id
    }

    pub fn get(&self, id: u32) -> Option<HostFn> {
        self.map.get(&id).cloned()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// The runtime thread's shared state cells.
#[derive(Clone)]
pub(crate) struct BridgeTables {
    pub handles: Rc<RefCell<HandleTable<ScriptHandle>>>,
    pub registry: Rc<RefCell<ObjectRegistry>>,
    pub proxies: Rc<RefCell<ProxyTable>>,
    pub callbacks: Rc<RefCell<CallbackTable>>,
}

impl BridgeTables {
    pub fn new() -> Self {
        Self {
            handles: Rc::new(RefCell::new(HandleTable::new())),
            registry: Rc::new(RefCell::new(ObjectRegistry::new())),
            proxies: Rc::new(RefCell::new(ProxyTable::new())),
            callbacks: Rc::new(RefCell::new(CallbackTable::new())),
        }
    }
}

thread_local! {
    // Set while the runtime core owns the thread; read by trampolines.
    static ACTIVE_TABLES: RefCell<Option<BridgeTables>> = const { RefCell::new(None) };
}

pub(crate) fn install_tables(tables: BridgeTables) {
    ACTIVE_TABLES.with(|cell| *cell.borrow_mut() = Some(tables));
}

pub(crate) fn uninstall_tables() {
    ACTIVE_TABLES.with(|cell| cell.borrow_mut().take());
}

pub(crate) fn with_tables<R>(f: impl FnOnce(&BridgeTables) -> R) -> Option<R> {
    ACTIVE_TABLES.with(|cell| cell.borrow().as_ref().map(f))
}

/// Environment snapshot exposed to script.
pub(crate) struct BridgeEnv(pub Vec<(String, String)>);

#[op2]
fn op_bridge_register_object(
    scope: &mut v8::HandleScope,
    state: &mut OpState,
    #[string] name: String,
    #[global] value: v8::Global<v8::Value>,
) -> Result<(), AnyError> {
    let tables = state.borrow::<BridgeTables>().clone();
    let is_object = v8::Local::new(scope, &value).is_object();
    let id = tables
        .handles
        .borrow_mut()
        .create(
            ScriptHandle {
                value,
                receiver: None,
            },
            is_object,
        )
        .map_err(BridgeError::from)?;
    log::debug!("register object `{name}`");
    let displaced = tables.registry.borrow_mut().register(name, id);
    if let Some(previous) = displaced {
        let _ = tables.handles.borrow_mut().dispose(previous);
    }
    Ok(())
}

#[op2(fast)]
fn op_bridge_unregister_object(state: &mut OpState, #[string] name: String) -> bool {
    let tables = state.borrow::<BridgeTables>().clone();
    let removed = match tables.registry.borrow_mut().unregister(&name) {
        Some(id) => {
            let _ = tables.handles.borrow_mut().dispose(id);
            log::debug!("unregister object `{name}`");
            true
        }
        None => false,
    };
    removed
}

#[op2]
#[serde]
fn op_bridge_env(state: &mut OpState) -> serde_json::Value {
    let env = state.borrow::<BridgeEnv>();
    let mut map = serde_json::Map::with_capacity(env.0.len());
    for (key, value) in &env.0 {
        map.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map)
}

#[op2(fast)]
fn op_bridge_log(#[string] level: String, #[string] message: String) {
    let level = match level.as_str() {
        "error" => log::Level::Error,
        "warn" => log::Level::Warn,
        "debug" => log::Level::Debug,
        _ => log::Level::Info,
    };
    log::log!(level, "[js] {message}");
}

#[op2]
#[serde]
fn op_proxy_get(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] property: String,
) -> Result<serde_json::Value, AnyError> {
    let tables = state.borrow::<BridgeTables>().clone();
    let object = tables.proxies.borrow().unwrap(id).map_err(BridgeError::from)?;
    let value = object.get(&property)?;
    let json = json_from_value(&mut tables.proxies.borrow_mut(), &value)?;
    Ok(json)
}

#[op2]
fn op_proxy_set(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] property: String,
    #[serde] value: serde_json::Value,
) -> Result<(), AnyError> {
    let tables = state.borrow::<BridgeTables>().clone();
    let object = tables.proxies.borrow().unwrap(id).map_err(BridgeError::from)?;
    let value = value_from_json(&tables.proxies.borrow(), &value).map_err(BridgeError::from)?;
    object.set(&property, value)?;
    Ok(())
}

#[op2]
#[serde]
fn op_proxy_invoke(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] method: String,
    #[serde] args: Vec<serde_json::Value>,
) -> Result<serde_json::Value, AnyError> {
    let tables = state.borrow::<BridgeTables>().clone();
    let object = tables.proxies.borrow().unwrap(id).map_err(BridgeError::from)?;
    let args = {
        let proxies = tables.proxies.borrow();
        args.iter()
            .map(|a| value_from_json(&proxies, a))
            .collect::<Result<Vec<_>, _>>()
            .map_err(BridgeError::from)?
    };
    let result = object.invoke(&method, args)?;
    let json = json_from_value(&mut tables.proxies.borrow_mut(), &result)?;
    Ok(json)
}

extension!(
    jsbridge_ext,
    ops = [
        op_bridge_register_object,
        op_bridge_unregister_object,
        op_bridge_env,
        op_bridge_log,
        op_proxy_get,
        op_proxy_set,
        op_proxy_invoke,
    ],
    options = {
        tables: BridgeTables,
        env: Vec<(String, String)>,
    },
    state = |state, options| {
        state.put(options.tables);
        state.put(BridgeEnv(options.env));
    },
);
