//! The script runtime thread.
//!
//! Hosts the engine on a dedicated OS thread with a single-threaded Tokio
//! runtime. The thread builds the engine, injects native modules, evaluates
//! the bootstrap module, then executes queued [`IoEntry`] work in enqueue
//! order until told to stop. Results that resolve to promises are settled by
//! driving the engine's event loop.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::mpsc;

use crate::config::{BridgeConfig, ModuleBuilder, NativeModule, UncaughtHook};
use crate::convert::{exception_message, from_v8, to_v8};
use crate::error::{BridgeError, ScriptError};
use crate::ext::{self, BridgeTables, ScriptHandle};
use crate::handles::HandleId;
use crate::loader::BridgeModuleLoader;
use crate::queue::{BridgeResult, IoEntry, ReplySlot};
use crate::value::{FunctionRef, Value};

const PRELUDE: &str = include_str!("jsbridge.js");

/// Lifecycle of the runtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Created = 0,
    Bootstrapping = 1,
    Running = 2,
    Exiting = 3,
    Terminated = 4,
}

impl BridgeState {
    /// Whether entries may still be enqueued. A narrow race remains: the
    /// thread can exit between this check and the entry executing, in which
    /// case the entry is rejected instead of run.
    pub fn is_active(self) -> bool {
        matches!(self, BridgeState::Bootstrapping | BridgeState::Running)
    }

    pub(crate) fn from_u8(raw: u8) -> BridgeState {
        match raw {
            0 => BridgeState::Created,
            1 => BridgeState::Bootstrapping,
            2 => BridgeState::Running,
            3 => BridgeState::Exiting,
            _ => BridgeState::Terminated,
        }
    }
}

pub(crate) fn load_state(cell: &AtomicU8) -> BridgeState {
    BridgeState::from_u8(cell.load(Ordering::SeqCst))
}

pub(crate) fn store_state(cell: &AtomicU8, state: BridgeState) {
    cell.store(state as u8, Ordering::SeqCst);
}

/// Out-of-band events delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Script threw without being caught and no caller was waiting.
    UncaughtException(ScriptError),
    /// The runtime thread stopped; `error` is set when it stopped because
    /// bootstrap failed.
    RuntimeDidExit { error: Option<ScriptError> },
}

/// Spawns the runtime thread and blocks until its engine is constructed.
/// Bootstrap evaluation continues asynchronously; a bootstrap failure is
/// reported through the uncaught hook and notifications.
pub(crate) fn spawn_runtime(
    config: BridgeConfig,
    entries: mpsc::UnboundedReceiver<IoEntry>,
    state: Arc<AtomicU8>,
    notify: std_mpsc::Sender<Notification>,
) -> Result<std::thread::JoinHandle<()>, BridgeError> {
    let (init_tx, init_rx) = std_mpsc::channel::<Result<(), String>>();
    let thread_name = config.thread_name.clone();

    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || runtime_main(config, entries, state, notify, init_tx))
        .map_err(|e| BridgeError::Bootstrap(format!("failed to spawn runtime thread: {e}")))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(message)) => {
            let _ = handle.join();
            Err(BridgeError::Bootstrap(message))
        }
        Err(_) => {
            let _ = handle.join();
            Err(BridgeError::Bootstrap(
                "runtime thread died during initialization".to_string(),
            ))
        }
    }
}

fn runtime_main(
    config: BridgeConfig,
    mut entries: mpsc::UnboundedReceiver<IoEntry>,
    state: Arc<AtomicU8>,
    notify: std_mpsc::Sender<Notification>,
    init_tx: std_mpsc::Sender<Result<(), String>>,
) {
    store_state(&state, BridgeState::Bootstrapping);

    let BridgeConfig {
        bootstrap_path,
        library_dir,
        env,
        modules,
        uncaught_hook,
        ..
    } = config;

    let tokio_rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = init_tx.send(Err(format!("failed to build tokio runtime: {e}")));
            store_state(&state, BridgeState::Terminated);
            return;
        }
    };

    let mut core = match RuntimeCore::new(
        bootstrap_path,
        library_dir,
        env,
        uncaught_hook,
        notify.clone(),
    ) {
        Ok(core) => {
            let _ = init_tx.send(Ok(()));
            core
        }
        Err(message) => {
            let _ = init_tx.send(Err(message));
            store_state(&state, BridgeState::Terminated);
            return;
        }
    };

    ext::install_tables(core.tables.clone());

    let exit_error = tokio_rt.block_on(async {
        if let Err(err) = core.inject_modules(modules) {
            let error = ScriptError::new(err.to_string());
            core.report_uncaught(&error);
            return Some(error);
        }
        match core.bootstrap().await {
            Err(err) => {
                let error = ScriptError::new(err.to_string());
                core.report_uncaught(&error);
                Some(error)
            }
            Ok(()) => {
                store_state(&state, BridgeState::Running);
                core.run(&mut entries).await;
                None
            }
        }
    });

    store_state(&state, BridgeState::Exiting);

    // Entries that raced past the state check get rejected, not run.
    entries.close();
    while let Ok(entry) = entries.try_recv() {
        log::debug!("dropping {} entry after shutdown", entry.describe());
        entry.abort();
    }

    core.teardown();
    ext::uninstall_tables();
    store_state(&state, BridgeState::Terminated);
    let _ = notify.send(Notification::RuntimeDidExit { error: exit_error });
    log::info!("runtime thread exited");
}

/// The engine plus its runtime-thread tables. Handed to transactions so
/// they can evaluate script with full engine access.
pub struct RuntimeCore {
    js_runtime: JsRuntime,
    pub(crate) tables: BridgeTables,
    bootstrap_path: PathBuf,
    uncaught_hook: Option<UncaughtHook>,
    notify: std_mpsc::Sender<Notification>,
}

impl RuntimeCore {
    fn new(
        bootstrap_path: PathBuf,
        library_dir: Option<PathBuf>,
        env: Vec<(String, String)>,
        uncaught_hook: Option<UncaughtHook>,
        notify: std_mpsc::Sender<Notification>,
    ) -> Result<Self, String> {
        let library_dir = library_dir
            .or_else(|| bootstrap_path.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        let tables = BridgeTables::new();
        let loader = Rc::new(BridgeModuleLoader::new(library_dir));

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            module_loader: Some(loader),
            extensions: vec![ext::jsbridge_ext::init_ops(tables.clone(), env)],
            ..Default::default()
        });

        js_runtime
            .execute_script("jsbridge:prelude", PRELUDE.to_string())
            .map_err(|e| format!("prelude failed: {e}"))?;

        Ok(Self {
            js_runtime,
            tables,
            bootstrap_path,
            uncaught_hook,
            notify,
        })
    }

    /// Evaluates a script chunk and converts its completion value. Intended
    /// for transaction closures.
    pub fn eval(&mut self, code: &str) -> BridgeResult {
        match self.js_runtime.execute_script("jsbridge:eval", code.to_string()) {
            Ok(value) => {
                let scope = &mut self.js_runtime.handle_scope();
                let local = v8::Local::new(scope, &value);
                from_v8(&self.tables, scope, local)
            }
            Err(err) => Err(ScriptError::new(err.to_string()).into()),
        }
    }

    fn inject_modules(&mut self, modules: Vec<NativeModule>) -> Result<(), BridgeError> {
        for module in modules {
            let NativeModule { name, init } = module;
            let mut builder = ModuleBuilder::new();
            init(&mut builder);
            let members = builder.into_entries();

            let scope = &mut self.js_runtime.handle_scope();
            let object = v8::Object::new(scope);
            for (key, value) in &members {
                let key_v8 = v8::String::new(scope, key)
                    .ok_or_else(|| BridgeError::marshal("module member name too large"))?;
                let converted = to_v8(&self.tables, scope, value)?;
                object.set(scope, key_v8.into(), converted);
            }

            let as_value: v8::Local<v8::Value> = object.into();
            let pinned = v8::Global::new(scope, as_value);
            let id = self.tables.handles.borrow_mut().create(
                ScriptHandle {
                    value: pinned,
                    receiver: None,
                },
                true,
            )?;
            if let Some(previous) = self.tables.registry.borrow_mut().register(name.clone(), id) {
                let _ = self.tables.handles.borrow_mut().dispose(previous);
            }

            let global = scope.get_current_context().global(scope);
            let name_v8 = v8::String::new(scope, &name)
                .ok_or_else(|| BridgeError::marshal("module name too large"))?;
            global.set(scope, name_v8.into(), as_value);
            log::debug!("injected native module `{name}`");
        }
        Ok(())
    }

    async fn bootstrap(&mut self) -> Result<(), BridgeError> {
        let specifier = deno_core::ModuleSpecifier::from_file_path(&self.bootstrap_path)
            .map_err(|_| {
                BridgeError::Bootstrap(format!(
                    "bootstrap path {:?} is not absolute",
                    self.bootstrap_path
                ))
            })?;

        let module_id = self
            .js_runtime
            .load_main_es_module(&specifier)
            .await
            .map_err(|e| BridgeError::Bootstrap(e.to_string()))?;

        let evaluated = self.js_runtime.mod_evaluate(module_id);
        self.js_runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
            .map_err(|e| BridgeError::Bootstrap(e.to_string()))?;
        evaluated
            .await
            .map_err(|e| BridgeError::Bootstrap(e.to_string()))?;

        log::info!("bootstrap {:?} evaluated", self.bootstrap_path);
        Ok(())
    }

    async fn run(&mut self, entries: &mut mpsc::UnboundedReceiver<IoEntry>) {
        while let Some(entry) = entries.recv().await {
            log::trace!("dequeued {} entry", entry.describe());
            match entry {
                IoEntry::Shutdown => break,
                IoEntry::Transaction { perform, reply } => {
                    let result = perform(self);
                    self.finish(result, reply);
                }
                IoEntry::Invoke {
                    target,
                    function,
                    args,
                    reply,
                } => {
                    let result = self.invoke(&target, &function, args).await;
                    self.finish(result, reply);
                }
                IoEntry::Emit {
                    target,
                    event,
                    args,
                    reply,
                } => {
                    let result = self.emit(&target, &event, args);
                    self.finish(result, reply);
                }
                IoEntry::CallHandle {
                    function,
                    args,
                    reply,
                } => {
                    let result = self.call_handle(function, args).await;
                    self.finish(result, reply);
                }
                IoEntry::ReleaseHandle { function } => {
                    let disposed = self
                        .tables
                        .handles
                        .borrow_mut()
                        .dispose(HandleId(function.id));
                    if let Err(err) = disposed {
                        log::debug!("release-handle: {err}");
                    }
                }
            }
        }
    }

    /// Routes a finished entry's result. Errors on fire-and-forget entries
    /// have no caller to reach, so script failures go to the uncaught hook.
    fn finish(&mut self, result: BridgeResult, reply: ReplySlot) {
        match reply {
            ReplySlot::Ignore => match &result {
                Err(BridgeError::Script(err)) => self.report_uncaught(err),
                Err(err) => log::warn!("fire-and-forget entry failed: {err}"),
                Ok(_) => {}
            },
            other => other.deliver(result),
        }
    }

    async fn invoke(&mut self, target: &str, function: &str, args: Vec<Value>) -> BridgeResult {
        let pending = {
            let scope = &mut self.js_runtime.handle_scope();
            let target_value = resolve_target(scope, &self.tables, target)
                .ok_or_else(|| BridgeError::TargetNotFound(target.to_string()))?;
            let target_object = v8::Local::<v8::Object>::try_from(target_value)
                .map_err(|_| BridgeError::TargetNotFound(target.to_string()))?;

            let key = v8::String::new(scope, function)
                .ok_or_else(|| BridgeError::marshal("function name too large"))?;
            let callee = target_object
                .get(scope, key.into())
                .unwrap_or_else(|| v8::undefined(scope).into());
            if !callee.is_function() {
                return Err(BridgeError::FunctionNotFound {
                    function: function.to_string(),
                    target: target.to_string(),
                });
            }
            let callee = v8::Local::<v8::Function>::try_from(callee)
                .map_err(|_| BridgeError::marshal("callee is not callable"))?;

            let mut call_args = Vec::with_capacity(args.len());
            for arg in &args {
                call_args.push(to_v8(&self.tables, scope, arg)?);
            }

            let recv: v8::Local<v8::Value> = target_object.into();
            let tc = &mut v8::TryCatch::new(scope);
            match callee.call(tc, recv, &call_args) {
                Some(returned) => v8::Global::new(tc, returned),
                None => return Err(ScriptError::new(exception_message(tc)).into()),
            }
        };
        self.resolve_value(pending).await
    }

    /// `target.emit(event, args...)`. A missing target or emitter is a
    /// no-op; events with no listeners are not an error.
    fn emit(&mut self, target: &str, event: &str, args: Vec<Value>) -> BridgeResult {
        let scope = &mut self.js_runtime.handle_scope();
        let Some(target_value) = resolve_target(scope, &self.tables, target) else {
            log::debug!("emit `{event}`: no target `{target}`");
            return Ok(Value::Undefined);
        };
        let Ok(target_object) = v8::Local::<v8::Object>::try_from(target_value) else {
            return Ok(Value::Undefined);
        };

        let key = v8::String::new(scope, "emit")
            .ok_or_else(|| BridgeError::marshal("failed to intern key"))?;
        let emitter = target_object
            .get(scope, key.into())
            .unwrap_or_else(|| v8::undefined(scope).into());
        if !emitter.is_function() {
            log::debug!("emit `{event}`: target `{target}` has no emitter");
            return Ok(Value::Undefined);
        }
        let emitter = v8::Local::<v8::Function>::try_from(emitter)
            .map_err(|_| BridgeError::marshal("emitter is not callable"))?;

        let mut call_args = Vec::with_capacity(args.len() + 1);
        let event_name = v8::String::new(scope, event)
            .ok_or_else(|| BridgeError::marshal("event name too large"))?;
        call_args.push(event_name.into());
        for arg in &args {
            call_args.push(to_v8(&self.tables, scope, arg)?);
        }

        let recv: v8::Local<v8::Value> = target_object.into();
        let tc = &mut v8::TryCatch::new(scope);
        if emitter.call(tc, recv, &call_args).is_none() {
            return Err(ScriptError::new(exception_message(tc)).into());
        }
        Ok(Value::Undefined)
    }

    async fn call_handle(&mut self, function: FunctionRef, args: Vec<Value>) -> BridgeResult {
        let pending = {
            let scope = &mut self.js_runtime.handle_scope();
            let (callee, recv) = {
                let handles = self.tables.handles.borrow();
                let handle = handles.unwrap(HandleId(function.id))?;
                let callee = v8::Local::new(scope, &handle.value);
                let recv: v8::Local<v8::Value> = match &handle.receiver {
                    Some(receiver) => v8::Local::new(scope, receiver),
                    None => scope.get_current_context().global(scope).into(),
                };
                (callee, recv)
            };
            let callee = v8::Local::<v8::Function>::try_from(callee)
                .map_err(|_| BridgeError::marshal("handle is not a function"))?;

            let mut call_args = Vec::with_capacity(args.len());
            for arg in &args {
                call_args.push(to_v8(&self.tables, scope, arg)?);
            }

            let tc = &mut v8::TryCatch::new(scope);
            match callee.call(tc, recv, &call_args) {
                Some(returned) => v8::Global::new(tc, returned),
                None => return Err(ScriptError::new(exception_message(tc)).into()),
            }
        };
        self.resolve_value(pending).await
    }

    /// Settles a promise result by driving the event loop; plain values
    /// convert directly.
    async fn resolve_value(&mut self, value: v8::Global<v8::Value>) -> BridgeResult {
        let needs_resolution = {
            let scope = &mut self.js_runtime.handle_scope();
            v8::Local::new(scope, &value).is_promise()
        };

        let resolved = if needs_resolution {
            let future = self.js_runtime.resolve(value);
            self.js_runtime
                .with_event_loop_promise(future, PollEventLoopOptions::default())
                .await
                .map_err(|e| BridgeError::Script(ScriptError::new(e.to_string())))?
        } else {
            value
        };

        let scope = &mut self.js_runtime.handle_scope();
        let local = v8::Local::new(scope, &resolved);
        from_v8(&self.tables, scope, local)
    }

    pub(crate) fn report_uncaught(&self, error: &ScriptError) {
        log::error!("uncaught script exception: {}", error.message);
        if let Some(hook) = &self.uncaught_hook {
            hook(error);
        }
        let _ = self
            .notify
            .send(Notification::UncaughtException(error.clone()));
    }

    fn teardown(&mut self) {
        let registered = self.tables.registry.borrow_mut().unregister_all();
        for id in registered {
            let _ = self.tables.handles.borrow_mut().dispose(id);
        }
        let leaked = self.tables.handles.borrow_mut().dispose_all();
        if leaked > 0 {
            log::debug!("{leaked} handles still live at shutdown");
        }
        self.tables.proxies.borrow_mut().release_all();
        self.tables.callbacks.borrow_mut().clear();
    }
}

/// Registered objects win; otherwise a global object of that name.
fn resolve_target<'s>(
    scope: &mut v8::HandleScope<'s>,
    tables: &BridgeTables,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let registered = tables.registry.borrow().lookup(name);
    if let Some(id) = registered {
        if let Ok(handle) = tables.handles.borrow().unwrap(id) {
            return Some(v8::Local::new(scope, &handle.value));
        }
    }
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, name)?;
    let value = global.get(scope, key.into())?;
    value.is_object().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            BridgeState::Created,
            BridgeState::Bootstrapping,
            BridgeState::Running,
            BridgeState::Exiting,
            BridgeState::Terminated,
        ] {
            assert_eq!(BridgeState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn active_only_while_bootstrapping_or_running() {
        assert!(!BridgeState::Created.is_active());
        assert!(BridgeState::Bootstrapping.is_active());
        assert!(BridgeState::Running.is_active());
        assert!(!BridgeState::Exiting.is_active());
        assert!(!BridgeState::Terminated.is_active());
    }

    #[test]
    fn atomic_state_cell_round_trips() {
        let cell = AtomicU8::new(BridgeState::Created as u8);
        store_state(&cell, BridgeState::Running);
        assert_eq!(load_state(&cell), BridgeState::Running);
    }
}
