//! Bidirectional bridge between host code and an embedded V8 runtime.
//!
//! The runtime lives on its own thread and owns the engine outright; host
//! threads talk to it through a FIFO work queue and get results back either
//! by blocking (with a deadline) or as callbacks dispatched onto a callback
//! queue they pump. Script reaches the host through injected native modules,
//! host callbacks, and proxied native objects.
//!
//! ```no_run
//! use jsbridge::{Bridge, BridgeConfig, Value};
//!
//! let bridge = Bridge::start(
//!     BridgeConfig::new("/app/runtime/main.js")
//!         .module("host", |m| {
//!             m.value("version", "1.0");
//!         }),
//! )?;
//!
//! let sum = bridge.invoke_function_sync("exampleModule", "add", vec![
//!     Value::Int(2),
//!     Value::Int(3),
//! ])?;
//! assert_eq!(sum, Value::Int(5));
//!
//! bridge.emit_event("exampleModule", "ready", vec![])?;
//! # Ok::<(), jsbridge::BridgeError>(())
//! ```

mod config;
mod convert;
mod error;
mod ext;
mod handles;
mod loader;
mod proxy;
mod queue;
mod runner;
mod string;
mod value;

pub use config::{BridgeConfig, ModuleBuilder, NativeModule, UncaughtHook};
pub use error::{BridgeError, HandleError, ScriptError};
pub use handles::HandleId;
pub use proxy::{ClassSpec, NativeObject, PropFlags, PropSpec};
pub use queue::{BridgeResult, CallbackQueue, CallbackSink, ResultCallback};
pub use runner::{BridgeState, Notification, RuntimeCore};
pub use string::ExternalUtf16;
pub use value::{FunctionRef, HostFn, Value};

use std::sync::atomic::AtomicU8;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use queue::{IoEntry, ReplySlot};

/// Handle to a running bridge. Cheap to share by reference across threads;
/// dropping it shuts the runtime down.
pub struct Bridge {
    entries: tokio::sync::mpsc::UnboundedSender<IoEntry>,
    state: Arc<AtomicU8>,
    notifications: Mutex<std_mpsc::Receiver<Notification>>,
    sink: Option<CallbackSink>,
    sync_timeout: Duration,
    runtime_thread: Option<JoinHandle<()>>,
    runtime_thread_id: ThreadId,
    pump_thread: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts the runtime thread and blocks until its engine is ready.
    /// Bootstrap evaluation continues in the background; check
    /// [`notifications`](Self::poll_notification) or install an uncaught
    /// hook to observe bootstrap failures.
    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let sync_timeout = config.sync_timeout;
        let (entries_tx, entries_rx) = tokio::sync::mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = std_mpsc::channel();
        let state = Arc::new(AtomicU8::new(BridgeState::Created as u8));

        let runtime_thread =
            runner::spawn_runtime(config, entries_rx, state.clone(), notify_tx)?;
        let runtime_thread_id = runtime_thread.thread().id();

        // Default delivery queue for async results, pumped on its own thread.
        let (sink, callback_queue) = CallbackQueue::channel();
        let pump_thread = std::thread::Builder::new()
            .name("jsbridge-callbacks".to_string())
            .spawn(move || callback_queue.run())
            .map_err(|e| BridgeError::Bootstrap(format!("failed to spawn callback pump: {e}")))?;

        Ok(Self {
            entries: entries_tx,
            state,
            notifications: Mutex::new(notify_rx),
            sink: Some(sink),
            sync_timeout,
            runtime_thread: Some(runtime_thread),
            runtime_thread_id,
            pump_thread: Some(pump_thread),
        })
    }

    pub fn state(&self) -> BridgeState {
        runner::load_state(&self.state)
    }

    /// Whether new entries may be enqueued. Subject to the documented race:
    /// the runtime can exit between this check and the entry executing.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// A sink that delivers callbacks on the bridge's default pump thread.
    pub fn callback_sink(&self) -> Option<CallbackSink> {
        self.sink.clone()
    }

    /// Emits `event` on the named target. Fire and forget; a missing target
    /// or a target without listeners is a no-op.
    pub fn emit_event(
        &self,
        target: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BridgeError> {
        self.enqueue(IoEntry::Emit {
            target: target.into(),
            event: event.into(),
            args,
            reply: ReplySlot::Ignore,
        })
    }

    /// Calls `target.function(args...)`, delivering the result on the
    /// bridge's default callback queue.
    pub fn invoke_function(
        &self,
        target: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
        callback: impl FnOnce(BridgeResult) + Send + 'static,
    ) -> Result<(), BridgeError> {
        let sink = self.sink.clone().ok_or(BridgeError::RuntimeUnavailable)?;
        self.invoke_function_on(target, function, args, sink, callback)
    }

    /// Like [`invoke_function`](Self::invoke_function), delivering on a
    /// caller-supplied queue instead.
    pub fn invoke_function_on(
        &self,
        target: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
        sink: CallbackSink,
        callback: impl FnOnce(BridgeResult) + Send + 'static,
    ) -> Result<(), BridgeError> {
        self.enqueue(IoEntry::Invoke {
            target: target.into(),
            function: function.into(),
            args,
            reply: ReplySlot::Sink {
                sink,
                callback: Box::new(callback),
            },
        })
    }

    /// Calls `target.function(args...)` and blocks for the result, up to
    /// the configured deadline. Refused on the runtime thread itself, where
    /// blocking would deadlock the queue.
    pub fn invoke_function_sync(
        &self,
        target: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> BridgeResult {
        self.rendezvous(|reply| IoEntry::Invoke {
            target: target.into(),
            function: function.into(),
            args,
            reply,
        })
    }

    /// Runs an arbitrary closure on the runtime thread with engine access,
    /// delivering the result on the default callback queue.
    pub fn perform(
        &self,
        transaction: impl FnOnce(&mut RuntimeCore) -> BridgeResult + Send + 'static,
        callback: impl FnOnce(BridgeResult) + Send + 'static,
    ) -> Result<(), BridgeError> {
        let sink = self.sink.clone().ok_or(BridgeError::RuntimeUnavailable)?;
        self.enqueue(IoEntry::Transaction {
            perform: Box::new(transaction),
            reply: ReplySlot::Sink {
                sink,
                callback: Box::new(callback),
            },
        })
    }

    /// Blocking form of [`perform`](Self::perform).
    pub fn perform_sync(
        &self,
        transaction: impl FnOnce(&mut RuntimeCore) -> BridgeResult + Send + 'static,
    ) -> BridgeResult {
        self.rendezvous(|reply| IoEntry::Transaction {
            perform: Box::new(transaction),
            reply,
        })
    }

    /// Calls a captured script function, delivering the result on the
    /// default callback queue.
    pub fn call_function(
        &self,
        function: FunctionRef,
        args: Vec<Value>,
        callback: impl FnOnce(BridgeResult) + Send + 'static,
    ) -> Result<(), BridgeError> {
        let sink = self.sink.clone().ok_or(BridgeError::RuntimeUnavailable)?;
        self.enqueue(IoEntry::CallHandle {
            function,
            args,
            reply: ReplySlot::Sink {
                sink,
                callback: Box::new(callback),
            },
        })
    }

    /// Blocking form of [`call_function`](Self::call_function).
    pub fn call_function_sync(&self, function: FunctionRef, args: Vec<Value>) -> BridgeResult {
        self.rendezvous(|reply| IoEntry::CallHandle {
            function,
            args,
            reply,
        })
    }

    /// Releases a captured script function. Must be called exactly once per
    /// capture; forgotten handles are reclaimed only at shutdown.
    pub fn release_function(&self, function: FunctionRef) -> Result<(), BridgeError> {
        self.enqueue(IoEntry::ReleaseHandle { function })
    }

    /// Next pending notification, if any.
    pub fn poll_notification(&self) -> Option<Notification> {
        self.notifications
            .lock()
            .ok()
            .and_then(|rx| rx.try_recv().ok())
    }

    /// Blocks up to `timeout` for the next notification.
    pub fn wait_notification(&self, timeout: Duration) -> Option<Notification> {
        self.notifications
            .lock()
            .ok()
            .and_then(|rx| rx.recv_timeout(timeout).ok())
    }

    /// Stops the runtime thread after the entries already queued, waits for
    /// it, and tears down the callback pump. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.entries.send(IoEntry::Shutdown);
        if let Some(handle) = self.runtime_thread.take() {
            let _ = handle.join();
        }
        // Close the pump explicitly: callers may still hold sink clones from
        // `callback_sink`, so waiting for every sender to drop could block
        // forever. Results already posted are drained first.
        if let Some(sink) = self.sink.take() {
            sink.close();
        }
        if let Some(pump) = self.pump_thread.take() {
            let _ = pump.join();
        }
    }

    fn enqueue(&self, entry: IoEntry) -> Result<(), BridgeError> {
        if !self.is_active() {
            return Err(BridgeError::RuntimeUnavailable);
        }
        self.entries
            .send(entry)
            .map_err(|_| BridgeError::RuntimeUnavailable)
    }

    fn rendezvous(&self, build: impl FnOnce(ReplySlot) -> IoEntry) -> BridgeResult {
        if std::thread::current().id() == self.runtime_thread_id {
            return Err(BridgeError::WouldDeadlock);
        }
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.enqueue(build(ReplySlot::Rendezvous(tx)))?;
        match rx.recv_timeout(self.sync_timeout) {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.sync_timeout)),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
