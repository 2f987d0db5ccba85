//! Bridge configuration.
//!
//! [`BridgeConfig`] gathers everything decided before the runtime thread
//! starts: the bootstrap script, the module library directory, environment
//! overrides, and native modules to inject during bootstrap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ScriptError;
use crate::proxy::NativeObject;
use crate::value::{HostFn, Value};

/// Hook invoked on the runtime thread whenever script code throws without
/// being caught and no caller is waiting for the result.
pub type UncaughtHook = Box<dyn Fn(&ScriptError) + Send>;

/// Collects the members of a native module during injection. Entries keep
/// insertion order; script sees them as properties of one module object.
pub struct ModuleBuilder {
    entries: Vec<(String, Value)>,
}

impl ModuleBuilder {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds a plain data member.
    pub fn value(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// Adds a host function. It runs on the runtime thread.
    pub fn function<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Value + Send + Sync + 'static,
    {
        let f: HostFn = Arc::new(f);
        self.entries.push((name.into(), Value::Callback(f)));
        self
    }

    /// Adds a host object exposed through the proxy bridge.
    pub fn object(&mut self, name: impl Into<String>, object: Arc<dyn NativeObject>) -> &mut Self {
        self.entries.push((name.into(), Value::Native(object)));
        self
    }

    pub(crate) fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }
}

type ModuleInit = Box<dyn FnOnce(&mut ModuleBuilder) + Send>;

/// A native module injected during bootstrap. The initializer runs once on
/// the runtime thread before the bootstrap script evaluates; the resulting
/// object is registered under `name` and placed on the global namespace.
pub struct NativeModule {
    pub(crate) name: String,
    pub(crate) init: ModuleInit,
}

impl NativeModule {
    pub fn new(name: impl Into<String>, init: impl FnOnce(&mut ModuleBuilder) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            init: Box::new(init),
        }
    }
}

/// Everything the runtime thread needs to start.
pub struct BridgeConfig {
    /// Entry-point script, evaluated once after the engine is ready.
    pub bootstrap_path: PathBuf,
    /// Root for bare module specifiers; defaults to the bootstrap's parent.
    pub library_dir: Option<PathBuf>,
    /// Environment overrides visible to script via the bridge namespace.
    pub env: Vec<(String, String)>,
    /// Deadline for synchronous invocations.
    pub sync_timeout: Duration,
    /// Name of the spawned runtime thread.
    pub thread_name: String,
    pub(crate) modules: Vec<NativeModule>,
    pub(crate) uncaught_hook: Option<UncaughtHook>,
}

impl BridgeConfig {
    pub fn new(bootstrap_path: impl Into<PathBuf>) -> Self {
        Self {
            bootstrap_path: bootstrap_path.into(),
            library_dir: None,
            env: Vec::new(),
            sync_timeout: Duration::from_secs(30),
            thread_name: "jsbridge-runtime".to_string(),
            modules: Vec::new(),
            uncaught_hook: None,
        }
    }

    pub fn library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Installs the uncaught-exception hook.
    pub fn on_uncaught_exception(
        mut self,
        hook: impl Fn(&ScriptError) + Send + 'static,
    ) -> Self {
        self.uncaught_hook = Some(Box::new(hook));
        self
    }

    /// Queues a native module for injection during bootstrap.
    pub fn module(
        mut self,
        name: impl Into<String>,
        init: impl FnOnce(&mut ModuleBuilder) + Send + 'static,
    ) -> Self {
        self.modules.push(NativeModule::new(name, init));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_builder_keeps_insertion_order() {
        let mut builder = ModuleBuilder::new();
        builder
            .value("version", "1.0")
            .function("ping", |_| Value::String("pong".into()))
            .value("answer", 42i64);
        let entries = builder.into_entries();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["version", "ping", "answer"]);
        assert_eq!(entries[2].1, Value::Int(42));
    }

    #[test]
    fn config_defaults() {
        let config = BridgeConfig::new("/tmp/main.js");
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
        assert!(config.library_dir.is_none());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn config_chains() {
        let config = BridgeConfig::new("/tmp/main.js")
            .library_dir("/tmp/lib")
            .env("MODE", "test")
            .module("host", |m| {
                m.value("ready", true);
            });
        assert_eq!(config.library_dir.as_deref(), Some(std::path::Path::new("/tmp/lib")));
        assert_eq!(config.env, vec![("MODE".to_string(), "test".to_string())]);
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.modules[0].name, "host");
    }
}
