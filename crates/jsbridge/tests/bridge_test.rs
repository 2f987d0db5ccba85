//! End-to-end tests against a real runtime thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use jsbridge::{
    Bridge, BridgeConfig, BridgeError, BridgeState, ClassSpec, ExternalUtf16, NativeObject,
    Notification, PropSpec, ScriptError, Value,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn start_basic() -> Bridge {
    Bridge::start(BridgeConfig::new(fixture("basic.js"))).expect("bridge should start")
}

#[test]
fn invokes_a_registered_function_synchronously() {
    let bridge = start_basic();
    let sum = bridge
        .invoke_function_sync("exampleModule", "add", vec![Value::Int(2), Value::Int(3)])
        .unwrap();
    assert_eq!(sum, Value::Int(5));
}

#[test]
fn unknown_target_and_function_are_distinct_errors() {
    let bridge = start_basic();

    match bridge.invoke_function_sync("nope", "add", vec![]) {
        Err(BridgeError::TargetNotFound(name)) => assert_eq!(name, "nope"),
        other => panic!("expected TargetNotFound, got {other:?}"),
    }

    match bridge.invoke_function_sync("exampleModule", "nope", vec![]) {
        Err(BridgeError::FunctionNotFound { function, target }) => {
            assert_eq!(function, "nope");
            assert_eq!(target, "exampleModule");
        }
        other => panic!("expected FunctionNotFound, got {other:?}"),
    }
}

#[test]
fn script_exception_reaches_the_blocked_caller() {
    let bridge = start_basic();
    match bridge.invoke_function_sync("exampleModule", "explode", vec![]) {
        Err(BridgeError::Script(err)) => assert!(err.message.contains("boom")),
        other => panic!("expected script error, got {other:?}"),
    }
}

#[test]
fn promise_results_are_settled_before_delivery() {
    let bridge = start_basic();
    let doubled = bridge
        .invoke_function_sync("exampleModule", "delayedDouble", vec![Value::Int(5)])
        .unwrap();
    assert_eq!(doubled, Value::Int(10));
}

#[test]
fn objects_round_trip_with_key_order() {
    let bridge = start_basic();
    let mut map = indexmap::IndexMap::new();
    map.insert("zulu".to_string(), Value::Int(1));
    map.insert("alpha".to_string(), Value::Array(vec![Value::Bool(true)]));
    let sent = Value::Object(map);

    let echoed = bridge
        .invoke_function_sync("exampleModule", "echo", vec![sent])
        .unwrap();
    let object = echoed.as_object().unwrap();
    let keys: Vec<&str> = object.keys().map(|k| k.as_str()).collect();
    assert_eq!(keys, ["zulu", "alpha"]);
    assert_eq!(object["zulu"], Value::Int(1));
}

#[test]
fn utf16_buffers_materialize_without_reencoding() {
    let bridge = start_basic();
    let len = bridge
        .invoke_function_sync(
            "exampleModule",
            "strlen",
            vec![Value::Utf16(ExternalUtf16::copy_from("héllo"))],
        )
        .unwrap();
    assert_eq!(len, Value::Int(5));
}

#[test]
fn env_entries_are_visible_to_script() {
    let bridge = Bridge::start(
        BridgeConfig::new(fixture("basic.js")).env("MODE", "integration"),
    )
    .unwrap();
    let mode = bridge
        .invoke_function_sync("exampleModule", "mode", vec![])
        .unwrap();
    assert_eq!(mode, Value::String("integration".into()));
}

#[test]
fn async_invocation_delivers_on_the_callback_queue() {
    let bridge = start_basic();
    let (tx, rx) = std::sync::mpsc::channel();
    bridge
        .invoke_function(
            "exampleModule",
            "add",
            vec![Value::Int(20), Value::Int(22)],
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(result.unwrap(), Value::Int(42));
}

#[test]
fn entries_execute_in_global_enqueue_order() {
    let bridge = Arc::new(start_basic());
    let ticket = Arc::new(Mutex::new(0i64));

    let mut producers = Vec::new();
    for _ in 0..4 {
        let bridge = bridge.clone();
        let ticket = ticket.clone();
        producers.push(std::thread::spawn(move || {
            for _ in 0..25 {
                // Enqueue under the lock so ticket order is queue order.
                let mut guard = ticket.lock().unwrap();
                let tag = *guard;
                bridge
                    .invoke_function("exampleModule", "record", vec![Value::Int(tag)], |_| {})
                    .unwrap();
                *guard += 1;
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    let log = bridge
        .invoke_function_sync("exampleModule", "getLog", vec![])
        .unwrap();
    let expected: Vec<Value> = (0..100).map(Value::Int).collect();
    assert_eq!(log, Value::Array(expected));
}

#[test]
fn emit_without_listeners_is_a_no_op() {
    let bridge = start_basic();
    bridge
        .emit_event("events", "unheard", vec![Value::Int(1)])
        .unwrap();
    // A missing target is equally silent.
    bridge.emit_event("ghost", "unheard", vec![]).unwrap();

    let seen = bridge
        .invoke_function_sync("events", "seen", vec![])
        .unwrap();
    assert_eq!(seen, Value::Array(vec![]));
}

#[test]
fn emit_reaches_listeners_in_order() {
    let bridge = start_basic();
    bridge
        .emit_event("events", "ping", vec![Value::String("one".into())])
        .unwrap();
    bridge
        .emit_event("events", "ping", vec![Value::String("two".into())])
        .unwrap();

    let seen = bridge
        .invoke_function_sync("events", "seen", vec![])
        .unwrap();
    assert_eq!(
        seen,
        Value::Array(vec![
            Value::String("one".into()),
            Value::String("two".into())
        ])
    );
}

#[test]
fn throwing_listener_surfaces_as_uncaught_notification() {
    let bridge = start_basic();
    bridge.emit_event("events", "bad", vec![]).unwrap();

    match bridge.wait_notification(Duration::from_secs(10)) {
        Some(Notification::UncaughtException(err)) => {
            assert!(err.message.contains("listener failed"));
        }
        other => panic!("expected uncaught notification, got {other:?}"),
    }
    // The runtime survives an uncaught listener exception.
    assert!(bridge.is_active());
}

#[test]
fn captured_functions_are_callable_until_released() {
    let bridge = start_basic();
    let adder = bridge
        .invoke_function_sync("exampleModule", "makeAdder", vec![Value::Int(32)])
        .unwrap();
    let adder = adder.as_function().expect("expected a function capture");

    let sum = bridge.call_function_sync(adder, vec![Value::Int(10)]).unwrap();
    assert_eq!(sum, Value::Int(42));

    bridge.release_function(adder).unwrap();
    assert!(bridge.call_function_sync(adder, vec![Value::Int(1)]).is_err());
}

#[test]
fn host_callbacks_are_callable_from_script() {
    let bridge = start_basic();
    let result = bridge
        .invoke_function_sync(
            "exampleModule",
            "callHost",
            vec![Value::Callback(Arc::new(|args| {
                match args.first().and_then(Value::as_int) {
                    Some(n) => Value::Int(n + 1),
                    None => Value::Null,
                }
            }))],
        )
        .unwrap();
    assert_eq!(result, Value::Int(8));
}

#[test]
fn circular_values_are_rejected() {
    let bridge = start_basic();
    let result = bridge.perform_sync(|core| core.eval("const a = { name: 'a' }; a.own = a; a"));
    match result {
        Err(BridgeError::Marshal(message)) => assert!(message.contains("circular")),
        other => panic!("expected marshal error, got {other:?}"),
    }
}

#[test]
fn shared_siblings_are_not_mistaken_for_cycles() {
    let bridge = start_basic();
    let result = bridge
        .perform_sync(|core| {
            core.eval("const shared = { n: 7 }; ({ left: shared, right: shared })")
        })
        .unwrap();
    let object = result.as_object().unwrap();
    assert_eq!(object["left"], object["right"]);
    assert_eq!(
        object["left"].as_object().unwrap()["n"],
        Value::Int(7)
    );
}

#[test]
fn transactions_evaluate_with_engine_access() {
    let bridge = start_basic();
    let answer = bridge.perform_sync(|core| core.eval("6 * 7")).unwrap();
    assert_eq!(answer, Value::Int(42));
}

#[test]
fn shutdown_rejects_later_entries() {
    let mut bridge = start_basic();
    bridge.shutdown();
    assert_eq!(bridge.state(), BridgeState::Terminated);
    match bridge.invoke_function_sync("exampleModule", "add", vec![]) {
        Err(BridgeError::RuntimeUnavailable) => {}
        other => panic!("expected RuntimeUnavailable, got {other:?}"),
    }
}

#[test]
fn shutdown_returns_while_a_caller_still_holds_a_sink() {
    let mut bridge = start_basic();
    let retained = bridge.callback_sink().expect("sink while active");

    let (tx, rx) = std::sync::mpsc::channel();
    bridge
        .invoke_function(
            "exampleModule",
            "add",
            vec![Value::Int(1), Value::Int(1)],
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();

    // Must not hang on the pump thread despite `retained` being alive.
    bridge.shutdown();
    assert_eq!(bridge.state(), BridgeState::Terminated);

    // The result enqueued before shutdown was still delivered.
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(result.unwrap(), Value::Int(2));

    // The retained sink is harmless after shutdown.
    retained.post(|| {});
}

#[test]
fn bootstrap_failure_fires_hook_once_and_terminates() {
    let hook_hits = Arc::new(AtomicUsize::new(0));
    let counted = hook_hits.clone();
    let bridge = Bridge::start(
        BridgeConfig::new(fixture("boom.js")).on_uncaught_exception(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let mut exit_error = None;
    for _ in 0..2 {
        match bridge.wait_notification(Duration::from_secs(10)) {
            Some(Notification::RuntimeDidExit { error }) => {
                exit_error = error;
                break;
            }
            Some(Notification::UncaughtException(_)) => continue,
            None => break,
        }
    }

    let error = exit_error.expect("runtime should exit with the bootstrap error");
    assert!(error.message.contains("bootstrap exploded"));
    assert_eq!(hook_hits.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.state(), BridgeState::Terminated);
    match bridge.invoke_function_sync("exampleModule", "add", vec![]) {
        Err(BridgeError::RuntimeUnavailable) => {}
        other => panic!("expected RuntimeUnavailable, got {other:?}"),
    }
}

// Shared counter exposed through the proxy bridge.
struct Counter {
    count: Mutex<i64>,
}

impl NativeObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    fn descriptor(&self) -> ClassSpec {
        ClassSpec::new("Counter")
            .property(PropSpec::read_write("count"))
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

fn start_with_host_module() -> (Bridge, Arc<Counter>, Arc<OnceLock<Bridge>>) {
    let counter = Arc::new(Counter {
        count: Mutex::new(0),
    });
    let injected = counter.clone();
    let cell: Arc<OnceLock<Bridge>> = Arc::new(OnceLock::new());
    let probe_cell = cell.clone();

    let bridge = Bridge::start(BridgeConfig::new(fixture("modules.js")).module(
        "host",
        move |m| {
            m.value("version", "1.0")
                .function("ping", |args| match args.first().and_then(Value::as_str) {
                    Some(s) => Value::String(format!("pong:{s}")),
                    None => Value::Null,
                })
                .function("probe", move |_| {
                    let blocked = probe_cell.get().map(|bridge| {
                        bridge.invoke_function_sync(
                            "exampleModule",
                            "add",
                            vec![Value::Int(1), Value::Int(2)],
                        )
                    });
                    Value::Bool(matches!(blocked, Some(Err(BridgeError::WouldDeadlock))))
                })
                .object("counter", injected.clone());
        },
    ))
    .unwrap();

    (bridge, counter, cell)
}

#[test]
fn injected_module_members_are_reachable_from_script() {
    let (bridge, _counter, _cell) = start_with_host_module();
    let version = bridge
        .invoke_function_sync("modHarness", "hostVersion", vec![])
        .unwrap();
    assert_eq!(version, Value::String("1.0".into()));

    let pong = bridge
        .invoke_function_sync("modHarness", "ping", vec![])
        .unwrap();
    assert_eq!(pong, Value::String("pong:from-js".into()));
}

#[test]
fn proxied_native_object_reflects_host_state() {
    let (bridge, counter, _cell) = start_with_host_module();

    assert_eq!(
        bridge
            .invoke_function_sync("modHarness", "counterValue", vec![])
            .unwrap(),
        Value::Int(0)
    );

    assert_eq!(
        bridge
            .invoke_function_sync("modHarness", "bumpCounter", vec![])
            .unwrap(),
        Value::Int(1)
    );
    assert_eq!(*counter.count.lock().unwrap(), 1);

    assert_eq!(
        bridge
            .invoke_function_sync("modHarness", "adjustCounter", vec![])
            .unwrap(),
        Value::Int(11)
    );
    assert_eq!(*counter.count.lock().unwrap(), 11);

    assert_eq!(
        bridge
            .invoke_function_sync("modHarness", "counterClass", vec![])
            .unwrap(),
        Value::String("Counter".into())
    );
}

#[test]
fn blocking_from_the_runtime_thread_is_refused() {
    let (bridge, _counter, cell) = start_with_host_module();
    // Park the bridge in the cell so the host callback can reach it.
    let bridge = match cell.set(bridge) {
        Ok(()) => cell.get().unwrap(),
        Err(_) => unreachable!("cell is set exactly once"),
    };

    let refused = bridge
        .invoke_function_sync("modHarness", "probe", vec![])
        .unwrap();
    assert_eq!(refused, Value::Bool(true));
}
