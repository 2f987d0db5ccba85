//! Command-line driver for the jsbridge runtime.
//!
//! Starts a bridge from a bootstrap script and either runs it until it
//! exits, invokes a single function, or emits a single event.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use jsbridge::{Bridge, BridgeConfig, Notification, Value};

#[derive(Parser, Debug)]
#[command(name = "jsbridge")]
#[command(author, version, about = "Host a JavaScript runtime from the command line")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Module library directory (defaults to the script's directory)
    #[arg(long, global = true)]
    lib: Option<PathBuf>,

    /// Environment entries exposed to script, KEY=VALUE
    #[arg(long = "env", global = true, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Deadline in seconds for synchronous calls
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bootstrap script until the runtime exits
    Run {
        /// Bootstrap script path
        script: PathBuf,
    },

    /// Invoke target.function(args...) and print the result
    Invoke {
        /// Bootstrap script path
        script: PathBuf,
        /// Registered object or global to address
        target: String,
        /// Function name on the target
        function: String,
        /// Arguments as JSON values
        #[arg(value_name = "JSON")]
        args: Vec<String>,
    },

    /// Emit an event on a target and exit
    Emit {
        /// Bootstrap script path
        script: PathBuf,
        /// Registered object or global to address
        target: String,
        /// Event name
        event: String,
        /// Arguments as JSON values
        #[arg(value_name = "JSON")]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let timeout = Duration::from_secs(cli.timeout);

    match &cli.command {
        Commands::Run { script } => {
            let bridge = start_bridge(script, &cli, timeout)?;
            run_until_exit(&bridge);
            Ok(())
        }
        Commands::Invoke {
            script,
            target,
            function,
            args,
        } => {
            let bridge = start_bridge(script, &cli, timeout)?;
            let args = parse_args(args)?;
            let result = bridge.invoke_function_sync(target.clone(), function.clone(), args)?;
            println!("{result:?}");
            Ok(())
        }
        Commands::Emit {
            script,
            target,
            event,
            args,
        } => {
            let bridge = start_bridge(script, &cli, timeout)?;
            let args = parse_args(args)?;
            bridge.emit_event(target.clone(), event.clone(), args)?;
            // Give the event a chance to run before shutdown.
            let _ = bridge.perform_sync(|core| core.eval("undefined"));
            Ok(())
        }
    }
}

fn start_bridge(script: &PathBuf, cli: &Cli, timeout: Duration) -> Result<Bridge> {
    let script = std::fs::canonicalize(script)
        .with_context(|| format!("cannot resolve script path {script:?}"))?;

    let mut config = BridgeConfig::new(script).sync_timeout(timeout);
    if let Some(lib) = &cli.lib {
        config = config.library_dir(lib.clone());
    }
    for entry in &cli.env {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --env entry `{entry}`, expected KEY=VALUE"))?;
        config = config.env(key, value);
    }

    Ok(Bridge::start(config)?)
}

fn run_until_exit(bridge: &Bridge) {
    loop {
        match bridge.wait_notification(Duration::from_millis(250)) {
            Some(Notification::UncaughtException(err)) => {
                log::error!("uncaught exception: {err}");
            }
            Some(Notification::RuntimeDidExit { error }) => {
                if let Some(err) = error {
                    log::error!("runtime exited after failure: {err}");
                }
                return;
            }
            None => {
                if !bridge.is_active() {
                    return;
                }
            }
        }
    }
}

fn parse_args(raw: &[String]) -> Result<Vec<Value>> {
    raw.iter()
        .map(|s| {
            let json: serde_json::Value =
                serde_json::from_str(s).with_context(|| format!("invalid JSON argument `{s}`"))?;
            Ok(json_to_value(&json))
        })
        .collect()
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
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
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}
