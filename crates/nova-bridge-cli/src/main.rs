use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nova_bridge::script::{Console, ConsoleLevel, HostGlobals};
use nova_bridge::{
    bridge_error, Bridge, BridgeConfig, BridgeMetricsSink, BridgeModule, LoggingConfig,
    ScriptProvider,
};
use nova_bridge_abi::imports;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "nova-bridge",
    version,
    about = "Run and inspect guest modules using the Nova call bridge"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Instantiate a guest module and call its entrypoint
    Run(RunArgs),
    /// List the host imports a guest module expects
    Imports(ImportsArgs),
    /// Validate a bridge config file and print the effective settings
    Config(ConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Guest module (`.wasm` binary or `.wat` text)
    module: PathBuf,
    /// Bridge config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Export to call after instantiation
    #[arg(long, default_value = "main")]
    entry: String,
    /// Emit a JSON report (console output is captured into it)
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ImportsArgs {
    /// Guest module (`.wasm` binary or `.wat` text)
    module: PathBuf,
    /// Bridge config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ConfigArgs {
    /// Bridge config file (TOML); defaults are printed when omitted
    path: Option<PathBuf>,
    /// Emit JSON instead of TOML
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => run_module(args),
        Command::Imports(args) => {
            let config = load_config(args.config.as_deref())?;
            let module = load_module(&args.module)?;
            let report = module
                .imports()
                .map(|(module_name, name)| ImportEntry {
                    module: module_name.to_owned(),
                    name: name.to_owned(),
                    provided: classify_import(&config, module_name, name),
                })
                .collect::<Vec<_>>();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for entry in &report {
                    println!("{}::{} ({})", entry.module, entry.name, entry.provided);
                }
            }
            let missing = report.iter().any(|entry| entry.provided == ImportSource::Unknown);
            Ok(if missing { 1 } else { 0 })
        }
        Command::Config(args) => {
            let config = load_config(args.path.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(0)
        }
    }
}

fn run_module(args: RunArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    init_logging(&config.logging);

    let module = load_module(&args.module)?;
    tracing::info!(
        target = "nova.bridge",
        module = %args.module.display(),
        entry = %args.entry,
        "running guest module"
    );
    let console = Arc::new(CliConsole::new(args.json));
    let calls = Arc::new(CallCounter::default());
    let provider = ScriptProvider::new(HostGlobals::standard().with_console(console.clone()));
    let bridge = Bridge::with_provider(Arc::new(provider), config).with_metrics(calls.clone());

    let mut instance = module.instantiate_with(bridge)?;
    let outcome = instance.call(&args.entry);

    let (error, error_kind) = match &outcome {
        Ok(()) => (None, None),
        Err(err) => (
            Some(format!("{err:#}")),
            bridge_error(err).map(|bridge_err| bridge_err.kind()),
        ),
    };
    let report = RunReport {
        module: args.module.display().to_string(),
        entry: args.entry,
        ok: outcome.is_ok(),
        error,
        error_kind,
        callbacks_registered: instance.bridge().registry().len(),
        live_handles: instance.bridge().handles().len(),
        calls: calls.snapshot(),
        console: console.take(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(error) = &report.error {
        eprintln!("error: {error}");
    }

    Ok(if report.ok { 0 } else { 1 })
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => Ok(BridgeConfig::load_from_path(path)?),
        None => Ok(BridgeConfig::default()),
    }
}

fn load_module(path: &Path) -> Result<BridgeModule> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let wasm = wat::parse_bytes(&bytes).with_context(|| format!("failed to parse {}", path.display()))?;
    BridgeModule::from_wasm_bytes(&wasm)
}

fn init_logging(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(logging.env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false);
    // A subscriber may already be installed when embedded in tests.
    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum ImportSource {
    Bridge,
    Legacy,
    Unknown,
}

impl std::fmt::Display for ImportSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ImportSource::Bridge => "bridge",
            ImportSource::Legacy => "legacy bridge",
            ImportSource::Unknown => "not provided",
        })
    }
}

fn classify_import(config: &BridgeConfig, module: &str, name: &str) -> ImportSource {
    if module != config.protocol.import_module {
        return ImportSource::Unknown;
    }
    if imports::CANONICAL.contains(&name) {
        ImportSource::Bridge
    } else if config.protocol.legacy_inline_calls && imports::LEGACY.contains(&name) {
        ImportSource::Legacy
    } else {
        ImportSource::Unknown
    }
}

#[derive(Serialize)]
struct ImportEntry {
    module: String,
    name: String,
    provided: ImportSource,
}

#[derive(Serialize)]
struct RunReport {
    module: String,
    entry: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    callbacks_registered: usize,
    live_handles: usize,
    calls: BTreeMap<String, CallStats>,
    console: Vec<ConsoleLine>,
}

#[derive(Clone, Debug, Default, Serialize)]
struct CallStats {
    count: u64,
    errors: u64,
    total_micros: u128,
}

/// Per-import call counts for the run report.
#[derive(Default)]
struct CallCounter {
    inner: Mutex<BTreeMap<String, CallStats>>,
}

impl CallCounter {
    fn snapshot(&self) -> BTreeMap<String, CallStats> {
        self.inner.lock().clone()
    }
}

impl BridgeMetricsSink for CallCounter {
    fn record_invocation(&self, key: &str, duration: Duration) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(key.to_owned()).or_default();
        entry.count += 1;
        entry.total_micros += duration.as_micros();
    }

    fn record_error(&self, key: &str, _kind: &'static str) {
        self.inner.lock().entry(key.to_owned()).or_default().errors += 1;
    }
}

#[derive(Clone, Debug, Serialize)]
struct ConsoleLine {
    level: &'static str,
    message: String,
}

/// `console.*` for guest callbacks: printed directly, or captured for `--json`.
struct CliConsole {
    capture: bool,
    lines: Mutex<Vec<ConsoleLine>>,
}

impl CliConsole {
    fn new(capture: bool) -> Self {
        Self {
            capture,
            lines: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<ConsoleLine> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl Console for CliConsole {
    fn write(&self, level: ConsoleLevel, message: &str) {
        if self.capture {
            let level = match level {
                ConsoleLevel::Debug => "debug",
                ConsoleLevel::Log => "log",
                ConsoleLevel::Info => "info",
                ConsoleLevel::Warn => "warn",
                ConsoleLevel::Error => "error",
            };
            self.lines.lock().push(ConsoleLine {
                level,
                message: message.to_owned(),
            });
            return;
        }
        match level {
            ConsoleLevel::Warn | ConsoleLevel::Error => eprintln!("{message}"),
            _ => println!("{message}"),
        }
    }
}
