// polaris-subclient: subscribes to the Polaris device feed and writes
// normalized state-change records to rotating NDJSON files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use polaris_subclient::config::{self, AppConfig};
use polaris_subclient::connection::PolarisConnection;
use polaris_subclient::pipeline;
use polaris_subclient::redact::{Redactor, collect_secret_values};
use polaris_subclient::secrets;
use polaris_subclient::sink::{EventSink, FileSink, StdoutSink};
use polaris_subclient::{logging, secrets::SecretsError};

const DEFAULT_CONFIG_PATH: &str = "/etc/polaris/config.json";
const DEFAULT_SECRETS_PATH: &str = "/etc/polaris/.secrets.enc";

#[derive(Parser)]
#[command(
    name = "polaris-subclient",
    version,
    about = "Polaris device state change to NDJSON file pipeline"
)]
struct Cli {
    /// Output mode (default: file).
    #[arg(short, long, value_enum)]
    output: Option<OutputMode>,
    /// Override output directory.
    #[arg(short = 'd', long)]
    output_dir: Option<String>,
    /// Config file path.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log verbosity.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
    /// Receive ~5 events then exit.
    #[arg(long)]
    dry_run: bool,
    /// Validate config and exit.
    #[arg(long)]
    validate_config: bool,
    /// Override API key.
    #[arg(long)]
    polaris_api_key: Option<String>,
    /// Override API URL.
    #[arg(long)]
    polaris_api_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Manage the encrypted secrets file.
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

#[derive(Subcommand)]
enum SecretsCommand {
    /// Create an empty encrypted secrets file and key.
    Init {
        /// Path for the encrypted file.
        #[arg(long)]
        output: PathBuf,
        /// Path for the master key.
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Store a secret in the encrypted file.
    Set {
        key: String,
        /// Secret value.
        #[arg(long)]
        value: String,
        /// Path to the master key.
        #[arg(long)]
        key_file: PathBuf,
    },
    /// List stored secret names (values are never shown).
    List {
        /// Path to the master key.
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Re-encrypt the secrets store with a new key.
    Rekey {
        /// Current master key path.
        #[arg(long)]
        key_file: PathBuf,
        /// New master key path.
        #[arg(long)]
        new_key_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::Secrets { command }) = &cli.command {
        return run_secrets(command);
    }
    run_pipeline(cli).await
}

// ---------------------------------------------------------------------------
// Pipeline command
// ---------------------------------------------------------------------------

async fn run_pipeline(cli: Cli) -> ExitCode {
    let config_path = cli
        .config
        .or_else(|| std::env::var("POLARIS_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut overrides = HashMap::new();
    if let Some(key) = &cli.polaris_api_key {
        overrides.insert("POLARIS_API_KEY".to_owned(), key.clone());
    }
    if let Some(url) = &cli.polaris_api_url {
        overrides.insert("POLARIS_API_URL".to_owned(), url.clone());
    }

    let secret_store = match load_secret_store() {
        Ok(map) => map,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut cfg = match config::load_config(&config_path, &overrides, &secret_store) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .map(|l| l.as_str().to_owned())
        .or_else(|| std::env::var("POLARIS_LOG_LEVEL").ok())
        .unwrap_or_else(|| cfg.logging.level.clone());
    let output_mode = cli
        .output
        .or_else(|| {
            std::env::var("POLARIS_OUTPUT")
                .ok()
                .and_then(|v| OutputMode::from_str(&v, true).ok())
        })
        .unwrap_or(OutputMode::File);
    if let Some(dir) = cli.output_dir {
        cfg.output.file.output_dir = dir;
    } else if let Ok(dir) = std::env::var("POLARIS_OUTPUT_DIR") {
        cfg.output.file.output_dir = dir;
    }

    let redactor = build_redactor(&cfg);
    if let Err(e) = logging::init(&level, &redactor, &cfg.logging.file) {
        eprintln!("Config error: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    if cli.validate_config {
        eprintln!("Configuration is valid.");
        return ExitCode::SUCCESS;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %cfg.instance_id,
        output = ?output_mode,
        "polaris-subclient starting"
    );

    let connection = PolarisConnection::new(cfg.polaris.clone());
    let shutdown = connection.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal");
        shutdown.request_shutdown();
    });

    let mut sink: Box<dyn EventSink> = match output_mode {
        OutputMode::Stdout => Box::new(StdoutSink::new()),
        OutputMode::File => match FileSink::new(&cfg.instance_id, &cfg.output.file) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                error!(error = %e, "failed to open output sink");
                return ExitCode::FAILURE;
            }
        },
    };

    match pipeline::run(connection, &cfg, sink.as_mut(), cli.dry_run).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pipeline failed");
            ExitCode::FAILURE
        }
    }
}

fn build_redactor(cfg: &AppConfig) -> Redactor {
    let resolved = serde_json::to_value(cfg).unwrap_or_default();
    Redactor::new(collect_secret_values(
        &resolved,
        &cfg.logging.redact_patterns,
    ))
}

/// Decrypt the secrets file when `POLARIS_KEY_FILE` points at a key and
/// both files exist; otherwise the store is empty.
fn load_secret_store() -> Result<HashMap<String, String>, SecretsError> {
    let Ok(key_file) = std::env::var("POLARIS_KEY_FILE") else {
        return Ok(HashMap::new());
    };
    let secrets_file =
        std::env::var("POLARIS_SECRETS_FILE").unwrap_or_else(|_| DEFAULT_SECRETS_PATH.to_owned());
    let key_path = Path::new(&key_file);
    let secrets_path = Path::new(&secrets_file);
    if !key_path.exists() || !secrets_path.exists() {
        return Ok(HashMap::new());
    }
    secrets::load_secrets(secrets_path, key_path)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler installs");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// Secrets subcommands
// ---------------------------------------------------------------------------

fn run_secrets(command: &SecretsCommand) -> ExitCode {
    let result = match command {
        SecretsCommand::Init { output, key_file } => {
            secrets::init_secrets(output, key_file).map(|()| {
                println!(
                    "Initialized: {} (key: {})",
                    output.display(),
                    key_file.display()
                );
            })
        }
        SecretsCommand::Set {
            key,
            value,
            key_file,
        } => secrets::set_secret(&secrets_file_path(), key_file, key, value)
            .map(|()| println!("Set: {key}")),
        SecretsCommand::List { key_file } => {
            secrets::list_secrets(&secrets_file_path(), key_file).map(|names| {
                for name in names {
                    println!("{name}");
                }
            })
        }
        SecretsCommand::Rekey {
            key_file,
            new_key_file,
        } => secrets::rekey(&secrets_file_path(), key_file, new_key_file)
            .map(|()| println!("Re-keyed with: {}", new_key_file.display())),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Secrets error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn secrets_file_path() -> PathBuf {
    std::env::var("POLARIS_SECRETS_FILE")
        .map_or_else(|_| PathBuf::from(DEFAULT_SECRETS_PATH), PathBuf::from)
}
