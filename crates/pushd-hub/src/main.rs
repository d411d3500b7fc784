use clap::Parser;
use pushd_core::protocol::{DEFAULT_ACTIVITY_TIMEOUT_SECS, DEFAULT_MAX_FRAME_BYTES};
use pushd_hub::apps::{AppRegistry, LedgerBackend};
use pushd_hub::server::{self, TransportSettings};
use pushd_storage::{LedgerStore, StorageError};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_LOG_DIR: &str = ".pushd/logs";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    app_keys: Vec<String>,
    activity_timeout_secs: u64,
    hibernate_after: Duration,
    write_timeout: Duration,
    queue_capacity: usize,
    max_frame_bytes: usize,
    ledger_db: String,
    log_dir: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "pushd-hub", about = "Pusher-protocol channel hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// May be repeated. Without any key every app key is accepted.
    #[arg(long = "app-key")]
    app_keys: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_ACTIVITY_TIMEOUT_SECS)]
    activity_timeout: u64,
    /// Idle seconds before an app's channel index is evicted; 0 disables.
    #[arg(long, default_value_t = 0)]
    hibernate_after: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value = "")]
    ledger_db: String,
    /// An explicit empty value disables the log file.
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let backend = match open_backend(&config.ledger_db) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "ledger_open_failed", path = %config.ledger_db, error = %err);
            return;
        }
    };
    let ledger = backend.as_str();
    let registry = Arc::new(AppRegistry::new(
        config.app_keys.clone(),
        backend,
        config.activity_timeout_secs,
    ));
    registry.clone().start_idle_reaper(config.hibernate_after);

    let app = server::router(
        registry,
        TransportSettings {
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            max_frame_bytes: config.max_frame_bytes,
            debug: config.debug,
        },
    );

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        app_keys = config.app_keys.len(),
        ledger = ledger,
        hibernate_after_secs = config.hibernate_after.as_secs()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

fn open_backend(ledger_db: &str) -> Result<LedgerBackend, StorageError> {
    if ledger_db.trim().is_empty() {
        return Ok(LedgerBackend::Memory);
    }
    let store = LedgerStore::open(ledger_db)?;
    Ok(LedgerBackend::Sqlite(Arc::new(store)))
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_value(&args.addr, "PUSHD_ADDR", DEFAULT_ADDR);
    let mut app_keys = args.app_keys.clone();
    if app_keys.is_empty() {
        if let Ok(value) = std::env::var("PUSHD_APP_KEYS") {
            app_keys = parse_app_keys(&value);
        }
    }
    let ledger_db = resolve_value(&args.ledger_db, "PUSHD_LEDGER_DB", "");
    let log_dir = match args.log_dir {
        Some(value) => value,
        None => resolve_value("", "PUSHD_LOG_DIR", DEFAULT_LOG_DIR),
    };
    let debug = args.debug || env_true("PUSHD_DEBUG");
    Config {
        addr,
        app_keys,
        activity_timeout_secs: args.activity_timeout,
        hibernate_after: Duration::from_secs(args.hibernate_after),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity,
        max_frame_bytes: args.max_frame_bytes,
        ledger_db,
        log_dir,
        debug,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = fallback_log_level(std::env::var("PUSHD_LOG_LEVEL").ok(), config.debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.addr) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

/// Used when `RUST_LOG` is unset: `PUSHD_LOG_LEVEL`, then debug mode, then info.
fn fallback_log_level(env_level: Option<String>, debug: bool) -> String {
    match env_level {
        Some(level) if !level.trim().is_empty() => level,
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, addr: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(log_file_name(addr));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn log_file_name(addr: &str) -> String {
    let port = addr
        .rsplit_once(':')
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty())
        .unwrap_or("default");
    format!("pushd-{port}.log")
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => is_truthy(&value),
        Err(_) => false,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn parse_app_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}
