use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_LEVEL: &str = "EXTHOST_BRIDGE_LOG_LEVEL";
pub const ENV_LOG_FILE: &str = "EXTHOST_BRIDGE_LOG_FILE";
/// Full `EnvFilter` directive string; replaces the level-derived default.
const ENV_LOG_FILTER: &str = "EXTHOST_BRIDGE_LOG_FILTER";
const ENV_TRACE_DEPS: &str = "EXTHOST_BRIDGE_TRACE_DEPS";

/// Crates that drown out bridge output at trace level.
const NOISY_DEPENDENCIES: &[&str] = &["mio", "tokio_util", "tokio::net"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber once; later calls return `Ok` untouched.
/// Never writes to stdout, which belongs to the program (the stub prints its
/// ping result there).
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let verbose = config.level >= LogLevel::Debug;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level))
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = WRITER_GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    match std::env::var(ENV_LOG_FILTER) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(directives_for(level, trace_dependencies())),
    }
}

fn trace_dependencies() -> bool {
    std::env::var(ENV_TRACE_DEPS)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

/// Debug and trace only raise the bridge's own targets; everything else
/// stays at info.
fn directives_for(level: LogLevel, trace_deps: bool) -> String {
    let filter = LevelFilter::from(level);
    if level < LogLevel::Debug {
        return filter.to_string().to_lowercase();
    }
    let own = filter.to_string().to_lowercase();
    let mut directives = format!("info,exthost_bridge={own},exthost={own}");
    if level == LogLevel::Trace && !trace_deps {
        for target in NOISY_DEPENDENCIES {
            let _ = write!(directives, ",{target}=info");
        }
    }
    directives
}

/// Offset, hex and printable columns, 16 bytes per row.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '.' })
            .collect();
        let _ = writeln!(out, "{:08x}  {:<47}  {ascii}", row * 16, hex.join(" "));
    }
    out
}
