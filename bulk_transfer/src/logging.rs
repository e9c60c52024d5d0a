use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

utils::configurable_constants! {

    /// The log destination. By default, logs go to the logs/ subdirectory of the per-user data
    /// directory.
    ///
    /// If this path exists as a directory or ends with a /, a new log file is created in that
    /// directory for each run and logs older than LOG_DIR_MAX_RETENTION_AGE are deleted.
    ///
    /// If LOG_DEST is given but empty, logs go to the console.
    ref LOG_DEST : Option<String> = None;

    /// "json" for json lines; anything else for text. Defaults to json for files and text for
    /// the console.
    ref LOG_FORMAT : Option<String> = None;

    /// Base name of log files written to a directory. The timestamp and pid are appended.
    ref LOG_PREFIX : String = "bulk_xfer".to_owned();

    /// Disables removal of old files in the log directory.
    ref LOG_DIR_DISABLE_CLEANUP : bool = false;

    /// Delete all log files older than this.
    ref LOG_DIR_MAX_RETENTION_AGE: Duration = Duration::from_secs(14 * 24 * 3600);
}

/// Default log levels. Override using the `RUST_LOG` env variable.
const DEFAULT_LOG_LEVEL_FILE: &str = "info";
const DEFAULT_LOG_LEVEL_CONSOLE: &str = "warn";

#[derive(Clone, Debug, PartialEq)]
pub enum LoggingMode {
    Directory(PathBuf),
    File(PathBuf),
    Console,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub logging_mode: LoggingMode,
    pub use_json: bool,
    pub enable_log_dir_cleanup: bool,
    pub version: String,
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bulk_xfer")
        .join("logs")
}

impl LoggingConfig {
    pub fn new(version: impl Into<String>) -> LoggingConfig {
        Self::from_settings(LOG_DEST.as_deref(), LOG_FORMAT.as_deref(), version)
    }

    fn from_settings(log_dest: Option<&str>, log_format: Option<&str>, version: impl Into<String>) -> Self {
        let logging_mode = match log_dest {
            Some("") => LoggingMode::Console,
            Some(dest) => {
                let path = PathBuf::from(dest);
                if dest.ends_with('/') || dest.ends_with('\\') || path.is_dir() {
                    LoggingMode::Directory(path)
                } else {
                    LoggingMode::File(path)
                }
            },
            None => LoggingMode::Directory(default_log_dir()),
        };

        let use_json = match log_format {
            Some(format) => format.trim().eq_ignore_ascii_case("json"),
            None => logging_mode != LoggingMode::Console,
        };

        let enable_log_dir_cleanup = matches!(logging_mode, LoggingMode::Directory(_)) && !*LOG_DIR_DISABLE_CLEANUP;

        Self {
            logging_mode,
            use_json,
            enable_log_dir_cleanup,
            version: version.into(),
        }
    }

    /// Console-only logging, used when the caller asks for verbose output on the terminal.
    pub fn console(version: impl Into<String>) -> Self {
        Self::from_settings(Some(""), LOG_FORMAT.as_deref(), version)
    }
}

/// Sets up the global subscriber. Only the first call in a process has an effect.
pub fn init_logging(cfg: LoggingConfig) {
    let maybe_log_file = match &cfg.logging_mode {
        LoggingMode::Directory(log_dir) => {
            if cfg.enable_log_dir_cleanup && log_dir.is_dir() {
                run_log_directory_cleanup_background(log_dir);
            }
            Some(log_file_in_dir(log_dir))
        },
        LoggingMode::File(path) => Some(path.clone()),
        LoggingMode::Console => None,
    };

    if let Some(log_file) = maybe_log_file {
        // Fall back to the console if the file cannot be written.
        if let Err(e) = init_logging_to_file(&log_file, cfg.use_json) {
            init_logging_to_console(&cfg);
            error!("Error logging to file {log_file:?} ({e}); falling back to console logging.");
        }
    } else {
        init_logging_to_console(&cfg);
    }

    info!("bulk_xfer {}", cfg.version);
}

fn init_logging_to_console(cfg: &LoggingConfig) {
    let fmt_layer_base = tracing_subscriber::fmt::layer().with_target(false);
    let fmt_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL_CONSOLE))
        .unwrap_or_default();

    let registry = tracing_subscriber::registry();
    let result = if cfg.use_json {
        registry.with(fmt_layer_base.json().with_filter(fmt_filter)).try_init()
    } else {
        registry.with(fmt_layer_base.with_filter(fmt_filter)).try_init()
    };
    if let Err(e) = result {
        debug!("logging already initialized: {e}");
    }
}

fn init_logging_to_file(path: &Path, use_json: bool) -> io::Result<()> {
    use tracing_appender::{non_blocking, rolling};

    let Some(file_name) = path.file_name() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"));
    };
    let log_directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent
        },
        _ => Path::new("."),
    };

    // Fail here, before installing the subscriber, if the location is not writable.
    std::fs::OpenOptions::new().create(true).append(true).open(path)?;

    let (writer, guard) = non_blocking(rolling::never(log_directory, file_name));

    // The guard flushes the background writer when dropped, so it lives for the process.
    static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
    let _ = FILE_GUARD.set(guard);

    let fmt_layer_base = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_file(true)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    let fmt_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL_FILE))
        .unwrap_or_default();

    let registry = tracing_subscriber::registry();
    let result = if use_json {
        registry.with(fmt_layer_base.json().with_filter(fmt_filter)).try_init()
    } else {
        registry.with(fmt_layer_base.with_filter(fmt_filter)).try_init()
    };
    result.map_err(|e| io::Error::other(e.to_string()))
}

/// Builds `<prefix>_<YYYYMMDD>T<HHMMSS><mmm><+/-HHMM>_<pid>.log` in `dir`.
pub fn log_file_in_dir(dir: impl AsRef<Path>) -> PathBuf {
    let now_local: DateTime<Local> = Local::now();
    let now_fixed: DateTime<FixedOffset> = now_local.with_timezone(now_local.offset());
    let ts = now_fixed.format("%Y%m%dT%H%M%S%3f%z");

    let pid = std::process::id();
    dir.as_ref().join(format!("{}_{}_{}.log", LOG_PREFIX.as_str(), ts, pid))
}

/// Parses a name built by [log_file_in_dir] into (prefix, timestamp, pid).
pub fn parse_log_file_name(path: impl AsRef<Path>) -> Option<(String, DateTime<FixedOffset>, u32)> {
    let file_name = path.as_ref().file_name()?.to_str()?;
    let file_name = file_name.strip_suffix(".log")?;

    // Split from the right so the prefix may contain underscores.
    let mut parts = file_name.rsplitn(3, '_');
    let pid: u32 = parts.next()?.parse().ok()?;
    let ts = DateTime::parse_from_str(parts.next()?, "%Y%m%dT%H%M%S%3f%z").ok()?;
    let prefix = parts.next()?;

    Some((prefix.to_string(), ts, pid))
}

fn run_log_directory_cleanup_background(log_dir: &Path) {
    let log_dir = log_dir.to_path_buf();
    std::thread::spawn(move || {
        if let Err(e) = run_log_directory_cleanup(&log_dir, *LOG_DIR_MAX_RETENTION_AGE) {
            warn!("Error during log directory cleanup in {log_dir:?}: {e}");
        }
    });
}

/// Deletes our own log files older than `max_retention`. Returns how many were removed.
fn run_log_directory_cleanup(log_dir: &Path, max_retention: Duration) -> io::Result<usize> {
    let now = Utc::now();
    let mut removed = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Some((prefix, timestamp, _pid)) = parse_log_file_name(&path) else {
            continue;
        };
        if prefix != *LOG_PREFIX {
            continue;
        }
        let Ok(age) = (now - timestamp.to_utc()).to_std() else {
            continue;
        };
        if age > max_retention {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed old log file {path:?}");
                    removed += 1;
                },
                Err(e) => info!("Error removing old log file {path:?}, skipping: {e}"),
            }
        }
    }
    Ok(removed)
}
