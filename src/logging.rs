use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEBUG_LOG_FILE: &str = "privgate-debug.log";

/// Keeps the background log writer alive; drop it last.
pub struct LogGuard {
    _worker: WorkerGuard,
    log_path: Option<PathBuf>,
}

impl LogGuard {
    #[must_use]
    pub fn log_file_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }
}

/// Installs the global subscriber.
///
/// With the `debug-log` feature everything goes to a JSON file in the working
/// directory. Otherwise `verbose` enables compact output on stderr, and
/// without it nothing is installed.
#[must_use]
pub fn init(verbose: bool) -> Option<LogGuard> {
    if cfg!(feature = "debug-log") {
        init_file()
    } else if verbose {
        init_stderr()
    } else {
        None
    }
}

fn init_file() -> Option<LogGuard> {
    let log_path = PathBuf::from(DEBUG_LOG_FILE);

    let file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            return None;
        }
    };

    let (non_blocking, worker) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
        return None;
    }

    tracing::info!(path = %log_path.display(), "Debug logging initialized");

    Some(LogGuard {
        _worker: worker,
        log_path: Some(log_path),
    })
}

fn init_stderr() -> Option<LogGuard> {
    let (non_blocking, worker) = tracing_appender::non_blocking(std::io::stderr());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .compact()
            .with_writer(non_blocking)
            .with_target(false),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
        return None;
    }

    Some(LogGuard {
        _worker: worker,
        log_path: None,
    })
}
