use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::task;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the file writer flushing until dropped
#[allow(dead_code)]
pub struct LoggerGuard(WorkerGuard);

fn normalize_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'info'", level);
            "info"
        }
    }
}

/// Where and how long log files are kept
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: PathBuf,
    /// File name prefix, files are `<prefix>.<date>.log`
    pub prefix: String,
    pub level: String,
    pub retention_days: u64,
}

impl LogSettings {
    fn max_age(&self) -> Duration {
        Duration::from_secs(60 * 60 * 24 * self.retention_days.max(1))
    }
}

/// Console plus daily-rolling file logging; `RUST_LOG` overrides the level
///
/// Must be called from within a tokio runtime (the log pruning task is
/// spawned on it).
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<LoggerGuard> {
    let log_dir = settings.dir.clone();
    let prefix = settings.prefix.as_str();
    fs::create_dir_all(&log_dir)?;

    let builder = EnvFilter::builder().with_default_directive(normalize_level(&settings.level).parse()?);
    let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
    let console_filter = builder.clone().parse_lossy(&rust_log);
    let file_filter = builder.parse_lossy(&rust_log);

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking, guard) = NonBlocking::new(file_appender);

    // catalog module paths are long; only the file keeps them
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_filter(file_filter);
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()?;

    tracing::info!(
        "Logging to {:?} as {}.*.log, keeping {} day(s)",
        log_dir,
        prefix,
        settings.retention_days.max(1)
    );
    start_log_cleanup_task(log_dir, prefix.to_string(), settings.max_age());

    Ok(LoggerGuard(guard))
}

fn start_log_cleanup_task(log_dir: PathBuf, prefix: String, max_age: Duration) {
    const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

    task::spawn(async move {
        loop {
            match cleanup_old_logs(&log_dir, &prefix, max_age) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!("Pruned {} starcat log file(s)", removed),
                Err(e) => tracing::warn!("Failed to prune starcat logs in {:?}: {}", log_dir, e),
            }
            tokio::time::sleep(CLEANUP_INTERVAL).await;
        }
    });
}

fn cleanup_old_logs(log_dir: &Path, prefix: &str, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // "<prefix>." so that "starcat" never claims "starcat-old.log"
        let ours = file_name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.ends_with(".log"));
        if !ours {
            continue;
        }

        let modified = fs::metadata(&path)?.modified();
        if let Ok(modified) = modified {
            if now.duration_since(modified).unwrap_or_default() > max_age {
                fs::remove_file(&path)?;
                tracing::info!("Old log file deleted: {}", file_name);
                removed += 1;
            }
        }
    }
    Ok(removed)
}
