use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "mindscribe";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Wellness transcripts are sensitive. Anything a user typed goes into logs
/// only as a length and a short fingerprint.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} fp={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Daily JSONL file layer plus a compact console layer. `RUST_LOG` overrides
/// the default `info` filter. The returned guard must be held for the process
/// lifetime or buffered log lines are lost.
pub fn init_logging(logs_dir: &Path, retention_days: u64) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_logs(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            logs_dir: logs_dir.display().to_string(),
            retention_days,
            initialized_at: Utc::now(),
        },
    ))
}

fn cleanup_old_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{LOG_PREFIX}.");

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: mindscribe.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn logs_dir_under(root: &Path) -> PathBuf {
    root.join("logs")
}
