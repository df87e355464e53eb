use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, Span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Structured event shape shared by every component. Fields that do not
/// apply stay empty rather than absent so log pipelines see a fixed schema.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub tenant: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub step_index: Option<usize>,
    pub tool_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let step_index = event
        .step_index
        .map(|i| i.to_string())
        .unwrap_or_default();
    match level {
        Level::ERROR => tracing::error!(
            target: "relay.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            tenant = event.tenant.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            step_index = %step_index,
            tool_id = event.tool_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "relay.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            tenant = event.tenant.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            step_index = %step_index,
            tool_id = event.tool_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "relay.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            tenant = event.tenant.unwrap_or(""),
            run_id = event.run_id.unwrap_or(""),
            step_index = %step_index,
            tool_id = event.tool_id.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Counter and histogram sink. The executor emits its metrics through this
/// surface; exporters live outside the core.
pub trait TelemetrySink: Send + Sync {
    fn counter(&self, name: &'static str, value: u64);
    fn histogram(&self, name: &'static str, value: f64);
}

/// Default sink: structured tracing events under the `relay.metrics` target.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn counter(&self, name: &'static str, value: u64) {
        tracing::info!(target: "relay.metrics", metric = name, kind = "counter", value, "metric");
    }

    fn histogram(&self, name: &'static str, value: f64) {
        tracing::info!(target: "relay.metrics", metric = name, kind = "histogram", value, "metric");
    }
}

pub fn default_telemetry() -> Arc<dyn TelemetrySink> {
    Arc::new(TracingTelemetry)
}

/// Span covering one step's gate + invoke + record phases.
pub fn step_span(run_id: &str, step_index: usize, tool_id: &str) -> Span {
    tracing::info_span!(
        "step",
        run_id = %run_id,
        step_index,
        tool_id = %tool_id,
    )
}

pub fn run_span(tenant: &str, run_id: &str) -> Span {
    tracing::info_span!("run", tenant = %tenant, run_id = %run_id)
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("relay.{}", process.as_str()))
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
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("relay.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("relay.{}.", process);

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

        // expected: relay.<proc>.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");

        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_kinds_have_stable_names() {
        assert_eq!(ProcessKind::Engine.as_str(), "engine");
        assert_eq!(ProcessKind::Cli.as_str(), "cli");
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/relay");
        assert_eq!(
            canonical_logs_dir_from_root(&root),
            PathBuf::from("/tmp/relay").join("logs")
        );
    }
}
