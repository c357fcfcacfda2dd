use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Console output style. JSON also enables the optional rolling file sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Logging settings, read from `LOG_FORMAT`, `NODE_ID`, `LOG_SPAN_EVENTS`
/// and `LOG_DIR`.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub service_name: String,
    pub node_id: Option<String>,
    pub span_events: bool,
    /// Daily rolling JSON files are written here when set
    pub log_dir: Option<String>,
}

impl LogConfig {
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default()),
            service_name: service_name.into(),
            node_id: env::var("NODE_ID").ok().filter(|v| !v.is_empty()),
            span_events: flag("LOG_SPAN_EVENTS"),
            log_dir: env::var("LOG_DIR").ok().filter(|v| !v.is_empty()),
        }
    }

    fn fmt_span(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// `RUST_LOG` when set, otherwise `info` with chatty HTTP and SQL crates turned down.
fn default_filter() -> EnvFilter {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    ["hyper=warn", "reqwest=warn", "sqlx=warn"]
        .into_iter()
        .filter_map(|d| d.parse().ok())
        .fold(filter, |f, d| f.add_directive(d))
}

/// Install the global subscriber. Hold the returned guard for the life of the
/// process when a log directory is configured, or buffered file lines are lost.
pub fn init_structured_logging(config: LogConfig) -> Option<WorkerGuard> {
    let registry = tracing_subscriber::registry().with(default_filter());
    let mut guard = None;

    let installed = match config.format {
        LogFormat::Json => {
            let stdout = fmt::layer()
                .json()
                .with_span_events(config.fmt_span())
                .with_current_span(true)
                .with_writer(io::stdout);
            match &config.log_dir {
                Some(dir) => {
                    let appender = tracing_appender::rolling::daily(
                        dir,
                        format!("{}.log", config.service_name),
                    );
                    let (writer, file_guard) = tracing_appender::non_blocking(appender);
                    guard = Some(file_guard);
                    registry
                        .with(stdout)
                        .with(fmt::layer().json().with_writer(writer))
                        .try_init()
                }
                None => registry.with(stdout).try_init(),
            }
        }
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(config.fmt_span())
                    .with_line_number(true),
            )
            .try_init(),
    };

    // Already installed by a test harness or an embedding binary.
    if installed.is_err() {
        return guard;
    }

    tracing::info!(
        service = %config.service_name,
        node_id = config.node_id.as_deref().unwrap_or("-"),
        format = ?config.format,
        file_sink = config.log_dir.is_some(),
        "logging initialized"
    );
    guard
}

pub fn init_with_service(service_name: impl Into<String>) -> Option<WorkerGuard> {
    init_structured_logging(LogConfig::from_env(service_name))
}
