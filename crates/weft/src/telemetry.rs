//! Tracing and metrics setup for processes embedding weft.
//!
//! ```ignore
//! use weft::telemetry::{self, TelemetryConfig};
//!
//! telemetry::init(TelemetryConfig::from_env("todo-server"));
//! // later, from an HTTP handler
//! let body = telemetry::render();
//! ```

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,
    /// Console log level when `RUST_LOG` is unset.
    pub console_level: Level,
}

impl TelemetryConfig {
    /// `RUST_LOG` overrides `console_level` when set.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let console_level = if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        };
        Self {
            service_name: service_name.into(),
            console_level,
        }
    }
}

/// Install the prometheus recorder and the console subscriber.
///
/// Call once at startup. A second subscriber install is reported and
/// otherwise ignored.
pub fn init(config: TelemetryConfig) {
    init_metrics();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .compact()
        .with_filter(env_filter);

    if let Err(e) = tracing_subscriber::registry().with(console_layer).try_init() {
        eprintln!("tracing subscriber already installed: {e}");
        return;
    }
    tracing::debug!(service = %config.service_name, "telemetry initialized");
}

/// Install the prometheus recorder if none is installed yet.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install prometheus recorder");
                None
            }
        })
        .as_ref()
}

/// Render metrics in prometheus text format; empty without a recorder.
pub fn render() -> String {
    init_metrics().map(PrometheusHandle::render).unwrap_or_default()
}
