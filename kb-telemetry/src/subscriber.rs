//! Global `tracing` subscriber setup.

use kb_core::{KbResult, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.log_filter`. Output is JSON lines
/// when `config.json_logs` is set, human-readable text otherwise. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> KbResult<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), &config.log_filter)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    installed.map_err(|e| TelemetryError::SubscriberInit {
        reason: e.to_string(),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        json_logs = config.json_logs,
        "Tracing initialized"
    );
    Ok(())
}

/// Filter from `rust_log` if present and non-empty, else from `fallback`.
pub fn build_filter(rust_log: Option<&str>, fallback: &str) -> Result<EnvFilter, TelemetryError> {
    let directives = match rust_log {
        Some(value) if !value.trim().is_empty() => value,
        _ => fallback,
    };
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::SubscriberInit {
        reason: format!("invalid log filter {directives:?}: {e}"),
    })
}
