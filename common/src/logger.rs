use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Initialize the global tracing subscriber.
///
/// JSON output for production, pretty output for development. Safe to call
/// more than once; only the first call installs the subscriber.
pub fn init_tracing(json: bool) {
    LOGGER_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let base = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            // Includes timing when the span closes
            .with_span_events(fmt::format::FmtSpan::CLOSE);

        if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(base.pretty())
                .init();
        }
    });
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}
