//! Tracing setup for local debugging of task runs.
//!
//! Controller spans carry `task_id` and `step_index`; correction events add
//! `attempt` and `strategy`. This output is diagnostics only: the verification,
//! correction, action and outcome records in `io::record_store` are the audit
//! trail and are written whatever `RUST_LOG` says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
///
/// ```bash
/// RUST_LOG=step_runner::controller=debug cargo test --test run_lifecycle
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
