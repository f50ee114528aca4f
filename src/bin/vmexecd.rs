//! Minimal daemon entrypoint: initialises logging, builds an `Executor` from
//! ambient `VMEXEC_*` configuration, and blocks.
//!
//! No CLI or config-file parsing lives here — composing an `ExecutorConfig`
//! from flags or files is the (out-of-scope) orchestrator layer's job. This
//! binary exists so the crate has a runnable host process; the orchestrator
//! embeds `vmexec::Executor` directly as a library in the expected
//! deployment shape.

use vmexec::config::{self, ExecutorConfig};
use vmexec::logging::{self, LogFormat};
use vmexec::Executor;

#[tokio::main]
async fn main() {
    let format = if config::is_production_mode() { LogFormat::Json } else { LogFormat::Human };
    logging::init(format);

    let config = ExecutorConfig::default();
    let executor = Executor::new(&config);

    let node = executor.describe_node();
    tracing::info!(
        hostname = %node.hostname,
        nano_cpus = node.resources.nano_cpus,
        memory_bytes = node.resources.memory_bytes,
        "vmexecd started"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install ctrl-c handler, exiting immediately");
        return;
    }
    tracing::info!("shutdown signal received");
}
