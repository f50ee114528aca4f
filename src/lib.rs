//! vmexec: a Firecracker microVM workload executor.
//!
//! Thin façade over the four component crates (`vmexec-core`,
//! `vmexec-image`, `vmexec-network`, `vmexec-vmm`, `vmexec-translate`),
//! plus the ambient configuration, logging, audit, and node-reporting
//! modules a standalone daemon needs around them.

pub mod audit;
pub mod config;
pub mod executor;
pub mod logging;
pub mod node;

pub use config::ExecutorConfig;
pub use executor::Executor;
pub use node::NodeDescription;
