//! vmexec-vmm: the VMM Lifecycle Manager. Owns every Firecracker child
//! process this host is responsible for — spawn, API-mediated
//! configuration, and the three-stairstep shutdown escalation.

pub mod client;
pub mod manager;
pub mod mock;
pub mod shutdown;
pub mod spawn;
pub mod state;

pub use client::{FirecrackerApiClient, RealFirecrackerApiClient};
pub use manager::VmmManager;
pub use mock::FakeFirecrackerApiClient;
pub use shutdown::ShutdownOutcome;
pub use state::{DescribeState, RuntimeStatus, VmInstance, VmState};
