//! vmexec-network: host bridge, per-task TAP devices, and deterministic IP
//! allocation.
//!
//! The bridge is ensured once per process; NAT is set up once per process if
//! configured; TAPs are created and torn down per task. A single mutex
//! guards the bridge flag, the TAP registry, and the NAT-setup flag, per the
//! component's thread-safety contract — the IP allocator carries its own
//! lock.

pub mod bridge;
pub mod ip_alloc;
pub mod manager;
pub mod tap;

pub use ip_alloc::IpAllocator;
pub use manager::{NetworkConfig, NetworkManager};
pub use tap::TapRecord;
