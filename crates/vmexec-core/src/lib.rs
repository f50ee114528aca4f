//! vmexec-core: task model, error kinds, command-execution abstraction.
//!
//! No internal vmexec dependencies — this is the foundation crate every
//! other component crate (`vmexec-image`, `vmexec-network`, `vmexec-vmm`,
//! `vmexec-translate`) builds on.

pub mod cancel;
pub mod command;
pub mod error;
pub mod mock;
pub mod naming;
pub mod retry;
pub mod task;
pub mod time;

pub use cancel::CancelToken;
pub use command::{CommandOutput, CommandRunner, ProcessSpawner, RealCommandRunner, RealProcessSpawner};
pub use error::ExecutorError;
pub use task::{
    ContainerMount, ContainerSpec, InitSystem, NetworkAttachment, ResourceLimits, Task,
};
