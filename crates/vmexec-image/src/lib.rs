//! vmexec-image: OCI image to ext4 rootfs preparer.
//!
//! Idempotent, content-addressed: the same image reference always maps to
//! the same cached artifact path, and a cache hit short-circuits the whole
//! extraction/format pipeline.

pub mod pipeline;
pub mod preparer;
pub mod sanitize;

pub use preparer::ImagePreparer;
pub use sanitize::sanitize;
