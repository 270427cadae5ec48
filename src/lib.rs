//! Process tracer orchestration on top of [`bpf_common`].
//!
//! The pieces fit together like this: process discovery hands executables to
//! a [`ProcessTracer`], which loads its program bundles once and keeps one
//! [`Instrumenter`] per executable inode; kernel programs write events into
//! per-bundle ring buffers; event pumps filter them by PID and emit span
//! batches to the consumer.

pub mod gotracer;
pub mod instrument;
pub mod tracer;
pub mod utility;

pub use instrument::{AttachError, Closable, Instrumenter};
pub use tracer::{ProcessTracer, TracerError, TracerKind};
pub use utility::UtilityTracer;

pub use bpf_common;
