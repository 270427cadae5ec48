pub mod bpf_fs;
pub mod bundle;
pub mod config;
pub mod filter;
pub mod load;
pub mod offsets;
pub mod pump;
pub mod reporter;
pub mod span;

pub use bundle::{BundleArtifacts, BundleVariant, ProbeTable, ProgramBundle};
pub use config::TracerConfig;
pub use filter::{IdentityFilter, PidFilter, ServiceFilter, ServiceId};
pub use load::{LoadContext, LoadError};
pub use pump::{Decoded, EventDecoder, EventPump};
pub use reporter::{AccountingReporter, NoopReporter, Reporter};
pub use span::Span;

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error
/// message, making it much less useful. Instead of re-implementing that,
/// we'll just use anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

/// Render an error and every source below it, one line per level. Used where
/// the error is only borrowed and its full chain matters, like verifier
/// output buried in a load failure.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        rendered.push_str("\n  caused by: ");
        rendered.push_str(&source.to_string());
        current = source.source();
    }
    rendered
}
