pub mod btf;
pub mod context;
pub mod kernel;
pub mod maps;
pub mod parsing;
pub mod schema;
mod sender;
pub mod time;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use context::{ArgOffsets, ProbeContext, ProbeInfo};
pub use sender::{EventSender, EventSenderWrapper};

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;
