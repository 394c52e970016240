//! # Event filtering
//!
//! Filters attached to the hooks, deciding whether a probe invocation is
//! interesting for the rest of the system:
//!
//! - the [`meta`] filter checks the content of the `struct sk_buff` and of
//!   the structures reachable from it;
//! - the [`process`] filter checks the process the probe fired in.
//!
//! Filters are built from the `[filters]` configuration section and combined
//! in a single [`netrace_core::filter::FilterSet`].

pub mod config;
pub mod meta;
pub mod process;

use netrace_core::filter::FilterSetError;
use probe_common::maps::MapError;
use thiserror::Error;

pub use config::Config;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid meta filter '{expression}': {source}")]
    Meta {
        expression: String,
        #[source]
        source: meta::MetaError,
    },
    #[error(transparent)]
    InvalidMeta(#[from] meta::MetaError),
    #[error("process filter: {0}")]
    Process(#[from] MapError),
    #[error(transparent)]
    FilterSet(#[from] FilterSetError),
}
