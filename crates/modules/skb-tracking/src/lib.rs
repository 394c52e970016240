//! # SKB tracking
//!
//! Identifies packets across the networking stack: every probe invocation
//! about a `struct sk_buff` is attributed to a lineage `(orig_head,
//! timestamp)` which stays the same when the buffer is cloned or its data
//! reallocated. Probes without a buffer argument fall back to the last
//! buffer seen on the same kernel stack.
//!
//! The pieces:
//! - [`store`]: the identity and stack tables;
//! - [`stack`]: stack base computation and resolution;
//! - [`tracking`]: the correlator, [`Tracker`];
//! - [`hook`]: the hook writing [`probe_common::parsing::SkbTrackingEvent`]
//!   sections;
//! - [`gc`]: eviction of stale entries.

use probe_common::{btf::BtfError, schema::STACK_SIZES_MAX};
use thiserror::Error;

pub mod config;
pub mod gc;
pub mod hook;
pub mod stack;
pub mod store;
pub mod tracking;

pub use config::Config;
pub use hook::{SkbTrackingHook, tracking_hook};
pub use tracking::{Tracked, Tracker};

pub const MODULE_NAME: &str = "skb-tracking";

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("type information: {0}")]
    Btf(#[from] BtfError),
    #[error("struct sk_buff has no member {0}")]
    MissingMember(&'static str),
    #[error("stack size {0} is not a power of two")]
    StackSize(u64),
    #[error("{0} stack sizes configured, expected 1 to {STACK_SIZES_MAX}")]
    StackSizes(usize),
}
