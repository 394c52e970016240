//! Capture side building blocks: filters, hooks, probes and the event buffer
//! they write to.

pub mod config;
pub mod event;
pub mod filter;
pub mod hook;
pub mod probe;

pub use config::{ConfigError, ModuleConfig};
