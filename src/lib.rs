//! Netrace traces packets through the networking stack of the kernel.
//!
//! Probes attached to kernel functions run a set of hooks; each hook checks
//! its filters and contributes a section to the event the probe ships. The
//! skb tracking hook attributes every event to a packet lineage, so the
//! events of a packet can be put back together even when its buffer was
//! cloned or reallocated on the way.
//!
//! The crates:
//!
//! - [`probe_common`]: what probes see (context, kernel memory, maps, type
//!   information) and the event wire format;
//! - [`netrace_core`]: configuration, filter combination, event buffers,
//!   hooks and probes;
//! - [`probe_filtering`]: the meta and process filters;
//! - [`skb_tracking`]: the identity store and correlator.
//!
//! This crate loads the `INI` configuration and assembles the pieces, see
//! [`tracer::Tracer`]:
//!
//! ```ini
//! [events]
//! capacity = 1024
//!
//! [filters]
//! combinator = and
//! meta = sk_buff.dev.name == "eth0"; sk_buff.mark:0xff == 0x1
//! pids = 1234
//!
//! [skb-tracking]
//! store_capacity = 8192
//! gc_interval_secs = 5
//! old_limit_secs = 60
//! probes = 0xffffffff81a2b3c0:free, 0xffffffff81a2c000:inv_head
//! ```

pub mod config;
pub mod tracer;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
