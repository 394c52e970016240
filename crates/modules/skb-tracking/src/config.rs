use std::time::Duration;

use netrace_core::{ConfigError, ModuleConfig};
use probe_common::{btf::Btf, maps::MAX_ENTRIES_LIMIT};

use crate::{
    TrackingError,
    stack::StackResolver,
    store::{IdentityStore, StackStore},
    tracking::{ProbeTracking, SkbLayout, Tracker},
};

pub const STORE_CAPACITY_DEFAULT: usize = 8192;
pub const STACK_CAPACITY_DEFAULT: usize = 8192;
/// Task stacks. IRQ stacks have the same size on x86_64.
pub const STACK_SIZES_DEFAULT: [u64; 1] = [16384];
pub const GC_INTERVAL_DEFAULT: Duration = Duration::from_secs(5);
pub const OLD_LIMIT_DEFAULT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub store_capacity: usize,
    pub stack_capacity: usize,
    pub stack_sizes: Vec<u64>,
    pub gc_interval: Duration,
    pub old_limit: Duration,
    pub probes: Vec<ProbeTracking>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_capacity: STORE_CAPACITY_DEFAULT,
            stack_capacity: STACK_CAPACITY_DEFAULT,
            stack_sizes: STACK_SIZES_DEFAULT.to_vec(),
            gc_interval: GC_INTERVAL_DEFAULT,
            old_limit: OLD_LIMIT_DEFAULT,
            probes: Vec::new(),
        }
    }
}

fn positive(config: &ModuleConfig, field: &str, default: u64) -> Result<u64, ConfigError> {
    match config.with_default(field, default)? {
        0 => Err(ConfigError::invalid(field, 0, "must be greater than zero")),
        value => Ok(value),
    }
}

fn capacity(config: &ModuleConfig, field: &str, default: usize) -> Result<usize, ConfigError> {
    match positive(config, field, default as u64)? {
        value if value > MAX_ENTRIES_LIMIT as u64 => Err(ConfigError::invalid(
            field,
            value,
            format!("must be at most {MAX_ENTRIES_LIMIT}"),
        )),
        value => Ok(value as usize),
    }
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Config {
            store_capacity: capacity(config, "store_capacity", STORE_CAPACITY_DEFAULT)?,
            stack_capacity: capacity(config, "stack_capacity", STACK_CAPACITY_DEFAULT)?,
            stack_sizes: config
                .get_list_with_default("stack_sizes", STACK_SIZES_DEFAULT.to_vec())?,
            gc_interval: Duration::from_secs(positive(
                config,
                "gc_interval_secs",
                GC_INTERVAL_DEFAULT.as_secs(),
            )?),
            old_limit: Duration::from_secs(positive(
                config,
                "old_limit_secs",
                OLD_LIMIT_DEFAULT.as_secs(),
            )?),
            probes: config.get_list("probes")?,
        })
    }
}

impl Config {
    /// Allocate the tracking tables.
    pub fn build(&self, btf: &Btf) -> Result<Tracker, TrackingError> {
        let layout = SkbLayout::from_btf(btf)?;
        let resolver = StackResolver::new(&self.stack_sizes)?;
        log::debug!(
            "skb tracking: {} identities, {} stacks, stack sizes {:?}",
            self.store_capacity,
            self.stack_capacity,
            resolver.sizes()
        );
        let tracker = Tracker::new(
            layout,
            IdentityStore::new(self.store_capacity),
            StackStore::new(self.stack_capacity),
            resolver,
        );
        Ok(self
            .probes
            .iter()
            .fold(tracker, |tracker, probe| tracker.with_probe(*probe)))
    }
}

#[cfg(test)]
mod tests {
    use probe_common::test_utils::SKB_BTF;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config, Config::default());
        let tracker = config.build(&SKB_BTF).unwrap();
        assert_eq!(tracker.store().capacity(), STORE_CAPACITY_DEFAULT);
        assert_eq!(config.stack_sizes, vec![16384]);
    }

    #[test]
    fn largest_capacity() {
        let module_config: ModuleConfig = [("store_capacity", MAX_ENTRIES_LIMIT.to_string())]
            .into_iter()
            .collect();
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.store_capacity, MAX_ENTRIES_LIMIT);
    }

    #[test]
    fn custom_values() {
        let module_config: ModuleConfig = [
            ("store_capacity", "128"),
            ("stack_sizes", "16384,8192"),
            ("gc_interval_secs", "1"),
            ("probes", "0xffffffff81001000:free, 0xffffffff81002000:inv_head|no_tracking"),
        ]
        .into_iter()
        .collect();
        let config = Config::try_from(&module_config).unwrap();
        assert_eq!(config.store_capacity, 128);
        assert_eq!(config.stack_sizes, vec![16384, 8192]);
        assert_eq!(config.gc_interval, Duration::from_secs(1));
        assert_eq!(config.old_limit, OLD_LIMIT_DEFAULT);
        assert_eq!(config.probes.len(), 2);

        let tracker = config.build(&SKB_BTF).unwrap();
        assert!(tracker.flags(0xffff_ffff_8100_1000).free);
        let flags = tracker.flags(0xffff_ffff_8100_2000);
        assert!(flags.inv_head && flags.no_tracking && !flags.free);
    }

    #[test]
    fn invalid_values() {
        for (key, value) in [
            ("store_capacity", "0"),
            ("store_capacity", "18446744073709551615"),
            ("stack_capacity", "1048577"),
            ("gc_interval_secs", "-1"),
            ("stack_sizes", "big"),
            ("probes", "ip_rcv:free"),
        ] {
            let module_config: ModuleConfig = [(key, value)].into_iter().collect();
            assert!(Config::try_from(&module_config).is_err(), "{key}={value}");
        }

        let config = Config {
            stack_sizes: vec![12000],
            ..Default::default()
        };
        assert!(matches!(
            config.build(&SKB_BTF),
            Err(TrackingError::StackSize(12000))
        ));
    }
}
