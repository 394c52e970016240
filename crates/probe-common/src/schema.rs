//! Constants shared between the probes and the code configuring them.
//!
//! Everything crossing the boundary between the capture side and the control
//! side is defined here once. Bump [`SCHEMA_VERSION`] whenever a value or a
//! layout below changes.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Version of the layout contract defined in this module.
pub const SCHEMA_VERSION: u32 = 1;

/// Tag identifying the metadata filter in the configuration language.
pub const META_FILTER_TAG: u32 = 0xdeadbeed;
/// Tag identifying the process filter in the configuration language.
pub const PROCESS_FILTER_TAG: u32 = 0xdeadc0de;

/// Number of metadata targets a meta filter can address, and size in bytes
/// of a target value.
pub const META_TARGET_MAX: usize = 32;
/// Maximum number of operations (target + loads) describing a meta field.
pub const META_OPS_MAX: usize = 32;
/// Maximum number of values in a set-membership target.
pub const META_SET_MAX: usize = META_TARGET_MAX / 8;

/// Maximum number of hooks attached to a single probe.
pub const HOOK_MAX: usize = 10;
/// Maximum number of filters combined in a filter set.
pub const FILTERS_MAX: usize = 8;
/// Maximum number of process targets of a process filter.
pub const PROCESS_TARGETS_MAX: usize = 64;

/// Number of registers saved in a probe context.
pub const REG_MAX: usize = 11;
/// Maximum number of distinct kernel stack sizes the resolver checks.
pub const STACK_SIZES_MAX: usize = 4;

/// Size of a section header: `{ collector_tag: u32, size: u32 }`.
pub const SECTION_HEADER_SIZE: usize = 8;
/// Default capacity of a raw event buffer.
pub const EVENT_CAPACITY_DEFAULT: usize = 1024;

/// Owner of an event section.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u32)]
pub enum CollectorId {
    Common = 1,
    Kernel = 2,
    SkbTracking = 3,
}

impl CollectorId {
    pub fn as_tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(CollectorId::Common),
            2 => Some(CollectorId::Kernel),
            3 => Some(CollectorId::SkbTracking),
            _ => None,
        }
    }
}

/// Kind of kernel probe a hook is attached to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ProbeKind {
    Kprobe = 0,
    Kretprobe = 1,
    RawTracepoint = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_tags_roundtrip() {
        for id in [
            CollectorId::Common,
            CollectorId::Kernel,
            CollectorId::SkbTracking,
        ] {
            assert_eq!(CollectorId::from_tag(id.as_tag()), Some(id));
        }
        assert_eq!(CollectorId::from_tag(0), None);
    }

    #[test]
    fn names() {
        assert_eq!(CollectorId::SkbTracking.to_string(), "skb-tracking");
        assert_eq!("raw_tracepoint".parse(), Ok(ProbeKind::RawTracepoint));
    }

    #[test]
    fn set_fits_target() {
        assert_eq!(META_SET_MAX * std::mem::size_of::<u64>(), META_TARGET_MAX);
    }
}
