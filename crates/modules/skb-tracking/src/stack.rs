//! Best effort identity resolution for probes without access to the buffer.
//!
//! Kernel stacks are aligned on their size, so every function running on a
//! given stack computes the same base from its stack pointer. When a probe
//! sees a buffer it records it under the current stack base; a later probe
//! on the same stack without a buffer argument looks the base up.

use probe_common::schema::STACK_SIZES_MAX;

use crate::{
    TrackingError,
    store::{IdentityStore, StackEntry, StackStore},
};

/// Kernel stack sizes used to compute candidate stack bases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackResolver {
    sizes: Vec<u64>,
}

impl StackResolver {
    /// Duplicated sizes are merged. Sizes must be powers of two.
    pub fn new(sizes: &[u64]) -> Result<Self, TrackingError> {
        let mut unique: Vec<u64> = Vec::with_capacity(STACK_SIZES_MAX);
        for &size in sizes {
            if !size.is_power_of_two() {
                return Err(TrackingError::StackSize(size));
            }
            if !unique.contains(&size) {
                unique.push(size);
            }
        }
        if unique.is_empty() || unique.len() > STACK_SIZES_MAX {
            return Err(TrackingError::StackSizes(unique.len()));
        }
        Ok(Self { sizes: unique })
    }

    pub fn sizes(&self) -> &[u64] {
        &self.sizes
    }

    /// Candidate stack bases for a stack pointer, at most one per size.
    pub fn candidates(&self, stack_pointer: u64) -> impl Iterator<Item = u64> + '_ {
        self.sizes
            .iter()
            .map(move |size| stack_pointer & !(size - 1))
            .filter(|base| *base != 0)
    }

    /// Return the buffer last seen on the current stack, if it is still
    /// tracked. Visits at most one stack store entry per configured size.
    pub fn resolve(
        &self,
        stack_pointer: u64,
        stacks: &StackStore,
        store: &IdentityStore,
    ) -> Option<StackEntry> {
        for base in self.candidates(stack_pointer) {
            let Some(entry) = stacks.get(base) else {
                continue;
            };
            if store.lookup(entry.key).is_some() {
                return Some(entry);
            }
            log::trace!("stale stack entry at {base:#x}");
        }
        None
    }

    /// Remember `entry` as the last buffer seen on the current stack.
    pub fn record(&self, stack_pointer: u64, stacks: &StackStore, entry: StackEntry) {
        for base in self.candidates(stack_pointer) {
            stacks.record(base, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::TrackingInfo;

    const TASK: u64 = 16384;
    const IRQ: u64 = 4096;

    #[test]
    fn validates_sizes() {
        assert_eq!(
            StackResolver::new(&[TASK, TASK]).unwrap().sizes(),
            &[TASK]
        );
        assert!(matches!(
            StackResolver::new(&[3000]),
            Err(TrackingError::StackSize(3000))
        ));
        assert!(matches!(
            StackResolver::new(&[]),
            Err(TrackingError::StackSizes(0))
        ));
        assert!(matches!(
            StackResolver::new(&[1 << 12, 1 << 13, 1 << 14, 1 << 15, 1 << 16]),
            Err(TrackingError::StackSizes(5))
        ));
    }

    #[test]
    fn candidates_are_aligned() {
        let resolver = StackResolver::new(&[TASK, IRQ]).unwrap();
        let bases: Vec<_> = resolver.candidates(0xffff_c900_0001_7e58).collect();
        assert_eq!(bases, vec![0xffff_c900_0001_4000, 0xffff_c900_0001_7000]);
        assert_eq!(resolver.candidates(0x100).count(), 0);
    }

    #[test]
    fn resolves_live_entries_only() {
        let resolver = StackResolver::new(&[TASK]).unwrap();
        let stacks = StackStore::new(16);
        let store = IdentityStore::new(16);
        let sp = 0xffff_c900_0001_7e58;
        let entry = StackEntry {
            key: 0x1000,
            skb: 0x8000,
            last_seen: 1,
        };

        resolver.record(sp, &stacks, entry);
        // Deeper in the same stack.
        assert_eq!(resolver.resolve(sp - 0x200, &stacks, &store), None);

        store.get_or_create(0x1000, TrackingInfo::new(0x1000, 1));
        assert_eq!(resolver.resolve(sp - 0x200, &stacks, &store), Some(entry));
        // Another stack.
        assert_eq!(resolver.resolve(sp + TASK, &stacks, &store), None);
    }

    #[test]
    fn falls_back_to_other_sizes() {
        let resolver = StackResolver::new(&[TASK, IRQ]).unwrap();
        let stacks = StackStore::new(16);
        let store = IdentityStore::new(16);
        let sp = 0xffff_c900_0001_7e58;
        store.get_or_create(0x2000, TrackingInfo::new(0x2000, 1));
        stacks.record(
            sp & !(TASK - 1),
            StackEntry {
                key: 0x1000,
                skb: 0x8000,
                last_seen: 1,
            },
        );
        let live = StackEntry {
            key: 0x2000,
            skb: 0x9000,
            last_seen: 1,
        };
        stacks.record(sp & !(IRQ - 1), live);
        assert_eq!(resolver.resolve(sp, &stacks, &store), Some(live));
    }

    proptest! {
        #[test]
        fn resolution_is_bounded(
            sizes in prop::collection::vec(0u32..24, 1..=STACK_SIZES_MAX),
            sp in any::<u64>(),
            recorded in prop::collection::vec((any::<u64>(), 1..64u64), 0..32),
        ) {
            let sizes: Vec<u64> = sizes.into_iter().map(|shift| 1 << shift).collect();
            let resolver = StackResolver::new(&sizes).unwrap();
            let stacks = StackStore::new(64);
            let store = IdentityStore::new(64);
            for (base, key) in recorded {
                stacks.record(base, StackEntry { key, skb: key, last_seen: 0 });
                if key % 2 == 0 {
                    store.get_or_create(key, TrackingInfo::new(key, 0));
                }
            }
            prop_assert!(resolver.candidates(sp).count() <= STACK_SIZES_MAX);
            if let Some(entry) = resolver.resolve(sp, &stacks, &store) {
                prop_assert!(store.lookup(entry.key).is_some());
                let base = resolver.candidates(sp).find(|base| stacks.get(*base) == Some(entry));
                prop_assert!(base.is_some());
            }
        }
    }
}
