//! Correlation of buffers to packet lineages.
//!
//! A lineage is identified by the head of its buffer when it was first seen
//! (`orig_head`) and that first timestamp. Entries are keyed by the current
//! head address: clones share the head of their parent, so they share its
//! entry. Probes reallocating the head are configured with `inv_head`, the
//! entry is then also indexed by the `struct sk_buff` address until the next
//! observation re-keys it under the new head.

use std::{collections::HashMap, str::FromStr};

use probe_common::{
    ProbeContext,
    btf::Btf,
    kernel::KernelMemory,
    maps::Entry,
};
use strum::EnumString;

use crate::{
    TrackingError,
    stack::StackResolver,
    store::{IdentityStore, StackEntry, StackStore, TrackingInfo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
enum TrackingFlag {
    Free,
    PartialFree,
    InvHead,
    NoTracking,
}

/// Per probe tracking behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingFlags {
    /// The probed function frees the buffer head.
    pub free: bool,
    /// The probed function frees the buffer head unless it was stolen, which
    /// is reported in its second argument.
    pub partial_free: bool,
    /// The probed function is about to replace the buffer head.
    pub inv_head: bool,
    /// Never create entries at this probe.
    pub no_tracking: bool,
}

/// Parse `flag|flag|...`.
impl FromStr for TrackingFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = TrackingFlags::default();
        for flag in s.split('|').map(str::trim).filter(|f| !f.is_empty()) {
            match TrackingFlag::from_str(flag).map_err(|_| format!("unknown flag '{flag}'"))? {
                TrackingFlag::Free => flags.free = true,
                TrackingFlag::PartialFree => flags.partial_free = true,
                TrackingFlag::InvHead => flags.inv_head = true,
                TrackingFlag::NoTracking => flags.no_tracking = true,
            }
        }
        Ok(flags)
    }
}

/// Tracking configuration of a probe, `symbol_address:flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTracking {
    pub symbol: u64,
    pub flags: TrackingFlags,
}

impl FromStr for ProbeTracking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, flags) = s.split_once(':').unwrap_or((s, ""));
        let symbol = symbol.trim();
        let symbol = match symbol.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => symbol.parse(),
        }
        .map_err(|err| format!("invalid symbol address '{symbol}': {err}"))?;
        Ok(Self {
            symbol,
            flags: flags.parse()?,
        })
    }
}

/// Location of the fields of `struct sk_buff` used for tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkbLayout {
    pub head: u64,
}

impl SkbLayout {
    pub fn from_btf(btf: &Btf) -> Result<Self, TrackingError> {
        let skb = btf.resolve_struct("sk_buff")?;
        let head = btf
            .find_member(skb, "head")?
            .ok_or(TrackingError::MissingMember("head"))?;
        Ok(Self {
            head: (head.bit_offset / 8) as u64,
        })
    }

    /// Current head of the buffer, `None` if unreadable or null.
    pub fn read_head(&self, memory: &dyn KernelMemory, skb: u64) -> Option<u64> {
        memory.read_ptr(skb.checked_add(self.head)?).ok()
    }
}

/// Identity of the buffer a probe is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub info: TrackingInfo,
    /// Address of the `struct sk_buff`, zero if unknown.
    pub skb: u64,
}

/// Counters returned by [`Tracker::collect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collected {
    pub identities: usize,
    pub stacks: usize,
}

/// Looks up or establishes the lineage of the buffers seen by probes.
pub struct Tracker {
    layout: SkbLayout,
    store: IdentityStore,
    stacks: StackStore,
    resolver: StackResolver,
    probes: HashMap<u64, TrackingFlags>,
}

impl Tracker {
    pub fn new(
        layout: SkbLayout,
        store: IdentityStore,
        stacks: StackStore,
        resolver: StackResolver,
    ) -> Self {
        Self {
            layout,
            store,
            stacks,
            resolver,
            probes: HashMap::new(),
        }
    }

    /// Configure the tracking behaviour of a probe.
    pub fn with_probe(mut self, probe: ProbeTracking) -> Self {
        log::debug!("tracking flags of {:#x}: {:?}", probe.symbol, probe.flags);
        self.probes.insert(probe.symbol, probe.flags);
        self
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn stacks(&self) -> &StackStore {
        &self.stacks
    }

    pub fn flags(&self, symbol: u64) -> TrackingFlags {
        self.probes.get(&symbol).copied().unwrap_or_default()
    }

    /// Resolve the lineage of the buffer this invocation is about, from the
    /// `struct sk_buff` argument if the probe has one, from the stack
    /// otherwise.
    pub fn track(&self, ctx: &ProbeContext) -> Option<Tracked> {
        match ctx.skb() {
            Some(skb) => self.track_skb(ctx, skb).map(|info| Tracked { info, skb }),
            None => self.track_stack(ctx),
        }
    }

    fn track_skb(&self, ctx: &ProbeContext, skb: u64) -> Option<TrackingInfo> {
        let head = self.layout.read_head(ctx.memory, skb)?;
        let flags = self.flags(ctx.probe.symbol);
        let now = ctx.timestamp.as_nanos();

        let info = match self.store.lookup(head) {
            Some(info) => info,
            None => self.adopt_or_create(head, skb, now, flags)?,
        };

        if flags.inv_head {
            self.store.alias(skb, info);
        }

        if flags.free || (flags.partial_free && ctx.arg(1) == 0) {
            self.store.remove(head);
            return Some(info);
        }

        let info = self.store.touch(head, now).unwrap_or(info);
        self.resolver.record(
            ctx.stack_pointer,
            &self.stacks,
            StackEntry {
                key: head,
                skb,
                last_seen: now,
            },
        );
        Some(info)
    }

    /// Handle a head we know nothing about: either the head was just
    /// replaced and the lineage is indexed by the buffer address, or this is
    /// a new lineage.
    fn adopt_or_create(
        &self,
        head: u64,
        skb: u64,
        now: u64,
        flags: TrackingFlags,
    ) -> Option<TrackingInfo> {
        let (candidate, invalidated) = match self.store.lookup(skb) {
            Some(info) => (info, true),
            None if flags.no_tracking => return None,
            None => (TrackingInfo::new(head, now), false),
        };

        let info = match self.store.get_or_create(head, candidate)? {
            Entry::Inserted(info) => {
                log::trace!(
                    "{} {head:#x} (orig_head {:#x})",
                    if invalidated { "re-keyed" } else { "new" },
                    info.orig_head
                );
                info
            }
            Entry::Existing(info) => info,
        };
        if invalidated {
            self.store.remove(skb);
        }
        Some(info)
    }

    fn track_stack(&self, ctx: &ProbeContext) -> Option<Tracked> {
        let entry = self
            .resolver
            .resolve(ctx.stack_pointer, &self.stacks, &self.store)?;
        let info = self.store.touch(entry.key, ctx.timestamp.as_nanos())?;
        Some(Tracked {
            info,
            skb: entry.skb,
        })
    }

    /// Remove identities and stack entries last seen before `limit`.
    pub fn collect(&self, limit: u64) -> Collected {
        Collected {
            identities: self.store.evict_older_than(limit),
            stacks: self.stacks.evict_older_than(limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use probe_common::{
        ProbeInfo,
        schema::ProbeKind,
        test_utils::{SKB_BTF, SimulatedMemory, SkbBuilder, offsets},
        time::Timestamp,
    };

    use super::*;

    const KFREE_SKB: u64 = 0xffff_ffff_8100_1000;
    const PSKB_EXPAND_HEAD: u64 = 0xffff_ffff_8100_2000;
    const KFREE_SKB_PARTIAL: u64 = 0xffff_ffff_8100_3000;
    const IP_RCV: u64 = 0xffff_ffff_8100_4000;
    const SP: u64 = 0xffff_c900_0001_7e58;

    fn tracker() -> Tracker {
        Tracker::new(
            SkbLayout::from_btf(&SKB_BTF).unwrap(),
            IdentityStore::new(64),
            StackStore::new(64),
            StackResolver::new(&[16384]).unwrap(),
        )
        .with_probe(ProbeTracking {
            symbol: KFREE_SKB,
            flags: "free".parse().unwrap(),
        })
        .with_probe(ProbeTracking {
            symbol: PSKB_EXPAND_HEAD,
            flags: "inv_head".parse().unwrap(),
        })
        .with_probe(ProbeTracking {
            symbol: KFREE_SKB_PARTIAL,
            flags: "partial_free".parse().unwrap(),
        })
    }

    fn ctx<'a>(memory: &'a SimulatedMemory, symbol: u64, ts: u64) -> ProbeContext<'a> {
        ProbeContext::new(
            ProbeInfo {
                symbol,
                kind: ProbeKind::Kprobe,
            },
            Timestamp::from(ts),
        )
        .with_memory(memory)
        .with_stack_pointer(SP)
    }

    #[test]
    fn parses_probe_settings() {
        assert_eq!(
            "0xffffffff81001000:free|inv_head".parse(),
            Ok(ProbeTracking {
                symbol: 0xffff_ffff_8100_1000,
                flags: TrackingFlags {
                    free: true,
                    inv_head: true,
                    ..Default::default()
                }
            })
        );
        assert_eq!(
            "42".parse::<ProbeTracking>().map(|p| p.flags),
            Ok(TrackingFlags::default())
        );
        assert!("0x42:steal".parse::<ProbeTracking>().is_err());
        assert!("0xzz:free".parse::<ProbeTracking>().is_err());
    }

    #[test]
    fn layout_from_btf() {
        assert_eq!(
            SkbLayout::from_btf(&SKB_BTF).unwrap().head,
            offsets::SKB_HEAD as u64
        );
        assert!(SkbLayout::from_btf(&Btf::new()).is_err());
    }

    #[test]
    fn clones_share_the_lineage() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        SkbBuilder::new().head(0x1000).cloned(true).write(&memory, 0x9000);
        let tracker = tracker();

        let first = tracker
            .track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000))
            .unwrap();
        let clone = tracker
            .track(&ctx(&memory, IP_RCV, 20).with_skb(0, 0x9000))
            .unwrap();
        assert_eq!(first.info.orig_head, 0x1000);
        assert_eq!(
            (clone.info.orig_head, clone.info.timestamp),
            (0x1000, 10)
        );
        assert_eq!(clone.skb, 0x9000);
        assert_eq!(tracker.store().len(), 1);
    }

    #[test]
    fn head_reallocation_keeps_the_lineage() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        let tracker = tracker();

        tracker
            .track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000))
            .unwrap();
        tracker
            .track(&ctx(&memory, PSKB_EXPAND_HEAD, 20).with_skb(0, 0x8000))
            .unwrap();
        assert!(tracker.store().lookup(0x8000).is_some());

        SkbBuilder::new().head(0x5000).write(&memory, 0x8000);
        let after = tracker
            .track(&ctx(&memory, IP_RCV, 30).with_skb(0, 0x8000))
            .unwrap();
        assert_eq!((after.info.orig_head, after.info.timestamp), (0x1000, 10));
        assert!(tracker.store().lookup(0x8000).is_none());
        assert!(tracker.store().lookup(0x5000).is_some());
    }

    #[test]
    fn free_drops_the_entry_after_reporting() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        let tracker = tracker();

        tracker
            .track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000))
            .unwrap();
        let freed = tracker
            .track(&ctx(&memory, KFREE_SKB, 20).with_skb(0, 0x8000))
            .unwrap();
        assert_eq!(freed.info.orig_head, 0x1000);
        assert!(tracker.store().is_empty());
    }

    #[test]
    fn partial_free_keeps_stolen_heads() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        let tracker = tracker();

        let stolen = ctx(&memory, KFREE_SKB_PARTIAL, 10)
            .with_skb(0, 0x8000)
            .with_arg(1, 1);
        tracker.track(&stolen).unwrap();
        assert_eq!(tracker.store().len(), 1);

        let not_stolen = ctx(&memory, KFREE_SKB_PARTIAL, 20).with_skb(0, 0x8000);
        tracker.track(&not_stolen).unwrap();
        assert!(tracker.store().is_empty());
    }

    #[test]
    fn no_tracking_only_reports() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        let tracker = tracker().with_probe(ProbeTracking {
            symbol: IP_RCV,
            flags: "no_tracking".parse().unwrap(),
        });
        assert_eq!(
            tracker.track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000)),
            None
        );
        tracker
            .track(&ctx(&memory, KFREE_SKB_PARTIAL, 10).with_skb(0, 0x8000).with_arg(1, 1))
            .unwrap();
        assert!(
            tracker
                .track(&ctx(&memory, IP_RCV, 20).with_skb(0, 0x8000))
                .is_some()
        );
    }

    #[test]
    fn unreadable_buffers_are_not_tracked() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().write(&memory, 0x8000);
        let tracker = tracker();
        assert_eq!(
            tracker.track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000)),
            None
        );
        assert_eq!(
            tracker.track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0xdead_0000)),
            None
        );
        assert!(tracker.store().is_empty());
    }

    #[test]
    fn stack_resolution() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        let tracker = tracker();

        assert_eq!(tracker.track(&ctx(&memory, IP_RCV, 5)), None);
        tracker
            .track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000))
            .unwrap();
        let resolved = tracker.track(&ctx(&memory, IP_RCV, 20)).unwrap();
        assert_eq!(resolved.skb, 0x8000);
        assert_eq!(resolved.info.orig_head, 0x1000);
        assert_eq!(resolved.info.last_seen, 20);
    }

    #[test]
    fn collect_old_entries() {
        let memory = SimulatedMemory::new();
        SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
        SkbBuilder::new().head(0x2000).write(&memory, 0x9000);
        let tracker = tracker();
        tracker
            .track(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000))
            .unwrap();
        tracker
            .track(&ctx(&memory, IP_RCV, 100).with_skb(0, 0x9000))
            .unwrap();

        assert_eq!(
            tracker.collect(50),
            Collected {
                identities: 1,
                stacks: 0
            }
        );
        assert!(tracker.store().lookup(0x1000).is_none());
        assert!(tracker.store().lookup(0x2000).is_some());
        assert_eq!(
            tracker.collect(200),
            Collected {
                identities: 1,
                stacks: 1
            }
        );
    }
}
