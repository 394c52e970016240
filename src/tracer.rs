//! Assembly of the configured components into probes.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use netrace_core::{
    filter::FilterSet,
    probe::{Probe, ProbeBuilder},
};
use probe_common::{EventSender, EventSenderWrapper, ProbeInfo, btf::Btf, parsing::RawEvent};
use skb_tracking::{Tracker, gc::TrackingGc, tracking_hook};
use tokio::{sync::watch, task::JoinHandle};

use crate::config::{
    EVENTS_SECTION, EventsConfig, FILTERS_SECTION, NetraceConfig, TRACKING_SECTION,
};

pub struct Tracer {
    events: EventsConfig,
    filters: FilterSet,
    tracking: skb_tracking::Config,
    tracker: Arc<Tracker>,
    shipped: Arc<AtomicU64>,
}

impl Tracer {
    /// Validate the configuration and allocate the shared tables. Nothing
    /// runs before every section was accepted.
    pub fn new(config: &NetraceConfig, btf: &Btf) -> Result<Self> {
        let events = EventsConfig::try_from(&config.module_config(EVENTS_SECTION))
            .with_context(|| format!("Invalid [{EVENTS_SECTION}] configuration"))?;

        let filters = probe_filtering::Config::try_from(&config.module_config(FILTERS_SECTION))
            .with_context(|| format!("Invalid [{FILTERS_SECTION}] configuration"))?
            .build(btf)
            .context("Error building filters")?;

        let tracking = skb_tracking::Config::try_from(&config.module_config(TRACKING_SECTION))
            .with_context(|| format!("Invalid [{TRACKING_SECTION}] configuration"))?;
        let tracker = tracking
            .build(btf)
            .context("Error setting up skb tracking")?;

        log::info!(
            "netrace {}: {} filters ({}, tags {:#x?}), {} bytes events",
            crate::metadata::VERSION,
            filters.len(),
            filters.combinator(),
            filters.tags(),
            events.capacity
        );

        Ok(Self {
            events,
            filters,
            tracking,
            tracker: Arc::new(tracker),
            shipped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Build the probe for a kernel symbol, with the tracking hook attached.
    pub fn probe(&self, info: ProbeInfo) -> Result<Probe> {
        ProbeBuilder::new(info)
            .capacity(self.events.capacity)
            .hook(Box::new(tracking_hook(
                self.tracker.clone(),
                self.filters.clone(),
            )))
            .build()
            .with_context(|| format!("Error building probe {:#x}", info.symbol))
    }

    /// Wrap the transport to count the shipped events.
    pub fn sender<S: EventSender>(&self, inner: S) -> impl EventSender + use<S> {
        let shipped = self.shipped.clone();
        EventSenderWrapper::new(inner, move |_: &RawEvent| {
            shipped.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Number of events shipped through [`Tracer::sender`].
    pub fn shipped(&self) -> u64 {
        self.shipped.load(Ordering::Relaxed)
    }

    /// Start the tracking garbage collector. It stops when `exit` changes.
    pub fn start_gc(&self, exit: watch::Receiver<()>) -> JoinHandle<()> {
        TrackingGc::new(
            self.tracker.clone(),
            self.tracking.gc_interval,
            self.tracking.old_limit,
        )
        .spawn(exit)
    }
}
