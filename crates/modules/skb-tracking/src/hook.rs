use std::sync::Arc;

use netrace_core::{
    filter::FilterSet,
    hook::{Hook, HookOps},
};
use probe_common::{ProbeContext, parsing::SkbTrackingEvent};

use crate::{
    MODULE_NAME,
    tracking::{Tracked, Tracker},
};

/// Reports the lineage of the buffer a probe is about. Invocations whose
/// buffer can't be resolved don't write anything.
pub struct SkbTrackingHook {
    tracker: Arc<Tracker>,
}

impl SkbTrackingHook {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

impl HookOps for SkbTrackingHook {
    type Identity = Tracked;
    type Section = SkbTrackingEvent;

    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn try_resolve_identity(&self, ctx: &ProbeContext) -> Option<Tracked> {
        self.tracker.track(ctx)
    }

    fn build_section(
        &self,
        _ctx: &ProbeContext,
        identity: Option<Tracked>,
    ) -> Option<SkbTrackingEvent> {
        identity.map(|tracked| SkbTrackingEvent {
            orig_head: tracked.info.orig_head,
            timestamp: tracked.info.timestamp,
            skb: tracked.skb,
        })
    }
}

/// Build a tracking hook guarded by `filters`.
pub fn tracking_hook(tracker: Arc<Tracker>, filters: FilterSet) -> Hook<SkbTrackingHook> {
    Hook::new(filters, SkbTrackingHook::new(tracker))
}
