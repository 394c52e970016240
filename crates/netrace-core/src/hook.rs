//! A hook is a unit of work bound to a probe: it checks its filters, resolves
//! the identity of the object the probe is about, and writes one section to
//! the event.
//!
//! ```text
//! ENTERED -> FILTERED_OUT
//! ENTERED -> ADMITTED -> RESOLVED   -> SECTION_WRITTEN | SECTION_SKIPPED
//!                     -> UNRESOLVED -> SECTION_WRITTEN | SECTION_SKIPPED
//! ```
//!
//! Hooks never fail: every path ends in a [`HookOutcome`].

use probe_common::{ProbeContext, parsing::SectionPayload};

use crate::{
    event::{EventBuffer, WriteError},
    filter::FilterSet,
};

/// What a hook does when no identity could be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedPolicy {
    /// Don't write anything.
    Skip,
    /// Build the section without an identity.
    Proceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Unresolved,
    NoData,
    NoSpace,
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    FilteredOut,
    SectionWritten,
    SectionSkipped(SkipReason),
}

impl HookOutcome {
    /// The filters of the hook let the event through.
    pub fn admitted(&self) -> bool {
        !matches!(self, HookOutcome::FilteredOut)
    }
}

/// The parts specific to a kind of hook.
pub trait HookOps: Send + Sync {
    type Identity: Copy;
    type Section: SectionPayload;

    fn name(&self) -> &'static str;

    fn try_resolve_identity(&self, ctx: &ProbeContext) -> Option<Self::Identity>;

    fn build_section(
        &self,
        ctx: &ProbeContext,
        identity: Option<Self::Identity>,
    ) -> Option<Self::Section>;

    fn unresolved_policy(&self) -> UnresolvedPolicy {
        UnresolvedPolicy::Skip
    }
}

pub struct Hook<O> {
    filters: FilterSet,
    ops: O,
}

impl<O: HookOps> Hook<O> {
    pub fn new(filters: FilterSet, ops: O) -> Self {
        Self { filters, ops }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn run(&self, ctx: &ProbeContext, buffer: &EventBuffer) -> HookOutcome {
        if !self.filters.evaluate(ctx) {
            log::trace!("{}: filtered out", self.ops.name());
            return HookOutcome::FilteredOut;
        }

        let identity = self.ops.try_resolve_identity(ctx);
        if identity.is_none() && self.ops.unresolved_policy() == UnresolvedPolicy::Skip {
            log::trace!("{}: unresolved identity", self.ops.name());
            return HookOutcome::SectionSkipped(SkipReason::Unresolved);
        }

        let Some(section) = self.ops.build_section(ctx, identity) else {
            return HookOutcome::SectionSkipped(SkipReason::NoData);
        };

        match buffer.write_section(&section) {
            Ok(()) => HookOutcome::SectionWritten,
            Err(err @ WriteError::NoSpace { .. }) => {
                log::warn!("{}: {err}", self.ops.name());
                HookOutcome::SectionSkipped(SkipReason::NoSpace)
            }
            Err(err) => {
                log::warn!("{}: {err}", self.ops.name());
                HookOutcome::SectionSkipped(SkipReason::Encoding)
            }
        }
    }
}

/// Object safe view of a [`Hook`], so hooks of different kinds can be
/// attached to the same probe.
pub trait RunHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &ProbeContext, buffer: &EventBuffer) -> HookOutcome;
}

impl<O: HookOps> RunHook for Hook<O> {
    fn name(&self) -> &'static str {
        self.ops.name()
    }

    fn run(&self, ctx: &ProbeContext, buffer: &EventBuffer) -> HookOutcome {
        Hook::run(self, ctx, buffer)
    }
}
