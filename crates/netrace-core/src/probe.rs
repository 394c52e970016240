//! A [`Probe`] owns the hooks attached to a probe site and assembles one
//! event per invocation.

use probe_common::{
    EventSender, ProbeContext, ProbeInfo,
    parsing::{CommonEvent, KernelEvent},
    schema::{EVENT_CAPACITY_DEFAULT, HOOK_MAX, SECTION_HEADER_SIZE},
};
use thiserror::Error;

use crate::{
    event::EventBuffer,
    hook::{HookOutcome, RunHook},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe {symbol:#x} has too many hooks (max {HOOK_MAX})")]
    TooManyHooks { symbol: u64 },
    #[error("event capacity {0} is too small")]
    CapacityTooSmall(usize),
}

pub struct ProbeBuilder {
    info: ProbeInfo,
    capacity: usize,
    hooks: Vec<Box<dyn RunHook>>,
}

impl ProbeBuilder {
    pub fn new(info: ProbeInfo) -> Self {
        Self {
            info,
            capacity: EVENT_CAPACITY_DEFAULT,
            hooks: Vec::new(),
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Attach a hook. Hooks run in the order they were added.
    pub fn hook(mut self, hook: Box<dyn RunHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> Result<Probe, ProbeError> {
        if self.hooks.len() > HOOK_MAX {
            return Err(ProbeError::TooManyHooks {
                symbol: self.info.symbol,
            });
        }
        if self.capacity <= SECTION_HEADER_SIZE {
            return Err(ProbeError::CapacityTooSmall(self.capacity));
        }
        log::debug!(
            "probe {:#x} ({}): {} hooks, {} bytes events",
            self.info.symbol,
            self.info.kind,
            self.hooks.len(),
            self.capacity
        );
        Ok(Probe {
            info: self.info,
            capacity: self.capacity,
            hooks: self.hooks,
        })
    }
}

/// Result of a [`Probe::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub outcomes: Vec<HookOutcome>,
    pub shipped: bool,
}

pub struct Probe {
    info: ProbeInfo,
    capacity: usize,
    hooks: Vec<Box<dyn RunHook>>,
}

impl Probe {
    pub fn info(&self) -> ProbeInfo {
        self.info
    }

    pub fn hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Run every hook for this invocation and ship the event if at least
    /// one of them admitted it.
    pub fn dispatch<S: EventSender>(&self, ctx: &ProbeContext, sender: &mut S) -> Dispatch {
        let buffer = EventBuffer::new(self.capacity);

        let common = CommonEvent {
            timestamp: ctx.timestamp.as_nanos(),
            smp_id: ctx.cpu,
            pid: ctx.pid.map(|pid| pid.as_raw() as u32).unwrap_or(0),
        };
        let kernel = KernelEvent {
            symbol: self.info.symbol,
            probe_type: self.info.kind,
        };
        if let Err(err) = buffer.write_section(&common) {
            log::warn!("probe {:#x}: {err}", self.info.symbol);
        }
        if let Err(err) = buffer.write_section(&kernel) {
            log::warn!("probe {:#x}: {err}", self.info.symbol);
        }

        let outcomes: Vec<_> = self
            .hooks
            .iter()
            .map(|hook| hook.run(ctx, &buffer))
            .collect();

        let shipped = outcomes.iter().any(HookOutcome::admitted);
        if shipped {
            sender.send(buffer.into_event());
        }
        Dispatch { outcomes, shipped }
    }
}
