//! [`ProbeContext`] is what a hook sees when its probe fires.

use nix::unistd::Pid;

use crate::{
    kernel::{KernelMemory, NoMemory},
    schema::{ProbeKind, REG_MAX},
    time::Timestamp,
};

/// Static description of the probe site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Address of the probed symbol, used as a key by per-probe configuration.
    pub symbol: u64,
    pub kind: ProbeKind,
}

/// Position of well known arguments in the saved registers, as computed by
/// the loader when inspecting the probed function signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgOffsets {
    pub sk_buff: Option<u8>,
}

/// Execution context of one probe invocation.
pub struct ProbeContext<'a> {
    pub probe: ProbeInfo,
    pub timestamp: Timestamp,
    pub offsets: ArgOffsets,
    pub regs: [u64; REG_MAX],
    /// Stack pointer at the time the probe fired.
    pub stack_pointer: u64,
    /// Current process, `None` when running in interrupt context.
    pub pid: Option<Pid>,
    pub cpu: u32,
    pub memory: &'a dyn KernelMemory,
}

impl<'a> ProbeContext<'a> {
    pub fn new(probe: ProbeInfo, timestamp: Timestamp) -> Self {
        Self {
            probe,
            timestamp,
            offsets: ArgOffsets::default(),
            regs: [0; REG_MAX],
            stack_pointer: 0,
            pid: None,
            cpu: 0,
            memory: &NoMemory,
        }
    }

    pub fn with_memory(mut self, memory: &'a dyn KernelMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_arg(mut self, index: usize, value: u64) -> Self {
        if let Some(reg) = self.regs.get_mut(index) {
            *reg = value;
        }
        self
    }

    /// Declare the register holding the `struct sk_buff *` and set its value.
    pub fn with_skb(mut self, index: u8, skb: u64) -> Self {
        self.offsets.sk_buff = Some(index);
        self.with_arg(index as usize, skb)
    }

    pub fn with_stack_pointer(mut self, sp: u64) -> Self {
        self.stack_pointer = sp;
        self
    }

    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    /// Value of the `index`-th saved register, zero if out of range.
    pub fn arg(&self, index: usize) -> u64 {
        self.regs.get(index).copied().unwrap_or(0)
    }

    /// The `struct sk_buff *` argument, if this probe site has one and it is
    /// not null.
    pub fn skb(&self) -> Option<u64> {
        let offset = self.offsets.sk_buff? as usize;
        match self.regs.get(offset) {
            Some(0) | None => None,
            Some(skb) => Some(*skb),
        }
    }
}
