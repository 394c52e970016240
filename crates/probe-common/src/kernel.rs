//! Access to kernel memory from probe code.
//!
//! Probes never dereference kernel pointers directly: every read goes through
//! [`KernelMemory`], the equivalent of `bpf_probe_read_kernel`, and can fail.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("null pointer dereference")]
    NullPointer,
    #[error("fault reading {len} bytes at {addr:#x}")]
    Fault { addr: u64, len: usize },
}

/// Read-only view over kernel memory.
pub trait KernelMemory: Send + Sync {
    /// Fill `buf` with the bytes found at `addr`. The read is all or nothing.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_ne_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Read a pointer stored at `addr`, treating a null value as an error.
    fn read_ptr(&self, addr: u64) -> Result<u64, MemoryError> {
        match self.read_u64(addr)? {
            0 => Err(MemoryError::NullPointer),
            ptr => Ok(ptr),
        }
    }
}

/// Memory which faults on every access. Used by contexts built without a
/// memory view.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

impl KernelMemory for NoMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        Err(MemoryError::Fault {
            addr,
            len: buf.len(),
        })
    }
}
