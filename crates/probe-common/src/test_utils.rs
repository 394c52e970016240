//! Test helpers: a simulated kernel address space and a type registry
//! describing the kernel structures probes look at.
//!
//! Example usage:
//! ```ignore
//! use probe_common::test_utils::{SimulatedMemory, SkbBuilder};
//!
//! let memory = SimulatedMemory::new();
//! SkbBuilder::new().head(0x1000).mark(0xc0de).write(&memory, 0x8000);
//! let ctx = ProbeContext::new(probe, Timestamp::from(1))
//!     .with_memory(&memory)
//!     .with_skb(0, 0x8000);
//! ```

use std::{collections::BTreeMap, sync::RwLock};

use lazy_static::lazy_static;

use crate::{
    btf::{Btf, Struct, Type, bitfield, member},
    kernel::{KernelMemory, MemoryError},
};

/// Layout of the structures registered in [`SKB_BTF`], in bytes unless
/// stated otherwise.
pub mod offsets {
    pub const SKB_SIZE: usize = 232;
    pub const SKB_DEV: usize = 16;
    pub const SKB_CB: usize = 40;
    pub const SKB_NFCT: usize = 104;
    pub const SKB_LEN: usize = 112;
    pub const SKB_MAC_LEN: usize = 120;
    /// Bit offset of the 1 bit `cloned` bitfield.
    pub const SKB_CLONED_BIT: usize = 1008;
    /// Bit offset of the 3 bits `pkt_type` bitfield.
    pub const SKB_PKT_TYPE_BIT: usize = 1024;
    pub const SKB_HEADERS: usize = 136;
    pub const SKB_MARK: usize = 168;
    pub const SKB_HEAD: usize = 192;
    pub const SKB_DATA: usize = 200;

    pub const NETDEV_SIZE: usize = 64;
    pub const NETDEV_NAME: usize = 0;
    pub const NETDEV_IFINDEX: usize = 24;
    pub const NETDEV_MTU: usize = 32;
    pub const NETDEV_PCPU_REFCNT: usize = 40;

    pub const NF_CONN_SIZE: usize = 248;
    pub const NF_CONN_MARK: usize = 168;
}

lazy_static! {
    /// Type information for `sk_buff`, `net_device` and `nf_conn`, laid out
    /// like on a 64-bit kernel.
    pub static ref SKB_BTF: Btf = skb_btf();
}

fn skb_btf() -> Btf {
    use offsets::*;

    let bits = |bytes: usize| (bytes * 8) as u32;
    let mut btf = Btf::new();

    let char_t = btf.add_int("char", 1, true);
    let u8_t = btf.add_int("unsigned char", 1, false);
    let u16_t = btf.add_int("unsigned short", 2, false);
    let int_t = btf.add_int("int", 4, true);
    let uint_t = btf.add_int("unsigned int", 4, false);
    let ulong_t = btf.add_int("long unsigned int", 8, false);
    let u32_t = btf.add_typedef("u32", uint_t);
    let u16_td = btf.add_typedef("__u16", u16_t);
    let u8_td = btf.add_typedef("__u8", u8_t);

    let name_t = btf.add_array(char_t, 16);
    let int_ptr = btf.add_ptr(int_t);
    let net_device = btf.add_struct(
        "net_device",
        NETDEV_SIZE as u32,
        vec![
            member("name", name_t, bits(NETDEV_NAME)),
            member("ifindex", int_t, bits(NETDEV_IFINDEX)),
            member("mtu", uint_t, bits(NETDEV_MTU)),
            member("pcpu_refcnt", int_ptr, bits(NETDEV_PCPU_REFCNT)),
        ],
    );
    let net_device_ptr = btf.add_ptr(net_device);

    btf.add_struct(
        "nf_conn",
        NF_CONN_SIZE as u32,
        vec![
            member("status", ulong_t, 128 * 8),
            member("mark", u32_t, bits(NF_CONN_MARK)),
        ],
    );

    // struct sk_buff *next, *prev are declared against a placeholder
    // replaced once sk_buff exists.
    let sk_buff = btf.add(Type::Void);
    let sk_buff_ptr = btf.add_ptr(sk_buff);

    let dev_union = btf.add_union(
        "",
        8,
        vec![
            member("dev", net_device_ptr, 0),
            member("dev_scratch", ulong_t, 0),
        ],
    );
    let list = btf.add_struct(
        "",
        24,
        vec![
            member("next", sk_buff_ptr, 0),
            member("prev", sk_buff_ptr, 64),
            member("", dev_union, 128),
        ],
    );

    let cb_t = btf.add_array(char_t, 48);
    let headers = btf.add_struct(
        "skb_headers",
        32,
        vec![
            member("skb_iif", int_t, 0),
            member("protocol", u16_td, 32),
            member("transport_header", u16_td, 48),
        ],
    );
    let mark_union = btf.add_union(
        "",
        4,
        vec![
            member("mark", u32_t, 0),
            member("reserved_tailroom", u32_t, 0),
        ],
    );
    let head_ptr = btf.add_ptr(u8_t);

    btf.set(
        sk_buff,
        Type::Struct(Struct {
            name: "sk_buff".to_string(),
            size: SKB_SIZE as u32,
            members: vec![
                member("", list, 0),
                member("tstamp", ulong_t, bits(32)),
                member("cb", cb_t, bits(SKB_CB)),
                member("_skb_refdst", ulong_t, bits(88)),
                member("_nfct", ulong_t, bits(SKB_NFCT)),
                member("len", uint_t, bits(SKB_LEN)),
                member("data_len", uint_t, bits(116)),
                member("mac_len", u16_t, bits(SKB_MAC_LEN)),
                member("hdr_len", u16_t, bits(122)),
                bitfield("cloned", u8_td, SKB_CLONED_BIT as u32, 1),
                bitfield("nohdr", u8_td, SKB_CLONED_BIT as u32 + 1, 1),
                bitfield("pkt_type", u8_td, SKB_PKT_TYPE_BIT as u32, 3),
                member("headers", headers, bits(SKB_HEADERS)),
                member("", mark_union, bits(SKB_MARK)),
                member("tail", uint_t, bits(176)),
                member("end", uint_t, bits(180)),
                member("head", head_ptr, bits(SKB_HEAD)),
                member("data", head_ptr, bits(SKB_DATA)),
                member("truesize", uint_t, bits(208)),
            ],
        }),
    )
    .expect("sk_buff placeholder was registered above");

    btf
}

/// Sparse simulated kernel memory made of independent regions.
#[derive(Default)]
pub struct SimulatedMemory {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `addr`, replacing any region starting there.
    pub fn map(&self, addr: u64, data: Vec<u8>) {
        self.regions.write().unwrap().insert(addr, data);
    }

    pub fn unmap(&self, addr: u64) {
        self.regions.write().unwrap().remove(&addr);
    }

    /// Overwrite bytes inside an already mapped region.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut regions = self.regions.write().unwrap();
        let fault = MemoryError::Fault {
            addr,
            len: data.len(),
        };
        let (start, region) = regions.range_mut(..=addr).next_back().ok_or(fault.clone())?;
        let offset = (addr - start) as usize;
        let target = region
            .get_mut(offset..offset + data.len())
            .ok_or(fault)?;
        target.copy_from_slice(data);
        Ok(())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_ne_bytes())
    }
}

impl KernelMemory for SimulatedMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if addr == 0 {
            return Err(MemoryError::NullPointer);
        }
        let fault = MemoryError::Fault {
            addr,
            len: buf.len(),
        };
        let regions = self.regions.read().map_err(|_| fault.clone())?;
        let (start, region) = regions.range(..=addr).next_back().ok_or(fault.clone())?;
        let offset = (addr - start) as usize;
        let source = region.get(offset..offset + buf.len()).ok_or(fault)?;
        buf.copy_from_slice(source);
        Ok(())
    }
}

/// Builds the bytes of a `struct sk_buff` following [`offsets`].
#[derive(Clone)]
pub struct SkbBuilder {
    bytes: Vec<u8>,
}

impl Default for SkbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SkbBuilder {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; offsets::SKB_SIZE],
        }
    }

    fn put(mut self, offset: usize, data: &[u8]) -> Self {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self
    }

    pub fn head(self, head: u64) -> Self {
        self.put(offsets::SKB_HEAD, &head.to_ne_bytes())
    }

    pub fn dev(self, dev: u64) -> Self {
        self.put(offsets::SKB_DEV, &dev.to_ne_bytes())
    }

    pub fn mark(self, mark: u32) -> Self {
        self.put(offsets::SKB_MARK, &mark.to_ne_bytes())
    }

    pub fn len(self, len: u32) -> Self {
        self.put(offsets::SKB_LEN, &len.to_ne_bytes())
    }

    pub fn nfct(self, nfct: u64) -> Self {
        self.put(offsets::SKB_NFCT, &nfct.to_ne_bytes())
    }

    pub fn skb_iif(self, ifindex: i32) -> Self {
        self.put(offsets::SKB_HEADERS, &ifindex.to_ne_bytes())
    }

    /// Set the 3 bits `pkt_type` bitfield, leaving the surrounding bits as
    /// they are.
    pub fn pkt_type(mut self, pkt_type: u8) -> Self {
        let byte = offsets::SKB_PKT_TYPE_BIT / 8;
        let shift = offsets::SKB_PKT_TYPE_BIT % 8;
        self.bytes[byte] = (self.bytes[byte] & !(0b111 << shift)) | ((pkt_type & 0b111) << shift);
        self
    }

    pub fn cloned(mut self, cloned: bool) -> Self {
        let byte = offsets::SKB_CLONED_BIT / 8;
        let shift = offsets::SKB_CLONED_BIT % 8;
        self.bytes[byte] = (self.bytes[byte] & !(1 << shift)) | ((cloned as u8) << shift);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }

    /// Map the skb at `addr`.
    pub fn write(self, memory: &SimulatedMemory, addr: u64) {
        memory.map(addr, self.bytes);
    }
}

/// Map a `struct net_device` called `name` at `addr`.
pub fn write_net_device(memory: &SimulatedMemory, addr: u64, name: &str, ifindex: i32, mtu: u32) {
    let mut bytes = vec![0; offsets::NETDEV_SIZE];
    let name = name.as_bytes();
    let len = name.len().min(15);
    bytes[offsets::NETDEV_NAME..offsets::NETDEV_NAME + len].copy_from_slice(&name[..len]);
    bytes[offsets::NETDEV_IFINDEX..offsets::NETDEV_IFINDEX + 4]
        .copy_from_slice(&ifindex.to_ne_bytes());
    bytes[offsets::NETDEV_MTU..offsets::NETDEV_MTU + 4].copy_from_slice(&mtu.to_ne_bytes());
    memory.map(addr, bytes);
}

/// Map a `struct nf_conn` with the given `mark` at `addr`.
pub fn write_nf_conn(memory: &SimulatedMemory, addr: u64, mark: u32) {
    let mut bytes = vec![0; offsets::NF_CONN_SIZE];
    bytes[offsets::NF_CONN_MARK..offsets::NF_CONN_MARK + 4].copy_from_slice(&mark.to_ne_bytes());
    memory.map(addr, bytes);
}
