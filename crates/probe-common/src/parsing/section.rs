//! A raw event is a sequence of sections, each one being a header
//! `{ collector_tag: u32, size: u32 }` followed by `size` bytes of payload.
//! Everything is in native endianness.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::schema::{CollectorId, ProbeKind, SECTION_HEADER_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SectionError {
    #[error("section header at {offset} is out of event buffer (len {len})")]
    HeaderOutsideBuffer { offset: usize, len: usize },
    #[error("section payload [{start}-{end}] is out of event buffer (len {len})")]
    PayloadOutsideBuffer { start: usize, end: usize, len: usize },
    #[error("{collector} section has size {got}, expected {expected}")]
    UnexpectedSize {
        collector: CollectorId,
        expected: usize,
        got: usize,
    },
    #[error("unknown probe type {0}")]
    UnknownProbeKind(u8),
}

/// A completed event as shipped by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent(Bytes);

impl RawEvent {
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the sections of the event.
    pub fn sections(&self) -> Sections {
        Sections {
            data: self.0.clone(),
            offset: 0,
            failed: false,
        }
    }

    /// First section written by `collector`, decoded.
    pub fn find<P: SectionPayload>(&self) -> Result<Option<P>, SectionError> {
        for section in self.sections() {
            let section = section?;
            if section.collector() == Some(P::COLLECTOR) {
                return P::decode(&section.data).map(Some);
            }
        }
        Ok(None)
    }
}

/// One section of a [`RawEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub collector_tag: u32,
    pub data: Bytes,
}

impl Section {
    pub fn collector(&self) -> Option<CollectorId> {
        CollectorId::from_tag(self.collector_tag)
    }
}

/// Iterator over the sections of a [`RawEvent`]. Stops after the first
/// error.
pub struct Sections {
    data: Bytes,
    offset: usize,
    failed: bool,
}

impl Iterator for Sections {
    type Item = Result<Section, SectionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.data.len();
        if self.failed || self.offset == len {
            return None;
        }

        let start = self.offset + SECTION_HEADER_SIZE;
        if start > len {
            self.failed = true;
            return Some(Err(SectionError::HeaderOutsideBuffer {
                offset: self.offset,
                len,
            }));
        }
        let mut header = &self.data[self.offset..start];
        let collector_tag = header.get_u32_ne();
        let size = header.get_u32_ne() as usize;

        let end = start + size;
        if end > len {
            self.failed = true;
            return Some(Err(SectionError::PayloadOutsideBuffer { start, end, len }));
        }

        self.offset = end;
        Some(Ok(Section {
            collector_tag,
            data: self.data.slice(start..end),
        }))
    }
}

/// Fixed size payload of a known collector.
pub trait SectionPayload: Sized {
    const COLLECTOR: CollectorId;
    const SIZE: usize;

    /// Write the payload at the start of `out`.
    fn encode(&self, out: &mut [u8]) -> Result<(), SectionError>;

    fn decode(data: &[u8]) -> Result<Self, SectionError>;

    fn check_size(len: usize) -> Result<(), SectionError> {
        if len < Self::SIZE {
            return Err(SectionError::UnexpectedSize {
                collector: Self::COLLECTOR,
                expected: Self::SIZE,
                got: len,
            });
        }
        Ok(())
    }
}

/// Section written for every event by the probe itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonEvent {
    pub timestamp: u64,
    pub smp_id: u32,
    /// Zero when the probe fired outside of a process context.
    pub pid: u32,
}

impl SectionPayload for CommonEvent {
    const COLLECTOR: CollectorId = CollectorId::Common;
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) -> Result<(), SectionError> {
        Self::check_size(out.len())?;
        let mut out = out;
        out.put_u64_ne(self.timestamp);
        out.put_u32_ne(self.smp_id);
        out.put_u32_ne(self.pid);
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Self, SectionError> {
        Self::check_size(data.len())?;
        let mut data = data;
        Ok(Self {
            timestamp: data.get_u64_ne(),
            smp_id: data.get_u32_ne(),
            pid: data.get_u32_ne(),
        })
    }
}

/// Section describing the probe which generated the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEvent {
    pub symbol: u64,
    pub probe_type: ProbeKind,
}

impl SectionPayload for KernelEvent {
    const COLLECTOR: CollectorId = CollectorId::Kernel;
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) -> Result<(), SectionError> {
        Self::check_size(out.len())?;
        let mut out = out;
        out.put_u64_ne(self.symbol);
        out.put_u8(self.probe_type as u8);
        out.put_bytes(0, 7);
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Self, SectionError> {
        Self::check_size(data.len())?;
        let mut data = data;
        let symbol = data.get_u64_ne();
        let probe_type = match data.get_u8() {
            0 => ProbeKind::Kprobe,
            1 => ProbeKind::Kretprobe,
            2 => ProbeKind::RawTracepoint,
            other => return Err(SectionError::UnknownProbeKind(other)),
        };
        Ok(Self { symbol, probe_type })
    }
}

/// Section written by the skb tracking hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkbTrackingEvent {
    /// Head of the buffer when the lineage was first seen. Stable across
    /// clones and reallocations.
    pub orig_head: u64,
    /// First time the lineage was seen.
    pub timestamp: u64,
    /// Address of the `struct sk_buff`, only meaningful for debugging.
    pub skb: u64,
}

impl SkbTrackingEvent {
    /// Identifier of the packet lineage.
    pub fn tracking_id(&self) -> (u64, u64) {
        (self.orig_head, self.timestamp)
    }
}

impl SectionPayload for SkbTrackingEvent {
    const COLLECTOR: CollectorId = CollectorId::SkbTracking;
    const SIZE: usize = 24;

    fn encode(&self, out: &mut [u8]) -> Result<(), SectionError> {
        Self::check_size(out.len())?;
        let mut out = out;
        out.put_u64_ne(self.orig_head);
        out.put_u64_ne(self.timestamp);
        out.put_u64_ne(self.skb);
        Ok(())
    }

    fn decode(data: &[u8]) -> Result<Self, SectionError> {
        Self::check_size(data.len())?;
        let mut data = data;
        Ok(Self {
            orig_head: data.get_u64_ne(),
            timestamp: data.get_u64_ne(),
            skb: data.get_u64_ne(),
        })
    }
}
