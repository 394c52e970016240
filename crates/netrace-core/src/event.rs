//! Per event buffer shared by all the hooks of a probe.
//!
//! Hooks append sections to an [`EventBuffer`]; each one is prefixed with a
//! `{ collector_tag: u32, size: u32 }` header. Space is reserved with a single
//! atomic update of the buffer length, so concurrent writers get disjoint
//! regions and a reservation which doesn't fit leaves the buffer untouched.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bytes::Bytes;
use probe_common::{
    parsing::{RawEvent, SectionError, SectionPayload},
    schema::{CollectorId, SECTION_HEADER_SIZE},
};
use thiserror::Error;

/// Largest payload [`EventBuffer::write_section`] can encode.
pub const PAYLOAD_SCRATCH_SIZE: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("no space left for {collector} section of {size} bytes")]
    NoSpace { collector: CollectorId, size: usize },
    #[error("{collector} payload of {size} bytes is too large")]
    TooLarge { collector: CollectorId, size: usize },
    #[error(transparent)]
    Encoding(#[from] SectionError),
}

pub struct EventBuffer {
    data: Box<[AtomicU8]>,
    len: AtomicUsize,
}

impl EventBuffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes reserved so far, headers included.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Reserve a section of `size` bytes owned by `collector` and write its
    /// header. Returns `None` if the section and its header don't fit.
    pub fn append_section(
        &self,
        collector: CollectorId,
        size: usize,
    ) -> Option<WritableRegion<'_>> {
        let header_size = u32::try_from(size).ok()?;
        let total = SECTION_HEADER_SIZE.checked_add(size)?;
        let capacity = self.capacity();
        let start = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                len.checked_add(total).filter(|end| *end <= capacity)
            })
            .ok()?;

        let header = &self.data[start..start + SECTION_HEADER_SIZE];
        store(header, &collector.as_tag().to_ne_bytes());
        store(&header[4..], &header_size.to_ne_bytes());

        Some(WritableRegion {
            bytes: &self.data[start + SECTION_HEADER_SIZE..start + total],
        })
    }

    /// Append a section holding `payload`.
    pub fn write_section<P: SectionPayload>(&self, payload: &P) -> Result<(), WriteError> {
        let mut scratch = [0; PAYLOAD_SCRATCH_SIZE];
        let encoded = scratch.get_mut(..P::SIZE).ok_or(WriteError::TooLarge {
            collector: P::COLLECTOR,
            size: P::SIZE,
        })?;
        payload.encode(encoded)?;

        let region = self
            .append_section(P::COLLECTOR, P::SIZE)
            .ok_or(WriteError::NoSpace {
                collector: P::COLLECTOR,
                size: P::SIZE,
            })?;
        region.copy_from_slice(encoded);
        Ok(())
    }

    /// Copy of the reserved bytes.
    pub fn to_bytes(&self) -> Bytes {
        self.data[..self.len()]
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn into_event(self) -> RawEvent {
        RawEvent::new(self.to_bytes())
    }
}

fn store(dst: &[AtomicU8], src: &[u8]) {
    for (dst, src) in dst.iter().zip(src) {
        dst.store(*src, Ordering::Relaxed);
    }
}

/// Payload area of a reserved section. It is exclusively owned by the hook
/// which reserved it.
pub struct WritableRegion<'a> {
    bytes: &'a [AtomicU8],
}

impl WritableRegion<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write `data` at `offset`. Bytes falling outside of the region are
    /// ignored.
    pub fn write(&self, offset: usize, data: &[u8]) {
        if let Some(dst) = self.bytes.get(offset..) {
            store(dst, data);
        }
    }

    pub fn copy_from_slice(&self, data: &[u8]) {
        self.write(0, data)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use probe_common::parsing::{CommonEvent, SkbTrackingEvent};
    use proptest::prelude::*;

    use super::*;

    fn tracking() -> SkbTrackingEvent {
        SkbTrackingEvent {
            orig_head: 0xffff_8880_1234_0000,
            timestamp: 1_000,
            skb: 0xffff_8880_5678_0000,
        }
    }

    #[test]
    fn sections_follow_each_other() {
        let buffer = EventBuffer::new(128);
        let common = CommonEvent {
            timestamp: 5,
            smp_id: 1,
            pid: 42,
        };
        buffer.write_section(&common).unwrap();
        buffer.write_section(&tracking()).unwrap();
        assert_eq!(buffer.len(), 2 * SECTION_HEADER_SIZE + 16 + 24);

        let event = buffer.into_event();
        let sections: Vec<_> = event.sections().collect::<Result<_, _>>().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].collector(), Some(CollectorId::Common));
        assert_eq!(event.find::<CommonEvent>(), Ok(Some(common)));
        assert_eq!(event.find::<SkbTrackingEvent>(), Ok(Some(tracking())));
    }

    #[test]
    fn exact_fit() {
        let buffer = EventBuffer::new(SECTION_HEADER_SIZE + 24);
        assert!(buffer.append_section(CollectorId::SkbTracking, 24).is_some());
        assert_eq!(buffer.remaining(), 0);
        assert!(buffer.append_section(CollectorId::SkbTracking, 0).is_none());
    }

    #[test]
    fn overflow_leaves_buffer_untouched() {
        let buffer = EventBuffer::new(SECTION_HEADER_SIZE + 16 + 10);
        buffer
            .write_section(&CommonEvent {
                timestamp: 1,
                smp_id: 0,
                pid: 0,
            })
            .unwrap();
        let before = buffer.to_bytes();
        assert_eq!(buffer.remaining(), 10);

        assert_eq!(
            buffer.write_section(&tracking()),
            Err(WriteError::NoSpace {
                collector: CollectorId::SkbTracking,
                size: 24
            })
        );
        assert_eq!(buffer.to_bytes(), before);
        assert_eq!(buffer.remaining(), 10);
    }

    #[test]
    fn region_writes_are_bounded() {
        let buffer = EventBuffer::new(64);
        let region = buffer.append_section(CollectorId::Kernel, 4).unwrap();
        region.write(2, &[1, 2, 3, 4]);
        region.write(9, &[5]);
        assert_eq!(&buffer.to_bytes()[SECTION_HEADER_SIZE..], &[0, 0, 1, 2]);
    }

    #[test]
    fn concurrent_writers_get_disjoint_regions() {
        let capacity = 4096;
        let buffer = Arc::new(EventBuffer::new(capacity));
        let threads: Vec<_> = (0..num_cpus::get().clamp(2, 8))
            .map(|cpu| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..64u64 {
                        let _ = buffer.write_section(&SkbTrackingEvent {
                            orig_head: cpu as u64,
                            timestamp: i,
                            skb: cpu as u64,
                        });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(buffer.len() <= capacity);
        let event = RawEvent::new(buffer.to_bytes());
        for section in event.sections() {
            let section = section.unwrap();
            let tracking = SkbTrackingEvent::decode(&section.data).unwrap();
            assert_eq!(tracking.orig_head, tracking.skb);
        }
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(
            capacity in 0usize..256,
            sizes in proptest::collection::vec(0usize..64, 0..32),
        ) {
            let buffer = EventBuffer::new(capacity);
            for size in sizes {
                let before = buffer.to_bytes();
                let fits = buffer.remaining() >= size + SECTION_HEADER_SIZE;
                let appended = buffer.append_section(CollectorId::Kernel, size).is_some();
                prop_assert_eq!(fits, appended);
                if !appended {
                    prop_assert_eq!(buffer.to_bytes(), before);
                }
                prop_assert!(buffer.len() <= capacity);
            }
        }
    }
}
