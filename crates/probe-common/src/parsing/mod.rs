//! User-space side of the event format: splitting raw events into sections
//! and decoding the payloads of the known collectors.

mod section;

pub use section::{
    CommonEvent, KernelEvent, RawEvent, Section, SectionError, SectionPayload, Sections,
    SkbTrackingEvent,
};
