//! The [`EventSender`] trait is used by probes to ship completed events.
//!
//! [`EventSender::send`] must not block since it runs on the probe hot path.

use tokio::sync::mpsc;

use crate::parsing::RawEvent;

pub trait EventSender: Clone + Send + 'static {
    /// Must not block since it can be used in async contexts
    fn send(&mut self, event: RawEvent);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop events.
impl EventSender for mpsc::Sender<RawEvent> {
    fn send(&mut self, event: RawEvent) {
        if self.try_send(event).is_err() {
            log::warn!("dropping event");
        }
    }
}

/// EventSenderWrapper wraps an EventSender with a new one which calls
/// a callback on every event shipped. This is useful for keeping statistics
/// without touching the transport.
#[derive(Clone)]
pub struct EventSenderWrapper<S, F> {
    cb: F,
    inner: S,
}

impl<S, F> EventSenderWrapper<S, F> {
    pub fn new(inner: S, cb: F) -> Self {
        Self { inner, cb }
    }
}

impl<S, F> EventSender for EventSenderWrapper<S, F>
where
    S: EventSender,
    F: FnMut(&RawEvent) + Clone + Send + 'static,
{
    fn send(&mut self, event: RawEvent) {
        (self.cb)(&event);
        self.inner.send(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use bytes::Bytes;

    use super::*;

    #[test]
    fn full_channel_drops() {
        let (mut tx, mut rx) = mpsc::channel(1);
        EventSender::send(&mut tx, RawEvent::new(Bytes::from_static(b"a")));
        EventSender::send(&mut tx, RawEvent::new(Bytes::from_static(b"b")));
        assert_eq!(rx.try_recv().unwrap().as_bytes(), b"a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wrapper_sees_every_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut sender = EventSenderWrapper::new(tx, move |_: &RawEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        sender.send(RawEvent::new(Bytes::from_static(b"x")));
        sender.send(RawEvent::new(Bytes::from_static(b"y")));
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert!(rx.try_recv().is_ok());
    }
}
