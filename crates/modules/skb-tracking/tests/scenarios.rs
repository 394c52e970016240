use std::{
    sync::{Arc, Barrier},
    thread,
};

use netrace_core::{
    event::EventBuffer,
    filter::FilterSet,
    hook::{HookOutcome, SkipReason},
    probe::ProbeBuilder,
};
use probe_common::{
    ProbeContext, ProbeInfo,
    parsing::{CommonEvent, RawEvent, SectionPayload, SkbTrackingEvent},
    schema::{CollectorId, ProbeKind, SECTION_HEADER_SIZE},
    test_utils::{SKB_BTF, SimulatedMemory, SkbBuilder},
    time::Timestamp,
};
use skb_tracking::{Config, Tracker, tracking_hook};
use tokio::sync::mpsc;

const IP_RCV: u64 = 0xffff_ffff_8180_0000;
const NF_HOOK_SLOW: u64 = 0xffff_ffff_8181_0000;
const PSKB_EXPAND_HEAD: u64 = 0xffff_ffff_8182_0000;
const SP: u64 = 0xffff_c900_0040_3e00;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tracker() -> Arc<Tracker> {
    let config = Config {
        probes: vec![format!("{PSKB_EXPAND_HEAD:#x}:inv_head").parse().unwrap()],
        ..Default::default()
    };
    Arc::new(config.build(&SKB_BTF).unwrap())
}

fn ctx(memory: &SimulatedMemory, symbol: u64, ts: u64) -> ProbeContext<'_> {
    ProbeContext::new(
        ProbeInfo {
            symbol,
            kind: ProbeKind::Kprobe,
        },
        Timestamp::from(ts),
    )
    .with_memory(memory)
    .with_stack_pointer(SP)
}

fn tracking_section(buffer: EventBuffer) -> Option<SkbTrackingEvent> {
    RawEvent::new(buffer.to_bytes()).find().unwrap()
}

/// Direct buffer reference, nothing tracked yet.
#[test]
fn new_lineage_from_direct_reference() {
    init_logger();
    let memory = SimulatedMemory::new();
    SkbBuilder::new().head(0xffff_8880_0100_0000).write(&memory, 0xffff_8880_0200_0000);
    let tracker = tracker();
    let hook = tracking_hook(tracker.clone(), FilterSet::accept_all());

    let buffer = EventBuffer::new(256);
    let outcome = hook.run(
        &ctx(&memory, IP_RCV, 1000).with_skb(0, 0xffff_8880_0200_0000),
        &buffer,
    );
    assert_eq!(outcome, HookOutcome::SectionWritten);

    let event = RawEvent::new(buffer.to_bytes());
    let sections: Vec<_> = event.sections().collect::<Result<_, _>>().unwrap();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].collector(), Some(CollectorId::SkbTracking));
    assert_eq!(
        SkbTrackingEvent::decode(&sections[0].data),
        Ok(SkbTrackingEvent {
            orig_head: 0xffff_8880_0100_0000,
            timestamp: 1000,
            skb: 0xffff_8880_0200_0000,
        })
    );
    let stored = tracker.store().lookup(0xffff_8880_0100_0000).unwrap();
    assert_eq!((stored.orig_head, stored.timestamp), (0xffff_8880_0100_0000, 1000));
}

/// No direct reference, the stack resolves to a tracked buffer.
#[test]
fn existing_lineage_from_stack() {
    init_logger();
    let memory = SimulatedMemory::new();
    SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
    let tracker = tracker();
    let hook = tracking_hook(tracker.clone(), FilterSet::accept_all());

    hook.run(
        &ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000),
        &EventBuffer::new(256),
    );

    let buffer = EventBuffer::new(256);
    let outcome = hook.run(&ctx(&memory, NF_HOOK_SLOW, 20).with_stack_pointer(SP - 0x180), &buffer);
    assert_eq!(outcome, HookOutcome::SectionWritten);
    assert_eq!(
        tracking_section(buffer),
        Some(SkbTrackingEvent {
            orig_head: 0x1000,
            timestamp: 10,
            skb: 0x8000,
        })
    );
    assert_eq!(tracker.store().len(), 1);
}

/// No direct reference and nothing on the stack.
#[test]
fn unresolved_is_benign() {
    init_logger();
    let memory = SimulatedMemory::new();
    let hook = tracking_hook(tracker(), FilterSet::accept_all());
    let buffer = EventBuffer::new(256);
    let outcome = hook.run(&ctx(&memory, NF_HOOK_SLOW, 20), &buffer);
    assert_eq!(outcome, HookOutcome::SectionSkipped(SkipReason::Unresolved));
    assert!(outcome.admitted());
    assert!(buffer.is_empty());
}

/// The buffer only has 10 bytes left.
#[test]
fn no_space_leaves_the_buffer_untouched() {
    init_logger();
    let memory = SimulatedMemory::new();
    SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
    let hook = tracking_hook(tracker(), FilterSet::accept_all());

    let common = CommonEvent {
        timestamp: 1,
        smp_id: 2,
        pid: 3,
    };
    let buffer = EventBuffer::new(SECTION_HEADER_SIZE + CommonEvent::SIZE + 10);
    buffer.write_section(&common).unwrap();
    assert_eq!(buffer.remaining(), 10);
    let before = buffer.to_bytes();

    let outcome = hook.run(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000), &buffer);
    assert_eq!(outcome, HookOutcome::SectionSkipped(SkipReason::NoSpace));
    assert_eq!(buffer.to_bytes(), before);
    assert_eq!(RawEvent::new(before).find::<CommonEvent>(), Ok(Some(common)));
}

#[test]
fn identity_survives_clone_and_reallocation() {
    init_logger();
    let memory = SimulatedMemory::new();
    let tracker = tracker();
    let hook = tracking_hook(tracker.clone(), FilterSet::accept_all());
    let mut seen = Vec::new();
    let mut run = |symbol: u64, ts: u64, skb: u64| {
        let buffer = EventBuffer::new(256);
        hook.run(&ctx(&memory, symbol, ts).with_skb(0, skb), &buffer);
        seen.push(tracking_section(buffer).map(|e| e.tracking_id()));
    };

    SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
    run(IP_RCV, 10, 0x8000);
    // skb_clone
    SkbBuilder::new().head(0x1000).cloned(true).write(&memory, 0x9000);
    run(IP_RCV, 20, 0x9000);
    // pskb_expand_head on the clone
    run(PSKB_EXPAND_HEAD, 30, 0x9000);
    SkbBuilder::new().head(0x3000).write(&memory, 0x9000);
    run(NF_HOOK_SLOW, 40, 0x9000);
    // The original is still around.
    run(NF_HOOK_SLOW, 50, 0x8000);
    // An unrelated buffer gets its own lineage.
    SkbBuilder::new().head(0x7000).write(&memory, 0xa000);
    run(IP_RCV, 60, 0xa000);

    assert_eq!(seen.len(), 6);
    assert!(seen[..5].iter().all(|id| *id == Some((0x1000, 10))), "{seen:?}");
    assert_eq!(seen[5], Some((0x7000, 60)));
}

#[test]
fn concurrent_first_observations_agree() {
    init_logger();
    let memory = Arc::new(SimulatedMemory::new());
    let threads = 8;
    for round in 1..=20u64 {
        let skb = 0x10_0000 * round;
        SkbBuilder::new().head(skb + 0x1000).write(&memory, skb);
        let tracker = tracker();
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads as u64)
            .map(|cpu| {
                let memory = memory.clone();
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let ctx = ctx(&memory, IP_RCV, 100 + cpu)
                        .with_cpu(cpu as u32)
                        .with_stack_pointer(SP + cpu * 0x10_0000)
                        .with_skb(0, skb);
                    barrier.wait();
                    tracker.track(&ctx).map(|t| (t.info.orig_head, t.info.timestamp))
                })
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = ids[0];
        assert!(first.is_some());
        assert!(ids.iter().all(|id| *id == first), "{ids:?}");
        assert_eq!(tracker.store().len(), 1);
    }
}

#[tokio::test]
async fn probe_ships_tracking_events() {
    init_logger();
    let memory = SimulatedMemory::new();
    SkbBuilder::new().head(0x1000).write(&memory, 0x8000);
    let probe = ProbeBuilder::new(ProbeInfo {
        symbol: IP_RCV,
        kind: ProbeKind::Kprobe,
    })
    .hook(Box::new(tracking_hook(tracker(), FilterSet::accept_all())))
    .build()
    .unwrap();
    let (mut tx, mut rx) = mpsc::channel::<RawEvent>(4);

    let dispatch = probe.dispatch(&ctx(&memory, IP_RCV, 10).with_skb(0, 0x8000), &mut tx);
    assert!(dispatch.shipped);
    let event = rx.recv().await.unwrap();
    let collectors: Vec<_> = event
        .sections()
        .map(|section| section.unwrap().collector())
        .collect();
    assert_eq!(
        collectors,
        vec![
            Some(CollectorId::Common),
            Some(CollectorId::Kernel),
            Some(CollectorId::SkbTracking)
        ]
    );
}
