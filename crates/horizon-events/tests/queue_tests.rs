//! Posting, cancellation and draining through the public API.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{IdSlot, TestRuntime, counter, recorder};
use horizon_events::{Event, EventKind, RuntimeBuilder, TimerId};
use parking_lot::Mutex;

#[test]
fn test_posted_events_arrive_in_order() {
    let t = TestRuntime::new();
    let (id, seen) = recorder(&t.rt);

    t.rt.post_event(id, Event::user(1));
    t.rt.post_event(id, Event::user(2));
    assert_eq!(t.rt.send_posted_events(None, None), 2);

    assert_eq!(*seen.lock(), vec![EventKind::User(1), EventKind::User(2)]);
    assert!(!t.rt.has_pending_events());
}

#[test]
fn test_cancelled_events_are_never_delivered() {
    let t = TestRuntime::new();
    let (id, hits) = counter(&t.rt);
    let (other, other_hits) = counter(&t.rt);

    for _ in 0..3 {
        t.rt.post_event(id, Event::user(1));
    }
    t.rt.post_event(other, Event::user(1));
    t.rt.remove_posted_events(Some(id), None);

    assert_eq!(t.rt.send_posted_events(None, None), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(other_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_single_event_by_id() {
    let t = TestRuntime::new();
    let (id, seen) = recorder(&t.rt);

    t.rt.post_event(id, Event::user(1));
    let doomed = t.rt.post_event(id, Event::user(2)).unwrap();
    t.rt.post_event(id, Event::user(3));

    assert!(t.rt.remove_posted_event(doomed));
    assert!(!t.rt.remove_posted_event(doomed));
    t.rt.send_posted_events(None, None);
    assert_eq!(*seen.lock(), vec![EventKind::User(1), EventKind::User(3)]);
}

#[test]
fn test_redundant_quit_is_compressed() {
    let t = TestRuntime::new();
    let (id, seen) = recorder(&t.rt);

    assert!(t.rt.post_event(id, Event::quit()).is_some());
    assert!(t.rt.post_event(id, Event::quit()).is_none());
    assert!(t.rt.post_event(id, Event::user(1)).is_some());
    t.rt.send_posted_events(None, None);

    assert_eq!(*seen.lock(), vec![EventKind::Quit, EventKind::User(1)]);
}

#[test]
fn test_timer_coalescing_follows_config() {
    let t = TestRuntime::with_builder(RuntimeBuilder::new().coalesce_timers(true));
    let (id, seen) = recorder(&t.rt);

    t.rt.post_event(id, Event::timer(TimerId(4)));
    t.rt.post_event(id, Event::timer(TimerId(4)));
    t.rt.post_event(id, Event::timer(TimerId(5)));
    t.rt.send_posted_events(None, None);

    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_posting_to_destroyed_object_is_dropped() {
    let t = TestRuntime::new();
    let (id, hits) = counter(&t.rt);
    t.rt.destroy_object(id).unwrap();

    assert!(t.rt.post_event(id, Event::user(1)).is_none());
    assert_eq!(t.rt.send_posted_events(None, None), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_self_reposting_receiver_does_not_starve_others() {
    let t = TestRuntime::new();
    let reposts = Arc::new(AtomicUsize::new(0));

    let slot = IdSlot::default();
    let me = slot.clone();
    let count = reposts.clone();
    let busy = t.rt.register_fn(move |rt, _| {
        count.fetch_add(1, Ordering::SeqCst);
        rt.post_event(me.get(), Event::user(1));
        true
    });
    slot.set(busy);
    let stopper = t.rt.register_fn(|rt, _| {
        rt.exit(3);
        true
    });

    t.rt.post_event(busy, Event::user(1));
    t.rt.post_event(stopper, Event::user(1));

    assert_eq!(t.rt.exec().unwrap(), 3);
    // The repost landed behind the stopper and waits for a pass that never comes.
    assert_eq!(reposts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_producers_keep_per_producer_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    let t = TestRuntime::new();
    let received: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let log = received.clone();
    let sink = t.rt.register_fn(move |rt, event| {
        if let Some(&pair) = event.payload::<(usize, usize)>() {
            let mut log = log.lock();
            log.push(pair);
            if log.len() == PRODUCERS * PER_PRODUCER {
                rt.exit(0);
            }
        }
        true
    });

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let rt = t.rt.clone();
            std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    rt.post_event(sink, Event::with_payload(EventKind::user(7), (producer, seq)));
                }
            })
        })
        .collect();

    assert_eq!(t.rt.exec().unwrap(), 0);
    for handle in producers {
        handle.join().unwrap();
    }

    let received = received.lock();
    assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);
    for producer in 0..PRODUCERS {
        let seqs: Vec<usize> = received
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}
