use hybrid_queue::{
    ControlChannel, Item, LaneOrder, Manager, QueueOptions, SharedQueue, WorkerProxy,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn b(s: &str) -> Item {
    Item::bytes(s)
}

fn sleep_ms(x: u64) {
    thread::sleep(Duration::from_millis(x));
}

/// Manager thread + one attached proxy. Tests must join their own worker
/// threads, then call `finish` so the dispatcher sees EOF and exits.
fn setup(opts: QueueOptions) -> (thread::JoinHandle<()>, Arc<ControlChannel>, WorkerProxy) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut manager, channel) = Manager::new().unwrap();
    let ticket = manager.create(opts).unwrap();
    let mgr = thread::spawn(move || manager.run().unwrap());
    let channel = Arc::new(channel);
    let q = WorkerProxy::attach(&channel, ticket);
    (mgr, channel, q)
}

fn finish(mgr: thread::JoinHandle<()>, channel: Arc<ControlChannel>, q: WorkerProxy) {
    drop(q);
    drop(channel);
    mgr.join().unwrap();
}

#[test]
fn round_trip_scalar_and_frozen() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    let frozen = Item::frozen(vec![0u8, 1, 2, 254, 255]);
    q.enqueue(vec![b("hello")]).unwrap();
    q.enqueue(vec![frozen.clone()]).unwrap();

    assert_eq!(q.dequeue().unwrap(), Some(b("hello")));
    assert_eq!(q.dequeue().unwrap(), Some(frozen));

    finish(mgr, channel, q);
}

#[test]
fn fifo_pending_observed_over_wire() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    assert_eq!(q.pending().unwrap(), Some(4));
    for (want, left) in [("1", 3), ("2", 2), ("3", 1), ("4", 0)] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
        assert_eq!(q.pending().unwrap(), Some(left));
    }

    finish(mgr, channel, q);
}

#[test]
fn lifo_with_nb_over_wire() {
    let (mgr, channel, q) = setup(QueueOptions {
        order: LaneOrder::Lifo,
        ..QueueOptions::default()
    });

    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    assert_eq!(
        q.dequeue_many(2).unwrap(),
        vec![Some(b("4")), Some(b("3"))]
    );
    assert_eq!(q.dequeue().unwrap(), Some(b("2")));
    assert_eq!(q.dequeue_nb().unwrap(), Some(b("1")));
    assert_eq!(q.dequeue_nb().unwrap(), None);

    finish(mgr, channel, q);
}

#[test]
fn enqueue_wakes_a_blocked_worker() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    let consumer = {
        let q = q.clone();
        thread::spawn(move || q.dequeue().unwrap())
    };
    sleep_ms(50);
    q.enqueue(vec![b("late")]).unwrap();
    assert_eq!(consumer.join().unwrap(), Some(b("late")));

    finish(mgr, channel, q);
}

#[test]
fn multi_item_dequeue_pads_with_absent() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    q.enqueue(vec![b("a"), Item::frozen(vec![9u8])]).unwrap();
    assert_eq!(
        q.dequeue_many(4).unwrap(),
        vec![Some(b("a")), Some(Item::frozen(vec![9u8])), None, None]
    );
    assert_eq!(q.dequeue_nb_many(2).unwrap(), vec![None, None]);

    finish(mgr, channel, q);
}

#[test]
fn priority_heap_and_peeks_over_wire() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    q.enqueue_p(5, vec![b("a")]).unwrap();
    q.enqueue_p(6, vec![b("b")]).unwrap();
    q.enqueue_p(4, vec![b("c")]).unwrap();
    q.enqueue(vec![b("z")]).unwrap();

    assert_eq!(q.heap().unwrap(), vec![6, 5, 4]);
    assert_eq!(q.peek_h(0).unwrap(), Some(6));
    assert_eq!(q.peek_h(-1).unwrap(), Some(4));
    assert_eq!(q.peek_h(7).unwrap(), None);
    assert_eq!(q.peek_p(5, 0).unwrap(), Some(b("a")));
    assert_eq!(q.peek(0).unwrap(), Some(b("z")));
    assert_eq!(q.peek(1).unwrap(), None);

    for want in ["b", "a", "c", "z"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }
    assert!(q.heap().unwrap().is_empty());

    finish(mgr, channel, q);
}

#[test]
fn insert_symmetry_over_wire() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    // Multi-item insert travels as a frozen sequence, single scalars raw.
    q.insert(1, vec![b("foo"), b("bar")]).unwrap();
    q.insert(0, vec![b("head")]).unwrap();
    for want in ["head", "1", "foo", "bar", "2", "3", "4"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }

    q.insert_p(3, 0, vec![b("p0")]).unwrap();
    q.insert_p(3, 1, vec![Item::frozen(vec![1u8]), b("p2")]).unwrap();
    assert_eq!(q.peek_p(3, 1).unwrap(), Some(Item::frozen(vec![1u8])));
    assert_eq!(q.dequeue_many(3).unwrap().len(), 3);

    finish(mgr, channel, q);
}

#[test]
fn initial_items_are_dequeuable_at_once() {
    let (mgr, channel, q) = setup(QueueOptions {
        initial: vec![b("seed")],
        ..QueueOptions::default()
    });

    // The preload pre-wrote the wake-up byte, so this does not block.
    assert_eq!(q.dequeue().unwrap(), Some(b("seed")));

    finish(mgr, channel, q);
}

#[test]
fn clear_drains_the_doorbell_byte() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    q.enqueue(vec![b("a")]).unwrap();
    q.clear().unwrap();
    assert_eq!(q.pending().unwrap(), Some(0));

    // The channel must be empty again: one enqueue, one wake-up.
    q.enqueue(vec![b("b")]).unwrap();
    assert_eq!(q.dequeue().unwrap(), Some(b("b")));

    // If clear had left a stale byte behind, this consumer would eat it and
    // come back absent instead of blocking for "c".
    let consumer = {
        let q = q.clone();
        thread::spawn(move || q.dequeue().unwrap())
    };
    sleep_ms(50);
    q.enqueue(vec![b("c")]).unwrap();
    assert_eq!(consumer.join().unwrap(), Some(b("c")));

    finish(mgr, channel, q);
}

#[test]
fn nb_latch_suppresses_the_wakeup_byte() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    // A non-blocking dequeue on the empty queue latches nb mode.
    assert_eq!(q.dequeue_nb().unwrap(), None);

    // The next enqueue writes no byte, so a timed dequeue starves even
    // though an item is pending...
    q.enqueue(vec![b("a")]).unwrap();
    let started = Instant::now();
    assert_eq!(q.dequeue_timed(Duration::from_millis(100)).unwrap(), None);
    assert!(started.elapsed() >= Duration::from_millis(90));

    // ...while the polling consumer the latch exists for sees it fine.
    assert_eq!(q.dequeue_nb().unwrap(), Some(b("a")));

    finish(mgr, channel, q);
}

#[test]
fn fast_mode_bursts_cover_a_full_drain() {
    let (mgr, channel, q) = setup(QueueOptions {
        fast: true,
        ..QueueOptions::default()
    });

    q.enqueue((0..12).map(|i| b(&i.to_string())).collect())
        .unwrap();
    for i in 0..12 {
        assert_eq!(q.dequeue().unwrap(), Some(b(&i.to_string())));
    }
    // Every pre-signalled byte was consumed: nothing left to starve on.
    assert_eq!(q.dequeue_timed(Duration::from_millis(100)).unwrap(), None);
    assert_eq!(q.pending().unwrap(), Some(0));

    finish(mgr, channel, q);
}

#[test]
fn fast_mode_disallows_clear_and_nb_over_wire() {
    let (mgr, channel, q) = setup(QueueOptions {
        fast: true,
        ..QueueOptions::default()
    });

    q.enqueue(vec![b("a")]).unwrap();
    q.clear().unwrap();
    assert_eq!(q.dequeue_nb().unwrap(), None);
    assert_eq!(q.pending().unwrap(), Some(1));

    assert_eq!(q.dequeue().unwrap(), Some(b("a")));
    finish(mgr, channel, q);
}

#[test]
fn gather_diverts_normal_enqueues() {
    let gathered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&gathered);
    let (mgr, channel, q) = setup(QueueOptions {
        gather: Some(Box::new(move |it| sink.lock().unwrap().push(it))),
        ..QueueOptions::default()
    });

    q.enqueue(vec![b("one")]).unwrap();
    q.enqueue(vec![b("two"), Item::frozen(vec![3u8])]).unwrap();
    // Priority enqueues are not diverted.
    q.enqueue_p(1, vec![b("kept")]).unwrap();

    // pending() both checks the lane state and orders us after the
    // enqueues above.
    assert_eq!(q.pending().unwrap(), Some(1));
    assert_eq!(
        *gathered.lock().unwrap(),
        vec![b("one"), b("two"), Item::frozen(vec![3u8])]
    );

    finish(mgr, channel, q);
}

#[test]
fn end_daisy_chains_through_blocked_consumers() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || q.dequeue().unwrap())
        })
        .collect();
    sleep_ms(50);

    q.end().unwrap();
    for th in consumers {
        assert_eq!(th.join().unwrap(), None);
    }

    // The parked byte makes later blocking dequeues return at once, and an
    // ended drained queue reports no pending count.
    assert_eq!(q.dequeue().unwrap(), None);
    assert_eq!(q.pending().unwrap(), None);

    // Enqueues are dead after end.
    q.enqueue(vec![b("late")]).unwrap();
    assert_eq!(q.dequeue_nb().unwrap(), None);

    finish(mgr, channel, q);
}

#[test]
fn end_on_a_non_empty_queue_still_drains_the_pool() {
    let (mgr, channel, q) = setup(QueueOptions::default());

    // End while items are still pending: end() itself writes no byte, the
    // one in-flight token has to carry the whole pool across the drain.
    q.enqueue(vec![b("a"), b("b")]).unwrap();
    q.end().unwrap();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || q.dequeue().unwrap())
        })
        .collect();
    let results: Vec<_> = consumers
        .into_iter()
        .map(|th| th.join().unwrap())
        .collect();

    // Both items were delivered, and every other consumer observed the end
    // instead of blocking forever.
    let got: HashSet<Vec<u8>> = results
        .iter()
        .flatten()
        .map(|it| it.payload().to_vec())
        .collect();
    assert_eq!(got, HashSet::from([b"a".to_vec(), b"b".to_vec()]));
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), 2);
    assert_eq!(q.pending().unwrap(), None);

    finish(mgr, channel, q);
}

#[test]
fn two_queues_are_independent() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut manager, channel) = Manager::new().unwrap();
    let t1 = manager.create(QueueOptions::default()).unwrap();
    let t2 = manager
        .create(QueueOptions {
            order: LaneOrder::Lifo,
            ..QueueOptions::default()
        })
        .unwrap();
    assert_ne!(t1.id, t2.id);
    let mgr = thread::spawn(move || manager.run().unwrap());
    let channel = Arc::new(channel);
    let q1 = WorkerProxy::attach(&channel, t1);
    let q2 = WorkerProxy::attach(&channel, t2);

    q1.enqueue(vec![b("a"), b("b")]).unwrap();
    q2.enqueue(vec![b("a"), b("b")]).unwrap();
    assert_eq!(q1.dequeue().unwrap(), Some(b("a")));
    assert_eq!(q2.dequeue().unwrap(), Some(b("b")));
    assert_eq!(q1.pending().unwrap(), Some(1));
    assert_eq!(q2.pending().unwrap(), Some(1));

    drop(q2);
    finish(mgr, channel, q1);
}

#[test]
fn await_threshold_under_a_consumer_pool() {
    let (mgr, channel, q) = setup(QueueOptions {
        fast: true,
        await_enabled: true,
        ..QueueOptions::default()
    });

    let total = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let consumers: Vec<_> = (0..8)
        .map(|_| {
            let q = q.clone();
            let total = Arc::clone(&total);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                while let Some(it) = q.dequeue().unwrap() {
                    seen.lock().unwrap().insert(it.payload().to_vec());
                    total.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for batch in 0..10 {
                let items = (0..10)
                    .map(|k| b(&format!("{}-{}", batch, k)))
                    .collect::<Vec<_>>();
                q.enqueue(items).unwrap();
                q.await_pending(10).unwrap();
                let backlog = q.pending().unwrap().unwrap();
                assert!(backlog <= 10, "await returned with {} pending", backlog);
            }
        })
    };
    producer.join().unwrap();

    // Wait for the pool to drain the tail, then end the queue so the
    // blocked consumers unwind.
    let deadline = Instant::now() + Duration::from_secs(10);
    while total.load(Ordering::SeqCst) < 100 {
        assert!(Instant::now() < deadline, "consumers stalled");
        sleep_ms(5);
    }
    q.end().unwrap();
    for th in consumers {
        th.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), 100);
    assert_eq!(seen.lock().unwrap().len(), 100);
    assert_eq!(q.pending().unwrap(), None);

    finish(mgr, channel, q);
}

#[test]
fn remove_forgets_the_queue() {
    let (mut manager, _channel) = Manager::new().unwrap();
    let ticket = manager.create(QueueOptions::default()).unwrap();
    assert!(manager.remove(ticket.id));
    assert!(!manager.remove(ticket.id));
    // Ids are never reused.
    let next = manager.create(QueueOptions::default()).unwrap();
    assert!(next.id > ticket.id);
}
