use hybrid_queue::{
    Item, LaneOrder, PriorityOrder, QueueError, QueueOptions, SharedQueue, StandaloneQueue,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn b(s: &str) -> Item {
    Item::bytes(s)
}

fn sleep_ms(x: u64) {
    thread::sleep(Duration::from_millis(x));
}

#[test]
fn fifo_normal_lane() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    for (want, left) in [("1", 3), ("2", 2), ("3", 1), ("4", 0)] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
        assert_eq!(q.pending().unwrap(), Some(left));
    }
}

#[test]
fn lifo_normal_lane_with_nb() {
    let q = StandaloneQueue::new(QueueOptions {
        order: LaneOrder::Lifo,
        ..QueueOptions::default()
    });
    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    assert_eq!(q.dequeue_many(2).unwrap(), vec![Some(b("4")), Some(b("3"))]);
    assert_eq!(q.dequeue().unwrap(), Some(b("2")));
    assert_eq!(q.dequeue_nb().unwrap(), Some(b("1")));
    assert_eq!(q.dequeue_nb().unwrap(), None);
}

#[test]
fn priority_highest() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue_p(5, vec![b("a")]).unwrap();
    q.enqueue_p(6, vec![b("b")]).unwrap();
    q.enqueue_p(4, vec![b("c")]).unwrap();
    q.enqueue(vec![b("z")]).unwrap();
    assert_eq!(q.heap().unwrap(), vec![6, 5, 4]);
    assert_eq!(q.peek_h(0).unwrap(), Some(6));
    assert_eq!(q.peek_h(-1).unwrap(), Some(4));
    assert_eq!(q.peek_h(5).unwrap(), None);
    for want in ["b", "a", "c", "z"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }
}

#[test]
fn priority_lowest_lifo_within_levels() {
    let q = StandaloneQueue::new(QueueOptions {
        order: LaneOrder::Lifo,
        porder: PriorityOrder::Lowest,
        ..QueueOptions::default()
    });
    q.enqueue_p(2, vec![b("x"), b("y")]).unwrap();
    q.enqueue_p(1, vec![b("p")]).unwrap();
    for want in ["p", "y", "x"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }
}

#[test]
fn insert_symmetry() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    q.insert(1, vec![b("foo"), b("bar")]).unwrap();
    for want in ["1", "foo", "bar", "2", "3", "4"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }

    let q = StandaloneQueue::new(QueueOptions {
        order: LaneOrder::Lifo,
        ..QueueOptions::default()
    });
    q.enqueue(vec![b("1"), b("2"), b("3"), b("4")]).unwrap();
    q.insert(1, vec![b("foo"), b("bar")]).unwrap();
    for want in ["4", "bar", "foo", "3", "2", "1"] {
        assert_eq!(q.dequeue().unwrap(), Some(b(want)));
    }
}

#[test]
fn insert_priority_and_peek_views() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue_p(3, vec![b("a"), b("b")]).unwrap();
    q.insert_p(3, 1, vec![b("mid")]).unwrap();
    assert_eq!(q.peek_p(3, 0).unwrap(), Some(b("a")));
    assert_eq!(q.peek_p(3, 1).unwrap(), Some(b("mid")));
    assert_eq!(q.peek_p(3, -1).unwrap(), Some(b("b")));
    assert_eq!(q.peek_p(9, 0).unwrap(), None);
    assert_eq!(q.peek(0).unwrap(), None);
}

#[test]
fn dequeue_overshoot_pads_with_absent() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue(vec![b("a")]).unwrap();
    assert_eq!(
        q.dequeue_nb_many(3).unwrap(),
        vec![Some(b("a")), None, None]
    );
}

#[test]
fn blocking_dequeue_crosses_threads() {
    let q = Arc::new(StandaloneQueue::new(QueueOptions::default()));
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.dequeue().unwrap())
    };
    sleep_ms(50);
    q.enqueue(vec![b("late")]).unwrap();
    assert_eq!(consumer.join().unwrap(), Some(b("late")));
}

#[test]
fn dequeue_timed_expires_then_succeeds() {
    let q = StandaloneQueue::new(QueueOptions::default());
    let started = Instant::now();
    assert_eq!(q.dequeue_timed(Duration::from_millis(50)).unwrap(), None);
    assert!(started.elapsed() >= Duration::from_millis(45));

    q.enqueue(vec![b("a")]).unwrap();
    assert_eq!(
        q.dequeue_timed(Duration::from_millis(50)).unwrap(),
        Some(b("a"))
    );
}

#[test]
fn await_blocks_until_backlog_shrinks() {
    let q = Arc::new(StandaloneQueue::new(QueueOptions {
        await_enabled: true,
        ..QueueOptions::default()
    }));
    q.enqueue((0..20).map(|i| b(&i.to_string())).collect())
        .unwrap();

    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            let mut got = 0;
            while q.dequeue_nb().unwrap().is_some() {
                got += 1;
                sleep_ms(1);
            }
            got
        })
    };

    q.await_pending(5).unwrap();
    assert!(q.pending().unwrap().unwrap() <= 5);
    assert_eq!(consumer.join().unwrap(), 20);
}

#[test]
fn await_requires_the_option() {
    let q = StandaloneQueue::new(QueueOptions::default());
    assert!(matches!(
        q.await_pending(0),
        Err(QueueError::AwaitDisabled)
    ));
}

#[test]
fn end_wakes_blocked_consumers() {
    let q = Arc::new(StandaloneQueue::new(QueueOptions::default()));
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue().unwrap())
        })
        .collect();
    sleep_ms(50);
    q.end().unwrap();
    for th in consumers {
        assert_eq!(th.join().unwrap(), None);
    }

    // Ended queues refuse new items and report a drained pending count.
    q.enqueue(vec![b("late")]).unwrap();
    assert_eq!(q.dequeue_nb().unwrap(), None);
    assert_eq!(q.pending().unwrap(), None);
}

#[test]
fn clear_resets_everything() {
    let q = StandaloneQueue::new(QueueOptions::default());
    q.enqueue(vec![b("a")]).unwrap();
    q.enqueue_p(2, vec![b("b")]).unwrap();
    q.clear().unwrap();
    assert_eq!(q.pending().unwrap(), Some(0));
    assert!(q.heap().unwrap().is_empty());
    assert_eq!(q.dequeue_nb().unwrap(), None);
}

#[test]
fn fast_mode_disallows_clear_and_nb() {
    let q = StandaloneQueue::new(QueueOptions {
        fast: true,
        ..QueueOptions::default()
    });
    q.enqueue(vec![b("a")]).unwrap();
    // Both are warn-and-no-op, not errors.
    q.clear().unwrap();
    assert_eq!(q.dequeue_nb().unwrap(), None);
    assert_eq!(q.pending().unwrap(), Some(1));
}

#[test]
fn count_must_be_positive() {
    let q = StandaloneQueue::new(QueueOptions::default());
    assert!(matches!(
        q.dequeue_many(0),
        Err(QueueError::BadCount { .. })
    ));
    assert!(matches!(
        q.dequeue_nb_many(0),
        Err(QueueError::BadCount { .. })
    ));
}
