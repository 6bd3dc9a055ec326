/*!
The standalone queue: all state in one process, no manager, no sockets.
Blocking semantics come from a mutex and two condvars instead of the
doorbell - `bell` wakes consumers when items arrive, `quiet` wakes await
callers when the backlog shrinks.
*/

use crate::core::QueueCore;
use crate::error::{QueueError, Result};
use crate::{Item, QueueOptions, SharedQueue};
use log::warn;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A queue constructed inside a worker with no manager. Operations are all
/// local; the handle is `Sync`, so threads of one process may share it.
pub struct StandaloneQueue {
    inner: Mutex<QueueCore>,
    bell: Condvar,
    quiet: Condvar,
    fast: bool,
    await_enabled: bool,
}

impl StandaloneQueue {
    pub fn new(opts: QueueOptions) -> StandaloneQueue {
        if opts.gather.is_some() {
            warn!("queue: gather is only honoured on manager-hosted queues");
        }
        StandaloneQueue {
            inner: Mutex::new(QueueCore::with_initial(opts.order, opts.porder, opts.initial)),
            bell: Condvar::new(),
            quiet: Condvar::new(),
            fast: opts.fast,
            await_enabled: opts.await_enabled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueCore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, mut q: MutexGuard<'_, QueueCore>, count: usize) -> Vec<Option<Item>> {
        let out = q.dequeue(count);
        drop(q);
        self.quiet.notify_all();
        out
    }
}

impl SharedQueue for StandaloneQueue {
    fn enqueue(&self, items: Vec<Item>) -> Result<()> {
        let mut q = self.lock();
        if q.ended() {
            warn!("queue: enqueue: queue has been ended");
            return Ok(());
        }
        q.enqueue(items);
        drop(q);
        self.bell.notify_all();
        Ok(())
    }

    fn enqueue_p(&self, level: i64, items: Vec<Item>) -> Result<()> {
        let mut q = self.lock();
        if q.ended() {
            warn!("queue: enqueuep: queue has been ended");
            return Ok(());
        }
        q.enqueue_priority(level, items);
        drop(q);
        self.bell.notify_all();
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<Item>> {
        Ok(self.dequeue_many(1)?.swap_remove(0))
    }

    fn dequeue_many(&self, count: usize) -> Result<Vec<Option<Item>>> {
        if count < 1 {
            return Err(QueueError::BadCount { op: "dequeue" });
        }
        let mut q = self.lock();
        while q.is_empty() && !q.ended() {
            q = self.bell.wait(q).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(self.take(q, count))
    }

    fn dequeue_nb(&self) -> Result<Option<Item>> {
        Ok(self.dequeue_nb_many(1)?.swap_remove(0))
    }

    fn dequeue_nb_many(&self, count: usize) -> Result<Vec<Option<Item>>> {
        if count < 1 {
            return Err(QueueError::BadCount { op: "dequeue_nb" });
        }
        if self.fast {
            warn!("queue: dequeue_nb: not allowed on fast queues");
            return Ok(vec![None; count]);
        }
        let q = self.lock();
        Ok(self.take(q, count))
    }

    fn dequeue_timed(&self, timeout: Duration) -> Result<Option<Item>> {
        let deadline = Instant::now() + timeout;
        let mut q = self.lock();
        loop {
            if !q.is_empty() || q.ended() {
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            q = self
                .bell
                .wait_timeout(q, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(self.take(q, 1).swap_remove(0))
    }

    fn insert(&self, index: i64, items: Vec<Item>) -> Result<()> {
        let mut q = self.lock();
        if q.ended() {
            warn!("queue: insert: queue has been ended");
            return Ok(());
        }
        q.insert(index, items);
        drop(q);
        self.bell.notify_all();
        Ok(())
    }

    fn insert_p(&self, level: i64, index: i64, items: Vec<Item>) -> Result<()> {
        let mut q = self.lock();
        if q.ended() {
            warn!("queue: insertp: queue has been ended");
            return Ok(());
        }
        q.insert_priority(level, index, items);
        drop(q);
        self.bell.notify_all();
        Ok(())
    }

    fn peek(&self, index: i64) -> Result<Option<Item>> {
        Ok(self.lock().peek(index).cloned())
    }

    fn peek_p(&self, level: i64, index: i64) -> Result<Option<Item>> {
        Ok(self.lock().peek_priority(level, index).cloned())
    }

    fn peek_h(&self, index: i64) -> Result<Option<i64>> {
        Ok(self.lock().peek_heap(index))
    }

    fn heap(&self) -> Result<Vec<i64>> {
        Ok(self.lock().heap_snapshot())
    }

    fn pending(&self) -> Result<Option<usize>> {
        let q = self.lock();
        if q.ended() && q.is_empty() {
            Ok(None)
        } else {
            Ok(Some(q.pending()))
        }
    }

    fn clear(&self) -> Result<()> {
        if self.fast {
            warn!("queue: clear: not allowed on fast queues");
            return Ok(());
        }
        self.lock().clear();
        self.quiet.notify_all();
        Ok(())
    }

    fn end(&self) -> Result<()> {
        let mut q = self.lock();
        q.set_ended();
        drop(q);
        // Blocked consumers re-check and observe the end.
        self.bell.notify_all();
        self.quiet.notify_all();
        Ok(())
    }

    fn await_pending(&self, threshold: usize) -> Result<()> {
        if !self.await_enabled {
            return Err(QueueError::AwaitDisabled);
        }
        let mut q = self.lock();
        while q.pending() > threshold {
            q = self.quiet.wait(q).unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }
}
