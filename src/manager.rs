/*!
The manager side: a registry of queues and a single-threaded dispatcher that
consumes framed requests from the shared control socket, mutates the target
queue, and drives its signal and await channels so that *other* workers
blocked on the queue wake up.

One frame is handled at a time; a queue's state is only ever touched from
this thread, so no locks are needed here. State mutation happens only after
the whole frame has been consumed, which keeps the queue consistent if a
frame turns out to be malformed.
*/

use crate::core::QueueCore;
use crate::doorbell::Doorbell;
use crate::error::{QueueError, Result};
use crate::wire::{self, Opcode, SockReader};
use crate::worker::ControlChannel;
use crate::{Gather, Item, QueueOptions, MAX_DQ_DEPTH};
use log::{debug, warn};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::close;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Everything a worker needs to attach to one managed queue: the id, the
/// read ends of its channels, and the flags the client validates against.
#[derive(Debug, Clone, Copy)]
pub struct QueueTicket {
    pub id: u64,
    pub fast: bool,
    pub signal_fd: RawFd,
    pub await_fd: Option<RawFd>,
}

/// Manager-side state of one queue: the lanes plus the wake-up bookkeeping.
struct ManagedQueue {
    core: QueueCore,
    fast: bool,
    /// Latched by a non-blocking dequeue; suppresses the next
    /// empty-to-non-empty wake-up byte so poll-only consumers don't strand
    /// stale bytes in the channel.
    nb_flag: bool,
    /// Fast mode only: dequeues remaining before the next pre-signal burst.
    dsem: usize,
    /// Await waiters currently blocked.
    asem: usize,
    /// Threshold supplied by the most recent waiter.
    tsem: usize,
    signal: Doorbell,
    awaitch: Option<Doorbell>,
    gather: Option<Gather>,
}

impl ManagedQueue {
    fn new(opts: QueueOptions) -> Result<ManagedQueue> {
        let signal = Doorbell::new()?;
        let awaitch = if opts.await_enabled {
            Some(Doorbell::new()?)
        } else {
            None
        };
        let core = QueueCore::with_initial(opts.order, opts.porder, opts.initial);
        if core.pending() > 0 {
            signal.ring(1)?;
        }
        Ok(ManagedQueue {
            core,
            fast: opts.fast,
            nb_flag: false,
            dsem: 0,
            asem: 0,
            tsem: 0,
            signal,
            awaitch,
            gather: opts.gather,
        })
    }

    /// One wake-up byte on the empty-to-non-empty transition, unless a
    /// poll-only consumer latched `nb_flag`, or fast mode still has
    /// pre-signalled bytes outstanding.
    fn wake_on_transition(&self, was_empty: bool) -> Result<()> {
        if !was_empty || self.core.is_empty() {
            return Ok(());
        }
        let suppressed = self.nb_flag || (self.fast && self.dsem > 0);
        if !suppressed {
            self.signal.ring(1)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, items: Vec<Item>) -> Result<()> {
        if self.core.ended() {
            warn!("queue: enqueue: queue has been ended");
            return Ok(());
        }
        if let Some(gather) = self.gather.as_mut() {
            for it in items {
                gather(it);
            }
            return Ok(());
        }
        let was_empty = self.core.is_empty();
        self.core.enqueue(items);
        self.wake_on_transition(was_empty)
    }

    fn enqueue_priority(&mut self, level: i64, items: Vec<Item>) -> Result<()> {
        if self.core.ended() {
            warn!("queue: enqueuep: queue has been ended");
            return Ok(());
        }
        let was_empty = self.core.is_empty();
        self.core.enqueue_priority(level, items);
        self.wake_on_transition(was_empty)
    }

    fn insert(&mut self, index: i64, items: Vec<Item>) -> Result<()> {
        if self.core.ended() {
            warn!("queue: insert: queue has been ended");
            return Ok(());
        }
        let was_empty = self.core.is_empty();
        self.core.insert(index, items);
        self.wake_on_transition(was_empty)
    }

    fn insert_priority(&mut self, level: i64, index: i64, items: Vec<Item>) -> Result<()> {
        if self.core.ended() {
            warn!("queue: insertp: queue has been ended");
            return Ok(());
        }
        let was_empty = self.core.is_empty();
        self.core.insert_priority(level, index, items);
        self.wake_on_transition(was_empty)
    }

    /// Dequeue plus all channel upkeep. `blocking` means the caller consumed
    /// a doorbell byte before sending the request.
    fn dequeue(&mut self, count: usize, blocking: bool) -> Result<Vec<Option<Item>>> {
        if !blocking {
            if self.fast {
                warn!("queue: dequeue_nb: not allowed on fast queues");
                return Ok(vec![None; count]);
            }
            self.nb_flag = true;
        } else {
            self.nb_flag = false;
        }

        let out = self.core.dequeue(count);
        let pending = self.core.pending();

        if blocking {
            if self.core.ended() && pending == 0 {
                // Ended and drained - whether this dequeue found it that way
                // or took the last item itself. Pass the wake-up along so the
                // whole pool of blocked consumers drains one by one; the
                // final byte parks in the channel and short-circuits any
                // later blocking dequeue.
                self.signal.ring(1)?;
            } else if self.fast {
                if self.dsem <= 1 {
                    let hint = if count > 1 { pending / count } else { pending };
                    let depth = hint.min(MAX_DQ_DEPTH);
                    self.signal.ring(depth)?;
                    self.dsem = depth;
                } else {
                    self.dsem -= 1;
                }
            } else if pending > 0 {
                // Hand off to the next blocked consumer.
                self.signal.ring(1)?;
            }
        }

        self.release_awaiters(pending)?;
        Ok(out)
    }

    /// Release every await waiter in one burst once pending is at or below
    /// the recorded threshold.
    fn release_awaiters(&mut self, pending: usize) -> Result<()> {
        if self.asem > 0 && pending <= self.tsem {
            if let Some(ch) = &self.awaitch {
                ch.ring(self.asem)?;
            }
            self.asem = 0;
        }
        Ok(())
    }

    fn await_threshold(&mut self, threshold: usize) -> Result<()> {
        let ch = match &self.awaitch {
            Some(ch) => ch,
            None => {
                warn!("queue: await: queue was not constructed with await enabled");
                return Ok(());
            }
        };
        self.tsem = threshold;
        if self.core.pending() <= threshold {
            ch.ring(1)?;
        } else {
            self.asem += 1;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if self.fast {
            warn!("queue: clear: not allowed on fast queues");
            return Ok(());
        }
        self.core.clear();
        // Drain the wake-up byte, if any, so the channel agrees with the
        // now-empty queue.
        while self.signal.try_take()? {}
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.core.ended() {
            return Ok(());
        }
        self.core.set_ended();
        if self.core.is_empty() {
            // First wake of the daisy chain; dequeue keeps it going.
            self.signal.ring(1)?;
        }
        Ok(())
    }

    /// Wire form of the pending count: `-1` once ended and drained.
    fn pending_wire(&self) -> i64 {
        if self.core.ended() && self.core.is_empty() {
            -1
        } else {
            self.core.pending() as i64
        }
    }
}

/// The queue registry plus the dispatcher over the control socket.
///
/// `Manager::new` yields the manager and the worker-side [`ControlChannel`];
/// create queues, hand their [`QueueTicket`]s (and the channel) to workers,
/// then park a thread in [`Manager::run`]. The run loop returns cleanly when
/// every worker-side handle is gone.
pub struct Manager {
    reader: SockReader,
    conn: RawFd,
    queues: HashMap<u64, ManagedQueue>,
    next_id: u64,
}

impl Manager {
    pub fn new() -> Result<(Manager, ControlChannel)> {
        let (mfd, wfd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let manager = Manager {
            reader: SockReader::new(mfd),
            conn: mfd,
            queues: HashMap::new(),
            next_id: 1,
        };
        Ok((manager, ControlChannel::new(wfd, 1)))
    }

    /// Register a new queue and mint the ticket workers attach with. Ids are
    /// monotonic and never reused.
    pub fn create(&mut self, opts: QueueOptions) -> Result<QueueTicket> {
        let q = ManagedQueue::new(opts)?;
        let id = self.next_id;
        self.next_id += 1;
        let ticket = QueueTicket {
            id,
            fast: q.fast,
            signal_fd: q.signal.reader_fd(),
            await_fd: q.awaitch.as_ref().map(|ch| ch.reader_fd()),
        };
        self.queues.insert(id, q);
        Ok(ticket)
    }

    /// Drop a queue from the registry, closing its channels. Blocked
    /// consumers fail their reads.
    pub fn remove(&mut self, id: u64) -> bool {
        self.queues.remove(&id).is_some()
    }

    /// Dispatch frames until the workers hang up.
    pub fn run(&mut self) -> Result<()> {
        while self.dispatch_one()? {}
        Ok(())
    }

    fn queue_mut(&mut self, id: u64) -> Result<&mut ManagedQueue> {
        self.queues
            .get_mut(&id)
            .ok_or(QueueError::Wire("unknown queue id"))
    }

    fn read_int(&mut self, op: &'static str, what: &'static str) -> Result<i64> {
        let line = self.reader.read_line()?;
        wire::parse_int(&line, op, what)
    }

    fn read_payload(&mut self, op: &'static str) -> Result<Vec<u8>> {
        let len = self.read_int(op, "length")?;
        let len = usize::try_from(len).map_err(|_| QueueError::Wire("negative payload length"))?;
        self.reader.read_exact(len)
    }

    /// One frame: parse it completely, then look up the queue and act.
    /// `Ok(false)` is the clean end-of-stream at a frame boundary.
    fn dispatch_one(&mut self) -> Result<bool> {
        let tag = match self.reader.read_line() {
            Ok(tag) => tag,
            Err(QueueError::Orphaned) => return Ok(false),
            Err(e) => return Err(e),
        };
        let op = Opcode::from_tag(&tag)
            .ok_or_else(|| QueueError::UnknownOpcode(String::from_utf8_lossy(&tag).into_owned()))?;
        let chn = self.read_int("dispatch", "channel")?;
        let id = self.read_int("dispatch", "queue id")? as u64;
        debug!("dispatch: {:?} chn={} id={}", op, chn, id);
        let conn = self.conn;

        match op {
            Opcode::Await => {
                let t = self.read_int("await", "threshold")?.max(0) as usize;
                self.queue_mut(id)?.await_threshold(t)?;
            }
            Opcode::Clear => {
                self.queue_mut(id)?.clear()?;
                wire::respond_sync(conn)?;
            }
            Opcode::End => {
                self.queue_mut(id)?.end()?;
                wire::respond_sync(conn)?;
            }
            Opcode::EnqueueSeq => {
                let buf = self.read_payload("enqueue")?;
                let items = wire::thaw_items(&buf)?;
                self.queue_mut(id)?.enqueue(items)?;
            }
            Opcode::EnqueueSeqP => {
                let level = self.read_int("enqueuep", "priority")?;
                let buf = self.read_payload("enqueuep")?;
                let items = wire::thaw_items(&buf)?;
                self.queue_mut(id)?.enqueue_priority(level, items)?;
            }
            Opcode::EnqueueRaw => {
                let buf = self.read_payload("enqueue")?;
                self.queue_mut(id)?.enqueue(vec![Item::Bytes(buf)])?;
            }
            Opcode::EnqueueRawP => {
                let level = self.read_int("enqueuep", "priority")?;
                let buf = self.read_payload("enqueuep")?;
                self.queue_mut(id)?
                    .enqueue_priority(level, vec![Item::Bytes(buf)])?;
            }
            Opcode::Dequeue | Opcode::DequeueNb => {
                let count = self.read_int("dequeue", "count")?;
                if count < 1 {
                    // A caller's mistake, not a framing one: the frame is
                    // fully consumed, so answer absent and keep dispatching
                    // for everyone else.
                    warn!("queue: dequeue: count must be a positive integer");
                    wire::respond_absent(conn)?;
                    return Ok(true);
                }
                let count = count as usize;
                let blocking = op == Opcode::Dequeue;
                let out = self.queue_mut(id)?.dequeue(count, blocking)?;
                if count == 1 {
                    match out.into_iter().next().flatten() {
                        None => wire::respond_absent(conn)?,
                        Some(it) => wire::respond_payload(conn, &it.to_tagged())?,
                    }
                } else {
                    let mut seq = wire::freeze_seq(&out);
                    seq.push(wire::MARKER_FROZEN);
                    wire::respond_payload(conn, &seq)?;
                }
            }
            Opcode::Pending => {
                let v = self.queue_mut(id)?.pending_wire();
                wire::respond_int(conn, v)?;
            }
            Opcode::Insert => {
                let index = self.read_int("insert", "index")?;
                let payload = self.read_payload("insert")?;
                let items = wire::thaw_insert(payload)?;
                self.queue_mut(id)?.insert(index, items)?;
            }
            Opcode::InsertP => {
                let level = self.read_int("insertp", "priority")?;
                let index = self.read_int("insertp", "index")?;
                let payload = self.read_payload("insertp")?;
                let items = wire::thaw_insert(payload)?;
                self.queue_mut(id)?.insert_priority(level, index, items)?;
            }
            Opcode::Peek => {
                let index = self.read_int("peek", "index")?;
                let q = self.queue_mut(id)?;
                match q.core.peek(index) {
                    None => wire::respond_absent(conn)?,
                    Some(it) => wire::respond_payload(conn, &it.to_tagged())?,
                }
            }
            Opcode::PeekP => {
                let level = self.read_int("peekp", "priority")?;
                let index = self.read_int("peekp", "index")?;
                let q = self.queue_mut(id)?;
                match q.core.peek_priority(level, index) {
                    None => wire::respond_absent(conn)?,
                    Some(it) => wire::respond_payload(conn, &it.to_tagged())?,
                }
            }
            Opcode::PeekHeap => {
                let index = self.read_int("peekh", "index")?;
                let q = self.queue_mut(id)?;
                match q.core.peek_heap(index) {
                    None => wire::respond_absent(conn)?,
                    Some(level) => {
                        wire::respond_payload(conn, level.to_string().as_bytes())?
                    }
                }
            }
            Opcode::Heap => {
                let levels = self.queue_mut(id)?.core.heap_snapshot();
                wire::respond_payload(conn, &wire::freeze_levels(&levels))?;
            }
        }
        Ok(true)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = close(self.conn);
    }
}
