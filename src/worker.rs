/*!
The worker side: a [`ControlChannel`] wrapping the shared control socket
behind a mutex, and [`WorkerProxy`] handles that frame requests onto it.

Every request-plus-response exchange happens under the channel lock, so a
frame is never interleaved with another worker's and the response always
reaches the worker that asked. The two places a worker blocks for real - the
signal byte before a blocking dequeue, and the await byte - are read
*outside* the lock, so a sleeping consumer never wedges the channel for
everyone else.
*/

use crate::doorbell::DoorbellReader;
use crate::error::{QueueError, Result};
use crate::manager::QueueTicket;
use crate::wire::{self, FrameBuf, Opcode, SockReader};
use crate::{Item, SharedQueue};
use log::warn;
use nix::unistd::close;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The worker end of the control socket. One per manager connection, shared
/// by every proxy attached through it.
#[derive(Debug)]
pub struct ControlChannel {
    chn: u64,
    io: Mutex<SockReader>,
}

impl ControlChannel {
    pub(crate) fn new(fd: RawFd, chn: u64) -> ControlChannel {
        ControlChannel {
            chn,
            io: Mutex::new(SockReader::new(fd)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SockReader> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let fd = self.io.get_mut().unwrap_or_else(PoisonError::into_inner).fd();
        let _ = close(fd);
    }
}

/// A worker's handle on one managed queue. Clone freely; clones share the
/// control channel and the queue's doorbell fds.
#[derive(Clone)]
pub struct WorkerProxy {
    id: u64,
    fast: bool,
    channel: Arc<ControlChannel>,
    signal: DoorbellReader,
    awaitch: Option<DoorbellReader>,
}

impl WorkerProxy {
    /// Attach to the queue a [`QueueTicket`] describes.
    pub fn attach(channel: &Arc<ControlChannel>, ticket: QueueTicket) -> WorkerProxy {
        WorkerProxy {
            id: ticket.id,
            fast: ticket.fast,
            channel: Arc::clone(channel),
            signal: DoorbellReader::new(ticket.signal_fd),
            awaitch: ticket.await_fd.map(DoorbellReader::new),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn frame(&self, op: Opcode) -> FrameBuf {
        FrameBuf::request(op, self.channel.chn, self.id)
    }

    /// Fire-and-forget ops: write the frame under the lock, no reply.
    fn send_only(&self, frame: FrameBuf) -> Result<()> {
        let io = self.channel.lock();
        wire::write_all(io.fd(), frame.bytes())
    }

    /// Request/response ops: the lock is held across both directions.
    fn roundtrip_payload(&self, frame: FrameBuf, op: &'static str) -> Result<Option<Vec<u8>>> {
        let mut io = self.channel.lock();
        wire::write_all(io.fd(), frame.bytes())?;
        wire::read_response(&mut io, op)
    }

    fn roundtrip_int(&self, frame: FrameBuf, op: &'static str) -> Result<i64> {
        let mut io = self.channel.lock();
        wire::write_all(io.fd(), frame.bytes())?;
        let line = io.read_line()?;
        wire::parse_int(&line, op, "response")
    }

    /// Ops acknowledged by the single `\n` sync byte.
    fn roundtrip_sync(&self, frame: FrameBuf) -> Result<()> {
        let mut io = self.channel.lock();
        wire::write_all(io.fd(), frame.bytes())?;
        io.read_exact(1)?;
        Ok(())
    }

    fn send_enqueue(&self, seq_op: Opcode, raw_op: Opcode, level: Option<i64>, items: Vec<Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let single_scalar = items.len() == 1 && !items[0].is_frozen();
        let mut f = self.frame(if single_scalar { raw_op } else { seq_op });
        if let Some(level) = level {
            f.put_int(level);
        }
        if single_scalar {
            f.put_blob(items[0].payload());
        } else {
            f.put_blob(&wire::freeze_items(&items));
        }
        self.send_only(f)
    }

    fn send_insert(&self, op: Opcode, level: Option<i64>, index: i64, items: Vec<Item>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut f = self.frame(op);
        if let Some(level) = level {
            f.put_int(level);
        }
        f.put_int(index);
        let mut payload;
        if items.len() == 1 && !items[0].is_frozen() {
            payload = items[0].payload().to_vec();
            payload.push(wire::MARKER_BYTES);
        } else {
            payload = wire::freeze_items(&items);
            payload.push(wire::MARKER_FROZEN);
        }
        f.put_blob(&payload);
        self.send_only(f)
    }

    /// Issue the dequeue request proper; the doorbell byte (if any) has
    /// already been consumed by the caller.
    fn request_dequeue(&self, op: Opcode, count: usize) -> Result<Vec<Option<Item>>> {
        let mut f = self.frame(op);
        f.put_int(count as i64);
        let payload = self.roundtrip_payload(f, "dequeue")?;
        match payload {
            None => Ok(vec![None; count]),
            Some(buf) if count == 1 => Ok(vec![Some(Item::from_tagged(buf)?)]),
            Some(buf) => match Item::from_tagged(buf)? {
                Item::Frozen(seq) => wire::thaw_seq(&seq),
                Item::Bytes(_) => Err(QueueError::Wire("multi-item dequeue was not a sequence")),
            },
        }
    }

    fn dequeue_blocking(&self, count: usize, timeout: Option<Duration>) -> Result<Vec<Option<Item>>> {
        if count < 1 {
            return Err(QueueError::BadCount { op: "dequeue" });
        }
        match timeout {
            None => self.signal.wait()?,
            Some(t) => {
                if !self.signal.wait_timeout(t)? {
                    return Ok(vec![None; count]);
                }
            }
        }
        self.request_dequeue(Opcode::Dequeue, count)
    }
}

impl SharedQueue for WorkerProxy {
    fn enqueue(&self, items: Vec<Item>) -> Result<()> {
        self.send_enqueue(Opcode::EnqueueSeq, Opcode::EnqueueRaw, None, items)
    }

    fn enqueue_p(&self, level: i64, items: Vec<Item>) -> Result<()> {
        self.send_enqueue(Opcode::EnqueueSeqP, Opcode::EnqueueRawP, Some(level), items)
    }

    fn dequeue(&self) -> Result<Option<Item>> {
        Ok(self.dequeue_blocking(1, None)?.swap_remove(0))
    }

    fn dequeue_many(&self, count: usize) -> Result<Vec<Option<Item>>> {
        self.dequeue_blocking(count, None)
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
        self.request_dequeue(Opcode::DequeueNb, count)
    }

    fn dequeue_timed(&self, timeout: Duration) -> Result<Option<Item>> {
        Ok(self.dequeue_blocking(1, Some(timeout))?.swap_remove(0))
    }

    fn insert(&self, index: i64, items: Vec<Item>) -> Result<()> {
        self.send_insert(Opcode::Insert, None, index, items)
    }

    fn insert_p(&self, level: i64, index: i64, items: Vec<Item>) -> Result<()> {
        self.send_insert(Opcode::InsertP, Some(level), index, items)
    }

    fn peek(&self, index: i64) -> Result<Option<Item>> {
        let mut f = self.frame(Opcode::Peek);
        f.put_int(index);
        self.roundtrip_payload(f, "peek")?
            .map(Item::from_tagged)
            .transpose()
    }

    fn peek_p(&self, level: i64, index: i64) -> Result<Option<Item>> {
        let mut f = self.frame(Opcode::PeekP);
        f.put_int(level);
        f.put_int(index);
        self.roundtrip_payload(f, "peekp")?
            .map(Item::from_tagged)
            .transpose()
    }

    fn peek_h(&self, index: i64) -> Result<Option<i64>> {
        let mut f = self.frame(Opcode::PeekHeap);
        f.put_int(index);
        self.roundtrip_payload(f, "peekh")?
            .map(|buf| wire::parse_int(&buf, "peekh", "level"))
            .transpose()
    }

    fn heap(&self) -> Result<Vec<i64>> {
        let f = self.frame(Opcode::Heap);
        match self.roundtrip_payload(f, "heap")? {
            Some(buf) => wire::thaw_levels(&buf),
            None => Ok(Vec::new()),
        }
    }

    fn pending(&self) -> Result<Option<usize>> {
        let f = self.frame(Opcode::Pending);
        let v = self.roundtrip_int(f, "pending")?;
        if v < 0 {
            Ok(None)
        } else {
            Ok(Some(v as usize))
        }
    }

    fn clear(&self) -> Result<()> {
        if self.fast {
            warn!("queue: clear: not allowed on fast queues");
            return Ok(());
        }
        self.roundtrip_sync(self.frame(Opcode::Clear))
    }

    fn end(&self) -> Result<()> {
        self.roundtrip_sync(self.frame(Opcode::End))
    }

    fn await_pending(&self, threshold: usize) -> Result<()> {
        let awaitch = self.awaitch.ok_or(QueueError::AwaitDisabled)?;
        let mut f = self.frame(Opcode::Await);
        f.put_int(threshold as i64);
        self.send_only(f)?;
        // Block outside the channel lock; the manager rings when pending
        // drops far enough.
        awaitch.wait()
    }
}
