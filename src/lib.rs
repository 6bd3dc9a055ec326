/*!
A hybrid shared queue for pools of worker processes, woken through socket-pair
doorbells.

One queue object carries a **normal** (unprioritized) lane together with any
number of **priority** lanes keyed by arbitrary integers. Priority lanes are
always drained before the normal lane, in a configurable order (highest level
first or lowest level first), and each lane is FIFO or LIFO per the queue's
type. The same queue runs in two modes:

* **standalone** - all state lives in one process; blocking operations use a
  condvar and no sockets are allocated.
* **managed** - a single manager process owns the authoritative state and any
  number of workers drive it over a shared control socket, with a per-queue
  signal channel waking blocked consumers one byte at a time.

The intended use-case is a parallel-execution framework: a coordinator seeds
jobs, a pool of workers sleeps on the queue, and bursts of enqueues wake
exactly as many workers as there are jobs. If you only need an in-process
channel, the standard library already has you covered - the point of this
crate is the cross-process case and the strict priority/ordering semantics.

## Usage, standalone

```
use hybrid_queue::{Item, QueueOptions, SharedQueue, StandaloneQueue};

let q = StandaloneQueue::new(QueueOptions::default());
q.enqueue(vec![Item::bytes("job-1"), Item::bytes("job-2")]).unwrap();
q.enqueue_p(5, vec![Item::bytes("urgent")]).unwrap();

// Priority lanes drain before the normal lane.
assert_eq!(q.dequeue().unwrap(), Some(Item::bytes("urgent")));
assert_eq!(q.dequeue().unwrap(), Some(Item::bytes("job-1")));
assert_eq!(q.pending().unwrap(), Some(1));
```

## Usage, managed

```
use std::sync::Arc;
use std::thread;
use hybrid_queue::{Item, Manager, QueueOptions, SharedQueue, WorkerProxy};

let (mut manager, channel) = Manager::new().unwrap();
let ticket = manager.create(QueueOptions::default()).unwrap();
let manager_th = thread::spawn(move || manager.run().unwrap());

// Hand the channel and the ticket to as many workers as you like.
let channel = Arc::new(channel);
let q = WorkerProxy::attach(&channel, ticket);
let consumer = {
    let q = q.clone();
    thread::spawn(move || q.dequeue().unwrap())
};

q.enqueue(vec![Item::bytes("ping")]).unwrap();
assert_eq!(consumer.join().unwrap(), Some(Item::bytes("ping")));

// Dropping every worker-side handle shuts the dispatcher down cleanly.
drop(q);
drop(channel);
manager_th.join().unwrap();
```

## Design

A blocking dequeue first reads one byte from the queue's signal channel, and
only then asks the manager for the item. The manager keeps the channel honest:
an enqueue that takes the queue from empty to non-empty writes exactly one
byte, and a dequeue that leaves items behind writes one byte to hand off to
the next blocked consumer, so at most one byte is ever in flight. In **fast**
mode the manager instead pre-signals up to [`MAX_DQ_DEPTH`] bytes in a single
burst and amortizes the bookkeeping across that many dequeues - lower wake-up
latency under load, at the price of `clear` and non-blocking dequeue being
disallowed.

The **await** channel is the reverse doorbell: a producer calls
`await_pending(threshold)` and blocks until consumers pull the backlog down to
the threshold. Waiters are released in one burst.

On the wire every request is a self-delimited frame: a 5-character opcode
line, decimal ASCII header fields, then an optional length-prefixed payload.
Values travel as opaque bytes plus a one-byte scalar-vs-frozen marker; the
manager never looks inside an item.

## Portability

Unix-only: channels are `AF_UNIX` stream socket pairs.
*/

use crate::error::Result;
use std::time::Duration;

pub mod core;
pub mod doorbell;
pub mod error;
pub mod manager;
pub mod standalone;
pub mod wire;
pub mod worker;

pub use crate::core::{LevelHeap, QueueCore};
pub use crate::error::QueueError;
pub use crate::manager::{Manager, QueueTicket};
pub use crate::standalone::StandaloneQueue;
pub use crate::worker::{ControlChannel, WorkerProxy};

/// Numeric flag for a first-in-first-out lane (alias `LILO`).
pub const FIFO: u32 = 1;
/// Numeric flag for a first-in-first-out lane.
pub const LILO: u32 = 1;
/// Numeric flag for a last-in-first-out lane (alias `FILO`).
pub const LIFO: u32 = 0;
/// Numeric flag for a last-in-first-out lane.
pub const FILO: u32 = 0;
/// Numeric flag for highest-level-first priority order.
pub const HIGHEST: u32 = 1;
/// Numeric flag for lowest-level-first priority order.
pub const LOWEST: u32 = 0;

/// Cap on the number of doorbell bytes a fast-mode dequeue pre-signals in one
/// burst. A burst never exceeds a typical socket buffer.
pub const MAX_DQ_DEPTH: usize = 192;

/// Lane discipline: which end of a lane a dequeue takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneOrder {
    /// Dequeue from the head, enqueue at the tail.
    #[default]
    Fifo,
    /// Dequeue from the tail, enqueue at the tail. A stack.
    Lifo,
}

impl LaneOrder {
    /// Decode the numeric flag form ([`FIFO`]/[`LIFO`]).
    pub fn from_flag(v: u32) -> Option<LaneOrder> {
        match v {
            FIFO => Some(LaneOrder::Fifo),
            LIFO => Some(LaneOrder::Lifo),
            _ => None,
        }
    }
}

/// Which priority level the heap puts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityOrder {
    /// Highest level dequeues first.
    #[default]
    Highest,
    /// Lowest level dequeues first.
    Lowest,
}

impl PriorityOrder {
    /// Decode the numeric flag form ([`HIGHEST`]/[`LOWEST`]).
    pub fn from_flag(v: u32) -> Option<PriorityOrder> {
        match v {
            HIGHEST => Some(PriorityOrder::Highest),
            LOWEST => Some(PriorityOrder::Lowest),
            _ => None,
        }
    }
}

/// One queued value: either a raw byte string or a structured value frozen to
/// bytes by the caller's serializer. Lanes carry the bytes verbatim; the tag
/// travels as a one-byte `'0'`/`'1'` marker on the wire so the receiving side
/// knows whether to thaw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    Frozen(Vec<u8>),
}

impl Item {
    /// A raw scalar item.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Item {
        Item::Bytes(b.into())
    }

    /// A pre-frozen structured item.
    pub fn frozen(b: impl Into<Vec<u8>>) -> Item {
        Item::Frozen(b.into())
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Item::Bytes(b) | Item::Frozen(b) => b,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Item::Frozen(_))
    }

    pub(crate) fn marker(&self) -> u8 {
        match self {
            Item::Bytes(_) => wire::MARKER_BYTES,
            Item::Frozen(_) => wire::MARKER_FROZEN,
        }
    }

    /// Payload bytes with the trailing marker, as framed on the wire.
    pub(crate) fn to_tagged(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload().len() + 1);
        out.extend_from_slice(self.payload());
        out.push(self.marker());
        out
    }

    /// Split a wire payload back into an item. The marker is the final byte
    /// and is part of the declared length.
    pub(crate) fn from_tagged(mut buf: Vec<u8>) -> Result<Item> {
        match buf.pop() {
            Some(m) if m == wire::MARKER_BYTES => Ok(Item::Bytes(buf)),
            Some(m) if m == wire::MARKER_FROZEN => Ok(Item::Frozen(buf)),
            Some(_) => Err(QueueError::Wire("bad scalar-vs-frozen marker")),
            None => Err(QueueError::Wire("empty tagged payload")),
        }
    }
}

/// Callback that diverts manager-side normal-lane enqueues away from the
/// queue. The dispatcher hands each received value to the callback and writes
/// no signal byte.
pub type Gather = Box<dyn FnMut(Item) + Send>;

/// Construction options for a queue. Replaces the module-level defaults of
/// older designs; there is no process-global configuration.
#[derive(Default)]
pub struct QueueOptions {
    /// Items preloaded into the normal lane. A non-empty preload pre-writes
    /// one wake-up byte on managed queues.
    pub initial: Vec<Item>,
    pub order: LaneOrder,
    pub porder: PriorityOrder,
    /// Allocate the await channel and enable `await_pending`.
    pub await_enabled: bool,
    /// Pre-signalled burst wake-ups; disallows `clear` and `dequeue_nb`.
    pub fast: bool,
    /// Manager-side gather hook. Ignored (with a warning) by standalone
    /// queues.
    pub gather: Option<Gather>,
}

/// The operation set shared by [`StandaloneQueue`] and [`WorkerProxy`].
///
/// `dequeue`/`dequeue_many` block until at least one item is available (a
/// worker sleeps on the queue's signal channel; a standalone queue waits on
/// its condvar). The `_nb` variants return absent instead of blocking, and
/// `dequeue_timed` gives up after a deadline. Asking for more items than are
/// pending yields trailing `None` slots.
pub trait SharedQueue {
    fn enqueue(&self, items: Vec<Item>) -> Result<()>;
    fn enqueue_p(&self, level: i64, items: Vec<Item>) -> Result<()>;

    fn dequeue(&self) -> Result<Option<Item>>;
    fn dequeue_many(&self, count: usize) -> Result<Vec<Option<Item>>>;
    fn dequeue_nb(&self) -> Result<Option<Item>>;
    fn dequeue_nb_many(&self, count: usize) -> Result<Vec<Option<Item>>>;
    fn dequeue_timed(&self, timeout: Duration) -> Result<Option<Item>>;

    /// Insert into the normal lane. Index 0 is always the next-to-dequeue
    /// end; negative indexes count from the other end.
    fn insert(&self, index: i64, items: Vec<Item>) -> Result<()>;
    fn insert_p(&self, level: i64, index: i64, items: Vec<Item>) -> Result<()>;

    fn peek(&self, index: i64) -> Result<Option<Item>>;
    fn peek_p(&self, level: i64, index: i64) -> Result<Option<Item>>;
    fn peek_h(&self, index: i64) -> Result<Option<i64>>;
    fn heap(&self) -> Result<Vec<i64>>;

    /// Pending item count. `None` once the queue has been ended and drained.
    fn pending(&self) -> Result<Option<usize>>;
    fn clear(&self) -> Result<()>;

    /// Mark the queue ended: enqueues become no-ops and a blocking dequeue
    /// on the drained queue returns absent instead of waiting.
    fn end(&self) -> Result<()>;

    /// Block until the pending count drops to `threshold` or below.
    fn await_pending(&self, threshold: usize) -> Result<()>;
}
