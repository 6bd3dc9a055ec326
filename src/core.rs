/*!
The in-memory queue state: the normal lane, the priority lanes, and the level
heap. Pure logic - no sockets, no signalling. The manager and the standalone
queue both wrap a [`QueueCore`] and add their own wake-up story on top.
*/

use crate::{Item, LaneOrder, PriorityOrder};
use std::collections::{HashMap, VecDeque};

/// The ordered list of priority levels whose lanes are currently non-empty.
///
/// Kept as a sorted `Vec`, not a binary heap: membership is the set of
/// non-empty levels (typically small), insertions dominate, and removal only
/// ever happens at the head because the head level is fully drained before
/// the next one is touched.
#[derive(Debug)]
pub struct LevelHeap {
    order: PriorityOrder,
    levels: Vec<i64>,
}

impl LevelHeap {
    pub fn new(order: PriorityOrder) -> LevelHeap {
        LevelHeap {
            order,
            levels: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// The level that dequeues next, if any lane is non-empty.
    pub fn head(&self) -> Option<i64> {
        self.levels.first().copied()
    }

    /// Read-only indexed view; negative indexes count from the back.
    pub fn get(&self, index: i64) -> Option<i64> {
        let len = self.levels.len();
        let pos = if index >= 0 {
            index as usize
        } else {
            let from_end = index.unsigned_abs() as usize;
            if from_end > len {
                return None;
            }
            len - from_end
        };
        self.levels.get(pos).copied()
    }

    pub fn snapshot(&self) -> Vec<i64> {
        self.levels.clone()
    }

    /// `true` when `a` dequeues strictly before `b`.
    fn ahead(&self, a: i64, b: i64) -> bool {
        match self.order {
            PriorityOrder::Highest => a > b,
            PriorityOrder::Lowest => a < b,
        }
    }

    /// Insert a level known to be absent. New-head and new-tail fast paths,
    /// binary insertion otherwise.
    pub fn insert(&mut self, level: i64) {
        if self.levels.is_empty() {
            self.levels.push(level);
            return;
        }
        if self.ahead(level, self.levels[0]) {
            self.levels.insert(0, level);
            return;
        }
        if self.ahead(self.levels[self.levels.len() - 1], level) {
            self.levels.push(level);
            return;
        }
        let at = match self.order {
            PriorityOrder::Highest => self.levels.partition_point(|&q| q > level),
            PriorityOrder::Lowest => self.levels.partition_point(|&q| q < level),
        };
        self.levels.insert(at, level);
    }

    /// Drop the head level. Only called when its lane just went empty.
    pub fn pop_head(&mut self) {
        if !self.levels.is_empty() {
            self.levels.remove(0);
        }
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}

/// Map a caller index onto the *logical* lane view, where position 0 is the
/// next-to-dequeue end. Positive indexes count from there, negative from the
/// far end, and out-of-bounds clamps to the nearer logical end.
fn logical_insert_pos(len: usize, index: i64) -> usize {
    if index >= 0 {
        (index as usize).min(len)
    } else {
        len.saturating_sub(index.unsigned_abs() as usize)
    }
}

/// Storage position for an insert. FIFO storage reads in logical order; LIFO
/// storage is the logical view reversed, so the position mirrors.
fn storage_insert_pos(order: LaneOrder, len: usize, index: i64) -> usize {
    let lp = logical_insert_pos(len, index);
    match order {
        LaneOrder::Fifo => lp,
        LaneOrder::Lifo => len - lp,
    }
}

/// Storage position for a read, or `None` when the index is out of range.
fn storage_read_pos(order: LaneOrder, len: usize, index: i64) -> Option<usize> {
    let lp = if index >= 0 {
        index as usize
    } else {
        let from_end = index.unsigned_abs() as usize;
        if from_end > len {
            return None;
        }
        len - from_end
    };
    if lp >= len {
        return None;
    }
    Some(match order {
        LaneOrder::Fifo => lp,
        LaneOrder::Lifo => len - 1 - lp,
    })
}

fn splice(lane: &mut VecDeque<Item>, pos: usize, items: Vec<Item>) {
    for (k, it) in items.into_iter().enumerate() {
        lane.insert(pos + k, it);
    }
}

/// The hybrid queue state: one normal lane plus lazily-created priority
/// lanes, with the heap tracking which levels are live.
#[derive(Debug)]
pub struct QueueCore {
    order: LaneOrder,
    normal: VecDeque<Item>,
    lanes: HashMap<i64, VecDeque<Item>>,
    heap: LevelHeap,
    ended: bool,
}

impl QueueCore {
    pub fn new(order: LaneOrder, porder: PriorityOrder) -> QueueCore {
        QueueCore {
            order,
            normal: VecDeque::new(),
            lanes: HashMap::new(),
            heap: LevelHeap::new(porder),
            ended: false,
        }
    }

    pub fn with_initial(order: LaneOrder, porder: PriorityOrder, items: Vec<Item>) -> QueueCore {
        let mut q = QueueCore::new(order, porder);
        q.enqueue(items);
        q
    }

    pub fn order(&self) -> LaneOrder {
        self.order
    }

    pub fn pending(&self) -> usize {
        self.normal.len() + self.lanes.values().map(|l| l.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn set_ended(&mut self) {
        self.ended = true;
    }

    /// Append items to the normal lane tail. No priority side effects.
    pub fn enqueue(&mut self, items: impl IntoIterator<Item = Item>) {
        self.normal.extend(items);
    }

    /// Append items to the tail of the lane for `level`, reviving the level
    /// in the heap when the lane was absent or empty. No-op without items.
    pub fn enqueue_priority(&mut self, level: i64, items: Vec<Item>) {
        if items.is_empty() {
            return;
        }
        let lane = self.lanes.entry(level).or_default();
        if lane.is_empty() {
            self.heap.insert(level);
        }
        lane.extend(items);
    }

    /// Take the next item: the head heap level's lane first, the normal lane
    /// only once every priority lane is drained.
    pub fn dequeue_one(&mut self) -> Option<Item> {
        match self.heap.head() {
            None => match self.order {
                LaneOrder::Fifo => self.normal.pop_front(),
                LaneOrder::Lifo => self.normal.pop_back(),
            },
            Some(level) => {
                let lane = match self.lanes.get_mut(&level) {
                    Some(lane) => lane,
                    None => panic!("heap level {} has no lane. Please report this error.", level),
                };
                if lane.len() == 1 {
                    self.heap.pop_head();
                }
                let item = match self.order {
                    LaneOrder::Fifo => lane.pop_front(),
                    LaneOrder::Lifo => lane.pop_back(),
                };
                if lane.is_empty() {
                    self.lanes.remove(&level);
                }
                item
            }
        }
    }

    /// Repeated single dequeues; positions past the pending count come back
    /// as `None`.
    pub fn dequeue(&mut self, count: usize) -> Vec<Option<Item>> {
        (0..count).map(|_| self.dequeue_one()).collect()
    }

    /// Splice items into the normal lane at the FIFO/LIFO-symmetric index.
    pub fn insert(&mut self, index: i64, items: Vec<Item>) {
        if items.is_empty() {
            return;
        }
        let pos = storage_insert_pos(self.order, self.normal.len(), index);
        splice(&mut self.normal, pos, items);
    }

    /// As `insert`, into the lane for `level`. Falls back to
    /// `enqueue_priority` when the lane is absent or empty so the heap stays
    /// consistent.
    pub fn insert_priority(&mut self, level: i64, index: i64, items: Vec<Item>) {
        if items.is_empty() {
            return;
        }
        match self.lanes.get_mut(&level) {
            Some(lane) if !lane.is_empty() => {
                let pos = storage_insert_pos(self.order, lane.len(), index);
                splice(lane, pos, items);
            }
            _ => self.enqueue_priority(level, items),
        }
    }

    pub fn peek(&self, index: i64) -> Option<&Item> {
        storage_read_pos(self.order, self.normal.len(), index).and_then(|p| self.normal.get(p))
    }

    pub fn peek_priority(&self, level: i64, index: i64) -> Option<&Item> {
        let lane = self.lanes.get(&level)?;
        storage_read_pos(self.order, lane.len(), index).and_then(|p| lane.get(p))
    }

    pub fn peek_heap(&self, index: i64) -> Option<i64> {
        self.heap.get(index)
    }

    pub fn heap_snapshot(&self) -> Vec<i64> {
        self.heap.snapshot()
    }

    /// Empty every lane and the heap. Channel hygiene (draining a pending
    /// doorbell byte) is the owner's job.
    pub fn clear(&mut self) {
        self.normal.clear();
        self.lanes.clear();
        self.heap.clear();
    }
}
