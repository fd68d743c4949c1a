use crate::executor::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Heap entry. Only the ordering key and the id live in the queue; the
/// task record itself stays in the registry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
}

impl QueueEntry {
    pub fn for_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            priority: task.priority,
            created_at: task.created_at,
            sequence: task.sequence,
        }
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Max-heap: higher priority first, then earliest creation, then submission order.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Blocking max-heap of [`QueueEntry`].
///
/// Entries for cancelled tasks stay in the heap until popped. The owner
/// reports them through [`mark_stale`](Self::mark_stale) so that the
/// capacity bound and [`len`](Self::len) only count live entries.
#[derive(Debug)]
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    available: Condvar,
    closed: AtomicBool,
    // written with the heap lock held
    stale: AtomicUsize,
    capacity: usize,
}

impl TaskQueue {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            stale: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Pushes unless the queue is at capacity, in which case the entry is
    /// handed back.
    pub fn try_push(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        let mut heap = self.heap.lock();
        if self.capacity > 0 && self.live(&heap) >= self.capacity {
            return Err(entry);
        }
        heap.push(entry);
        drop(heap);
        self.available.notify_one();
        Ok(())
    }

    /// Pushes regardless of capacity.
    pub fn push(&self, entry: QueueEntry) {
        self.heap.lock().push(entry);
        self.available.notify_one();
    }

    /// Blocks up to `wait` for an entry. A closed queue hands out nothing
    /// and returns immediately. A `wait` too large to express as a
    /// deadline blocks until a push or [`close`](Self::close).
    pub fn pop_timeout(&self, wait: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now().checked_add(wait);
        let mut heap = self.heap.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(entry) = heap.pop() {
                return Some(entry);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut heap, deadline).timed_out() {
                        if self.closed.load(Ordering::Acquire) {
                            return None;
                        }
                        return heap.pop();
                    }
                }
                None => self.available.wait(&mut heap),
            }
        }
    }

    pub fn try_pop(&self) -> Option<QueueEntry> {
        self.heap.lock().pop()
    }

    /// Stops handing out entries and wakes every blocked `pop_timeout`.
    /// Pushes are still accepted.
    pub fn close(&self) {
        let _heap = self.heap.lock();
        self.closed.store(true, Ordering::Release);
        self.available.notify_all();
    }

    pub fn reopen(&self) {
        let _heap = self.heap.lock();
        self.closed.store(false, Ordering::Release);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records that one entry still in the heap belongs to a task that
    /// will never be dispatched.
    pub fn mark_stale(&self) {
        let _heap = self.heap.lock();
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Settles one [`mark_stale`](Self::mark_stale) after its entry was
    /// popped and dropped.
    pub fn discard_stale(&self) {
        let _heap = self.heap.lock();
        let stale = self.stale.load(Ordering::Relaxed);
        self.stale.store(stale.saturating_sub(1), Ordering::Relaxed);
    }

    fn live(&self, heap: &BinaryHeap<QueueEntry>) -> usize {
        heap.len().saturating_sub(self.stale.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries, not counting the ones marked stale.
    pub fn len(&self) -> usize {
        let heap = self.heap.lock();
        self.live(&heap)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peek_priority(&self) -> Option<i32> {
        self.heap.lock().peek().map(|entry| entry.priority)
    }
}
