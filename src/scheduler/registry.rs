//! Thread-safe store of every known task plus the dispatch queue.
//!
//! Two locks cooperate here: the id map has its own mutex (with a condvar
//! that fires on every terminal transition), and [`TaskQueue`] keeps its
//! own heap lock for blocking pops. The queue lock is only ever acquired
//! while the map lock is held, never the other way round.

use super::priority::{QueueEntry, TaskQueue};
use crate::config::RetentionPolicy;
use crate::error::{Error, Result};
use crate::executor::task::{Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Task counts by status plus the number of queued entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failure: usize,
    pub retry: usize,
    pub cancelled: usize,
    pub queue_size: usize,
}

impl QueueStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Success => self.success,
            TaskStatus::Failure => self.failure,
            TaskStatus::Retry => self.retry,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    fn bump(&mut self, status: TaskStatus) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Success => &mut self.success,
            TaskStatus::Failure => &mut self.failure,
            TaskStatus::Retry => &mut self.retry,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }
}

#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Task>>,
    finished: Condvar,
    queue: TaskQueue,
    retention: RetentionPolicy,
}

impl TaskRegistry {
    pub fn new(queue_capacity: usize, retention: RetentionPolicy) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            finished: Condvar::new(),
            queue: TaskQueue::new(queue_capacity),
            retention,
        }
    }

    /// Stores a freshly submitted task and queues it for dispatch.
    pub fn enqueue(&self, mut task: Task) -> Result<()> {
        task.status = TaskStatus::Pending;
        let entry = QueueEntry::for_task(&task);

        let mut tasks = self.tasks.lock();
        if self.queue.try_push(entry).is_err() {
            return Err(Error::QueueFull(self.queue.capacity()));
        }
        tracing::debug!(task_id = %task.id, priority = task.priority, "queued task");
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Puts a task back in line for another attempt. Retries bypass the
    /// capacity bound so an accepted task is never dropped.
    pub fn requeue(&self, mut task: Task) {
        task.status = TaskStatus::Pending;
        task.started_at = None;

        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(&task.id) {
            task.created_at = existing.created_at;
            task.sequence = existing.sequence;
        }
        let entry = QueueEntry::for_task(&task);
        tasks.insert(task.id.clone(), task);
        self.queue.push(entry);
    }

    /// Blocks up to `wait` for the next runnable task and claims it.
    ///
    /// Entries whose task is no longer Pending (cancelled, evicted) are
    /// discarded here rather than removed from the heap eagerly.
    pub fn dequeue(&self, wait: Duration) -> Option<Task> {
        let deadline = Instant::now().checked_add(wait);
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => wait,
            };
            let entry = self.queue.pop_timeout(remaining)?;

            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&entry.id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    return Some(task.clone());
                }
                Some(task) => {
                    tracing::debug!(task_id = %entry.id, status = %task.status, "dropping stale queue entry");
                    self.queue.discard_stale();
                }
                None => {
                    tracing::debug!(task_id = %entry.id, "dropping queue entry for unknown task");
                    self.queue.discard_stale();
                }
            }
        }
    }

    pub fn lookup(&self, id: &TaskId) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    /// Overwrites the stored record. `created_at` is kept from the first
    /// insert.
    pub fn update(&self, mut task: Task) {
        let terminal = task.status.is_terminal();
        {
            let mut tasks = self.tasks.lock();
            if let Some(existing) = tasks.get(&task.id) {
                task.created_at = existing.created_at;
                task.sequence = existing.sequence;
            }
            tasks.insert(task.id.clone(), task);
        }
        if terminal {
            self.finished.notify_all();
        }
    }

    /// Pending tasks in dispatch order.
    pub fn pending(&self) -> Vec<Task> {
        let mut pending: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|task| (Reverse(task.priority), task.created_at, task.sequence));
        pending
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.tasks.lock().values() {
            stats.bump(task.status);
        }
        stats.queue_size = self.queue.len();
        stats
    }

    /// Marks a Pending task Cancelled. Its queue entry is skipped at
    /// dequeue time but stops counting against the capacity right away.
    pub fn cancel(&self, id: &TaskId) -> Result<Task> {
        let cancelled = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
            if task.status != TaskStatus::Pending {
                return Err(Error::NotCancellable {
                    id: id.clone(),
                    status: task.status,
                });
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            self.queue.mark_stale();
            task.clone()
        };
        self.finished.notify_all();
        Ok(cancelled)
    }

    /// Waits for `id` to reach a terminal state. `None`, or a limit too
    /// large to form a deadline, waits forever.
    pub fn wait_terminal(&self, id: &TaskId, timeout: Option<Duration>) -> Result<Task> {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let mut tasks = self.tasks.lock();
        loop {
            match tasks.get(id) {
                None => return Err(Error::TaskNotFound(id.clone())),
                Some(task) if task.status.is_terminal() => return Ok(task.clone()),
                Some(_) => {}
            }

            match (timeout, deadline) {
                (Some(limit), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::ResultTimeout(limit));
                    }
                    self.finished.wait_until(&mut tasks, deadline);
                }
                _ => self.finished.wait(&mut tasks),
            }
        }
    }

    /// Applies the retention policy. Returns the number of evicted tasks.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.lock();
        let before = tasks.len();

        if let Some(ttl) = self.retention.completed_ttl {
            if let Ok(ttl) = chrono::Duration::from_std(ttl) {
                tasks.retain(|_, task| {
                    !(task.status.is_terminal()
                        && task.completed_at.map_or(false, |at| now - at >= ttl))
                });
            }
        }

        if let Some(max) = self.retention.max_retained {
            if tasks.len() > max {
                let mut terminal: Vec<(DateTime<Utc>, u64, TaskId)> = tasks
                    .values()
                    .filter(|task| task.status.is_terminal())
                    .map(|task| {
                        (
                            task.completed_at.unwrap_or(task.created_at),
                            task.sequence,
                            task.id.clone(),
                        )
                    })
                    .collect();
                terminal.sort();

                let excess = tasks.len() - max;
                for (_, _, id) in terminal.into_iter().take(excess) {
                    tasks.remove(&id);
                }
            }
        }

        let evicted = before - tasks.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = tasks.len(), "evicted finished tasks");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Stops dispatch and unblocks workers parked in
    /// [`dequeue`](Self::dequeue). Submissions are still accepted.
    pub fn close_dispatch(&self) {
        self.queue.close();
    }

    pub fn open_dispatch(&self) {
        self.queue.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::task::{SubmitOptions, TaskArgs};
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn task(priority: i32) -> Task {
        Task::new(
            "noop",
            TaskArgs::new(),
            SubmitOptions::default().priority(priority),
        )
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::new(0, RetentionPolicy::unbounded())
    }

    #[test]
    fn test_dequeue_order() {
        let registry = registry();
        let priorities = [3, 9, 1, 9, 5, 0, 3];
        let mut ids = Vec::new();
        for p in priorities {
            let t = task(p);
            ids.push((p, t.id.clone()));
            registry.enqueue(t).unwrap();
        }

        let mut order = Vec::new();
        while let Some(t) = registry.dequeue(Duration::ZERO) {
            order.push((t.priority, t.id));
        }

        assert_eq!(order.len(), priorities.len());
        assert!(order.windows(2).all(|w| w[0].0 >= w[1].0));

        // equal priorities come out in submission order
        let nines: Vec<_> = order.iter().filter(|(p, _)| *p == 9).map(|(_, id)| id).collect();
        let submitted_nines: Vec<_> = ids.iter().filter(|(p, _)| *p == 9).map(|(_, id)| id).collect();
        assert_eq!(nines, submitted_nines);
    }

    #[test]
    fn test_dequeue_claims_task() {
        let registry = registry();
        let t = task(0);
        let id = t.id.clone();
        registry.enqueue(t).unwrap();

        let claimed = registry.dequeue(Duration::ZERO).unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.started_at.is_some());
        assert_eq!(registry.lookup(&id).unwrap().status, TaskStatus::Running);

        assert!(registry.dequeue(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_update_keeps_created_at() {
        let registry = registry();
        let t = task(0);
        let id = t.id.clone();
        let created_at = t.created_at;
        registry.enqueue(t).unwrap();

        let mut claimed = registry.dequeue(Duration::ZERO).unwrap();
        claimed.created_at = Utc::now() + chrono::Duration::seconds(60);
        claimed.status = TaskStatus::Success;
        claimed.result = Some(json!(1));
        registry.update(claimed);

        let stored = registry.lookup(&id).unwrap();
        assert_eq!(stored.created_at, created_at);
        assert_eq!(stored.result, Some(json!(1)));
    }

    #[test]
    fn test_requeue_keeps_original_position() {
        let registry = registry();
        let early = task(5);
        let early_id = early.id.clone();
        registry.enqueue(early).unwrap();

        let claimed = registry.dequeue(Duration::ZERO).unwrap();
        let late = task(5);
        let late_id = late.id.clone();
        registry.enqueue(late).unwrap();

        registry.requeue(claimed);
        assert_eq!(registry.lookup(&early_id).unwrap().status, TaskStatus::Pending);

        assert_eq!(registry.dequeue(Duration::ZERO).unwrap().id, early_id);
        assert_eq!(registry.dequeue(Duration::ZERO).unwrap().id, late_id);
    }

    #[test]
    fn test_cancel_is_lazy() {
        let registry = registry();
        let doomed = task(10);
        let doomed_id = doomed.id.clone();
        let survivor = task(1);
        let survivor_id = survivor.id.clone();
        registry.enqueue(doomed).unwrap();
        registry.enqueue(survivor).unwrap();

        let cancelled = registry.cancel(&doomed_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(registry.queue_len(), 1);

        assert_eq!(registry.dequeue(Duration::ZERO).unwrap().id, survivor_id);
        assert!(registry.dequeue(Duration::ZERO).is_none());
        assert_eq!(registry.lookup(&doomed_id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_rejects_running_and_unknown() {
        let registry = registry();
        let t = task(0);
        let id = t.id.clone();
        registry.enqueue(t).unwrap();
        registry.dequeue(Duration::ZERO).unwrap();

        assert!(matches!(
            registry.cancel(&id),
            Err(Error::NotCancellable { status: TaskStatus::Running, .. })
        ));
        assert!(matches!(
            registry.cancel(&TaskId::from("nope")),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_queue_full() {
        let registry = TaskRegistry::new(1, RetentionPolicy::unbounded());
        registry.enqueue(task(0)).unwrap();

        let rejected = task(0);
        let rejected_id = rejected.id.clone();
        assert!(matches!(registry.enqueue(rejected), Err(Error::QueueFull(1))));
        assert!(registry.lookup(&rejected_id).is_none());
    }

    #[test]
    fn test_cancelled_entry_frees_capacity() {
        let registry = TaskRegistry::new(1, RetentionPolicy::unbounded());
        let first = task(0);
        let first_id = first.id.clone();
        registry.enqueue(first).unwrap();
        registry.cancel(&first_id).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.queue_size, 0);

        let second = task(0);
        let second_id = second.id.clone();
        registry.enqueue(second).unwrap();
        assert!(matches!(registry.enqueue(task(0)), Err(Error::QueueFull(1))));
        assert_eq!(registry.stats().queue_size, 1);

        // the stale entry is skipped and the live one is claimed
        assert_eq!(registry.dequeue(Duration::ZERO).unwrap().id, second_id);
        assert_eq!(registry.stats().queue_size, 0);
        registry.enqueue(task(0)).unwrap();
        assert_eq!(registry.stats().queue_size, 1);
    }

    #[test]
    fn test_evicted_cancelled_entry_is_settled() {
        let registry = TaskRegistry::new(
            1,
            RetentionPolicy {
                completed_ttl: Some(Duration::ZERO),
                max_retained: None,
            },
        );
        let doomed = task(0);
        let doomed_id = doomed.id.clone();
        registry.enqueue(doomed).unwrap();
        registry.cancel(&doomed_id).unwrap();
        assert_eq!(registry.evict_expired(), 1);

        assert!(registry.dequeue(Duration::ZERO).is_none());
        registry.enqueue(task(0)).unwrap();
        assert_eq!(registry.queue_len(), 1);
    }

    #[test]
    fn test_wait_terminal_with_maximal_timeout() {
        let registry = Arc::new(registry());
        let t = task(0);
        let id = t.id.clone();
        registry.enqueue(t).unwrap();

        let worker = registry.clone();
        let handle = thread::spawn(move || {
            let mut claimed = worker.dequeue(Duration::MAX).unwrap();
            thread::sleep(Duration::from_millis(20));
            claimed.status = TaskStatus::Success;
            claimed.result = Some(json!("late"));
            worker.update(claimed);
        });

        let finished = registry.wait_terminal(&id, Some(Duration::MAX)).unwrap();
        handle.join().unwrap();
        assert_eq!(finished.result, Some(json!("late")));
    }

    #[test]
    fn test_wait_terminal_signalled() {
        let registry = Arc::new(registry());
        let t = task(0);
        let id = t.id.clone();
        registry.enqueue(t).unwrap();

        let worker = registry.clone();
        let handle = thread::spawn(move || {
            let mut claimed = worker.dequeue(Duration::from_secs(1)).unwrap();
            thread::sleep(Duration::from_millis(50));
            claimed.status = TaskStatus::Success;
            claimed.result = Some(json!("done"));
            worker.update(claimed);
        });

        let finished = registry
            .wait_terminal(&id, Some(Duration::from_secs(5)))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(finished.result, Some(json!("done")));
    }

    #[test]
    fn test_wait_terminal_timeout_leaves_task_alone() {
        let registry = registry();
        let t = task(0);
        let id = t.id.clone();
        registry.enqueue(t).unwrap();

        let result = registry.wait_terminal(&id, Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(Error::ResultTimeout(_))));

        let stored = registry.lookup(&id).unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn test_stats_counts() {
        let registry = registry();
        for p in 0..3 {
            registry.enqueue(task(p)).unwrap();
        }
        let claimed = registry.dequeue(Duration::ZERO).unwrap();
        let mut done = claimed.clone();
        done.status = TaskStatus::Failure;
        registry.update(done);

        let stats = registry.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.queue_size, 2);
        assert_eq!(stats.total(), 3);
        assert_eq!(registry.pending().len(), 2);
        assert_eq!(registry.pending()[0].priority, 1);
    }

    #[test]
    fn test_ttl_eviction_spares_unfinished() {
        let registry = TaskRegistry::new(
            0,
            RetentionPolicy {
                completed_ttl: Some(Duration::ZERO),
                max_retained: None,
            },
        );
        let finished = task(1);
        let finished_id = finished.id.clone();
        let waiting = task(0);
        let waiting_id = waiting.id.clone();
        registry.enqueue(finished).unwrap();
        registry.enqueue(waiting).unwrap();

        let mut claimed = registry.dequeue(Duration::ZERO).unwrap();
        claimed.status = TaskStatus::Success;
        claimed.completed_at = Some(Utc::now());
        registry.update(claimed);

        assert_eq!(registry.evict_expired(), 1);
        assert!(registry.lookup(&finished_id).is_none());
        assert!(registry.lookup(&waiting_id).is_some());
    }

    #[test]
    fn test_cap_eviction_drops_oldest_finished() {
        let registry = TaskRegistry::new(
            0,
            RetentionPolicy {
                completed_ttl: None,
                max_retained: Some(2),
            },
        );

        let mut finished_ids = Vec::new();
        for _ in 0..3 {
            let t = task(0);
            finished_ids.push(t.id.clone());
            registry.enqueue(t).unwrap();
            let mut claimed = registry.dequeue(Duration::ZERO).unwrap();
            claimed.status = TaskStatus::Success;
            claimed.completed_at = Some(Utc::now());
            registry.update(claimed);
        }
        let waiting = task(0);
        let waiting_id = waiting.id.clone();
        registry.enqueue(waiting).unwrap();

        assert_eq!(registry.evict_expired(), 2);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(&finished_ids[0]).is_none());
        assert!(registry.lookup(&finished_ids[1]).is_none());
        assert!(registry.lookup(&finished_ids[2]).is_some());
        assert!(registry.lookup(&waiting_id).is_some());
    }
}
