//! Bounded blocking task queue.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lane::{Job, PriorityLane};
use crate::model::{Priority, TaskId};

struct Inner {
    lane: PriorityLane,
    closed: bool,
}

/// Producers block while the queue is full, consumers while it is empty.
/// Closing wakes everyone: pushes fail with `ShutDown`, pops return `None`.
pub struct TaskQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                lane: PriorityLane::default(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lane.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, id: TaskId, priority: Priority) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.lane.len() >= self.capacity {
            self.not_full.wait(&mut inner);
        }
        self.push_locked(&mut inner, id, priority)
    }

    pub fn push_timeout(
        &self,
        id: TaskId,
        priority: Priority,
        timeout: Duration,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if !inner.closed && inner.lane.len() >= self.capacity {
            self.not_full
                .wait_while_for(&mut inner, |inner| {
                    !inner.closed && inner.lane.len() >= self.capacity
                }, timeout);
        }
        if !inner.closed && inner.lane.len() >= self.capacity {
            return Err(SchedulerError::QueueFull);
        }
        self.push_locked(&mut inner, id, priority)
    }

    pub fn try_push(&self, id: TaskId, priority: Priority) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if !inner.closed && inner.lane.len() >= self.capacity {
            return Err(SchedulerError::QueueFull);
        }
        self.push_locked(&mut inner, id, priority)
    }

    fn push_locked(&self, inner: &mut Inner, id: TaskId, priority: Priority) -> SchedulerResult<()> {
        if inner.closed {
            return Err(SchedulerError::ShutDown);
        }
        inner.lane.push(Job::new(id, priority));
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until a task is available or the queue is closed.
    pub fn pop(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(job) = inner.lane.pop() {
                self.not_full.notify_one();
                return Some(job.id);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    pub fn remove(&self, id: TaskId) -> bool {
        let removed = self.inner.lock().lane.remove(id);
        if removed {
            self.not_full.notify_one();
        }
        removed
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = TaskQueue::new(2);
        queue.try_push(1, Priority::Normal).unwrap();
        queue.try_push(2, Priority::Normal).unwrap();
        assert!(matches!(
            queue.try_push(3, Priority::Normal),
            Err(SchedulerError::QueueFull)
        ));
        let started = Instant::now();
        assert!(matches!(
            queue.push_timeout(3, Priority::Normal, Duration::from_millis(50)),
            Err(SchedulerError::QueueFull)
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocked_producer_resumes_after_pop() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(1, Priority::Normal).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2, Priority::Normal))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn close_releases_blocked_consumer() {
        let queue = Arc::new(TaskQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert!(matches!(
            queue.push(1, Priority::Normal),
            Err(SchedulerError::ShutDown)
        ));
    }
}
