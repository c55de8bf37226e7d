use std::collections::VecDeque;

use crate::model::{Priority, TaskId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: TaskId,
    pub priority: Priority,
}

impl Job {
    pub fn new(id: TaskId, priority: Priority) -> Self {
        Self { id, priority }
    }
}

/// Deficit round robin over the four priorities; FIFO within a priority.
/// An empty lane does not bank credit.
#[derive(Debug)]
pub struct PriorityLane {
    queues: [VecDeque<Job>; 4],
    weights: [u8; 4],
    deficits: [i32; 4],
    cursor: usize,
}

impl Default for PriorityLane {
    fn default() -> Self {
        Self::new(Priority::ALL.map(Priority::weight))
    }
}

impl PriorityLane {
    pub fn new(weights: [u8; 4]) -> Self {
        Self {
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            weights,
            deficits: [0; 4],
            cursor: 0,
        }
    }

    pub fn push(&mut self, job: Job) {
        self.queues[job.priority.index()].push_back(job);
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn pop(&mut self) -> Option<Job> {
        if self.is_empty() {
            return None;
        }
        loop {
            let idx = self.cursor;
            if self.queues[idx].is_empty() {
                self.deficits[idx] = 0;
                self.cursor = (idx + 1) % Priority::ALL.len();
                continue;
            }
            if self.deficits[idx] <= 0 {
                self.deficits[idx] += self.weights[idx].max(1) as i32;
            }
            self.deficits[idx] -= 1;
            let job = self.queues[idx].pop_front();
            if self.deficits[idx] <= 0 || self.queues[idx].is_empty() {
                self.cursor = (idx + 1) % Priority::ALL.len();
            }
            return job;
        }
    }

    /// Drop a queued job. Returns whether it was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|job| job.id == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len_by_priority(&self) -> [usize; 4] {
        let mut lengths = [0usize; 4];
        for (idx, queue) in self.queues.iter().enumerate() {
            lengths[idx] = queue.len();
        }
        lengths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_priority_is_fifo() {
        let mut lane = PriorityLane::default();
        for id in 1..=5 {
            lane.push(Job::new(id, Priority::Normal));
        }
        let order: Vec<_> = std::iter::from_fn(|| lane.pop()).map(|job| job.id).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn weighted_round_robin_prefers_high_priority() {
        let mut lane = PriorityLane::default();
        let mut id = 0;
        for priority in Priority::ALL {
            for _ in 0..8 {
                id += 1;
                lane.push(Job::new(id, priority));
            }
        }

        let mut counts = [0usize; 4];
        for _ in 0..15 {
            let job = lane.pop().unwrap();
            counts[job.priority.index()] += 1;
        }
        assert_eq!(counts, [8, 4, 2, 1]);
        assert_eq!(lane.len(), 32 - 15);
    }

    #[test]
    fn removes_queued_job() {
        let mut lane = PriorityLane::default();
        lane.push(Job::new(1, Priority::Low));
        lane.push(Job::new(2, Priority::High));
        assert!(lane.remove(1));
        assert!(!lane.remove(1));
        assert_eq!(lane.len_by_priority(), [0, 1, 0, 0]);
        assert_eq!(lane.pop().map(|job| job.id), Some(2));
        assert!(lane.pop().is_none());
    }
}
