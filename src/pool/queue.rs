//! Bounded priority queue of pending jobs.
//!
//! Ordered by `(priority, id)`: lower priority values first, and since job
//! ids increase monotonically, FIFO among equal priorities. When the queue
//! is over capacity the entry at the opposite end (least urgent, newest
//! among ties) is evicted, which may be the job just pushed.

use std::collections::BTreeMap;

use crate::pool::job::{Job, JobId};

#[derive(Debug)]
pub(crate) struct JobQueue {
    entries: BTreeMap<(i32, JobId), Job>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a job. Returns the evicted job if the queue overflowed.
    pub fn push(&mut self, job: Job) -> Option<Job> {
        self.entries.insert((job.priority, job.id), job);
        if self.entries.len() > self.capacity {
            return self.entries.pop_last().map(|(_, job)| job);
        }
        None
    }

    /// Put a job back after a failed dispatch. Keeps its original position
    /// and never evicts.
    pub fn requeue(&mut self, job: Job) {
        self.entries.insert((job.priority, job.id), job);
    }

    /// Most urgent job.
    pub fn pop(&mut self) -> Option<Job> {
        self.entries.pop_first().map(|(_, job)| job)
    }

    /// Remove a specific job.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let key = self.entries.keys().find(|(_, job_id)| *job_id == id).copied()?;
        self.entries.remove(&key)
    }

    /// Take every queued job, most urgent first.
    pub fn drain(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
