use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::Job;

const DEFAULT_CAPACITY: usize = 256;

/// Bounded job queue kept sorted by priority, then weight, both descending.
///
/// The queue itself is not synchronized; share it as
/// `Arc<tokio::sync::Mutex<JobQueue>>` so every mutation goes through one lock.
#[derive(Debug)]
pub struct JobQueue {
    jobs: Vec<Job>,
    capacity: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a job behind every queued job that ranks at least as high.
    /// Fails instead of waiting when the queue is at capacity.
    pub fn enqueue(&mut self, job: Job) -> Result<()> {
        if self.is_full() {
            return Err(DispatchError::QueueFull {
                capacity: self.capacity,
            });
        }

        let rank = job.rank();
        let position = self
            .jobs
            .iter()
            .position(|queued| queued.rank() < rank)
            .unwrap_or(self.jobs.len());
        tracing::debug!(job_id = %job.id(), position, "Job enqueued");
        self.jobs.insert(position, job);
        Ok(())
    }

    /// Remove and return the highest-ranked job
    pub fn dequeue(&mut self) -> Option<Job> {
        if self.jobs.is_empty() {
            None
        } else {
            Some(self.jobs.remove(0))
        }
    }

    /// Remove a job that has not been dispatched yet
    pub fn remove_by_id(&mut self, id: &Uuid) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id() == *id)?;
        Some(self.jobs.remove(index))
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id() == *id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get_job(id).is_some()
    }

    /// Copy of the queued jobs in dequeue order
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    pub fn peek(&self) -> Option<&Job> {
        self.jobs.first()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
