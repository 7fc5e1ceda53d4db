use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::scheduler::QueuedJob;

/// FIFO of jobs waiting for a free build slot.
pub struct JobQueue {
    queue: Mutex<VecDeque<QueuedJob>>,
    notify: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: QueuedJob) {
        self.queue.lock().await.push_back(job);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> QueuedJob {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    /// Drops a job that has not been admitted yet.
    pub async fn cancel_job(&self, job_id: u64) -> bool {
        let mut queue = self.queue.lock().await;
        let before_len = queue.len();
        queue.retain(|j| j.id() != job_id);
        before_len != queue.len()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Zero-based place of a job in the queue.
    pub async fn position(&self, job_id: u64) -> Option<usize> {
        self.queue
            .lock()
            .await
            .iter()
            .position(|j| j.id() == job_id)
    }
}
