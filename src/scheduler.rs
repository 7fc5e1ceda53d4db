use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::invoker::ProcessTracker;
use crate::queue::JobQueue;

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type Job = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// Handed to every job: its id and the tracker its build processes must register with.
#[derive(Clone)]
pub struct JobContext {
    pub id: u64,
    pub tracker: Arc<ProcessTracker>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
    /// The timer fired. `abandoned` means the job had to be aborted before it could finish.
    TimedOut { abandoned: bool },
    Cancelled,
}

pub struct QueuedJob {
    id: u64,
    timeout: Duration,
    job: Job,
    responder: oneshot::Sender<JobOutcome>,
}

impl QueuedJob {
    pub(crate) fn new(
        id: u64,
        timeout: Duration,
        job: Job,
        responder: oneshot::Sender<JobOutcome>,
    ) -> Self {
        Self {
            id,
            timeout,
            job,
            responder,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Receives the outcome of a submitted job.
pub struct JobTicket {
    pub id: u64,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub async fn wait(self) -> JobOutcome {
        // the responder is dropped when the job is cancelled or the scheduler stops
        self.outcome.await.unwrap_or(JobOutcome::Cancelled)
    }
}

struct Inner {
    queue: JobQueue,
    slots: Arc<Semaphore>,
    pool_size: Mutex<usize>,
    timeout: Mutex<Duration>,
    synchronous: bool,
    term_grace: Duration,
    kill_grace: Duration,
    next_id: AtomicU64,
}

/// Runs build jobs on a bounded pool, in submission order, each under its own timer.
///
/// When the timer of a job fires, the process group of its build receives SIGTERM,
/// then SIGKILL, and the job task is aborted if it still does not finish.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                queue: JobQueue::new(),
                slots: Arc::new(Semaphore::new(pool_size)),
                pool_size: Mutex::new(pool_size),
                timeout: Mutex::new(config.timeout()),
                synchronous: config.synchronous,
                term_grace: Duration::from_millis(config.term_grace_ms),
                kill_grace: Duration::from_millis(config.kill_grace_ms),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.inner.synchronous
    }

    pub fn timeout(&self) -> Duration {
        *self.inner.timeout.lock()
    }

    /// Applies to jobs submitted from now on.
    pub fn set_timeout(&self, timeout: Duration) {
        log::info!("Build timeout set to {}s", timeout.as_secs());
        *self.inner.timeout.lock() = timeout;
    }

    pub fn pool_size(&self) -> usize {
        *self.inner.pool_size.lock()
    }

    /// Grows or shrinks the number of build slots. Running jobs keep their slot.
    pub fn set_pool_size(&self, size: usize) {
        let size = size.max(1);
        let mut current = self.inner.pool_size.lock();
        if size > *current {
            self.inner.slots.add_permits(size - *current);
        } else if size < *current {
            let surplus = (*current - size) as u32;
            let slots = self.inner.slots.clone();
            tokio::spawn(async move {
                if let Ok(permits) = slots.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        log::info!("Build pool size changed from {} to {size}", *current);
        *current = size;
    }

    pub async fn queued(&self) -> usize {
        self.inner.queue.len().await
    }

    pub async fn queue_position(&self, job_id: u64) -> Option<usize> {
        self.inner.queue.position(job_id).await
    }

    /// Removes a job that is still waiting for a slot.
    pub async fn cancel(&self, job_id: u64) -> bool {
        let cancelled = self.inner.queue.cancel_job(job_id).await;
        if cancelled {
            log::info!("Job {job_id} cancelled before admission");
        }
        cancelled
    }

    /// Queues a job. In synchronous mode the job runs to completion before this returns.
    pub async fn submit<F, Fut>(&self, job: F) -> JobTicket
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if self.inner.synchronous {
            let ctx = JobContext {
                id,
                tracker: Arc::new(ProcessTracker::new()),
            };
            let outcome = match job(ctx).await {
                Ok(()) => JobOutcome::Completed,
                Err(e) => {
                    log::error!("Job {id} failed: {e:#}");
                    JobOutcome::Failed {
                        reason: format!("{e:#}"),
                    }
                }
            };
            let _ = tx.send(outcome);
        } else {
            let timeout = self.timeout();
            self.inner
                .queue
                .push(QueuedJob::new(
                    id,
                    timeout,
                    Box::new(move |ctx: JobContext| -> JobFuture { Box::pin(job(ctx)) }),
                    tx,
                ))
                .await;
            log::debug!("Job {id} queued");
        }

        JobTicket { id, outcome: rx }
    }

    /// Admits queued jobs until `token` is cancelled, then aborts whatever still runs.
    pub async fn run(&self, token: CancellationToken) {
        let inner = &self.inner;
        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,

                Some(res) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = res {
                        log::error!("Job supervisor failed: {e}");
                    }
                }

                job = inner.queue.pop() => {
                    let permit = tokio::select! {
                        _ = token.cancelled() => break,
                        permit = inner.slots.clone().acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else {
                        log::error!("Build slots closed, scheduler stopping");
                        break;
                    };
                    running.spawn(supervise(job, permit, inner.term_grace, inner.kill_grace));
                }
            }
        }

        if !running.is_empty() {
            log::info!("Aborting {} running build jobs", running.len());
        }
        running.shutdown().await;
        log::info!("Scheduler has shut down");
    }
}

async fn supervise(
    job: QueuedJob,
    _permit: OwnedSemaphorePermit,
    term_grace: Duration,
    kill_grace: Duration,
) {
    let QueuedJob {
        id,
        timeout,
        job,
        responder,
    } = job;

    let tracker = Arc::new(ProcessTracker::new());
    let ctx = JobContext {
        id,
        tracker: tracker.clone(),
    };
    log::info!("Job {id} admitted (timeout {}s)", timeout.as_secs());
    let mut handle = tokio::spawn(job(ctx));

    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(res) => finished(id, res),
        Err(_) => {
            log::warn!("Job {id} exceeded its timeout of {}s", timeout.as_secs());
            tracker.terminate();

            if let Ok(res) = tokio::time::timeout(term_grace, &mut handle).await {
                finished(id, res);
                JobOutcome::TimedOut { abandoned: false }
            } else {
                tracker.kill();
                if let Ok(res) = tokio::time::timeout(kill_grace, &mut handle).await {
                    finished(id, res);
                    JobOutcome::TimedOut { abandoned: false }
                } else {
                    log::error!("Job {id} did not stop after SIGKILL, abandoning it");
                    handle.abort();
                    JobOutcome::TimedOut { abandoned: true }
                }
            }
        }
    };

    log::info!("Job {id} finished: {outcome:?}");
    let _ = responder.send(outcome);
}

fn finished(id: u64, res: Result<anyhow::Result<()>, JoinError>) -> JobOutcome {
    match res {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) => {
            log::error!("Job {id} failed: {e:#}");
            JobOutcome::Failed {
                reason: format!("{e:#}"),
            }
        }
        Err(e) => {
            log::error!("Job {id} panicked or was aborted: {e}");
            JobOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}
