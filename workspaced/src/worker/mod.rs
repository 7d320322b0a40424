pub mod provision;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use workspaced_protocol::JobStatus;

use crate::config::Config;
use crate::coord::BackendError;
use crate::identity::{self, IdentityError};
use crate::lock::{Heartbeat, LockError, LockService};
use crate::metrics::{JobOutcome, MetricsRegistry};
use crate::queue::{ClaimedJob, QueueError, StartJob, StartQueue};
use crate::sandbox::RuntimeError;
use crate::status::{StatusError, StatusStore};
use crate::volume::VolumeError;

pub use provision::Provisioner;
pub use retry::{FixedBackoff, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("another start for this user is in progress")]
    LockBusy,

    #[error("user lock lost")]
    LockLost,

    #[error("home mount verification failed: {0}")]
    MountVerification(String),

    #[error("sandbox container failed to start: {0}")]
    ContainerStart(#[source] RuntimeError),

    #[error("{step} failed: {detail}")]
    Provision { step: &'static str, detail: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("max attempts ({attempts}) exceeded: {last}")]
    MaxAttemptsExceeded { attempts: u32, last: String },

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] IdentityError),

    #[error("home volume: {0}")]
    Volume(#[from] VolumeError),

    #[error("container runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("coordination backend: {0}")]
    Backend(#[from] BackendError),

    #[error("status record: {0}")]
    Status(#[from] StatusError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<LockError> for StartError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy { .. } => StartError::LockBusy,
            LockError::Lost { .. } => StartError::LockLost,
            LockError::Backend(e) => StartError::Backend(e),
        }
    }
}

/// Consumes start jobs: one user at a time per user, retried up to the job's
/// attempt limit, acked only once a terminal status is recorded.
pub struct StartWorker {
    queue: StartQueue,
    statuses: StatusStore,
    locks: LockService,
    provisioner: Provisioner,
    retry: Arc<dyn RetryPolicy>,
    metrics: MetricsRegistry,
    user_ttl: Duration,
    attempt_timeout: Duration,
    block: Duration,
    autoclaim_interval: Duration,
    autoclaim_idle: Duration,
    autoclaim_batch: usize,
}

impl StartWorker {
    pub fn new(
        config: &Config,
        queue: StartQueue,
        statuses: StatusStore,
        locks: LockService,
        provisioner: Provisioner,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            queue,
            statuses,
            locks,
            provisioner,
            retry: Arc::new(FixedBackoff(config.worker.backoff())),
            metrics,
            user_ttl: config.lock.user_ttl(),
            attempt_timeout: config.worker.attempt_timeout(),
            block: config.queue.block(),
            autoclaim_interval: config.queue.autoclaim_interval(),
            autoclaim_idle: config.queue.autoclaim_idle(),
            autoclaim_batch: config.queue.autoclaim_batch,
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    /// Claim and process jobs until `cancel` fires. A job already claimed is
    /// carried to a terminal status before the loop checks again.
    pub async fn run(&self, consumer: String, cancel: CancellationToken) {
        info!(consumer = %consumer, "start worker running");
        let mut next_autoclaim = Instant::now();

        while !cancel.is_cancelled() {
            if Instant::now() >= next_autoclaim {
                self.reclaim_stale(&consumer, &cancel).await;
                next_autoclaim = Instant::now() + self.autoclaim_interval;
            }

            let block = self
                .block
                .min(next_autoclaim.saturating_duration_since(Instant::now()));
            let claimed = tokio::select! {
                _ = cancel.cancelled() => break,
                claimed = self.queue.claim_next(&consumer, block) => claimed,
            };
            match claimed {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(consumer = %consumer, error = %e, "claim failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!(consumer = %consumer, "start worker stopped");
    }

    /// Take over abandoned jobs one at a time, up to `autoclaim_batch` per
    /// sweep. A job reclaimed but not yet started would keep aging in this
    /// consumer's pending list and be reclaimed again by another node.
    async fn reclaim_stale(&self, consumer: &str, cancel: &CancellationToken) {
        for _ in 0..self.autoclaim_batch {
            if cancel.is_cancelled() {
                return;
            }
            match self
                .queue
                .autoclaim_stale(consumer, self.autoclaim_idle, 1)
                .await
            {
                Ok(jobs) if jobs.is_empty() => return,
                Ok(jobs) => {
                    for job in jobs {
                        self.handle(job).await;
                    }
                }
                Err(e) => {
                    warn!(consumer, error = %e, "autoclaim failed");
                    return;
                }
            }
        }
    }

    async fn handle(&self, claimed: ClaimedJob) {
        let start_id = claimed.job.start_id.clone();
        if let Err(e) = self.process(claimed).await {
            self.metrics.record_error("job_unacked");
            error!(start_id = %start_id, error = %e, "start job left pending for redelivery");
        }
    }

    /// Drive one job to a terminal status. `Err` means the message was left
    /// unacked and will be redelivered.
    pub async fn process(&self, claimed: ClaimedJob) -> Result<JobStatus, StartError> {
        let started = Instant::now();
        let job = &claimed.job;
        let max_attempts = job.max_attempts.max(1);

        // Redelivered after its terminal status was written but before the ack.
        let current = self.statuses.get(&job.start_id).await?;
        if current.status.is_terminal() {
            info!(start_id = %job.start_id, status = %current.status, "start job already finished, acking");
            self.queue.ack(&claimed.message_id).await?;
            return Ok(current.status);
        }

        if let Err(e) = identity::validate_request(&job.request) {
            warn!(start_id = %job.start_id, error = %e, "rejecting invalid start job");
            self.finish(&claimed, JobStatus::Failed, 0, Some(e.to_string()))
                .await?;
            self.metrics.record_job(JobOutcome::Failed, started.elapsed());
            return Ok(JobStatus::Failed);
        }

        let lock = match self
            .locks
            .try_acquire(&identity::user_lock_key(&job.request.user_id), self.user_ttl)
            .await
        {
            Ok(lock) => lock,
            Err(LockError::Busy { .. }) => {
                info!(start_id = %job.start_id, user = %job.request.user_id, "user lock busy");
                self.finish(
                    &claimed,
                    JobStatus::Failed,
                    0,
                    Some(StartError::LockBusy.to_string()),
                )
                .await?;
                self.metrics.record_job(JobOutcome::LockBusy, started.elapsed());
                return Ok(JobStatus::Failed);
            }
            Err(e) => return Err(e.into()),
        };

        let heartbeat = self.locks.heartbeat(&lock);
        let (attempt, result) = self.attempts(job, max_attempts, &heartbeat).await;
        let (status, error) = match &result {
            Ok(()) => (JobStatus::Ready, None),
            Err(e) => (JobStatus::Failed, Some(e.to_string())),
        };

        let finished = self.finish(&claimed, status, attempt, error).await;
        heartbeat.stop().await;
        if let Err(e) = self.locks.release(&lock).await {
            warn!(key = lock.key(), error = %e, "failed to release user lock");
        }

        let outcome = if result.is_ok() {
            JobOutcome::Ready
        } else {
            JobOutcome::Failed
        };
        self.metrics.record_job(outcome, started.elapsed());
        info!(start_id = %job.start_id, %status, attempt, elapsed_ms = started.elapsed().as_millis() as u64, "start job finished");
        finished.map(|()| status)
    }

    /// Returns the last attempt number and the job's overall result.
    async fn attempts(
        &self,
        job: &StartJob,
        max_attempts: u32,
        heartbeat: &Heartbeat,
    ) -> (u32, Result<(), StartError>) {
        let mut last = None;

        for attempt in 1..=max_attempts {
            if heartbeat.is_lost() {
                self.metrics.record_lock_lost();
                return (attempt - 1, Err(StartError::LockLost));
            }
            if let Err(e) = self
                .statuses
                .set(&job.start_id, JobStatus::Starting, attempt, max_attempts, None)
                .await
            {
                warn!(start_id = %job.start_id, error = %e, "failed to record starting status");
            }

            let outcome = match tokio::time::timeout(
                self.attempt_timeout,
                self.provisioner.provision(&job.request, heartbeat),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StartError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(()) => {
                    self.metrics.record_attempt(true);
                    return (attempt, Ok(()));
                }
                Err(e) => {
                    self.metrics.record_attempt(false);
                    warn!(start_id = %job.start_id, attempt, max_attempts, error = %e, "start attempt failed");
                    if heartbeat.is_lost() || matches!(e, StartError::LockLost) {
                        self.metrics.record_lock_lost();
                        return (attempt, Err(StartError::LockLost));
                    }
                    if let StartError::MountVerification(_) = e {
                        self.metrics.record_error("mount_verification");
                    }
                    last = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        let last = last.map(|e| e.to_string()).unwrap_or_default();
        (
            max_attempts,
            Err(StartError::MaxAttemptsExceeded {
                attempts: max_attempts,
                last,
            }),
        )
    }

    /// Record the terminal status, then ack. Without a durable status the
    /// message stays pending.
    async fn finish(
        &self,
        claimed: &ClaimedJob,
        status: JobStatus,
        attempt: u32,
        error: Option<String>,
    ) -> Result<(), StartError> {
        let job = &claimed.job;
        self.statuses
            .set(&job.start_id, status, attempt, job.max_attempts.max(1), error)
            .await?;
        self.queue.ack(&claimed.message_id).await?;
        Ok(())
    }
}
