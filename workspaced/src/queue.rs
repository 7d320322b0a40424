use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use workspaced_protocol::StartRequest;

use crate::config::QueueConfig;
use crate::coord::{Backend, BackendError, StreamEntry};

/// The single field each stream entry carries.
const JOB_FIELD: &str = "job";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend: {0}")]
    Backend(#[from] BackendError),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Payload of one queued start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJob {
    pub start_id: String,
    #[serde(flatten)]
    pub request: StartRequest,
    pub max_attempts: u32,
}

impl StartJob {
    pub fn new(request: StartRequest, max_attempts: u32) -> Self {
        Self {
            start_id: Uuid::new_v4().to_string(),
            request,
            max_attempts,
        }
    }
}

/// A job handed to this consumer, pending until acked.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub message_id: String,
    pub job: StartJob,
}

/// Durable start-job stream with one consumer group shared by all workers.
/// Delivery is at-least-once: an entry stays pending until acked, and
/// entries idle past the threshold are claimed by another consumer.
#[derive(Clone)]
pub struct StartQueue {
    backend: Arc<dyn Backend>,
    stream: String,
    group: String,
}

impl StartQueue {
    pub fn new(backend: Arc<dyn Backend>, config: &QueueConfig) -> Self {
        Self {
            backend,
            stream: config.stream.clone(),
            group: config.group.clone(),
        }
    }

    /// Create the consumer group (and stream). Safe to call repeatedly.
    pub async fn init(&self) -> Result<(), QueueError> {
        self.backend.group_create(&self.stream, &self.group).await?;
        info!(stream = %self.stream, group = %self.group, "start queue ready");
        Ok(())
    }

    pub async fn enqueue(&self, job: &StartJob) -> Result<String, QueueError> {
        let payload = serde_json::to_string(job)?;
        let id = self
            .backend
            .stream_add(&self.stream, &[(JOB_FIELD, &payload)])
            .await?;
        debug!(start_id = %job.start_id, message_id = %id, "start job enqueued");
        Ok(id)
    }

    /// Next never-delivered job, waiting up to `block`.
    pub async fn claim_next(
        &self,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let Some(entry) = self
                .backend
                .group_read(&self.stream, &self.group, consumer, block)
                .await?
            else {
                return Ok(None);
            };
            if let Some(job) = self.decode_or_discard(entry).await? {
                return Ok(Some(job));
            }
        }
    }

    /// Take over jobs another consumer left pending for at least `min_idle`.
    pub async fn autoclaim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let entries = self
            .backend
            .group_autoclaim(&self.stream, &self.group, consumer, min_idle, count)
            .await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(job) = self.decode_or_discard(entry).await? {
                info!(start_id = %job.job.start_id, message_id = %job.message_id, consumer, "reclaimed stale start job");
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn ack(&self, message_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .backend
            .group_ack(&self.stream, &self.group, message_id)
            .await?)
    }

    async fn decode_or_discard(&self, entry: StreamEntry) -> Result<Option<ClaimedJob>, QueueError> {
        match decode(&entry) {
            Ok(job) => Ok(Some(ClaimedJob {
                message_id: entry.id,
                job,
            })),
            Err(reason) => {
                warn!(message_id = %entry.id, %reason, "discarding undecodable start job");
                self.ack(&entry.id).await?;
                Ok(None)
            }
        }
    }
}

fn decode(entry: &StreamEntry) -> Result<StartJob, String> {
    let payload = entry
        .fields
        .get(JOB_FIELD)
        .ok_or_else(|| format!("missing {JOB_FIELD:?} field"))?;
    serde_json::from_str(payload).map_err(|e| e.to_string())
}
