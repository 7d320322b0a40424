use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use workspaced_protocol::{JobStatus, StartStatus};

use crate::coord::{Backend, BackendError};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("encoding status record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Start-job progress records, written by the worker that owns the job and
/// polled by the submitting client. Records expire after `ttl`.
#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<dyn Backend>,
    ttl: Duration,
}

fn key(start_id: &str) -> String {
    format!("start:{start_id}")
}

impl StatusStore {
    pub fn new(backend: Arc<dyn Backend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub async fn put(&self, start_id: &str, status: &StartStatus) -> Result<(), StatusError> {
        let value = serde_json::to_string(status)?;
        self.backend.set(&key(start_id), &value, Some(self.ttl)).await?;
        Ok(())
    }

    pub async fn set(
        &self,
        start_id: &str,
        status: JobStatus,
        attempt: u32,
        max_attempts: u32,
        error: Option<String>,
    ) -> Result<(), StatusError> {
        self.put(
            start_id,
            &StartStatus {
                status,
                attempt,
                max_attempts,
                error,
            },
        )
        .await
    }

    /// The stored record, or `unknown` for ids never seen, expired or
    /// unreadable.
    pub async fn get(&self, start_id: &str) -> Result<StartStatus, BackendError> {
        let Some(raw) = self.backend.get(&key(start_id)).await? else {
            return Ok(StartStatus::unknown());
        };
        match serde_json::from_str(&raw) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!(start_id, error = %e, "unreadable status record");
                Ok(StartStatus::unknown())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryBackend;

    fn store(ttl: Duration) -> (StatusStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (StatusStore::new(backend.clone(), ttl), backend)
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (statuses, _) = store(Duration::from_secs(60));
        assert_eq!(statuses.get("nope").await.unwrap().status, JobStatus::Unknown);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (statuses, _) = store(Duration::from_secs(60));
        statuses
            .set("abc", JobStatus::Failed, 3, 3, Some("boom".to_string()))
            .await
            .unwrap();
        let status = statuses.get("abc").await.unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.attempt, 3);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_record_expires() {
        let (statuses, _) = store(Duration::from_millis(20));
        statuses.set("abc", JobStatus::Queued, 0, 3, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(statuses.get("abc").await.unwrap().status, JobStatus::Unknown);
    }

    #[test]
    fn test_encode_error_is_not_a_backend_error() {
        let e = serde_json::from_str::<u8>("x").unwrap_err();
        let err = StatusError::from(e);
        assert!(matches!(err, StatusError::Encode(_)));
        assert!(err.to_string().starts_with("encoding status record"));
    }

    #[tokio::test]
    async fn test_garbage_record_reads_as_unknown() {
        let (statuses, backend) = store(Duration::from_secs(60));
        backend.set("start:abc", "garbage", None).await.unwrap();
        assert_eq!(statuses.get("abc").await.unwrap().status, JobStatus::Unknown);
    }
}
