use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coord::{Backend, BackendError};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} is held by another owner")]
    Busy { key: String },

    #[error("lock {key} was lost")]
    Lost { key: String },

    #[error("lock backend: {0}")]
    Backend(#[from] BackendError),
}

/// Proof of ownership of one lock. Only the holder of the token can renew or
/// release it.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Keyed mutual exclusion with owner tokens and expiry, on top of the shared
/// coordination backend.
#[derive(Clone)]
pub struct LockService {
    backend: Arc<dyn Backend>,
    poll_interval: Duration,
}

impl LockService {
    pub fn new(backend: Arc<dyn Backend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
        }
    }

    /// Take `key`, polling until `timeout` elapses. A zero timeout makes a
    /// single attempt.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let token = Uuid::new_v4().simple().to_string();
        let deadline = Instant::now() + timeout;

        loop {
            if self.backend.set_nx(key, &token, ttl).await? {
                debug!(key, "lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                    ttl,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Busy {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        self.acquire(key, ttl, Duration::ZERO).await
    }

    /// Release if still owned. Returns false when the lock had already
    /// expired or passed to someone else.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let released = self
            .backend
            .compare_and_delete(&handle.key, &handle.token)
            .await?;
        if !released {
            warn!(key = %handle.key, "lock was no longer held at release");
        }
        Ok(released)
    }

    /// Extend the TTL. `Ok(false)` means the lock is lost.
    pub async fn renew(&self, handle: &LockHandle) -> Result<bool, LockError> {
        Ok(self
            .backend
            .compare_and_expire(&handle.key, &handle.token, handle.ttl)
            .await?)
    }

    /// Renew `handle` every `ttl / 3` in the background until stopped.
    pub fn heartbeat(&self, handle: &LockHandle) -> Heartbeat {
        let lost = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let interval = (handle.ttl / 3).max(Duration::from_millis(1));

        let task = {
            let service = self.clone();
            let handle = handle.clone();
            let lost = Arc::clone(&lost);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut last_renewed = Instant::now();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match service.renew(&handle).await {
                        Ok(true) => last_renewed = Instant::now(),
                        Ok(false) => {
                            warn!(key = %handle.key, "lock lost during heartbeat");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            warn!(key = %handle.key, error = %e, "lock renewal failed");
                            if last_renewed.elapsed() >= handle.ttl {
                                warn!(key = %handle.key, "no successful renewal within ttl, treating lock as lost");
                                lost.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                }
            })
        };

        info!(key = %handle.key, interval_ms = interval.as_millis() as u64, "lock heartbeat started");
        Heartbeat {
            key: handle.key.clone(),
            lost,
            cancel,
            task: Some(task),
        }
    }
}

/// Background renewal of one lock. Dropping it stops renewal.
pub struct Heartbeat {
    key: String,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Err if the lock was lost. Call before every externally visible side
    /// effect made under the lock.
    pub fn check(&self) -> Result<(), LockError> {
        if self.is_lost() {
            return Err(LockError::Lost {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
