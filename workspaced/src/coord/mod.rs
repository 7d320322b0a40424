//! Shared key/value and stream primitives used by the lock service, the start
//! queue and the status store.
//!
//! Production deployments point every host at one Redis instance so locks and
//! queue state are shared. The in-process backend exists for single-node
//! development and for tests.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("unexpected reply to {command}: {detail}")]
    Reply {
        command: &'static str,
        detail: String,
    },
}

/// One stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Set `key` to `value` with a TTL only if it does not exist.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Delete `key` only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError>;

    /// Reset the TTL of `key` only if it still holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Append a message and return its id.
    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, BackendError>;

    /// Create a consumer group reading from the start of the stream,
    /// creating the stream if needed. An existing group is not an error.
    async fn group_create(&self, stream: &str, group: &str) -> Result<(), BackendError>;

    /// Deliver at most one never-delivered message to `consumer`, waiting up
    /// to `block` for one to arrive.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, BackendError>;

    /// Transfer pending messages idle for at least `min_idle` to `consumer`.
    async fn group_autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BackendError>;

    /// Acknowledge a message and drop it from the stream. Returns false if
    /// it was not pending.
    async fn group_ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;
}

/// Clamp to at least one millisecond; Redis rejects a zero PX/PEXPIRE.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }
}
