use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Backend, BackendError, StreamEntry};

/// In-process backend. Locks and queue state are only shared within this
/// process.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    appended: Notify,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Value>,
    streams: HashMap<String, Stream>,
    seq: u64,
    acks: u64,
}

struct Value {
    value: String,
    expires_at: Option<Instant>,
}

impl Value {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Entries are dropped once every group has acked them.
#[derive(Default)]
struct Stream {
    entries: BTreeMap<u64, StreamEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Sequence number of the last delivered entry.
    cursor: u64,
    pending: BTreeMap<String, Pending>,
}

struct Pending {
    seq: u64,
    consumer: String,
    delivered_at: Instant,
}

impl Stream {
    fn still_needed(&self, seq: u64) -> bool {
        self.groups
            .values()
            .any(|g| g.cursor < seq || g.pending.values().any(|p| p.seq == seq))
    }
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Value> {
        if self.keys.get(key).is_some_and(|v| !v.live(now)) {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }

    /// Drop every expired key, read or not.
    fn sweep(&mut self, now: Instant) {
        self.keys.retain(|_, v| v.live(now));
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total acknowledged messages across all groups.
    #[cfg(test)]
    pub(crate) fn ack_count(&self) -> u64 {
        self.state.lock().unwrap().acks
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self, stream: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn missing_group(stream: &str, group: &str) -> BackendError {
        BackendError::Reply {
            command: "XREADGROUP",
            detail: format!("NOGROUP no such key '{stream}' or consumer group '{group}'"),
        }
    }

    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>, BackendError> {
        let mut state = self.state.lock().unwrap();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::missing_group(stream, group))?;

        let Some((&seq, entry)) = s.entries.range(g.cursor + 1..).next() else {
            return Ok(None);
        };
        let entry = entry.clone();
        g.cursor = seq;
        g.pending.insert(
            entry.id.clone(),
            Pending {
                seq,
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
            },
        );
        Ok(Some(entry))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.sweep(now);
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            Value {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state
            .live_value(key, Instant::now())
            .is_some_and(|v| v.value == expected)
        {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        if !state
            .live_value(key, now)
            .is_some_and(|v| v.value == expected)
        {
            return Ok(false);
        }
        if let Some(v) = state.keys.get_mut(key) {
            v.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .live_value(key, Instant::now())
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut state = self.state.lock().unwrap();
        state.sweep(now);
        state.keys.insert(
            key.to_string(),
            Value {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, BackendError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            let id = format!("{seq}-0");
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .insert(
                    seq,
                    StreamEntry {
                        id: id.clone(),
                        fields: fields
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    },
                );
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn group_create(&self, stream: &str, group: &str) -> Result<(), BackendError> {
        self.state
            .lock()
            .unwrap()
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, BackendError> {
        let deadline = Instant::now() + block;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(entry) = self.try_deliver(stream, group, consumer)? {
                return Ok(Some(entry));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return self.try_deliver(stream, group, consumer);
            }
        }
    }

    async fn group_autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::missing_group(stream, group))?;

        let mut claimed = Vec::new();
        for pending in g.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            if let Some(entry) = s.entries.get(&pending.seq) {
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn group_ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().unwrap();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(false);
        };
        let Some(pending) = s.groups.get_mut(group).and_then(|g| g.pending.remove(id)) else {
            return Ok(false);
        };
        if !s.still_needed(pending.seq) {
            s.entries.remove(&pending.seq);
        }
        state.acks += 1;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
