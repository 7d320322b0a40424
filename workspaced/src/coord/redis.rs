use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script, Value};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{ttl_millis, Backend, BackendError, StreamEntry};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

type RawEntry = (String, Vec<(String, String)>);

/// Redis-backed coordination shared by every host in the deployment.
///
/// Ordinary commands are multiplexed over one managed connection. Blocking
/// stream reads open their own connection so they never hold up lock
/// renewals queued behind them.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    conn: ConnectionManager,
    release: Script,
    renew: Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!(url = %redact_url(url), "connected to redis");
        Ok(Self {
            client,
            conn,
            release: Script::new(COMPARE_AND_DELETE),
            renew: Script::new(COMPARE_AND_EXPIRE),
        })
    }
}

fn into_entry((id, fields): RawEntry) -> StreamEntry {
    StreamEntry {
        id,
        fields: fields.into_iter().collect::<HashMap<_, _>>(),
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn stream_add(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn group_create(&self, stream: &str, group: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let created: Result<(), ::redis::RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>, BackendError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(1);
        // BLOCK 0 would wait forever.
        let block_ms = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");
        let reply: Option<Vec<(String, Vec<RawEntry>)>> = cmd.query_async(&mut conn).await?;

        Ok(reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .map(into_entry)
            .next())
    }

    async fn group_autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Vec<Value> = ::redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // [next-cursor, [entries...], [deleted-ids...]]; entries deleted from
        // the stream while pending come back as nil.
        let raw = reply.get(1).ok_or_else(|| BackendError::Reply {
            command: "XAUTOCLAIM",
            detail: format!("expected at least 2 elements, got {}", reply.len()),
        })?;
        let entries: Vec<Option<RawEntry>> = ::redis::from_redis_value(raw)?;
        Ok(entries.into_iter().flatten().map(into_entry).collect())
    }

    async fn group_ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        // One group per stream: an acked message is never read again.
        let (acked, _deleted): (i64, i64) = ::redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .cmd("XDEL")
            .arg(stream)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(acked == 1)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Strip credentials from a redis URL for logging.
pub(crate) fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
