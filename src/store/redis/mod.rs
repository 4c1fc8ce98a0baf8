//! Redis log store.
//!
//! Topics are Redis streams carrying the serialized payload under a single
//! field; sequence numbers come from `XLEN` in the same MULTI block as the
//! `XADD`. Counters are plain integer keys. Blocking reads use `XREAD BLOCK 0`
//! on a dedicated connection whose `CLIENT ID` lets another connection
//! interrupt it with `CLIENT UNBLOCK`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamRangeReply, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use super::{BlockingReader, Cursor, LogEntry, LogStore, ReaderId, Result, StoreError, TopicBatch};

/// Stream field holding the payload bytes.
pub const PAYLOAD_FIELD: &str = "p";

/// Redis implementation of [`LogStore`].
///
/// Ad hoc operations share a managed connection; every reader gets its own
/// connection so it can be unblocked without disturbing other traffic.
/// After [`LogStore::close`] every operation fails with [`StoreError::Closed`].
pub struct RedisLogStore {
    client: Client,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisLogStore {
    /// Connect to Redis and verify the connection with a PING.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone()).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(url = %url, "Connected to Redis for coordination");

        Ok(Self {
            client,
            conn: RwLock::new(Some(conn)),
        })
    }

    /// Handle on the shared connection, unless the store was closed.
    fn conn(&self) -> Result<ConnectionManager> {
        read_lock(&self.conn).clone().ok_or(StoreError::Closed)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse one `MGET` reply value; anything but an integer reads as missing.
fn parse_counter(key: &str, raw: Option<String>) -> Option<i64> {
    let raw = raw?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, value = %raw, error = %e, "Ignoring non-integer state counter");
            None
        }
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<i64> {
        let mut conn = self.conn()?;

        let (len,): (i64,) = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .ignore()
            .cmd("XLEN")
            .arg(topic)
            .query_async(&mut conn)
            .await?;

        Ok(len)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn()?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .iter()
            .zip(values)
            .map(|(key, raw)| parse_counter(key, raw))
            .collect())
    }

    async fn tail(&self, topic: &str) -> Result<Cursor> {
        let mut conn = self.conn()?;
        let newest: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(topic)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        match newest.ids.first() {
            Some(entry) => entry.id.parse(),
            None => Ok(Cursor::BEGINNING),
        }
    }

    async fn open_reader(&self) -> Result<Box<dyn BlockingReader>> {
        self.conn()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let id: ReaderId = redis::cmd("CLIENT")
            .arg("ID")
            .query_async(&mut conn)
            .await?;

        debug!(client_id = id, "Opened dedicated reader connection");
        Ok(Box::new(RedisReader { id, conn }))
    }

    async fn unblock(&self, reader: ReaderId) -> Result<bool> {
        let mut conn = self.conn()?;
        let unblocked: i64 = redis::cmd("CLIENT")
            .arg("UNBLOCK")
            .arg(reader)
            .query_async(&mut conn)
            .await?;

        Ok(unblocked == 1)
    }

    async fn collect_garbage(&self, threshold: Duration, scan_count: usize) -> Result<u64> {
        let mut conn = self.conn()?;
        let threshold_secs = threshold.as_secs();

        let mut cursor = 0u64;
        let mut purged = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(scan_count.max(1))
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;

            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.cmd("OBJECT").arg("IDLETIME").arg(key);
                }
                // Keys may vanish between SCAN and OBJECT; those read as nil.
                let idle: Vec<Option<u64>> = pipe.query_async(&mut conn).await?;

                let expired: Vec<String> = keys
                    .iter()
                    .zip(idle)
                    .filter_map(|(key, idle)| match idle {
                        Some(secs) if secs >= threshold_secs => Some(key.clone()),
                        _ => None,
                    })
                    .collect();

                if !expired.is_empty() {
                    let deleted: u64 = conn.del(&expired).await?;
                    if deleted != expired.len() as u64 {
                        warn!(
                            expected = expired.len(),
                            actual = deleted,
                            "Fewer keys deleted than expected"
                        );
                    }
                    purged += deleted;
                }
            }

            if cursor == 0 {
                break;
            }
        }

        Ok(purged)
    }

    async fn close(&self) -> Result<()> {
        if write_lock(&self.conn).take().is_some() {
            info!("Released Redis coordination connection");
        }
        Ok(())
    }
}

/// Dedicated reader connection.
struct RedisReader {
    id: ReaderId,
    conn: MultiplexedConnection,
}

#[async_trait]
impl BlockingReader for RedisReader {
    fn id(&self) -> ReaderId {
        self.id
    }

    async fn read(
        &mut self,
        cursors: &[(String, Cursor)],
        count: usize,
    ) -> Result<Vec<TopicBatch>> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count.max(1)).arg("BLOCK").arg(0).arg("STREAMS");
        for (topic, _) in cursors {
            cmd.arg(topic);
        }
        for (_, cursor) in cursors {
            cmd.arg(cursor.to_string());
        }

        // CLIENT UNBLOCK makes XREAD reply nil, as if it timed out.
        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .map(|key| {
                let entries = key
                    .ids
                    .into_iter()
                    .map(|entry| {
                        let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
                            StoreError::Malformed {
                                key: key.key.clone(),
                                message: format!("entry {} has no payload field", entry.id),
                            }
                        })?;
                        Ok(LogEntry {
                            cursor: entry.id.parse()?,
                            payload,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(TopicBatch {
                    topic: key.key,
                    entries,
                })
            })
            .collect()
    }
}
