//! Ordered log store capabilities.
//!
//! The coordination service is written against these traits rather than a
//! concrete backend. A store provides, per topic key, an append-only log with
//! dense 1-based sequence numbers; atomic counters; batched counter reads;
//! blocking multi-topic reads on a dedicated connection; and a way to force
//! such a blocked read to return from another connection.
//!
//! Implementations:
//! - `RedisLogStore`: Redis streams + counters (feature `redis`)
//! - `MemoryLogStore`: in-process store for standalone mode and tests

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLogStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLogStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Malformed store value for key '{key}': {message}")]
    Malformed { key: String, message: String },

    #[error("Store is closed")]
    Closed,

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Identifies a reader connection so it can be unblocked from elsewhere.
pub type ReaderId = i64;

// ============================================================================
// Cursors
// ============================================================================

/// Position of an entry within a topic log.
///
/// Ordered as `(millis, seq)`, matching Redis stream entry ids. `BEGINNING`
/// sorts before every entry, so reading after it yields the whole log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cursor {
    pub millis: u64,
    pub seq: u64,
}

impl Cursor {
    pub const BEGINNING: Cursor = Cursor { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for Cursor {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidCursor(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((m, q)) => (m.parse().map_err(|_| invalid())?, q.parse().map_err(|_| invalid())?),
            None => (s.parse().map_err(|_| invalid())?, 0),
        };
        Ok(Self { millis, seq })
    }
}

/// One entry read from a topic log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub cursor: Cursor,
    pub payload: Vec<u8>,
}

/// Entries read from one topic, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBatch {
    pub topic: String,
    pub entries: Vec<LogEntry>,
}

// ============================================================================
// Traits
// ============================================================================

/// A dedicated connection that performs blocking multi-topic reads.
///
/// At most one read is outstanding per reader. A read blocks until at least
/// one topic has entries after its cursor, or until the reader is unblocked
/// via [`LogStore::unblock`], in which case it returns an empty batch list.
#[async_trait]
pub trait BlockingReader: Send + Sync {
    /// Connection id accepted by [`LogStore::unblock`].
    fn id(&self) -> ReaderId;

    /// Read up to `count` entries per topic strictly after each cursor.
    async fn read(&mut self, cursors: &[(String, Cursor)], count: usize)
        -> Result<Vec<TopicBatch>>;
}

/// Interface to the backing append-only log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a payload and return the topic's new length as one atomic unit.
    ///
    /// The returned value is the payload's 1-based sequence number.
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<i64>;

    /// Atomically increment a counter and return its new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Read many counters in one round trip. Missing keys are `None`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;

    /// Cursor of the newest entry in a topic, or `BEGINNING` if empty.
    async fn tail(&self, topic: &str) -> Result<Cursor>;

    /// Open a dedicated connection for blocking reads.
    async fn open_reader(&self) -> Result<Box<dyn BlockingReader>>;

    /// Force the reader with the given id out of a blocking read.
    ///
    /// Returns true if a blocked read was interrupted.
    async fn unblock(&self, reader: ReaderId) -> Result<bool>;

    /// Delete keys idle for at least `threshold`. Returns the number purged.
    async fn collect_garbage(&self, threshold: Duration, scan_count: usize) -> Result<u64>;

    /// Release store resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_parse_redis_id() {
        let cursor: Cursor = "1526919030474-55".parse().unwrap();
        assert_eq!(cursor, Cursor::new(1526919030474, 55));
        assert_eq!(cursor.to_string(), "1526919030474-55");
    }

    #[test]
    fn test_cursor_parse_bare_millis() {
        let cursor: Cursor = "0".parse().unwrap();
        assert_eq!(cursor, Cursor::BEGINNING);
    }

    #[test]
    fn test_cursor_parse_invalid() {
        assert!(matches!(
            "abc-1".parse::<Cursor>(),
            Err(StoreError::InvalidCursor(_))
        ));
        assert!("1-x".parse::<Cursor>().is_err());
    }

    #[test]
    fn test_cursor_ordering() {
        assert!(Cursor::BEGINNING < Cursor::new(0, 1));
        assert!(Cursor::new(5, 9) < Cursor::new(6, 0));
        assert!(Cursor::new(6, 1) > Cursor::new(6, 0));
    }
}
