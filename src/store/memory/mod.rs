//! In-process log store.
//!
//! Backs standalone mode and the test suite. Mirrors the Redis semantics the
//! coordination service relies on: dense per-topic sequence numbers, counters
//! that read as missing until first incremented, blocking reads that can be
//! unblocked by reader id, and idle-time based collection.
//!
//! Failure injection hooks let tests exercise reconnection paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{BlockingReader, Cursor, LogEntry, LogStore, ReaderId, Result, StoreError, TopicBatch};

#[derive(Default)]
struct ReaderSlot {
    blocked: bool,
    unblocked: bool,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<LogEntry>>,
    counters: HashMap<String, i64>,
    last_access: HashMap<String, Instant>,
    readers: HashMap<ReaderId, ReaderSlot>,
}

impl State {
    fn touch(&mut self, key: &str) {
        self.last_access.insert(key.to_string(), Instant::now());
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
    next_reader: AtomicI64,
    readers_opened: AtomicU64,
    mget_calls: AtomicU64,
    failing_reads: AtomicU32,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only mutated in short non-panicking sections.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory implementation of [`LogStore`].
///
/// Cheap to clone; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    shared: Arc<Shared>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` blocking reads fail with a connection error.
    ///
    /// Readers currently blocked are woken so the failure is observed promptly.
    pub fn fail_next_reads(&self, n: u32) {
        self.shared.failing_reads.store(n, Ordering::SeqCst);
        self.shared.changed.notify_waiters();
    }

    /// Toggle a full outage: every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
        self.shared.changed.notify_waiters();
    }

    /// Number of reader connections opened so far.
    pub fn readers_opened(&self) -> u64 {
        self.shared.readers_opened.load(Ordering::SeqCst)
    }

    /// Number of batched counter reads served so far.
    pub fn mget_calls(&self) -> u64 {
        self.shared.mget_calls.load(Ordering::SeqCst)
    }

    /// Current value of a counter, if it exists.
    pub fn counter(&self, key: &str) -> Option<i64> {
        self.shared.lock().counters.get(key).copied()
    }

    /// Number of entries in a topic.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.shared.lock().topics.get(topic).map_or(0, Vec::len)
    }

    /// Number of live keys (topics and counters).
    pub fn key_count(&self) -> usize {
        let state = self.shared.lock();
        state.topics.len() + state.counters.len()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, topic: &str, payload: &[u8]) -> Result<i64> {
        self.shared.check_available()?;

        let seq = {
            let mut state = self.shared.lock();
            let log = state.topics.entry(topic.to_string()).or_default();
            let seq = log.len() as u64 + 1;
            log.push(LogEntry {
                cursor: Cursor::new(0, seq),
                payload: payload.to_vec(),
            });
            state.touch(topic);
            seq as i64
        };

        self.shared.changed.notify_waiters();
        Ok(seq)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.shared.check_available()?;

        let mut state = self.shared.lock();
        let value = {
            let counter = state.counters.entry(key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        state.touch(key);
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        self.shared.check_available()?;
        self.shared.mget_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.shared.lock();
        let values = keys
            .iter()
            .map(|k| state.counters.get(k).copied())
            .collect::<Vec<_>>();
        for key in keys {
            if state.counters.contains_key(key) {
                state.touch(key);
            }
        }
        Ok(values)
    }

    async fn tail(&self, topic: &str) -> Result<Cursor> {
        self.shared.check_available()?;

        let state = self.shared.lock();
        Ok(state
            .topics
            .get(topic)
            .and_then(|log| log.last())
            .map_or(Cursor::BEGINNING, |e| e.cursor))
    }

    async fn open_reader(&self) -> Result<Box<dyn BlockingReader>> {
        self.shared.check_available()?;

        let id = self.shared.next_reader.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.lock().readers.insert(id, ReaderSlot::default());
        self.shared.readers_opened.fetch_add(1, Ordering::SeqCst);

        debug!(reader_id = id, "Opened memory reader");
        Ok(Box::new(MemoryReader {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn unblock(&self, reader: ReaderId) -> Result<bool> {
        self.shared.check_available()?;

        let unblocked = {
            let mut state = self.shared.lock();
            match state.readers.get_mut(&reader) {
                Some(slot) if slot.blocked => {
                    slot.unblocked = true;
                    true
                }
                _ => false,
            }
        };

        if unblocked {
            self.shared.changed.notify_waiters();
        }
        Ok(unblocked)
    }

    async fn collect_garbage(&self, threshold: Duration, _scan_count: usize) -> Result<u64> {
        self.shared.check_available()?;

        let mut state = self.shared.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .last_access
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= threshold)
            .map(|(k, _)| k.clone())
            .collect();

        let mut purged = 0u64;
        for key in expired {
            state.last_access.remove(&key);
            if state.topics.remove(&key).is_some() {
                purged += 1;
            }
            if state.counters.remove(&key).is_some() {
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn close(&self) -> Result<()> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed memory store");
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

/// Reader handle over the shared memory log.
struct MemoryReader {
    id: ReaderId,
    shared: Arc<Shared>,
}

impl MemoryReader {
    /// Collect entries after each cursor, or decide the read must return now.
    fn poll(&self, cursors: &[(String, Cursor)], count: usize) -> Option<Result<Vec<TopicBatch>>> {
        if self
            .shared
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Some(Err(StoreError::Connection(
                "injected read failure".to_string(),
            )));
        }
        if let Err(e) = self.shared.check_available() {
            return Some(Err(e));
        }

        let mut state = self.shared.lock();

        let mut batches = Vec::new();
        for (topic, cursor) in cursors {
            let Some(log) = state.topics.get(topic) else {
                continue;
            };
            // Sequence numbers are dense, so the cursor's seq is an index.
            let start = (cursor.seq as usize).min(log.len());
            let entries: Vec<LogEntry> = log[start..].iter().take(count.max(1)).cloned().collect();
            if !entries.is_empty() {
                batches.push(TopicBatch {
                    topic: topic.clone(),
                    entries,
                });
            }
        }
        for batch in &batches {
            state.touch(&batch.topic);
        }

        let slot = state.readers.entry(self.id).or_default();
        if !batches.is_empty() {
            slot.blocked = false;
            slot.unblocked = false;
            return Some(Ok(batches));
        }
        if slot.unblocked {
            slot.blocked = false;
            slot.unblocked = false;
            return Some(Ok(Vec::new()));
        }
        slot.blocked = true;
        None
    }
}

#[async_trait]
impl BlockingReader for MemoryReader {
    fn id(&self) -> ReaderId {
        self.id
    }

    async fn read(
        &mut self,
        cursors: &[(String, Cursor)],
        count: usize,
    ) -> Result<Vec<TopicBatch>> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.poll(cursors, count) {
                if result.is_err() {
                    if let Some(slot) = self.shared.lock().readers.get_mut(&self.id) {
                        slot.blocked = false;
                    }
                }
                return result;
            }

            notified.await;
        }
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.shared.lock().readers.remove(&self.id);
    }
}
