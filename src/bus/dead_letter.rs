//! Bounded dead-letter queue
//!
//! Ring buffer of permanently failed messages. When full, the oldest entry is
//! evicted first. Entries stay inspectable and replayable until removed.

use super::message::Message;
use crate::error::{ErrorClass, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default capacity
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// A permanently failed message
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub original_message: Message,
    pub error: String,
    pub error_class: ErrorClass,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

impl DeadLetterEntry {
    pub fn new(message: Message, error: impl Into<String>, error_class: ErrorClass) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            retry_count: message.retry_count,
            original_message: message,
            error: error.into(),
            error_class,
            timestamp: Utc::now(),
        }
    }

    /// Entries are addressable by their own id or the original message id
    pub fn matches(&self, id: &str) -> bool {
        self.id == id || self.original_message.id == id
    }
}

/// Result of a replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed_count: usize,
    pub failed_count: usize,
}

/// Bounded ring buffer of dead letters
pub struct DeadLetterQueue {
    max_size: usize,
    entries: RwLock<VecDeque<DeadLetterEntry>>,
    total_added: AtomicU64,
    evicted: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            entries: RwLock::new(VecDeque::with_capacity(max_size.min(1024))),
            total_added: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Append an entry, evicting the oldest when full
    pub async fn push(&self, entry: DeadLetterEntry) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.max_size {
            if let Some(evicted) = entries.pop_front() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %evicted.original_message.id,
                    "Dead-letter queue full, evicting oldest entry"
                );
            }
        }
        debug!(
            message_id = %entry.original_message.id,
            message_type = %entry.original_message.message_type,
            "Dead-lettered: {}", entry.error
        );
        entries.push_back(entry);
        self.total_added.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Most recent `limit` entries, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let entries = self.entries.read().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<DeadLetterEntry> {
        let entries = self.entries.read().await;
        entries.iter().find(|e| e.matches(id)).cloned()
    }

    /// Remove one entry by entry id or original message id
    pub async fn remove(&self, id: &str) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        let pos = entries.iter().position(|e| e.matches(id))?;
        entries.remove(pos)
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn total_added(&self) -> u64 {
        self.total_added.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Replay selected entries (all when `ids` is `None`).
    ///
    /// Each entry gets exactly one `republish` attempt with its message's
    /// retry count reset to zero. An entry is removed only after its own
    /// republish succeeded, so an interrupted or partially failed pass leaves
    /// the unreplayed entries in place and a repeat pass never duplicates
    /// already-replayed ones.
    pub async fn replay_with<F, Fut>(&self, ids: Option<&[String]>, republish: F) -> ReplayReport
    where
        F: Fn(Message) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let selected: Vec<DeadLetterEntry> = {
            let entries = self.entries.read().await;
            match ids {
                Some(ids) => {
                    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                    entries
                        .iter()
                        .filter(|e| {
                            wanted.contains(e.id.as_str())
                                || wanted.contains(e.original_message.id.as_str())
                        })
                        .cloned()
                        .collect()
                }
                None => entries.iter().cloned().collect(),
            }
        };

        let mut report = ReplayReport::default();
        for entry in selected {
            let message = entry.original_message.republish(0);
            match republish(message).await {
                Ok(()) => {
                    self.remove(&entry.id).await;
                    report.replayed_count += 1;
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, "Failed to replay dead letter: {}", e);
                    report.failed_count += 1;
                }
            }
        }
        report
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}
