//! Durable, ordered, at-least-once order stream with consumer groups.
//!
//! The stream lives inside the atomic store actor, so appends issued from an
//! admission script are atomic with the rest of the script. Consumer-group
//! semantics follow the classic stream shape:
//!
//! - an entry is delivered to exactly one consumer of a group at a time
//! - delivery records the entry in that consumer's **pending set**
//! - [`AtomicStore::ack`] removes it from the pending set
//! - [`AtomicStore::read_pending`] replays delivered-but-unacknowledged
//!   entries after a crash, oldest first
//!
//! A crash between delivery and ack therefore never loses a message: the
//! entry stays pending and the recovery path re-attempts it. Duplicates are
//! possible by design; the materialization transaction deduplicates.
//!
//! Blocking reads are cooperative: a reader that finds nothing parks on a
//! [`tokio::sync::Notify`] signalled by the actor after every append, bounded
//! by the caller's `block` duration. No busy loop.

use crate::kv::{AtomicStore, Command};
use flashsale_core::error::StoreError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::pin::pin;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Error returned when a stream entry id does not parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid stream entry id: {0}")]
pub struct ParseEntryIdError(String);

/// Identifier of one stream entry: `{millis}-{seq}`.
///
/// Ordered by append time; the sequence part disambiguates entries appended
/// within the same millisecond.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamEntryId {
    /// Milliseconds since the Unix epoch at append time.
    pub ms: u64,
    /// Tie-breaker within the millisecond.
    pub seq: u64,
}

impl fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamEntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseEntryIdError(s.to_string()))?;
        let ms = ms.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

/// One entry on the stream: id plus flat string-keyed fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    /// Append-time id.
    pub id: StreamEntryId,
    /// Wire fields (for order messages: `id`, `userId`, `voucherId`).
    pub fields: Vec<(String, String)>,
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest entry id ever handed to this group; `None` means the group
    /// starts from the beginning of the stream.
    last_delivered: Option<StreamEntryId>,
    pending: BTreeMap<StreamEntryId, Pending>,
}

/// Append-only entry log plus per-group delivery state.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    pub(crate) fn append(&mut self, fields: Vec<(String, String)>) -> StreamEntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let id = match self.entries.last() {
            Some(last) if last.id.ms >= now_ms => StreamEntryId {
                ms: last.id.ms,
                seq: last.id.seq + 1,
            },
            _ => StreamEntryId { ms: now_ms, seq: 0 },
        };
        self.entries.push(StreamEntry { id, fields });
        id
    }

    pub(crate) fn create_group(&mut self, group: &str) {
        self.groups.entry(group.to_string()).or_default();
    }

    /// Deliver up to `count` never-delivered entries to `consumer`.
    ///
    /// `None` if the group does not exist.
    pub(crate) fn read_group(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Option<Vec<StreamEntry>> {
        let Self { entries, groups } = self;
        let state = groups.get_mut(group)?;
        let start = match state.last_delivered {
            None => 0,
            Some(last) => match entries.binary_search_by(|e| e.id.cmp(&last)) {
                Ok(i) => i + 1,
                Err(i) => i,
            },
        };
        let delivered: Vec<StreamEntry> = entries
            .iter()
            .skip(start)
            .take(count)
            .cloned()
            .collect();
        for entry in &delivered {
            state.last_delivered = Some(entry.id);
            state.pending.insert(
                entry.id,
                Pending {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                },
            );
        }
        Some(delivered)
    }

    /// Remove an entry from the group's pending set.
    ///
    /// `None` if the group does not exist; `Some(false)` if the entry was not
    /// pending (already acknowledged).
    pub(crate) fn ack(&mut self, group: &str, id: StreamEntryId) -> Option<bool> {
        let state = self.groups.get_mut(group)?;
        Some(state.pending.remove(&id).is_some())
    }

    /// Replay up to `count` of `consumer`'s pending entries, oldest first.
    pub(crate) fn read_pending(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Option<Vec<StreamEntry>> {
        let Self { entries, groups } = self;
        let state = groups.get_mut(group)?;
        let ids: Vec<StreamEntryId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
            .map(|(id, _)| *id)
            .collect();
        let mut replayed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = state.pending.get_mut(&id) {
                p.delivery_count += 1;
            }
            if let Ok(i) = entries.binary_search_by(|e| e.id.cmp(&id)) {
                if let Some(entry) = entries.get(i) {
                    replayed.push(entry.clone());
                }
            }
        }
        Some(replayed)
    }
}

impl AtomicStore {
    /// Append an entry to a stream, creating the stream on first use.
    ///
    /// Returns once the entry is durably enqueued (applied by the actor).
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone.
    pub async fn stream_add(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamEntryId, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StreamAdd {
            stream: stream.to_string(),
            fields,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Create a consumer group on a stream, from the beginning.
    ///
    /// Idempotent; creates the stream itself if it does not exist yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone.
    pub async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateGroup {
            stream: stream.to_string(),
            group: group.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Deliver up to `count` new entries to `consumer` in `group`, blocking
    /// cooperatively up to `block` if nothing is available.
    ///
    /// With `block = None` this is a single non-blocking poll.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone,
    /// [`StoreError::NoSuchGroup`] if the group was never created.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let Some(block) = block else {
            return self.read_group_once(stream, group, consumer, count).await;
        };
        let deadline = Instant::now() + block;
        loop {
            // Arm the wake-up before polling so an append between the poll
            // and the wait cannot be missed.
            let mut notified = pin!(self.appended.notified());
            notified.as_mut().enable();

            let entries = self.read_group_once(stream, group, consumer, count).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn read_group_once(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadGroup {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            count,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Acknowledge an entry, removing it from the group's pending set.
    ///
    /// Returns `false` if the entry was not pending (double ack).
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone,
    /// [`StoreError::NoSuchGroup`] if the group was never created.
    pub async fn ack(
        &self,
        stream: &str,
        group: &str,
        id: StreamEntryId,
    ) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ack {
            stream: stream.to_string(),
            group: group.to_string(),
            id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Replay `consumer`'s delivered-but-unacknowledged entries.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone,
    /// [`StoreError::NoSuchGroup`] if the group was never created.
    pub async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadPending {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            count,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }
}
