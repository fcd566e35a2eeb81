//! The atomic store: a single-threaded, in-memory keyed store.
//!
//! All state is owned by one actor task driven by an mpsc command channel;
//! the cloneable [`AtomicStore`] handle sends a command and awaits a oneshot
//! reply. Because every operation passes through the single task, each
//! command executes as one indivisible step relative to all concurrent
//! callers, a whole [`AtomicStore::eval`] script included. That single-threaded
//! execution model is what the admission script's correctness rests on.
//!
//! # Operations
//!
//! - String keys: `get`, `set` (optional TTL), `set_nx` (set-if-absent with
//!   TTL), `incr`, `del`
//! - Atomic scripts: [`AtomicStore::eval`] runs a closure against a
//!   [`ScriptCtx`] spanning any number of keys
//! - Stream operations live in [`crate::stream`] and run on the same actor
//!
//! # Expiry
//!
//! TTLs are enforced lazily: an expired entry is treated as absent and
//! dropped the next time the key is touched. There is no background sweeper.
//!
//! # Failure mode
//!
//! The only infrastructure failure is losing the actor (channel closed),
//! surfaced as [`StoreError::Unavailable`] on every handle method.

use crate::stream::{StreamEntry, StreamEntryId, StreamState};
use flashsale_core::error::StoreError;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Capacity of the command channel between handles and the actor.
const COMMAND_BUFFER: usize = 1024;

/// A stored value: a string or a set of strings.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    /// Plain string value.
    Str(String),
    /// Unordered set of members (the admitted-user set).
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) value: Value,
    pub(crate) expires_at: Option<Instant>,
}

/// All state owned by the actor task.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    entries: HashMap<String, Entry>,
    streams: HashMap<String, StreamState>,
    /// Set when a stream append happened while applying the current command;
    /// the actor turns it into a wake-up for blocked group readers.
    appended: bool,
}

impl StoreState {
    /// Fetch a live entry, dropping it if its TTL has passed.
    fn live_entry(&mut self, key: &str) -> Option<&Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn live_entry_mut(&mut self, key: &str) -> Option<&mut Entry> {
        // Run the expiry check through the shared path first.
        self.live_entry(key)?;
        self.entries.get_mut(key)
    }

    pub(crate) fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_entry(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(Entry { value: Value::Set(_), .. }) => {
                Err(StoreError::WrongType { key: key.to_string() })
            }
        }
    }

    pub(crate) fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key, Entry { value: Value::Str(value), expires_at });
    }

    pub(crate) fn set_nx(&mut self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        if self.live_entry(key).is_some() {
            return false;
        }
        self.set(key.to_string(), value, ttl);
        true
    }

    pub(crate) fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        match self.live_entry_mut(key) {
            None => {
                self.set(key.to_string(), delta.to_string(), None);
                Ok(delta)
            }
            Some(entry) => match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| StoreError::NotAnInteger { key: key.to_string() })?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                Value::Set(_) => Err(StoreError::WrongType { key: key.to_string() }),
            },
        }
    }

    pub(crate) fn del(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn sadd(&mut self, key: &str, member: String) -> Result<bool, StoreError> {
        match self.live_entry_mut(key) {
            None => {
                let mut set = HashSet::new();
                set.insert(member);
                self.entries.insert(
                    key.to_string(),
                    Entry { value: Value::Set(set), expires_at: None },
                );
                Ok(true)
            }
            Some(entry) => match &mut entry.value {
                Value::Set(set) => Ok(set.insert(member)),
                Value::Str(_) => Err(StoreError::WrongType { key: key.to_string() }),
            },
        }
    }

    pub(crate) fn sismember(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        match self.live_entry(key) {
            None => Ok(false),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(Entry { value: Value::Str(_), .. }) => {
                Err(StoreError::WrongType { key: key.to_string() })
            }
        }
    }

    pub(crate) fn xadd(&mut self, stream: &str, fields: Vec<(String, String)>) -> StreamEntryId {
        let id = self
            .streams
            .entry(stream.to_string())
            .or_default()
            .append(fields);
        self.appended = true;
        id
    }

    pub(crate) fn stream_mut(&mut self, stream: &str) -> Option<&mut StreamState> {
        self.streams.get_mut(stream)
    }

    pub(crate) fn create_group(&mut self, stream: &str, group: &str) {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .create_group(group);
    }
}

/// Key-space view handed to atomic scripts.
///
/// A script runs inside the actor task and may touch any number of keys; no
/// other operation can interleave with it. This is the moral equivalent of a
/// server-side evaluated script.
#[derive(Debug)]
pub struct ScriptCtx<'a> {
    state: &'a mut StoreState,
}

impl ScriptCtx<'_> {
    /// Read a string key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongType`] if the key holds a set.
    pub fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.state.get(key)
    }

    /// Write a string key, with optional TTL.
    pub fn set(&mut self, key: &str, value: impl Into<String>, ttl: Option<Duration>) {
        self.state.set(key.to_string(), value.into(), ttl);
    }

    /// Add `delta` to an integer key, creating it at `delta` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotAnInteger`] if the current value does not
    /// parse, or [`StoreError::WrongType`] if the key holds a set.
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.state.incr_by(key, delta)
    }

    /// Delete a key; `true` if it existed.
    pub fn del(&mut self, key: &str) -> bool {
        self.state.del(key)
    }

    /// Add a member to a set key; `true` if it was not already present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongType`] if the key holds a string.
    pub fn sadd(&mut self, key: &str, member: impl Into<String>) -> Result<bool, StoreError> {
        self.state.sadd(key, member.into())
    }

    /// Membership test on a set key; absent keys are empty sets.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WrongType`] if the key holds a string.
    pub fn sismember(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.state.sismember(key, member)
    }

    /// Append an entry to a stream, creating the stream on first use.
    pub fn xadd(&mut self, stream: &str, fields: Vec<(String, String)>) -> StreamEntryId {
        self.state.xadd(stream, fields)
    }
}

type EvalFn = Box<dyn for<'a> FnOnce(&mut ScriptCtx<'a>) + Send>;

pub(crate) enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    SetNx {
        key: String,
        value: String,
        ttl: Option<Duration>,
        reply: oneshot::Sender<bool>,
    },
    Incr {
        key: String,
        reply: oneshot::Sender<Result<i64, StoreError>>,
    },
    Del {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Eval(EvalFn),
    StreamAdd {
        stream: String,
        fields: Vec<(String, String)>,
        reply: oneshot::Sender<StreamEntryId>,
    },
    CreateGroup {
        stream: String,
        group: String,
        reply: oneshot::Sender<()>,
    },
    ReadGroup {
        stream: String,
        group: String,
        consumer: String,
        count: usize,
        reply: oneshot::Sender<Result<Vec<StreamEntry>, StoreError>>,
    },
    Ack {
        stream: String,
        group: String,
        id: StreamEntryId,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    ReadPending {
        stream: String,
        group: String,
        consumer: String,
        count: usize,
        reply: oneshot::Sender<Result<Vec<StreamEntry>, StoreError>>,
    },
}

/// Cloneable handle to the atomic store actor.
///
/// Dropping every handle shuts the actor down; any operation after that
/// fails with [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct AtomicStore {
    pub(crate) tx: mpsc::Sender<Command>,
    /// Signalled by the actor after any command that appended to a stream;
    /// blocked group readers wait on it instead of polling.
    pub(crate) appended: std::sync::Arc<Notify>,
}

impl std::fmt::Debug for AtomicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicStore").finish_non_exhaustive()
    }
}

impl AtomicStore {
    /// Spawn the actor task and return a handle to it.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
        let appended = std::sync::Arc::new(Notify::new());
        let signal = appended.clone();
        tokio::spawn(async move {
            let mut state = StoreState::default();
            debug!("atomic store task started");
            while let Some(cmd) = rx.recv().await {
                apply(&mut state, cmd);
                if std::mem::take(&mut state.appended) {
                    signal.notify_waiters();
                }
            }
            debug!("atomic store task stopped");
        });
        Self { tx, appended }
    }

    pub(crate) async fn send(&self, cmd: Command) -> Result<(), StoreError> {
        self.tx.send(cmd).await.map_err(|_| StoreError::Unavailable)
    }

    /// Read a string key.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone,
    /// [`StoreError::WrongType`] if the key holds a set.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get { key: key.to_string(), reply }).await?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Write a string key, with optional TTL.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Set {
            key: key.to_string(),
            value: value.into(),
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Set-if-absent with optional TTL; `true` if the write happened.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone.
    pub async fn set_nx(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetNx {
            key: key.to_string(),
            value: value.into(),
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Atomically increment an integer key, creating it at 1 if absent.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone,
    /// [`StoreError::NotAnInteger`] / [`StoreError::WrongType`] on a
    /// non-integer value.
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Incr { key: key.to_string(), reply }).await?;
        rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Delete a key; `true` if it existed.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone.
    pub async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Del { key: key.to_string(), reply }).await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Run an atomic script against the store.
    ///
    /// The closure executes inside the actor task: nothing else can observe
    /// or act on intermediate state while it runs. Scripts should be short
    /// and must not block.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the actor is gone. Script-level
    /// failures travel through the closure's own return value.
    pub async fn eval<R, F>(&self, script: F) -> Result<R, StoreError>
    where
        F: for<'a> FnOnce(&mut ScriptCtx<'a>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let task: EvalFn = Box::new(move |ctx| {
            let _ = reply.send(script(ctx));
        });
        self.send(Command::Eval(task)).await?;
        rx.await.map_err(|_| StoreError::Unavailable)
    }
}

fn apply(state: &mut StoreState, cmd: Command) {
    match cmd {
        Command::Get { key, reply } => {
            let _ = reply.send(state.get(&key));
        }
        Command::Set { key, value, ttl, reply } => {
            state.set(key, value, ttl);
            let _ = reply.send(());
        }
        Command::SetNx { key, value, ttl, reply } => {
            let _ = reply.send(state.set_nx(&key, value, ttl));
        }
        Command::Incr { key, reply } => {
            let _ = reply.send(state.incr_by(&key, 1));
        }
        Command::Del { key, reply } => {
            let _ = reply.send(state.del(&key));
        }
        Command::Eval(script) => {
            let mut ctx = ScriptCtx { state };
            script(&mut ctx);
        }
        Command::StreamAdd { stream, fields, reply } => {
            let _ = reply.send(state.xadd(&stream, fields));
        }
        Command::CreateGroup { stream, group, reply } => {
            state.create_group(&stream, &group);
            let _ = reply.send(());
        }
        Command::ReadGroup { stream, group, consumer, count, reply } => {
            let result = match state.stream_mut(&stream) {
                None => Err(StoreError::NoSuchGroup { stream, group }),
                Some(s) => s.read_group(&group, &consumer, count).ok_or_else(|| {
                    StoreError::NoSuchGroup { stream, group }
                }),
            };
            let _ = reply.send(result);
        }
        Command::Ack { stream, group, id, reply } => {
            let result = match state.stream_mut(&stream) {
                None => Err(StoreError::NoSuchGroup { stream, group }),
                Some(s) => s
                    .ack(&group, id)
                    .ok_or_else(|| StoreError::NoSuchGroup { stream, group }),
            };
            let _ = reply.send(result);
        }
        Command::ReadPending { stream, group, consumer, count, reply } => {
            let result = match state.stream_mut(&stream) {
                None => Err(StoreError::NoSuchGroup { stream, group }),
                Some(s) => s.read_pending(&group, &consumer, count).ok_or_else(|| {
                    StoreError::NoSuchGroup { stream, group }
                }),
            };
            let _ = reply.send(result);
        }
    }
}
