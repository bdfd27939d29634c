//! In-memory broker.
//!
//! Implements the full consumer-group contract inside a single process:
//! positions, pending entries per consumer, idle claiming and expiring lists.
//! Several buses sharing one `MemoryBroker` behave like separate processes
//! sharing one broker, which is what the integration tests rely on.
//!
//! Streams keep every entry unless a maximum length is set, in which case the
//! oldest entries are trimmed on append together with any pending entries
//! that point at them.
//!
//! `set_available(false)` simulates a broker outage: every operation fails
//! with `BrokerError::Unavailable` until the broker is made available again.
//! Stored data survives the outage.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::{Broker, BrokerError, Delivery, ReadFrom, Result, StartFrom};
use crate::codec::Fields;
use crate::message::Position;

struct Entry {
    position: Position,
    fields: Fields,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    last_delivered: Position,
    pending: BTreeMap<Position, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<Entry>,
    last: Position,
    groups: HashMap<String, Group>,
}

struct List {
    items: VecDeque<Vec<u8>>,
    expires_at: Instant,
}

struct Value {
    payload: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    lists: HashMap<String, List>,
    values: HashMap<String, Value>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// In-process broker with consumer-group semantics.
pub struct MemoryBroker {
    state: Mutex<State>,
    /// Woken on every append/push so blocked readers re-check.
    notify: Notify,
    available: AtomicBool,
    max_len: Option<usize>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker whose streams are never trimmed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            max_len: None,
        }
    }

    /// Broker that keeps at most `max_len` entries per stream (0 keeps all).
    pub fn with_stream_max_len(max_len: usize) -> Self {
        Self {
            max_len: (max_len > 0).then_some(max_len),
            ..Self::new()
        }
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            warn!("Memory broker marked unavailable");
        }
        self.notify.notify_waiters();
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of entries currently retained in a stream.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Number of entries delivered to `group` but not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is offline".to_string()))
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Drop the oldest entries beyond `max_len`, and every group's pending
    /// entries that point at them.
    fn trim(stream: &mut Stream, max_len: usize) {
        let excess = stream.entries.len().saturating_sub(max_len);
        if excess == 0 {
            return;
        }
        let cut = stream.entries[excess - 1].position;
        stream.entries.drain(..excess);
        for group in stream.groups.values_mut() {
            group.pending.retain(|position, _| *position > cut);
        }
    }

    fn collect(
        state: &mut State,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        for name in streams {
            if out.len() >= count {
                break;
            }
            let stream = state.streams.get_mut(name).ok_or_else(|| BrokerError::NoGroup {
                stream: name.clone(),
                group: group.to_string(),
            })?;
            let Stream {
                entries, groups, ..
            } = stream;
            let grp = groups.get_mut(group).ok_or_else(|| BrokerError::NoGroup {
                stream: name.clone(),
                group: group.to_string(),
            })?;

            match from {
                ReadFrom::Pending(after) => {
                    let range = (Bound::Excluded(after), Bound::Unbounded);
                    for (position, pending) in grp.pending.range_mut(range) {
                        if out.len() >= count {
                            break;
                        }
                        if pending.consumer != consumer {
                            continue;
                        }
                        if let Ok(i) = entries.binary_search_by(|e| e.position.cmp(position)) {
                            pending.delivered_at = Instant::now();
                            out.push(Delivery {
                                stream: name.clone(),
                                position: *position,
                                fields: entries[i].fields.clone(),
                            });
                        }
                    }
                }
                ReadFrom::New => {
                    let start = entries.partition_point(|e| e.position <= grp.last_delivered);
                    for entry in entries[start..].iter() {
                        if out.len() >= count {
                            break;
                        }
                        grp.last_delivered = entry.position;
                        grp.pending.insert(
                            entry.position,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                            },
                        );
                        out.push(Delivery {
                            stream: name.clone(),
                            position: entry.position,
                            fields: entry.fields.clone(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<Position> {
        self.check_available()?;
        let position = {
            let mut state = self.state.lock().await;
            let s = state.streams.entry(stream.to_string()).or_default();
            let position = s.last.successor(Self::now_millis());
            s.last = position;
            s.entries.push(Entry { position, fields });
            if let Some(max_len) = self.max_len {
                Self::trim(s, max_len);
            }
            position
        };
        debug!(stream = %stream, position = %position, "Appended to memory stream");
        self.notify.notify_waiters();
        Ok(position)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let s = state.streams.entry(stream.to_string()).or_default();
        let last = s.last;
        s.groups.entry(group.to_string()).or_insert_with(|| Group {
            last_delivered: match start {
                StartFrom::Latest => last,
                StartFrom::Beginning => Position::ZERO,
            },
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let deliveries = {
                let mut state = self.state.lock().await;
                Self::collect(&mut state, streams, group, consumer, from, count)?
            };
            let pending = matches!(from, ReadFrom::Pending(_));
            if !deliveries.is_empty() || pending || block.is_zero() {
                return Ok(deliveries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, position: Position) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(&position);
        }
        Ok(())
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Stream {
            entries, groups, ..
        } = s;
        let Some(g) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let claimable: Vec<Position> = g
            .pending
            .iter()
            .filter(|(_, p)| p.consumer != consumer && p.delivered_at.elapsed() >= min_idle)
            .map(|(position, _)| *position)
            .take(count)
            .collect();

        let mut out = Vec::new();
        for position in claimable {
            if let Some(p) = g.pending.get_mut(&position) {
                p.consumer = consumer.to_string();
                p.delivered_at = Instant::now();
            }
            if let Ok(i) = entries.binary_search_by(|e| e.position.cmp(&position)) {
                out.push(Delivery {
                    stream: stream.to_string(),
                    position,
                    fields: entries[i].fields.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn push(&self, list: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_available()?;
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let entry = state.lists.entry(list.to_string()).or_insert_with(|| List {
                items: VecDeque::new(),
                expires_at: now + ttl,
            });
            if entry.expires_at <= now {
                entry.items.clear();
            }
            entry.items.push_back(payload);
            entry.expires_at = now + ttl;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, list: &str, block: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            {
                let mut state = self.state.lock().await;
                let expired = state
                    .lists
                    .get(list)
                    .is_some_and(|entry| entry.expires_at <= Instant::now());
                if expired {
                    state.lists.remove(list);
                } else if let Some(payload) =
                    state.lists.get_mut(list).and_then(|e| e.items.pop_front())
                {
                    return Ok(Some(payload));
                }
            }
            if block.is_zero() {
                return Ok(None);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn set_value(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_string(),
            Value {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let expired = state
            .values
            .get(key)
            .is_some_and(|value| value.expires_at <= Instant::now());
        if expired {
            state.values.remove(key);
            return Ok(None);
        }
        Ok(state.values.get(key).map(|value| value.payload.clone()))
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(members) = state.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}
