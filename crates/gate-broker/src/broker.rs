//! The lock arbiter.
//!
//! A single async mutex serializes every state transition; waiters park on a
//! per-path [`Notify`] and re-check their own entry after each wakeup. All
//! durable writes for one transition go through the store in one transaction
//! before the in-memory state changes, so a store failure leaves the broker
//! exactly where it was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use gate_core::config::BrokerConfig;
use gate_core::protocol::{EntryState, LockMode, OwnerToken, StatusSnapshot};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::audit::AuditEvent;
use crate::queue::{Entry, PathQueue};
use crate::store::{Store, StoreError, StoreOp};

/// How long a reclaimed grant is remembered so a late heartbeat can be told
/// `expired` rather than `not_held`.
const TOMBSTONE_TTL_MS: u64 = 10 * 60 * 1000;

/// Broker shared across server connections and the sweep task.
pub type SharedBroker = Arc<LockBroker>;

/// Epoch milliseconds now.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parameters for an acquire transition.
#[derive(Debug, Clone)]
pub struct AcquireParams {
    /// Canonical path key.
    pub path: String,
    /// Requested mode.
    pub mode: LockMode,
    /// Requesting owner.
    pub owner: OwnerToken,
    /// Correlation id.
    pub request_id: String,
    /// Client-side wait bound; broker default when `None`. Always finite.
    pub timeout_ms: Option<u64>,
    /// Per-entry lease override.
    pub lease_ms: Option<u64>,
    /// Per-entry cap override.
    pub max_hold_ms: Option<u64>,
}

/// Outcome of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireReply {
    /// The lock is held (fresh grant or re-entrant increment).
    Granted,
    /// The wait elapsed; the entry was removed.
    Timeout,
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReply {
    /// One hold dropped.
    Released,
    /// No granted entry matched.
    NotHeld,
}

/// Outcome of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReply {
    /// Lease refreshed.
    Ok,
    /// No granted entry matched, and no recent expiry is on record.
    NotHeld,
    /// The sweep reclaimed the entry.
    Expired,
}

/// Counters from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Grants reclaimed because their lease lapsed.
    pub lease_expired: usize,
    /// Grants reclaimed at the absolute hold cap.
    pub force_expired: usize,
}

#[derive(Default)]
struct PathState {
    queue: PathQueue,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone, Copy)]
enum TombstoneKind {
    Lease,
    Cap,
}

struct Tombstone {
    kind: TombstoneKind,
    at_ms: u64,
}

struct BrokerState {
    store: Store,
    paths: HashMap<String, PathState>,
    tombstones: HashMap<(String, OwnerToken), Tombstone>,
    next_seq: i64,
}

/// The FIFO lock broker. See the module docs for the locking discipline.
pub struct LockBroker {
    state: Mutex<BrokerState>,
    lease_ms: u64,
    max_hold_ms: u64,
    acquire_timeout_ms: u64,
    audit_retention_ms: u64,
}

impl LockBroker {
    /// Open the durable store under `config.state_dir` and recover persisted
    /// entries: waiting entries rejoin their queues, granted entries stay
    /// granted with a fresh heartbeat grace so reconnecting clients can
    /// resume (or the sweep reclaims them).
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or recovery writes
    /// fail.
    pub fn open(config: &BrokerConfig) -> Result<Self, StoreError> {
        let store = Store::open(&config.db_path())?;
        Self::from_store(store, config)
    }

    /// Build a broker over an already-open store. Used by tests to exercise
    /// recovery against in-memory or pre-seeded databases.
    ///
    /// # Errors
    ///
    /// Returns an error when recovery reads or writes fail.
    pub fn from_store(mut store: Store, config: &BrokerConfig) -> Result<Self, StoreError> {
        let now = now_ms();
        let recovered = store.load_all()?;
        let next_seq = store.max_seq()?;

        // Grace period: recovered grants get a fresh heartbeat so their
        // holders have one full lease to reconnect.
        let grace_ops: Vec<StoreOp> = recovered
            .iter()
            .filter(|r| r.entry.state == EntryState::Granted)
            .map(|r| StoreOp::Heartbeat {
                seq: r.entry.seq,
                now_ms: now,
            })
            .collect();
        if !grace_ops.is_empty() {
            store.apply(&grace_ops)?;
        }

        let mut paths: HashMap<String, PathState> = HashMap::new();
        let mut waiting = 0usize;
        let mut granted = 0usize;
        for mut rec in recovered {
            if rec.entry.state == EntryState::Granted {
                rec.entry.last_heartbeat_ms = Some(now);
                granted += 1;
            } else {
                waiting += 1;
            }
            paths
                .entry(rec.path)
                .or_default()
                .queue
                .restore(rec.entry);
        }

        info!(waiting, granted, next_seq, "broker state recovered");

        let mut state = BrokerState {
            store,
            paths,
            tombstones: HashMap::new(),
            next_seq,
        };

        // A crash can land between a removal and the promotions it enables;
        // re-evaluating every queue on startup closes that window.
        let path_keys: Vec<String> = state.paths.keys().cloned().collect();
        for path in path_keys {
            promote_locked(&mut state, &path, now)?;
        }

        Ok(Self {
            state: Mutex::new(state),
            lease_ms: config.lease_ms,
            max_hold_ms: config.max_hold_ms,
            acquire_timeout_ms: config.acquire_timeout_ms,
            audit_retention_ms: config.audit_retention_hours.saturating_mul(3_600_000),
        })
    }

    /// The default lease window, for sweeper/server wiring.
    #[must_use]
    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    /// Acquire a lock, blocking until grant or the (always finite) timeout.
    ///
    /// Re-entrant calls — same owner, same path, held mode covering the
    /// requested mode — increment the hold count instead of queueing.
    ///
    /// # Errors
    ///
    /// Returns a store error when the durable write fails; the queue is
    /// unchanged in that case.
    pub async fn acquire(&self, params: AcquireParams) -> Result<AcquireReply, StoreError> {
        let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(self.acquire_timeout_ms));
        let deadline = Instant::now() + timeout;
        let lease_ms = params.lease_ms.unwrap_or(self.lease_ms);
        let max_hold_ms = params.max_hold_ms.unwrap_or(self.max_hold_ms);

        // Enqueue (or re-enter, or grant immediately).
        let (seq, notify) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = now_ms();
            let path_state = state.paths.entry(params.path.clone()).or_default();

            let reentrant = path_state
                .queue
                .granted_by(&params.owner)
                .filter(|e| e.mode.covers(params.mode))
                .map(|e| (e.seq, e.hold_count));
            if let Some((seq, held)) = reentrant {
                let hold_count = held + 1;
                state.store.apply(&[
                    StoreOp::SetHoldCount { seq, hold_count },
                    audit(now, AuditEvent::Grant, &params.path, &params.owner, params.mode),
                ])?;
                if let Some(entry) = path_state.queue.get_mut(seq) {
                    entry.hold_count = hold_count;
                }
                debug!(
                    path = %params.path,
                    owner = %params.owner,
                    hold_count,
                    "re-entrant acquire"
                );
                return Ok(AcquireReply::Granted);
            }

            let seq = state.next_seq + 1;
            let entry = Entry {
                seq,
                request_id: params.request_id.clone(),
                owner: params.owner.clone(),
                mode: params.mode,
                state: EntryState::Waiting,
                hold_count: 1,
                enqueued_at_ms: now,
                granted_at_ms: None,
                last_heartbeat_ms: None,
                lease_ms,
                max_hold_ms,
            };

            if path_state.queue.would_grant(params.mode) {
                state.store.apply(&[
                    StoreOp::Insert {
                        path: params.path.clone(),
                        entry: entry.clone(),
                    },
                    audit(now, AuditEvent::Enqueue, &params.path, &params.owner, params.mode),
                    StoreOp::Grant { seq, now_ms: now },
                    audit(now, AuditEvent::Grant, &params.path, &params.owner, params.mode),
                ])?;
                state.next_seq = seq;
                path_state.queue.push(entry);
                path_state.queue.grant(seq, now);
                debug!(path = %params.path, owner = %params.owner, mode = %params.mode, "granted");
                return Ok(AcquireReply::Granted);
            }

            state.store.apply(&[
                StoreOp::Insert {
                    path: params.path.clone(),
                    entry: entry.clone(),
                },
                audit(now, AuditEvent::Enqueue, &params.path, &params.owner, params.mode),
            ])?;
            state.next_seq = seq;
            path_state.queue.push(entry);
            debug!(path = %params.path, owner = %params.owner, mode = %params.mode, "queued");
            (seq, Arc::clone(&path_state.notify))
        };

        // Park until promoted or out of time.
        loop {
            let notified = notify.notified();

            {
                let guard = self.state.lock().await;
                if let Some(path_state) = guard.paths.get(&params.path) {
                    match path_state.queue.get(seq).map(|e| e.state) {
                        Some(EntryState::Granted) => return Ok(AcquireReply::Granted),
                        Some(EntryState::Waiting) => {}
                        // Waiting entries are only removed by their own
                        // acquire call, so a missing entry means the queue
                        // was rebuilt under us; give up cleanly.
                        None => return Ok(AcquireReply::Timeout),
                    }
                } else {
                    return Ok(AcquireReply::Timeout);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }

        // Timed out: pull the waiting entry, which may unblock successors.
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = now_ms();
        let Some(path_state) = state.paths.get_mut(&params.path) else {
            return Ok(AcquireReply::Timeout);
        };
        match path_state.queue.get(seq).map(|e| e.state) {
            // Promotion won the race against the deadline.
            Some(EntryState::Granted) => return Ok(AcquireReply::Granted),
            Some(EntryState::Waiting) => {}
            None => return Ok(AcquireReply::Timeout),
        }

        let mut ops = vec![StoreOp::Remove { seq }];
        let promoted = grant_ops(&path_state.queue, &params.path, &[seq], now, &mut ops);
        state.store.apply(&ops)?;
        path_state.queue.remove(seq);
        for seq in promoted {
            path_state.queue.grant(seq, now);
        }
        path_state.notify.notify_waiters();
        if path_state.queue.is_empty() {
            state.paths.remove(&params.path);
        }
        debug!(path = %params.path, owner = %params.owner, "acquire timed out");
        Ok(AcquireReply::Timeout)
    }

    /// Drop one hold; on the last hold, remove the entry and promote
    /// successors in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns a store error when the durable write fails.
    pub async fn release(
        &self,
        path: &str,
        owner: &OwnerToken,
    ) -> Result<ReleaseReply, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = now_ms();

        let Some(path_state) = state.paths.get_mut(path) else {
            return Ok(ReleaseReply::NotHeld);
        };
        let Some((seq, mode, hold_count)) = path_state
            .queue
            .granted_by(owner)
            .map(|e| (e.seq, e.mode, e.hold_count))
        else {
            return Ok(ReleaseReply::NotHeld);
        };

        if hold_count > 1 {
            let hold_count = hold_count - 1;
            state.store.apply(&[
                StoreOp::SetHoldCount { seq, hold_count },
                audit(now, AuditEvent::Release, path, owner, mode),
            ])?;
            if let Some(entry) = path_state.queue.get_mut(seq) {
                entry.hold_count = hold_count;
            }
            debug!(path, owner = %owner, hold_count, "hold released");
            return Ok(ReleaseReply::Released);
        }

        let mut ops = vec![
            StoreOp::Remove { seq },
            audit(now, AuditEvent::Release, path, owner, mode),
        ];
        let promoted = grant_ops(&path_state.queue, path, &[seq], now, &mut ops);
        state.store.apply(&ops)?;
        path_state.queue.remove(seq);
        for seq in promoted {
            path_state.queue.grant(seq, now);
        }
        path_state.notify.notify_waiters();
        if path_state.queue.is_empty() {
            state.paths.remove(path);
        }
        debug!(path, owner = %owner, "released");
        Ok(ReleaseReply::Released)
    }

    /// Refresh the lease on a granted entry.
    ///
    /// # Errors
    ///
    /// Returns a store error when the durable write fails.
    pub async fn heartbeat(
        &self,
        path: &str,
        owner: &OwnerToken,
    ) -> Result<HeartbeatReply, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = now_ms();

        if let Some(path_state) = state.paths.get_mut(path) {
            if let Some((seq, mode)) = path_state
                .queue
                .granted_by(owner)
                .map(|e| (e.seq, e.mode))
            {
                state.store.apply(&[
                    StoreOp::Heartbeat { seq, now_ms: now },
                    audit(now, AuditEvent::Heartbeat, path, owner, mode),
                ])?;
                if let Some(entry) = path_state.queue.get_mut(seq) {
                    entry.last_heartbeat_ms = Some(now);
                }
                return Ok(HeartbeatReply::Ok);
            }
        }

        let key = (path.to_string(), owner.clone());
        if let Some(tombstone) = state.tombstones.get(&key) {
            debug!(path, owner = %owner, kind = ?tombstone.kind, "heartbeat after expiry");
            return Ok(HeartbeatReply::Expired);
        }
        Ok(HeartbeatReply::NotHeld)
    }

    /// Snapshot queue contents, optionally restricted to one path.
    pub async fn status(&self, path: Option<&str>) -> StatusSnapshot {
        let guard = self.state.lock().await;
        let mut snapshot = StatusSnapshot::default();
        for (key, path_state) in &guard.paths {
            if path.is_some_and(|p| p != key.as_str()) {
                continue;
            }
            if !path_state.queue.is_empty() {
                snapshot
                    .paths
                    .insert(key.clone(), path_state.queue.snapshots());
            }
        }
        snapshot
    }

    /// One sweep pass at the current time.
    ///
    /// # Errors
    ///
    /// Returns a store error when a reclaim write fails; remaining paths are
    /// still swept on the next pass.
    pub async fn sweep_once(&self) -> Result<SweepStats, StoreError> {
        self.sweep_at(now_ms()).await
    }

    /// One sweep pass at an explicit time (timestamps still advance on the
    /// real clock; this exists so tests can push the clock past a lease).
    ///
    /// # Errors
    ///
    /// Returns a store error when a reclaim write fails.
    pub async fn sweep_at(&self, now: u64) -> Result<SweepStats, StoreError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut stats = SweepStats::default();

        let path_keys: Vec<String> = state.paths.keys().cloned().collect();
        for path in path_keys {
            let Some(path_state) = state.paths.get_mut(&path) else {
                continue;
            };

            let mut removals: Vec<(i64, OwnerToken, LockMode, TombstoneKind)> = Vec::new();
            for entry in path_state.queue.entries() {
                if entry.state != EntryState::Granted {
                    continue;
                }
                if entry.lease_expired(now) {
                    removals.push((entry.seq, entry.owner.clone(), entry.mode, TombstoneKind::Lease));
                } else if entry.cap_expired(now) {
                    removals.push((entry.seq, entry.owner.clone(), entry.mode, TombstoneKind::Cap));
                }
            }
            if removals.is_empty() {
                continue;
            }

            let removed_seqs: Vec<i64> = removals.iter().map(|(seq, ..)| *seq).collect();
            let mut ops = Vec::new();
            for (seq, owner, mode, kind) in &removals {
                ops.push(StoreOp::Remove { seq: *seq });
                let event = match kind {
                    TombstoneKind::Lease => AuditEvent::Expire,
                    TombstoneKind::Cap => AuditEvent::ForceExpire,
                };
                ops.push(audit(now, event, &path, owner, *mode));
            }
            let promoted = grant_ops(&path_state.queue, &path, &removed_seqs, now, &mut ops);
            state.store.apply(&ops)?;

            for (seq, owner, mode, kind) in removals {
                path_state.queue.remove(seq);
                match kind {
                    TombstoneKind::Lease => stats.lease_expired += 1,
                    TombstoneKind::Cap => stats.force_expired += 1,
                }
                warn!(
                    path = %path,
                    owner = %owner,
                    mode = %mode,
                    kind = ?kind,
                    "granted lock reclaimed"
                );
                state.tombstones.insert(
                    (path.clone(), owner),
                    Tombstone { kind, at_ms: now },
                );
            }
            for seq in promoted {
                path_state.queue.grant(seq, now);
            }
            path_state.notify.notify_waiters();
            if path_state.queue.is_empty() {
                state.paths.remove(&path);
            }
        }

        state
            .tombstones
            .retain(|_, t| now.saturating_sub(t.at_ms) < TOMBSTONE_TTL_MS);

        let retention_floor = now.saturating_sub(self.audit_retention_ms);
        if retention_floor > 0 {
            let pruned = state.store.prune_audit(retention_floor)?;
            if pruned > 0 {
                debug!(pruned, "audit rows pruned");
            }
        }

        Ok(stats)
    }
}

fn audit(
    at_ms: u64,
    event: AuditEvent,
    path: &str,
    owner: &OwnerToken,
    mode: LockMode,
) -> StoreOp {
    StoreOp::Audit {
        at_ms,
        event,
        path: path.to_string(),
        owner: owner.clone(),
        mode,
    }
}

/// Append `Grant` + audit ops for everything promotable once `removed` are
/// gone; returns the promoted sequence numbers for the in-memory follow-up.
fn grant_ops(
    queue: &PathQueue,
    path: &str,
    removed: &[i64],
    now: u64,
    ops: &mut Vec<StoreOp>,
) -> Vec<i64> {
    let promoted = queue.promotable_excluding(removed);
    for seq in &promoted {
        if let Some(entry) = queue.get(*seq) {
            ops.push(StoreOp::Grant {
                seq: *seq,
                now_ms: now,
            });
            ops.push(audit(now, AuditEvent::Grant, path, &entry.owner, entry.mode));
        }
    }
    promoted
}

/// Promote everything grantable on `path`, persisting first. Used by
/// recovery to close the removal/promotion crash window.
fn promote_locked(state: &mut BrokerState, path: &str, now: u64) -> Result<(), StoreError> {
    let Some(path_state) = state.paths.get_mut(path) else {
        return Ok(());
    };
    let mut ops = Vec::new();
    let promoted = grant_ops(&path_state.queue, path, &[], now, &mut ops);
    if promoted.is_empty() {
        return Ok(());
    }
    state.store.apply(&ops)?;
    for seq in promoted {
        path_state.queue.grant(seq, now);
    }
    path_state.notify.notify_waiters();
    Ok(())
}
