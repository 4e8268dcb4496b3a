//! Per-path FIFO queue state and grant evaluation.
//!
//! This module is pure bookkeeping: no I/O, no clocks, no persistence. The
//! broker applies the transitions computed here to the durable store first
//! and to this state second, so everything here is infallible.
//!
//! Invariants maintained per path:
//!
//! - Entries are ordered by their broker-assigned sequence number, and the
//!   granted entries always form a contiguous prefix of that order.
//! - The granted prefix is a single `write` entry or one-or-more `read`
//!   entries.
//! - A waiting `write` at the head of the waiting suffix blocks every later
//!   entry, readers included.

use gate_core::protocol::{EntrySnapshot, EntryState, LockMode, OwnerToken};

/// One queue entry, waiting or granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Broker-assigned sequence number; total grant order within a path.
    pub seq: i64,
    /// Client correlation id.
    pub request_id: String,
    /// Requesting owner.
    pub owner: OwnerToken,
    /// Requested mode.
    pub mode: LockMode,
    /// Waiting or granted.
    pub state: EntryState,
    /// Re-entrant hold count; meaningful only once granted.
    pub hold_count: u32,
    /// Enqueue timestamp (epoch ms).
    pub enqueued_at_ms: u64,
    /// Grant timestamp (epoch ms); `None` while waiting.
    pub granted_at_ms: Option<u64>,
    /// Last heartbeat timestamp (epoch ms); `None` while waiting.
    pub last_heartbeat_ms: Option<u64>,
    /// Lease window for this entry.
    pub lease_ms: u64,
    /// Absolute hold cap for this entry.
    pub max_hold_ms: u64,
}

impl Entry {
    /// Lease expiry instant, if granted.
    #[must_use]
    pub fn lease_expires_at_ms(&self) -> Option<u64> {
        self.last_heartbeat_ms
            .map(|hb| hb.saturating_add(self.lease_ms))
    }

    /// Whether the lease has lapsed at `now_ms`.
    #[must_use]
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        self.lease_expires_at_ms().is_some_and(|at| now_ms > at)
    }

    /// Whether the absolute hold cap has been reached at `now_ms`.
    #[must_use]
    pub fn cap_expired(&self, now_ms: u64) -> bool {
        self.granted_at_ms
            .is_some_and(|at| now_ms.saturating_sub(at) > self.max_hold_ms)
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            request_id: self.request_id.clone(),
            owner: self.owner.clone(),
            mode: self.mode,
            state: self.state,
            hold_count: self.hold_count,
            enqueued_at_ms: self.enqueued_at_ms,
            granted_at_ms: self.granted_at_ms,
            lease_expires_at_ms: self.lease_expires_at_ms(),
        }
    }
}

/// The ordered queue for one path.
#[derive(Debug, Default)]
pub struct PathQueue {
    entries: Vec<Entry>,
}

impl PathQueue {
    /// Whether the queue holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in queue order.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Append a waiting entry. Sequence numbers are assigned by the broker in
    /// arrival order, so appending preserves queue order.
    pub fn push(&mut self, entry: Entry) {
        debug_assert!(self.entries.last().map_or(true, |last| last.seq < entry.seq));
        self.entries.push(entry);
    }

    /// Restore an entry during recovery, keeping the vector ordered by seq.
    pub fn restore(&mut self, entry: Entry) {
        let at = self
            .entries
            .partition_point(|e| e.seq < entry.seq);
        self.entries.insert(at, entry);
    }

    /// The granted entry held by `owner`, if any.
    #[must_use]
    pub fn granted_by(&self, owner: &OwnerToken) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.state == EntryState::Granted && &e.owner == owner)
    }

    /// Mutable variant of [`PathQueue::granted_by`].
    pub fn granted_by_mut(&mut self, owner: &OwnerToken) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.state == EntryState::Granted && &e.owner == owner)
    }

    /// The granted entry whose mode already covers a re-entrant request.
    ///
    /// A `write` holder re-enters with either mode; a `read` holder re-enters
    /// only with `read`. A `write` request against a held `read` is a lock
    /// upgrade and queues as a fresh entry instead.
    #[must_use]
    pub fn reentrant_target(&self, owner: &OwnerToken, mode: LockMode) -> Option<i64> {
        self.granted_by(owner)
            .filter(|e| e.mode.covers(mode))
            .map(|e| e.seq)
    }

    /// The entry with sequence number `seq`.
    #[must_use]
    pub fn get(&self, seq: i64) -> Option<&Entry> {
        self.entries.iter().find(|e| e.seq == seq)
    }

    /// Mutable variant of [`PathQueue::get`].
    pub fn get_mut(&mut self, seq: i64) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.seq == seq)
    }

    /// Remove the entry with sequence number `seq`, returning it.
    pub fn remove(&mut self, seq: i64) -> Option<Entry> {
        let at = self.entries.iter().position(|e| e.seq == seq)?;
        Some(self.entries.remove(at))
    }

    /// Whether a brand-new request appended right now would be grantable
    /// immediately: no one is waiting ahead of it, and the granted prefix is
    /// compatible (`read` joins granted readers; `write` needs the queue
    /// empty).
    #[must_use]
    pub fn would_grant(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Write => self.entries.is_empty(),
            LockMode::Read => self
                .entries
                .iter()
                .all(|e| e.state == EntryState::Granted && e.mode == LockMode::Read),
        }
    }

    /// Sequence numbers of every waiting entry that is grantable right now,
    /// in grant order.
    ///
    /// - Empty granted prefix, head of the waiting suffix is `write`: that
    ///   single writer.
    /// - Granted prefix empty or all reads, head is `read`: every consecutive
    ///   reader up to (not past) the next queued writer, promoted together.
    /// - Granted prefix contains a writer, or head is `write` behind live
    ///   readers: nothing.
    #[must_use]
    pub fn promotable(&self) -> Vec<i64> {
        self.promotable_excluding(&[])
    }

    /// [`PathQueue::promotable`] computed as if the entries in `removed` were
    /// already gone. Lets a release/timeout/expiry transition persist the
    /// removal and the promotions it enables in one store transaction.
    #[must_use]
    pub fn promotable_excluding(&self, removed: &[i64]) -> Vec<i64> {
        let mut live = self
            .entries
            .iter()
            .filter(|e| !removed.contains(&e.seq));

        let mut granted_any = false;
        let mut granted_writer = false;
        let mut head = None;
        for e in live.by_ref() {
            if e.state == EntryState::Granted {
                granted_any = true;
                granted_writer |= e.mode == LockMode::Write;
            } else {
                head = Some(e);
                break;
            }
        }

        let Some(head) = head else {
            return Vec::new();
        };
        if granted_writer {
            return Vec::new();
        }

        match head.mode {
            LockMode::Write => {
                if granted_any {
                    Vec::new()
                } else {
                    vec![head.seq]
                }
            }
            LockMode::Read => {
                let mut seqs = vec![head.seq];
                for e in live {
                    if e.mode == LockMode::Write {
                        break;
                    }
                    seqs.push(e.seq);
                }
                seqs
            }
        }
    }

    /// Mark `seq` granted with the given timestamps.
    pub fn grant(&mut self, seq: i64, now_ms: u64) {
        if let Some(entry) = self.get_mut(seq) {
            entry.state = EntryState::Granted;
            entry.granted_at_ms = Some(now_ms);
            entry.last_heartbeat_ms = Some(now_ms);
        }
    }

    /// Snapshots of all entries, in queue order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.entries.iter().map(Entry::snapshot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: i64, owner: &str, mode: LockMode) -> Entry {
        Entry {
            seq,
            request_id: format!("req-{seq}"),
            owner: OwnerToken::from(owner),
            mode,
            state: EntryState::Waiting,
            hold_count: 1,
            enqueued_at_ms: 1_000 + u64::try_from(seq).unwrap(),
            granted_at_ms: None,
            last_heartbeat_ms: None,
            lease_ms: 30_000,
            max_hold_ms: 3_600_000,
        }
    }

    fn granted(seq: i64, owner: &str, mode: LockMode) -> Entry {
        let mut e = entry(seq, owner, mode);
        e.state = EntryState::Granted;
        e.granted_at_ms = Some(2_000);
        e.last_heartbeat_ms = Some(2_000);
        e
    }

    #[test]
    fn lone_writer_is_promotable() {
        let mut q = PathQueue::default();
        q.push(entry(1, "a", LockMode::Write));
        assert_eq!(q.promotable(), vec![1]);
    }

    #[test]
    fn reader_burst_promotes_together() {
        let mut q = PathQueue::default();
        q.push(entry(1, "a", LockMode::Read));
        q.push(entry(2, "b", LockMode::Read));
        q.push(entry(3, "c", LockMode::Read));
        assert_eq!(q.promotable(), vec![1, 2, 3]);
    }

    #[test]
    fn readers_do_not_pass_a_queued_writer() {
        let mut q = PathQueue::default();
        q.push(entry(1, "a", LockMode::Read));
        q.push(entry(2, "w", LockMode::Write));
        q.push(entry(3, "c", LockMode::Read));
        // Only the head reader; the writer fences the reader behind it.
        assert_eq!(q.promotable(), vec![1]);
    }

    #[test]
    fn writer_waits_for_granted_readers_to_drain() {
        let mut q = PathQueue::default();
        q.push(granted(1, "a", LockMode::Read));
        q.push(entry(2, "w", LockMode::Write));
        assert!(q.promotable().is_empty());

        q.remove(1);
        assert_eq!(q.promotable(), vec![2]);
    }

    #[test]
    fn nothing_promotes_past_a_granted_writer() {
        let mut q = PathQueue::default();
        q.push(granted(1, "w", LockMode::Write));
        q.push(entry(2, "a", LockMode::Read));
        q.push(entry(3, "b", LockMode::Write));
        assert!(q.promotable().is_empty());
    }

    #[test]
    fn later_readers_join_granted_readers() {
        let mut q = PathQueue::default();
        q.push(granted(1, "a", LockMode::Read));
        q.push(entry(2, "b", LockMode::Read));
        assert_eq!(q.promotable(), vec![2]);
    }

    #[test]
    fn timed_out_writer_unblocks_readers_behind_it() {
        let mut q = PathQueue::default();
        q.push(granted(1, "a", LockMode::Read));
        q.push(entry(2, "w", LockMode::Write));
        q.push(entry(3, "c", LockMode::Read));
        assert!(q.promotable().is_empty());

        // The queued writer gives up; the trailing reader may now share.
        q.remove(2);
        assert_eq!(q.promotable(), vec![3]);
    }

    #[test]
    fn reentrant_target_is_mode_aware() {
        let mut q = PathQueue::default();
        q.push(granted(1, "o", LockMode::Write));
        assert_eq!(q.reentrant_target(&OwnerToken::from("o"), LockMode::Read), Some(1));
        assert_eq!(q.reentrant_target(&OwnerToken::from("o"), LockMode::Write), Some(1));
        assert_eq!(q.reentrant_target(&OwnerToken::from("x"), LockMode::Read), None);

        let mut q = PathQueue::default();
        q.push(granted(1, "o", LockMode::Read));
        assert_eq!(q.reentrant_target(&OwnerToken::from("o"), LockMode::Read), Some(1));
        // Upgrade is not re-entrant.
        assert_eq!(q.reentrant_target(&OwnerToken::from("o"), LockMode::Write), None);
    }

    #[test]
    fn grant_stamps_timestamps() {
        let mut q = PathQueue::default();
        q.push(entry(1, "a", LockMode::Write));
        q.grant(1, 5_000);
        let e = q.get(1).unwrap();
        assert_eq!(e.state, EntryState::Granted);
        assert_eq!(e.granted_at_ms, Some(5_000));
        assert_eq!(e.last_heartbeat_ms, Some(5_000));
        assert_eq!(e.lease_expires_at_ms(), Some(35_000));
    }

    #[test]
    fn restore_keeps_seq_order() {
        let mut q = PathQueue::default();
        q.restore(entry(3, "c", LockMode::Read));
        q.restore(granted(1, "a", LockMode::Write));
        q.restore(entry(2, "b", LockMode::Read));
        let seqs: Vec<i64> = q.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn would_grant_matches_append_semantics() {
        let mut q = PathQueue::default();
        assert!(q.would_grant(LockMode::Read));
        assert!(q.would_grant(LockMode::Write));

        q.push(granted(1, "a", LockMode::Read));
        assert!(q.would_grant(LockMode::Read));
        assert!(!q.would_grant(LockMode::Write));

        q.push(entry(2, "w", LockMode::Write));
        // A waiting writer fences every later arrival.
        assert!(!q.would_grant(LockMode::Read));
        assert!(!q.would_grant(LockMode::Write));
    }

    #[test]
    fn promotable_excluding_simulates_removal() {
        let mut q = PathQueue::default();
        q.push(granted(1, "a", LockMode::Write));
        q.push(entry(2, "b", LockMode::Read));
        q.push(entry(3, "c", LockMode::Read));
        assert!(q.promotable().is_empty());
        assert_eq!(q.promotable_excluding(&[1]), vec![2, 3]);
    }

    #[test]
    fn expiry_predicates() {
        let e = granted(1, "a", LockMode::Write);
        // lease_ms = 30_000, heartbeat at 2_000.
        assert!(!e.lease_expired(32_000));
        assert!(e.lease_expired(32_001));
        // max_hold_ms = 3_600_000, granted at 2_000.
        assert!(!e.cap_expired(3_602_000));
        assert!(e.cap_expired(3_602_001));
    }
}
