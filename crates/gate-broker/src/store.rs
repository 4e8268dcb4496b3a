//! Durable queue store backed by SQLite.
//!
//! Two tables live in `locks.db` under the state directory:
//!
//! - `queue_entries`: every waiting and granted entry, one row each.
//! - `audit_log`: append-only operational trail.
//!
//! The broker computes each state transition as a batch of [`StoreOp`]s and
//! applies the batch in a single transaction *before* touching its in-memory
//! state. A failed write therefore fails the whole operation and leaves both
//! the store and memory unchanged.

use std::path::Path;

use gate_core::protocol::{EntryState, LockMode, OwnerToken};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::info;

use crate::audit::AuditEvent;
use crate::queue::Entry;

/// Store-level failures. Client-visible as `store_failure`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state directory could not be created.
    #[error("failed to create state directory {path}: {source}")]
    StateDir {
        /// Offending directory.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted row held a value the broker cannot interpret.
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow {
        /// Table containing the row.
        table: &'static str,
        /// What was wrong.
        detail: String,
    },
}

/// A single write in a transition batch.
#[derive(Debug)]
pub enum StoreOp {
    /// Insert a fresh waiting entry.
    Insert {
        /// The entry to persist (state `waiting`).
        path: String,
        /// Entry fields.
        entry: Entry,
    },
    /// Promote `seq` to granted at `now_ms`.
    Grant {
        /// Entry sequence.
        seq: i64,
        /// Grant and first-heartbeat timestamp.
        now_ms: u64,
    },
    /// Adjust the hold count of a granted entry.
    SetHoldCount {
        /// Entry sequence.
        seq: i64,
        /// New count (≥ 1).
        hold_count: u32,
    },
    /// Refresh the lease of a granted entry.
    Heartbeat {
        /// Entry sequence.
        seq: i64,
        /// Heartbeat timestamp.
        now_ms: u64,
    },
    /// Delete an entry (release to zero, timeout, or expiry).
    Remove {
        /// Entry sequence.
        seq: i64,
    },
    /// Append an audit row.
    Audit {
        /// Event timestamp.
        at_ms: u64,
        /// What happened.
        event: AuditEvent,
        /// Path key.
        path: String,
        /// Owner involved.
        owner: OwnerToken,
        /// Mode involved.
        mode: LockMode,
    },
}

/// A recovered row: path plus the entry it held.
#[derive(Debug)]
pub struct RecoveredEntry {
    /// Path key the entry queues under.
    pub path: String,
    /// The entry itself.
    pub entry: Entry,
}

/// SQLite-backed durable store. All access happens under the broker's state
/// lock, so the connection needs no locking of its own.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory cannot be created or the
    /// database cannot be opened or migrated.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::StateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        info!(db = %db_path.display(), "lock store opened");
        Ok(Self { conn })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                seq INTEGER PRIMARY KEY,
                path TEXT NOT NULL,
                request_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                mode TEXT NOT NULL CHECK (mode IN ('read', 'write')),
                state TEXT NOT NULL CHECK (state IN ('waiting', 'granted')),
                hold_count INTEGER NOT NULL DEFAULT 1,
                enqueued_at_ms INTEGER NOT NULL,
                granted_at_ms INTEGER,
                last_heartbeat_ms INTEGER,
                lease_ms INTEGER NOT NULL,
                max_hold_ms INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_entries_path ON queue_entries(path)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at_ms INTEGER NOT NULL,
                event TEXT NOT NULL,
                path TEXT NOT NULL,
                owner TEXT NOT NULL,
                mode TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_at ON audit_log(at_ms)",
            [],
        )?;
        Ok(())
    }

    /// Apply a batch of writes atomically.
    ///
    /// # Errors
    ///
    /// On any failure the transaction rolls back and nothing is applied.
    pub fn apply(&mut self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for op in ops {
            match op {
                StoreOp::Insert { path, entry } => {
                    tx.execute(
                        "INSERT INTO queue_entries
                             (seq, path, request_id, owner, mode, state, hold_count,
                              enqueued_at_ms, granted_at_ms, last_heartbeat_ms,
                              lease_ms, max_hold_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            entry.seq,
                            path,
                            entry.request_id,
                            entry.owner.as_str(),
                            entry.mode.to_string(),
                            entry.state.to_string(),
                            entry.hold_count,
                            entry.enqueued_at_ms,
                            entry.granted_at_ms,
                            entry.last_heartbeat_ms,
                            entry.lease_ms,
                            entry.max_hold_ms,
                        ],
                    )?;
                }
                StoreOp::Grant { seq, now_ms } => {
                    tx.execute(
                        "UPDATE queue_entries
                         SET state = 'granted', granted_at_ms = ?2, last_heartbeat_ms = ?2
                         WHERE seq = ?1",
                        params![seq, now_ms],
                    )?;
                }
                StoreOp::SetHoldCount { seq, hold_count } => {
                    tx.execute(
                        "UPDATE queue_entries SET hold_count = ?2 WHERE seq = ?1",
                        params![seq, hold_count],
                    )?;
                }
                StoreOp::Heartbeat { seq, now_ms } => {
                    tx.execute(
                        "UPDATE queue_entries SET last_heartbeat_ms = ?2 WHERE seq = ?1",
                        params![seq, now_ms],
                    )?;
                }
                StoreOp::Remove { seq } => {
                    tx.execute("DELETE FROM queue_entries WHERE seq = ?1", params![seq])?;
                }
                StoreOp::Audit {
                    at_ms,
                    event,
                    path,
                    owner,
                    mode,
                } => {
                    tx.execute(
                        "INSERT INTO audit_log (at_ms, event, path, owner, mode)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            at_ms,
                            event.as_str(),
                            path,
                            owner.as_str(),
                            mode.to_string()
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load every persisted entry in sequence order, for startup recovery.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure or an uninterpretable row.
    pub fn load_all(&self) -> Result<Vec<RecoveredEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, path, request_id, owner, mode, state, hold_count,
                    enqueued_at_ms, granted_at_ms, last_heartbeat_ms, lease_ms, max_hold_ms
             FROM queue_entries ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, u64>(7)?,
                row.get::<_, Option<u64>>(8)?,
                row.get::<_, Option<u64>>(9)?,
                row.get::<_, u64>(10)?,
                row.get::<_, u64>(11)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                seq,
                path,
                request_id,
                owner,
                mode,
                state,
                hold_count,
                enqueued_at_ms,
                granted_at_ms,
                last_heartbeat_ms,
                lease_ms,
                max_hold_ms,
            ) = row?;
            let mode = parse_mode(&mode)?;
            let state = parse_state(&state)?;
            entries.push(RecoveredEntry {
                path,
                entry: Entry {
                    seq,
                    request_id,
                    owner: OwnerToken::from(owner),
                    mode,
                    state,
                    hold_count,
                    enqueued_at_ms,
                    granted_at_ms,
                    last_heartbeat_ms,
                    lease_ms,
                    max_hold_ms,
                },
            });
        }
        Ok(entries)
    }

    /// The highest sequence number ever assigned, or 0 for a fresh store.
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn max_seq(&self) -> Result<i64, StoreError> {
        let seq: Option<i64> =
            self.conn
                .query_row("SELECT MAX(seq) FROM queue_entries", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }

    /// Drop audit rows older than `before_ms`. Returns the number pruned.
    ///
    /// # Errors
    ///
    /// Returns an error on write failure.
    pub fn prune_audit(&mut self, before_ms: u64) -> Result<usize, StoreError> {
        let pruned = self.conn.execute(
            "DELETE FROM audit_log WHERE at_ms < ?1",
            params![before_ms],
        )?;
        Ok(pruned)
    }

    /// Number of audit rows (test and status helper).
    ///
    /// # Errors
    ///
    /// Returns an error on read failure.
    pub fn audit_len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn parse_mode(s: &str) -> Result<LockMode, StoreError> {
    match s {
        "read" => Ok(LockMode::Read),
        "write" => Ok(LockMode::Write),
        other => Err(StoreError::CorruptRow {
            table: "queue_entries",
            detail: format!("unknown mode {other:?}"),
        }),
    }
}

fn parse_state(s: &str) -> Result<EntryState, StoreError> {
    match s {
        "waiting" => Ok(EntryState::Waiting),
        "granted" => Ok(EntryState::Granted),
        other => Err(StoreError::CorruptRow {
            table: "queue_entries",
            detail: format!("unknown state {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use gate_core::protocol::EntryState;

    use super::*;

    fn waiting_entry(seq: i64) -> Entry {
        Entry {
            seq,
            request_id: format!("req-{seq}"),
            owner: OwnerToken::from(format!("owner-{seq}")),
            mode: LockMode::Write,
            state: EntryState::Waiting,
            hold_count: 1,
            enqueued_at_ms: 1_000,
            granted_at_ms: None,
            last_heartbeat_ms: None,
            lease_ms: 30_000,
            max_hold_ms: 3_600_000,
        }
    }

    #[test]
    fn insert_grant_load_roundtrip() {
        let mut store = Store::open_in_memory().unwrap();
        let entry = waiting_entry(1);
        store
            .apply(&[
                StoreOp::Insert {
                    path: "/f".to_string(),
                    entry: entry.clone(),
                },
                StoreOp::Grant {
                    seq: 1,
                    now_ms: 2_000,
                },
            ])
            .unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, "/f");
        let e = &loaded[0].entry;
        assert_eq!(e.state, EntryState::Granted);
        assert_eq!(e.granted_at_ms, Some(2_000));
        assert_eq!(e.last_heartbeat_ms, Some(2_000));
        assert_eq!(e.owner, entry.owner);
    }

    #[test]
    fn failed_batch_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();
        let result = store.apply(&[
            StoreOp::Insert {
                path: "/f".to_string(),
                entry: waiting_entry(7),
            },
            // Duplicate primary key forces the transaction to fail.
            StoreOp::Insert {
                path: "/f".to_string(),
                entry: waiting_entry(7),
            },
        ]);
        assert!(result.is_err());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn max_seq_tracks_inserts() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(store.max_seq().unwrap(), 0);
        store
            .apply(&[StoreOp::Insert {
                path: "/a".to_string(),
                entry: waiting_entry(41),
            }])
            .unwrap();
        assert_eq!(store.max_seq().unwrap(), 41);
    }

    #[test]
    fn audit_prune_by_age() {
        let mut store = Store::open_in_memory().unwrap();
        for at_ms in [1_000u64, 2_000, 3_000] {
            store
                .apply(&[StoreOp::Audit {
                    at_ms,
                    event: AuditEvent::Enqueue,
                    path: "/f".to_string(),
                    owner: OwnerToken::from("o"),
                    mode: LockMode::Read,
                }])
                .unwrap();
        }
        assert_eq!(store.audit_len().unwrap(), 3);
        assert_eq!(store.prune_audit(2_500).unwrap(), 2);
        assert_eq!(store.audit_len().unwrap(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("locks.db");
        {
            let mut store = Store::open(&db).unwrap();
            store
                .apply(&[StoreOp::Insert {
                    path: "/f".to_string(),
                    entry: waiting_entry(1),
                }])
                .unwrap();
        }
        let store = Store::open(&db).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
        assert_eq!(store.max_seq().unwrap(), 1);
    }
}
