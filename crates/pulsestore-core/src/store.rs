//! Store adapter contracts.
//!
//! The engine talks to two logical resources through these traits:
//!
//! - [`FastStore`]: a key-value / set / sorted-set store with atomic
//!   primitives (Redis in production). Holds pending deltas and derived
//!   indexes only.
//! - [`DurableStore`]: the relational system of record.
//!
//! Both are constructed once at startup and shared as `Arc<dyn ...>`.
//! Implementations enforce their own per-call timeout and report it as
//! [`StoreError::Timeout`](crate::error::StoreError::Timeout).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::types::{CounterKind, CounterSnapshot, CredentialRecord, RelationEdge, RelationKind, Side, SubjectId};

/// One page of a cursor-based key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` means the scan is complete.
    pub cursor: u64,
    pub keys: Vec<String>,
}

pub trait FastStore: Send + Sync {
    /// Atomically add `delta` to a hash field, creating it at 0 if absent.
    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>>;

    fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, i64)>>;

    /// Returns true if the member was newly added.
    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Returns true if the member was present and removed.
    fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool>;

    fn set_card(&self, key: &str) -> StoreResult<u64>;

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Highest scores first, at most `limit` entries.
    fn sorted_set_range_desc(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>>;

    /// Keep only the `keep` highest-scored members.
    fn sorted_set_trim(&self, key: &str, keep: usize) -> StoreResult<()>;

    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Returns true if the key existed and now carries the TTL.
    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Non-blocking incremental scan. Start with cursor 0; a returned
    /// cursor of 0 ends the scan. Pages may be empty mid-scan.
    fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage>;
}

pub trait DurableStore: Send + Sync {
    /// Create a subject row with all baselines at 0. Idempotent.
    fn create_subject(&self, subject: SubjectId) -> StoreResult<()>;

    fn get_baseline(&self, subject: SubjectId, kind: CounterKind) -> StoreResult<Option<i64>>;

    fn get_baselines(&self, subject: SubjectId) -> StoreResult<Option<CounterSnapshot>>;

    /// Add `delta` to one baseline, clamped at 0. `None` if the subject does not exist.
    fn apply_delta(&self, subject: SubjectId, kind: CounterKind, delta: i64) -> StoreResult<Option<i64>>;

    /// Add every field of `deltas` in one atomic update, each clamped at 0.
    /// `None` if the subject does not exist.
    fn apply_deltas(&self, subject: SubjectId, deltas: &CounterSnapshot) -> StoreResult<Option<CounterSnapshot>>;

    /// Insert an edge. An existing edge is reported as `StoreError::Duplicate`.
    fn insert_edge(&self, edge: &RelationEdge) -> StoreResult<()>;

    /// Returns true if a row was deleted.
    fn delete_edge(&self, edge: &RelationEdge) -> StoreResult<bool>;

    fn edge_exists(&self, edge: &RelationEdge) -> StoreResult<bool>;

    /// Edges of `kind` ordered by (actor, target), strictly after `after`.
    fn list_edges(&self, kind: RelationKind, after: Option<(i64, i64)>, limit: usize) -> StoreResult<Vec<RelationEdge>>;

    /// Number of edges owned by `owner` on the given side.
    fn count_edges(&self, kind: RelationKind, side: Side, owner: i64) -> StoreResult<u64>;

    /// Recently created subjects, newest first.
    fn candidate_subjects(&self, limit: usize) -> StoreResult<Vec<SubjectId>>;

    /// Subjects ordered by persisted heat (desc), ties by id (asc).
    fn top_by_heat(&self, limit: usize) -> StoreResult<Vec<(SubjectId, f64)>>;

    fn record_heat(&self, scores: &[(SubjectId, f64)]) -> StoreResult<()>;

    fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()>;

    fn find_credential(&self, token: &str) -> StoreResult<Option<CredentialRecord>>;

    /// Returns true if an unrevoked row was revoked.
    fn revoke_credential(&self, token: &str) -> StoreResult<bool>;

    /// Unrevoked credentials of a user.
    fn credentials_for_user(&self, user: i64) -> StoreResult<Vec<CredentialRecord>>;

    /// Revoke every unrevoked credential that expired at or before `now`,
    /// returning their tokens.
    fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>>;
}

/// Iterator over every key matching a pattern, one SCAN page at a time.
///
/// A failed page ends the iteration with that error as the last item.
pub struct KeyScan {
    store: Arc<dyn FastStore>,
    pattern: String,
    count: usize,
    cursor: u64,
    buffer: std::vec::IntoIter<String>,
    finished: bool,
}

impl KeyScan {
    pub fn new(store: Arc<dyn FastStore>, pattern: impl Into<String>, count: usize) -> Self {
        Self {
            store,
            pattern: pattern.into(),
            count: count.max(1),
            cursor: 0,
            buffer: Vec::new().into_iter(),
            finished: false,
        }
    }
}

impl Iterator for KeyScan {
    type Item = StoreResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.next() {
                return Some(Ok(key));
            }
            if self.finished {
                return None;
            }
            match self.store.scan_keys(&self.pattern, self.cursor, self.count) {
                Ok(page) => {
                    self.cursor = page.cursor;
                    self.finished = page.cursor == 0;
                    self.buffer = page.keys.into_iter();
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
