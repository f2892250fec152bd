//! Counter engine: pending deltas in the fast store.
//!
//! Writes only ever touch the fast store through an atomic hash increment.
//! Reads combine a caller-supplied durable baseline with the pending delta
//! and fail open to the baseline when the fast store is unavailable.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::keys;
use crate::store::FastStore;
use crate::types::{CounterKind, CounterSnapshot, SubjectId};

pub struct CounterEngine {
    fast: Arc<dyn FastStore>,
}

impl CounterEngine {
    pub fn new(fast: Arc<dyn FastStore>) -> Self {
        Self { fast }
    }

    /// Add `delta` to the pending delta of one counter.
    ///
    /// Fast-store failures are logged and the write is dropped. Deltas are
    /// capped at `-i64::MAX` so a pending value can always be negated.
    pub fn increment(&self, subject: SubjectId, kind: CounterKind, delta: i64) {
        if delta == 0 {
            return;
        }
        let delta = delta.max(-i64::MAX);
        let key = keys::metrics_key(subject);
        match self.fast.hash_increment(&key, kind.field(), delta) {
            Ok(pending) => debug!(subject, field = %kind, delta, pending, "counter incremented"),
            Err(e) => warn!(subject, field = %kind, delta, error = %e, "dropping counter increment"),
        }
    }

    /// Pending deltas of a subject, zero for absent fields.
    pub fn pending(&self, subject: SubjectId) -> StoreResult<CounterSnapshot> {
        let fields = self.fast.hash_get_all(&keys::metrics_key(subject))?;
        Ok(snapshot_from_fields(subject, fields))
    }

    /// `max(0, baseline + pending)`; pending is 0 if the fast store fails.
    pub fn read(&self, subject: SubjectId, kind: CounterKind, baseline: i64) -> i64 {
        let pending = match self.fast.hash_get(&keys::metrics_key(subject), kind.field()) {
            Ok(v) => v.unwrap_or(0),
            Err(e) => {
                warn!(subject, field = %kind, error = %e, "pending delta unavailable, serving baseline");
                0
            }
        };
        baseline.saturating_add(pending).max(0)
    }

    /// Effective value of every counter of a subject.
    pub fn read_all(&self, subject: SubjectId, baseline: &CounterSnapshot) -> CounterSnapshot {
        let pending = self.pending(subject).unwrap_or_else(|e| {
            warn!(subject, error = %e, "pending deltas unavailable, serving baseline");
            CounterSnapshot::default()
        });
        CounterSnapshot::effective(baseline, &pending)
    }
}

/// Fold raw hash fields into a snapshot. Unknown fields are ignored.
pub(crate) fn snapshot_from_fields(subject: SubjectId, fields: Vec<(String, i64)>) -> CounterSnapshot {
    let mut snapshot = CounterSnapshot::default();
    for (field, value) in fields {
        match field.parse::<CounterKind>() {
            Ok(kind) => snapshot.set(kind, value),
            Err(_) => debug!(subject, field = %field, "ignoring unknown metrics field"),
        }
    }
    snapshot
}
