//! Reconciliation job: fold pending deltas into durable baselines.
//!
//! Each cycle scans the metrics keys incrementally, snapshots one hash at a
//! time, applies it to the durable row in a single clamped update and then
//! subtracts exactly the applied amounts from the fast store. Increments
//! that land between the snapshot and the subtraction survive. A failed
//! durable write leaves the hash untouched for the next cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::counter::snapshot_from_fields;
use crate::keys;
use crate::retry::{with_backoff, RetryExhausted};
use crate::store::{DurableStore, FastStore, KeyScan};
use crate::types::{CounterSnapshot, SubjectId};

/// Summary of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Metrics keys visited
    pub scanned: u64,
    /// Subjects whose deltas reached the durable store
    pub applied: u64,
    /// Keys with all-zero deltas
    pub skipped: u64,
    /// Keys left for the next cycle because a store call failed
    pub failed: u64,
    /// Deltas discarded because the subject row no longer exists
    pub orphaned: u64,
    /// Keys outside the metrics id format
    pub malformed: u64,
    /// Applied deltas whose fast-store subtraction could not complete
    pub unsettled: u64,
    /// The scan itself failed part-way
    pub scan_failed: bool,
    pub elapsed: Duration,
}

pub struct Reconciler {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    scan_batch: usize,
    settle_retry: RetryPolicy,
    // one flush at a time per process
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        scan_batch: usize,
        settle_retry: RetryPolicy,
    ) -> Self {
        Self { fast, durable, scan_batch, settle_retry, running: Mutex::new(()) }
    }

    /// Run one full reconciliation cycle.
    pub fn flush(&self) -> FlushReport {
        let _running = self.running.lock();
        let start = Instant::now();
        let mut report = FlushReport::default();

        for key in KeyScan::new(self.fast.clone(), keys::METRICS_PATTERN, self.scan_batch) {
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "metrics scan failed, remaining keys wait for next cycle");
                    report.scan_failed = true;
                    break;
                }
            };
            report.scanned += 1;
            match keys::parse_metrics_key(&key) {
                Some(subject) => self.flush_key(subject, &key, &mut report),
                None => {
                    warn!(key = %key, "skipping malformed metrics key");
                    report.malformed += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            scanned = report.scanned,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            orphaned = report.orphaned,
            unsettled = report.unsettled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "flush cycle complete"
        );
        report
    }

    fn flush_key(&self, subject: SubjectId, key: &str, report: &mut FlushReport) {
        let snapshot = match self.fast.hash_get_all(key) {
            Ok(fields) => snapshot_from_fields(subject, fields),
            Err(e) => {
                warn!(subject, error = %e, "could not read pending deltas, retrying next cycle");
                report.failed += 1;
                return;
            }
        };
        if snapshot.is_zero() {
            report.skipped += 1;
            return;
        }

        match self.durable.apply_deltas(subject, &snapshot) {
            Ok(Some(baseline)) => {
                debug!(subject, ?snapshot, ?baseline, "deltas applied");
                report.applied += 1;
                self.settle(subject, key, &snapshot, report);
            }
            Ok(None) => {
                warn!(subject, ?snapshot, "subject has no durable row, discarding deltas");
                report.orphaned += 1;
                self.settle(subject, key, &snapshot, report);
            }
            Err(e) => {
                warn!(subject, error = %e, "durable update failed, deltas kept for next cycle");
                report.failed += 1;
            }
        }
    }

    /// Subtract exactly `applied` from the pending hash.
    fn settle(&self, subject: SubjectId, key: &str, applied: &CounterSnapshot, report: &mut FlushReport) {
        for (kind, amount) in applied.non_zero() {
            let Some(undo) = amount.checked_neg() else {
                error!(
                    alert = "flush_settle_failed",
                    subject, field = %kind, amount,
                    "applied delta cannot be subtracted from fast store"
                );
                report.unsettled += 1;
                continue;
            };
            let settled = with_backoff(&self.settle_retry, "delta settlement", || {
                self.fast.hash_increment(key, kind.field(), undo)
            });
            if let Err(RetryExhausted { attempts, last_error }) = settled {
                // the durable row already holds this amount
                error!(
                    alert = "flush_settle_failed",
                    subject, field = %kind, amount, attempts, error = %last_error,
                    "applied delta still pending in fast store"
                );
                report.unsettled += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterEngine;
    use crate::error::StoreResult;
    use crate::memory::{MemoryDurableStore, MemoryFastStore};
    use crate::store::ScanPage;
    use crate::types::CounterKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn quick_retry() -> RetryPolicy {
        RetryPolicy { attempts: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1) }
    }

    fn setup() -> (Arc<MemoryFastStore>, Arc<MemoryDurableStore>, Reconciler) {
        let fast = Arc::new(MemoryFastStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let reconciler = Reconciler::new(fast.clone(), durable.clone(), 10, quick_retry());
        (fast, durable, reconciler)
    }

    fn pending(fast: &MemoryFastStore, subject: SubjectId, kind: CounterKind) -> i64 {
        fast.hash_get(&keys::metrics_key(subject), kind.field()).unwrap().unwrap_or(0)
    }

    #[test]
    fn test_flush_moves_deltas_to_baseline() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(42, CounterSnapshot::new(100, 0, 0));
        for _ in 0..3 {
            fast.hash_increment(&keys::metrics_key(42), "views", 1).unwrap();
        }

        let report = reconciler.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(durable.get_baseline(42, CounterKind::Views).unwrap(), Some(103));
        assert_eq!(pending(&fast, 42, CounterKind::Views), 0);
        // zeroed, not deleted
        assert!(fast.hash_get(&keys::metrics_key(42), "views").unwrap().is_some());
    }

    #[test]
    fn test_second_flush_is_noop() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(1, CounterSnapshot::new(5, 5, 5));
        fast.hash_increment(&keys::metrics_key(1), "likes", 2).unwrap();

        reconciler.flush();
        let report = reconciler.flush();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(durable.get_baselines(1).unwrap(), Some(CounterSnapshot::new(5, 7, 5)));
    }

    #[test]
    fn test_durable_failure_keeps_deltas() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(2, CounterSnapshot::default());
        fast.hash_increment(&keys::metrics_key(2), "comments", 4).unwrap();
        durable.faults().fail_times("apply_deltas", 1);

        let report = reconciler.flush();
        assert_eq!(report.failed, 1);
        assert_eq!(pending(&fast, 2, CounterKind::Comments), 4);
        assert_eq!(durable.get_baseline(2, CounterKind::Comments).unwrap(), Some(0));

        reconciler.flush();
        assert_eq!(pending(&fast, 2, CounterKind::Comments), 0);
        assert_eq!(durable.get_baseline(2, CounterKind::Comments).unwrap(), Some(4));
    }

    #[test]
    fn test_negative_delta_clamps_baseline() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(3, CounterSnapshot::new(0, 2, 0));
        fast.hash_increment(&keys::metrics_key(3), "likes", -5).unwrap();
        reconciler.flush();
        assert_eq!(durable.get_baseline(3, CounterKind::Likes).unwrap(), Some(0));
        assert_eq!(pending(&fast, 3, CounterKind::Likes), 0);
    }

    #[test]
    fn test_most_negative_increment_flushes_cleanly() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(5, CounterSnapshot::new(0, 7, 0));
        CounterEngine::new(fast.clone()).increment(5, CounterKind::Likes, i64::MIN);
        assert_eq!(pending(&fast, 5, CounterKind::Likes), -i64::MAX);

        let report = reconciler.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(report.unsettled, 0);
        assert_eq!(durable.get_baseline(5, CounterKind::Likes).unwrap(), Some(0));
        assert_eq!(pending(&fast, 5, CounterKind::Likes), 0);
    }

    #[test]
    fn test_unnegatable_pending_is_unsettled_not_fatal() {
        let (fast, durable, reconciler) = setup();
        durable.seed_subject(6, CounterSnapshot::new(0, 7, 0));
        fast.hash_increment(&keys::metrics_key(6), "likes", i64::MIN).unwrap();

        let report = reconciler.flush();
        assert_eq!(report.applied, 1);
        assert_eq!(report.unsettled, 1);
        assert_eq!(durable.get_baseline(6, CounterKind::Likes).unwrap(), Some(0));
        assert_eq!(pending(&fast, 6, CounterKind::Likes), i64::MIN);
    }

    #[test]
    fn test_orphan_and_malformed_keys() {
        let (fast, _durable, reconciler) = setup();
        fast.hash_increment(&keys::metrics_key(404), "views", 3).unwrap();
        fast.hash_increment("post:metrics:not-a-number", "views", 1).unwrap();

        let report = reconciler.flush();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(pending(&fast, 404, CounterKind::Views), 0);
    }

    #[test]
    fn test_many_keys_across_pages() {
        let (fast, durable, reconciler) = setup();
        for id in 0..35 {
            durable.seed_subject(id, CounterSnapshot::default());
            fast.hash_increment(&keys::metrics_key(id), "views", id + 1).unwrap();
        }
        let report = reconciler.flush();
        assert_eq!(report.scanned, 35);
        assert_eq!(report.applied, 35);
        for id in 0..35 {
            assert_eq!(durable.get_baseline(id, CounterKind::Views).unwrap(), Some(id + 1));
        }
    }

    /// Injects one increment right after the flush snapshots the hash.
    struct RacingStore {
        inner: MemoryFastStore,
        fired: AtomicBool,
    }

    impl FastStore for RacingStore {
        fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
            self.inner.hash_increment(key, field, delta)
        }
        fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>> {
            self.inner.hash_get(key, field)
        }
        fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, i64)>> {
            let snapshot = self.inner.hash_get_all(key)?;
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.hash_increment(key, "likes", 1)?;
            }
            Ok(snapshot)
        }
        fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.set_add(key, member)
        }
        fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.set_remove(key, member)
        }
        fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.inner.set_is_member(key, member)
        }
        fn set_card(&self, key: &str) -> StoreResult<u64> {
            self.inner.set_card(key)
        }
        fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.set_members(key)
        }
        fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
            self.inner.sorted_set_add(key, member, score)
        }
        fn sorted_set_range_desc(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
            self.inner.sorted_set_range_desc(key, limit)
        }
        fn sorted_set_trim(&self, key: &str, keep: usize) -> StoreResult<()> {
            self.inner.sorted_set_trim(key, keep)
        }
        fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key)
        }
        fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.set_with_ttl(key, value, ttl)
        }
        fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key)
        }
        fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.expire(key, ttl)
        }
        fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
            self.inner.rename(from, to)
        }
        fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage> {
            self.inner.scan_keys(pattern, cursor, count)
        }
    }

    #[test]
    fn test_increment_during_flush_survives() {
        let fast = Arc::new(RacingStore { inner: MemoryFastStore::new(), fired: AtomicBool::new(false) });
        let durable = Arc::new(MemoryDurableStore::new());
        durable.seed_subject(42, CounterSnapshot::default());
        fast.hash_increment(&keys::metrics_key(42), "likes", 2).unwrap();

        let reconciler = Reconciler::new(fast.clone(), durable.clone(), 10, quick_retry());
        reconciler.flush();

        assert_eq!(durable.get_baseline(42, CounterKind::Likes).unwrap(), Some(2));
        assert_eq!(fast.hash_get(&keys::metrics_key(42), "likes").unwrap(), Some(1));
    }
}
