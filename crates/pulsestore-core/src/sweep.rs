//! Relation sweep: background convergence of the mirror with durable edges.
//!
//! Runs in three passes per relation kind:
//! 1. pairs recorded in the repair journal are forced to durable truth
//! 2. forward-index members without a durable edge are dropped
//! 3. durable edges missing from either index are re-added
//!
//! Every pass reads incrementally and never blocks request-path writes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::journal::RepairJournal;
use crate::keys;
use crate::relation::RelationMirror;
use crate::store::{DurableStore, FastStore, KeyScan};
use crate::types::{RelationEdge, RelationKind, Side};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub journal_resolved: usize,
    /// Journal records still unresolved after this sweep
    pub journal_pending: usize,
    pub keys_scanned: u64,
    pub stale_removed: u64,
    pub edges_checked: u64,
    pub missing_restored: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

pub struct RelationSweep {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    mirror: Arc<RelationMirror>,
    journal: Option<Arc<RepairJournal>>,
    scan_batch: usize,
    page_size: usize,
}

impl RelationSweep {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        mirror: Arc<RelationMirror>,
        journal: Option<Arc<RepairJournal>>,
        scan_batch: usize,
        page_size: usize,
    ) -> Self {
        Self { fast, durable, mirror, journal, scan_batch, page_size: page_size.max(1) }
    }

    /// Sweep every relation kind.
    pub fn sweep_all(&self) -> Vec<(RelationKind, SweepReport)> {
        RelationKind::ALL.into_iter().map(|kind| (kind, self.sweep(kind))).collect()
    }

    pub fn sweep(&self, kind: RelationKind) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();

        self.resolve_journal(kind, &mut report);
        self.drop_stale(kind, &mut report);
        self.restore_missing(kind, &mut report);

        report.elapsed = start.elapsed();
        info!(
            %kind,
            journal_resolved = report.journal_resolved,
            journal_pending = report.journal_pending,
            stale_removed = report.stale_removed,
            missing_restored = report.missing_restored,
            errors = report.errors,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "relation sweep complete"
        );
        report
    }

    fn resolve_journal(&self, kind: RelationKind, report: &mut SweepReport) {
        let Some(journal) = &self.journal else {
            return;
        };
        let records = match journal.recover() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "repair journal unreadable");
                report.errors += 1;
                return;
            }
        };

        let total = records.len();
        let mut resolved = Vec::new();
        for record in records.into_iter().filter(|r| r.kind == kind) {
            match self.mirror.resync(&record.edge()) {
                Ok(present) => {
                    debug!(%kind, actor = record.actor, target = record.target, present, "journaled pair resynced");
                    resolved.push(record);
                }
                Err(e) => {
                    warn!(%kind, actor = record.actor, target = record.target, error = %e, "journaled pair still unresolved");
                    report.errors += 1;
                }
            }
        }
        if resolved.is_empty() {
            report.journal_pending = total;
            return;
        }

        match journal.retain(&resolved) {
            Ok(left) => {
                report.journal_resolved = resolved.len();
                report.journal_pending = left;
            }
            Err(e) => {
                // resolved records stay journaled and resync again next sweep
                warn!(error = %e, "could not compact repair journal");
                report.errors += 1;
            }
        }
    }

    fn drop_stale(&self, kind: RelationKind, report: &mut SweepReport) {
        for key in KeyScan::new(self.fast.clone(), keys::forward_pattern(kind), self.scan_batch) {
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    warn!(%kind, error = %e, "forward index scan failed");
                    report.errors += 1;
                    return;
                }
            };
            report.keys_scanned += 1;
            let Some(actor) = keys::parse_forward_key(kind, &key) else {
                warn!(key = %key, "skipping malformed relation key");
                continue;
            };
            let members = match self.fast.set_members(&key) {
                Ok(members) => members,
                Err(e) => {
                    warn!(key = %key, error = %e, "could not read forward index");
                    report.errors += 1;
                    continue;
                }
            };
            for member in members {
                let Ok(target) = member.parse::<i64>() else {
                    warn!(key = %key, member = %member, "skipping malformed relation member");
                    continue;
                };
                let edge = RelationEdge::new(kind, actor, target);
                match self.durable.edge_exists(&edge) {
                    Ok(true) => {}
                    Ok(false) => match self.mirror.resync(&edge) {
                        Ok(_) => report.stale_removed += 1,
                        Err(e) => {
                            warn!(%kind, actor, target, error = %e, "stale mirror entry not removed");
                            report.errors += 1;
                        }
                    },
                    Err(e) => {
                        warn!(%kind, actor, target, error = %e, "durable edge check failed");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    fn restore_missing(&self, kind: RelationKind, report: &mut SweepReport) {
        let mut after = None;
        loop {
            let page = match self.durable.list_edges(kind, after, self.page_size) {
                Ok(page) => page,
                Err(e) => {
                    warn!(%kind, error = %e, "durable edge listing failed");
                    report.errors += 1;
                    return;
                }
            };
            for edge in &page {
                report.edges_checked += 1;
                let fwd = keys::relation_key(kind, Side::Forward, edge.actor);
                let inv = keys::relation_key(kind, Side::Inverse, edge.target);
                let mirrored = self
                    .fast
                    .set_is_member(&fwd, &edge.target.to_string())
                    .and_then(|f| Ok(f && self.fast.set_is_member(&inv, &edge.actor.to_string())?));
                let restored = match mirrored {
                    Ok(true) => continue,
                    Ok(false) => self
                        .fast
                        .set_add(&fwd, &edge.target.to_string())
                        .and_then(|_| self.fast.set_add(&inv, &edge.actor.to_string())),
                    Err(e) => Err(e),
                };
                match restored {
                    Ok(_) => report.missing_restored += 1,
                    Err(e) => {
                        warn!(%kind, actor = edge.actor, target = edge.target, error = %e, "could not restore mirror entry");
                        report.errors += 1;
                    }
                }
            }
            match page.last() {
                Some(last) if page.len() == self.page_size => after = Some((last.actor, last.target)),
                _ => return,
            }
        }
    }
}
