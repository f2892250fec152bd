//! Relation mirror: bidirectional set indexes dual-written with the
//! durable edge table.
//!
//! The durable store owns edge existence. The fast store holds a forward
//! set (targets by actor) and an inverse set (actors by target) as read
//! accelerators. A partial dual write is rolled back with bounded retries;
//! a rollback that cannot complete is escalated and journaled for the sweep.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::error::{PulseError, PulseResult, StoreError, StoreResult};
use crate::journal::{RepairJournal, RepairRecord};
use crate::keys;
use crate::retry::{with_backoff, RetryExhausted};
use crate::store::{DurableStore, FastStore};
use crate::types::{RelationEdge, RelationKind, RelationOutcome, Side, UserId};

#[derive(Debug, Clone, Copy)]
enum Rollback {
    /// Undo a create: take both index entries out
    Unlink,
    /// Undo a remove: put both index entries back
    Relink,
}

pub struct RelationMirror {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    retry: RetryPolicy,
    journal: Option<Arc<RepairJournal>>,
}

impl RelationMirror {
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        retry: RetryPolicy,
        journal: Option<Arc<RepairJournal>>,
    ) -> Self {
        Self { fast, durable, retry, journal }
    }

    /// Relate `actor` to `target`.
    ///
    /// An existing durable edge only repairs the mirror. A pair the fast
    /// store already holds is accepted as related without a durable read.
    pub fn create(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<RelationOutcome> {
        let edge = validate(kind, actor, target)?;

        if self.durable.edge_exists(&edge)? {
            self.link_best_effort(&edge);
            debug!(%kind, actor, target, "durable edge exists, mirror repaired");
            return Ok(RelationOutcome::Repaired);
        }

        if !self.fast.set_add(&forward_key(&edge), &edge.target.to_string())? {
            debug!(%kind, actor, target, "already related in fast store");
            return Ok(RelationOutcome::AlreadyRelated);
        }

        let written = self
            .fast
            .set_add(&inverse_key(&edge), &edge.actor.to_string())
            .map(|_| ())
            .and_then(|()| self.durable.insert_edge(&edge));

        match written {
            Ok(()) => {
                debug!(%kind, actor, target, "relation created");
                Ok(RelationOutcome::Created)
            }
            // a concurrent caller inserted the row between our check and insert
            Err(StoreError::Duplicate { .. }) => Ok(RelationOutcome::AlreadyRelated),
            Err(cause) => Err(self.roll_back(&edge, Rollback::Unlink, cause)),
        }
    }

    /// Remove the relation between `actor` and `target`.
    pub fn remove(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<RelationOutcome> {
        let edge = validate(kind, actor, target)?;

        if !self.fast.set_remove(&forward_key(&edge), &edge.target.to_string())? {
            // cold mirror: the durable row may still exist
            if self.durable.delete_edge(&edge)? {
                if let Err(e) = self.fast.set_remove(&inverse_key(&edge), &edge.actor.to_string()) {
                    warn!(%kind, actor, target, error = %e, "inverse index cleanup failed");
                }
                debug!(%kind, actor, target, "relation removed from durable store only");
                return Ok(RelationOutcome::Removed);
            }
            return Ok(RelationOutcome::NotRelated);
        }

        let deleted = self
            .fast
            .set_remove(&inverse_key(&edge), &edge.actor.to_string())
            .and_then(|_| self.durable.delete_edge(&edge));

        match deleted {
            Ok(true) => {
                debug!(%kind, actor, target, "relation removed");
                Ok(RelationOutcome::Removed)
            }
            Ok(false) => {
                debug!(%kind, actor, target, "stale mirror entry dropped");
                Ok(RelationOutcome::NotRelated)
            }
            Err(cause) => Err(self.roll_back(&edge, Rollback::Relink, cause)),
        }
    }

    /// Cache-aside membership check with repair on a durable hit.
    pub fn exists(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<bool> {
        let edge = RelationEdge::new(kind, actor, target);
        match self.fast.set_is_member(&forward_key(&edge), &target.to_string()) {
            Ok(true) => Ok(true),
            Ok(false) => {
                let present = self.durable.edge_exists(&edge)?;
                if present {
                    self.link_best_effort(&edge);
                    debug!(%kind, actor, target, "mirror repaired on read");
                }
                Ok(present)
            }
            Err(e) => {
                warn!(%kind, actor, target, error = %e, "fast store unavailable, reading durable edge");
                Ok(self.durable.edge_exists(&edge)?)
            }
        }
    }

    /// Number of related ids on one side of `owner`.
    pub fn count(&self, kind: RelationKind, side: Side, owner: i64) -> PulseResult<u64> {
        match self.fast.set_card(&keys::relation_key(kind, side, owner)) {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(%kind, owner, error = %e, "fast store unavailable, counting durable edges");
                Ok(self.durable.count_edges(kind, side, owner)?)
            }
        }
    }

    /// Force both index entries of `edge` to match durable truth.
    /// Returns whether the durable edge exists.
    pub fn resync(&self, edge: &RelationEdge) -> StoreResult<bool> {
        let present = self.durable.edge_exists(edge)?;
        let (fwd, inv) = (forward_key(edge), inverse_key(edge));
        if present {
            self.fast.set_add(&fwd, &edge.target.to_string())?;
            self.fast.set_add(&inv, &edge.actor.to_string())?;
        } else {
            self.fast.set_remove(&fwd, &edge.target.to_string())?;
            self.fast.set_remove(&inv, &edge.actor.to_string())?;
        }
        Ok(present)
    }

    fn link_best_effort(&self, edge: &RelationEdge) {
        let linked = self
            .fast
            .set_add(&forward_key(edge), &edge.target.to_string())
            .and_then(|_| self.fast.set_add(&inverse_key(edge), &edge.actor.to_string()));
        if let Err(e) = linked {
            warn!(kind = %edge.kind, actor = edge.actor, target = edge.target, error = %e, "mirror repair failed");
        }
    }

    fn roll_back(&self, edge: &RelationEdge, rollback: Rollback, cause: StoreError) -> PulseError {
        let (fwd, inv) = (forward_key(edge), inverse_key(edge));
        let (target, actor) = (edge.target.to_string(), edge.actor.to_string());

        let undone = with_backoff(&self.retry, "relation rollback", || match rollback {
            Rollback::Unlink => {
                self.fast.set_remove(&fwd, &target)?;
                self.fast.set_remove(&inv, &actor)?;
                Ok(())
            }
            Rollback::Relink => {
                self.fast.set_add(&fwd, &target)?;
                self.fast.set_add(&inv, &actor)?;
                Ok(())
            }
        });

        match undone {
            Ok(()) => {
                warn!(
                    kind = %edge.kind, actor = edge.actor, target = edge.target, ?rollback, error = %cause,
                    "dual write failed, mirror rolled back"
                );
                PulseError::Store(cause)
            }
            Err(RetryExhausted { attempts, last_error }) => {
                error!(
                    alert = "compensation_failed",
                    kind = %edge.kind, actor = edge.actor, target = edge.target, ?rollback, attempts,
                    cause = %cause, error = %last_error,
                    "mirror rollback failed, pair left inconsistent"
                );
                if let Some(journal) = &self.journal {
                    if let Err(e) = journal.append(&RepairRecord::from(*edge)) {
                        error!(alert = "compensation_failed", error = %e, "could not journal repair record");
                    }
                }
                PulseError::Compensation {
                    kind: edge.kind,
                    actor: edge.actor,
                    target: edge.target,
                    attempts,
                    source: last_error,
                }
            }
        }
    }
}

fn validate(kind: RelationKind, actor: UserId, target: i64) -> PulseResult<RelationEdge> {
    if !kind.allows_self() && actor == target {
        return Err(PulseError::InvalidRelation(format!("{kind} requires distinct ids, got {actor} twice")));
    }
    Ok(RelationEdge::new(kind, actor, target))
}

fn forward_key(edge: &RelationEdge) -> String {
    keys::relation_key(edge.kind, Side::Forward, edge.actor)
}

fn inverse_key(edge: &RelationEdge) -> String {
    keys::relation_key(edge.kind, Side::Inverse, edge.target)
}
