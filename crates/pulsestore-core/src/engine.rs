//! PulseEngine: wiring of the store adapters, components and jobs.
//!
//! The engine is built once at startup from a validated configuration and
//! the two shared store handles. Request-path callers use the facades,
//! which are cheap to clone and carry their own `Arc`s. Background work
//! (flush, leaderboard refresh, relation sweep) runs on job threads started
//! by [`PulseEngine::start_jobs`].

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::PulseConfig;
use crate::counter::CounterEngine;
use crate::credential::CredentialMirror;
use crate::error::PulseResult;
use crate::journal::RepairJournal;
use crate::leaderboard::{LeaderboardMaintainer, TrendingEntry};
use crate::reconcile::Reconciler;
use crate::relation::RelationMirror;
use crate::scheduler::{spawn_periodic, JobHandle, JobSpec, JobStats, RefreshSignal};
use crate::store::{DurableStore, FastStore};
use crate::sweep::RelationSweep;
use crate::types::{CounterKind, CounterSnapshot, RelationKind, RelationOutcome, Side, SubjectId, UserId};

pub struct PulseEngine {
    config: PulseConfig,
    durable: Arc<dyn DurableStore>,
    counters: Arc<CounterEngine>,
    relations: Arc<RelationMirror>,
    reconciler: Arc<Reconciler>,
    leaderboard: Arc<LeaderboardMaintainer>,
    sweep: Arc<RelationSweep>,
    credentials: Arc<CredentialMirror>,
    journal: Option<Arc<RepairJournal>>,
    jobs: Mutex<Vec<JobHandle>>,
}

impl PulseEngine {
    /// Validate `config` and build every component over the shared stores.
    pub fn new(config: PulseConfig, fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>) -> PulseResult<Self> {
        config.validate()?;

        let journal = match &config.repair_journal {
            Some(path) => Some(Arc::new(RepairJournal::open(path)?)),
            None => None,
        };

        let counters = Arc::new(CounterEngine::new(fast.clone()));
        let relations = Arc::new(RelationMirror::new(
            fast.clone(),
            durable.clone(),
            config.compensation,
            journal.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            fast.clone(),
            durable.clone(),
            config.scan_batch,
            config.compensation,
        ));
        let leaderboard = Arc::new(LeaderboardMaintainer::new(
            fast.clone(),
            durable.clone(),
            counters.clone(),
            config.weights,
            config.leaderboard_size,
            config.leaderboard_ttl,
            config.candidate_limit,
            Arc::new(RefreshSignal::new()),
        ));
        let sweep = Arc::new(RelationSweep::new(
            fast.clone(),
            durable.clone(),
            relations.clone(),
            journal.clone(),
            config.scan_batch,
            config.sweep_page_size,
        ));
        let credentials = Arc::new(CredentialMirror::new(fast, durable.clone()));

        info!(
            flush_interval_s = config.flush_interval.as_secs(),
            leaderboard_refresh_s = config.leaderboard_refresh_interval.as_secs(),
            journal = journal.is_some(),
            "pulse engine ready"
        );

        Ok(Self {
            config,
            durable,
            counters,
            relations,
            reconciler,
            leaderboard,
            sweep,
            credentials,
            journal,
            jobs: Mutex::new(Vec::new()),
        })
    }

    /// Validated configuration the engine was built with.
    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    /// Counter facade for post and comment services.
    pub fn counters(&self) -> CounterFacade {
        CounterFacade { counters: self.counters.clone(), durable: self.durable.clone() }
    }

    /// Relation facade for like and follow services.
    pub fn relations(&self) -> RelationFacade {
        RelationFacade { mirror: self.relations.clone(), counters: self.counters.clone() }
    }

    /// Trending facade for the listing service.
    pub fn trending(&self) -> TrendingFacade {
        TrendingFacade { board: self.leaderboard.clone() }
    }

    /// Refresh-credential mirror.
    pub fn credentials(&self) -> &CredentialMirror {
        &self.credentials
    }

    /// Flush component, for on-demand flushes.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Trending maintainer, for on-demand refreshes.
    pub fn leaderboard(&self) -> &LeaderboardMaintainer {
        &self.leaderboard
    }

    /// Relation sweep, for on-demand repair passes.
    pub fn sweep(&self) -> &RelationSweep {
        &self.sweep
    }

    /// The repair journal, when one is configured.
    pub fn repair_journal(&self) -> Option<&RepairJournal> {
        self.journal.as_deref()
    }

    /// Start the flush, leaderboard and sweep jobs. A no-op if running.
    pub fn start_jobs(&self) -> PulseResult<()> {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            return Ok(());
        }

        let reconciler = self.reconciler.clone();
        let flush = spawn_periodic(JobSpec::new("flush", self.config.flush_interval).with_final_run(), move || {
            reconciler.flush();
        })?;

        let board = self.leaderboard.clone();
        let spec = JobSpec::new("leaderboard", self.config.leaderboard_refresh_interval)
            .with_signal(self.leaderboard.signal().clone());
        let leaderboard = spawn_periodic(spec, move || {
            if let Err(e) = board.refresh_from_durable() {
                warn!(error = %e, "leaderboard refresh failed");
            }
        })?;

        let sweep = self.sweep.clone();
        let credentials = self.credentials.clone();
        let sweeper = spawn_periodic(JobSpec::new("sweep", self.config.sweep_interval), move || {
            sweep.sweep_all();
            match credentials.purge_expired(Utc::now()) {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "expired credentials revoked"),
                Err(e) => warn!(error = %e, "credential purge failed"),
            }
        })?;

        jobs.extend([flush, leaderboard, sweeper]);
        Ok(())
    }

    /// Stop all jobs, waiting for the final flush.
    pub fn stop_jobs(&self) {
        let jobs: Vec<JobHandle> = std::mem::take(&mut *self.jobs.lock());
        for job in jobs {
            let name = job.name();
            job.shutdown();
            info!(job = name, "job shut down");
        }
    }

    /// Statistics of every running job.
    pub fn job_stats(&self) -> Vec<(&'static str, JobStats)> {
        self.jobs.lock().iter().map(|j| (j.name(), j.stats())).collect()
    }
}

impl Drop for PulseEngine {
    fn drop(&mut self) {
        self.stop_jobs();
    }
}

/// Counter reads and writes for the post and comment services.
#[derive(Clone)]
pub struct CounterFacade {
    counters: Arc<CounterEngine>,
    durable: Arc<dyn DurableStore>,
}

impl CounterFacade {
    /// Create the durable row of a new subject with zero baselines.
    pub fn create_subject(&self, subject: SubjectId) -> PulseResult<()> {
        Ok(self.durable.create_subject(subject)?)
    }

    /// Add `delta` to a pending counter. Never fails.
    pub fn increment(&self, subject: SubjectId, kind: CounterKind, delta: i64) {
        self.counters.increment(subject, kind, delta);
    }

    /// Effective value. Never fails: an unreadable baseline counts as 0.
    pub fn read(&self, subject: SubjectId, kind: CounterKind) -> i64 {
        let baseline = match self.durable.get_baseline(subject, kind) {
            Ok(b) => b.unwrap_or(0),
            Err(e) => {
                warn!(subject, field = %kind, error = %e, "baseline unavailable, assuming 0");
                0
            }
        };
        self.counters.read(subject, kind, baseline)
    }

    /// Effective value of every counter. Never fails.
    pub fn read_all(&self, subject: SubjectId) -> CounterSnapshot {
        let baseline = match self.durable.get_baselines(subject) {
            Ok(b) => b.unwrap_or_default(),
            Err(e) => {
                warn!(subject, error = %e, "baselines unavailable, assuming 0");
                CounterSnapshot::default()
            }
        };
        self.counters.read_all(subject, &baseline)
    }

    /// One more view.
    pub fn record_view(&self, subject: SubjectId) {
        self.increment(subject, CounterKind::Views, 1);
    }

    /// One more comment.
    pub fn record_comment(&self, subject: SubjectId) {
        self.increment(subject, CounterKind::Comments, 1);
    }

    /// One comment fewer.
    pub fn remove_comment(&self, subject: SubjectId) {
        self.increment(subject, CounterKind::Comments, -1);
    }
}

/// Relation writes for the like and follow services.
#[derive(Clone)]
pub struct RelationFacade {
    mirror: Arc<RelationMirror>,
    counters: Arc<CounterEngine>,
}

impl RelationFacade {
    /// Dual-write a relation; see [`RelationMirror::create`].
    pub fn create(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<RelationOutcome> {
        self.mirror.create(kind, actor, target)
    }

    /// Remove a relation from both stores.
    pub fn remove(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<RelationOutcome> {
        self.mirror.remove(kind, actor, target)
    }

    /// Membership check, repairing the mirror on a durable hit.
    pub fn exists(&self, kind: RelationKind, actor: UserId, target: i64) -> PulseResult<bool> {
        self.mirror.exists(kind, actor, target)
    }

    /// Related ids on one side of `owner`.
    pub fn count(&self, kind: RelationKind, side: Side, owner: i64) -> PulseResult<u64> {
        self.mirror.count(kind, side, owner)
    }

    /// Like a post; a new like also bumps its `likes` counter.
    pub fn like_post(&self, user: UserId, post: SubjectId) -> PulseResult<RelationOutcome> {
        let outcome = self.mirror.create(RelationKind::LikesPost, user, post)?;
        if outcome == RelationOutcome::Created {
            self.counters.increment(post, CounterKind::Likes, 1);
        }
        Ok(outcome)
    }

    /// Unlike a post; a removed like also lowers its `likes` counter.
    pub fn unlike_post(&self, user: UserId, post: SubjectId) -> PulseResult<RelationOutcome> {
        let outcome = self.mirror.remove(RelationKind::LikesPost, user, post)?;
        if outcome == RelationOutcome::Removed {
            self.counters.increment(post, CounterKind::Likes, -1);
        }
        Ok(outcome)
    }

    /// `follower` starts following `followee`.
    pub fn follow(&self, follower: UserId, followee: UserId) -> PulseResult<RelationOutcome> {
        self.mirror.create(RelationKind::FollowsUser, follower, followee)
    }

    /// `follower` stops following `followee`.
    pub fn unfollow(&self, follower: UserId, followee: UserId) -> PulseResult<RelationOutcome> {
        self.mirror.remove(RelationKind::FollowsUser, follower, followee)
    }
}

/// Trending reads for the listing service.
#[derive(Clone)]
pub struct TrendingFacade {
    board: Arc<LeaderboardMaintainer>,
}

impl TrendingFacade {
    /// Top `limit` trending subjects.
    pub fn read(&self, limit: usize) -> PulseResult<Vec<TrendingEntry>> {
        self.board.read(limit)
    }
}
