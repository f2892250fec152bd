//! Trending leaderboard maintenance and reads.
//!
//! A refresh scores a bounded candidate set from effective counter values,
//! builds the top entries under a staging key and renames it over the live
//! key, so readers never observe a half-built structure. Reads come from
//! the live structure and fall back to the persisted heat column when it is
//! cold, asking the job for an early refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::HeatWeights;
use crate::counter::CounterEngine;
use crate::error::PulseResult;
use crate::keys;
use crate::scheduler::RefreshSignal;
use crate::store::{DurableStore, FastStore};
use crate::types::SubjectId;

/// One ranked subject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendingEntry {
    pub subject: SubjectId,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub candidates: usize,
    pub scored: usize,
    /// Candidates without a durable row
    pub missing: usize,
    /// Candidates whose baselines could not be read
    pub failed: usize,
    /// Entries written to the live structure
    pub published: usize,
    pub elapsed: Duration,
}

pub struct LeaderboardMaintainer {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    counters: Arc<CounterEngine>,
    weights: HeatWeights,
    size: usize,
    ttl: Duration,
    candidate_limit: usize,
    signal: Arc<RefreshSignal>,
}

impl LeaderboardMaintainer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fast: Arc<dyn FastStore>,
        durable: Arc<dyn DurableStore>,
        counters: Arc<CounterEngine>,
        weights: HeatWeights,
        size: usize,
        ttl: Duration,
        candidate_limit: usize,
        signal: Arc<RefreshSignal>,
    ) -> Self {
        Self { fast, durable, counters, weights, size, ttl, candidate_limit, signal }
    }

    pub fn signal(&self) -> &Arc<RefreshSignal> {
        &self.signal
    }

    /// Rebuild the live structure from `candidates`.
    pub fn refresh(&self, candidates: &[SubjectId]) -> PulseResult<RefreshReport> {
        let start = Instant::now();
        let mut report = RefreshReport { candidates: candidates.len(), ..Default::default() };

        let mut entries = Vec::with_capacity(candidates.len());
        for &subject in candidates {
            match self.durable.get_baselines(subject) {
                Ok(Some(baseline)) => {
                    let effective = self.counters.read_all(subject, &baseline);
                    entries.push(TrendingEntry { subject, score: self.weights.score(&effective) });
                }
                Ok(None) => report.missing += 1,
                Err(e) => {
                    warn!(subject, error = %e, "baseline unavailable, candidate skipped");
                    report.failed += 1;
                }
            }
        }
        rank(&mut entries);
        entries.dedup_by_key(|e| e.subject);
        report.scored = entries.len();

        // every scored candidate, so subjects that fell out of the top keep a current score
        let heat: Vec<(SubjectId, f64)> = entries.iter().map(|e| (e.subject, e.score)).collect();
        entries.truncate(self.size);

        if entries.is_empty() {
            debug!("no scored candidates, live structure left as is");
        } else {
            self.publish(&entries)?;
            report.published = entries.len();
            if let Err(e) = self.durable.record_heat(&heat) {
                warn!(error = %e, "could not persist heat scores");
            }
        }

        report.elapsed = start.elapsed();
        info!(
            candidates = report.candidates,
            scored = report.scored,
            published = report.published,
            missing = report.missing,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "leaderboard refreshed"
        );
        Ok(report)
    }

    /// Refresh from the durable store's most recent subjects.
    pub fn refresh_from_durable(&self) -> PulseResult<RefreshReport> {
        let candidates = self.durable.candidate_subjects(self.candidate_limit)?;
        self.refresh(&candidates)
    }

    /// Top `limit` entries, highest score first, ties by subject id.
    pub fn read(&self, limit: usize) -> PulseResult<Vec<TrendingEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // the store orders equal scores by member text, so rank the whole
        // structure before cutting it to size
        match self.fast.sorted_set_range_desc(keys::TRENDING_KEY, self.size.max(limit)) {
            Ok(raw) if !raw.is_empty() => {
                let mut entries: Vec<TrendingEntry> = raw
                    .into_iter()
                    .filter_map(|(member, score)| match member.parse() {
                        Ok(subject) => Some(TrendingEntry { subject, score }),
                        Err(_) => {
                            warn!(member = %member, "ignoring malformed trending member");
                            None
                        }
                    })
                    .collect();
                rank(&mut entries);
                entries.truncate(limit);
                return Ok(entries);
            }
            Ok(_) => debug!("trending structure is cold"),
            Err(e) => warn!(error = %e, "trending structure unavailable"),
        }

        self.signal.request();
        let mut entries: Vec<TrendingEntry> = self
            .durable
            .top_by_heat(limit)?
            .into_iter()
            .map(|(subject, score)| TrendingEntry { subject, score })
            .collect();
        rank(&mut entries);
        Ok(entries)
    }

    fn publish(&self, entries: &[TrendingEntry]) -> PulseResult<()> {
        self.fast.delete(keys::TRENDING_STAGING_KEY)?;
        for entry in entries {
            self.fast.sorted_set_add(keys::TRENDING_STAGING_KEY, &entry.subject.to_string(), entry.score)?;
        }
        self.fast.sorted_set_trim(keys::TRENDING_STAGING_KEY, self.size)?;
        self.fast.rename(keys::TRENDING_STAGING_KEY, keys::TRENDING_KEY)?;
        self.fast.expire(keys::TRENDING_KEY, self.ttl)?;
        Ok(())
    }
}

fn rank(entries: &mut [TrendingEntry]) {
    entries.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.subject.cmp(&b.subject)));
}
