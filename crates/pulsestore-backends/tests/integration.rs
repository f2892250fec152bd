//! End-to-end flows over the SQLite durable store and the in-memory fast store.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use pulsestore_backends::{RedisFastStore, SqliteDurableStore};
use pulsestore_core::{
    CounterKind, CounterSnapshot, CredentialRecord, DurableStore, FastStore, MemoryFastStore, PulseConfig,
    PulseEngine, PulseError, RelationEdge, RelationKind, RelationOutcome, Side, StoreError,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    db_path: std::path::PathBuf,
    fast: Arc<MemoryFastStore>,
    durable: Arc<SqliteDurableStore>,
    engine: PulseEngine,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pulse.db");
    let mut config = PulseConfig::development();
    config.store_timeout = Duration::from_millis(50);
    config.repair_journal = Some(dir.path().join("repair.journal"));

    let fast = Arc::new(MemoryFastStore::new());
    let durable = Arc::new(SqliteDurableStore::open(&db_path, config.store_timeout).unwrap());
    let engine = PulseEngine::new(config, fast.clone(), durable.clone()).unwrap();
    Harness { _dir: dir, db_path, fast, durable, engine }
}

#[test]
fn test_counter_read_and_flush() {
    let h = harness();
    let counters = h.engine.counters();
    counters.create_subject(1).unwrap();
    h.durable.apply_deltas(1, &CounterSnapshot::new(10, 0, 0)).unwrap();

    for _ in 0..5 {
        counters.record_view(1);
    }
    assert_eq!(counters.read(1, CounterKind::Views), 15);

    let report = h.engine.reconciler().flush();
    assert_eq!(report.applied, 1);
    assert_eq!(h.durable.get_baseline(1, CounterKind::Views).unwrap(), Some(15));
    assert_eq!(h.fast.hash_get("post:metrics:1", "views").unwrap(), Some(0));
    assert_eq!(counters.read(1, CounterKind::Views), 15);

    let again = h.engine.reconciler().flush();
    assert_eq!(again.applied, 0);
    assert_eq!(h.durable.get_baseline(1, CounterKind::Views).unwrap(), Some(15));
}

#[test]
fn test_negative_deltas_clamp_at_zero() {
    let h = harness();
    let counters = h.engine.counters();
    counters.create_subject(2).unwrap();
    counters.record_comment(2);
    counters.remove_comment(2);
    counters.remove_comment(2);
    assert_eq!(counters.read(2, CounterKind::Comments), 0);

    h.engine.reconciler().flush();
    assert_eq!(h.durable.get_baseline(2, CounterKind::Comments).unwrap(), Some(0));
    assert_eq!(counters.read(2, CounterKind::Comments), 0);
}

#[test]
fn test_increments_during_flush_are_conserved() {
    let h = harness();
    let counters = h.engine.counters();
    for subject in 1..=4 {
        counters.create_subject(subject).unwrap();
    }

    thread::scope(|s| {
        for worker in 0..4 {
            let counters = counters.clone();
            s.spawn(move || {
                for i in 0..200 {
                    counters.record_view(1 + (worker + i) % 4);
                }
            });
        }
        s.spawn(|| {
            for _ in 0..10 {
                h.engine.reconciler().flush();
                thread::sleep(Duration::from_millis(1));
            }
        });
    });
    h.engine.reconciler().flush();

    let total: i64 = (1..=4)
        .map(|s| h.durable.get_baseline(s, CounterKind::Views).unwrap().unwrap_or(0))
        .sum();
    assert_eq!(total, 800);
    for subject in 1..=4 {
        assert_eq!(h.fast.hash_get(&format!("post:metrics:{subject}"), "views").unwrap().unwrap_or(0), 0);
    }
}

#[test]
fn test_like_and_unlike_round_trip() {
    let h = harness();
    let counters = h.engine.counters();
    let relations = h.engine.relations();
    counters.create_subject(7).unwrap();

    assert_eq!(relations.like_post(1, 7).unwrap(), RelationOutcome::Created);
    assert_eq!(relations.like_post(1, 7).unwrap(), RelationOutcome::AlreadyRelated);
    assert!(relations.exists(RelationKind::LikesPost, 1, 7).unwrap());
    assert_eq!(relations.count(RelationKind::LikesPost, Side::Inverse, 7).unwrap(), 1);
    assert_eq!(counters.read(7, CounterKind::Likes), 1);

    assert_eq!(relations.unlike_post(1, 7).unwrap(), RelationOutcome::Removed);
    assert_eq!(relations.unlike_post(1, 7).unwrap(), RelationOutcome::NotRelated);
    assert_eq!(counters.read(7, CounterKind::Likes), 0);
    assert!(!h.durable.edge_exists(&RelationEdge::new(RelationKind::LikesPost, 1, 7)).unwrap());
}

#[test]
fn test_durable_lock_rolls_back_mirror() {
    let h = harness();
    let relations = h.engine.relations();

    let blocker = rusqlite::Connection::open(&h.db_path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let result = relations.follow(1, 2);
    assert!(matches!(result, Err(PulseError::Store(StoreError::Timeout { .. }))));
    assert!(!h.fast.set_is_member("user:follows:1", "2").unwrap());
    assert!(!h.fast.set_is_member("user:followers:2", "1").unwrap());

    blocker.execute_batch("ROLLBACK;").unwrap();
    assert!(!h.durable.edge_exists(&RelationEdge::new(RelationKind::FollowsUser, 1, 2)).unwrap());
    assert_eq!(relations.follow(1, 2).unwrap(), RelationOutcome::Created);
}

#[test]
fn test_cold_mirror_is_repaired() {
    let h = harness();
    let relations = h.engine.relations();
    relations.follow(3, 4).unwrap();
    h.fast.flush_all();

    assert!(relations.exists(RelationKind::FollowsUser, 3, 4).unwrap());
    assert!(h.fast.set_is_member("user:followers:4", "3").unwrap());

    h.fast.flush_all();
    assert_eq!(relations.follow(3, 4).unwrap(), RelationOutcome::Repaired);
    h.fast.flush_all();
    assert_eq!(relations.unfollow(3, 4).unwrap(), RelationOutcome::Removed);
    assert!(!relations.exists(RelationKind::FollowsUser, 3, 4).unwrap());
}

#[test]
fn test_trending_ranks_by_weighted_heat() {
    let h = harness();
    let counters = h.engine.counters();
    for subject in [10, 11, 12] {
        counters.create_subject(subject).unwrap();
    }
    // development weights: views 0.1, likes 2, comments 5
    counters.increment(10, CounterKind::Views, 100);
    counters.increment(11, CounterKind::Comments, 3);
    counters.increment(12, CounterKind::Likes, 2);
    h.engine.reconciler().flush();

    let report = h.engine.leaderboard().refresh_from_durable().unwrap();
    assert_eq!(report.published, 3);

    let top = h.engine.trending().read(2).unwrap();
    assert_eq!(top.iter().map(|e| e.subject).collect::<Vec<_>>(), vec![11, 10]);
    assert_eq!(top[1].score, 10.0);
    assert_eq!(h.durable.top_by_heat(3).unwrap()[0].0, 11);
}

#[test]
fn test_cold_trending_falls_back_to_persisted_heat() {
    let h = harness();
    for subject in [20, 21] {
        h.durable.create_subject(subject).unwrap();
    }
    h.durable.record_heat(&[(20, 1.0), (21, 4.0)]).unwrap();

    let top = h.engine.trending().read(5).unwrap();
    assert_eq!(top.iter().map(|e| e.subject).collect::<Vec<_>>(), vec![21, 20]);
    assert!(h.engine.leaderboard().signal().is_requested());
}

#[test]
fn test_credentials_round_trip() {
    let h = harness();
    let creds = h.engine.credentials();
    let now = Utc::now();
    let record = CredentialRecord::new("refresh-1", 42, now, chrono::Duration::days(7));

    creds.issue(&record, now).unwrap();
    assert_eq!(creds.find_valid("refresh-1", now).unwrap(), Some(record.clone()));

    h.fast.flush_all();
    assert_eq!(creds.find_valid("refresh-1", now).unwrap(), Some(record));

    assert_eq!(creds.revoke_all_for_user(42).unwrap(), 1);
    assert_eq!(creds.find_valid("refresh-1", now).unwrap(), None);
}

#[test]
fn test_sweep_converges_mirror() {
    let h = harness();
    let relations = h.engine.relations();
    relations.follow(1, 2).unwrap();
    h.durable.insert_edge(&RelationEdge::new(RelationKind::FollowsUser, 1, 3)).unwrap();
    h.fast.set_add("user:follows:1", "9").unwrap();
    h.fast.set_add("user:followers:9", "1").unwrap();

    let report = h.engine.sweep().sweep(RelationKind::FollowsUser);
    assert_eq!(report.stale_removed, 1);
    assert_eq!(report.missing_restored, 1);

    let mut members = h.fast.set_members("user:follows:1").unwrap();
    members.sort();
    assert_eq!(members, vec!["2".to_string(), "3".to_string()]);
    assert!(!h.fast.set_is_member("user:followers:9", "1").unwrap());
}

#[test]
fn test_jobs_flush_on_shutdown() {
    let h = harness();
    let counters = h.engine.counters();
    counters.create_subject(5).unwrap();
    h.engine.start_jobs().unwrap();
    counters.increment(5, CounterKind::Views, 3);
    h.engine.stop_jobs();

    assert_eq!(h.durable.get_baseline(5, CounterKind::Views).unwrap(), Some(3));
}

#[test]
#[ignore = "requires a Redis server at PULSE_TEST_REDIS_URL"]
fn test_redis_fast_store_primitives() {
    let url = std::env::var("PULSE_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
    let redis = RedisFastStore::connect(&url, Duration::from_millis(500)).unwrap();
    let key = format!("pulsestore-test:{}", std::process::id());

    redis.delete(&key).unwrap();
    assert_eq!(redis.hash_increment(&key, "views", 3).unwrap(), 3);
    assert_eq!(redis.hash_increment(&key, "views", -1).unwrap(), 2);
    assert_eq!(redis.hash_get(&key, "views").unwrap(), Some(2));
    assert_eq!(redis.hash_get_all(&key).unwrap(), vec![("views".to_string(), 2)]);
    redis.delete(&key).unwrap();

    assert!(redis.set_add(&key, "1").unwrap());
    assert!(!redis.set_add(&key, "1").unwrap());
    assert_eq!(redis.set_card(&key).unwrap(), 1);
    assert!(redis.set_remove(&key, "1").unwrap());

    for (member, score) in [("1", 1.0), ("2", 3.0), ("3", 2.0)] {
        redis.sorted_set_add(&key, member, score).unwrap();
    }
    redis.sorted_set_trim(&key, 2).unwrap();
    let top = redis.sorted_set_range_desc(&key, 10).unwrap();
    assert_eq!(top, vec![("2".to_string(), 3.0), ("3".to_string(), 2.0)]);
    assert!(redis.expire(&key, Duration::from_secs(5)).unwrap());
    redis.delete(&key).unwrap();

    redis.set_with_ttl(&key, "v", Duration::from_secs(5)).unwrap();
    assert_eq!(redis.get(&key).unwrap(), Some("v".to_string()));
    assert!(redis.delete(&key).unwrap());
}
