//! SQLite durable store
//!
//! Every trait call is a single statement (or one transaction) on a shared
//! connection, so each call has a definite outcome. Counter updates clamp
//! at zero inside the statement itself.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use pulsestore_core::{
    CounterKind, CounterSnapshot, CredentialRecord, DurableStore, RelationEdge, RelationKind, Side, StoreError,
    StoreKind, StoreResult, SubjectId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    id         INTEGER PRIMARY KEY,
    views      INTEGER NOT NULL DEFAULT 0,
    likes      INTEGER NOT NULL DEFAULT 0,
    comments   INTEGER NOT NULL DEFAULT 0,
    heat       REAL    NOT NULL DEFAULT 0,
    created_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS subjects_by_heat ON subjects (heat DESC, id ASC);
CREATE INDEX IF NOT EXISTS subjects_by_age ON subjects (created_ms DESC, id DESC);

CREATE TABLE IF NOT EXISTS relation_edges (
    kind       INTEGER NOT NULL,
    actor      INTEGER NOT NULL,
    target     INTEGER NOT NULL,
    created_ms INTEGER NOT NULL,
    PRIMARY KEY (kind, actor, target)
);
CREATE INDEX IF NOT EXISTS relation_edges_by_target ON relation_edges (kind, target);

CREATE TABLE IF NOT EXISTS refresh_credentials (
    token      TEXT PRIMARY KEY,
    user_id    INTEGER NOT NULL,
    issued_at  TEXT    NOT NULL,
    expires_at TEXT    NOT NULL,
    expires_ms INTEGER NOT NULL,
    revoked    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS refresh_credentials_by_user ON refresh_credentials (user_id);
";

pub struct SqliteDurableStore {
    conn: Mutex<Connection>,
}

impl SqliteDurableStore {
    /// Open (or create) a database file. `timeout` bounds how long a call
    /// waits on a locked database.
    pub fn open<P: AsRef<Path>>(path: P, timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| map_err("open", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| map_err("open", e))?;
        Self::init(conn, timeout)
    }

    pub fn open_in_memory(timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| map_err("open", e))?;
        Self::init(conn, timeout)
    }

    fn init(conn: Connection, timeout: Duration) -> StoreResult<Self> {
        conn.busy_timeout(timeout).map_err(|e| map_err("open", e))?;
        conn.execute_batch(SCHEMA).map_err(|e| map_err("migrate", e))?;
        debug!("sqlite schema ready");
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn map_err(op: &'static str, err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Timeout { store: StoreKind::Durable, op },
            ErrorCode::ConstraintViolation => StoreError::Duplicate { what: format!("{op}: {err}") },
            _ => StoreError::unavailable(StoreKind::Durable, format!("{op}: {err}")),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt {
            store: StoreKind::Durable,
            message: format!("{op}: {err}"),
        },
        _ => StoreError::unavailable(StoreKind::Durable, format!("{op}: {err}")),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn column(kind: CounterKind) -> &'static str {
    kind.field()
}

fn owner_column(side: Side) -> &'static str {
    match side {
        Side::Forward => "actor",
        Side::Inverse => "target",
    }
}

fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { store: StoreKind::Durable, message: format!("bad timestamp '{raw}': {e}") })
}

type CredentialRow = (String, i64, String, String, bool);

fn credential_from_row(row: CredentialRow) -> StoreResult<CredentialRecord> {
    let (token, user_id, issued_at, expires_at, revoked) = row;
    Ok(CredentialRecord {
        token,
        user_id,
        issued_at: decode_time(&issued_at)?,
        expires_at: decode_time(&expires_at)?,
        revoked,
    })
}

fn read_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

impl DurableStore for SqliteDurableStore {
    fn create_subject(&self, subject: SubjectId) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO subjects (id, created_ms) VALUES (?1, ?2) ON CONFLICT (id) DO NOTHING",
                params![subject, now_ms()],
            )
            .map_err(|e| map_err("create_subject", e))?;
        Ok(())
    }

    fn get_baseline(&self, subject: SubjectId, kind: CounterKind) -> StoreResult<Option<i64>> {
        let sql = format!("SELECT {} FROM subjects WHERE id = ?1", column(kind));
        self.conn
            .lock()
            .query_row(&sql, params![subject], |row| row.get(0))
            .optional()
            .map_err(|e| map_err("get_baseline", e))
    }

    fn get_baselines(&self, subject: SubjectId) -> StoreResult<Option<CounterSnapshot>> {
        self.conn
            .lock()
            .query_row(
                "SELECT views, likes, comments FROM subjects WHERE id = ?1",
                params![subject],
                |row| Ok(CounterSnapshot::new(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| map_err("get_baselines", e))
    }

    fn apply_delta(&self, subject: SubjectId, kind: CounterKind, delta: i64) -> StoreResult<Option<i64>> {
        let col = column(kind);
        let sql = format!("UPDATE subjects SET {col} = MAX(0, {col} + ?1) WHERE id = ?2 RETURNING {col}");
        self.conn
            .lock()
            .query_row(&sql, params![delta, subject], |row| row.get(0))
            .optional()
            .map_err(|e| map_err("apply_delta", e))
    }

    fn apply_deltas(&self, subject: SubjectId, deltas: &CounterSnapshot) -> StoreResult<Option<CounterSnapshot>> {
        self.conn
            .lock()
            .query_row(
                "UPDATE subjects
                    SET views = MAX(0, views + ?1),
                        likes = MAX(0, likes + ?2),
                        comments = MAX(0, comments + ?3)
                  WHERE id = ?4
                  RETURNING views, likes, comments",
                params![deltas.views, deltas.likes, deltas.comments, subject],
                |row| Ok(CounterSnapshot::new(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| map_err("apply_deltas", e))
    }

    fn insert_edge(&self, edge: &RelationEdge) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO relation_edges (kind, actor, target, created_ms) VALUES (?1, ?2, ?3, ?4)",
                params![edge.kind.tag(), edge.actor, edge.target, now_ms()],
            )
            .map_err(|e| map_err("insert_edge", e))?;
        Ok(())
    }

    fn delete_edge(&self, edge: &RelationEdge) -> StoreResult<bool> {
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM relation_edges WHERE kind = ?1 AND actor = ?2 AND target = ?3",
                params![edge.kind.tag(), edge.actor, edge.target],
            )
            .map_err(|e| map_err("delete_edge", e))?;
        Ok(deleted > 0)
    }

    fn edge_exists(&self, edge: &RelationEdge) -> StoreResult<bool> {
        self.conn
            .lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM relation_edges WHERE kind = ?1 AND actor = ?2 AND target = ?3)",
                params![edge.kind.tag(), edge.actor, edge.target],
                |row| row.get(0),
            )
            .map_err(|e| map_err("edge_exists", e))
    }

    fn list_edges(&self, kind: RelationKind, after: Option<(i64, i64)>, limit: usize) -> StoreResult<Vec<RelationEdge>> {
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RelationEdge> {
            Ok(RelationEdge::new(kind, row.get(0)?, row.get(1)?))
        };
        let limit = limit as i64;
        let rows: rusqlite::Result<Vec<RelationEdge>> = match after {
            Some((actor, target)) => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT actor, target FROM relation_edges
                          WHERE kind = ?1 AND (actor, target) > (?2, ?3)
                          ORDER BY actor, target LIMIT ?4",
                    )
                    .map_err(|e| map_err("list_edges", e))?;
                let rows = stmt
                    .query_map(params![kind.tag(), actor, target, limit], map_row)
                    .map_err(|e| map_err("list_edges", e))?;
                rows.collect()
            }
            None => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT actor, target FROM relation_edges WHERE kind = ?1 ORDER BY actor, target LIMIT ?2",
                    )
                    .map_err(|e| map_err("list_edges", e))?;
                let rows = stmt
                    .query_map(params![kind.tag(), limit], map_row)
                    .map_err(|e| map_err("list_edges", e))?;
                rows.collect()
            }
        };
        rows.map_err(|e| map_err("list_edges", e))
    }

    fn count_edges(&self, kind: RelationKind, side: Side, owner: i64) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM relation_edges WHERE kind = ?1 AND {} = ?2", owner_column(side));
        let count: i64 = self
            .conn
            .lock()
            .query_row(&sql, params![kind.tag(), owner], |row| row.get(0))
            .map_err(|e| map_err("count_edges", e))?;
        Ok(count as u64)
    }

    fn candidate_subjects(&self, limit: usize) -> StoreResult<Vec<SubjectId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id FROM subjects ORDER BY created_ms DESC, id DESC LIMIT ?1")
            .map_err(|e| map_err("candidate_subjects", e))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get(0))
            .map_err(|e| map_err("candidate_subjects", e))?;
        rows.collect::<rusqlite::Result<Vec<SubjectId>>>()
            .map_err(|e| map_err("candidate_subjects", e))
    }

    fn top_by_heat(&self, limit: usize) -> StoreResult<Vec<(SubjectId, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, heat FROM subjects ORDER BY heat DESC, id ASC LIMIT ?1")
            .map_err(|e| map_err("top_by_heat", e))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| map_err("top_by_heat", e))?;
        rows.collect::<rusqlite::Result<Vec<(SubjectId, f64)>>>()
            .map_err(|e| map_err("top_by_heat", e))
    }

    fn record_heat(&self, scores: &[(SubjectId, f64)]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| map_err("record_heat", e))?;
        {
            let mut stmt = tx
                .prepare_cached("UPDATE subjects SET heat = ?1 WHERE id = ?2")
                .map_err(|e| map_err("record_heat", e))?;
            for (subject, score) in scores {
                stmt.execute(params![score, subject]).map_err(|e| map_err("record_heat", e))?;
            }
        }
        tx.commit().map_err(|e| map_err("record_heat", e))
    }

    fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO refresh_credentials (token, user_id, issued_at, expires_at, expires_ms, revoked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.token,
                    record.user_id,
                    encode_time(&record.issued_at),
                    encode_time(&record.expires_at),
                    record.expires_at.timestamp_millis(),
                    record.revoked,
                ],
            )
            .map_err(|e| map_err("insert_credential", e))?;
        Ok(())
    }

    fn find_credential(&self, token: &str) -> StoreResult<Option<CredentialRecord>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT token, user_id, issued_at, expires_at, revoked FROM refresh_credentials WHERE token = ?1",
                params![token],
                read_credential_row,
            )
            .optional()
            .map_err(|e| map_err("find_credential", e))?;
        row.map(credential_from_row).transpose()
    }

    fn revoke_credential(&self, token: &str) -> StoreResult<bool> {
        let updated = self
            .conn
            .lock()
            .execute(
                "UPDATE refresh_credentials SET revoked = 1 WHERE token = ?1 AND revoked = 0",
                params![token],
            )
            .map_err(|e| map_err("revoke_credential", e))?;
        Ok(updated > 0)
    }

    fn credentials_for_user(&self, user: i64) -> StoreResult<Vec<CredentialRecord>> {
        let rows: Vec<CredentialRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT token, user_id, issued_at, expires_at, revoked FROM refresh_credentials
                      WHERE user_id = ?1 AND revoked = 0 ORDER BY token",
                )
                .map_err(|e| map_err("credentials_for_user", e))?;
            let rows = stmt
                .query_map(params![user], read_credential_row)
                .map_err(|e| map_err("credentials_for_user", e))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(|e| map_err("credentials_for_user", e))?
        };
        rows.into_iter().map(credential_from_row).collect()
    }

    fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let cutoff = now.timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| map_err("revoke_expired", e))?;
        let tokens = {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE refresh_credentials SET revoked = 1
                      WHERE revoked = 0 AND expires_ms <= ?1
                      RETURNING token",
                )
                .map_err(|e| map_err("revoke_expired", e))?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .map_err(|e| map_err("revoke_expired", e))?;
            let mut tokens = rows
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(|e| map_err("revoke_expired", e))?;
            tokens.sort();
            tokens
        };
        tx.commit().map_err(|e| map_err("revoke_expired", e))?;
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> SqliteDurableStore {
        SqliteDurableStore::open_in_memory(Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn test_subject_baselines_and_clamped_deltas() {
        let db = store();
        db.create_subject(1).unwrap();
        db.create_subject(1).unwrap();
        assert_eq!(db.get_baselines(1).unwrap(), Some(CounterSnapshot::default()));

        let after = db.apply_deltas(1, &CounterSnapshot::new(10, 2, -4)).unwrap();
        assert_eq!(after, Some(CounterSnapshot::new(10, 2, 0)));
        assert_eq!(db.apply_delta(1, CounterKind::Likes, -5).unwrap(), Some(0));
        assert_eq!(db.get_baseline(1, CounterKind::Views).unwrap(), Some(10));

        assert_eq!(db.apply_deltas(99, &CounterSnapshot::new(1, 1, 1)).unwrap(), None);
        assert_eq!(db.get_baseline(99, CounterKind::Views).unwrap(), None);
    }

    #[test]
    fn test_edges_duplicate_and_paging() {
        let db = store();
        let edge = RelationEdge::new(RelationKind::FollowsUser, 1, 2);
        db.insert_edge(&edge).unwrap();
        assert!(matches!(db.insert_edge(&edge), Err(StoreError::Duplicate { .. })));
        assert!(db.edge_exists(&edge).unwrap());

        for target in 3..8 {
            db.insert_edge(&RelationEdge::new(RelationKind::FollowsUser, 1, target)).unwrap();
        }
        db.insert_edge(&RelationEdge::new(RelationKind::LikesPost, 1, 2)).unwrap();

        let first = db.list_edges(RelationKind::FollowsUser, None, 4).unwrap();
        assert_eq!(first.len(), 4);
        let last = first[3];
        let rest = db.list_edges(RelationKind::FollowsUser, Some((last.actor, last.target)), 4).unwrap();
        assert_eq!(rest.iter().map(|e| e.target).collect::<Vec<_>>(), vec![6, 7]);

        assert_eq!(db.count_edges(RelationKind::FollowsUser, Side::Forward, 1).unwrap(), 6);
        assert_eq!(db.count_edges(RelationKind::FollowsUser, Side::Inverse, 2).unwrap(), 1);
        assert!(db.delete_edge(&edge).unwrap());
        assert!(!db.delete_edge(&edge).unwrap());
    }

    #[test]
    fn test_heat_ordering_ties_by_id() {
        let db = store();
        for id in [3, 1, 2] {
            db.create_subject(id).unwrap();
        }
        db.record_heat(&[(3, 5.0), (1, 5.0), (2, 9.0)]).unwrap();
        assert_eq!(db.top_by_heat(3).unwrap(), vec![(2, 9.0), (1, 5.0), (3, 5.0)]);
        assert_eq!(db.candidate_subjects(10).unwrap().len(), 3);
    }

    #[test]
    fn test_credentials_round_trip() {
        let db = store();
        let now = Utc::now();
        let record = CredentialRecord::new("tok", 7, now, chrono::Duration::hours(1));
        db.insert_credential(&record).unwrap();
        assert!(matches!(db.insert_credential(&record), Err(StoreError::Duplicate { .. })));
        assert_eq!(db.find_credential("tok").unwrap(), Some(record.clone()));
        assert_eq!(db.credentials_for_user(7).unwrap().len(), 1);

        let short = CredentialRecord::new("short", 7, now, chrono::Duration::minutes(1));
        db.insert_credential(&short).unwrap();
        assert_eq!(db.revoke_expired(now + chrono::Duration::minutes(5)).unwrap(), vec!["short".to_string()]);

        assert!(db.revoke_credential("tok").unwrap());
        assert!(!db.revoke_credential("tok").unwrap());
        assert!(db.credentials_for_user(7).unwrap().is_empty());
    }

    #[test]
    fn test_file_database_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pulse.db");
        {
            let db = SqliteDurableStore::open(&path, Duration::from_millis(200)).unwrap();
            db.create_subject(5).unwrap();
            db.apply_delta(5, CounterKind::Comments, 3).unwrap();
        }
        let db = SqliteDurableStore::open(&path, Duration::from_millis(200)).unwrap();
        assert_eq!(db.get_baseline(5, CounterKind::Comments).unwrap(), Some(3));
    }
}
