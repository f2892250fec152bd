//! Redis fast store
//!
//! Uses the synchronous client. Connections are kept in a small idle pool;
//! a connection that errored is dropped rather than returned, so the next
//! call reconnects. Each connection carries read and write timeouts equal
//! to the configured store timeout.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use redis::{Commands, Connection, ErrorKind, RedisError, RedisResult};
use tracing::{debug, warn};

use pulsestore_core::{FastStore, ScanPage, StoreError, StoreKind, StoreResult};

const DEFAULT_MAX_IDLE: usize = 8;

pub struct RedisFastStore {
    client: redis::Client,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl RedisFastStore {
    /// Connect and verify the server answers `PING`.
    pub fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| map_err("connect", e))?;
        let store = Self { client, timeout, idle: Mutex::new(Vec::new()), max_idle: DEFAULT_MAX_IDLE };
        store.with_conn("ping", |con| redis::cmd("PING").query::<String>(con))?;
        debug!(url, timeout_ms = timeout.as_millis() as u64, "redis fast store connected");
        Ok(store)
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    fn checkout(&self, op: &'static str) -> StoreResult<Connection> {
        if let Some(con) = self.idle.lock().pop() {
            return Ok(con);
        }
        let con = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| map_err(op, e))?;
        con.set_read_timeout(Some(self.timeout)).map_err(|e| map_err(op, e))?;
        con.set_write_timeout(Some(self.timeout)).map_err(|e| map_err(op, e))?;
        Ok(con)
    }

    fn checkin(&self, con: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(con);
        }
    }

    fn with_conn<T>(&self, op: &'static str, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> StoreResult<T> {
        let mut con = self.checkout(op)?;
        match f(&mut con) {
            Ok(value) => {
                self.checkin(con);
                Ok(value)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    warn!(op, error = %e, "dropping redis connection");
                }
                Err(map_err(op, e))
            }
        }
    }
}

fn map_err(op: &'static str, err: RedisError) -> StoreError {
    if err.is_timeout() {
        return StoreError::Timeout { store: StoreKind::Fast, op };
    }
    match err.kind() {
        ErrorKind::TypeError => StoreError::Corrupt { store: StoreKind::Fast, message: format!("{op}: {err}") },
        // command rejections (WRONGTYPE, ERR, ...) fail the same way on every retry
        ErrorKind::ResponseError
        | ErrorKind::ExtensionError
        | ErrorKind::ExecAbortError
        | ErrorKind::NoScriptError
        | ErrorKind::CrossSlot
            if !matches!(err.code(), Some("BUSY" | "LOADING")) =>
        {
            StoreError::Corrupt { store: StoreKind::Fast, message: format!("{op} rejected: {err}") }
        }
        _ => StoreError::unavailable(StoreKind::Fast, format!("{op}: {err}")),
    }
}

/// Last rank for a `ZREVRANGE 0 <stop>` returning at most `limit` entries.
fn rev_range_stop(limit: usize) -> isize {
    isize::try_from(limit).unwrap_or(isize::MAX) - 1
}

/// Last rank for a `ZREMRANGEBYRANK 0 <stop>` that keeps the top `keep`.
fn trim_stop(keep: usize) -> isize {
    -isize::try_from(keep).unwrap_or(isize::MAX) - 1
}

/// Redis TTLs below one millisecond would mean "expire now".
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl FastStore for RedisFastStore {
    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.with_conn("hincrby", |con| con.hincr(key, field, delta))
    }

    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>> {
        self.with_conn("hget", |con| con.hget(key, field))
    }

    fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, i64)>> {
        let fields: HashMap<String, i64> = self.with_conn("hgetall", |con| con.hgetall(key))?;
        Ok(fields.into_iter().collect())
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added: i64 = self.with_conn("sadd", |con| con.sadd(key, member))?;
        Ok(added > 0)
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: i64 = self.with_conn("srem", |con| con.srem(key, member))?;
        Ok(removed > 0)
    }

    fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.with_conn("sismember", |con| con.sismember(key, member))
    }

    fn set_card(&self, key: &str) -> StoreResult<u64> {
        self.with_conn("scard", |con| con.scard(key))
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with_conn("smembers", |con| con.smembers(key))
    }

    fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.with_conn("zadd", |con| con.zadd(key, member, score))
    }

    fn sorted_set_range_desc(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = rev_range_stop(limit);
        self.with_conn("zrevrange", |con| con.zrevrange_withscores(key, 0, stop))
    }

    fn sorted_set_trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        // ranks are ascending by score, so the lowest entries go first
        let stop = trim_stop(keep);
        self.with_conn("zremrangebyrank", |con| con.zremrangebyrank(key, 0, stop))
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_conn("get", |con| con.get(key))
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_conn("psetex", |con| {
            redis::cmd("PSETEX").arg(key).arg(ttl_millis(ttl)).arg(value).query(con)
        })
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let deleted: i64 = self.with_conn("del", |con| con.del(key))?;
        Ok(deleted > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let set: i64 = self.with_conn("pexpire", |con| {
            redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).query(con)
        })?;
        Ok(set == 1)
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        self.with_conn("rename", |con| con.rename(from, to))
    }

    fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage> {
        let (cursor, keys): (u64, Vec<String>) = self.with_conn("scan", |con| {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count.max(1))
                .query(con)
        })?;
        Ok(ScanPage { cursor, keys })
    }
}
