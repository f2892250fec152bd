//! In-memory store adapters.
//!
//! [`MemoryFastStore`] mirrors the subset of Redis semantics the engine
//! relies on (hashes, sets, sorted sets, strings, TTLs, cursor SCAN) on a
//! single `RwLock<HashMap>`, the same shape as a RAM-first working set.
//! [`MemoryDurableStore`] models the relational tables behind one mutex so
//! every call is a single atomic statement.
//!
//! Both carry a [`Faults`] switchboard so tests and local runs can make
//! individual operations fail on demand.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{StoreError, StoreKind, StoreResult};
use crate::keys::glob_match;
use crate::store::{DurableStore, FastStore, ScanPage};
use crate::types::{CounterKind, CounterSnapshot, CredentialRecord, RelationEdge, RelationKind, Side, SubjectId};

#[derive(Debug, Clone, Copy)]
enum FaultRule {
    Always,
    Times(u32),
}

/// Per-operation failure injection.
///
/// Operations are named after the trait method (`"insert_edge"`,
/// `"set_add"`, ...). The wildcard `"*"` matches every operation.
#[derive(Debug)]
pub struct Faults {
    store: StoreKind,
    rules: Mutex<BTreeMap<&'static str, FaultRule>>,
}

impl Faults {
    fn new(store: StoreKind) -> Self {
        Self { store, rules: Mutex::new(BTreeMap::new()) }
    }

    /// Fail `op` until cleared.
    pub fn fail_always(&self, op: &'static str) {
        self.rules.lock().insert(op, FaultRule::Always);
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_times(&self, op: &'static str, times: u32) {
        self.rules.lock().insert(op, FaultRule::Times(times));
    }

    pub fn clear(&self, op: &'static str) {
        self.rules.lock().remove(op);
    }

    pub fn clear_all(&self) {
        self.rules.lock().clear();
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        let mut rules = self.rules.lock();
        for name in [op, "*"] {
            match rules.get_mut(name) {
                Some(FaultRule::Always) => {
                    return Err(StoreError::unavailable(self.store, format!("injected failure in {op}")));
                }
                Some(FaultRule::Times(n)) if *n > 0 => {
                    *n -= 1;
                    return Err(StoreError::unavailable(self.store, format!("injected failure in {op}")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(std::collections::HashMap<String, i64>),
    Set(HashSet<String>),
    ZSet(std::collections::HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    /// Creation order; doubles as the SCAN cursor position.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

#[derive(Default)]
struct FastData {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl FastData {
    /// Drop the entry if it has expired, then return it.
    fn live_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live(&self, key: &str) -> Option<&Entry> {
        let now = Instant::now();
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn get_or_insert(&mut self, key: &str, init: impl FnOnce() -> Value) -> &mut Entry {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        let next_seq = &mut self.next_seq;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            *next_seq += 1;
            Entry { value: init(), expires_at: None, seq: *next_seq }
        })
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Corrupt {
        store: StoreKind::Fast,
        message: format!("WRONGTYPE operation against key '{key}'"),
    }
}

/// Redis-like store held entirely in process memory.
pub struct MemoryFastStore {
    data: RwLock<FastData>,
    faults: Faults,
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(FastData { entries: HashMap::new(), next_seq: 0 }),
            faults: Faults::new(StoreKind::Fast),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.read().entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let data = self.data.read();
        let at = data.live(key)?.expires_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    /// Drop every key, as a cache flush or restart would.
    pub fn flush_all(&self) {
        self.data.write().entries.clear();
    }
}

impl Default for MemoryFastStore {
    fn default() -> Self { Self::new() }
}

impl FastStore for MemoryFastStore {
    fn hash_increment(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.faults.check("hash_increment")?;
        let mut data = self.data.write();
        let entry = data.get_or_insert(key, || Value::Hash(Default::default()));
        match &mut entry.value {
            Value::Hash(h) => {
                let v = h.entry(field.to_string()).or_insert(0);
                *v = v.checked_add(delta).ok_or_else(|| StoreError::Corrupt {
                    store: StoreKind::Fast,
                    message: format!("increment on '{key}'/{field} would overflow"),
                })?;
                Ok(*v)
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>> {
        self.faults.check("hash_get")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, i64)>> {
        self.faults.check("hash_get_all")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Hash(h)) => {
                let mut fields: Vec<(String, i64)> = h.iter().map(|(k, v)| (k.clone(), *v)).collect();
                fields.sort();
                Ok(fields)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.faults.check("set_add")?;
        let mut data = self.data.write();
        let entry = data.get_or_insert(key, || Value::Set(HashSet::new()));
        match &mut entry.value {
            Value::Set(s) => Ok(s.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.faults.check("set_remove")?;
        let mut data = self.data.write();
        let (removed, now_empty) = match data.live_mut(key).map(|e| &mut e.value) {
            None => return Ok(false),
            Some(Value::Set(s)) => (s.remove(member), s.is_empty()),
            Some(_) => return Err(wrong_type(key)),
        };
        // Redis deletes empty sets
        if now_empty {
            data.entries.remove(key);
        }
        Ok(removed)
    }

    fn set_is_member(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.faults.check("set_is_member")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(s)) => Ok(s.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_card(&self, key: &str) -> StoreResult<u64> {
        self.faults.check("set_card")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(s)) => Ok(s.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.faults.check("set_members")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(s)) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.faults.check("sorted_set_add")?;
        let mut data = self.data.write();
        let entry = data.get_or_insert(key, || Value::ZSet(Default::default()));
        match &mut entry.value {
            Value::ZSet(z) => {
                z.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted_set_range_desc(&self, key: &str, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        self.faults.check("sorted_set_range_desc")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(z)) => {
                let mut ranked: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                ranked.truncate(limit);
                Ok(ranked)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_set_trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        self.faults.check("sorted_set_trim")?;
        let mut data = self.data.write();
        let now_empty = match data.live_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Value::ZSet(z)) => {
                if z.len() > keep {
                    let mut ranked: Vec<(String, f64)> = z.drain().collect();
                    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                    ranked.truncate(keep);
                    z.extend(ranked);
                }
                z.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            data.entries.remove(key);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.faults.check("get")?;
        let data = self.data.read();
        match data.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.faults.check("set_with_ttl")?;
        let mut data = self.data.write();
        data.next_seq += 1;
        let seq = data.next_seq;
        data.entries.insert(
            key.to_string(),
            Entry { value: Value::Str(value.to_string()), expires_at: Some(Instant::now() + ttl), seq },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.faults.check("delete")?;
        let mut data = self.data.write();
        let existed = data.live_mut(key).is_some();
        data.entries.remove(key);
        Ok(existed)
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.faults.check("expire")?;
        let mut data = self.data.write();
        match data.live_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        self.faults.check("rename")?;
        let mut data = self.data.write();
        // drops an expired source first
        data.live_mut(from);
        let Some(mut entry) = data.entries.remove(from) else {
            return Err(StoreError::unavailable(StoreKind::Fast, format!("rename: no such key '{from}'")));
        };
        data.next_seq += 1;
        entry.seq = data.next_seq;
        data.entries.insert(to.to_string(), entry);
        Ok(())
    }

    fn scan_keys(&self, pattern: &str, cursor: u64, count: usize) -> StoreResult<ScanPage> {
        self.faults.check("scan_keys")?;
        let data = self.data.read();
        let now = Instant::now();

        // Walk keys in creation order starting at the cursor position.
        // A key that exists for the whole scan keeps its seq, so it is
        // never skipped.
        let mut window: Vec<(u64, &String)> = data.entries.iter()
            .filter(|(_, e)| e.seq >= cursor && e.is_live(now))
            .map(|(k, e)| (e.seq, k))
            .collect();
        window.sort_unstable_by_key(|(seq, _)| *seq);

        let count = count.max(1);
        let keys = window.iter()
            .take(count)
            .filter(|(_, k)| glob_match(pattern, k))
            .map(|(_, k)| (*k).clone())
            .collect();
        let next = if window.len() > count { window[count].0 } else { 0 };

        Ok(ScanPage { cursor: next, keys })
    }
}

#[derive(Debug, Clone, Default)]
struct SubjectRow {
    counters: CounterSnapshot,
    heat: f64,
    created_seq: u64,
}

#[derive(Default)]
struct DurableData {
    subjects: HashMap<SubjectId, SubjectRow>,
    next_seq: u64,
    /// (kind tag, actor, target)
    edges: BTreeSet<(u8, i64, i64)>,
    credentials: HashMap<String, CredentialRecord>,
}

fn edge_row(edge: &RelationEdge) -> (u8, i64, i64) {
    (edge.kind.tag(), edge.actor, edge.target)
}

/// Relational system of record held in process memory.
pub struct MemoryDurableStore {
    data: Mutex<DurableData>,
    faults: Faults,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self { data: Mutex::new(DurableData::default()), faults: Faults::new(StoreKind::Durable) }
    }

    pub fn faults(&self) -> &Faults {
        &self.faults
    }

    /// Set the baselines of a subject directly, creating it if needed.
    pub fn seed_subject(&self, subject: SubjectId, counters: CounterSnapshot) {
        let mut data = self.data.lock();
        data.next_seq += 1;
        let seq = data.next_seq;
        let row = data.subjects.entry(subject).or_insert_with(|| SubjectRow { created_seq: seq, ..Default::default() });
        row.counters = counters;
    }

    pub fn edge_count(&self) -> usize {
        self.data.lock().edges.len()
    }
}

impl Default for MemoryDurableStore {
    fn default() -> Self { Self::new() }
}

impl DurableStore for MemoryDurableStore {
    fn create_subject(&self, subject: SubjectId) -> StoreResult<()> {
        self.faults.check("create_subject")?;
        let mut data = self.data.lock();
        if !data.subjects.contains_key(&subject) {
            data.next_seq += 1;
            let seq = data.next_seq;
            data.subjects.insert(subject, SubjectRow { created_seq: seq, ..Default::default() });
        }
        Ok(())
    }

    fn get_baseline(&self, subject: SubjectId, kind: CounterKind) -> StoreResult<Option<i64>> {
        self.faults.check("get_baseline")?;
        Ok(self.data.lock().subjects.get(&subject).map(|r| r.counters.get(kind)))
    }

    fn get_baselines(&self, subject: SubjectId) -> StoreResult<Option<CounterSnapshot>> {
        self.faults.check("get_baselines")?;
        Ok(self.data.lock().subjects.get(&subject).map(|r| r.counters))
    }

    fn apply_delta(&self, subject: SubjectId, kind: CounterKind, delta: i64) -> StoreResult<Option<i64>> {
        self.faults.check("apply_delta")?;
        let mut data = self.data.lock();
        Ok(data.subjects.get_mut(&subject).map(|row| {
            let next = row.counters.get(kind).saturating_add(delta).max(0);
            row.counters.set(kind, next);
            next
        }))
    }

    fn apply_deltas(&self, subject: SubjectId, deltas: &CounterSnapshot) -> StoreResult<Option<CounterSnapshot>> {
        self.faults.check("apply_deltas")?;
        let mut data = self.data.lock();
        Ok(data.subjects.get_mut(&subject).map(|row| {
            row.counters = CounterSnapshot::effective(&row.counters, deltas);
            row.counters
        }))
    }

    fn insert_edge(&self, edge: &RelationEdge) -> StoreResult<()> {
        self.faults.check("insert_edge")?;
        if self.data.lock().edges.insert(edge_row(edge)) {
            Ok(())
        } else {
            Err(StoreError::Duplicate { what: format!("{} {}->{}", edge.kind, edge.actor, edge.target) })
        }
    }

    fn delete_edge(&self, edge: &RelationEdge) -> StoreResult<bool> {
        self.faults.check("delete_edge")?;
        Ok(self.data.lock().edges.remove(&edge_row(edge)))
    }

    fn edge_exists(&self, edge: &RelationEdge) -> StoreResult<bool> {
        self.faults.check("edge_exists")?;
        Ok(self.data.lock().edges.contains(&edge_row(edge)))
    }

    fn list_edges(&self, kind: RelationKind, after: Option<(i64, i64)>, limit: usize) -> StoreResult<Vec<RelationEdge>> {
        self.faults.check("list_edges")?;
        let data = self.data.lock();
        let tag = kind.tag();
        let edges = data.edges
            .range((tag, i64::MIN, i64::MIN)..=(tag, i64::MAX, i64::MAX))
            .filter(|(_, a, t)| after.map_or(true, |cur| (*a, *t) > cur))
            .take(limit)
            .map(|(_, a, t)| RelationEdge::new(kind, *a, *t))
            .collect();
        Ok(edges)
    }

    fn count_edges(&self, kind: RelationKind, side: Side, owner: i64) -> StoreResult<u64> {
        self.faults.check("count_edges")?;
        let data = self.data.lock();
        let tag = kind.tag();
        let count = data.edges.iter()
            .filter(|(k, a, t)| {
                *k == tag && match side {
                    Side::Forward => *a == owner,
                    Side::Inverse => *t == owner,
                }
            })
            .count();
        Ok(count as u64)
    }

    fn candidate_subjects(&self, limit: usize) -> StoreResult<Vec<SubjectId>> {
        self.faults.check("candidate_subjects")?;
        let data = self.data.lock();
        let mut rows: Vec<(u64, SubjectId)> = data.subjects.iter().map(|(id, r)| (r.created_seq, *id)).collect();
        rows.sort_unstable_by(|a, b| b.cmp(a));
        Ok(rows.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    fn top_by_heat(&self, limit: usize) -> StoreResult<Vec<(SubjectId, f64)>> {
        self.faults.check("top_by_heat")?;
        let data = self.data.lock();
        let mut rows: Vec<(SubjectId, f64)> = data.subjects.iter().map(|(id, r)| (*id, r.heat)).collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn record_heat(&self, scores: &[(SubjectId, f64)]) -> StoreResult<()> {
        self.faults.check("record_heat")?;
        let mut data = self.data.lock();
        for (id, score) in scores {
            if let Some(row) = data.subjects.get_mut(id) {
                row.heat = *score;
            }
        }
        Ok(())
    }

    fn insert_credential(&self, record: &CredentialRecord) -> StoreResult<()> {
        self.faults.check("insert_credential")?;
        let mut data = self.data.lock();
        if data.credentials.contains_key(&record.token) {
            return Err(StoreError::Duplicate { what: "credential token".into() });
        }
        data.credentials.insert(record.token.clone(), record.clone());
        Ok(())
    }

    fn find_credential(&self, token: &str) -> StoreResult<Option<CredentialRecord>> {
        self.faults.check("find_credential")?;
        Ok(self.data.lock().credentials.get(token).cloned())
    }

    fn revoke_credential(&self, token: &str) -> StoreResult<bool> {
        self.faults.check("revoke_credential")?;
        let mut data = self.data.lock();
        match data.credentials.get_mut(token) {
            Some(rec) if !rec.revoked => {
                rec.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn credentials_for_user(&self, user: i64) -> StoreResult<Vec<CredentialRecord>> {
        self.faults.check("credentials_for_user")?;
        let data = self.data.lock();
        let mut out: Vec<CredentialRecord> = data.credentials.values()
            .filter(|r| r.user_id == user && !r.revoked)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(out)
    }

    fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        self.faults.check("revoke_expired")?;
        let mut data = self.data.lock();
        let mut revoked = Vec::new();
        for rec in data.credentials.values_mut() {
            if !rec.revoked && rec.expires_at <= now {
                rec.revoked = true;
                revoked.push(rec.token.clone());
            }
        }
        revoked.sort();
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyScan;
    use std::sync::Arc;

    #[test]
    fn test_hash_increment_is_atomic_across_threads() {
        let store = Arc::new(MemoryFastStore::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let s = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    s.hash_increment("h", "views", 1).unwrap();
                }
            }));
        }
        for h in handles { h.join().unwrap(); }
        assert_eq!(store.hash_get("h", "views").unwrap(), Some(4000));
    }

    #[test]
    fn test_set_semantics() {
        let store = MemoryFastStore::new();
        assert!(store.set_add("s", "a").unwrap());
        assert!(!store.set_add("s", "a").unwrap());
        assert!(store.set_is_member("s", "a").unwrap());
        assert_eq!(store.set_card("s").unwrap(), 1);
        assert!(store.set_remove("s", "a").unwrap());
        assert!(!store.set_remove("s", "a").unwrap());
        // empty set key disappears
        assert!(store.is_empty());
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let store = MemoryFastStore::new();
        store.set_add("k", "x").unwrap();
        assert!(matches!(store.hash_increment("k", "f", 1), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_sorted_set_range_and_trim() {
        let store = MemoryFastStore::new();
        store.sorted_set_add("z", "a", 1.0).unwrap();
        store.sorted_set_add("z", "b", 3.0).unwrap();
        store.sorted_set_add("z", "c", 2.0).unwrap();
        store.sorted_set_trim("z", 2).unwrap();
        let ranked = store.sorted_set_range_desc("z", 10).unwrap();
        assert_eq!(ranked, vec![("b".to_string(), 3.0), ("c".to_string(), 2.0)]);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryFastStore::new();
        store.set_with_ttl("t", "v", Duration::from_millis(20)).unwrap();
        assert_eq!(store.get("t").unwrap(), Some("v".to_string()));
        assert!(store.ttl("t").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("t").unwrap(), None);
    }

    #[test]
    fn test_rename_replaces_destination() {
        let store = MemoryFastStore::new();
        store.sorted_set_add("live", "old", 1.0).unwrap();
        store.sorted_set_add("stage", "new", 5.0).unwrap();
        store.rename("stage", "live").unwrap();
        assert_eq!(store.sorted_set_range_desc("live", 10).unwrap(), vec![("new".to_string(), 5.0)]);
        assert!(store.rename("stage", "live").is_err());
    }

    #[test]
    fn test_scan_visits_every_matching_key() {
        let store = Arc::new(MemoryFastStore::new());
        for i in 0..25 {
            store.hash_increment(&format!("post:metrics:{i}"), "views", 1).unwrap();
            store.set_add(&format!("user:likes:{i}"), "1").unwrap();
        }
        let scan: Arc<dyn FastStore> = store.clone();
        let mut keys: Vec<String> = KeyScan::new(scan, "post:metrics:*", 7)
            .collect::<Result<_, _>>()
            .unwrap();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 25);
    }

    #[test]
    fn test_faults_times_then_recovers() {
        let store = MemoryDurableStore::new();
        store.faults().fail_times("create_subject", 2);
        assert!(store.create_subject(1).is_err());
        assert!(store.create_subject(1).is_err());
        assert!(store.create_subject(1).is_ok());
    }

    #[test]
    fn test_apply_deltas_clamps_and_reports_missing() {
        let store = MemoryDurableStore::new();
        store.seed_subject(5, CounterSnapshot::new(10, 1, 0));
        let after = store.apply_deltas(5, &CounterSnapshot::new(3, -4, 2)).unwrap();
        assert_eq!(after, Some(CounterSnapshot::new(13, 0, 2)));
        assert_eq!(store.apply_deltas(99, &CounterSnapshot::new(1, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_edges_duplicate_and_paging() {
        let store = MemoryDurableStore::new();
        for t in 1..=5 {
            store.insert_edge(&RelationEdge::new(RelationKind::FollowsUser, 1, t)).unwrap();
        }
        let dup = store.insert_edge(&RelationEdge::new(RelationKind::FollowsUser, 1, 3));
        assert!(matches!(dup, Err(StoreError::Duplicate { .. })));

        let first = store.list_edges(RelationKind::FollowsUser, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let last = first.last().unwrap();
        let rest = store.list_edges(RelationKind::FollowsUser, Some((last.actor, last.target)), 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(store.list_edges(RelationKind::LikesPost, None, 10).unwrap().is_empty());
        assert_eq!(store.count_edges(RelationKind::FollowsUser, Side::Inverse, 3).unwrap(), 1);
    }
}
