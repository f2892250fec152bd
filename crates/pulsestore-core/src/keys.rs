//! Fast-store key layout.
//!
//! Every key the engine writes is built here so that the flush job, the
//! sweep and the adapters agree on one namespace.

use crate::types::{RelationKind, Side, SubjectId, UserId};

pub const METRICS_PREFIX: &str = "post:metrics:";
pub const METRICS_PATTERN: &str = "post:metrics:*";
pub const TRENDING_KEY: &str = "post:trending";
pub const TRENDING_STAGING_KEY: &str = "post:trending:staging";
pub const CREDENTIAL_PREFIX: &str = "auth:refresh:";

/// Pending-delta hash for one subject.
pub fn metrics_key(subject: SubjectId) -> String {
    format!("{METRICS_PREFIX}{subject}")
}

/// Parse a metrics key back to its subject id. Returns `None` for keys
/// outside the namespace or with a non-numeric suffix.
pub fn parse_metrics_key(key: &str) -> Option<SubjectId> {
    key.strip_prefix(METRICS_PREFIX)?.parse().ok()
}

fn index_prefix(kind: RelationKind, side: Side) -> &'static str {
    match (kind, side) {
        (RelationKind::LikesPost, Side::Forward) => "user:likes:",
        (RelationKind::LikesPost, Side::Inverse) => "post:likes:",
        (RelationKind::FollowsUser, Side::Forward) => "user:follows:",
        (RelationKind::FollowsUser, Side::Inverse) => "user:followers:",
    }
}

/// Set key holding one side of a relation index for `owner`.
pub fn relation_key(kind: RelationKind, side: Side, owner: i64) -> String {
    format!("{}{owner}", index_prefix(kind, side))
}

/// SCAN pattern matching every forward-index key of a relation kind.
pub fn forward_pattern(kind: RelationKind) -> String {
    format!("{}*", index_prefix(kind, Side::Forward))
}

/// Parse a forward-index key back to the actor id.
pub fn parse_forward_key(kind: RelationKind, key: &str) -> Option<UserId> {
    key.strip_prefix(index_prefix(kind, Side::Forward))?.parse().ok()
}

pub fn credential_key(token: &str) -> String {
    format!("{CREDENTIAL_PREFIX}{token}")
}

/// Minimal glob matcher for SCAN patterns (`*` and `?` only), used by
/// the in-memory adapter.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
