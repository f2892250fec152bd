//! Domain types shared by every PulseStore component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a counter subject (a post).
pub type SubjectId = i64;

/// Identifier of a user acting on a relation.
pub type UserId = i64;

/// The closed set of counters every subject owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Views,
    Likes,
    Comments,
}

impl CounterKind {
    /// Every counter kind, in field order.
    pub const ALL: [CounterKind; 3] = [CounterKind::Views, CounterKind::Likes, CounterKind::Comments];

    /// Hash field name used in the fast store and column name in the durable store.
    pub fn field(self) -> &'static str {
        match self {
            CounterKind::Views => "views",
            CounterKind::Likes => "likes",
            CounterKind::Comments => "comments",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

impl FromStr for CounterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "views" => Ok(CounterKind::Views),
            "likes" => Ok(CounterKind::Likes),
            "comments" => Ok(CounterKind::Comments),
            other => Err(format!("unknown counter field '{other}'")),
        }
    }
}

/// One value per counter kind. Used for baselines, pending deltas and
/// effective values alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
}

impl CounterSnapshot {
    /// Snapshot with explicit per-kind values.
    pub fn new(views: i64, likes: i64, comments: i64) -> Self {
        Self { views, likes, comments }
    }

    /// Value of one counter.
    pub fn get(&self, kind: CounterKind) -> i64 {
        match kind {
            CounterKind::Views => self.views,
            CounterKind::Likes => self.likes,
            CounterKind::Comments => self.comments,
        }
    }

    /// Overwrite one counter.
    pub fn set(&mut self, kind: CounterKind, value: i64) {
        match kind {
            CounterKind::Views => self.views = value,
            CounterKind::Likes => self.likes = value,
            CounterKind::Comments => self.comments = value,
        }
    }

    /// Add to one counter, saturating at the `i64` bounds.
    pub fn add(&mut self, kind: CounterKind, delta: i64) {
        self.set(kind, self.get(kind).saturating_add(delta));
    }

    /// True when every counter is 0.
    pub fn is_zero(&self) -> bool {
        CounterKind::ALL.iter().all(|&k| self.get(k) == 0)
    }

    /// `max(0, baseline + delta)` per field.
    pub fn effective(baseline: &CounterSnapshot, delta: &CounterSnapshot) -> Self {
        let mut out = CounterSnapshot::default();
        for kind in CounterKind::ALL {
            out.set(kind, baseline.get(kind).saturating_add(delta.get(kind)).max(0));
        }
        out
    }

    /// Iterate the non-zero fields.
    pub fn non_zero(&self) -> impl Iterator<Item = (CounterKind, i64)> + '_ {
        CounterKind::ALL
            .into_iter()
            .map(move |k| (k, self.get(k)))
            .filter(|(_, v)| *v != 0)
    }
}

/// Many-to-many relation kinds mirrored into the fast store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// actor = user, target = post
    LikesPost,
    /// actor = follower, target = followee
    FollowsUser,
}

impl RelationKind {
    /// Every relation kind.
    pub const ALL: [RelationKind; 2] = [RelationKind::LikesPost, RelationKind::FollowsUser];

    /// Name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            RelationKind::LikesPost => "likes-post",
            RelationKind::FollowsUser => "follows-user",
        }
    }

    /// Stable numeric tag used by the durable store and the repair journal.
    pub fn tag(self) -> u8 {
        match self {
            RelationKind::LikesPost => 1,
            RelationKind::FollowsUser => 2,
        }
    }

    /// Inverse of [`RelationKind::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RelationKind::LikesPost),
            2 => Some(RelationKind::FollowsUser),
            _ => None,
        }
    }

    /// Whether an actor may relate to itself.
    pub fn allows_self(self) -> bool {
        match self {
            RelationKind::LikesPost => true,
            RelationKind::FollowsUser => false,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which index of a relation to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Edges by actor (who does this user like / follow)
    Forward,
    /// Edges by target (who likes this post / follows this user)
    Inverse,
}

/// An ordered (actor, target) pair of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelationEdge {
    pub kind: RelationKind,
    pub actor: UserId,
    pub target: i64,
}

impl RelationEdge {
    /// Edge from `actor` to `target`.
    pub fn new(kind: RelationKind, actor: UserId, target: i64) -> Self {
        Self { kind, actor, target }
    }
}

/// What a relation write actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOutcome {
    /// New durable edge and new mirror entries
    Created,
    /// The fast store already had the pair; nothing written
    AlreadyRelated,
    /// Durable edge already existed; mirror entries were restored
    Repaired,
    /// Edge deleted from both stores
    Removed,
    /// The fast store did not have the pair; nothing written
    NotRelated,
}

impl RelationOutcome {
    /// True when durable state changed.
    pub fn changed(self) -> bool {
        matches!(self, RelationOutcome::Created | RelationOutcome::Removed)
    }
}

/// Durable refresh-credential row, mirrored into the fast store by token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub token: String,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl CredentialRecord {
    /// Unrevoked credential expiring `ttl` after `issued_at`.
    pub fn new(token: impl Into<String>, user_id: UserId, issued_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            token: token.into(),
            user_id,
            issued_at,
            expires_at: issued_at + ttl,
            revoked: false,
        }
    }

    /// Unrevoked and not yet expired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }

    /// Remaining lifetime, if any.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_kind_field_roundtrip() {
        for kind in CounterKind::ALL {
            assert_eq!(kind.field().parse::<CounterKind>().unwrap(), kind);
        }
        assert!("shares".parse::<CounterKind>().is_err());
    }

    #[test]
    fn test_effective_clamps_at_zero() {
        let baseline = CounterSnapshot::new(100, 2, 0);
        let delta = CounterSnapshot::new(3, -5, -1);
        let eff = CounterSnapshot::effective(&baseline, &delta);
        assert_eq!(eff, CounterSnapshot::new(103, 0, 0));
    }

    #[test]
    fn test_snapshot_non_zero() {
        let snap = CounterSnapshot::new(0, 4, -2);
        let fields: Vec<_> = snap.non_zero().collect();
        assert_eq!(fields, vec![(CounterKind::Likes, 4), (CounterKind::Comments, -2)]);
        assert!(!snap.is_zero());
        assert!(CounterSnapshot::default().is_zero());
    }

    #[test]
    fn test_relation_kind_tags() {
        for kind in RelationKind::ALL {
            assert_eq!(RelationKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(RelationKind::from_tag(0), None);
        assert!(!RelationKind::FollowsUser.allows_self());
    }

    #[test]
    fn test_credential_validity() {
        let now = Utc::now();
        let mut rec = CredentialRecord::new("tok", 7, now, chrono::Duration::minutes(10));
        assert!(rec.is_valid_at(now));
        assert!(rec.remaining(now).is_some());
        assert!(!rec.is_valid_at(now + chrono::Duration::minutes(11)));
        assert!(rec.remaining(now + chrono::Duration::minutes(11)).is_none());
        rec.revoked = true;
        assert!(!rec.is_valid_at(now));
    }
}
