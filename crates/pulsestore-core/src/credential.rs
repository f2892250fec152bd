//! Refresh-credential mirror.
//!
//! The durable row is the source of truth. The fast store keeps a JSON copy
//! keyed by token, expiring with the credential, to answer validity checks
//! without a durable read. Every mutation goes to the durable store first;
//! mirror writes and deletes are best effort.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{PulseError, PulseResult};
use crate::keys;
use crate::store::{DurableStore, FastStore};
use crate::types::{CredentialRecord, UserId};

pub struct CredentialMirror {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
}

impl CredentialMirror {
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { fast, durable }
    }

    /// Persist a new credential and mirror it for its remaining lifetime.
    pub fn issue(&self, record: &CredentialRecord, now: DateTime<Utc>) -> PulseResult<()> {
        if record.token.trim().is_empty() {
            return Err(PulseError::InvalidCredential("token must not be blank".into()));
        }
        if record.remaining(now).is_none() {
            return Err(PulseError::InvalidCredential(format!(
                "credential for user {} expires at {}, not after issue time {now}",
                record.user_id, record.expires_at
            )));
        }
        self.durable.insert_credential(record)?;
        self.mirror(record, now);
        debug!(user = record.user_id, "credential issued");
        Ok(())
    }

    /// The credential for `token` if it is unrevoked and unexpired at `now`.
    pub fn find_valid(&self, token: &str, now: DateTime<Utc>) -> PulseResult<Option<CredentialRecord>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        let key = keys::credential_key(token);

        match self.fast.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<CredentialRecord>(&raw) {
                Ok(record) => return Ok(Some(record).filter(|r| r.is_valid_at(now))),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable credential mirror");
                    self.forget(token);
                }
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "credential mirror unavailable, reading durable row"),
        }

        let record = self.durable.find_credential(token)?.filter(|r| r.is_valid_at(now));
        if let Some(record) = &record {
            self.mirror(record, now);
        }
        Ok(record)
    }

    /// Returns true if an active credential was revoked.
    pub fn revoke(&self, token: &str) -> PulseResult<bool> {
        let revoked = self.durable.revoke_credential(token)?;
        self.forget(token);
        Ok(revoked)
    }

    /// Revoke every active credential of `user`; returns how many.
    pub fn revoke_all_for_user(&self, user: UserId) -> PulseResult<usize> {
        let mut revoked = 0;
        for record in self.durable.credentials_for_user(user)? {
            if self.durable.revoke_credential(&record.token)? {
                revoked += 1;
            }
            self.forget(&record.token);
        }
        debug!(user, revoked, "user credentials revoked");
        Ok(revoked)
    }

    /// Revoke credentials that expired at or before `now`; returns how many.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> PulseResult<usize> {
        let tokens = self.durable.revoke_expired(now)?;
        for token in &tokens {
            self.forget(token);
        }
        Ok(tokens.len())
    }

    fn mirror(&self, record: &CredentialRecord, now: DateTime<Utc>) {
        let Some(ttl) = record.remaining(now) else {
            return;
        };
        let written = serde_json::to_string(record)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.fast
                    .set_with_ttl(&keys::credential_key(&record.token), &json, ttl)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = written {
            warn!(user = record.user_id, error = %e, "credential mirror write failed");
        }
    }

    fn forget(&self, token: &str) {
        if let Err(e) = self.fast.delete(&keys::credential_key(token)) {
            warn!(error = %e, "credential mirror delete failed");
        }
    }
}
