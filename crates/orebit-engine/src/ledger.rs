//! Reward Ledger
//!
//! Every balance, XP, unlock or algorithm change goes through here:
//!
//! 1. validate the delta locally (never sent when invalid)
//! 2. insert a pending entry if its key is absent
//! 3. commit: the store applies the delta and marks the entry applied atomically
//! 4. transient commit failures leave the entry pending for the sweep
//!
//! A key collision is not an error: the existing entry is returned as is.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use orebit_core::{
    Clock, EconomyError, LedgerDelta, LedgerEntry, LedgerKey, Result, SourceKind, UserId,
};
use orebit_storage::RemoteStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome counts of one [`RewardLedger::sweep`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub committed: usize,
    pub failed: usize,

    /// Still pending (too recent, or the store is unreachable)
    pub pending: usize,
}

/// Idempotent reward application over a [`RemoteStore`]
#[derive(Clone)]
pub struct RewardLedger {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    pending_retry_after: Duration,
    max_commit_attempts: u32,
}

impl RewardLedger {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        pending_retry_after: Duration,
        max_commit_attempts: u32,
    ) -> Self {
        Self {
            store,
            retry,
            clock,
            pending_retry_after,
            max_commit_attempts,
        }
    }

    /// Apply `delta` under `(user, kind, source_id)` at most once.
    ///
    /// Returns the stored entry: applied on success, or whatever an earlier
    /// writer left behind. A transient commit failure is reported as
    /// `SyncDelayed` and the entry stays pending.
    pub async fn apply(
        &self,
        user: &UserId,
        kind: SourceKind,
        source_id: impl Into<String>,
        delta: LedgerDelta,
    ) -> Result<LedgerEntry> {
        delta.validate(kind)?;

        let key = LedgerKey::new(user.clone(), kind, source_id);
        let entry = LedgerEntry::pending(key.clone(), delta, self.clock.now());

        let outcome = self
            .retry
            .run("insert_ledger_entry_if_absent", || {
                self.store.insert_ledger_entry_if_absent(entry.clone())
            })
            .await?;

        if !outcome.was_inserted() {
            debug!(key = %key, "Ledger key already present");
        }
        let stored = outcome.into_entry();
        if !stored.is_pending() {
            return Ok(stored);
        }

        self.commit(&key).await
    }

    /// Commit one pending entry, failing it permanently on non-retryable errors
    async fn commit(&self, key: &LedgerKey) -> Result<LedgerEntry> {
        let now = self.clock.now();
        let result = self
            .retry
            .run("commit_ledger_entry", || self.store.commit_ledger_entry(key, now))
            .await;

        match result {
            Ok(entry) => {
                if entry.is_applied() {
                    info!(key = %key, xp = entry.delta.xp, balance = entry.delta.balance, "Reward applied");
                }
                Ok(entry)
            }
            Err(e @ EconomyError::SyncDelayed { .. }) => {
                warn!(key = %key, error = %e, "Commit delayed; entry left pending");
                Err(e)
            }
            Err(e) => {
                error!(key = %key, code = e.code(), error = %e, "Ledger entry failed");
                self.mark_failed(key, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, key: &LedgerKey, reason: &str) {
        let now = self.clock.now();
        let result = self
            .retry
            .run("fail_ledger_entry", || {
                self.store.fail_ledger_entry(key, reason, now)
            })
            .await;
        if let Err(e) = result {
            // the sweep will see it again and retry the failure
            warn!(key = %key, error = %e, "Could not mark ledger entry failed");
        }
    }

    /// Retry pending entries older than the retry delay, for one user or all.
    ///
    /// Entries that have used up their commit attempts are marked failed.
    pub async fn sweep(&self, user: Option<&UserId>, now: DateTime<Utc>) -> Result<SweepReport> {
        let pending = self
            .retry
            .run("pending_ledger_entries", || {
                self.store.pending_ledger_entries(user)
            })
            .await?;

        let mut report = SweepReport::default();
        for entry in pending {
            if now - entry.created_at < self.pending_retry_after {
                report.pending += 1;
                continue;
            }
            if entry.attempts >= self.max_commit_attempts {
                error!(key = %entry.key, attempts = entry.attempts, "Commit attempts exhausted");
                self.mark_failed(&entry.key, "commit attempts exhausted").await;
                report.failed += 1;
                continue;
            }

            match self.commit(&entry.key).await {
                Ok(e) if e.is_applied() => report.committed += 1,
                Ok(_) => report.failed += 1,
                Err(e) if e.is_transient() || matches!(e, EconomyError::SyncDelayed { .. }) => {
                    report.pending += 1
                }
                Err(_) => report.failed += 1,
            }
        }

        if report != SweepReport::default() {
            debug!(
                committed = report.committed,
                failed = report.failed,
                pending = report.pending,
                "Ledger sweep finished"
            );
        }
        Ok(report)
    }

    /// Keys of every applied entry of `user`
    pub async fn applied_keys(&self, user: &UserId) -> Result<BTreeSet<LedgerKey>> {
        self.retry
            .run("applied_keys", || self.store.applied_keys(user))
            .await
    }

    pub async fn entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.retry
            .run("get_ledger_entry", || self.store.get_ledger_entry(key))
            .await
    }
}
