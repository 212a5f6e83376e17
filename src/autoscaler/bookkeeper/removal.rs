//! Safe bookie removal.
//!
//! A bookie is only removed once it has been proven to hold no data the rest
//! of the cluster depends on. Each candidate moves through
//!
//! ```text
//! Writable -> MarkedReadOnly -> Recovered -> CookieDeleted
//!                  \                 \
//!                   +--> Failed <-----+      (read-only flag rolled back)
//! ```
//!
//! Every step is a barrier: it is attempted for all candidates before the
//! next one starts. The outcome is summarised once at the end and turned
//! into the replica change to apply.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BookieAdmin, BookieNodeInfo};

/// Why a candidate did not reach `CookieDeleted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ReadOnlyRejected,
    RecoveryFailed,
    /// An earlier candidate's recovery failed first
    RecoverySkipped,
    ResidualLedgers,
    ReplicationUnhealthy,
    CookieNotDeleted,
    /// A higher-ordinal candidate could not be removed, so this one must stay
    Blocked,
    Cancelled,
}

/// Progress of one candidate through the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    Writable,
    MarkedReadOnly,
    Recovered,
    CookieDeleted,
    Failed(FailureReason),
}

impl CandidateState {
    pub fn after_read_only(self, ok: bool) -> Self {
        match (self, ok) {
            (CandidateState::Writable, true) => CandidateState::MarkedReadOnly,
            (CandidateState::Writable, false) => {
                CandidateState::Failed(FailureReason::ReadOnlyRejected)
            }
            (other, _) => other,
        }
    }

    pub fn after_recovery(self, ok: bool) -> Self {
        match (self, ok) {
            (CandidateState::MarkedReadOnly, true) => CandidateState::Recovered,
            (CandidateState::MarkedReadOnly, false) => {
                CandidateState::Failed(FailureReason::RecoveryFailed)
            }
            (other, _) => other,
        }
    }

    pub fn after_ledger_check(self, may_hold_ledgers: bool) -> Self {
        match (self, may_hold_ledgers) {
            (CandidateState::Recovered, true) => {
                CandidateState::Failed(FailureReason::ResidualLedgers)
            }
            (other, _) => other,
        }
    }

    pub fn after_cookie_deletion(self, ok: bool) -> Self {
        match (self, ok) {
            (CandidateState::Recovered, true) => CandidateState::CookieDeleted,
            (CandidateState::Recovered, false) => {
                CandidateState::Failed(FailureReason::CookieNotDeleted)
            }
            (other, _) => other,
        }
    }

    /// Fail any candidate that has not finished yet
    pub fn abort(self, reason: FailureReason) -> Self {
        match self {
            CandidateState::CookieDeleted | CandidateState::Failed(_) => self,
            _ => CandidateState::Failed(reason),
        }
    }

    /// Whether the candidate's read-only flag must be unset again.
    ///
    /// A rejected read-only request may still have been applied, so every
    /// candidate that stays gets the flag cleared.
    pub fn needs_rollback(&self) -> bool {
        *self != CandidateState::CookieDeleted
    }
}

/// One candidate and where it stands
#[derive(Debug, Clone)]
pub struct RemovalAttempt {
    pub node: BookieNodeInfo,
    pub state: CandidateState,
}

/// How the protocol ended as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Every candidate was removed
    Complete,
    /// Only the highest-ordinal candidates were removed
    Partial,
    /// Nothing may be removed this run
    Aborted(FailureReason),
}

/// Immutable result of one protocol run
#[derive(Debug, Clone)]
pub struct RemovalSummary {
    pub requested: u32,
    pub removed: u32,
    pub outcome: RemovalOutcome,
    pub attempts: Vec<RemovalAttempt>,
}

impl RemovalSummary {
    fn from_attempts(attempts: Vec<RemovalAttempt>, aborted: Option<FailureReason>) -> Self {
        let requested = attempts.len() as u32;
        let removed = attempts
            .iter()
            .filter(|a| a.state == CandidateState::CookieDeleted)
            .count() as u32;
        let outcome = match aborted {
            Some(reason) if removed == 0 => RemovalOutcome::Aborted(reason),
            _ if removed == requested && requested > 0 => RemovalOutcome::Complete,
            _ if removed > 0 => RemovalOutcome::Partial,
            Some(reason) => RemovalOutcome::Aborted(reason),
            None => RemovalOutcome::Aborted(FailureReason::Blocked),
        };
        Self {
            requested,
            removed,
            outcome,
            attempts,
        }
    }

    /// Replica change to apply: minus the removed count, zero when aborted
    pub fn applied_delta(&self) -> i32 {
        match self.outcome {
            RemovalOutcome::Aborted(_) => 0,
            RemovalOutcome::Complete | RemovalOutcome::Partial => {
                -(self.removed.min(self.requested) as i32)
            }
        }
    }
}

/// Last `count` nodes of the ordinal-sorted list, i.e. the ones a lower
/// replica count removes.
pub fn candidates(nodes: &[BookieNodeInfo], count: usize) -> Vec<BookieNodeInfo> {
    let start = nodes.len().saturating_sub(count);
    nodes[start..].to_vec()
}

/// Drives candidates through the removal steps
pub struct RemovalProtocol<'a> {
    admin: &'a BookieAdmin,
    settle_delay: Duration,
    cookie_attempts: u32,
}

impl<'a> RemovalProtocol<'a> {
    pub fn new(admin: &'a BookieAdmin, settle_delay: Duration, cookie_attempts: u32) -> Self {
        Self {
            admin,
            settle_delay,
            cookie_attempts,
        }
    }

    /// Run the protocol for `candidates` (ordinal order, highest last).
    ///
    /// `query_pod` hosts the cluster-wide under-replication check. Only the
    /// settle delay observes `cancel`; recovery and cookie deletion always run
    /// to completion once started, and the read-only rollback always runs.
    pub async fn run(
        &self,
        candidates: Vec<BookieNodeInfo>,
        query_pod: &str,
        cancel: &CancellationToken,
    ) -> RemovalSummary {
        let mut attempts: Vec<RemovalAttempt> = candidates
            .into_iter()
            .map(|node| RemovalAttempt {
                node,
                state: CandidateState::Writable,
            })
            .collect();

        let aborted = self.advance(&mut attempts, query_pod, cancel).await;
        if let Some(reason) = aborted {
            for attempt in attempts.iter_mut() {
                attempt.state = attempt.state.abort(reason);
            }
        }

        self.roll_back(&attempts).await;
        RemovalSummary::from_attempts(attempts, aborted)
    }

    /// Steps 1-5. Returns the reason when the whole batch has to be abandoned.
    async fn advance(
        &self,
        attempts: &mut [RemovalAttempt],
        query_pod: &str,
        cancel: &CancellationToken,
    ) -> Option<FailureReason> {
        // Mark read-only
        for attempt in attempts.iter_mut() {
            let result = self.admin.set_read_only(&attempt.node.pod, true).await;
            if let Err(e) = &result {
                warn!(pod = %attempt.node.pod, error = %e, "failed to mark bookie read-only");
            }
            attempt.state = attempt.state.after_read_only(result.is_ok());
        }
        if attempts.iter().any(|a| matches!(a.state, CandidateState::Failed(_))) {
            return Some(FailureReason::ReadOnlyRejected);
        }

        // Let the cluster react to the read-only bookies
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("bookie removal cancelled during settle delay");
                return Some(FailureReason::Cancelled);
            }
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        // Recover, fail-fast
        let mut recovery_failed = false;
        for attempt in attempts.iter_mut() {
            if recovery_failed {
                attempt.state = attempt.state.abort(FailureReason::RecoverySkipped);
                continue;
            }
            let ok = self
                .admin
                .recover(&attempt.node.pod, &attempt.node.bookie_id)
                .await;
            attempt.state = attempt.state.after_recovery(ok);
            recovery_failed = !ok;
        }
        if recovery_failed {
            return Some(FailureReason::RecoveryFailed);
        }

        // Verify nothing is left on each candidate
        for attempt in attempts.iter_mut() {
            let residual = self
                .admin
                .may_hold_ledgers(&attempt.node.pod, &attempt.node.bookie_id)
                .await;
            attempt.state = attempt.state.after_ledger_check(residual);
        }

        // Replication must be healthy cluster-wide
        if !self.admin.no_under_replicated_ledgers(query_pod).await {
            return Some(FailureReason::ReplicationUnhealthy);
        }

        // Delete cookies from the highest ordinal down; a lower replica count
        // can only drop a suffix of the set, so stop at the first failure.
        let mut blocked = false;
        for attempt in attempts.iter_mut().rev() {
            if blocked || attempt.state != CandidateState::Recovered {
                blocked = true;
                attempt.state = attempt.state.abort(FailureReason::Blocked);
                continue;
            }
            let node = &attempt.node;
            let still_holds = self.admin.may_hold_ledgers(&node.pod, &node.bookie_id).await;
            let state = attempt.state.after_ledger_check(still_holds);
            if state != CandidateState::Recovered {
                attempt.state = state;
                blocked = true;
                continue;
            }
            let deleted = self
                .admin
                .delete_cookie(&node.pod, &node.bookie_id, self.cookie_attempts)
                .await;
            attempt.state = state.after_cookie_deletion(deleted);
            if !deleted {
                blocked = true;
                continue;
            }
            if let Err(e) = self.admin.retire_version_markers(&node.pod).await {
                warn!(pod = %node.pod, error = %e, "failed to retire VERSION markers");
            }
            info!(pod = %node.pod, bookie_id = %node.bookie_id, "bookie cookie deleted");
        }

        None
    }

    /// Unset read-only on every candidate that is staying, best-effort.
    async fn roll_back(&self, attempts: &[RemovalAttempt]) {
        for attempt in attempts.iter().filter(|a| a.state.needs_rollback()) {
            match self.admin.set_read_only(&attempt.node.pod, false).await {
                Ok(()) => info!(pod = %attempt.node.pod, state = ?attempt.state, "bookie returned to writable"),
                Err(e) => warn!(pod = %attempt.node.pod, error = %e, "failed to roll back read-only flag"),
            }
        }
    }
}
