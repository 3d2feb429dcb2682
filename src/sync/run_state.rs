//! Bookkeeping for a single sync run.
//!
//! `SyncRunState` holds the issued and finished counters of the network and
//! reconciliation queues, the keys seen so far and the run's terminal flags.
//! The orchestrator keeps it behind one mutex and asks it after every
//! transition whether the run has settled. Settlement is latched, so a run
//! settles exactly once.
//!
//! `SyncReport` is the summary handed back when a run completes.

use super::identity::Key;
use super::reconciler::ReconciliationReport;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    /// Not started yet
    Idle,
    /// Pages are still being requested
    Paginating,
    /// Pagination closed, reconciliation still running
    Draining,
    /// All work done, removal candidates and completion pending
    Finalizing,
    Completed,
    Aborted,
    Cancelled,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Completed | SyncPhase::Aborted | SyncPhase::Cancelled
        )
    }
}

/// How a run settled
#[derive(Debug)]
pub enum Settlement {
    /// Pagination closed and every task finished
    Completed,
    /// A terminal error stopped the run
    Aborted(SyncError),
    /// The caller stopped the run
    Cancelled,
}

/// Mutable state of one run
#[derive(Debug)]
pub struct SyncRunState {
    network_issued: u32,
    network_finished: u32,
    reconciliation_issued: u32,
    reconciliation_finished: u32,
    /// Identity keys of every reconciled record
    seen_keys: BTreeSet<Key>,
    pagination_closed: bool,
    rate_limited: bool,
    /// Consecutive failed page fetches
    retries: u32,
    pages_fetched: u32,
    had_changes: bool,
    degraded: bool,
    created: usize,
    updated: usize,
    skipped: usize,
    cancelled: bool,
    abort: Option<SyncError>,
    settled: bool,
    phase: SyncPhase,
    started_at: DateTime<Utc>,
}

impl Default for SyncRunState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncRunState {
    pub fn new() -> Self {
        Self {
            network_issued: 0,
            network_finished: 0,
            reconciliation_issued: 0,
            reconciliation_finished: 0,
            seen_keys: BTreeSet::new(),
            pagination_closed: false,
            rate_limited: false,
            retries: 0,
            pages_fetched: 0,
            had_changes: false,
            degraded: false,
            created: 0,
            updated: 0,
            skipped: 0,
            cancelled: false,
            abort: None,
            settled: false,
            phase: SyncPhase::Idle,
            started_at: Utc::now(),
        }
    }

    /// Mark the run as started
    pub fn begin(&mut self) {
        self.started_at = Utc::now();
        if !self.is_halted() {
            self.phase = SyncPhase::Paginating;
        }
    }

    pub fn issue_network(&mut self) {
        self.network_issued += 1;
    }

    pub fn finish_network(&mut self) {
        self.network_finished += 1;
    }

    pub fn issue_reconciliation(&mut self) {
        self.reconciliation_issued += 1;
    }

    pub fn finish_reconciliation(&mut self) {
        self.reconciliation_finished += 1;
    }

    /// Record a successfully fetched page; resets the retry counter
    pub fn record_page_fetched(&mut self) {
        self.pages_fetched += 1;
        self.retries = 0;
    }

    /// Record a failed page fetch, returning the number of consecutive failures
    pub fn record_failure(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    /// Close pagination. Returns false if it was already closed.
    pub fn close_pagination(&mut self, rate_limited: bool) -> bool {
        if self.pagination_closed {
            warn!("Pagination closed twice");
            return false;
        }
        self.pagination_closed = true;
        self.rate_limited = rate_limited;
        if self.phase == SyncPhase::Paginating {
            self.phase = SyncPhase::Draining;
        }
        true
    }

    /// Merge the outcome of a reconciled page
    pub fn merge_report(&mut self, report: ReconciliationReport) {
        self.seen_keys.extend(report.keys);
        self.had_changes |= report.had_writes;
        self.degraded |= report.commit_error.is_some();
        self.created += report.created;
        self.updated += report.updated;
        self.skipped += report.skipped;
    }

    /// Mark the run degraded without tying it to a page
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn mark_changed(&mut self) {
        self.had_changes = true;
    }

    /// Record a terminal error. The first terminal condition wins.
    pub fn abort(&mut self, error: SyncError) {
        if self.is_halted() || self.settled {
            warn!(error = %error, "Ignoring abort of a halted run");
            return;
        }
        self.abort = Some(error);
    }

    /// Request cancellation. Returns false if the run was already halted or settled.
    pub fn cancel(&mut self) -> bool {
        if self.is_halted() || self.settled {
            return false;
        }
        self.cancelled = true;
        true
    }

    /// True once the run was aborted or cancelled; no new work may be issued
    pub fn is_halted(&self) -> bool {
        self.cancelled || self.abort.is_some()
    }

    /// Every issued task has finished
    pub fn is_quiescent(&self) -> bool {
        self.network_issued == self.network_finished
            && self.reconciliation_issued == self.reconciliation_finished
    }

    /// Settle the run if it is done.
    ///
    /// Returns `Some` exactly once: the first time the run is quiescent and
    /// either halted or past pagination.
    pub fn try_settle(&mut self) -> Option<Settlement> {
        if self.settled || !self.is_quiescent() {
            return None;
        }

        let settlement = if self.cancelled {
            self.phase = SyncPhase::Cancelled;
            Settlement::Cancelled
        } else if let Some(error) = self.abort.take() {
            self.phase = SyncPhase::Aborted;
            Settlement::Aborted(error)
        } else if self.pagination_closed {
            self.phase = SyncPhase::Finalizing;
            Settlement::Completed
        } else {
            return None;
        };

        // Keys of an unfinished run say nothing about removals
        if !matches!(settlement, Settlement::Completed) {
            self.seen_keys.clear();
        }

        self.settled = true;
        info!(
            pages = self.pages_fetched,
            network_tasks = self.network_issued,
            reconciliation_tasks = self.reconciliation_issued,
            phase = ?self.phase,
            "Sync run settled"
        );
        Some(settlement)
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
    }

    pub fn seen_keys(&self) -> &BTreeSet<Key> {
        &self.seen_keys
    }

    /// Pagination ended early because of an exhausted rate limit
    pub fn is_truncated(&self) -> bool {
        self.rate_limited
    }

    /// Build the report of a completed run
    pub fn report(&self, removed: BTreeSet<Key>) -> SyncReport {
        SyncReport {
            had_changes: self.had_changes,
            degraded: self.degraded,
            truncated: self.rate_limited,
            pages_fetched: self.pages_fetched,
            created: self.created,
            updated: self.updated,
            skipped: self.skipped,
            seen: self.seen_keys.clone(),
            removed,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// A commit changed the local store
    pub had_changes: bool,
    /// At least one page failed to commit
    pub degraded: bool,
    /// Pagination stopped at an exhausted rate limit, so `removed` may hold keys
    /// that are still present remotely
    pub truncated: bool,
    pub pages_fetched: u32,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub seen: BTreeSet<Key>,
    /// Keys present locally at start but not seen remotely
    pub removed: BTreeSet<Key>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// Get a human-readable summary of the run
    pub fn summary(&self) -> String {
        format!(
            "Synced {} pages in {}ms: {} created, {} updated, {} skipped, {} removal candidates{}{}",
            self.pages_fetched,
            (self.finished_at - self.started_at).num_milliseconds(),
            self.created,
            self.updated,
            self.skipped,
            self.removed.len(),
            if self.truncated { " (rate limited)" } else { "" },
            if self.degraded { " (degraded)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_report(keys: &[i64], had_writes: bool) -> ReconciliationReport {
        ReconciliationReport {
            page: 1,
            keys: keys.iter().copied().map(Key::Int).collect(),
            had_writes,
            created: keys.len(),
            ..Default::default()
        }
    }

    #[test]
    fn test_settles_once_after_all_work() {
        let mut state = SyncRunState::new();
        state.begin();

        state.issue_network();
        state.issue_reconciliation();
        state.close_pagination(false);
        state.finish_network();
        assert!(state.try_settle().is_none());
        assert_eq!(state.phase(), SyncPhase::Draining);

        state.merge_report(page_report(&[1, 2], true));
        state.finish_reconciliation();
        assert!(matches!(state.try_settle(), Some(Settlement::Completed)));
        assert!(state.try_settle().is_none());
        assert_eq!(state.phase(), SyncPhase::Finalizing);

        let report = state.report(BTreeSet::new());
        assert!(report.had_changes);
        assert_eq!(report.seen.len(), 2);
    }

    #[test]
    fn test_quiescent_but_open_pagination_does_not_settle() {
        let mut state = SyncRunState::new();
        state.begin();
        state.issue_network();
        state.finish_network();

        assert!(state.try_settle().is_none());
    }

    #[test]
    fn test_abort_waits_for_in_flight_tasks() {
        let mut state = SyncRunState::new();
        state.begin();
        state.issue_network();
        state.issue_reconciliation();
        state.merge_report(page_report(&[1], false));

        state.abort(SyncError::Cancelled);
        state.finish_network();
        assert!(state.try_settle().is_none());

        state.finish_reconciliation();
        assert!(matches!(state.try_settle(), Some(Settlement::Aborted(_))));
        assert!(state.seen_keys().is_empty());
        assert_eq!(state.phase(), SyncPhase::Aborted);
    }

    #[test]
    fn test_first_terminal_condition_wins() {
        let mut state = SyncRunState::new();
        state.begin();
        assert!(state.cancel());
        assert!(!state.cancel());
        state.abort(SyncError::InvalidConfig("late".into()));

        assert!(matches!(state.try_settle(), Some(Settlement::Cancelled)));
        assert!(!state.cancel());
    }

    #[test]
    fn test_retry_counter_resets_on_success() {
        let mut state = SyncRunState::new();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        state.record_page_fetched();
        assert_eq!(state.record_failure(), 1);
    }

    #[test]
    fn test_pagination_closes_once() {
        let mut state = SyncRunState::new();
        state.begin();
        assert!(state.close_pagination(true));
        assert!(!state.close_pagination(false));
        assert!(state.is_truncated());
    }
}
