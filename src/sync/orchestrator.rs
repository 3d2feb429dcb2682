//! Sync orchestrator and integration point for all sync services.
//!
//! This module defines the `SyncOrchestrator`, which drives one remote
//! collection into a local store. A run snapshots the identity keys present
//! locally, then walks the collection page by page and reconciles every page
//! into the store while later pages are still being fetched.
//!
//! A run is made of two queues:
//! - the network queue, worked by a single task that fetches pages in order
//!   and retries failures with exponential backoff
//! - the reconciliation queue, whose pages are applied concurrently up to
//!   `SyncConfig::reconcile_concurrency`
//!
//! Each page's successor is queued before the page's records are released
//! for reconciliation, so the issued counters only reach the finished
//! counters once pagination has closed and every page has been applied. The
//! run settles exactly once on that condition, computes the keys that were not
//! seen remotely and notifies the caller.

use super::callbacks::SyncCallbacks;
use super::events::{EventDispatcher, RunOutcome, SyncEvent, SyncEventHandler};
use super::identity::{IdentityResolver, Key};
use super::reconciler::Reconciler;
use super::run_state::{Settlement, SyncPhase, SyncReport, SyncRunState};
use crate::config::{SyncConfig, SyncTarget};
use crate::error::SyncError;
use crate::remote::{PageFetcher, PageRequest, PageResult, RemoteRecord};
use crate::store::{LocalStore, WorkingContext};

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Main sync orchestrator that coordinates all sync components.
///
/// The orchestrator holds everything a run needs and can start any number
/// of runs, one after another or concurrently. Each run gets its own state,
/// key snapshot and queues.
pub struct SyncOrchestrator<S: LocalStore> {
    // Services
    fetcher: PageFetcher,
    store: Arc<S>,

    // Run definition
    target: Arc<SyncTarget>,
    callbacks: SyncCallbacks<S::Entity>,

    // Configuration
    config: SyncConfig,
    events: EventDispatcher,
}

impl<S: LocalStore> SyncOrchestrator<S> {
    /// Create a new orchestrator with the default engine configuration.
    pub fn new(
        fetcher: PageFetcher,
        store: Arc<S>,
        target: SyncTarget,
        callbacks: SyncCallbacks<S::Entity>,
    ) -> Self {
        Self {
            fetcher,
            store,
            target: Arc::new(target),
            callbacks,
            config: SyncConfig::default(),
            events: EventDispatcher::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an observer for the events of every run.
    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.events.register_handler(handler);
    }

    /// Start a run in the background.
    ///
    /// Must be called from within a Tokio runtime. The returned handle can
    /// observe the run's phase, stop it and wait for its report.
    pub fn start(&self) -> Result<SyncHandle, SyncError> {
        self.target.validate()?;
        self.config.validate()?;

        // Create run services
        let (control, settled_rx) = RunControl::new();
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let identity = Arc::new(IdentityResolver::new(self.target.identity_field.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&identity),
            self.callbacks.clone(),
            Arc::clone(&self.target),
        ));

        let run = Arc::new(Run {
            fetcher: self.fetcher.clone(),
            store: Arc::clone(&self.store),
            target: Arc::clone(&self.target),
            callbacks: self.callbacks.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            identity,
            reconciler,
            control: Arc::clone(&control),
            network_tx,
            reconcile_tx,
        });

        let phase = control.phase_tx.subscribe();
        let task = tokio::spawn(run.execute(network_rx, reconcile_rx, settled_rx));

        Ok(SyncHandle {
            control,
            phase,
            task,
        })
    }

    /// Run a sync to completion.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        self.start()?.wait().await
    }
}

/// Handle to a running sync
pub struct SyncHandle {
    control: Arc<RunControl>,
    phase: watch::Receiver<SyncPhase>,
    task: JoinHandle<Result<SyncReport, SyncError>>,
}

impl SyncHandle {
    /// Current phase of the run
    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Request cancellation.
    ///
    /// Queued pages and batches are dropped. Work already in flight runs to
    /// completion, after which the run resolves to `SyncError::Cancelled`.
    /// Neither completion callback is invoked for a cancelled run.
    pub async fn stop(&self) {
        let mut state = self.control.state.lock().await;
        if state.cancel() {
            info!("Sync run cancellation requested");
        }
        self.control.publish(&mut state);
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<SyncReport, SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::TaskFailed(e.to_string())),
        }
    }
}

/// State shared between a run's tasks and its handle
struct RunControl {
    state: Mutex<SyncRunState>,
    settled_tx: parking_lot::Mutex<Option<oneshot::Sender<Settlement>>>,
    phase_tx: watch::Sender<SyncPhase>,
    /// Flips to true once the run is aborted or cancelled
    halt_tx: watch::Sender<bool>,
}

impl RunControl {
    fn new() -> (Arc<Self>, oneshot::Receiver<Settlement>) {
        let (settled_tx, settled_rx) = oneshot::channel();
        let control = Self {
            state: Mutex::new(SyncRunState::new()),
            settled_tx: parking_lot::Mutex::new(Some(settled_tx)),
            phase_tx: watch::Sender::new(SyncPhase::Idle),
            halt_tx: watch::Sender::new(false),
        };
        (Arc::new(control), settled_rx)
    }

    /// Publish the effects of a state transition. Called with the state lock held.
    fn publish(&self, state: &mut SyncRunState) {
        if state.is_halted() {
            self.halt_tx.send_replace(true);
        }
        if let Some(settlement) = state.try_settle() {
            if let Some(settled_tx) = self.settled_tx.lock().take() {
                if settled_tx.send(settlement).is_err() {
                    warn!("Sync run settled after its driver stopped");
                }
            }
        }
        self.phase_tx.send_replace(state.phase());
    }

    fn set_phase(&self, state: &mut SyncRunState, phase: SyncPhase) {
        state.set_phase(phase);
        self.phase_tx.send_replace(phase);
    }
}

/// A page of records waiting on the reconciliation queue
struct ReconcileJob {
    page: u32,
    records: Vec<RemoteRecord>,
}

/// Everything one run's tasks share
struct Run<S: LocalStore> {
    fetcher: PageFetcher,
    store: Arc<S>,
    target: Arc<SyncTarget>,
    callbacks: SyncCallbacks<S::Entity>,
    config: SyncConfig,
    events: EventDispatcher,
    identity: Arc<IdentityResolver>,
    reconciler: Arc<Reconciler<S>>,
    control: Arc<RunControl>,
    network_tx: UnboundedSender<PageRequest>,
    reconcile_tx: UnboundedSender<ReconcileJob>,
}

impl<S: LocalStore> Run<S> {
    async fn execute(
        self: Arc<Self>,
        network_rx: UnboundedReceiver<PageRequest>,
        reconcile_rx: UnboundedReceiver<ReconcileJob>,
        settled_rx: oneshot::Receiver<Settlement>,
    ) -> Result<SyncReport, SyncError> {
        self.control.state.lock().await.begin();

        // Snapshot local keys once; removals are computed against this set
        let existing = match self
            .identity
            .existing_keys(self.store.as_ref(), &self.target)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Failed to snapshot local identity keys");
                let mut state = self.control.state.lock().await;
                state.abort(SyncError::aborted(0, e));
                self.control.publish(&mut state);
                BTreeSet::new()
            }
        };
        let existing = Arc::new(existing);

        // Start workers
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let network = tokio::spawn(Arc::clone(&self).network_worker(network_rx, shutdown_rx.clone()));
        let reconciliation = tokio::spawn(Arc::clone(&self).reconcile_dispatcher(
            reconcile_rx,
            Arc::clone(&existing),
            shutdown_rx,
        ));

        if !self.control.state.lock().await.is_halted() {
            self.events
                .dispatch(&SyncEvent::RunStarted {
                    url: self.target.url.clone(),
                    existing: existing.len(),
                })
                .await;
        }

        {
            let mut state = self.control.state.lock().await;
            if !state.is_halted() {
                state.issue_network();
                self.enqueue_page(PageRequest::first());
            }
            self.control.publish(&mut state);
        }

        let settlement = settled_rx.await;

        // Stop workers
        let _ = shutdown_tx.send(true);
        for worker in [network, reconciliation] {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sync worker ended abnormally");
            }
        }

        let settlement = settlement
            .map_err(|_| SyncError::TaskFailed("run ended without settling".to_string()))?;

        match settlement {
            Settlement::Completed => {
                let report = self.finalize(&existing).await;
                info!("{}", report.summary());
                self.callbacks.finished(report.had_changes);
                self.events
                    .dispatch(&SyncEvent::RunSettled {
                        outcome: RunOutcome::Completed {
                            had_changes: report.had_changes,
                        },
                    })
                    .await;
                Ok(report)
            }
            Settlement::Aborted(error) => {
                error!(error = %error, "Sync run aborted");
                self.callbacks.aborted(&error);
                self.events
                    .dispatch(&SyncEvent::RunSettled {
                        outcome: RunOutcome::Aborted {
                            reason: error.to_string(),
                        },
                    })
                    .await;
                Err(error)
            }
            Settlement::Cancelled => {
                info!("Sync run cancelled");
                self.events
                    .dispatch(&SyncEvent::RunSettled {
                        outcome: RunOutcome::Cancelled,
                    })
                    .await;
                Err(SyncError::Cancelled)
            }
        }
    }

    /// Single task working the network queue in order.
    async fn network_worker(
        self: Arc<Self>,
        mut requests: UnboundedReceiver<PageRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = self.backoff();

        loop {
            let request = tokio::select! {
                Some(request) = requests.recv() => request,
                _ = shutdown.changed() => break,
            };
            self.process_page(request, &mut backoff).await;
        }

        debug!("Network worker stopped");
    }

    async fn process_page(&self, request: PageRequest, backoff: &mut ExponentialBackoff) {
        {
            let mut state = self.control.state.lock().await;
            if state.is_halted() {
                debug!(page = request.number, "Dropping queued page of a halted run");
                state.finish_network();
                self.control.publish(&mut state);
                return;
            }
        }

        match self
            .fetcher
            .fetch_page(&self.target, request.token.as_ref())
            .await
        {
            Ok(page) => {
                backoff.reset();
                self.accept_page(request, page).await;
            }
            Err(e) => self.handle_failure(request, e.into(), backoff).await,
        }
    }

    async fn accept_page(&self, request: PageRequest, page: PageResult) {
        let fetched = SyncEvent::PageFetched {
            page: request.number,
            records: page.records.len(),
            has_next: page.next.is_some(),
        };
        let mut closed = None;

        {
            let mut state = self.control.state.lock().await;
            state.record_page_fetched();

            if state.is_halted() {
                debug!(page = request.number, "Discarding page fetched after halt");
            } else {
                // Queue the next page before releasing this page's records
                match page.next {
                    Some(token) => {
                        state.issue_network();
                        self.enqueue_page(request.next(token));
                    }
                    None => {
                        if state.close_pagination(page.rate_limited) {
                            closed = Some(SyncEvent::PaginationClosed {
                                pages: request.number,
                                rate_limited: page.rate_limited,
                            });
                        }
                    }
                }

                if !page.records.is_empty() {
                    state.issue_reconciliation();
                    self.enqueue_reconciliation(ReconcileJob {
                        page: request.number,
                        records: page.records,
                    });
                }
            }

            state.finish_network();
            self.control.publish(&mut state);
        }

        self.events.dispatch(&fetched).await;
        if let Some(closed) = closed {
            self.events.dispatch(&closed).await;
        }
    }

    async fn handle_failure(
        &self,
        request: PageRequest,
        error: SyncError,
        backoff: &mut ExponentialBackoff,
    ) {
        let attempt = self.control.state.lock().await.record_failure();
        let delay = if attempt <= self.config.max_retries {
            backoff.next_backoff()
        } else {
            None
        };

        let Some(delay) = delay else {
            error!(
                page = request.number,
                attempt,
                error = %error,
                "Page fetch failed, giving up"
            );
            let mut state = self.control.state.lock().await;
            state.abort(SyncError::aborted(attempt, error));
            state.finish_network();
            self.control.publish(&mut state);
            return;
        };

        warn!(
            page = request.number,
            attempt,
            ?delay,
            error = %error,
            "Page fetch failed, retrying"
        );
        self.events
            .dispatch(&SyncEvent::RetryScheduled {
                page: request.number,
                attempt,
                delay,
                error: error.to_string(),
            })
            .await;

        // Cut the delay short if the run halts meanwhile
        let mut halted = self.control.halt_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = async {
                let _ = halted.wait_for(|halted| *halted).await;
            } => {}
        }

        let mut state = self.control.state.lock().await;
        if state.is_halted() {
            debug!(page = request.number, "Dropping retry of a halted run");
        } else {
            state.issue_network();
            self.enqueue_page(request);
        }
        state.finish_network();
        self.control.publish(&mut state);
    }

    /// Feeds queued pages to reconciliation tasks, bounded by the concurrency limit.
    async fn reconcile_dispatcher(
        self: Arc<Self>,
        mut jobs: UnboundedReceiver<ReconcileJob>,
        existing: Arc<BTreeSet<Key>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.reconcile_concurrency));

        loop {
            let job = tokio::select! {
                Some(job) = jobs.recv() => job,
                _ = shutdown.changed() => break,
            };
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            tokio::spawn(Arc::clone(&self).reconcile_page(job, Arc::clone(&existing), permit));
        }

        debug!("Reconciliation dispatcher stopped");
    }

    async fn reconcile_page(
        self: Arc<Self>,
        job: ReconcileJob,
        existing: Arc<BTreeSet<Key>>,
        _permit: OwnedSemaphorePermit,
    ) {
        let page = job.page;

        {
            let mut state = self.control.state.lock().await;
            if state.is_halted() {
                debug!(page, "Dropping queued reconciliation of a halted run");
                state.finish_reconciliation();
                self.control.publish(&mut state);
                return;
            }
        }

        // Run in its own task so a panicking callback still finishes the batch
        let reconciler = Arc::clone(&self.reconciler);
        let outcome = tokio::spawn(async move {
            reconciler
                .reconcile(job.page, &job.records, &existing)
                .await
        })
        .await;

        // Events go out before the batch counts as finished
        if let Ok(Ok(report)) = &outcome {
            if let Some(e) = &report.commit_error {
                self.events
                    .dispatch(&SyncEvent::CommitFailed {
                        page,
                        error: e.to_string(),
                    })
                    .await;
            }
            self.events
                .dispatch(&SyncEvent::PageReconciled {
                    page,
                    created: report.created,
                    updated: report.updated,
                    skipped: report.skipped,
                    had_writes: report.had_writes,
                })
                .await;
        }

        let mut state = self.control.state.lock().await;
        match outcome {
            Ok(Ok(report)) => state.merge_report(report),
            Ok(Err(e)) => {
                error!(page, error = %e, "Reconciliation failed, aborting run");
                state.abort(SyncError::aborted(0, e));
            }
            Err(e) => {
                error!(page, error = %e, "Reconciliation task panicked, aborting run");
                state.abort(SyncError::aborted(0, SyncError::TaskFailed(e.to_string())));
            }
        }
        state.finish_reconciliation();
        self.control.publish(&mut state);
    }

    /// Compute removal candidates and build the report of a completed run.
    async fn finalize(&self, existing: &BTreeSet<Key>) -> SyncReport {
        let (seen, truncated) = {
            let state = self.control.state.lock().await;
            (state.seen_keys().clone(), state.is_truncated())
        };

        let removed: BTreeSet<Key> = existing.difference(&seen).cloned().collect();
        if truncated && !removed.is_empty() {
            warn!(
                candidates = removed.len(),
                "Pagination stopped at the rate limit, removal candidates may still exist remotely"
            );
        }

        if !removed.is_empty() {
            self.offer_removals(&removed).await;
        }

        let mut state = self.control.state.lock().await;
        let report = state.report(removed);
        self.control.set_phase(&mut state, SyncPhase::Completed);
        report
    }

    async fn offer_removals(&self, removed: &BTreeSet<Key>) {
        let field = self.identity.field();
        let predicate = self.target.predicate.as_ref();
        let mut context = self.store.child_context();
        let mut offered = Vec::new();

        for key in removed {
            match context.find(field, key, predicate) {
                Ok(Some(entity)) => {
                    self.callbacks.removal_candidate(entity);
                    offered.push(key.clone());
                }
                Ok(None) => debug!(%key, "Removal candidate is no longer in the store"),
                Err(e) => warn!(%key, error = %e, "Failed to load removal candidate"),
            }
        }

        let commit = self.reconciler.commit(context).await;
        {
            let mut state = self.control.state.lock().await;
            match commit {
                Ok(true) => state.mark_changed(),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to commit removal candidate changes");
                    state.mark_degraded();
                }
            }
        }

        for key in offered {
            self.events
                .dispatch(&SyncEvent::RemovalCandidate { key })
                .await;
        }
    }

    fn enqueue_page(&self, request: PageRequest) {
        if self.network_tx.send(request).is_err() {
            error!("Network queue closed while the run is active");
        }
    }

    fn enqueue_reconciliation(&self, job: ReconcileJob) {
        if self.reconcile_tx.send(job).is_err() {
            error!("Reconciliation queue closed while the run is active");
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_max_elapsed_time(None)
            .build()
    }
}
