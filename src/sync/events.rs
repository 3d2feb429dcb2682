//! Event system for collection synchronization.
//!
//! The orchestrator emits a [`SyncEvent`] at every step of a run: when it
//! starts, when a page is fetched or reconciled, when a retry is scheduled,
//! when pagination closes and when the run settles. Events go to every
//! registered [`SyncEventHandler`], which keeps observers such as logging or
//! progress reporting out of the sync logic.

use super::identity::Key;
use crate::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminal outcome of a run, as reported in [`SyncEvent::RunSettled`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { had_changes: bool },
    Aborted { reason: String },
    Cancelled,
}

/// Events that occur during a sync run
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The local snapshot was taken and pagination is starting
    RunStarted { url: String, existing: usize },
    /// A page was fetched
    PageFetched {
        page: u32,
        records: usize,
        has_next: bool,
    },
    /// A page fetch failed and will be retried
    RetryScheduled {
        page: u32,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// A page was applied to the local store
    PageReconciled {
        page: u32,
        created: usize,
        updated: usize,
        skipped: usize,
        had_writes: bool,
    },
    /// A page could not be committed; the run continues degraded
    CommitFailed { page: u32, error: String },
    /// No further pages will be requested
    PaginationClosed { pages: u32, rate_limited: bool },
    /// A local entity was not seen remotely
    RemovalCandidate { key: Key },
    /// The run reached a terminal outcome
    RunSettled { outcome: RunOutcome },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and can perform side effects.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order. A failing handler is logged
/// and does not stop the others.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a new event handler.
    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch an event to all registered handlers.
    pub async fn dispatch(&self, event: &SyncEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait::async_trait]
impl SyncEventHandler for TracingObserver {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::RunStarted { url, existing } => {
                info!(%url, existing, "Sync run started");
            }
            SyncEvent::PageFetched {
                page,
                records,
                has_next,
            } => {
                debug!(page, records, has_next, "Page fetched");
            }
            SyncEvent::RetryScheduled {
                page,
                attempt,
                delay,
                error,
            } => {
                warn!(page, attempt, ?delay, %error, "Retrying page fetch");
            }
            SyncEvent::PageReconciled {
                page,
                created,
                updated,
                skipped,
                had_writes,
            } => {
                debug!(page, created, updated, skipped, had_writes, "Page reconciled");
            }
            SyncEvent::CommitFailed { page, error } => {
                warn!(page, %error, "Page commit failed");
            }
            SyncEvent::PaginationClosed {
                pages,
                rate_limited,
            } => {
                info!(pages, rate_limited, "Pagination closed");
            }
            SyncEvent::RemovalCandidate { key } => {
                debug!(%key, "Removal candidate");
            }
            SyncEvent::RunSettled { outcome } => {
                info!(?outcome, "Sync run settled");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SyncEvent>>,
    }

    #[async_trait::async_trait]
    impl SyncEventHandler for Recorder {
        async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Failing;

    #[async_trait::async_trait]
    impl SyncEventHandler for Failing {
        async fn handle(&self, _event: &SyncEvent) -> Result<(), SyncError> {
            Err(SyncError::InvalidConfig("handler failure".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(Failing));
        dispatcher.register_handler(recorder.clone());
        dispatcher.register_handler(Arc::new(TracingObserver));

        let event = SyncEvent::PaginationClosed {
            pages: 2,
            rate_limited: false,
        };
        dispatcher.dispatch(&event).await;

        assert_eq!(recorder.events.lock().as_slice(), &[event]);
    }
}
