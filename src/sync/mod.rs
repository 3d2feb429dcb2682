//! Collection Synchronization Module
//!
//! This module provides the core logic for synchronizing a paginated remote collection into a
//! local store. It is composed of several submodules, each responsible for one aspect of a run:
//!
//! - `orchestrator`: The entry point. Runs the network and reconciliation queues and settles the run.
//! - `events`: Event types and handler traits for observing a run.
//! - `identity`: Identity keys, key extraction and the local key snapshot.
//! - `reconciler`: Applies one page of records to the store in a child context.
//! - `run_state`: Counters, seen keys and terminal flags of a run, plus the run report.
//! - `callbacks`: The hooks a caller provides to populate and retire entities.

/// Caller-supplied hooks
pub mod callbacks;
/// Event system for observing sync runs
pub mod events;
/// Identity keys and their resolution
pub mod identity;
/// Main coordinator for sync runs
pub mod orchestrator;
/// Page reconciliation into the local store
pub mod reconciler;
/// Run bookkeeping and reporting
pub mod run_state;

pub use callbacks::SyncCallbacks;
pub use events::{EventDispatcher, RunOutcome, SyncEvent, SyncEventHandler, TracingObserver};
pub use identity::{IdentityResolver, Key, KeyKind, key_of};
pub use orchestrator::*;
pub use reconciler::{ReconciliationReport, Reconciler};
pub use run_state::{Settlement, SyncPhase, SyncReport, SyncRunState};
