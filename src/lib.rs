//! Incremental synchronization of paginated JSON collections into a local store.
//!
//! A sync run walks a remote collection page by page, following `Link`
//! headers, and reconciles every record into a [`LocalStore`] by its identity
//! key. Records already present locally are handed to a fill callback, new
//! ones to a create callback. Keys that were present locally but not seen
//! remotely are offered as removal candidates once the run completes.
//!
//! ```no_run
//! use collection_sync::{
//!     Document, Entity, FetchConfig, MemoryStore, PageFetcher, SyncCallbacks, SyncOrchestrator, SyncTarget,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let callbacks = SyncCallbacks::upsert(
//!     |repo: &mut Document, record| {
//!         repo.update_if_changed("name", record.get("name").cloned());
//!     },
//!     |had_changes| println!("done, changed: {had_changes}"),
//! );
//! let orchestrator = SyncOrchestrator::new(
//!     PageFetcher::with_reqwest(FetchConfig::default())?,
//!     store,
//!     SyncTarget::new("https://api.github.com/repositories"),
//!     callbacks,
//! );
//! let report = orchestrator.sync().await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::{FetchConfig, PageNumberScheme, SyncConfig, SyncTarget};
pub use error::SyncError;
pub use remote::{
    FetchError, HttpResponse, HttpTransport, PageFetcher, PageRequest, PageResult, PageToken,
    RemoteRecord, ReqwestTransport,
};
pub use store::{
    Document, Entity, LocalStore, MemoryContext, MemoryStore, Predicate, StoreError,
    WorkingContext,
};
pub use sync::{
    EventDispatcher, Key, KeyKind, RunOutcome, SyncCallbacks, SyncEvent, SyncEventHandler,
    SyncHandle, SyncOrchestrator, SyncPhase, SyncReport, TracingObserver,
};
