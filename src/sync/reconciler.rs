//! Page reconciliation.
//!
//! A [`Reconciler`] applies one page of remote records to a fresh child
//! context of the local store and commits it. Records whose key is in the
//! run's snapshot of existing keys are handed to `fill`, all others to
//! `create`.

use super::callbacks::SyncCallbacks;
use super::identity::{IdentityResolver, Key};
use crate::config::SyncTarget;
use crate::error::SyncError;
use crate::remote::RemoteRecord;
use crate::store::{Entity, LocalStore, StoreError, WorkingContext};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of reconciling one page
#[derive(Debug, Default)]
pub struct ReconciliationReport {
	pub page: u32,
	/// Identity keys of every record on the page that had one
	pub keys: BTreeSet<Key>,
	/// The commit changed the primary context
	pub had_writes: bool,
	pub created: usize,
	pub updated: usize,
	/// Records without identity, or repeats of a key created earlier in the run
	pub skipped: usize,
	/// Set when applying, committing or saving the page failed. If the
	/// commit itself failed, `created` and `updated` are zero.
	pub commit_error: Option<SyncError>,
}

impl ReconciliationReport {
	fn new(page: u32) -> Self {
		Self {
			page,
			..Default::default()
		}
	}
}

/// Applies pages of records to the local store for one run
pub struct Reconciler<S: LocalStore> {
	store: Arc<S>,
	identity: Arc<IdentityResolver>,
	callbacks: SyncCallbacks<S::Entity>,
	target: Arc<SyncTarget>,
	/// Keys created so far in this run, or being created by a page in flight
	claimed: Mutex<HashSet<Key>>,
}

impl<S: LocalStore> Reconciler<S> {
	pub fn new(
		store: Arc<S>,
		identity: Arc<IdentityResolver>,
		callbacks: SyncCallbacks<S::Entity>,
		target: Arc<SyncTarget>,
	) -> Self {
		Self {
			store,
			identity,
			callbacks,
			target,
			claimed: Mutex::new(HashSet::new()),
		}
	}

	/// Reconcile one page.
	///
	/// # Arguments
	/// * `page` - Position of the page within the run, for reporting.
	/// * `records` - The page's records.
	/// * `existing` - Keys present locally when the run started.
	///
	/// # Returns
	/// A report of the page. Commit failures are carried in the report so the
	/// page's keys still count as seen.
	///
	/// # Errors
	/// `SyncError::MixedIdentityTypes` when a record's key kind differs from
	/// the run's. This is fatal to the run.
	pub async fn reconcile(
		&self,
		page: u32,
		records: &[RemoteRecord],
		existing: &BTreeSet<Key>,
	) -> Result<ReconciliationReport, SyncError> {
		let mut report = ReconciliationReport::new(page);

		// Resolve keys first so a failed commit still reports them
		let mut keyed = Vec::with_capacity(records.len());
		for record in records {
			match self.identity.key_of(record) {
				Ok(key) => {
					report.keys.insert(key.clone());
					keyed.push((key, record));
				}
				Err(SyncError::MissingIdentity { field, reason }) => {
					warn!(page, %field, %reason, "Skipping record without identity");
					report.skipped += 1;
				}
				Err(e) => return Err(e),
			}
		}

		let mut context = self.store.child_context();
		let mut claimed = Vec::new();
		let merged = match self.apply(&mut context, &keyed, existing, &mut report, &mut claimed) {
			Ok(()) => self.merge(context).await,
			Err(e) => Err(e),
		};

		match merged {
			Ok(false) => {}
			Ok(true) => {
				// The entities are in the primary context, so their keys stay claimed
				if let Err(e) = self.store.save().await {
					warn!(page, error = %e, "Failed to save page");
					report.commit_error = Some(SyncError::TransactionCommit(e));
				} else {
					report.had_writes = true;
				}
			}
			Err(e) => {
				warn!(page, error = %e, "Failed to commit page, discarding its writes");
				self.release(&claimed);
				report.created = 0;
				report.updated = 0;
				report.commit_error = Some(SyncError::TransactionCommit(e));
			}
		}

		debug!(
			page,
			created = report.created,
			updated = report.updated,
			skipped = report.skipped,
			had_writes = report.had_writes,
			"Reconciled page"
		);
		Ok(report)
	}

	fn apply(
		&self,
		context: &mut S::Context,
		keyed: &[(Key, &RemoteRecord)],
		existing: &BTreeSet<Key>,
		report: &mut ReconciliationReport,
		claimed: &mut Vec<Key>,
	) -> Result<(), StoreError> {
		let field = self.identity.field();
		let predicate = self.target.predicate.as_ref();

		for (key, record) in keyed {
			if existing.contains(key) {
				if let Some(entity) = context.find(field, key, predicate)? {
					self.callbacks.fill(entity, record);
					report.updated += 1;
					continue;
				}
				warn!(%key, "Existing entity disappeared before reconciliation, creating it");
			}

			if !self.claim(key) {
				debug!(%key, "Key already created in this run, skipping duplicate");
				report.skipped += 1;
				continue;
			}
			claimed.push(key.clone());

			let entity = context.insert();
			entity.set(field, key.to_value());
			self.callbacks.create(entity, record);
			report.created += 1;
		}
		Ok(())
	}

	/// Commit a working context and save the primary context if it changed.
	pub(crate) async fn commit(&self, context: S::Context) -> Result<bool, StoreError> {
		let changed = self.merge(context).await?;
		if changed {
			self.store.save().await?;
		}
		Ok(changed)
	}

	/// Merge a working context into the primary context without saving.
	async fn merge(&self, context: S::Context) -> Result<bool, StoreError> {
		if !context.has_changes() {
			return Ok(false);
		}
		self.store.commit(context).await
	}

	fn claim(&self, key: &Key) -> bool {
		self.claimed.lock().insert(key.clone())
	}

	/// Give back keys whose creation was discarded, so a later record can create them.
	fn release(&self, keys: &[Key]) {
		let mut claimed = self.claimed.lock();
		for key in keys {
			claimed.remove(key);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{Document, MemoryStore};
	use serde_json::{Value, json};
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn records(values: Value) -> Vec<RemoteRecord> {
		serde_json::from_value(values).unwrap()
	}

	struct Fixture {
		store: Arc<MemoryStore>,
		fills: Arc<AtomicUsize>,
		creates: Arc<AtomicUsize>,
		reconciler: Reconciler<MemoryStore>,
	}

	fn fixture(local: &[i64]) -> Fixture {
		let store = Arc::new(MemoryStore::new());
		for id in local {
			store.insert(serde_json::from_value(json!({ "id": id, "name": format!("repo-{id}") })).unwrap());
		}

		let fills = Arc::new(AtomicUsize::new(0));
		let creates = Arc::new(AtomicUsize::new(0));
		let fill_count = Arc::clone(&fills);
		let create_count = Arc::clone(&creates);

		let callbacks = SyncCallbacks::new(
			move |entity: &mut Document, record: &RemoteRecord| {
				fill_count.fetch_add(1, Ordering::SeqCst);
				entity.update_if_changed("name", record.get("name").cloned());
			},
			move |entity: &mut Document, record: &RemoteRecord| {
				create_count.fetch_add(1, Ordering::SeqCst);
				entity.update_if_changed("name", record.get("name").cloned());
			},
			|_| {},
		);

		let reconciler = Reconciler::new(
			Arc::clone(&store),
			Arc::new(IdentityResolver::new("id")),
			callbacks,
			Arc::new(SyncTarget::new("https://api.test/items")),
		);

		Fixture {
			store,
			fills,
			creates,
			reconciler,
		}
	}

	#[tokio::test]
	async fn test_fill_existing_and_create_new() {
		let f = fixture(&[1, 2, 3]);
		let existing = BTreeSet::from([Key::Int(1), Key::Int(2), Key::Int(3)]);

		let page = records(json!([
			{ "id": 1, "name": "repo-1" },
			{ "id": 4, "name": "repo-4" }
		]));
		let report = f.reconciler.reconcile(1, &page, &existing).await.unwrap();

		assert_eq!(report.keys, BTreeSet::from([Key::Int(1), Key::Int(4)]));
		assert_eq!((report.updated, report.created), (1, 1));
		assert!(report.had_writes);
		assert_eq!(f.fills.load(Ordering::SeqCst), 1);
		assert_eq!(f.creates.load(Ordering::SeqCst), 1);

		let created = f.store.find("id", &Key::Int(4)).unwrap();
		assert_eq!(created.get("name"), Some(&json!("repo-4")));
		assert_eq!(f.store.save_count(), 1);
	}

	#[tokio::test]
	async fn test_unchanged_page_has_no_writes() {
		let f = fixture(&[1, 2]);
		let existing = BTreeSet::from([Key::Int(1), Key::Int(2)]);

		let page = records(json!([
			{ "id": 1, "name": "repo-1" },
			{ "id": 2, "name": "repo-2" }
		]));
		let report = f.reconciler.reconcile(1, &page, &existing).await.unwrap();

		assert!(!report.had_writes);
		assert_eq!(report.updated, 2);
		assert_eq!(f.store.save_count(), 0);
	}

	#[tokio::test]
	async fn test_records_without_identity_are_skipped() {
		let f = fixture(&[]);
		let page = records(json!([
			{ "name": "anonymous" },
			{ "id": null },
			{ "id": 9, "name": "repo-9" }
		]));

		let report = f.reconciler.reconcile(1, &page, &BTreeSet::new()).await.unwrap();

		assert_eq!(report.skipped, 2);
		assert_eq!(report.created, 1);
		assert_eq!(f.store.len(), 1);
	}

	#[tokio::test]
	async fn test_duplicate_new_key_created_once_per_run() {
		let f = fixture(&[]);
		let first = records(json!([{ "id": 5, "name": "a" }, { "id": 5, "name": "b" }]));
		let second = records(json!([{ "id": 5, "name": "c" }]));

		let report = f.reconciler.reconcile(1, &first, &BTreeSet::new()).await.unwrap();
		assert_eq!((report.created, report.skipped), (1, 1));

		let report = f.reconciler.reconcile(2, &second, &BTreeSet::new()).await.unwrap();
		assert_eq!((report.created, report.skipped), (0, 1));

		assert_eq!(f.store.len(), 1);
		assert_eq!(f.creates.load(Ordering::SeqCst), 1);
		assert_eq!(f.fills.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_vanished_existing_entity_is_created() {
		let f = fixture(&[]);
		let existing = BTreeSet::from([Key::Int(7)]);
		let page = records(json!([{ "id": 7, "name": "back" }]));

		let report = f.reconciler.reconcile(1, &page, &existing).await.unwrap();

		assert_eq!((report.updated, report.created), (0, 1));
		assert!(f.store.find("id", &Key::Int(7)).is_some());
	}

	/// Memory store that rejects a number of commits before accepting them
	struct RejectingStore {
		inner: MemoryStore,
		rejections: AtomicUsize,
	}

	#[async_trait::async_trait]
	impl LocalStore for RejectingStore {
		type Entity = Document;
		type Context = crate::store::MemoryContext;

		async fn field_values(
			&self,
			field: &str,
			predicate: Option<&crate::store::Predicate>,
		) -> Result<Vec<Value>, StoreError> {
			self.inner.field_values(field, predicate).await
		}

		fn child_context(&self) -> Self::Context {
			self.inner.child_context()
		}

		async fn commit(&self, context: Self::Context) -> Result<bool, StoreError> {
			let rejected = self
				.rejections
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok();
			if rejected {
				return Err(StoreError::CommitRejected("store is read-only".into()));
			}
			self.inner.commit(context).await
		}

		async fn save(&self) -> Result<(), StoreError> {
			self.inner.save().await
		}
	}

	#[tokio::test]
	async fn test_failed_commit_releases_created_keys() {
		let store = Arc::new(RejectingStore {
			inner: MemoryStore::new(),
			rejections: AtomicUsize::new(1),
		});
		let reconciler = Reconciler::new(
			Arc::clone(&store),
			Arc::new(IdentityResolver::new("id")),
			SyncCallbacks::upsert(
				|entity: &mut Document, record: &RemoteRecord| {
					entity.update_if_changed("name", record.get("name").cloned());
				},
				|_| {},
			),
			Arc::new(SyncTarget::new("https://api.test/items")),
		);
		let page = records(json!([{ "id": 4, "name": "repo-4" }]));

		let report = reconciler.reconcile(1, &page, &BTreeSet::new()).await.unwrap();
		assert!(matches!(report.commit_error, Some(SyncError::TransactionCommit(_))));
		assert_eq!(report.keys, BTreeSet::from([Key::Int(4)]));
		assert_eq!((report.created, report.skipped), (0, 0));
		assert!(!report.had_writes);
		assert!(store.inner.is_empty());

		// The same key on a later page is created, not skipped as a duplicate
		let report = reconciler.reconcile(2, &page, &BTreeSet::new()).await.unwrap();
		assert!(report.commit_error.is_none());
		assert_eq!((report.created, report.skipped), (1, 0));
		assert!(report.had_writes);
		assert!(store.inner.find("id", &Key::Int(4)).is_some());
	}

	#[tokio::test]
	async fn test_mixed_key_kinds_are_fatal() {
		let f = fixture(&[]);
		let page = records(json!([{ "id": 1 }, { "id": "one" }]));

		let result = f.reconciler.reconcile(1, &page, &BTreeSet::new()).await;
		assert!(matches!(result, Err(SyncError::MixedIdentityTypes { .. })));
		assert!(f.store.is_empty());
	}
}
