//! Caller-supplied hooks invoked during a sync run.

use crate::error::SyncError;
use crate::remote::RemoteRecord;
use crate::store::Entity;
use std::sync::Arc;

type RecordHook<E> = Arc<dyn Fn(&mut E, &RemoteRecord) + Send + Sync>;
type EntityHook<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

fn ignore_entity<E>(_: &mut E) {}

fn ignore_error(_: &SyncError) {}

/// Hooks a sync run calls into.
///
/// * `fill` updates an entity that already exists locally.
/// * `create` populates a freshly inserted entity. The identity field is
///   already set when it runs.
/// * `removal_candidate` is offered every in-scope entity whose key was not
///   seen remotely. Changes it makes are committed. Defaults to a no-op.
/// * `on_finished` fires once per completed run with the change flag.
/// * `on_aborted` fires once per aborted run. Defaults to a no-op.
///
/// `fill` and `create` run on reconciliation tasks, so they must be
/// `Send + Sync`. Using [`Entity::update_if_changed`] inside them keeps
/// unchanged pages from producing writes.
pub struct SyncCallbacks<E> {
	fill: RecordHook<E>,
	create: RecordHook<E>,
	removal_candidate: EntityHook<E>,
	on_finished: Arc<dyn Fn(bool) + Send + Sync>,
	on_aborted: Arc<dyn Fn(&SyncError) + Send + Sync>,
}

impl<E: Entity> SyncCallbacks<E> {
	pub fn new(
		fill: impl Fn(&mut E, &RemoteRecord) + Send + Sync + 'static,
		create: impl Fn(&mut E, &RemoteRecord) + Send + Sync + 'static,
		on_finished: impl Fn(bool) + Send + Sync + 'static,
	) -> Self {
		Self {
			fill: Arc::new(fill),
			create: Arc::new(create),
			removal_candidate: Arc::new(ignore_entity::<E>),
			on_finished: Arc::new(on_finished),
			on_aborted: Arc::new(ignore_error),
		}
	}

	/// Use one hook for both new and existing entities.
	pub fn upsert(
		fill: impl Fn(&mut E, &RemoteRecord) + Send + Sync + 'static,
		on_finished: impl Fn(bool) + Send + Sync + 'static,
	) -> Self {
		let fill: RecordHook<E> = Arc::new(fill);
		Self {
			fill: Arc::clone(&fill),
			create: fill,
			removal_candidate: Arc::new(ignore_entity::<E>),
			on_finished: Arc::new(on_finished),
			on_aborted: Arc::new(ignore_error),
		}
	}

	pub fn with_removal_candidate(mut self, hook: impl Fn(&mut E) + Send + Sync + 'static) -> Self {
		self.removal_candidate = Arc::new(hook);
		self
	}

	pub fn with_on_aborted(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
		self.on_aborted = Arc::new(hook);
		self
	}

	pub(crate) fn fill(&self, entity: &mut E, record: &RemoteRecord) {
		(self.fill)(entity, record)
	}

	pub(crate) fn create(&self, entity: &mut E, record: &RemoteRecord) {
		(self.create)(entity, record)
	}

	pub(crate) fn removal_candidate(&self, entity: &mut E) {
		(self.removal_candidate)(entity)
	}

	pub(crate) fn finished(&self, had_changes: bool) {
		(self.on_finished)(had_changes)
	}

	pub(crate) fn aborted(&self, error: &SyncError) {
		(self.on_aborted)(error)
	}
}

impl<E> Clone for SyncCallbacks<E> {
	fn clone(&self) -> Self {
		Self {
			fill: Arc::clone(&self.fill),
			create: Arc::clone(&self.create),
			removal_candidate: Arc::clone(&self.removal_candidate),
			on_finished: Arc::clone(&self.on_finished),
			on_aborted: Arc::clone(&self.on_aborted),
		}
	}
}
