//! Local store abstraction
//!
//! The sync engine never talks to a database directly. It works through a
//! [`LocalStore`] that can project identity values, hand out isolated child
//! [`WorkingContext`]s for page batches and commit them back into the primary
//! context. [`MemoryStore`] is the bundled implementation.

/// In-memory store with optional JSON persistence
mod memory;
/// Entity filters
mod predicate;

pub use memory::{Document, MemoryContext, MemoryStore};
pub use predicate::Predicate;

use crate::sync::Key;
use serde_json::Value;

/// Error types for local store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Commit rejected: {0}")]
	CommitRejected(String),

	#[error("Query failed: {0}")]
	QueryFailed(String),
}

/// A mutable local record addressed by field name.
pub trait Entity: Send + Sync + 'static {
	fn get(&self, field: &str) -> Option<&Value>;

	/// Write a field unconditionally and mark the entity changed.
	fn set(&mut self, field: &str, value: Value);

	/// True once any field was written since the entity was loaded.
	fn has_changes(&self) -> bool;

	/// Write `value` only when it differs from the stored value.
	///
	/// An absent field compares equal to `null`. Returns whether a write
	/// happened, so repeated fills with unchanged data leave the entity clean.
	fn update_if_changed(&mut self, field: &str, value: impl Into<Value>) -> bool
	where
		Self: Sized,
	{
		let value = value.into();
		if self.get(field).unwrap_or(&Value::Null) == &value {
			return false;
		}
		self.set(field, value);
		true
	}
}

/// An isolated unit of work over the store.
///
/// Changes made in a context are invisible to the primary context and to
/// other contexts until [`LocalStore::commit`] succeeds.
pub trait WorkingContext: Send + 'static {
	type Entity: Entity;

	/// Find the entity whose `field` holds `key`, limited to entities
	/// matching `predicate`. Entities inserted in this context are included.
	fn find(
		&mut self,
		field: &str,
		key: &Key,
		predicate: Option<&Predicate>,
	) -> Result<Option<&mut Self::Entity>, StoreError>;

	/// Insert a new empty entity.
	fn insert(&mut self) -> &mut Self::Entity;

	/// Delete the entity whose `field` holds `key`. Returns whether one existed.
	fn remove(
		&mut self,
		field: &str,
		key: &Key,
		predicate: Option<&Predicate>,
	) -> Result<bool, StoreError>;

	fn has_changes(&self) -> bool;
}

/// Store the sync engine reconciles into
#[async_trait::async_trait]
pub trait LocalStore: Send + Sync + 'static {
	type Entity: Entity;
	type Context: WorkingContext<Entity = Self::Entity>;

	/// Values of `field` for every entity matching `predicate`.
	async fn field_values(
		&self,
		field: &str,
		predicate: Option<&Predicate>,
	) -> Result<Vec<Value>, StoreError>;

	/// Open a child context over the current primary state.
	fn child_context(&self) -> Self::Context;

	/// Merge a child context into the primary context.
	///
	/// # Returns
	/// Whether the primary context changed.
	async fn commit(&self, context: Self::Context) -> Result<bool, StoreError>;

	/// Persist the primary context.
	async fn save(&self) -> Result<(), StoreError>;
}
