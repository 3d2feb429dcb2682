//! In-memory [`LocalStore`] with optional JSON file persistence.
//!
//! The primary context is a table of [`Document`]s keyed by row id. Child
//! contexts copy the rows they touch on first access and keep inserts and
//! deletions to themselves until they are committed. Saving the primary
//! context writes the whole table to a JSON file when the store was opened
//! with a path.

use super::{Entity, LocalStore, Predicate, StoreError, WorkingContext};
use crate::sync::Key;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// A JSON field map used as the entity type of [`MemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
	fields: Map<String, Value>,
	#[serde(skip)]
	changed: bool,
}

impl Document {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_fields(fields: Map<String, Value>) -> Self {
		Self {
			fields,
			changed: false,
		}
	}

	pub fn fields(&self) -> &Map<String, Value> {
		&self.fields
	}

	fn mark_clean(&mut self) {
		self.changed = false;
	}
}

impl Entity for Document {
	fn get(&self, field: &str) -> Option<&Value> {
		self.fields.get(field)
	}

	fn set(&mut self, field: &str, value: Value) {
		self.fields.insert(field.to_string(), value);
		self.changed = true;
	}

	fn has_changes(&self) -> bool {
		self.changed
	}
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Table {
	next_row: u64,
	rows: BTreeMap<u64, Document>,
}

impl Table {
	fn allocate_row(&mut self) -> u64 {
		self.next_row += 1;
		self.next_row
	}
}

/// On-disk layout of a saved store
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
	saved_at: DateTime<Utc>,
	table: Table,
}

fn holds_key(doc: &Document, field: &str, key: &Key) -> bool {
	doc.get(field).and_then(Key::from_value).as_ref() == Some(key)
}

fn in_scope(doc: &Document, predicate: Option<&Predicate>) -> bool {
	predicate.is_none_or(|predicate| predicate.matches(doc))
}

/// In-memory store of JSON documents
pub struct MemoryStore {
	primary: Arc<Mutex<Table>>,
	path: Option<PathBuf>,
	save_lock: tokio::sync::Mutex<()>,
	saves: AtomicU64,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	/// Create an empty store that is never written to disk.
	pub fn new() -> Self {
		Self {
			primary: Arc::new(Mutex::new(Table::default())),
			path: None,
			save_lock: tokio::sync::Mutex::new(()),
			saves: AtomicU64::new(0),
		}
	}

	/// Open a store persisted at `path`, loading it if the file exists.
	pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let path = path.into();

		let table = if tokio::fs::try_exists(&path).await? {
			let bytes = tokio::fs::read(&path).await?;
			let file: StoreFile = serde_json::from_slice(&bytes)?;
			info!(
				"Loaded {} documents from {:?} saved at {}",
				file.table.rows.len(),
				path,
				file.saved_at.to_rfc3339()
			);
			file.table
		} else {
			debug!("No store file at {:?}, starting empty", path);
			Table::default()
		};

		Ok(Self {
			primary: Arc::new(Mutex::new(table)),
			path: Some(path),
			save_lock: tokio::sync::Mutex::new(()),
			saves: AtomicU64::new(0),
		})
	}

	/// Insert a document straight into the primary context.
	pub fn insert(&self, fields: Map<String, Value>) {
		let mut table = self.primary.lock();
		let row = table.allocate_row();
		table.rows.insert(row, Document::from_fields(fields));
	}

	/// Primary-context document whose `field` holds `key`.
	pub fn find(&self, field: &str, key: &Key) -> Option<Document> {
		self.primary
			.lock()
			.rows
			.values()
			.find(|doc| holds_key(doc, field, key))
			.cloned()
	}

	pub fn len(&self) -> usize {
		self.primary.lock().rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of times the primary context was saved.
	pub fn save_count(&self) -> u64 {
		self.saves.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl LocalStore for MemoryStore {
	type Entity = Document;
	type Context = MemoryContext;

	async fn field_values(
		&self,
		field: &str,
		predicate: Option<&Predicate>,
	) -> Result<Vec<Value>, StoreError> {
		let table = self.primary.lock();
		Ok(table
			.rows
			.values()
			.filter(|doc| in_scope(doc, predicate))
			.filter_map(|doc| doc.get(field).cloned())
			.collect())
	}

	fn child_context(&self) -> MemoryContext {
		MemoryContext {
			primary: Arc::clone(&self.primary),
			touched: BTreeMap::new(),
			inserted: Vec::new(),
			removed: BTreeSet::new(),
		}
	}

	async fn commit(&self, context: MemoryContext) -> Result<bool, StoreError> {
		if !Arc::ptr_eq(&self.primary, &context.primary) {
			return Err(StoreError::CommitRejected(
				"context belongs to another store".to_string(),
			));
		}
		if !context.has_changes() {
			return Ok(false);
		}

		let mut table = self.primary.lock();
		let mut changed = false;

		for (row, mut doc) in context.touched {
			// Rows deleted by a concurrent commit stay deleted
			if doc.has_changes() && table.rows.contains_key(&row) {
				doc.mark_clean();
				table.rows.insert(row, doc);
				changed = true;
			}
		}
		for row in context.removed {
			changed |= table.rows.remove(&row).is_some();
		}
		for mut doc in context.inserted {
			doc.mark_clean();
			let row = table.allocate_row();
			table.rows.insert(row, doc);
			changed = true;
		}

		Ok(changed)
	}

	async fn save(&self) -> Result<(), StoreError> {
		let _guard = self.save_lock.lock().await;
		self.saves.fetch_add(1, Ordering::SeqCst);

		let Some(path) = &self.path else {
			return Ok(());
		};

		let file = StoreFile {
			saved_at: Utc::now(),
			table: self.primary.lock().clone(),
		};
		let json = serde_json::to_vec_pretty(&file)?;

		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		// Write to a sibling file and swap it in
		let tmp_path = path.with_extension("tmp");
		tokio::fs::write(&tmp_path, json).await?;
		tokio::fs::rename(&tmp_path, path).await?;

		debug!("Saved {} documents to {:?}", file.table.rows.len(), path);
		Ok(())
	}
}

/// Child context of a [`MemoryStore`]
pub struct MemoryContext {
	primary: Arc<Mutex<Table>>,
	/// Primary rows copied into this context on first access
	touched: BTreeMap<u64, Document>,
	inserted: Vec<Document>,
	removed: BTreeSet<u64>,
}

impl MemoryContext {
	/// Row id of the primary document matching `key`, copying it in on first access.
	fn fault_in(&mut self, field: &str, key: &Key, predicate: Option<&Predicate>) -> Option<u64> {
		if let Some(row) = self
			.touched
			.iter()
			.find(|(_, doc)| holds_key(doc, field, key) && in_scope(doc, predicate))
			.map(|(row, _)| *row)
		{
			return Some(row);
		}

		let (row, doc) = {
			let table = self.primary.lock();
			table
				.rows
				.iter()
				.find(|(row, doc)| {
					!self.touched.contains_key(row)
						&& !self.removed.contains(row)
						&& holds_key(doc, field, key)
						&& in_scope(doc, predicate)
				})
				.map(|(row, doc)| (*row, doc.clone()))?
		};
		self.touched.insert(row, doc);
		Some(row)
	}
}

impl WorkingContext for MemoryContext {
	type Entity = Document;

	fn find(
		&mut self,
		field: &str,
		key: &Key,
		predicate: Option<&Predicate>,
	) -> Result<Option<&mut Document>, StoreError> {
		if let Some(index) = self
			.inserted
			.iter()
			.position(|doc| holds_key(doc, field, key) && in_scope(doc, predicate))
		{
			return Ok(self.inserted.get_mut(index));
		}

		match self.fault_in(field, key, predicate) {
			Some(row) => Ok(self.touched.get_mut(&row)),
			None => Ok(None),
		}
	}

	fn insert(&mut self) -> &mut Document {
		let index = self.inserted.len();
		self.inserted.push(Document {
			fields: Map::new(),
			changed: true,
		});
		&mut self.inserted[index]
	}

	fn remove(
		&mut self,
		field: &str,
		key: &Key,
		predicate: Option<&Predicate>,
	) -> Result<bool, StoreError> {
		if let Some(index) = self
			.inserted
			.iter()
			.position(|doc| holds_key(doc, field, key) && in_scope(doc, predicate))
		{
			self.inserted.remove(index);
			return Ok(true);
		}

		match self.fault_in(field, key, predicate) {
			Some(row) => {
				self.touched.remove(&row);
				self.removed.insert(row);
				Ok(true)
			}
			None => Ok(false),
		}
	}

	fn has_changes(&self) -> bool {
		!self.inserted.is_empty()
			|| !self.removed.is_empty()
			|| self.touched.values().any(Document::has_changes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn fields(value: Value) -> Map<String, Value> {
		match value {
			Value::Object(map) => map,
			_ => panic!("expected an object"),
		}
	}

	fn seeded() -> MemoryStore {
		let store = MemoryStore::new();
		store.insert(fields(json!({ "id": 1, "name": "grit" })));
		store.insert(fields(json!({ "id": 2, "name": "merb-core" })));
		store
	}

	#[test]
	fn test_update_if_changed_skips_equal_values() {
		let mut doc = Document::from_fields(fields(json!({ "name": "grit" })));

		assert!(!doc.update_if_changed("name", "grit"));
		assert!(!doc.update_if_changed("description", Value::Null));
		assert!(!doc.has_changes());

		assert!(doc.update_if_changed("name", "grit2"));
		assert!(doc.has_changes());
	}

	#[tokio::test]
	async fn test_child_changes_invisible_until_commit() {
		let store = seeded();
		let mut context = store.child_context();

		let doc = context.find("id", &Key::Int(1), None).unwrap().unwrap();
		doc.set("name", json!("renamed"));
		context.insert().set("id", json!(3));

		assert_eq!(store.len(), 2);
		assert_eq!(
			store.find("id", &Key::Int(1)).unwrap().get("name"),
			Some(&json!("grit"))
		);

		assert!(store.commit(context).await.unwrap());
		assert_eq!(store.len(), 3);
		assert_eq!(
			store.find("id", &Key::Int(1)).unwrap().get("name"),
			Some(&json!("renamed"))
		);
		assert!(!store.find("id", &Key::Int(3)).unwrap().has_changes());
	}

	#[tokio::test]
	async fn test_find_returns_same_copy_and_sees_inserts() {
		let store = seeded();
		let mut context = store.child_context();

		context
			.find("id", &Key::Int(2), None)
			.unwrap()
			.unwrap()
			.set("stars", json!(5));
		let again = context.find("id", &Key::Int(2), None).unwrap().unwrap();
		assert_eq!(again.get("stars"), Some(&json!(5)));

		context.insert().set("id", json!("abc"));
		assert!(context.find("id", &Key::from("abc"), None).unwrap().is_some());
		assert!(context.find("id", &Key::Int(9), None).unwrap().is_none());
	}

	#[tokio::test]
	async fn test_unchanged_context_commits_nothing() {
		let store = seeded();
		let mut context = store.child_context();

		let doc = context.find("id", &Key::Int(1), None).unwrap().unwrap();
		doc.update_if_changed("name", "grit");

		assert!(!context.has_changes());
		assert!(!store.commit(context).await.unwrap());
	}

	#[tokio::test]
	async fn test_predicate_scopes_lookup_and_projection() {
		let store = MemoryStore::new();
		store.insert(fields(json!({ "id": 1, "owner": "a" })));
		store.insert(fields(json!({ "id": 2, "owner": "b" })));
		let scope = Predicate::eq("owner", "a");

		let values = store.field_values("id", Some(&scope)).await.unwrap();
		assert_eq!(values, vec![json!(1)]);

		let mut context = store.child_context();
		assert!(context.find("id", &Key::Int(2), Some(&scope)).unwrap().is_none());
		assert!(context.find("id", &Key::Int(1), Some(&scope)).unwrap().is_some());
	}

	#[tokio::test]
	async fn test_remove() {
		let store = seeded();
		let mut context = store.child_context();

		assert!(context.remove("id", &Key::Int(1), None).unwrap());
		assert!(!context.remove("id", &Key::Int(1), None).unwrap());
		assert!(context.find("id", &Key::Int(1), None).unwrap().is_none());

		assert!(store.commit(context).await.unwrap());
		assert_eq!(store.len(), 1);
	}

	#[tokio::test]
	async fn test_commit_rejects_foreign_context() {
		let store = seeded();
		let other = MemoryStore::new();

		let mut context = other.child_context();
		context.insert().set("id", json!(1));

		assert!(matches!(
			store.commit(context).await,
			Err(StoreError::CommitRejected(_))
		));
	}

	#[tokio::test]
	async fn test_save_and_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested").join("repos.json");

		let store = MemoryStore::open(&path).await.unwrap();
		assert!(store.is_empty());
		store.insert(fields(json!({ "id": 1, "name": "grit" })));
		store.save().await.unwrap();
		assert_eq!(store.save_count(), 1);

		let reopened = MemoryStore::open(&path).await.unwrap();
		assert_eq!(reopened.len(), 1);

		// Row ids keep increasing across reopen
		reopened.insert(fields(json!({ "id": 2 })));
		let mut context = reopened.child_context();
		assert!(context.find("id", &Key::Int(1), None).unwrap().is_some());
		assert!(context.find("id", &Key::Int(2), None).unwrap().is_some());
	}
}
