//! Identity keys and their resolution.
//!
//! Remote records and local entities are matched through the value of a
//! single identity field. A key is either an integer or a string and every key
//! of one run must be of the same kind.

use crate::config::SyncTarget;
use crate::error::SyncError;
use crate::remote::RemoteRecord;
use crate::store::LocalStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;

/// Identity key of a record or entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
	Int(i64),
	Str(String),
}

/// Kind of an identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
	Int,
	Str,
}

impl fmt::Display for KeyKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyKind::Int => write!(f, "integer"),
			KeyKind::Str => write!(f, "string"),
		}
	}
}

impl Key {
	/// Key held by a JSON value. Only integers and strings qualify.
	pub fn from_value(value: &Value) -> Option<Key> {
		match value {
			Value::Number(number) => number.as_i64().map(Key::Int),
			Value::String(s) => Some(Key::Str(s.clone())),
			_ => None,
		}
	}

	pub fn to_value(&self) -> Value {
		match self {
			Key::Int(n) => Value::from(*n),
			Key::Str(s) => Value::from(s.as_str()),
		}
	}

	pub fn kind(&self) -> KeyKind {
		match self {
			Key::Int(_) => KeyKind::Int,
			Key::Str(_) => KeyKind::Str,
		}
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Key::Int(n) => write!(f, "{}", n),
			Key::Str(s) => write!(f, "{}", s),
		}
	}
}

impl From<i64> for Key {
	fn from(value: i64) -> Self {
		Key::Int(value)
	}
}

impl From<&str> for Key {
	fn from(value: &str) -> Self {
		Key::Str(value.to_string())
	}
}

impl From<String> for Key {
	fn from(value: String) -> Self {
		Key::Str(value)
	}
}

/// Extract the identity key of a record.
///
/// # Returns
/// `SyncError::MissingIdentity` when the field is absent, `null` or holds a
/// value that is neither an integer nor a string.
pub fn key_of(record: &RemoteRecord, identity_field: &str) -> Result<Key, SyncError> {
	let missing = |reason: String| SyncError::MissingIdentity {
		field: identity_field.to_string(),
		reason,
	};

	match record.get(identity_field) {
		None | Some(Value::Null) => Err(missing("field is absent".to_string())),
		Some(value) => Key::from_value(value).ok_or_else(|| {
			missing(format!("unsupported identity value {}", value))
		}),
	}
}

/// Resolves keys for a single run and pins the run's key kind.
///
/// The first key seen, local or remote, fixes the kind. Any later key of the
/// other kind fails with `SyncError::MixedIdentityTypes`.
#[derive(Debug)]
pub struct IdentityResolver {
	field: String,
	kind: OnceLock<KeyKind>,
}

impl IdentityResolver {
	pub fn new(field: impl Into<String>) -> Self {
		Self {
			field: field.into(),
			kind: OnceLock::new(),
		}
	}

	pub fn field(&self) -> &str {
		&self.field
	}

	/// Kind pinned so far, if any key was resolved.
	pub fn kind(&self) -> Option<KeyKind> {
		self.kind.get().copied()
	}

	/// Key of a remote record, checked against the run's key kind.
	pub fn key_of(&self, record: &RemoteRecord) -> Result<Key, SyncError> {
		let key = key_of(record, &self.field)?;
		self.pin(key.kind())?;
		Ok(key)
	}

	/// Snapshot the identity keys of every local entity in the target's scope.
	///
	/// Entities whose identity field is missing or unusable are left out of
	/// the snapshot and therefore never become removal candidates.
	pub async fn existing_keys<S: LocalStore>(
		&self,
		store: &S,
		target: &SyncTarget,
	) -> Result<BTreeSet<Key>, SyncError> {
		let values = store
			.field_values(&self.field, target.predicate.as_ref())
			.await?;

		let mut keys = BTreeSet::new();
		let mut unusable = 0usize;
		for value in &values {
			match Key::from_value(value) {
				Some(key) => {
					self.pin(key.kind())?;
					keys.insert(key);
				}
				None => unusable += 1,
			}
		}

		if unusable > 0 {
			debug!(
				field = %self.field,
				unusable,
				"Ignoring local entities without a usable identity"
			);
		}
		Ok(keys)
	}

	fn pin(&self, kind: KeyKind) -> Result<(), SyncError> {
		let pinned = *self.kind.get_or_init(|| kind);
		if pinned == kind {
			Ok(())
		} else {
			Err(SyncError::MixedIdentityTypes {
				field: self.field.clone(),
				first: pinned,
				second: kind,
			})
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryStore;
	use serde_json::json;

	fn record(value: Value) -> RemoteRecord {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn test_key_of() {
		assert_eq!(key_of(&record(json!({ "id": 42 })), "id").unwrap(), Key::Int(42));
		assert_eq!(
			key_of(&record(json!({ "login": "octocat" })), "login").unwrap(),
			Key::from("octocat")
		);

		for bad in [json!({}), json!({ "id": null }), json!({ "id": 1.5 }), json!({ "id": [1] })] {
			assert!(matches!(
				key_of(&record(bad), "id"),
				Err(SyncError::MissingIdentity { .. })
			));
		}
	}

	#[test]
	fn test_resolver_rejects_mixed_kinds() {
		let resolver = IdentityResolver::new("id");

		assert!(resolver.key_of(&record(json!({ "id": 1 }))).is_ok());
		assert_eq!(resolver.kind(), Some(KeyKind::Int));

		let err = resolver.key_of(&record(json!({ "id": "1" }))).unwrap_err();
		assert!(matches!(
			err,
			SyncError::MixedIdentityTypes {
				first: KeyKind::Int,
				second: KeyKind::Str,
				..
			}
		));
	}

	#[test]
	fn test_missing_identity_does_not_pin() {
		let resolver = IdentityResolver::new("id");
		assert!(resolver.key_of(&record(json!({ "name": "x" }))).is_err());
		assert_eq!(resolver.kind(), None);
	}

	#[tokio::test]
	async fn test_existing_keys_snapshot() {
		let store = MemoryStore::new();
		for value in [json!({ "id": 3 }), json!({ "id": 1 }), json!({ "name": "no id" })] {
			store.insert(serde_json::from_value(value).unwrap());
		}
		let target = SyncTarget::new("https://api.test/items");
		let resolver = IdentityResolver::new("id");

		let keys = resolver.existing_keys(&store, &target).await.unwrap();
		assert_eq!(keys, BTreeSet::from([Key::Int(1), Key::Int(3)]));

		// Remote keys must now match the local kind
		assert!(resolver.key_of(&record(json!({ "id": "abc" }))).is_err());
	}

	#[tokio::test]
	async fn test_existing_keys_mixed_locally() {
		let store = MemoryStore::new();
		for value in [json!({ "id": 3 }), json!({ "id": "three" })] {
			store.insert(serde_json::from_value(value).unwrap());
		}
		let target = SyncTarget::new("https://api.test/items");

		let result = IdentityResolver::new("id").existing_keys(&store, &target).await;
		assert!(matches!(result, Err(SyncError::MixedIdentityTypes { .. })));
	}
}
