//!
//! Configuration for sync targets, the sync engine and the page fetcher.
//!
//! All three structs deserialize with serde so they can be loaded from a file,
//! and each has a `Default` (or builder) covering the common case.

use crate::error::SyncError;
use crate::store::Predicate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

fn default_identity_field() -> String {
	"id".to_string()
}

/// Describes one remote collection and how it maps to local entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTarget {
	/// URL of the first page of the collection
	pub url: String,
	/// Field carrying the identity key, both remotely and locally
	#[serde(default = "default_identity_field")]
	pub identity_field: String,
	/// Extra request headers sent with every page request
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	/// Page size requested from the server through the page size parameter
	#[serde(default)]
	pub page_size_hint: Option<u32>,
	/// Restricts which local entities take part in the sync
	#[serde(default)]
	pub predicate: Option<Predicate>,
}

impl SyncTarget {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			identity_field: default_identity_field(),
			headers: BTreeMap::new(),
			page_size_hint: None,
			predicate: None,
		}
	}

	pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
		self.identity_field = field.into();
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.insert(name.into(), value.into());
		self
	}

	/// Adds an `Authorization: Bearer` header.
	pub fn with_bearer_token(self, token: impl AsRef<str>) -> Self {
		let value = format!("Bearer {}", token.as_ref());
		self.with_header("Authorization", value)
	}

	pub fn with_page_size(mut self, page_size: u32) -> Self {
		self.page_size_hint = Some(page_size);
		self
	}

	pub fn with_predicate(mut self, predicate: Predicate) -> Self {
		self.predicate = Some(predicate);
		self
	}

	/// Check the target before a run starts.
	///
	/// # Returns
	/// `SyncError::InvalidConfig` when the URL does not parse, the identity
	/// field is empty or the page size hint is zero.
	pub fn validate(&self) -> Result<(), SyncError> {
		Url::parse(&self.url)
			.map_err(|e| SyncError::InvalidConfig(format!("invalid target url '{}': {}", self.url, e)))?;

		if self.identity_field.trim().is_empty() {
			return Err(SyncError::InvalidConfig(
				"identity field must not be empty".to_string(),
			));
		}
		if self.page_size_hint == Some(0) {
			return Err(SyncError::InvalidConfig(
				"page size hint must be positive".to_string(),
			));
		}
		Ok(())
	}
}

/// Tuning for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Consecutive failed page fetches tolerated before the run aborts
	pub max_retries: u32,
	/// First retry delay
	pub initial_backoff_ms: u64,
	/// Upper bound for a single retry delay
	pub max_backoff_ms: u64,
	/// Reconciliation batches allowed to run at the same time
	pub reconcile_concurrency: usize,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff_ms: 500,
			max_backoff_ms: 30_000,
			reconcile_concurrency: 4,
		}
	}
}

impl SyncConfig {
	pub fn initial_backoff(&self) -> Duration {
		Duration::from_millis(self.initial_backoff_ms)
	}

	pub fn max_backoff(&self) -> Duration {
		Duration::from_millis(self.max_backoff_ms)
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		if self.reconcile_concurrency == 0 {
			return Err(SyncError::InvalidConfig(
				"reconcile concurrency must be at least 1".to_string(),
			));
		}
		if self.initial_backoff_ms > self.max_backoff_ms {
			return Err(SyncError::InvalidConfig(format!(
				"initial backoff {}ms exceeds max backoff {}ms",
				self.initial_backoff_ms, self.max_backoff_ms
			)));
		}
		Ok(())
	}
}

/// Body fields used by collections that paginate with a page counter
/// instead of `Link` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageNumberScheme {
	/// Body field holding the current page number
	pub page_field: String,
	/// Body field holding the total number of pages
	pub total_pages_field: String,
}

impl Default for PageNumberScheme {
	fn default() -> Self {
		Self {
			page_field: "page".to_string(),
			total_pages_field: "total_pages".to_string(),
		}
	}
}

/// Configuration for the page fetcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
	/// Body field holding the records when pages are wrapped in an object
	pub records_field: Option<String>,
	/// Query parameter carrying the page size hint
	pub page_size_param: String,
	/// Query parameter carrying the page number
	pub page_param: String,
	/// Headers whose value `0` means the request quota is exhausted
	pub rate_limit_headers: Vec<String>,
	/// Page counter pagination, used when a response has no `Link` header
	pub page_numbers: Option<PageNumberScheme>,
	/// Per-request timeout
	pub timeout_secs: u64,
}

impl Default for FetchConfig {
	fn default() -> Self {
		Self {
			records_field: None,
			page_size_param: "per_page".to_string(),
			page_param: "page".to_string(),
			rate_limit_headers: vec![
				"x-ratelimit-remaining".to_string(),
				"ratelimit-remaining".to_string(),
			],
			page_numbers: None,
			timeout_secs: 30,
		}
	}
}

impl FetchConfig {
	pub fn with_records_field(mut self, field: impl Into<String>) -> Self {
		self.records_field = Some(field.into());
		self
	}

	pub fn with_page_numbers(mut self, scheme: PageNumberScheme) -> Self {
		self.page_numbers = Some(scheme);
		self
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_target_validation() {
		assert!(SyncTarget::new("https://api.test/items").validate().is_ok());
		assert!(matches!(
			SyncTarget::new("not a url").validate(),
			Err(SyncError::InvalidConfig(_))
		));
		assert!(
			SyncTarget::new("https://api.test/items")
				.with_identity_field(" ")
				.validate()
				.is_err()
		);
		assert!(
			SyncTarget::new("https://api.test/items")
				.with_page_size(0)
				.validate()
				.is_err()
		);
	}

	#[test]
	fn test_bearer_token_header() {
		let target = SyncTarget::new("https://api.test/items").with_bearer_token("abc");
		assert_eq!(
			target.headers.get("Authorization").map(String::as_str),
			Some("Bearer abc")
		);
	}

	#[test]
	fn test_target_deserializes_with_defaults() {
		let target: SyncTarget = serde_json::from_value(serde_json::json!({
			"url": "https://reqres.in/api/users",
			"predicate": { "op": "eq", "field": "active", "value": true }
		}))
		.unwrap();

		assert_eq!(target.identity_field, "id");
		assert!(target.headers.is_empty());
		assert!(target.predicate.is_some());
	}

	#[test]
	fn test_sync_config_validation() {
		assert!(SyncConfig::default().validate().is_ok());

		let config = SyncConfig {
			reconcile_concurrency: 0,
			..Default::default()
		};
		assert!(config.validate().is_err());

		let config = SyncConfig {
			initial_backoff_ms: 60_000,
			..Default::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_partial_fetch_config() {
		let config: FetchConfig =
			serde_json::from_value(serde_json::json!({ "records_field": "data" })).unwrap();
		assert_eq!(config.records_field.as_deref(), Some("data"));
		assert_eq!(config.page_size_param, "per_page");
		assert_eq!(config.rate_limit_headers.len(), 2);
	}
}
