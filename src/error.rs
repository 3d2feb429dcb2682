//! Crate-level error type for collection synchronization.
//!
//! Errors raised by the remote layer ([`FetchError`]) and the local store
//! ([`StoreError`]) convert into [`SyncError`], which is what the orchestrator
//! and the public API surface. Each variant maps to one propagation policy:
//! record-level errors are skipped, page-level errors are retried, commit
//! errors degrade the run and terminal errors end it.

use crate::remote::FetchError;
use crate::store::StoreError;
use crate::sync::KeyKind;

/// Errors produced while synchronizing a collection.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	/// A remote record has no usable identity. Skipped, never fatal to a page.
	#[error("Missing identity in field '{field}': {reason}")]
	MissingIdentity { field: String, reason: String },

	/// Keys of one run resolved to more than one kind.
	#[error("Identity field '{field}' mixes {first} and {second} keys")]
	MixedIdentityTypes {
		field: String,
		first: KeyKind,
		second: KeyKind,
	},

	#[error("Fetch error: {0}")]
	FetchError(#[from] FetchError),

	/// Saving a page's working context failed. Marks the run degraded.
	#[error("Transaction commit failed: {0}")]
	TransactionCommit(#[source] StoreError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	/// Terminal: the run gave up. No removal candidates are computed.
	///
	/// `attempts` counts failed fetches of the last page and is zero for
	/// aborts that did not come from fetching.
	#[error("Sync aborted{}: {source}", describe_attempts(.attempts))]
	Aborted {
		attempts: u32,
		source: Box<SyncError>,
	},

	#[error("Sync cancelled")]
	Cancelled,

	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("Sync task failed: {0}")]
	TaskFailed(String),
}

fn describe_attempts(attempts: &u32) -> String {
	match attempts {
		0 => String::new(),
		n => format!(" after {n} failed attempts"),
	}
}

impl SyncError {
	/// Wraps `source` as the terminal abort error of a run.
	pub fn aborted(attempts: u32, source: SyncError) -> Self {
		match source {
			already @ SyncError::Aborted { .. } => already,
			source => SyncError::Aborted {
				attempts,
				source: Box::new(source),
			},
		}
	}

	/// Returns true for errors that end a run.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			SyncError::Aborted { .. } | SyncError::Cancelled | SyncError::InvalidConfig(_)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_aborted_does_not_nest() {
		let inner = SyncError::aborted(3, SyncError::Cancelled);
		let outer = SyncError::aborted(5, inner);

		match outer {
			SyncError::Aborted { attempts, source } => {
				assert_eq!(attempts, 3);
				assert!(matches!(*source, SyncError::Cancelled));
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[test]
	fn test_abort_message_includes_cause() {
		let err = SyncError::aborted(
			4,
			SyncError::FetchError(FetchError::MalformedResponse("not an array".into())),
		);
		let message = err.to_string();
		assert!(message.contains("4 failed attempts"));
		assert!(message.contains("not an array"));
		assert!(err.is_terminal());
	}

	#[test]
	fn test_abort_without_fetch_attempts() {
		let err = SyncError::aborted(
			0,
			SyncError::MixedIdentityTypes {
				field: "id".into(),
				first: KeyKind::Int,
				second: KeyKind::Str,
			},
		);
		assert_eq!(
			err.to_string(),
			"Sync aborted: Identity field 'id' mixes integer and string keys"
		);
	}
}
