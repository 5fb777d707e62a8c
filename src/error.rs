//! Crate-wide error types and `Result` alias.

// crates.io
use http::StatusCode;
// self
use crate::_prelude::*;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the REST cache crate.
///
/// The enum is `Clone` so that every waiter coalesced onto one in-flight fetch
/// observes the same failure; transport failures are captured as rendered
/// strings for that reason.
#[allow(missing_docs)]
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("HTTP status {status}: {status_text}")]
	Http { status: StatusCode, status_text: String },
	#[error("Transport error: {0}")]
	Transport(String),
	#[error("Hook error: {0}")]
	Hook(String),
	#[error("Cache entry was evicted before its fetch settled")]
	Evicted,
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },

	#[error("{first}")]
	Batch { first: Box<Error>, results: Vec<Option<Value>>, errors: Vec<Option<Error>> },
}
impl Error {
	/// Build an `Http` error from a status code using its canonical reason phrase.
	pub fn http(status: StatusCode) -> Self {
		Self::Http {
			status,
			status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
		}
	}

	/// HTTP status carried by this error, when it is status-shaped.
	pub fn status(&self) -> Option<StatusCode> {
		match self {
			Self::Http { status, .. } => Some(*status),
			Self::Batch { first, .. } => first.status(),
			_ => None,
		}
	}
}
