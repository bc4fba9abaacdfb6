//! Crate-wide error types and `Result` alias.

// std
use std::sync::Arc;
// crates.io
use chrono::{DateTime, Utc};

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the instance credential cache.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Metadata credentials expired at {expiration}.")]
	ExpiredCredentials { expiration: DateTime<Utc> },
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: http::StatusCode, url: url::Url, body: Option<String> },
	#[error("Malformed metadata response: {0}")]
	Metadata(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("No credentials have been loaded from the metadata service.")]
	NoCredentials,
	#[error(transparent)]
	Refresh(Arc<Error>),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
}
impl Error {
	/// Whether the error originated at the metadata transport boundary.
	pub fn is_transport(&self) -> bool {
		match self {
			Error::Reqwest(_)
			| Error::Serde(_)
			| Error::Url(_)
			| Error::HttpStatus { .. }
			| Error::Metadata(_) => true,
			Error::Refresh(inner) => inner.is_transport(),
			_ => false,
		}
	}

	/// Unwrap shared refresh outcomes down to the originating error.
	pub fn root(&self) -> &Error {
		match self {
			Error::Refresh(inner) => inner.root(),
			other => other,
		}
	}
}
#[cfg(feature = "prometheus")]
impl From<metrics_exporter_prometheus::BuildError> for Error {
	fn from(value: metrics_exporter_prometheus::BuildError) -> Self {
		Self::Metrics(value.to_string())
	}
}
