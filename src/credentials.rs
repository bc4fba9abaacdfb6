//! Immutable credential snapshots handed out by the cache.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Short-lived access credentials issued by the metadata service.
///
/// A set is never mutated once accepted; the next accepted fetch supersedes it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
	access_key_id: String,
	secret_access_key: String,
	session_token: Option<String>,
	expiration: Option<DateTime<Utc>>,
}
impl CredentialSet {
	/// Construct a credential set from its raw parts.
	pub fn new(
		access_key_id: impl Into<String>,
		secret_access_key: impl Into<String>,
		session_token: Option<String>,
		expiration: Option<DateTime<Utc>>,
	) -> Self {
		Self {
			access_key_id: access_key_id.into(),
			secret_access_key: secret_access_key.into(),
			session_token,
			expiration,
		}
	}

	/// Access key identifier.
	pub fn access_key_id(&self) -> &str {
		&self.access_key_id
	}

	/// Secret access key.
	pub fn secret_access_key(&self) -> &str {
		&self.secret_access_key
	}

	/// Session token accompanying temporary credentials.
	pub fn session_token(&self) -> Option<&str> {
		self.session_token.as_deref()
	}

	/// Expiry advertised by the issuer, if any.
	pub fn expiration(&self) -> Option<DateTime<Utc>> {
		self.expiration
	}

	/// Whether the advertised expiry is at or before `now`.
	///
	/// Sets without an expiry never expire.
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		self.expiration.map(|expiration| expiration <= now).unwrap_or(false)
	}

	/// Whether both key halves are present.
	pub fn has_keys(&self) -> bool {
		!self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
	}
}
impl Debug for CredentialSet {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("CredentialSet")
			.field("access_key_id", &self.access_key_id)
			.field("secret_access_key", &"** redacted **")
			.field("session_token", &self.session_token.as_ref().map(|_| "** redacted **"))
			.field("expiration", &self.expiration)
			.finish()
	}
}
