//! Pure expiry decisions applied after every refresh attempt.

// self
use crate::{_prelude::*, credentials::CredentialSet};

/// Refresh once `now` enters the safety window before `expire_time`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryWindowRule {
	window: TimeDelta,
}
impl ExpiryWindowRule {
	/// Build a rule with the given safety window.
	pub fn new(window: Duration) -> Self {
		Self { window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX) }
	}

	/// Whether credentials expiring at `expire_time` should be refreshed at `now`.
	///
	/// Credentials without an expiry never need a refresh under this rule.
	pub fn needs_refresh(&self, now: DateTime<Utc>, expire_time: Option<DateTime<Utc>>) -> bool {
		let Some(expire_time) = expire_time else {
			return false;
		};

		now.checked_add_signed(self.window).map(|adjusted| adjusted >= expire_time).unwrap_or(true)
	}
}

/// What the cache should do with the outcome of a fetch.
#[derive(Debug)]
pub enum Decision {
	/// Fresh credentials; cache them until `expire_time`.
	Accept {
		/// Credentials to serve.
		credentials: Arc<CredentialSet>,
		/// Expiry to track, absent for non-expiring credentials.
		expire_time: Option<DateTime<Utc>>,
	},
	/// Serve `credentials` past their nominal expiry and retry later.
	AcceptStaleExtend {
		/// Credentials to keep serving.
		credentials: Arc<CredentialSet>,
		/// Expiry carried by the first stale outcome of the current streak.
		original_expiration: Option<DateTime<Utc>>,
		/// Why no fresh credentials were obtained.
		cause: Error,
	},
	/// Nothing usable; the error is surfaced to the waiting callers.
	Fail(Error),
}

/// Stale-tolerant expiry policy with an opt-in strict mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiryPolicy {
	strict: bool,
}
impl ExpiryPolicy {
	/// Build a policy; `strict` never caches an already-expired payload.
	///
	/// In strict mode an expired payload is handled like a transport failure: prior credentials
	/// keep being served stale, and a cold cache surfaces the expiry.
	pub fn new(strict: bool) -> Self {
		Self { strict }
	}

	/// Decide how to apply `outcome`, observed at `now`, given the currently cached set.
	pub fn evaluate(
		&self,
		outcome: Result<CredentialSet>,
		now: DateTime<Utc>,
		existing: Option<&Arc<CredentialSet>>,
		prior_original_expiration: Option<DateTime<Utc>>,
	) -> Decision {
		let outcome = outcome.and_then(|credentials| {
			if credentials.has_keys() {
				Ok(credentials)
			} else {
				Err(Error::Metadata("Credential set is missing key material.".into()))
			}
		});

		match outcome {
			Err(cause) => extend_existing(existing, prior_original_expiration, cause),
			Ok(credentials) => match credentials.expiration() {
				Some(expiration) if credentials.is_expired_at(now) => {
					let signal = Error::ExpiredCredentials { expiration };

					if self.strict {
						extend_existing(existing, prior_original_expiration, signal)
					} else {
						Decision::AcceptStaleExtend {
							original_expiration: prior_original_expiration.or(Some(expiration)),
							credentials: Arc::new(credentials),
							cause: signal,
						}
					}
				},
				expire_time =>
					Decision::Accept { credentials: Arc::new(credentials), expire_time },
			},
		}
	}
}

/// Keep serving `existing` past its expiry, or fail when nothing was ever loaded.
fn extend_existing(
	existing: Option<&Arc<CredentialSet>>,
	prior_original_expiration: Option<DateTime<Utc>>,
	cause: Error,
) -> Decision {
	match existing {
		None => Decision::Fail(cause),
		Some(existing) => Decision::AcceptStaleExtend {
			credentials: existing.clone(),
			original_expiration: prior_original_expiration.or(existing.expiration()),
			cause,
		},
	}
}
