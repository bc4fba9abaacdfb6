//! Credential cache state and the transitions applied after each refresh.

// crates.io
use tokio::task::AbortHandle;
// self
use crate::{
	_prelude::*,
	cache::policy::{Decision, ExpiryWindowRule},
	credentials::CredentialSet,
};

/// Handle to a scheduled stale-extension retry.
#[derive(Debug)]
pub struct RetryTimer {
	id: u64,
	handle: AbortHandle,
	fires_at: Instant,
}
impl RetryTimer {
	/// Wrap the task driving a scheduled retry.
	pub fn new(id: u64, handle: AbortHandle, fires_at: Instant) -> Self {
		Self { id, handle, fires_at }
	}

	/// Generation identifier distinguishing replaced timers.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Monotonic instant at which the retry fires.
	pub fn fires_at(&self) -> Instant {
		self.fires_at
	}

	/// Abort the scheduled retry.
	pub fn cancel(self) {
		self.handle.abort();
	}
}

/// Mutable bookkeeping owned by a [`CredentialCache`].
#[derive(Debug, Default)]
pub struct CacheState {
	/// Last accepted credentials.
	pub current: Option<Arc<CredentialSet>>,
	/// When `current` becomes stale; set only after a non-expired outcome.
	pub expire_time: Option<DateTime<Utc>>,
	/// Expiry carried by the first stale outcome of the current stale streak.
	pub original_expiration: Option<DateTime<Utc>>,
	/// Scheduled retry while stale-extended.
	pub pending_retry: Option<RetryTimer>,
	/// Consecutive stale extensions since the last fresh acceptance.
	pub stale_extensions: u32,
	/// Wall-clock time of the last accepted outcome.
	pub last_refresh_at: Option<DateTime<Utc>>,
}

/// Follow-up work requested from the coordinator after an update.
#[derive(Debug)]
pub enum UpdateEffect {
	/// Fresh credentials were cached and any pending retry was cancelled.
	Refreshed,
	/// Stale credentials are being served; a retry must be armed.
	StaleExtended {
		/// Length of the current stale streak, starting at 1.
		consecutive: u32,
		/// Why no fresh credentials were obtained.
		cause: Error,
	},
	/// The cache was left untouched and the error must be surfaced.
	Failed(Error),
}

/// Best-known credentials plus their expiry bookkeeping.
#[derive(Debug)]
pub struct CredentialCache {
	rule: ExpiryWindowRule,
	state: CacheState,
}
impl CredentialCache {
	/// Create an empty cache refreshing according to `rule`.
	pub fn new(rule: ExpiryWindowRule) -> Self {
		Self { rule, state: CacheState::default() }
	}

	/// Inspect the current state.
	pub fn state(&self) -> &CacheState {
		&self.state
	}

	/// Currently cached credentials, without triggering a refresh.
	pub fn get_credentials(&self) -> Result<Arc<CredentialSet>> {
		self.state.current.clone().ok_or(Error::NoCredentials)
	}

	/// Whether credentials were ever loaded.
	pub fn has_loaded(&self) -> bool {
		self.state.current.is_some()
	}

	/// Whether the cache is serving credentials past their nominal expiry.
	pub fn is_stale_extended(&self) -> bool {
		self.state.stale_extensions > 0
	}

	/// Whether a stale-extension retry is scheduled.
	pub fn retry_pending(&self) -> bool {
		self.state.pending_retry.is_some()
	}

	/// Whether a refresh should be attempted at `now`.
	pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
		if self.retry_pending() {
			return false;
		}
		if !self.has_loaded() || self.is_stale_extended() {
			return true;
		}

		self.rule.needs_refresh(now, self.state.expire_time)
	}

	/// Whether the cached credentials may be handed out at `now`.
	pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
		self.has_loaded()
			&& (self.is_stale_extended()
				|| self.state.expire_time.map(|expire_time| now < expire_time).unwrap_or(true))
	}

	/// Apply a policy decision observed at `now`.
	pub fn update(&mut self, decision: Decision, now: DateTime<Utc>) -> UpdateEffect {
		match decision {
			Decision::Accept { credentials, expire_time } => {
				self.cancel_retry();

				self.state.current = Some(credentials);
				self.state.expire_time = expire_time;
				self.state.original_expiration = None;
				self.state.stale_extensions = 0;
				self.state.last_refresh_at = Some(now);

				UpdateEffect::Refreshed
			},
			Decision::AcceptStaleExtend { credentials, original_expiration, cause } => {
				self.cancel_retry();

				self.state.current = Some(credentials);
				self.state.expire_time = None;
				self.state.original_expiration = original_expiration;
				self.state.stale_extensions = self.state.stale_extensions.saturating_add(1);
				self.state.last_refresh_at = Some(now);

				UpdateEffect::StaleExtended { consecutive: self.state.stale_extensions, cause }
			},
			Decision::Fail(err) => UpdateEffect::Failed(err),
		}
	}

	/// Install a retry timer, cancelling any timer it replaces.
	pub fn arm_retry(&mut self, timer: RetryTimer) {
		if let Some(previous) = self.state.pending_retry.replace(timer) {
			previous.cancel();
		}
	}

	/// Cancel the pending retry; returns whether one was pending.
	pub fn cancel_retry(&mut self) -> bool {
		self.state.pending_retry.take().map(RetryTimer::cancel).is_some()
	}

	/// Clear the pending retry if it is still timer `id`; called by the firing timer itself.
	pub fn clear_fired_retry(&mut self, id: u64) -> bool {
		match &self.state.pending_retry {
			Some(timer) if timer.id() == id => {
				self.state.pending_retry = None;

				true
			},
			_ => false,
		}
	}
}
