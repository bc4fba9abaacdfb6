//! Single-flight refresh coordination with stale-tolerant retry scheduling.

// std
use std::{
	mem,
	sync::{
		Weak,
		atomic::{AtomicU64, Ordering},
	},
};
// crates.io
use tokio::{
	sync::{Mutex, oneshot},
	task::JoinHandle,
	time,
};
// self
use crate::{
	_prelude::*,
	cache::{
		policy::{ExpiryPolicy, ExpiryWindowRule},
		state::{CredentialCache, RetryTimer, UpdateEffect},
	},
	config::{self, CacheConfig, MetadataConfig, StaleRetryDelay, StaleRetryPolicy},
	credentials::CredentialSet,
	http::client::ImdsClient,
	metrics::{self, CacheMetrics},
	source::MetadataSource,
	status::{CacheSnapshot, CacheStatus},
};

type SharedOutcome = std::result::Result<(), Arc<Error>>;

/// Owns a [`CredentialCache`] and guarantees at most one outstanding fetch for it.
///
/// Cloning is cheap; every clone drives the same cache.
#[derive(Debug)]
pub struct RefreshCoordinator<S> {
	inner: Arc<Inner<S>>,
}
impl RefreshCoordinator<ImdsClient> {
	/// Start building a coordinator.
	pub fn builder() -> CredentialCacheBuilder {
		CredentialCacheBuilder::new()
	}

	/// Build a metadata-backed cache from its two configuration halves.
	pub fn from_config(cache: CacheConfig, metadata: MetadataConfig) -> Result<Self> {
		Self::new(ImdsClient::new(metadata)?, cache)
	}
}
impl<S> RefreshCoordinator<S>
where
	S: MetadataSource,
{
	/// Build a coordinator over `source` using the stale retry schedule from `config`.
	pub fn new(source: S, config: CacheConfig) -> Result<Self> {
		config.validate()?;

		let retry_delay = Arc::new(config.stale_retry.clone());

		Ok(Self::with_parts(source, config, retry_delay))
	}

	fn with_parts(source: S, config: CacheConfig, retry_delay: Arc<dyn StaleRetryDelay>) -> Self {
		let cache = CredentialCache::new(ExpiryWindowRule::new(config.expiry_window));

		Self {
			inner: Arc::new(Inner {
				policy: ExpiryPolicy::new(config.strict_expiry),
				config,
				source,
				retry_delay,
				shared: Mutex::new(Shared { cache, flight: Flight::default() }),
				metrics: CacheMetrics::new(),
				timer_ids: AtomicU64::new(1),
			}),
		}
	}

	/// Cache name used in logs and metrics.
	pub fn name(&self) -> &str {
		&self.inner.config.name
	}

	/// Metadata source backing this cache.
	pub fn source(&self) -> &S {
		&self.inner.source
	}

	/// Access the per-cache metrics accumulator.
	pub fn metrics(&self) -> Arc<CacheMetrics> {
		self.inner.metrics.clone()
	}

	/// Make sure usable credentials are cached, fetching them when a refresh is due.
	///
	/// Callers arriving while a fetch is in flight wait for that fetch instead of issuing their
	/// own. Every waiter observes the same outcome. Dropping the returned future does not cancel
	/// the shared fetch.
	#[tracing::instrument(skip(self), fields(cache = %self.inner.config.name))]
	pub async fn ensure_fresh(&self) -> Result<()> {
		self.inner.metrics.record_ensure();

		let receiver = {
			let mut shared = self.inner.shared.lock().await;

			if !shared.flight.in_flight && !shared.cache.needs_refresh(Utc::now()) {
				metrics::record_ensure(&self.inner.config.name, false);

				return Ok(());
			}

			self.enqueue(&mut shared)
		};

		wait_for(receiver).await
	}

	/// Callback flavour of [`ensure_fresh`](Self::ensure_fresh); returns immediately.
	pub fn ensure_fresh_with<F>(&self, callback: F) -> JoinHandle<()>
	where
		F: FnOnce(Result<()>) + Send + 'static,
	{
		let coordinator = self.clone();

		tokio::spawn(async move { callback(coordinator.ensure_fresh().await) })
	}

	/// Force a fetch regardless of expiry, cancelling any scheduled stale retry.
	///
	/// Joins the in-flight fetch when one is already running.
	#[tracing::instrument(skip(self), fields(cache = %self.inner.config.name))]
	pub async fn refresh_now(&self) -> Result<()> {
		self.inner.metrics.record_ensure();

		let receiver = {
			let mut shared = self.inner.shared.lock().await;

			if shared.cache.cancel_retry() {
				tracing::debug!("manual refresh cancelled pending stale retry");
			}

			self.enqueue(&mut shared)
		};

		wait_for(receiver).await
	}

	/// Ensure freshness, then return the cached credentials.
	pub async fn credentials(&self) -> Result<Arc<CredentialSet>> {
		self.ensure_fresh().await?;
		self.get_credentials().await
	}

	/// Currently cached credentials, without triggering a refresh.
	pub async fn get_credentials(&self) -> Result<Arc<CredentialSet>> {
		self.inner.shared.lock().await.cache.get_credentials()
	}

	/// Whether a refresh would be attempted at `now`.
	pub async fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
		self.inner.shared.lock().await.cache.needs_refresh(now)
	}

	/// Whether the cached credentials may be handed out at `now`.
	pub async fn is_valid(&self, now: DateTime<Utc>) -> bool {
		self.inner.shared.lock().await.cache.is_valid(now)
	}

	/// Capture the current cache state.
	pub async fn snapshot(&self) -> CacheSnapshot {
		let shared = self.inner.shared.lock().await;
		let state = shared.cache.state();

		CacheSnapshot {
			captured_at: Instant::now(),
			captured_at_wallclock: Utc::now(),
			current: state.current.clone(),
			expire_time: state.expire_time,
			original_expiration: state.original_expiration,
			stale_extensions: state.stale_extensions,
			retry_at: state.pending_retry.as_ref().map(RetryTimer::fires_at),
			refreshing: shared.flight.in_flight,
			last_refresh_at: state.last_refresh_at,
		}
	}

	/// Serializable status for diagnostics endpoints.
	pub async fn status(&self) -> CacheStatus {
		let snapshot = self.snapshot().await;
		let metrics = self.inner.metrics.snapshot();

		CacheStatus::from_components(&self.inner.config.name, &snapshot, &metrics)
	}

	fn enqueue(&self, shared: &mut Shared) -> oneshot::Receiver<SharedOutcome> {
		let (sender, receiver) = oneshot::channel();

		shared.flight.waiters.push(sender);

		if shared.flight.in_flight {
			tracing::debug!(waiters = shared.flight.waiters.len(), "joining in-flight refresh");

			self.inner.metrics.record_coalesced();
			metrics::record_ensure(&self.inner.config.name, true);
		} else {
			metrics::record_ensure(&self.inner.config.name, false);

			self.start_flight(shared);
		}

		receiver
	}

	fn start_flight(&self, shared: &mut Shared) {
		shared.flight.in_flight = true;

		let coordinator = self.clone();

		tokio::spawn(async move { coordinator.run_refresh().await });
	}

	async fn run_refresh(self) {
		let started = Instant::now();
		let fetch = {
			let coordinator = self.clone();

			tokio::spawn(async move { coordinator.inner.source.fetch().await })
		};
		let outcome = match fetch.await {
			Ok(outcome) => outcome,
			Err(err) => Err(Error::Cache(format!("Metadata fetch task failed: {err}."))),
		};
		let elapsed = started.elapsed();
		let settle = {
			let coordinator = self.clone();

			tokio::spawn(async move { coordinator.settle(outcome, elapsed).await })
		};

		if let Err(err) = settle.await {
			tracing::error!(cache = %self.inner.config.name, error = %err, "refresh settlement failed");

			self.inner.metrics.record_failure();
			metrics::record_failure(&self.inner.config.name);

			let waiters = {
				let mut shared = self.inner.shared.lock().await;

				shared.flight.in_flight = false;

				mem::take(&mut shared.flight.waiters)
			};
			let failure =
				Arc::new(Error::Cache(format!("Refresh settlement task failed: {err}.")));

			for waiter in waiters {
				let _ = waiter.send(Err(failure.clone()));
			}
		}
	}

	async fn settle(&self, outcome: Result<CredentialSet>, elapsed: Duration) {
		let name = &self.inner.config.name;

		self.inner.metrics.record_fetch(elapsed, outcome.is_err());
		metrics::record_fetch(name, elapsed, outcome.is_err());

		let (result, waiters) = {
			let mut shared = self.inner.shared.lock().await;
			let now = Utc::now();
			let decision = {
				let state = shared.cache.state();

				self.inner.policy.evaluate(
					outcome,
					now,
					state.current.as_ref(),
					state.original_expiration,
				)
			};
			let result = match shared.cache.update(decision, now) {
				UpdateEffect::Refreshed => {
					tracing::debug!(
						cache = %name,
						elapsed = ?elapsed,
						expire_time = ?shared.cache.state().expire_time,
						"credentials refreshed"
					);

					Ok(())
				},
				UpdateEffect::StaleExtended { consecutive, cause } => {
					let delay = config::bound_stale_retry_delay(
						self.inner.retry_delay.stale_retry_delay(consecutive),
					);

					self.arm_retry(&mut shared.cache, delay);

					tracing::warn!(
						cache = %name,
						error = %cause,
						consecutive,
						retry_in = ?delay,
						original_expiration = ?shared.cache.state().original_expiration,
						"serving stale-extended credentials; will retry"
					);

					self.inner.metrics.record_stale_extension();
					metrics::record_stale_extension(name);

					Ok(())
				},
				UpdateEffect::Failed(err) => {
					tracing::warn!(cache = %name, error = %err, "credential refresh failed");

					self.inner.metrics.record_failure();
					metrics::record_failure(name);

					Err(Arc::new(err))
				},
			};

			shared.flight.in_flight = false;

			(result, mem::take(&mut shared.flight.waiters))
		};

		for waiter in waiters {
			let _ = waiter.send(result.clone());
		}
	}

	fn arm_retry(&self, cache: &mut CredentialCache, delay: Duration) {
		let now = Instant::now();
		let Some(fires_at) = now.checked_add(delay) else {
			tracing::error!(cache = %self.inner.config.name, ?delay, "stale retry delay out of range");

			return;
		};
		let id = self.inner.timer_ids.fetch_add(1, Ordering::Relaxed);
		let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
		let handle = tokio::spawn(async move {
			time::sleep_until(fires_at).await;

			if let Some(inner) = weak.upgrade() {
				RefreshCoordinator { inner }.on_retry_timer(id).await;
			}
		});

		cache.arm_retry(RetryTimer::new(id, handle.abort_handle(), fires_at));

		tracing::debug!(cache = %self.inner.config.name, timer = id, ?delay, "stale retry armed");
	}

	async fn on_retry_timer(&self, id: u64) {
		let mut shared = self.inner.shared.lock().await;

		if !shared.cache.clear_fired_retry(id) {
			return;
		}

		tracing::debug!(cache = %self.inner.config.name, timer = id, "stale retry fired");

		if !shared.flight.in_flight {
			self.start_flight(&mut shared);
		}
	}
}
impl<S> Clone for RefreshCoordinator<S> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}

/// Builder for a [`RefreshCoordinator`].
#[derive(Default)]
pub struct CredentialCacheBuilder {
	config: CacheConfig,
	retry_delay: Option<Arc<dyn StaleRetryDelay>>,
}
impl CredentialCacheBuilder {
	/// Create a builder with default configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Replace the whole configuration.
	pub fn config(mut self, config: CacheConfig) -> Self {
		self.config = config;

		self
	}

	/// Name used to label logs and metrics.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.config.name = name.into();

		self
	}

	/// Override the safety window before expiry.
	pub fn expiry_window(mut self, value: Duration) -> Self {
		self.config.expiry_window = value;

		self
	}

	/// Reject already-expired payloads instead of serving them stale.
	pub fn strict_expiry(mut self, strict: bool) -> Self {
		self.config.strict_expiry = strict;

		self
	}

	/// Override the built-in stale retry schedule.
	pub fn stale_retry(mut self, policy: StaleRetryPolicy) -> Self {
		self.config.stale_retry = policy;

		self
	}

	/// Plug in a custom stale retry delay computation.
	pub fn stale_retry_delay(mut self, delay: impl StaleRetryDelay) -> Self {
		self.retry_delay = Some(Arc::new(delay));

		self
	}

	/// Finalise the configuration around `source`.
	pub fn build<S>(self, source: S) -> Result<RefreshCoordinator<S>>
	where
		S: MetadataSource,
	{
		self.config.validate()?;

		let retry_delay =
			self.retry_delay.unwrap_or_else(|| Arc::new(self.config.stale_retry.clone()));

		Ok(RefreshCoordinator::with_parts(source, self.config, retry_delay))
	}
}
impl std::fmt::Debug for CredentialCacheBuilder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CredentialCacheBuilder")
			.field("config", &self.config)
			.field("custom_retry_delay", &self.retry_delay.is_some())
			.finish()
	}
}

struct Inner<S> {
	config: CacheConfig,
	source: S,
	policy: ExpiryPolicy,
	retry_delay: Arc<dyn StaleRetryDelay>,
	shared: Mutex<Shared>,
	metrics: Arc<CacheMetrics>,
	timer_ids: AtomicU64,
}
impl<S> std::fmt::Debug for Inner<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Inner")
			.field("config", &self.config)
			.field("policy", &self.policy)
			.finish_non_exhaustive()
	}
}
impl<S> Drop for Inner<S> {
	fn drop(&mut self) {
		self.shared.get_mut().cache.cancel_retry();
	}
}

#[derive(Debug)]
struct Shared {
	cache: CredentialCache,
	flight: Flight,
}

#[derive(Debug, Default)]
struct Flight {
	in_flight: bool,
	waiters: Vec<oneshot::Sender<SharedOutcome>>,
}

async fn wait_for(receiver: oneshot::Receiver<SharedOutcome>) -> Result<()> {
	match receiver.await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(err)) => Err(Error::Refresh(err)),
		Err(_) => Err(Error::Cache("Refresh finished without reporting an outcome.".into())),
	}
}
