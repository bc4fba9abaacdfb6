//! Cache and metadata-source configuration with validation.
//!
//! Every struct here deserializes with serde and fills omitted fields from the documented
//! defaults, so embedders can load them from whatever configuration format they already use.

// std
use std::cell::RefCell;
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::_prelude::*;

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default safety window subtracted from the expiry when deciding to refresh.
pub const DEFAULT_EXPIRY_WINDOW: Duration = Duration::from_secs(15);
/// Default base delay before retrying while serving stale-extended credentials.
pub const DEFAULT_STALE_RETRY_BASE: Duration = Duration::from_secs(300);
/// Default random jitter added to the stale retry delay.
pub const DEFAULT_STALE_RETRY_JITTER: Duration = Duration::from_secs(60);
/// Default ceiling for the stale retry delay.
pub const DEFAULT_STALE_RETRY_MAX: Duration = Duration::from_secs(900);
/// Shortest stale retry delay ever scheduled.
pub const MIN_STALE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Longest stale retry delay ever scheduled (one day).
pub const MAX_STALE_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);
/// Default link-local metadata endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
/// Default path listing the instance role credentials.
pub const DEFAULT_CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";
/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1_000);
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1_000);
/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay between transport retries.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Default size guard for metadata documents (64 KiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 65_536;
/// Longest accepted cache name.
pub const MAX_NAME_LEN: usize = 64;

/// Supported jitter strategies for retry policies.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
	/// No jitter; deterministic backoff schedule.
	None,
	/// Full jitter; randomize delay between 0.8x and 1x of the current backoff.
	#[default]
	Full,
	/// Decorrelated jitter per AWS architecture guidance.
	Decorrelated,
}

/// Transport retry configuration for metadata fetches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Maximum number of retry attempts to perform after the initial request.
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	/// Initial delay before retrying after a failure.
	#[serde(default = "default_retry_base_delay")]
	pub initial_backoff: Duration,
	/// Upper bound applied to exponential backoff growth.
	#[serde(default = "default_max_backoff")]
	pub max_backoff: Duration,
	/// Overall deadline that bounds the entire retry sequence.
	#[serde(default = "default_deadline")]
	pub deadline: Duration,
	/// Strategy used to randomize the computed backoff.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl RetryPolicy {
	/// Validate invariants for retry configuration.
	pub fn validate(&self, attempt_timeout: Duration) -> Result<()> {
		if self.initial_backoff.is_zero() {
			return Err(Error::Validation {
				field: "retry_policy.initial_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.initial_backoff {
			return Err(Error::Validation {
				field: "retry_policy.max_backoff",
				reason: "Must be greater than or equal to initial_backoff.".into(),
			});
		}
		if self.deadline < attempt_timeout {
			return Err(Error::Validation {
				field: "retry_policy.deadline",
				reason: "Must be greater than or equal to the request timeout.".into(),
			});
		}

		Ok(())
	}

	/// Exponential backoff for a retry attempt with the selected jitter applied.
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(32);
		let base = self.initial_backoff.mul_f64(2f64.powi(exponent as i32));
		let bounded = base.min(self.max_backoff).max(self.initial_backoff);

		self.apply_jitter(bounded, attempt)
	}

	fn apply_jitter(&self, bounded: Duration, attempt: u32) -> Duration {
		match self.jitter {
			JitterStrategy::None => bounded,
			JitterStrategy::Full => {
				let lower = bounded.mul_f64(0.8).max(self.initial_backoff);
				let upper = bounded.min(self.max_backoff);

				random_within(lower, upper)
			},
			JitterStrategy::Decorrelated => {
				let prev = if attempt == 0 { self.initial_backoff } else { bounded };
				let ceiling = self.max_backoff.min(prev.mul_f64(3.0));

				random_within(self.initial_backoff, ceiling.max(self.initial_backoff))
			},
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: DEFAULT_MAX_RETRIES,
			initial_backoff: DEFAULT_RETRY_BASE_DELAY,
			max_backoff: default_max_backoff(),
			deadline: default_deadline(),
			jitter: JitterStrategy::Full,
		}
	}
}

/// Computes how long to wait before retrying while serving stale-extended credentials.
///
/// `consecutive` counts stale extensions since the last fresh acceptance, starting at 1.
/// The returned delay is clamped between [`MIN_STALE_RETRY_DELAY`] and
/// [`MAX_STALE_RETRY_DELAY`] before a retry is scheduled.
pub trait StaleRetryDelay: Send + Sync + 'static {
	/// Delay before the next refresh attempt.
	fn stale_retry_delay(&self, consecutive: u32) -> Duration;
}

/// Clamp a computed stale retry delay into the schedulable range.
pub fn bound_stale_retry_delay(delay: Duration) -> Duration {
	delay.clamp(MIN_STALE_RETRY_DELAY, MAX_STALE_RETRY_DELAY)
}

/// Default stale retry schedule: doubling from `base_delay`, capped at `max_delay`, plus jitter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRetryPolicy {
	/// Delay applied to the first stale extension.
	#[serde(default = "default_stale_retry_base")]
	pub base_delay: Duration,
	/// Upper bound of the random jitter added on top of the computed delay.
	#[serde(default = "default_stale_retry_jitter")]
	pub jitter: Duration,
	/// Hard ceiling for the final delay, jitter included.
	#[serde(default = "default_stale_retry_max")]
	pub max_delay: Duration,
}
impl StaleRetryPolicy {
	/// Fixed schedule without jitter or growth; mostly useful in tests.
	pub fn fixed(delay: Duration) -> Self {
		Self { base_delay: delay, jitter: Duration::ZERO, max_delay: delay }
	}

	/// Validate the schedule bounds.
	pub fn validate(&self) -> Result<()> {
		if self.base_delay < MIN_STALE_RETRY_DELAY {
			return Err(Error::Validation {
				field: "stale_retry.base_delay",
				reason: "Must be at least 1 s.".into(),
			});
		}
		if self.max_delay < self.base_delay {
			return Err(Error::Validation {
				field: "stale_retry.max_delay",
				reason: "Must be greater than or equal to base_delay.".into(),
			});
		}
		if self.max_delay > MAX_STALE_RETRY_DELAY {
			return Err(Error::Validation {
				field: "stale_retry.max_delay",
				reason: "Must be one day or less.".into(),
			});
		}
		if self.jitter > MAX_STALE_RETRY_DELAY {
			return Err(Error::Validation {
				field: "stale_retry.jitter",
				reason: "Must be one day or less.".into(),
			});
		}

		Ok(())
	}
}
impl Default for StaleRetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: DEFAULT_STALE_RETRY_BASE,
			jitter: DEFAULT_STALE_RETRY_JITTER,
			max_delay: DEFAULT_STALE_RETRY_MAX,
		}
	}
}
impl StaleRetryDelay for StaleRetryPolicy {
	fn stale_retry_delay(&self, consecutive: u32) -> Duration {
		let exponent = consecutive.saturating_sub(1).min(16);
		let grown = self.base_delay.saturating_mul(1 << exponent).min(self.max_delay);
		let jittered = grown.saturating_add(random_within(Duration::ZERO, self.jitter));

		jittered.min(self.max_delay).max(self.base_delay)
	}
}

/// Refresh policy settings for a credential cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
	/// Name used to label logs and metrics.
	#[serde(default = "default_name")]
	pub name: String,
	/// Safety window before expiry inside which a refresh is requested.
	#[serde(default = "default_expiry_window")]
	pub expiry_window: Duration,
	/// Reject already-expired payloads instead of serving them stale.
	#[serde(default)]
	pub strict_expiry: bool,
	/// Delay schedule used while serving stale-extended credentials.
	#[serde(default)]
	pub stale_retry: StaleRetryPolicy,
}
impl CacheConfig {
	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		validate_name(&self.name)?;

		if self.expiry_window > Duration::from_secs(60 * 60) {
			return Err(Error::Validation {
				field: "expiry_window",
				reason: "Must be one hour or less.".into(),
			});
		}

		self.stale_retry.validate()
	}
}
impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			name: default_name(),
			expiry_window: DEFAULT_EXPIRY_WINDOW,
			strict_expiry: false,
			stale_retry: StaleRetryPolicy::default(),
		}
	}
}

/// Pass-through settings for the HTTP metadata source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
	/// Base URL of the metadata service.
	#[serde(default = "default_endpoint")]
	pub endpoint: Url,
	/// Path listing role names; the role credentials live underneath it.
	#[serde(default = "default_credentials_path")]
	pub credentials_path: String,
	/// Fixed role name; discovered from the listing when absent.
	#[serde(default)]
	pub role_name: Option<String>,
	/// Timeout applied to each HTTP request.
	#[serde(default = "default_timeout")]
	pub timeout: Duration,
	/// TCP connect timeout.
	#[serde(default = "default_connect_timeout")]
	pub connect_timeout: Duration,
	/// Maximum size allowed for a metadata document in bytes.
	#[serde(default = "default_max_response_bytes")]
	pub max_response_bytes: u64,
	/// Retry policy configuration for fetch attempts.
	#[serde(default)]
	pub retry_policy: RetryPolicy,
}
impl MetadataConfig {
	/// Build a configuration pointing at a custom endpoint.
	pub fn with_endpoint(endpoint: impl AsRef<str>) -> Result<Self> {
		Ok(Self { endpoint: Url::parse(endpoint.as_ref())?, ..Self::default() })
	}

	/// Pin the role name instead of discovering it.
	pub fn with_role_name(mut self, role_name: impl Into<String>) -> Self {
		self.role_name = Some(role_name.into());

		self
	}

	/// URL of the role listing document.
	pub fn listing_url(&self) -> Result<Url> {
		Ok(self.endpoint.join(&self.listing_path())?)
	}

	/// URL of the credential document for `role`.
	pub fn role_url(&self, role: &str) -> Result<Url> {
		Ok(self.endpoint.join(&format!("{}{role}", self.listing_path()))?)
	}

	/// Validate the configuration against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if !matches!(self.endpoint.scheme(), "http" | "https") {
			return Err(Error::Validation {
				field: "endpoint",
				reason: "Scheme must be http or https.".into(),
			});
		}
		if self.endpoint.host_str().is_none() {
			return Err(Error::Validation {
				field: "endpoint",
				reason: "Must include a host component.".into(),
			});
		}
		if !self.credentials_path.starts_with('/') {
			return Err(Error::Validation {
				field: "credentials_path",
				reason: "Must be an absolute path.".into(),
			});
		}
		if let Some(role) = &self.role_name
			&& (role.is_empty() || role.contains('/'))
		{
			return Err(Error::Validation {
				field: "role_name",
				reason: "Must be a non-empty path segment.".into(),
			});
		}
		if self.timeout < Duration::from_millis(100) {
			return Err(Error::Validation {
				field: "timeout",
				reason: "Must be at least 100 ms.".into(),
			});
		}
		if self.connect_timeout < Duration::from_millis(100) {
			return Err(Error::Validation {
				field: "connect_timeout",
				reason: "Must be at least 100 ms.".into(),
			});
		}
		if self.max_response_bytes == 0 {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: "Must be greater than zero.".into(),
			});
		}

		self.retry_policy.validate(self.timeout)
	}

	fn listing_path(&self) -> String {
		if self.credentials_path.ends_with('/') {
			self.credentials_path.clone()
		} else {
			format!("{}/", self.credentials_path)
		}
	}
}
impl Default for MetadataConfig {
	fn default() -> Self {
		Self {
			endpoint: default_endpoint(),
			credentials_path: default_credentials_path(),
			role_name: None,
			timeout: DEFAULT_TIMEOUT,
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
			retry_policy: RetryPolicy::default(),
		}
	}
}

fn random_within(min: Duration, max: Duration) -> Duration {
	if max <= min {
		return max;
	}
	SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();
		let nanos = max.as_nanos() - min.as_nanos();
		let jitter = rng.random_range(0..=nanos.min(u64::MAX as u128));

		min + Duration::from_nanos(jitter as u64)
	})
}

fn default_name() -> String {
	"default".into()
}

fn default_expiry_window() -> Duration {
	DEFAULT_EXPIRY_WINDOW
}

fn default_stale_retry_base() -> Duration {
	DEFAULT_STALE_RETRY_BASE
}

fn default_stale_retry_jitter() -> Duration {
	DEFAULT_STALE_RETRY_JITTER
}

fn default_stale_retry_max() -> Duration {
	DEFAULT_STALE_RETRY_MAX
}

fn default_endpoint() -> Url {
	Url::parse(DEFAULT_ENDPOINT).expect("default endpoint must be a valid URL")
}

fn default_credentials_path() -> String {
	DEFAULT_CREDENTIALS_PATH.into()
}

fn default_timeout() -> Duration {
	DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
	DEFAULT_CONNECT_TIMEOUT
}

fn default_max_response_bytes() -> u64 {
	DEFAULT_MAX_RESPONSE_BYTES
}

fn default_max_retries() -> u32 {
	DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay() -> Duration {
	DEFAULT_RETRY_BASE_DELAY
}

fn default_max_backoff() -> Duration {
	Duration::from_secs(1)
}

fn default_deadline() -> Duration {
	Duration::from_secs(5)
}

fn validate_name(value: &str) -> Result<()> {
	if value.is_empty() {
		return Err(Error::Validation { field: "name", reason: "Must not be empty.".into() });
	}
	if value.len() > MAX_NAME_LEN {
		return Err(Error::Validation {
			field: "name",
			reason: format!("Must be {MAX_NAME_LEN} characters or fewer."),
		});
	}
	if !value.as_bytes().iter().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')) {
		return Err(Error::Validation {
			field: "name",
			reason: "May only contain ASCII letters, numbers, '-', or '_'.".into(),
		});
	}

	Ok(())
}
