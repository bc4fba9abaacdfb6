//! Point-in-time views of a credential cache for diagnostics.

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, credentials::CredentialSet, metrics::CacheMetricsSnapshot};

/// Public representation of the cache lifecycle.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CacheMode {
	/// No credentials have been loaded yet.
	Empty,
	/// Credentials were accepted before their expiry.
	Fresh,
	/// Credentials are served past their nominal expiry while a retry is pending.
	StaleExtended,
}

/// Raw copy of the cache bookkeeping captured under the coordinator lock.
#[derive(Clone, Debug)]
pub struct CacheSnapshot {
	/// Monotonic instant when the snapshot was taken.
	pub captured_at: Instant,
	/// Wall-clock timestamp that aligns with `captured_at`.
	pub captured_at_wallclock: DateTime<Utc>,
	/// Credentials currently served.
	pub current: Option<Arc<CredentialSet>>,
	/// Tracked expiry of `current`.
	pub expire_time: Option<DateTime<Utc>>,
	/// Expiry carried by the first stale outcome of the current streak.
	pub original_expiration: Option<DateTime<Utc>>,
	/// Consecutive stale extensions.
	pub stale_extensions: u32,
	/// Monotonic instant at which the pending retry fires.
	pub retry_at: Option<Instant>,
	/// Whether a fetch is in flight.
	pub refreshing: bool,
	/// Wall-clock time of the last accepted outcome.
	pub last_refresh_at: Option<DateTime<Utc>>,
}
impl CacheSnapshot {
	/// Lifecycle mode derived from the captured state.
	pub fn mode(&self) -> CacheMode {
		match (&self.current, self.stale_extensions) {
			(None, _) => CacheMode::Empty,
			(Some(_), 0) => CacheMode::Fresh,
			(Some(_), _) => CacheMode::StaleExtended,
		}
	}

	/// Convert a monotonic instant drawn from the snapshot into UTC.
	pub fn to_datetime(&self, instant: Instant) -> Option<DateTime<Utc>> {
		if let Some(delta) = instant.checked_duration_since(self.captured_at) {
			let chrono = TimeDelta::from_std(delta).ok()?;

			self.captured_at_wallclock.checked_add_signed(chrono)
		} else if let Some(delta) = self.captured_at.checked_duration_since(instant) {
			let chrono = TimeDelta::from_std(delta).ok()?;

			self.captured_at_wallclock.checked_sub_signed(chrono)
		} else {
			None
		}
	}
}

/// Serializable status projection for a credential cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheStatus {
	/// Cache name.
	pub name: String,
	/// Lifecycle mode.
	pub mode: CacheMode,
	/// Whether a fetch is in flight.
	pub refreshing: bool,
	/// Access key currently served; the secret half is never reported.
	pub access_key_id: Option<String>,
	/// Tracked expiry of the served credentials.
	pub expires_at: Option<DateTime<Utc>>,
	/// Expiry carried by the first stale outcome of the current streak.
	pub original_expiration: Option<DateTime<Utc>>,
	/// Scheduled timestamp of the pending stale retry.
	pub next_retry: Option<DateTime<Utc>>,
	/// Consecutive stale extensions.
	pub stale_extensions: u32,
	/// Timestamp of the most recent accepted outcome.
	pub last_refresh: Option<DateTime<Utc>>,
	/// Metrics describing cache behaviour.
	pub metrics: Vec<StatusMetric>,
}
impl CacheStatus {
	/// Assemble a status from a state snapshot and counter snapshot.
	pub fn from_components(
		name: &str,
		snapshot: &CacheSnapshot,
		metrics: &CacheMetricsSnapshot,
	) -> Self {
		let mut status_metrics = vec![
			StatusMetric::new(crate::metrics::METRIC_ENSURE_TOTAL, metrics.ensure_calls as f64, name),
			StatusMetric::new(
				crate::metrics::METRIC_COALESCED_TOTAL,
				metrics.coalesced_waits as f64,
				name,
			),
			StatusMetric::new(crate::metrics::METRIC_FETCH_TOTAL, metrics.fetches as f64, name),
			StatusMetric::new(
				crate::metrics::METRIC_STALE_TOTAL,
				metrics.stale_extensions as f64,
				name,
			),
			StatusMetric::new(
				crate::metrics::METRIC_FAILURES_TOTAL,
				metrics.failures_surfaced as f64,
				name,
			),
		];

		if let Some(last_micros) = metrics.last_fetch_micros {
			status_metrics.push(StatusMetric::new(
				"instance_credentials_last_fetch_micros",
				last_micros as f64,
				name,
			));
		}

		Self {
			name: name.to_owned(),
			mode: snapshot.mode(),
			refreshing: snapshot.refreshing,
			access_key_id: snapshot.current.as_ref().map(|creds| creds.access_key_id().to_owned()),
			expires_at: snapshot.expire_time,
			original_expiration: snapshot.original_expiration,
			next_retry: snapshot.retry_at.and_then(|at| snapshot.to_datetime(at)),
			stale_extensions: snapshot.stale_extensions,
			last_refresh: snapshot.last_refresh_at,
			metrics: status_metrics,
		}
	}
}

/// Metric sample used in status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusMetric {
	/// Metric name following the monitoring schema.
	pub name: String,
	/// Numeric value captured for the metric.
	pub value: f64,
	/// Additional labels enriching the metric sample.
	#[serde(default)]
	pub labels: HashMap<String, String>,
}
impl StatusMetric {
	fn new(name: impl Into<String>, value: f64, cache: &str) -> Self {
		let mut labels = HashMap::with_capacity(1);

		labels.insert("cache".into(), cache.into());

		Self { name: name.into(), value, labels }
	}
}
