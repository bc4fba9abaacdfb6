//! Metrics helpers and per-cache telemetry bookkeeping.
//!
//! Per-cache counters are always kept. The global `metrics` facade is only fed when the
//! `metrics` feature is enabled; `prometheus` additionally provides a default exporter.

// std
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
use crate::_prelude::*;

#[cfg(feature = "metrics")]
type LabelSet = SmallVec<[Label; 2]>;

/// Counter of `ensure_fresh` invocations.
pub const METRIC_ENSURE_TOTAL: &str = "instance_credentials_ensure_total";
/// Counter of callers that joined an in-flight refresh.
pub const METRIC_COALESCED_TOTAL: &str = "instance_credentials_coalesced_total";
/// Counter of metadata fetches, labelled by status.
pub const METRIC_FETCH_TOTAL: &str = "instance_credentials_fetch_total";
/// Histogram of metadata fetch latency.
pub const METRIC_FETCH_DURATION: &str = "instance_credentials_fetch_duration_seconds";
/// Counter of stale extensions.
pub const METRIC_STALE_TOTAL: &str = "instance_credentials_stale_extensions_total";
/// Counter of failures surfaced to callers.
pub const METRIC_FAILURES_TOTAL: &str = "instance_credentials_failures_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe metrics accumulator for a single credential cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	ensure_calls: AtomicU64,
	coalesced_waits: AtomicU64,
	fetches: AtomicU64,
	fetch_errors: AtomicU64,
	stale_extensions: AtomicU64,
	failures_surfaced: AtomicU64,
	last_fetch_micros: AtomicU64,
}
impl CacheMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record an `ensure_fresh` call.
	pub fn record_ensure(&self) {
		self.ensure_calls.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a caller joining an in-flight refresh.
	pub fn record_coalesced(&self) {
		self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a completed fetch and its latency.
	pub fn record_fetch(&self, duration: Duration, failed: bool) {
		self.fetches.fetch_add(1, Ordering::Relaxed);
		self.last_fetch_micros.store(duration.as_micros() as u64, Ordering::Relaxed);

		if failed {
			self.fetch_errors.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a stale extension.
	pub fn record_stale_extension(&self) {
		self.stale_extensions.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a failure delivered to callers.
	pub fn record_failure(&self) {
		self.failures_surfaced.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> CacheMetricsSnapshot {
		CacheMetricsSnapshot {
			ensure_calls: self.ensure_calls.load(Ordering::Relaxed),
			coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
			fetches: self.fetches.load(Ordering::Relaxed),
			fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
			stale_extensions: self.stale_extensions.load(Ordering::Relaxed),
			failures_surfaced: self.failures_surfaced.load(Ordering::Relaxed),
			last_fetch_micros: match self.last_fetch_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of per-cache telemetry counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
	/// Total number of `ensure_fresh` calls.
	pub ensure_calls: u64,
	/// Calls that joined an already running refresh.
	pub coalesced_waits: u64,
	/// Metadata fetches performed.
	pub fetches: u64,
	/// Fetches that returned an error.
	pub fetch_errors: u64,
	/// Outcomes that left the cache serving stale credentials.
	pub stale_extensions: u64,
	/// Failures delivered to callers.
	pub failures_surfaced: u64,
	/// Microsecond latency of the most recent fetch.
	pub last_fetch_micros: Option<u64>,
}
impl CacheMetricsSnapshot {
	/// Share of `ensure_fresh` calls that were coalesced onto another caller's fetch.
	pub fn coalesce_ratio(&self) -> f64 {
		if self.ensure_calls == 0 {
			0.0
		} else {
			self.coalesced_waits as f64 / self.ensure_calls as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder()?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record an `ensure_fresh` call, tagging whether it joined an in-flight refresh.
pub fn record_ensure(cache: &str, coalesced: bool) {
	#[cfg(feature = "metrics")]
	{
		let labels = base_labels(cache);

		metrics::counter!(METRIC_ENSURE_TOTAL, labels.iter()).increment(1);

		if coalesced {
			metrics::counter!(METRIC_COALESCED_TOTAL, labels.iter()).increment(1);
		}
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (cache, coalesced);
}

/// Record a metadata fetch along with its latency.
pub fn record_fetch(cache: &str, duration: Duration, failed: bool) {
	#[cfg(feature = "metrics")]
	{
		let status = if failed { "error" } else { "success" };

		metrics::counter!(METRIC_FETCH_TOTAL, status_labels(cache, status).iter()).increment(1);
		metrics::histogram!(METRIC_FETCH_DURATION, base_labels(cache).iter())
			.record(duration.as_secs_f64());
	}
	#[cfg(not(feature = "metrics"))]
	let _ = (cache, duration, failed);
}

/// Record a stale extension.
pub fn record_stale_extension(cache: &str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_STALE_TOTAL, base_labels(cache).iter()).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

/// Record a failure surfaced to callers.
pub fn record_failure(cache: &str) {
	#[cfg(feature = "metrics")]
	metrics::counter!(METRIC_FAILURES_TOTAL, base_labels(cache).iter()).increment(1);
	#[cfg(not(feature = "metrics"))]
	let _ = cache;
}

#[cfg(feature = "metrics")]
fn base_labels(cache: &str) -> LabelSet {
	let mut labels = LabelSet::with_capacity(2);

	labels.push(Label::new("cache", cache.to_owned()));

	labels
}

#[cfg(feature = "metrics")]
fn status_labels(cache: &str, status: &'static str) -> LabelSet {
	let mut labels = base_labels(cache);

	labels.push(Label::new("status", status));

	labels
}
