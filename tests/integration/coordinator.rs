//! Refresh coordination against a scripted metadata source on a paused clock.

// std
use std::{
	collections::VecDeque,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use chrono::{DateTime, TimeDelta, Utc};
use instance_credentials::{
	CacheMode, CredentialSet, Error, MetadataSource, RefreshCoordinator, Result,
	StaleRetryDelay, StaleRetryPolicy, config::MAX_STALE_RETRY_DELAY,
};
use tokio::{sync::oneshot, time::Instant};

#[derive(Clone, Default)]
struct ScriptedSource {
	script: Arc<Mutex<VecDeque<Result<CredentialSet>>>>,
	calls: Arc<AtomicUsize>,
	delay: Duration,
}
impl ScriptedSource {
	fn new(delay: Duration) -> Self {
		Self { delay, ..Self::default() }
	}

	fn push(&self, outcome: Result<CredentialSet>) -> &Self {
		self.script.lock().expect("script lock").push_back(outcome);

		self
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}
impl MetadataSource for ScriptedSource {
	async fn fetch(&self) -> Result<CredentialSet> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		tokio::time::sleep(self.delay).await;

		self.script
			.lock()
			.expect("script lock")
			.pop_front()
			.unwrap_or_else(|| Err(Error::Metadata("script exhausted".into())))
	}
}

#[derive(Clone, Default)]
struct RecordingDelay {
	seen: Arc<Mutex<Vec<u32>>>,
}
impl StaleRetryDelay for RecordingDelay {
	fn stale_retry_delay(&self, consecutive: u32) -> Duration {
		self.seen.lock().expect("seen lock").push(consecutive);

		Duration::from_secs(5)
	}
}

#[derive(Default)]
struct PanickingDelay {
	tripped: AtomicBool,
}
impl StaleRetryDelay for PanickingDelay {
	fn stale_retry_delay(&self, _: u32) -> Duration {
		if !self.tripped.swap(true, Ordering::SeqCst) {
			panic!("retry schedule unavailable");
		}

		Duration::from_secs(5)
	}
}

struct UnboundedDelay;
impl StaleRetryDelay for UnboundedDelay {
	fn stale_retry_delay(&self, _: u32) -> Duration {
		Duration::MAX
	}
}

fn creds(key: &str, expiration: DateTime<Utc>) -> Result<CredentialSet> {
	Ok(CredentialSet::new(key, "secret", Some("session".into()), Some(expiration)))
}

fn unreachable() -> Result<CredentialSet> {
	Err(Error::Metadata("metadata service unreachable".into()))
}

fn coordinator(source: &ScriptedSource, retry: Duration) -> RefreshCoordinator<ScriptedSource> {
	RefreshCoordinator::builder()
		.name("test")
		.expiry_window(Duration::from_secs(15))
		.stale_retry(StaleRetryPolicy::fixed(retry))
		.build(source.clone())
		.expect("coordinator")
}

async fn settle() {
	tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_a_single_fetch() {
	let _ = tracing_subscriber::fmt::try_init();

	let source = ScriptedSource::new(Duration::from_millis(100));

	source.push(creds("AKIAFRESH", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));
	let handles: Vec<_> = (0..16)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.ensure_fresh().await })
		})
		.collect();

	for handle in handles {
		handle.await.expect("join").expect("ensure_fresh");
	}

	assert_eq!(source.calls(), 1);
	assert_eq!(cache.metrics().snapshot().coalesced_waits, 15);
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIAFRESH");
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_observe_the_same_failure() {
	let source = ScriptedSource::new(Duration::from_millis(100));

	source.push(unreachable());

	let cache = coordinator(&source, Duration::from_secs(5));
	let handles: Vec<_> = (0..8)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.ensure_fresh().await })
		})
		.collect();
	let mut failures = Vec::new();

	for handle in handles {
		match handle.await.expect("join") {
			Err(Error::Refresh(inner)) => failures.push(inner),
			other => panic!("expected shared refresh failure, got {other:?}"),
		}
	}

	assert_eq!(source.calls(), 1);
	assert!(failures.iter().all(|err| Arc::ptr_eq(err, &failures[0])));
	assert!(matches!(*failures[0], Error::Metadata(_)));
}

#[tokio::test(start_paused = true)]
async fn cold_start_failure_reports_no_credentials_until_first_success() {
	let source = ScriptedSource::new(Duration::ZERO);

	source.push(unreachable()).push(creds("AKIA1", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));

	assert!(matches!(cache.get_credentials().await, Err(Error::NoCredentials)));

	let err = cache.ensure_fresh().await.expect_err("cold start must fail");

	assert!(err.is_transport());
	assert!(matches!(cache.get_credentials().await, Err(Error::NoCredentials)));
	assert_eq!(cache.snapshot().await.mode(), CacheMode::Empty);

	let first = cache.credentials().await.expect("credentials after recovery");

	assert_eq!(first.access_key_id(), "AKIA1");

	cache.refresh_now().await.expect("failures after a load are swallowed");

	assert!(cache.get_credentials().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn transport_failure_keeps_prior_credentials() {
	let source = ScriptedSource::new(Duration::ZERO);
	let soon = Utc::now() + TimeDelta::seconds(10);

	source.push(creds("AKIAPRIOR", soon)).push(unreachable());

	let cache = coordinator(&source, Duration::from_secs(30));

	cache.ensure_fresh().await.expect("initial load");

	assert!(cache.needs_refresh(Utc::now()).await, "inside the expiry window");

	cache.ensure_fresh().await.expect("failure must be swallowed");

	let served = cache.get_credentials().await.expect("prior credentials");
	let snapshot = cache.snapshot().await;

	assert_eq!(source.calls(), 2);
	assert_eq!(served.access_key_id(), "AKIAPRIOR");
	assert_eq!(served.expiration(), Some(soon));
	assert_eq!(snapshot.mode(), CacheMode::StaleExtended);
	assert_eq!(snapshot.original_expiration, Some(soon));
	assert!(snapshot.retry_at.is_some());
	assert!(!cache.needs_refresh(Utc::now()).await);
	assert_eq!(cache.metrics().snapshot().failures_surfaced, 0);
}

#[tokio::test(start_paused = true)]
async fn expired_payload_extends_then_recovers_when_the_timer_fires() {
	let _ = tracing_subscriber::fmt::try_init();

	let source = ScriptedSource::new(Duration::ZERO);
	let now = Utc::now();
	let expired = now - TimeDelta::seconds(10);
	let fresh = now + TimeDelta::seconds(3600);

	source.push(creds("AKIASTALE", expired)).push(creds("AKIAFRESH", fresh));

	let cache = coordinator(&source, Duration::from_secs(5));

	cache.ensure_fresh().await.expect("expired payload is accepted");

	let snapshot = cache.snapshot().await;

	assert_eq!(snapshot.current.as_ref().map(|c| c.access_key_id()), Some("AKIASTALE"));
	assert_eq!(snapshot.original_expiration, Some(expired));
	assert_eq!(snapshot.expire_time, None);
	assert!(snapshot.retry_at.is_some());
	assert!(!cache.needs_refresh(now + TimeDelta::seconds(1)).await);
	assert!(cache.is_valid(now + TimeDelta::seconds(1)).await);

	cache.ensure_fresh().await.expect("suppressed refresh");

	assert_eq!(source.calls(), 1, "no fetch while the retry timer is pending");

	tokio::time::sleep(Duration::from_secs(6)).await;
	settle().await;

	let snapshot = cache.snapshot().await;

	assert_eq!(source.calls(), 2);
	assert_eq!(snapshot.current.as_ref().map(|c| c.access_key_id()), Some("AKIAFRESH"));
	assert_eq!(snapshot.original_expiration, None);
	assert_eq!(snapshot.expire_time, Some(fresh));
	assert!(snapshot.retry_at.is_none());
	assert_eq!(snapshot.mode(), CacheMode::Fresh);
	assert!(!cache.needs_refresh(Utc::now()).await);
	assert!(cache.needs_refresh(fresh - TimeDelta::seconds(10)).await);
}

#[tokio::test(start_paused = true)]
async fn original_expiration_survives_repeated_stale_outcomes() {
	let source = ScriptedSource::new(Duration::ZERO);
	let delay = RecordingDelay::default();
	let first = Utc::now() - TimeDelta::seconds(30);

	source
		.push(creds("AKIA1", first))
		.push(creds("AKIA2", Utc::now() - TimeDelta::seconds(5)))
		.push(unreachable());

	let cache = RefreshCoordinator::builder()
		.name("repeated")
		.stale_retry_delay(delay.clone())
		.build(source.clone())
		.expect("coordinator");

	cache.ensure_fresh().await.expect("first stale");
	tokio::time::sleep(Duration::from_secs(6)).await;
	settle().await;
	tokio::time::sleep(Duration::from_secs(6)).await;
	settle().await;

	let snapshot = cache.snapshot().await;

	assert_eq!(source.calls(), 3);
	assert_eq!(snapshot.original_expiration, Some(first));
	assert_eq!(snapshot.stale_extensions, 3);
	assert_eq!(snapshot.current.as_ref().map(|c| c.access_key_id()), Some("AKIA2"));
	assert_eq!(*delay.seen.lock().expect("seen lock"), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_replaces_the_pending_timer() {
	let source = ScriptedSource::new(Duration::ZERO);
	let fresh = Utc::now() + TimeDelta::seconds(3600);

	source.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10))).push(creds("AKIAFRESH", fresh));

	let cache = coordinator(&source, Duration::from_secs(60));

	cache.ensure_fresh().await.expect("stale load");

	assert!(cache.snapshot().await.retry_at.is_some());

	cache.refresh_now().await.expect("manual refresh");

	assert!(cache.snapshot().await.retry_at.is_none());

	tokio::time::sleep(Duration::from_secs(120)).await;
	settle().await;

	assert_eq!(source.calls(), 2, "cancelled timer must not fetch again");
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIAFRESH");
}

#[tokio::test(start_paused = true)]
async fn strict_expiry_surfaces_expired_payloads() {
	let source = ScriptedSource::new(Duration::ZERO);

	source.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)));

	let cache = RefreshCoordinator::builder()
		.name("strict")
		.strict_expiry(true)
		.build(source.clone())
		.expect("coordinator");
	let err = cache.ensure_fresh().await.expect_err("strict mode rejects expired data");

	assert!(matches!(err.root(), Error::ExpiredCredentials { .. }));
	assert!(matches!(cache.get_credentials().await, Err(Error::NoCredentials)));
	assert!(cache.snapshot().await.retry_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn callback_receives_the_outcome() {
	let source = ScriptedSource::new(Duration::from_millis(50));

	source.push(creds("AKIA1", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));
	let (sender, receiver) = oneshot::channel();

	cache.ensure_fresh_with(move |outcome| {
		let _ = sender.send(outcome.is_ok());
	});

	assert!(receiver.await.expect("callback invoked"));
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIA1");
}

#[tokio::test(start_paused = true)]
async fn abandoned_callers_do_not_cancel_the_fetch() {
	let source = ScriptedSource::new(Duration::from_millis(100));

	source.push(creds("AKIA1", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));
	let abandoned = tokio::time::timeout(Duration::from_millis(10), cache.ensure_fresh()).await;

	assert!(abandoned.is_err(), "caller gave up before the fetch finished");

	tokio::time::sleep(Duration::from_millis(200)).await;

	assert_eq!(source.calls(), 1);
	assert!(cache.get_credentials().await.is_ok());
	assert!(!cache.snapshot().await.refreshing);
}

#[tokio::test(start_paused = true)]
async fn fresh_credentials_skip_the_network() {
	let source = ScriptedSource::new(Duration::ZERO);

	source.push(creds("AKIA1", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));

	for _ in 0..5 {
		cache.credentials().await.expect("credentials");
	}

	let status = cache.status().await;

	assert_eq!(source.calls(), 1);
	assert_eq!(status.mode, CacheMode::Fresh);
	assert_eq!(status.access_key_id.as_deref(), Some("AKIA1"));
	assert_eq!(cache.metrics().snapshot().ensure_calls, 5);
}

#[tokio::test(start_paused = true)]
async fn strict_expiry_throttles_expired_payloads_after_a_load() {
	let source = ScriptedSource::new(Duration::ZERO);
	let soon = Utc::now() + TimeDelta::seconds(10);

	source
		.push(creds("AKIAPRIOR", soon))
		.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)));

	let cache = RefreshCoordinator::builder()
		.name("strict-loaded")
		.strict_expiry(true)
		.stale_retry(StaleRetryPolicy::fixed(Duration::from_secs(60)))
		.build(source.clone())
		.expect("coordinator");

	cache.ensure_fresh().await.expect("initial load");
	cache.ensure_fresh().await.expect("expired payload keeps prior credentials");

	for _ in 0..5 {
		cache.ensure_fresh().await.expect("suppressed refresh");
	}

	let snapshot = cache.snapshot().await;

	assert_eq!(source.calls(), 2, "retry timer bounds refetching");
	assert_eq!(snapshot.current.as_ref().map(|c| c.access_key_id()), Some("AKIAPRIOR"));
	assert_eq!(snapshot.original_expiration, Some(soon));
	assert_eq!(snapshot.mode(), CacheMode::StaleExtended);
	assert!(snapshot.retry_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn panicking_retry_schedule_releases_waiters() {
	let source = ScriptedSource::new(Duration::from_millis(50));

	source
		.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)))
		.push(creds("AKIAFRESH", Utc::now() + TimeDelta::seconds(3600)));

	let cache = RefreshCoordinator::builder()
		.name("panicking")
		.stale_retry_delay(PanickingDelay::default())
		.build(source.clone())
		.expect("coordinator");
	let waiters: Vec<_> = (0..3)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.ensure_fresh().await })
		})
		.collect();

	for waiter in waiters {
		let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
			.await
			.expect("waiter resolved")
			.expect("join");

		assert!(matches!(outcome.as_ref().map_err(Error::root), Err(Error::Cache(_))));
	}

	assert!(!cache.snapshot().await.refreshing);

	tokio::time::timeout(Duration::from_secs(5), cache.ensure_fresh())
		.await
		.expect("next refresh is not wedged")
		.expect("recovered");

	assert_eq!(source.calls(), 2);
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIAFRESH");
}

#[tokio::test(start_paused = true)]
async fn unbounded_retry_delays_are_clamped() {
	let source = ScriptedSource::new(Duration::ZERO);

	source.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)));

	let cache = RefreshCoordinator::builder()
		.name("unbounded")
		.stale_retry_delay(UnboundedDelay)
		.build(source.clone())
		.expect("coordinator");

	tokio::time::timeout(Duration::from_secs(5), cache.ensure_fresh())
		.await
		.expect("refresh settles")
		.expect("expired payload is accepted");

	let snapshot = cache.snapshot().await;
	let retry_at = snapshot.retry_at.expect("retry armed");

	assert!(!snapshot.refreshing);
	assert!(retry_at <= Instant::now() + MAX_STALE_RETRY_DELAY);
	assert!(retry_at > Instant::now() + MAX_STALE_RETRY_DELAY - Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn callers_join_a_timer_triggered_fetch() {
	let source = ScriptedSource::new(Duration::from_secs(10));

	source
		.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)))
		.push(creds("AKIAFRESH", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));

	cache.ensure_fresh().await.expect("stale load");

	// Timer fires 5 s after the first fetch settles; the second fetch then runs for 10 s.
	tokio::time::sleep(Duration::from_secs(6)).await;

	assert_eq!(source.calls(), 2);
	assert!(cache.snapshot().await.refreshing);

	let coalesced_before = cache.metrics().snapshot().coalesced_waits;
	let callers: Vec<_> = (0..4)
		.map(|_| {
			let cache = cache.clone();

			tokio::spawn(async move { cache.ensure_fresh().await })
		})
		.collect();

	for caller in callers {
		caller.await.expect("join").expect("joined timer fetch");
	}

	assert_eq!(source.calls(), 2, "callers never start a second fetch");
	assert_eq!(cache.metrics().snapshot().coalesced_waits - coalesced_before, 4);
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIAFRESH");
	assert!(cache.snapshot().await.retry_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_timer_deadline_passes_during_manual_refresh() {
	let source = ScriptedSource::new(Duration::from_secs(10));

	source
		.push(creds("AKIASTALE", Utc::now() - TimeDelta::seconds(10)))
		.push(creds("AKIAFRESH", Utc::now() + TimeDelta::seconds(3600)));

	let cache = coordinator(&source, Duration::from_secs(5));

	cache.ensure_fresh().await.expect("stale load");

	let manual = {
		let cache = cache.clone();

		tokio::spawn(async move { cache.refresh_now().await })
	};

	// Past the cancelled timer's deadline while the manual fetch is still running.
	tokio::time::sleep(Duration::from_secs(7)).await;

	assert!(cache.snapshot().await.refreshing);
	assert_eq!(source.calls(), 2);

	manual.await.expect("join").expect("manual refresh");
	tokio::time::sleep(Duration::from_secs(30)).await;

	assert_eq!(source.calls(), 2, "no timer-driven fetch alongside or after the manual one");
	assert_eq!(cache.get_credentials().await.expect("credentials").access_key_id(), "AKIAFRESH");
}
