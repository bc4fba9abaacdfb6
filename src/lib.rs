//! Self-refreshing instance-metadata credential cache with single-flight refresh and
//! stale-tolerant recovery.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod credentials;
pub mod http;
pub mod metrics;
pub mod source;
pub mod status;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	cache::{
		coordinator::{CredentialCacheBuilder, RefreshCoordinator},
		policy::{Decision, ExpiryPolicy, ExpiryWindowRule},
		state::CredentialCache,
	},
	config::{
		CacheConfig, JitterStrategy, MetadataConfig, RetryPolicy, StaleRetryDelay,
		StaleRetryPolicy,
	},
	credentials::CredentialSet,
	error::{Error, Result},
	http::client::ImdsClient,
	source::MetadataSource,
	status::{CacheMode, CacheStatus},
};

/// Credential cache backed by the instance metadata service.
pub type InstanceCredentials = RefreshCoordinator<ImdsClient>;
