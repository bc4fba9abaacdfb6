//! The network seam between the cache and the metadata service.

// std
use std::future::Future;
// self
use crate::{_prelude::*, credentials::CredentialSet};

/// Anything able to produce a fresh credential set from instance metadata.
///
/// Implementations own transport concerns (timeouts, retries, parsing). Any error returned here is
/// treated as a transport failure by the refresh coordinator.
pub trait MetadataSource: Send + Sync + 'static {
	/// Fetch the current credential material.
	fn fetch(&self) -> impl Future<Output = Result<CredentialSet>> + Send;
}
impl<S> MetadataSource for Arc<S>
where
	S: MetadataSource,
{
	fn fetch(&self) -> impl Future<Output = Result<CredentialSet>> + Send {
		(**self).fetch()
	}
}
