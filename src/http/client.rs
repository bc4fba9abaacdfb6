//! Reqwest-backed [`MetadataSource`] for the instance metadata service.

// crates.io
use http::{StatusCode, header::ACCEPT};
use reqwest::{Client, redirect::Policy};
use serde::Deserialize;
use url::Url;
// self
use crate::{
	_prelude::*,
	config::MetadataConfig,
	credentials::CredentialSet,
	http::retry::{AttemptBudget, RetryExecutor},
	source::MetadataSource,
};

const SUCCESS_CODE: &str = "Success";

/// Role credential document served by the metadata service.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataCredentials {
	/// Status reported by the service; only `Success` is accepted when present.
	#[serde(default)]
	pub code: Option<String>,
	/// Access key identifier.
	pub access_key_id: String,
	/// Secret access key.
	pub secret_access_key: String,
	/// Session token for the temporary credentials.
	#[serde(default)]
	pub token: Option<String>,
	/// ISO-8601 expiry of the credentials.
	pub expiration: DateTime<Utc>,
}
impl TryFrom<MetadataCredentials> for CredentialSet {
	type Error = Error;

	fn try_from(value: MetadataCredentials) -> Result<Self> {
		if let Some(code) = value.code.as_deref()
			&& code != SUCCESS_CODE
		{
			return Err(Error::Metadata(format!("Credential document reported code '{code}'.")));
		}
		if value.access_key_id.is_empty() || value.secret_access_key.is_empty() {
			return Err(Error::Metadata("Credential document is missing key material.".into()));
		}

		Ok(CredentialSet::new(
			value.access_key_id,
			value.secret_access_key,
			value.token.filter(|token| !token.is_empty()),
			Some(value.expiration),
		))
	}
}

/// Parse a role credential document into a [`CredentialSet`].
pub fn parse_credentials(body: &[u8]) -> Result<CredentialSet> {
	let document: MetadataCredentials = serde_json::from_slice(body)?;

	document.try_into()
}

/// HTTP client for the instance metadata credential endpoints.
#[derive(Clone, Debug)]
pub struct ImdsClient {
	client: Client,
	config: Arc<MetadataConfig>,
}
impl ImdsClient {
	/// Build a client with a reqwest instance configured from `config`.
	pub fn new(config: MetadataConfig) -> Result<Self> {
		config.validate()?;

		let client = Client::builder()
			.redirect(Policy::none())
			.user_agent(format!("instance-credentials/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(config.connect_timeout)
			.no_proxy()
			.build()?;

		Ok(Self::with_client(config, client))
	}

	/// Build a client around the supplied reqwest instance (primarily for tests).
	pub fn with_client(config: MetadataConfig, client: Client) -> Self {
		Self { client, config: Arc::new(config) }
	}

	/// Configuration in use.
	pub fn config(&self) -> &MetadataConfig {
		&self.config
	}

	async fn fetch_once(&self, timeout: Duration) -> Result<CredentialSet> {
		let role = match &self.config.role_name {
			Some(role) => role.clone(),
			None => self.discover_role(timeout).await?,
		};
		let body = self.get_document(self.config.role_url(&role)?, timeout).await?;

		parse_credentials(&body)
	}

	async fn discover_role(&self, timeout: Duration) -> Result<String> {
		let body = self.get_document(self.config.listing_url()?, timeout).await?;
		let listing = String::from_utf8_lossy(&body);

		listing
			.lines()
			.map(str::trim)
			.find(|line| !line.is_empty())
			.map(str::to_owned)
			.ok_or_else(|| Error::Metadata("No instance role is attached.".into()))
	}

	async fn get_document(&self, url: Url, timeout: Duration) -> Result<Vec<u8>> {
		let start = Instant::now();
		let response = self
			.client
			.get(url.clone())
			.header(ACCEPT, "application/json, text/plain")
			.timeout(timeout)
			.send()
			.await?;
		let status = response.status();

		if !status.is_success() {
			let body = response.text().await.ok();

			return Err(Error::HttpStatus { status, url, body });
		}

		let bytes = response.bytes().await?;

		if bytes.len() as u64 > self.config.max_response_bytes {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: format!(
					"Response size {size} bytes exceeds the configured guard of {limit} bytes.",
					size = bytes.len(),
					limit = self.config.max_response_bytes
				),
			});
		}

		tracing::debug!(url = %url, status = %status, elapsed = ?start.elapsed(), "metadata request complete");

		Ok(bytes.to_vec())
	}
}
impl MetadataSource for ImdsClient {
	async fn fetch(&self) -> Result<CredentialSet> {
		let mut executor = RetryExecutor::new(&self.config.retry_policy, self.config.timeout);
		let mut last_error: Option<Error> = None;

		while let AttemptBudget::Granted { timeout } = executor.attempt_budget() {
			match self.fetch_once(timeout).await {
				Ok(credentials) => return Ok(credentials),
				Err(err) => {
					if !is_retryable(&err) {
						return Err(err);
					}

					tracing::debug!(error = %err, attempt = executor.attempts_used(), "metadata fetch attempt failed");

					last_error = Some(err);

					if !executor.sleep_backoff().await {
						break;
					}
				},
			}
		}

		Err(last_error.unwrap_or_else(|| Error::Cache("Metadata fetch attempts exhausted.".into())))
	}
}

fn is_retryable(err: &Error) -> bool {
	match err {
		Error::Reqwest(_) => true,
		Error::HttpStatus { status, .. } =>
			status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS,
		_ => false,
	}
}
