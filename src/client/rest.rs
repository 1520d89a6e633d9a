//! REST client for the configuration service.

// std
use std::fmt::Debug;
// crates.io
use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::time;
use url::{Position, Url};
// self
use crate::{
	_prelude::*,
	client::transport::{
		RequestContext, SettingResponse, SettingsClient, SettingsPage, SnapshotInfo,
	},
	options::{ClientOptions, RetryOptions},
	selector::SettingSelector,
	setting::ConfigurationSetting,
	telemetry::CORRELATION_CONTEXT_HEADER,
	timer::jittered_backoff,
};

/// Service API version spoken by this client.
pub const API_VERSION: &str = "2023-11-01";

/// Token source for bearer authentication; acquisition itself is external.
#[async_trait]
pub trait TokenCredential: Debug + Send + Sync {
	/// Produce a bearer token valid for the configuration service.
	async fn get_token(&self) -> Result<String>;
}

/// Credential used to authenticate service requests.
#[derive(Clone, Debug)]
pub enum Credential {
	/// HMAC-SHA256 access key from a connection string.
	AccessKey {
		/// Credential identifier.
		id: String,
		/// Base64-encoded signing secret.
		secret: String,
	},
	/// Bearer token supplied by an external credential source.
	Token(Arc<dyn TokenCredential>),
}

/// `reqwest`-backed [`SettingsClient`] for one endpoint.
#[derive(Debug)]
pub struct RestClient {
	endpoint: Url,
	credential: Credential,
	http: reqwest::Client,
	retry: RetryOptions,
}
impl RestClient {
	/// Build a client for the endpoint with the given credential.
	pub fn new(endpoint: Url, credential: Credential, options: &ClientOptions) -> Result<Self> {
		let product = format!("appconfig-provider/{}", env!("CARGO_PKG_VERSION"));
		let user_agent = match &options.user_agent_prefix {
			Some(prefix) => format!("{prefix} {product}"),
			None => product,
		};
		let http = reqwest::Client::builder()
			.user_agent(user_agent)
			.connect_timeout(Duration::from_secs(5))
			.build()?;

		Ok(Self { endpoint, credential, http, retry: options.retry.clone() })
	}

	/// Endpoint this client talks to.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	fn kv_url(&self) -> Result<Url> {
		self.endpoint.join("kv").map_err(Error::from)
	}

	fn kv_item_url(&self, key: &str) -> Result<Url> {
		let mut url = self.endpoint.clone();

		url.path_segments_mut()
			.map_err(|()| Error::InvalidArgument {
				field: "endpoint",
				reason: "Endpoint URL cannot be a base.".into(),
			})?
			.pop_if_empty()
			.push("kv")
			.push(key);

		Ok(url)
	}

	async fn send(
		&self,
		url: Url,
		if_none_match: Option<&str>,
		context: &RequestContext,
	) -> Result<reqwest::Response> {
		let mut attempts = 0;

		loop {
			let outcome = self.attempt(url.clone(), if_none_match, context).await;
			let retry_after = match &outcome {
				Ok(response) if retryable_status(response.status()) => true,
				Ok(_) => false,
				Err(err) => err.is_timeout() || err.is_connect(),
			};

			if retry_after && attempts < self.retry.max_retries {
				attempts += 1;

				let delay = jittered_backoff(
					self.retry.initial_backoff,
					self.retry.max_backoff,
					attempts,
				);

				tracing::debug!(endpoint = %self.endpoint, attempts, ?delay, "retrying request");
				time::sleep(delay).await;

				continue;
			}

			return outcome.map_err(Error::from);
		}
	}

	async fn attempt(
		&self,
		url: Url,
		if_none_match: Option<&str>,
		context: &RequestContext,
	) -> std::result::Result<reqwest::Response, reqwest::Error> {
		let mut builder = self
			.http
			.get(url.clone())
			.timeout(self.retry.attempt_timeout)
			.header(http::header::ACCEPT, "application/json");

		if let Some(etag) = if_none_match {
			builder = builder.header(http::header::IF_NONE_MATCH, etag);
		}
		if let Some(correlation) = &context.correlation {
			builder = builder.header(CORRELATION_CONTEXT_HEADER, correlation);
		}

		builder = self.authorize(builder, &url).await;

		builder.send().await
	}

	async fn authorize(&self, builder: reqwest::RequestBuilder, url: &Url) -> reqwest::RequestBuilder {
		match &self.credential {
			Credential::AccessKey { id, secret } => {
				let host = match (url.host_str(), url.port()) {
					(Some(host), Some(port)) => format!("{host}:{port}"),
					(Some(host), None) => host.to_string(),
					(None, _) => String::new(),
				};
				let path_and_query = &url[Position::BeforePath..];
				let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
				let content_hash = BASE64_STANDARD.encode(Sha256::digest(b""));
				let string_to_sign = format!("GET\n{path_and_query}\n{date};{host};{content_hash}");
				let Ok(key) = BASE64_STANDARD.decode(secret) else {
					return builder;
				};
				let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&key) else {
					return builder;
				};

				mac.update(string_to_sign.as_bytes());

				let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

				builder
					.header("x-ms-date", date)
					.header("x-ms-content-sha256", content_hash)
					.header(
						http::header::AUTHORIZATION,
						format!(
							"HMAC-SHA256 Credential={id}&SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={signature}"
						),
					)
			},
			Credential::Token(credential) => match credential.get_token().await {
				Ok(token) =>
					builder.header(http::header::AUTHORIZATION, format!("Bearer {token}")),
				Err(err) => {
					tracing::warn!(error = %err, "token acquisition failed; sending unauthenticated");

					builder
				},
			},
		}
	}

	async fn status_error(&self, response: reqwest::Response) -> Error {
		let status = response.status();
		let body = response.text().await.ok().filter(|body| !body.is_empty());

		Error::HttpStatus { status, endpoint: self.endpoint.clone(), body }
	}

	async fn list_pages(
		&self,
		first: Url,
		prior_page_etags: Option<&[String]>,
		context: &RequestContext,
	) -> Result<Vec<SettingsPage>> {
		let mut pages = Vec::new();
		let mut next = Some(first);

		while let Some(url) = next {
			let prior_etag =
				prior_page_etags.and_then(|etags| etags.get(pages.len())).map(String::as_str);
			let response = self.send(url, prior_etag, context).await?;
			let status = response.status();
			let etag = response
				.headers()
				.get(http::header::ETAG)
				.and_then(|value| value.to_str().ok())
				.map(str::to_string);
			let link_next = next_from_link_header(&response)
				.map(|link| self.endpoint.join(&link))
				.transpose()?;

			if status == StatusCode::NOT_MODIFIED {
				pages.push(SettingsPage {
					etag: etag.or_else(|| prior_etag.map(str::to_string)),
					settings: Vec::new(),
					not_modified: true,
				});
				next = link_next;
			} else if status.is_success() {
				let body: ListPage = response.json().await?;

				next = match body.next_link.filter(|link| !link.is_empty()) {
					Some(link) => Some(self.endpoint.join(&link)?),
					None => None,
				};

				pages.push(SettingsPage { etag, settings: body.items, not_modified: false });
			} else {
				return Err(self.status_error(response).await);
			}
		}

		Ok(pages)
	}
}
#[async_trait]
impl SettingsClient for RestClient {
	async fn list_settings(
		&self,
		selector: &SettingSelector,
		prior_page_etags: Option<&[String]>,
		context: &RequestContext,
	) -> Result<Vec<SettingsPage>> {
		let mut url = self.kv_url()?;

		{
			let mut query = url.query_pairs_mut();

			query.append_pair("key", &selector.key_filter);
			query.append_pair("label", &selector.label_filter);

			for tag_filter in &selector.tag_filters {
				query.append_pair("tags", tag_filter);
			}

			query.append_pair("api-version", API_VERSION);
		}

		self.list_pages(url, prior_page_etags, context).await
	}

	async fn get_setting(
		&self,
		key: &str,
		label: Option<&str>,
		if_none_match: Option<&str>,
		context: &RequestContext,
	) -> Result<SettingResponse> {
		let mut url = self.kv_item_url(key)?;

		{
			let mut query = url.query_pairs_mut();

			if let Some(label) = label {
				query.append_pair("label", label);
			}

			query.append_pair("api-version", API_VERSION);
		}

		let response = self.send(url, if_none_match, context).await?;

		match response.status() {
			StatusCode::NOT_MODIFIED => Ok(SettingResponse::NotModified),
			StatusCode::NOT_FOUND => Ok(SettingResponse::NotFound),
			status if status.is_success() =>
				Ok(SettingResponse::Modified(response.json::<ConfigurationSetting>().await?)),
			_ => Err(self.status_error(response).await),
		}
	}

	async fn get_snapshot(&self, name: &str, context: &RequestContext) -> Result<SnapshotInfo> {
		let mut url = self.endpoint.join(&format!("snapshots/{name}"))?;

		url.query_pairs_mut().append_pair("api-version", API_VERSION);

		let response = self.send(url, None, context).await?;

		if response.status().is_success() {
			Ok(response.json::<SnapshotInfo>().await?)
		} else {
			Err(self.status_error(response).await)
		}
	}

	async fn list_snapshot_settings(
		&self,
		name: &str,
		context: &RequestContext,
	) -> Result<Vec<SettingsPage>> {
		let mut url = self.kv_url()?;

		{
			let mut query = url.query_pairs_mut();

			query.append_pair("snapshot", name);
			query.append_pair("api-version", API_VERSION);
		}

		self.list_pages(url, None, context).await
	}
}

#[derive(Debug, Deserialize)]
struct ListPage {
	#[serde(default)]
	items: Vec<ConfigurationSetting>,
	#[serde(default, rename = "@nextLink")]
	next_link: Option<String>,
}

fn retryable_status(status: StatusCode) -> bool {
	matches!(status.as_u16(), 408 | 429) || status.is_server_error()
}

// A 304 page has no body, so its continuation arrives via the `Link`
// response header instead of `@nextLink`.
fn next_from_link_header(response: &reqwest::Response) -> Option<String> {
	let link = response.headers().get(http::header::LINK)?.to_str().ok()?;

	link.split(',').find_map(|part| {
		let (target, params) = part.split_once(';')?;

		if !params.contains("rel=\"next\"") {
			return None;
		}

		Some(target.trim().trim_start_matches('<').trim_end_matches('>').to_string())
	})
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn link_header_yields_the_next_page() {
		let response = http::Response::builder()
			.header(http::header::LINK, "</kv?after=5>; rel=\"next\"")
			.body("")
			.unwrap();
		let response = reqwest::Response::from(response);

		assert_eq!(next_from_link_header(&response).as_deref(), Some("/kv?after=5"));
	}

	#[test]
	fn retryable_statuses_are_the_transient_ones() {
		assert!(retryable_status(StatusCode::REQUEST_TIMEOUT));
		assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
		assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
		assert!(!retryable_status(StatusCode::UNAUTHORIZED));
		assert!(!retryable_status(StatusCode::NOT_FOUND));
	}
}
