//!
//! HTTP page fetcher for paginated JSON collections.
//!
//! The fetcher issues one GET per page through an [`HttpTransport`], decodes
//! the body into records and works out the continuation token. Pagination
//! follows `Link: rel="next"` headers and can optionally fall back to a page
//! counter carried in the body. An exhausted rate limit ends pagination
//! without an error.

use super::link::next_link;
use super::types::*;
use crate::config::{FetchConfig, SyncTarget};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Minimal HTTP GET abstraction the fetcher runs on.
#[async_trait]
pub trait HttpTransport: Send + Sync {
	/// Perform a GET request.
	///
	/// # Arguments
	/// * `url` - The absolute URL to request.
	/// * `headers` - Extra request headers.
	///
	/// # Returns
	/// The response with lowercased header names, or a `FetchError` when no
	/// response was received.
	async fn get(
		&self,
		url: &Url,
		headers: &BTreeMap<String, String>,
	) -> Result<HttpResponse, FetchError>;
}

/// [`HttpTransport`] backed by a reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
	/// The underlying HTTP client.
	http_client: Client,
}

impl ReqwestTransport {
	/// Create a transport with its own client.
	///
	/// # Arguments
	/// * `timeout` - Per-request timeout.
	///
	/// # Returns
	/// A new `ReqwestTransport`, or a `FetchError` if the client cannot be built.
	pub fn new(timeout: Duration) -> Result<Self, FetchError> {
		let http_client = Client::builder()
			.timeout(timeout)
			.user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self { http_client })
	}
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
	async fn get(
		&self,
		url: &Url,
		headers: &BTreeMap<String, String>,
	) -> Result<HttpResponse, FetchError> {
		let mut request = self
			.http_client
			.get(url.clone())
			.header(ACCEPT, "application/json");
		for (name, value) in headers {
			request = request.header(name.as_str(), value.as_str());
		}

		let response = request.send().await?;
		let status = response.status().as_u16();

		let mut collected: BTreeMap<String, String> = BTreeMap::new();
		for (name, value) in response.headers() {
			let Ok(value) = value.to_str() else {
				continue;
			};
			collected
				.entry(name.as_str().to_string())
				.and_modify(|existing| {
					existing.push_str(", ");
					existing.push_str(value);
				})
				.or_insert_with(|| value.to_string());
		}

		let body = response.bytes().await?.to_vec();

		Ok(HttpResponse {
			status,
			headers: collected,
			body,
		})
	}
}

/// Fetches and decodes single pages of a remote collection
#[derive(Clone)]
pub struct PageFetcher {
	transport: Arc<dyn HttpTransport>,
	config: FetchConfig,
}

impl PageFetcher {
	pub fn new(transport: Arc<dyn HttpTransport>, config: FetchConfig) -> Self {
		Self { transport, config }
	}

	/// Create a fetcher on a [`ReqwestTransport`] using the configured timeout.
	pub fn with_reqwest(config: FetchConfig) -> Result<Self, FetchError> {
		let transport = ReqwestTransport::new(config.timeout())?;
		Ok(Self::new(Arc::new(transport), config))
	}

	/// Resolve the URL of a page.
	///
	/// # Arguments
	/// * `target` - The collection being synchronized.
	/// * `token` - Continuation token, `None` for the first page.
	///
	/// # Returns
	/// The absolute page URL. `Link` URLs are taken as given (relative ones
	/// resolve against the target URL). The first page and page-number pages
	/// get the page size hint added.
	pub fn page_url(&self, target: &SyncTarget, token: Option<&PageToken>) -> Result<Url, FetchError> {
		let base = Url::parse(&target.url)?;

		let mut url = match token {
			Some(PageToken::Url(next)) => return Ok(base.join(next)?),
			Some(PageToken::Page(page)) => {
				let mut url = base;
				set_query_param(&mut url, &self.config.page_param, &page.to_string());
				url
			}
			None => base,
		};

		if let Some(page_size) = target.page_size_hint {
			set_query_param(&mut url, &self.config.page_size_param, &page_size.to_string());
		}
		Ok(url)
	}

	/// Fetch one page.
	///
	/// # Arguments
	/// * `url` - The page URL.
	/// * `headers` - Extra request headers.
	///
	/// # Returns
	/// The decoded page. A response reporting an exhausted rate limit yields
	/// an empty terminal page flagged `rate_limited` whatever its status.
	///
	/// # Errors
	/// `FetchError` on transport failures, non-2xx statuses and bodies that
	/// are not a JSON array of objects (or an object wrapping one under the
	/// configured records field).
	pub async fn fetch(
		&self,
		url: &Url,
		headers: &BTreeMap<String, String>,
	) -> Result<PageResult, FetchError> {
		debug!(%url, "Fetching page");

		let response = self.transport.get(url, headers).await?;

		// Quota exhaustion closes pagination before the status is considered
		if self.rate_limit_exhausted(&response) {
			warn!(%url, status = response.status, "Rate limit exhausted, closing pagination");
			return Ok(PageResult::rate_limited());
		}

		if !response.is_success() {
			return Err(FetchError::Status {
				status: response.status,
				url: url.to_string(),
			});
		}

		let body: Value = serde_json::from_slice(&response.body)?;

		let next = match response.header("link") {
			Some(link) => next_link(link).map(PageToken::Url),
			None => self.next_page_number(&body),
		};
		let records = self.extract_records(body)?;

		debug!(%url, records = records.len(), has_next = next.is_some(), "Fetched page");
		Ok(PageResult {
			records,
			next,
			rate_limited: false,
		})
	}

	/// Resolve the page URL for `token` and fetch it with the target's headers.
	pub async fn fetch_page(
		&self,
		target: &SyncTarget,
		token: Option<&PageToken>,
	) -> Result<PageResult, FetchError> {
		let url = self.page_url(target, token)?;
		self.fetch(&url, &target.headers).await
	}

	fn rate_limit_exhausted(&self, response: &HttpResponse) -> bool {
		self.config.rate_limit_headers.iter().any(|name| {
			response
				.header(name)
				.and_then(|value| value.trim().parse::<u64>().ok())
				== Some(0)
		})
	}

	fn next_page_number(&self, body: &Value) -> Option<PageToken> {
		let scheme = self.config.page_numbers.as_ref()?;
		let page = body.get(&scheme.page_field)?.as_u64()?;
		let total_pages = body.get(&scheme.total_pages_field)?.as_u64()?;

		if page < total_pages {
			u32::try_from(page + 1).ok().map(PageToken::Page)
		} else {
			None
		}
	}

	fn extract_records(&self, body: Value) -> Result<Vec<RemoteRecord>, FetchError> {
		let items = match (body, self.config.records_field.as_deref()) {
			(Value::Array(items), _) => items,
			(Value::Object(mut wrapper), Some(field)) => match wrapper.remove(field) {
				Some(Value::Array(items)) => items,
				Some(other) => {
					return Err(FetchError::MalformedResponse(format!(
						"field '{}' holds {}, expected an array",
						field,
						json_kind(&other)
					)));
				}
				None => {
					return Err(FetchError::MalformedResponse(format!(
						"missing records field '{}'",
						field
					)));
				}
			},
			(other, _) => {
				return Err(FetchError::MalformedResponse(format!(
					"expected a JSON array, got {}",
					json_kind(&other)
				)));
			}
		};

		items.into_iter().map(RemoteRecord::try_from).collect()
	}
}

fn set_query_param(url: &mut Url, name: &str, value: &str) {
	let retained: Vec<(String, String)> = url
		.query_pairs()
		.filter(|(key, _)| key != name)
		.map(|(key, value)| (key.into_owned(), value.into_owned()))
		.collect();

	url.query_pairs_mut()
		.clear()
		.extend_pairs(retained)
		.append_pair(name, value);
}
