//! Pluggable HTTP transport.

// std
use std::fmt::Debug;
// crates.io
use async_trait::async_trait;
use http::{Method, StatusCode, header::AUTHORIZATION};
use reqwest::{Client, redirect::Policy};
// self
use crate::_prelude::*;

/// A logical HTTP request handed to the transport.
#[derive(Clone, Debug)]
pub struct HttpRequest {
	/// HTTP method to perform.
	pub method: Method,
	/// Absolute request URL.
	pub url: String,
	/// Value for the `Authorization` header, when a token covers the URL.
	pub authorization: Option<String>,
	/// JSON payload for POST/PUT requests.
	pub body: Option<Value>,
}

/// Status and decoded JSON body returned by the transport.
#[derive(Clone, Debug)]
pub struct HttpReply {
	/// HTTP status code of the response.
	pub status: StatusCode,
	/// Decoded JSON body; `None` for bodyless responses such as 204.
	pub body: Option<Value>,
}

/// Pluggable fetch function.
///
/// The transport owns connection handling and timeouts; the adapter layers
/// authentication and status classification on top. Implementations report
/// I/O-level failures as [`Error::Transport`] and hand every HTTP status back
/// in the reply, errors included.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
	/// Execute one request and decode its JSON body.
	async fn send(&self, request: HttpRequest) -> Result<HttpReply>;
}

/// Default transport backed by a shared [`reqwest::Client`].
#[derive(Debug)]
pub struct ReqwestTransport {
	client: Client,
}
impl ReqwestTransport {
	/// Build the default client.
	pub fn new() -> Result<Self> {
		let client = Client::builder()
			.redirect(Policy::limited(10))
			.user_agent(format!("rest-cache/{}", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(5))
			.build()
			.map_err(|err| Error::Transport(err.to_string()))?;

		Ok(Self { client })
	}

	/// Wrap an existing client (primarily for tests).
	pub fn with_client(client: Client) -> Self {
		Self { client }
	}
}
#[async_trait]
impl Transport for ReqwestTransport {
	async fn send(&self, request: HttpRequest) -> Result<HttpReply> {
		let mut builder = self.client.request(request.method, &request.url);

		if let Some(authorization) = &request.authorization {
			builder = builder.header(AUTHORIZATION, authorization);
		}
		if let Some(body) = &request.body {
			builder = builder.json(body);
		}

		let response = builder.send().await.map_err(|err| Error::Transport(err.to_string()))?;
		let status = response.status();
		let bytes = response.bytes().await.map_err(|err| Error::Transport(err.to_string()))?;
		let body = if bytes.is_empty() {
			None
		} else {
			match serde_json::from_slice(&bytes) {
				Ok(value) => Some(value),
				Err(err) if status.is_success() => return Err(Error::Transport(err.to_string())),
				// Error statuses may carry non-JSON bodies; the status is what matters.
				Err(_) => None,
			}
		};

		tracing::debug!(url = %request.url, status = %status, "request complete");

		Ok(HttpReply { status, body })
	}
}
