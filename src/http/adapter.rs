//! HTTP verbs layered over the pluggable transport: authorization headers,
//! status classification, and the 401 challenge dance.

// crates.io
use http::{Method, StatusCode};
// self
use crate::{_prelude::*, http::transport::HttpRequest, source::DataSource};

impl DataSource {
	/// GET a resource, expecting a JSON document.
	pub(crate) async fn get(&self, url: &str) -> Result<Value> {
		let body = self.request(Method::GET, url, None, self.wait_for_authentication()).await?;

		body.ok_or_else(|| Error::Transport(format!("Empty response body from {url}")))
	}

	pub(crate) async fn post(&self, url: &str, payload: Value) -> Result<Option<Value>> {
		self.request(Method::POST, url, Some(payload), self.wait_for_authentication()).await
	}

	pub(crate) async fn put(&self, url: &str, payload: Value) -> Result<Option<Value>> {
		self.request(Method::PUT, url, Some(payload), self.wait_for_authentication()).await
	}

	pub(crate) async fn delete(&self, url: &str) -> Result<Option<Value>> {
		self.request(Method::DELETE, url, None, self.wait_for_authentication()).await
	}

	/// Send one logical request.
	///
	/// Waits on the activation gate first; a transport failure observed while
	/// the source is inactive is replayed once activation resumes. A 401 under
	/// `wait_for_authentication` registers a challenge and, when a token
	/// arrives, retries exactly once with it.
	pub(crate) async fn request(
		&self,
		method: Method,
		url: &str,
		body: Option<Value>,
		wait_for_authentication: bool,
	) -> Result<Option<Value>> {
		let mut challenged = false;

		loop {
			self.wait_for_activation().await;

			let token = self.token_for(url).await;
			let authorization =
				token.as_ref().map(|token| format!("{} {token}", self.authorization_keyword()));
			let request = HttpRequest {
				method: method.clone(),
				url: url.to_string(),
				authorization,
				body: body.clone(),
			};
			let reply = match self.transport().send(request).await {
				Ok(reply) => reply,
				Err(Error::Transport(reason)) if !self.is_active() => {
					tracing::debug!(url, %reason, "transport failed while inactive; replaying on activation");

					continue;
				},
				Err(err) => return Err(err),
			};

			if reply.status.as_u16() < 400 {
				return Ok(reply.body);
			}

			if (reply.status == StatusCode::UNAUTHORIZED || reply.status == StatusCode::FORBIDDEN)
				&& let Some(token) = &token
			{
				self.mark_token_invalid(token).await;
			}
			if reply.status == StatusCode::UNAUTHORIZED && wait_for_authentication && !challenged {
				challenged = true;

				if self.request_authentication(url).await?.is_some() {
					continue;
				}
			}

			return Err(Error::http(reply.status));
		}
	}
}
