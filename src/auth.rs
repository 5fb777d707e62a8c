//! Authentication coordinator: challenge multiplexing and token scoping.
//!
//! Tokens are scoped by allow/deny URL-prefix sets; challenges are keyed by URL
//! so that concurrent 401s on one resource share a single `authentication`
//! event and a single resolution.

// crates.io
use http::{Method, StatusCode};
// self
use crate::{
	_prelude::*,
	event::{AuthenticationEvent, AuthorizationEvent, DeauthorizationEvent, EventOutcome},
	source::DataSource,
	sync::Completion,
	urls,
};

/// Scoped token accepted through [`DataSource::authorize`].
#[derive(Clone, Debug)]
pub(crate) struct Authorization {
	pub(crate) token: String,
	pub(crate) allow: Vec<String>,
	pub(crate) deny: Vec<String>,
	pub(crate) invalid: bool,
}
impl Authorization {
	fn covers(&self, url: &str) -> bool {
		!self.invalid
			&& urls::match_any_url(url, &self.allow)
			&& !urls::match_any_url(url, &self.deny)
	}
}

/// Pending challenge for one URL; concurrent requesters share the completion.
#[derive(Clone, Debug)]
pub(crate) struct Challenge {
	pub(crate) url: String,
	pub(crate) completion: Completion<Option<String>>,
}

/// Challenge and token tables owned by one source.
#[derive(Debug, Default)]
pub(crate) struct AuthState {
	pub(crate) challenges: Vec<Challenge>,
	pub(crate) authorizations: Vec<Authorization>,
}
impl AuthState {
	pub(crate) fn token_for(&self, url: &str) -> Option<&Authorization> {
		self.authorizations.iter().find(|authorization| authorization.covers(url))
	}

	pub(crate) fn mark_invalid(&mut self, token: &str) {
		for authorization in &mut self.authorizations {
			if authorization.token == token {
				authorization.invalid = true;
			}
		}
	}

	/// Remove the given prefixes from every allow set, record them as denied,
	/// and drop records whose allow set becomes empty.
	fn deny_scope(&mut self, deny_urls: &[String]) {
		self.authorizations.retain_mut(|authorization| {
			authorization.allow.retain(|allowed| !deny_urls.contains(allowed));

			for denied in deny_urls {
				if !authorization.deny.contains(denied) {
					authorization.deny.push(denied.clone());
				}
			}

			!authorization.allow.is_empty()
		});
	}
}

impl DataSource {
	/// Whether a non-invalid token covers the given URL.
	pub async fn is_authorized(&self, url: &str) -> Result<bool> {
		let abs_url = self.absolute_url(url)?;
		let auth = self.auth().lock().await;

		Ok(auth.token_for(&abs_url).is_some())
	}

	pub(crate) async fn token_for(&self, url: &str) -> Option<String> {
		let auth = self.auth().lock().await;

		auth.token_for(url).map(|authorization| authorization.token.clone())
	}

	pub(crate) async fn mark_token_invalid(&self, token: &str) {
		let mut auth = self.auth().lock().await;

		auth.mark_invalid(token);
	}

	/// Register (or join) a challenge for `url`, fire the `authentication`
	/// event, and wait for a token to arrive.
	///
	/// Resolves with `None` when the challenge is declined or cancelled. The
	/// challenge record is inserted before the event fires, so a handler may
	/// call [`DataSource::authorize`] synchronously and have it resolve this
	/// very challenge.
	pub async fn request_authentication(&self, url: &str) -> Result<Option<String>> {
		let abs_url = self.absolute_url(url)?;

		// A token that arrived between the 401 and this call settles the
		// challenge without another event.
		if let Some(token) = self.token_for(&abs_url).await {
			return Ok(Some(token));
		}

		let (completion, created) = {
			let mut auth = self.auth().lock().await;

			match auth.challenges.iter().find(|challenge| challenge.url == abs_url) {
				Some(challenge) => (challenge.completion.clone(), false),
				None => {
					let completion = Completion::new();

					auth.challenges
						.push(Challenge { url: abs_url.clone(), completion: completion.clone() });

					(completion, true)
				},
			}
		};

		if created {
			let event = AuthenticationEvent { url: abs_url.clone() };

			if self.dispatch_authentication(&event).await == EventOutcome::Veto {
				{
					let mut auth = self.auth().lock().await;

					auth.challenges.retain(|challenge| challenge.url != abs_url);
				}

				completion.complete(None);
			}
		}

		Ok(completion.wait().await)
	}

	/// POST credentials to the login endpoint and authorize the returned key.
	///
	/// An empty `allow_urls` scopes the token to the root. Fails with a 403
	/// when the login response carries no `key`.
	pub async fn authenticate(
		&self,
		login_url: &str,
		credentials: Value,
		allow_urls: &[&str],
	) -> Result<bool> {
		let login_abs_url = self.absolute_url(login_url)?;
		let response = self.request(Method::POST, &login_abs_url, Some(credentials), false).await?;
		let token = response
			.as_ref()
			.and_then(|body| body.get("key"))
			.and_then(Value::as_str)
			.map(str::to_string);
		let Some(token) = token else {
			return Err(Error::Http {
				status: StatusCode::FORBIDDEN,
				status_text: "No authorization token".to_string(),
			});
		};

		self.authorize(&token, allow_urls, true).await
	}

	/// Accept a token scoped to the given URL prefixes.
	///
	/// Returns false when the token is already known or the `authorization`
	/// event vetoes it. Pending challenges covered by the new scope are
	/// resolved before this returns, so a caller awaiting `authorize` observes
	/// a consistent authentication state.
	pub async fn authorize(&self, token: &str, allow_urls: &[&str], fresh: bool) -> Result<bool> {
		let allow_abs_urls = self.absolute_urls(allow_urls, &["/"])?;

		{
			let auth = self.auth().lock().await;

			if auth
				.authorizations
				.iter()
				.any(|authorization| !authorization.invalid && authorization.token == token)
			{
				return Ok(false);
			}
		}

		let event = AuthorizationEvent {
			token: token.to_string(),
			allow_urls: allow_abs_urls.clone(),
			fresh,
		};

		if self.dispatch_authorization(&event).await == EventOutcome::Veto {
			return Ok(false);
		}

		let resolved = {
			let mut auth = self.auth().lock().await;

			// Prior grants lose the prefixes taken over by the new token.
			auth.authorizations.retain_mut(|authorization| {
				authorization.allow.retain(|allowed| !allow_abs_urls.contains(allowed));

				!authorization.allow.is_empty()
			});
			auth.authorizations.push(Authorization {
				token: token.to_string(),
				allow: allow_abs_urls.clone(),
				deny: Vec::new(),
				invalid: false,
			});

			let mut resolved = Vec::new();

			auth.challenges.retain(|challenge| {
				if urls::match_any_url(&challenge.url, &allow_abs_urls) {
					resolved.push(challenge.completion.clone());

					false
				} else {
					true
				}
			});

			resolved
		};

		for completion in resolved {
			completion.complete(Some(token.to_string()));
		}

		self.notify_changes(true).await;

		Ok(true)
	}

	/// Decline pending challenges for the given URLs, resolving their waiters
	/// with no token.
	pub async fn cancel_authentication(&self, challenge_urls: &[&str]) -> Result<()> {
		let abs_urls = self.absolute_urls(challenge_urls, &[])?;
		let cancelled = {
			let mut auth = self.auth().lock().await;
			let mut cancelled = Vec::new();

			auth.challenges.retain(|challenge| {
				if abs_urls.contains(&challenge.url) {
					cancelled.push(challenge.completion.clone());

					false
				} else {
					true
				}
			});

			cancelled
		};

		for completion in cancelled {
			completion.complete(None);
		}

		Ok(())
	}

	/// Narrow token scopes: remove the given prefixes from every allow set and
	/// record them as denied.
	pub async fn cancel_authorization(&self, deny_urls: &[&str]) -> Result<()> {
		let deny_abs_urls = self.absolute_urls(deny_urls, &[])?;
		let mut auth = self.auth().lock().await;

		auth.deny_scope(&deny_abs_urls);

		Ok(())
	}

	/// POST the logout endpoint, fire `deauthorization`, and unless vetoed drop
	/// the revoked scope together with every query cached under it.
	pub async fn revoke_authorization(&self, logout_url: &str, deny_urls: &[&str]) -> Result<()> {
		let logout_abs_url = self.absolute_url(logout_url)?;
		let deny_abs_urls = self.absolute_urls(deny_urls, &["/"])?;

		self.request(
			Method::POST,
			&logout_abs_url,
			Some(Value::Object(Default::default())),
			false,
		)
		.await?;

		let event = DeauthorizationEvent { deny_urls: deny_abs_urls.clone() };

		if self.dispatch_deauthorization(&event).await == EventOutcome::Veto {
			return Ok(());
		}

		{
			let mut auth = self.auth().lock().await;

			auth.deny_scope(&deny_abs_urls);
		}

		self.evict_queries(&deny_abs_urls).await;
		self.notify_changes(true).await;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn grant(token: &str, allow: &[&str], deny: &[&str]) -> Authorization {
		Authorization {
			token: token.to_string(),
			allow: allow.iter().map(|url| url.to_string()).collect(),
			deny: deny.iter().map(|url| url.to_string()).collect(),
			invalid: false,
		}
	}

	#[test]
	fn token_lookup_respects_allow_deny_and_invalid() {
		let mut state = AuthState::default();

		state.authorizations.push(grant("abc", &["https://api.test/"], &["https://api.test/admin/"]));

		assert_eq!(state.token_for("https://api.test/items/").map(|a| a.token.as_str()), Some("abc"));
		assert!(state.token_for("https://api.test/admin/users/").is_none());
		assert!(state.token_for("https://other.test/").is_none());

		state.mark_invalid("abc");

		assert!(state.token_for("https://api.test/items/").is_none());
	}

	#[test]
	fn deny_scope_narrows_and_drops_empty_grants() {
		let mut state = AuthState::default();

		state.authorizations.push(grant("abc", &["https://api.test/a/", "https://api.test/b/"], &[]));
		state.deny_scope(&["https://api.test/a/".to_string()]);

		assert_eq!(state.authorizations.len(), 1);
		assert_eq!(state.authorizations[0].allow, vec!["https://api.test/b/".to_string()]);
		assert_eq!(state.authorizations[0].deny, vec!["https://api.test/a/".to_string()]);

		state.deny_scope(&["https://api.test/b/".to_string()]);

		assert!(state.authorizations.is_empty());
	}
}
