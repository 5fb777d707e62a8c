//! Events delivered to the host application.

// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
// self
use crate::source::DataSource;

/// Notification that a request needs credentials before it can proceed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationEvent {
	/// Absolute URL of the resource that answered 401.
	pub url: String,
}

/// Notification that a token is about to enter the authorization table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizationEvent {
	/// Token extracted from the login response or supplied by the host.
	pub token: String,
	/// Canonical URL prefixes the token will cover.
	pub allow_urls: Vec<String>,
	/// Whether the token was freshly obtained rather than restored by the host.
	pub fresh: bool,
}

/// Notification that an authorization scope is being revoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeauthorizationEvent {
	/// Canonical URL prefixes removed from the authorization scope.
	pub deny_urls: Vec<String>,
}

/// Outcome returned by veto-able event handlers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EventOutcome {
	/// Let the coordinator perform its default action.
	#[default]
	Proceed,
	/// Veto the default action.
	Veto,
}

/// Host-side observer for cache and authentication events.
///
/// Handlers are async, so a host that needs time to decide simply awaits before
/// returning its outcome. Every registered handler runs for every event; a veto
/// from any one of them vetoes the default action.
#[async_trait]
pub trait EventHandler: Send + Sync {
	/// Cache content changed; cached readers should re-query.
	async fn change(&self, source: &DataSource) {
		let _ = source;
	}

	/// A request hit 401 and credentials are needed. The challenge record is
	/// registered before this fires, so the handler may call
	/// [`DataSource::authorize`] before returning. Vetoing declines the
	/// challenge and surfaces the original 401 to the requester.
	async fn authentication(
		&self,
		source: &DataSource,
		event: &AuthenticationEvent,
	) -> EventOutcome {
		let _ = (source, event);

		EventOutcome::Proceed
	}

	/// A token is about to be accepted. Vetoing rejects the token.
	async fn authorization(&self, source: &DataSource, event: &AuthorizationEvent) -> EventOutcome {
		let _ = (source, event);

		EventOutcome::Proceed
	}

	/// A token is about to be revoked. Vetoing keeps the affected queries
	/// cached (the logout request has already been sent).
	async fn deauthorization(
		&self,
		source: &DataSource,
		event: &DeauthorizationEvent,
	) -> EventOutcome {
		let _ = (source, event);

		EventOutcome::Proceed
	}
}
