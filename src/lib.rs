//! Client-side async REST data cache with stale-while-revalidate refresh, write
//! propagation, and token-scoped authentication — built for modern Rust applications.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod event;
pub mod http;
pub mod mutation;

mod auth;
mod error;
mod fetch;
mod object;
mod source;
mod sync;
mod urls;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use serde_json::Value;

	pub use crate::{Error, Result};
}
pub use crate::{
	cache::query::{FetchOptions, Minimum, ObjectList},
	error::{Error, Result},
	event::{
		AuthenticationEvent, AuthorizationEvent, DeauthorizationEvent, EventHandler, EventOutcome,
	},
	http::transport::{HttpReply, HttpRequest, ReqwestTransport, Transport},
	mutation::{Hook, HookAction, HookContext, HookFn},
	source::{DataSource, DataSourceBuilder},
};

#[cfg(test)]
mod _test {
	use tracing_subscriber as _;
	use wiremock as _;
}
