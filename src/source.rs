//! The data source: configuration, lifecycle, and change notification.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	sync::Weak,
};
// crates.io
use tokio::{
	sync::{Mutex, RwLock, watch},
	task::JoinHandle,
	time,
};
use url::Url;
// self
use crate::{
	_prelude::*,
	auth::AuthState,
	cache::table::QueryTable,
	event::{
		AuthenticationEvent, AuthorizationEvent, DeauthorizationEvent, EventHandler, EventOutcome,
	},
	http::transport::{ReqwestTransport, Transport},
	urls,
};

/// Default expiration interval applied to cached queries.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Default HTTP authorization scheme keyword.
pub const DEFAULT_AUTHORIZATION_KEYWORD: &str = "Token";

/// Client-side REST data cache and synchronization engine.
///
/// Serves reads from an in-memory query table, refreshes stale entries in the
/// background, propagates local writes across every cached query, and
/// coordinates 401 challenges with the host application. Cheap to clone;
/// clones share one cache. Two sources share nothing.
#[derive(Clone)]
pub struct DataSource {
	inner: Arc<Inner>,
}

pub(crate) struct Inner {
	base_url: Option<String>,
	refresh_interval: Duration,
	authorization_keyword: String,
	abbreviated_folder_contents: bool,
	force_https: bool,
	wait_for_authentication: bool,
	transport: Arc<dyn Transport>,
	queries: Mutex<QueryTable>,
	auth: Mutex<AuthState>,
	handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
	active: watch::Sender<bool>,
	checker: Mutex<Option<JoinHandle<()>>>,
}
impl Drop for Inner {
	fn drop(&mut self) {
		if let Some(checker) = self.checker.get_mut().take() {
			checker.abort();
		}
	}
}

/// Builder for [`DataSource`].
pub struct DataSourceBuilder {
	base_url: Option<String>,
	refresh_interval: Duration,
	authorization_keyword: String,
	abbreviated_folder_contents: bool,
	force_https: bool,
	wait_for_authentication: bool,
	transport: Option<Arc<dyn Transport>>,
}
impl DataSourceBuilder {
	/// Create a builder with default configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Prefix resolved against relative URLs. Must be absolute.
	pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = Some(base_url.into());

		self
	}

	/// Expiration interval for cached queries; zero disables expiration.
	pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
		self.refresh_interval = refresh_interval;

		self
	}

	/// HTTP scheme keyword placed ahead of the token (defaults to `Token`).
	pub fn authorization_keyword(mut self, keyword: impl Into<String>) -> Self {
		self.authorization_keyword = keyword.into();

		self
	}

	/// Treat every list and page as abbreviated: their results never derive
	/// object queries.
	pub fn abbreviated_folder_contents(mut self, abbreviated: bool) -> Self {
		self.abbreviated_folder_contents = abbreviated;

		self
	}

	/// Rewrite outgoing `http:` URLs to `https:` when the base is HTTPS.
	pub fn force_https(mut self, force_https: bool) -> Self {
		self.force_https = force_https;

		self
	}

	/// Whether 401 responses pause the request and challenge the host for
	/// credentials (enabled by default).
	pub fn wait_for_authentication(mut self, wait: bool) -> Self {
		self.wait_for_authentication = wait;

		self
	}

	/// Replace the HTTP transport (primarily for tests and embedding).
	pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Finalise the configuration and construct a [`DataSource`].
	pub fn build(self) -> Result<DataSource> {
		let base_url = match self.base_url {
			Some(raw) => {
				let parsed = Url::parse(&raw)?;

				Some(urls::add_trailing_slash(parsed.as_str()))
			},
			None => None,
		};
		let force_https = self.force_https
			&& base_url.as_deref().is_some_and(|base| base.starts_with("https:"));
		let transport = match self.transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new()?),
		};
		let (active, _) = watch::channel(false);

		Ok(DataSource {
			inner: Arc::new(Inner {
				base_url,
				refresh_interval: self.refresh_interval,
				authorization_keyword: self.authorization_keyword,
				abbreviated_folder_contents: self.abbreviated_folder_contents,
				force_https,
				wait_for_authentication: self.wait_for_authentication,
				transport,
				queries: Mutex::new(QueryTable::new()),
				auth: Mutex::new(AuthState::default()),
				handlers: RwLock::new(Vec::new()),
				active,
				checker: Mutex::new(None),
			}),
		})
	}
}
impl Default for DataSourceBuilder {
	fn default() -> Self {
		Self {
			base_url: None,
			refresh_interval: DEFAULT_REFRESH_INTERVAL,
			authorization_keyword: DEFAULT_AUTHORIZATION_KEYWORD.to_string(),
			abbreviated_folder_contents: false,
			force_https: false,
			wait_for_authentication: true,
			transport: None,
		}
	}
}

impl DataSource {
	/// Create a [`DataSourceBuilder`].
	pub fn builder() -> DataSourceBuilder {
		DataSourceBuilder::new()
	}

	pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
		Self { inner }
	}

	pub(crate) fn downgrade(&self) -> Weak<Inner> {
		Arc::downgrade(&self.inner)
	}

	pub(crate) fn queries(&self) -> &Mutex<QueryTable> {
		&self.inner.queries
	}

	pub(crate) fn auth(&self) -> &Mutex<AuthState> {
		&self.inner.auth
	}

	pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
		&self.inner.transport
	}

	pub(crate) fn authorization_keyword(&self) -> &str {
		&self.inner.authorization_keyword
	}

	pub(crate) fn wait_for_authentication(&self) -> bool {
		self.inner.wait_for_authentication
	}

	pub(crate) fn abbreviated_folder_contents(&self) -> bool {
		self.inner.abbreviated_folder_contents
	}

	/// Resolve a possibly-relative URL against the configured base and
	/// canonicalize it: trailing slash ahead of any search string, HTTPS
	/// rewrite when configured.
	pub(crate) fn absolute_url(&self, url: &str) -> Result<String> {
		let absolute = if let Ok(parsed) = Url::parse(url) {
			parsed.to_string()
		} else if let Some(base) = &self.inner.base_url {
			Url::parse(base)?.join(url)?.to_string()
		} else {
			return Err(Error::Validation {
				field: "url",
				reason: format!("Relative URL '{url}' requires a configured base URL."),
			});
		};

		Ok(self.transform_url(&urls::add_trailing_slash(&absolute)))
	}

	pub(crate) fn absolute_urls(&self, raw: &[&str], fallback: &[&str]) -> Result<Vec<String>> {
		let raw = if raw.is_empty() { fallback } else { raw };

		raw.iter().map(|url| self.absolute_url(url)).collect()
	}

	pub(crate) fn transform_url(&self, url: &str) -> String {
		if self.inner.force_https { urls::rewrite_https(url) } else { url.to_string() }
	}

	/// Whether the source is currently active.
	pub fn is_active(&self) -> bool {
		*self.inner.active.borrow()
	}

	/// Open the activation gate, sweep expired entries immediately, and start
	/// the periodic expiration checker.
	pub async fn activate(&self) {
		let activated = self.inner.active.send_if_modified(|active| {
			if *active {
				false
			} else {
				*active = true;

				true
			}
		});

		if !activated {
			return;
		}

		self.check_expiration().await;
		self.start_expiration_checker().await;
	}

	/// Close the activation gate and stop the expiration checker; in-flight
	/// transport retries stall until reactivation.
	pub async fn deactivate(&self) {
		let deactivated = self.inner.active.send_if_modified(|active| {
			if *active {
				*active = false;

				true
			} else {
				false
			}
		});

		if !deactivated {
			return;
		}

		if let Some(checker) = self.inner.checker.lock().await.take() {
			checker.abort();
		}
	}

	/// Block until the source is active.
	pub(crate) async fn wait_for_activation(&self) {
		if *self.inner.active.borrow() {
			return;
		}

		let mut rx = self.inner.active.subscribe();

		loop {
			if *rx.borrow_and_update() {
				return;
			}

			// The sender half lives in `Inner`, which every waiter keeps alive.
			let _ = rx.changed().await;
		}
	}

	async fn start_expiration_checker(&self) {
		let Some(period) = self.check_period() else { return };
		let inner = self.downgrade();
		let handle = tokio::spawn(async move {
			let mut interval = time::interval(period);

			// The first tick is immediate; activation already swept once.
			interval.tick().await;

			loop {
				interval.tick().await;

				let Some(inner) = inner.upgrade() else { return };
				let source = DataSource::from_inner(inner);

				if !source.is_active() {
					return;
				}

				source.check_expiration().await;
			}
		});

		if let Some(previous) = self.inner.checker.lock().await.replace(handle) {
			previous.abort();
		}
	}

	fn check_period(&self) -> Option<Duration> {
		if self.inner.refresh_interval.is_zero() {
			return None;
		}

		Some((self.inner.refresh_interval / 10).min(Duration::from_millis(100)))
	}

	/// Expire every query older than the refresh interval.
	pub(crate) async fn check_expiration(&self) {
		if self.inner.refresh_interval.is_zero() {
			return;
		}

		let Ok(age) = chrono::Duration::from_std(self.inner.refresh_interval) else { return };

		self.invalidate(Some(Utc::now() - age)).await;
	}

	/// Mark every query whose fetch time is at or before `cutoff` (every
	/// query, absent a cutoff) as expired, firing `change` when anything newly
	/// expired. The next read of an expired query resolves with the stale
	/// value and refreshes in the background.
	pub async fn invalidate(&self, cutoff: Option<DateTime<Utc>>) -> bool {
		let changed = { self.queries().lock().await.invalidate(cutoff) };

		self.notify_changes(changed).await
	}

	/// Whether an object for the given URL is available from the cache, either
	/// directly or by derivation from a cached list or page. With
	/// `check_expiration`, expired entries answer false.
	pub async fn is_cached(&self, url: &str, check_expiration: bool) -> Result<bool> {
		let abs_url = self.absolute_url(url)?;
		let table = self.queries().lock().await;

		Ok(table.object_available(&abs_url, check_expiration, self.abbreviated_folder_contents()))
	}

	pub(crate) async fn evict_queries(&self, prefixes: &[String]) {
		let evicted = { self.queries().lock().await.evict_matching(prefixes) };

		if evicted > 0 {
			tracing::debug!(evicted, "queries evicted from revoked scope");
		}
	}

	/// Register a host-side event handler.
	pub async fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
		self.inner.handlers.write().await.push(handler);
	}

	async fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
		self.inner.handlers.read().await.clone()
	}

	/// Fire `change` to every handler when something changed; at most one
	/// notification per logical operation.
	pub(crate) async fn notify_changes(&self, changed: bool) -> bool {
		if changed {
			for handler in self.handlers().await {
				handler.change(self).await;
			}
		}

		changed
	}

	pub(crate) async fn dispatch_authentication(&self, event: &AuthenticationEvent) -> EventOutcome {
		let mut outcome = EventOutcome::Proceed;

		for handler in self.handlers().await {
			if handler.authentication(self, event).await == EventOutcome::Veto {
				outcome = EventOutcome::Veto;
			}
		}

		outcome
	}

	pub(crate) async fn dispatch_authorization(&self, event: &AuthorizationEvent) -> EventOutcome {
		let mut outcome = EventOutcome::Proceed;

		for handler in self.handlers().await {
			if handler.authorization(self, event).await == EventOutcome::Veto {
				outcome = EventOutcome::Veto;
			}
		}

		outcome
	}

	pub(crate) async fn dispatch_deauthorization(
		&self,
		event: &DeauthorizationEvent,
	) -> EventOutcome {
		let mut outcome = EventOutcome::Proceed;

		for handler in self.handlers().await {
			if handler.deauthorization(self, event).await == EventOutcome::Veto {
				outcome = EventOutcome::Veto;
			}
		}

		outcome
	}
}
impl Debug for DataSource {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("DataSource")
			.field("base_url", &self.inner.base_url)
			.field("active", &self.is_active())
			.finish_non_exhaustive()
	}
}
