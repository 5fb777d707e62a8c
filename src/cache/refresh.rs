//! Refresh protocols for the three query shapes.
//!
//! Refreshes run on background tasks; their failures never reject a public
//! promise. A query keeps `expired` set until a refresh succeeds.

// self
use crate::{
	_prelude::*,
	cache::query::{Query, QueryKind, QueryResult},
	fetch::CollectionPayload,
	mutation, object,
	source::DataSource,
	sync::Completion,
	urls,
};

impl DataSource {
	/// Flag the query as refreshing and spawn the matching protocol.
	///
	/// Must be called under the table lock that observed `expired` and
	/// `!refreshing`; list queries also gain their parking slot here so that
	/// concurrent `more()` calls never race the refresh.
	pub(crate) fn begin_refresh(&self, query: &mut Query) {
		query.refreshing = true;

		if query.kind == QueryKind::List {
			query.parked = Some(Completion::new());
		}

		let source = self.clone();
		let query_id = query.id;
		let kind = query.kind;

		tokio::spawn(async move {
			match kind {
				QueryKind::Object => source.refresh_object(query_id).await,
				QueryKind::Page(page) => source.refresh_page(query_id, page).await,
				QueryKind::List => source.refresh_list(query_id).await,
			}
		});
	}

	async fn refresh_object(&self, query_id: u64) {
		let Some(url) = ({
			let table = self.queries().lock().await;

			table.get_by_id(query_id).map(|query| query.url.clone())
		}) else {
			return;
		};
		let outcome = self.get(&url).await;
		let changed = {
			let mut table = self.queries().lock().await;
			let fresh = {
				let Some(query) = table.get_mut_by_id(query_id) else { return };

				query.refreshing = false;

				match outcome {
					Ok(value) => {
						query.expired = false;
						query.time = Utc::now();

						let fresh = Arc::new(value);
						let identical = query.object().is_some_and(|object| **object == *fresh);

						if identical {
							None
						} else {
							query.result = QueryResult::Object(fresh.clone());

							Some(fresh)
						}
					},
					Err(err) => {
						tracing::debug!(url, error = %err, "object refresh failed");

						None
					},
				}
			};

			match fresh {
				Some(fresh) => {
					mutation::process_fresh_object(&mut table, &fresh, &url, Some(query_id));

					true
				},
				None => false,
			}
		};

		self.notify_changes(changed).await;
	}

	async fn refresh_page(&self, query_id: u64, page: u32) {
		let Some(url) = ({
			let table = self.queries().lock().await;

			table.get_by_id(query_id).map(|query| query.url.clone())
		}) else {
			return;
		};
		let outcome = self.get(&urls::attach_page_number(&url, page)).await;
		let (changed, evicted) = {
			let mut table = self.queries().lock().await;
			let Some(query) = table.get_mut_by_id(query_id) else { return };

			query.refreshing = false;

			let mut changed = false;
			let mut succeeded = false;

			match outcome.and_then(CollectionPayload::parse) {
				Ok(payload) => {
					query.expired = false;
					query.time = Utc::now();
					succeeded = true;

					let (incoming, total) = match payload {
						CollectionPayload::Complete(incoming) => {
							let count = incoming.len();

							(incoming, count)
						},
						CollectionPayload::Page { results, count, .. } => {
							let fallback = results.len();

							(results, count.unwrap_or(fallback))
						},
					};

					if let Some(list) = query.list_mut() {
						let fresh = object::append_objects(&[], incoming);

						if let Some(merged) = object::replace_identical_objects(fresh, &list.objects)
						{
							list.objects = merged;
							changed = true;
						}

						changed |= list.total != total;
						list.total = total;
					}
				},
				Err(err) => {
					tracing::debug!(url, page, error = %err, "page refresh failed");
				},
			}

			// A refreshed page evicts its expired, idle siblings; each comes
			// back through a delayed re-fetch so pagination stays warm without
			// a thundering herd.
			let evicted: Vec<(u32, crate::FetchOptions)> = if succeeded {
				let siblings: Vec<(u64, u32, crate::FetchOptions)> = table
					.iter()
					.filter(|sibling| {
						matches!(sibling.kind, QueryKind::Page(other) if other != page)
							&& sibling.url == url
							&& sibling.expired && !sibling.refreshing
					})
					.map(|sibling| {
						let QueryKind::Page(number) = sibling.kind else { unreachable!() };

						(sibling.id, number, sibling.options.clone())
					})
					.collect();

				siblings
					.into_iter()
					.map(|(id, number, options)| {
						table.remove_by_id(id);

						(number, options)
					})
					.collect()
			} else {
				Vec::new()
			};

			(changed, evicted)
		};

		for (number, options) in evicted {
			let source = self.clone();
			let url = url.clone();

			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_secs(1)).await;

				if let Err(err) = source.fetch_page(&url, number, options).await {
					tracing::debug!(url, page = number, error = %err, "page re-fetch failed");
				}
			});
		}

		self.notify_changes(changed).await;
	}

	async fn refresh_list(&self, query_id: u64) {
		// Let any in-flight page append settle before re-walking.
		loop {
			let flight = {
				let table = self.queries().lock().await;
				let Some(query) = table.get_by_id(query_id) else { return };

				query.next_flight.clone()
			};

			match flight {
				Some(flight) => {
					let _ = flight.wait().await;
				},
				None => break,
			}
		}

		let Some((url, paginated, known_pages, old_objects)) = ({
			let table = self.queries().lock().await;

			table.get_by_id(query_id).map(|query| {
				(
					query.url.clone(),
					query.list().map(|list| list.paginated).unwrap_or_default(),
					query.next_page.max(1),
					query.list().map(|list| list.objects.clone()).unwrap_or_default(),
				)
			})
		}) else {
			return;
		};
		let walk = if paginated {
			self.rewalk_pages(&url, known_pages).await
		} else {
			self.refetch_whole(&url).await
		};
		let (changed, parked) = {
			let mut table = self.queries().lock().await;
			let Some(query) = table.get_mut_by_id(query_id) else { return };

			query.refreshing = false;

			let parked = query.parked.take();
			let mut changed = false;

			match walk {
				Ok(walk) => {
					query.expired = false;
					query.time = Utc::now();
					query.next_url = walk.next_url.clone();
					query.next_page = walk.pages;

					if let Some(list) = query.list_mut() {
						let joined = object::join_object_lists(walk.objects, &old_objects);

						if let Some(merged) =
							object::replace_identical_objects(joined, &list.objects)
						{
							list.objects = merged;
							changed = true;
						}

						changed |= list.total != walk.total;
						list.total = walk.total;
						list.complete = walk.next_url.is_none();
						list.paginated = walk.paginated;
					}
				},
				Err(err) => {
					tracing::debug!(url, error = %err, "list refresh failed");
				},
			}

			(changed, parked)
		};

		// Parked `more()` callers resume against the refreshed list.
		if let Some(parked) = parked {
			parked.complete(());
		}

		self.notify_changes(changed).await;
	}

	/// Re-walk a paginated list from the beginning, following `next` until the
	/// server stops producing one or the previously-known depth is reached.
	async fn rewalk_pages(&self, url: &str, known_pages: u32) -> Result<ListWalk> {
		let mut objects = Vec::new();
		let mut fetch_url = url.to_string();
		let mut pages = 0u32;

		loop {
			let payload = CollectionPayload::parse(self.get(&fetch_url).await?)?;

			match payload {
				CollectionPayload::Complete(incoming) => {
					let objects = object::append_objects(&[], incoming);
					let total = objects.len();

					return Ok(ListWalk {
						objects,
						total,
						next_url: None,
						pages: pages.max(1),
						paginated: false,
					});
				},
				CollectionPayload::Page { results, count, next } => {
					objects = object::append_objects(&objects, results);
					pages += 1;

					let total = count.unwrap_or(objects.len());
					let next_url = next.map(|next| self.transform_url(&next));

					match next_url {
						Some(next_url) if pages < known_pages => fetch_url = next_url,
						next_url =>
							return Ok(ListWalk { objects, total, next_url, pages, paginated: true }),
					}
				},
			}
		}
	}

	async fn refetch_whole(&self, url: &str) -> Result<ListWalk> {
		let payload = CollectionPayload::parse(self.get(url).await?)?;

		match payload {
			CollectionPayload::Complete(incoming) => {
				let objects = object::append_objects(&[], incoming);
				let total = objects.len();

				Ok(ListWalk { objects, total, next_url: None, pages: 1, paginated: false })
			},
			CollectionPayload::Page { results, count, next } => {
				let objects = object::append_objects(&[], results);
				let total = count.unwrap_or(objects.len());
				let next_url = next.map(|next| self.transform_url(&next));

				Ok(ListWalk { objects, total, next_url, pages: 1, paginated: true })
			},
		}
	}
}

struct ListWalk {
	objects: Vec<Arc<Value>>,
	total: usize,
	next_url: Option<String>,
	pages: u32,
	paginated: bool,
}
