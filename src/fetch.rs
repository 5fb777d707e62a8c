//! Fetch pipeline: single objects, pages, growing lists, and batches.

// crates.io
use futures::future::join_all;
// self
use crate::{
	_prelude::*,
	cache::query::{
		FetchOptions, ListSnapshot, ListState, Minimum, ObjectList, Query, QueryKind, QueryResult,
	},
	mutation::{self, validate_hooks},
	object,
	source::DataSource,
	sync::Completion,
	urls,
};

/// Shape of a collection response.
///
/// Servers answer either with a bare array (the full list) or with a
/// `{count, results, next}` page envelope.
pub(crate) enum CollectionPayload {
	Complete(Vec<Value>),
	Page { results: Vec<Value>, count: Option<usize>, next: Option<String> },
}
impl CollectionPayload {
	pub(crate) fn parse(value: Value) -> Result<Self> {
		match value {
			Value::Array(objects) => Ok(Self::Complete(objects)),
			Value::Object(mut map) => {
				let results = match map.remove("results") {
					Some(Value::Array(results)) => results,
					_ =>
						return Err(Error::Validation {
							field: "results",
							reason: "Collection response carries no results array.".into(),
						}),
				};
				let count = map.get("count").and_then(Value::as_u64).map(|count| count as usize);
				let next = match map.remove("next") {
					Some(Value::String(next)) => Some(next),
					_ => None,
				};

				Ok(Self::Page { results, count, next })
			},
			_ => Err(Error::Validation {
				field: "response",
				reason: "Collection response must be an array or an object.".into(),
			}),
		}
	}
}

/// Resolve a minimum option against the collection total.
///
/// A negative-style minimum counts back from the total with a floor of one; a
/// percentage rounds up. Absent a minimum, the fallback applies.
pub(crate) fn get_minimum(minimum: Option<&Minimum>, total: usize, fallback: usize) -> usize {
	match minimum {
		None => fallback,
		Some(Minimum::Count(count)) => *count,
		Some(Minimum::Percent(percent)) => (total * *percent as usize).div_ceil(100),
		Some(Minimum::FromEnd(count)) => total.saturating_sub(*count).max(1),
	}
}

enum ObjectPlan {
	Cached(Arc<Value>),
	Wait(Completion<Result<Arc<Value>>>),
	Fetch(Completion<Result<Arc<Value>>>, u64),
}

enum ListPlan {
	Cached(u64, ListSnapshot),
	Wait(u64, Completion<Result<ListSnapshot>>),
	Fetch(Completion<Result<ListSnapshot>>, u64),
}

enum MorePlan {
	Current(ListSnapshot),
	Park(Completion<()>),
	Join(Completion<Result<ListSnapshot>>),
	Fetch(Completion<Result<ListSnapshot>>),
}

impl DataSource {
	/// Fetch a single object.
	///
	/// Serves from the cache when possible, deriving an object query from a
	/// cached list or page before going to the network. An expired hit resolves
	/// immediately with the stale value while a background refresh runs.
	pub async fn fetch_one(&self, url: &str, options: FetchOptions) -> Result<Arc<Value>> {
		validate_hooks(&options, QueryKind::Object)?;

		let abs_url = self.absolute_url(url)?;
		let plan = {
			let mut table = self.queries().lock().await;

			if let Some(index) = table.position(QueryKind::Object, &abs_url, &options) {
				let query = table.index_mut(index);
				let plan = match &query.result {
					QueryResult::PendingObject(completion) => ObjectPlan::Wait(completion.clone()),
					QueryResult::Object(object) => ObjectPlan::Cached(object.clone()),
					QueryResult::PendingList(_) | QueryResult::List(_) =>
						unreachable!("object queries hold object results"),
				};

				if matches!(plan, ObjectPlan::Cached(_)) && query.expired && !query.refreshing {
					self.begin_refresh(query);
				}

				plan
			} else if !self.abbreviated_folder_contents()
				&& let Some(object) = table.derive_query(&abs_url)
			{
				ObjectPlan::Cached(object)
			} else {
				let completion = Completion::new();
				let id = table.next_id();

				table.insert_front(Query::pending_object(
					id,
					abs_url.clone(),
					options,
					completion.clone(),
				));

				ObjectPlan::Fetch(completion, id)
			}
		};

		match plan {
			ObjectPlan::Cached(object) => Ok(object),
			ObjectPlan::Wait(completion) => completion.wait().await,
			ObjectPlan::Fetch(completion, query_id) => match self.get(&abs_url).await {
				Ok(value) => {
					let object = Arc::new(value);

					{
						let mut table = self.queries().lock().await;

						if let Some(query) = table.get_mut_by_id(query_id) {
							query.result = QueryResult::Object(object.clone());
							query.time = Utc::now();
						}

						// Sibling list and page queries under the same folder
						// absorb the fresh object silently.
						mutation::process_fresh_object(&mut table, &object, &abs_url, Some(query_id));
					}

					completion.complete(Ok(object.clone()));

					Ok(object)
				},
				Err(err) => {
					completion.complete(Err(err.clone()));

					{
						let mut table = self.queries().lock().await;

						table.remove_by_id(query_id);
					}

					Err(err)
				},
			},
		}
	}

	/// Fetch one page of a collection.
	///
	/// A server answering with a bare array is treated as the whole list; a
	/// `{count, results, next}` envelope is treated as one page.
	pub async fn fetch_page(&self, url: &str, page: u32, options: FetchOptions) -> Result<ObjectList> {
		if page == 0 {
			return Err(Error::Validation {
				field: "page",
				reason: "Pages are numbered from one.".into(),
			});
		}

		validate_hooks(&options, QueryKind::Page(page))?;

		let abs_url = self.absolute_url(url)?;
		let plan = {
			let mut table = self.queries().lock().await;

			if let Some(index) = table.position(QueryKind::Page(page), &abs_url, &options) {
				let query = table.index_mut(index);
				let plan = match &query.result {
					QueryResult::PendingList(completion) =>
						ListPlan::Wait(query.id, completion.clone()),
					QueryResult::List(_) => {
						let snapshot = query.list_snapshot().unwrap_or(ListSnapshot {
							objects: Vec::new(),
							total: 0,
							complete: true,
						});

						ListPlan::Cached(query.id, snapshot)
					},
					QueryResult::PendingObject(_) | QueryResult::Object(_) =>
						unreachable!("page queries hold list results"),
				};

				if matches!(plan, ListPlan::Cached(..)) && query.expired && !query.refreshing {
					self.begin_refresh(query);
				}

				plan
			} else {
				let completion = Completion::new();
				let id = table.next_id();

				table.push_back(Query::pending_list(
					id,
					QueryKind::Page(page),
					abs_url.clone(),
					options,
					completion.clone(),
				));

				ListPlan::Fetch(completion, id)
			}
		};

		match plan {
			ListPlan::Cached(query_id, snapshot) => Ok(self.list_result(query_id, snapshot)),
			ListPlan::Wait(query_id, completion) =>
				completion.wait().await.map(|snapshot| self.list_result(query_id, snapshot)),
			ListPlan::Fetch(completion, query_id) => {
				let fetch_url = urls::attach_page_number(&abs_url, page);
				let outcome: Result<ListState> = async {
					let payload = CollectionPayload::parse(self.get(&fetch_url).await?)?;

					Ok(page_state(payload))
				}
				.await;

				match outcome {
					Ok(state) => {
						let snapshot = ListSnapshot {
							objects: state.objects.clone(),
							total: state.total,
							complete: true,
						};

						{
							let mut table = self.queries().lock().await;

							if let Some(query) = table.get_mut_by_id(query_id) {
								query.result = QueryResult::List(state);
								query.time = Utc::now();
							}
						}

						completion.complete(Ok(snapshot.clone()));

						Ok(self.list_result(query_id, snapshot))
					},
					Err(err) => {
						completion.complete(Err(err.clone()));

						{
							let mut table = self.queries().lock().await;

							table.remove_by_id(query_id);
						}

						Err(err)
					},
				}
			},
		}
	}

	/// Fetch a complete list, following pagination until the configured
	/// minimum is satisfied.
	///
	/// The result exposes [`ObjectList::more`] for fetching further pages; an
	/// expired hit resolves immediately with the stale value while a background
	/// refresh re-walks the known pages.
	pub async fn fetch_list(&self, url: &str, options: FetchOptions) -> Result<ObjectList> {
		validate_hooks(&options, QueryKind::List)?;

		let abs_url = self.absolute_url(url)?;
		let plan = {
			let mut table = self.queries().lock().await;

			if let Some(index) = table.position(QueryKind::List, &abs_url, &options) {
				let query = table.index_mut(index);
				let plan = match &query.result {
					QueryResult::PendingList(completion) =>
						ListPlan::Wait(query.id, completion.clone()),
					QueryResult::List(_) => {
						let snapshot = query.list_snapshot().unwrap_or(ListSnapshot {
							objects: Vec::new(),
							total: 0,
							complete: true,
						});

						ListPlan::Cached(query.id, snapshot)
					},
					QueryResult::PendingObject(_) | QueryResult::Object(_) =>
						unreachable!("list queries hold list results"),
				};

				if matches!(plan, ListPlan::Cached(..)) && query.expired && !query.refreshing {
					self.begin_refresh(query);
				}

				plan
			} else {
				let completion = Completion::new();
				let id = table.next_id();

				table.insert_front(Query::pending_list(
					id,
					QueryKind::List,
					abs_url.clone(),
					options,
					completion.clone(),
				));

				ListPlan::Fetch(completion, id)
			}
		};

		match plan {
			ListPlan::Cached(query_id, snapshot) => Ok(self.list_result(query_id, snapshot)),
			ListPlan::Wait(query_id, completion) =>
				completion.wait().await.map(|snapshot| self.list_result(query_id, snapshot)),
			ListPlan::Fetch(completion, query_id) => {
				let outcome = self.advance_list(query_id, true).await;

				match outcome {
					Ok(Some(snapshot)) => {
						completion.complete(Ok(snapshot.clone()));

						Ok(self.list_result(query_id, snapshot))
					},
					Ok(None) => {
						completion.complete(Err(Error::Evicted));

						Err(Error::Evicted)
					},
					Err(err) => {
						completion.complete(Err(err.clone()));

						{
							let mut table = self.queries().lock().await;

							table.remove_by_id(query_id);
						}

						Err(err)
					},
				}
			},
		}
	}

	/// Fetch a batch of objects.
	///
	/// When at least `minimum` of them are already cached, resolves immediately
	/// with the partial set (`None` where missing) and completes the remainder
	/// in the background, firing one `change` when the full set has arrived.
	pub async fn fetch_multiple(
		&self,
		fetch_urls: &[&str],
		options: FetchOptions,
	) -> Result<Vec<Option<Arc<Value>>>> {
		let abs_urls: Vec<String> =
			fetch_urls.iter().map(|url| self.absolute_url(url)).collect::<Result<_>>()?;
		let mut cached: Vec<Option<Arc<Value>>> = Vec::with_capacity(abs_urls.len());

		{
			let mut table = self.queries().lock().await;

			for abs_url in &abs_urls {
				let object = if let Some(index) =
					table.position(QueryKind::Object, abs_url, &FetchOptions::default())
				{
					let query = table.index_mut(index);
					let object = query.object().cloned();

					if object.is_some() && query.expired && !query.refreshing {
						self.begin_refresh(query);
					}

					object
				} else if !self.abbreviated_folder_contents() {
					table.derive_query(abs_url)
				} else {
					None
				};

				cached.push(object);
			}
		}

		let cached_count = cached.iter().filter(|object| object.is_some()).count();

		if cached_count == abs_urls.len() {
			return Ok(cached);
		}

		let minimum = get_minimum(options.minimum.as_ref(), abs_urls.len(), abs_urls.len());

		if cached_count >= minimum {
			let source = self.clone();
			let missing: Vec<String> = abs_urls
				.iter()
				.zip(&cached)
				.filter(|(_, object)| object.is_none())
				.map(|(url, _)| url.clone())
				.collect();

			tokio::spawn(async move {
				let fetches =
					missing.iter().map(|url| source.fetch_one(url, FetchOptions::default()));

				for (url, outcome) in missing.iter().zip(join_all(fetches).await) {
					if let Err(err) = outcome {
						tracing::debug!(url, error = %err, "background batch fetch failed");
					}
				}

				source.notify_changes(true).await;
			});

			return Ok(cached);
		}

		let fetches = abs_urls.iter().zip(&cached).map(|(url, object)| async move {
			match object {
				Some(object) => Ok(object.clone()),
				None => self.fetch_one(url, FetchOptions::default()).await,
			}
		});
		let mut objects = Vec::with_capacity(abs_urls.len());

		for outcome in join_all(fetches).await {
			objects.push(Some(outcome?));
		}

		Ok(objects)
	}

	/// Append the next page to a list query.
	///
	/// Coalesces concurrent calls onto one request, parks behind an in-flight
	/// list refresh, and fires `change` once the page has been appended.
	/// Resolves with `None` when the query has left the table.
	pub(crate) async fn fetch_next_page(
		&self,
		query_id: u64,
		initial: bool,
	) -> Result<Option<ObjectList>> {
		if initial {
			return match self.advance_list(query_id, true).await? {
				Some(snapshot) => Ok(Some(self.list_result(query_id, snapshot))),
				None => Ok(None),
			};
		}

		loop {
			let plan = {
				let mut table = self.queries().lock().await;
				let Some(query) = table.get_mut_by_id(query_id) else { return Ok(None) };

				if query.refreshing && let Some(parked) = &query.parked {
					MorePlan::Park(parked.clone())
				} else if let Some(flight) = &query.next_flight {
					MorePlan::Join(flight.clone())
				} else if query.next_url.is_none() {
					match query.list_snapshot() {
						Some(snapshot) => MorePlan::Current(snapshot),
						None => return Ok(None),
					}
				} else {
					let flight = Completion::new();

					query.next_flight = Some(flight.clone());

					MorePlan::Fetch(flight)
				}
			};

			match plan {
				MorePlan::Current(snapshot) => return Ok(Some(self.list_result(query_id, snapshot))),
				MorePlan::Park(parked) => {
					parked.wait().await;

					continue;
				},
				MorePlan::Join(flight) => {
					return match flight.wait().await {
						Ok(snapshot) => Ok(Some(self.list_result(query_id, snapshot))),
						Err(Error::Evicted) => Ok(None),
						Err(err) => Err(err),
					};
				},
				MorePlan::Fetch(flight) => {
					let outcome = self.advance_list(query_id, false).await;
					let result = match outcome {
						Ok(Some(snapshot)) => Ok(snapshot),
						Ok(None) => Err(Error::Evicted),
						Err(err) => Err(err),
					};

					{
						let mut table = self.queries().lock().await;

						if let Some(query) = table.get_mut_by_id(query_id) {
							query.next_flight = None;
						}
					}

					flight.complete(result.clone());

					match result {
						Ok(snapshot) => {
							self.notify_changes(true).await;

							return Ok(Some(self.list_result(query_id, snapshot)));
						},
						Err(Error::Evicted) => return Ok(None),
						Err(err) => return Err(err),
					}
				},
			}
		}
	}

	/// Fetch pages for a list query until the minimum is satisfied (initial) or
	/// one page has been appended (growth), committing the accumulated objects
	/// when done. Resolves with `None` when the query has left the table.
	async fn advance_list(&self, query_id: u64, initial: bool) -> Result<Option<ListSnapshot>> {
		let (mut objects, mut fetch_url, minimum) = {
			let table = self.queries().lock().await;
			let Some(query) = table.get_by_id(query_id) else { return Ok(None) };
			let objects = query.list().map(|list| list.objects.clone()).unwrap_or_default();
			let fetch_url = query.next_url.clone().unwrap_or_else(|| query.url.clone());

			(objects, fetch_url, query.options.minimum)
		};
		let mut pages_fetched = 0u32;

		loop {
			let payload = CollectionPayload::parse(self.get(&fetch_url).await?)?;

			match payload {
				CollectionPayload::Complete(incoming) => {
					let objects = object::append_objects(&[], incoming);
					let total = objects.len();

					return Ok(self
						.commit_list(query_id, objects, total, None, pages_fetched.max(1), false)
						.await);
				},
				CollectionPayload::Page { results, count, next } => {
					objects = object::append_objects(&objects, results);
					pages_fetched += 1;

					let total = count.unwrap_or(objects.len());
					let next_url = next.map(|next| self.transform_url(&next));

					match next_url {
						Some(next_url)
							if initial && objects.len() < get_minimum(minimum.as_ref(), total, 1) =>
						{
							// Below the requested minimum: keep walking within
							// the same resolution.
							fetch_url = next_url;
						},
						next_url =>
							return Ok(self
								.commit_list(query_id, objects, total, next_url, pages_fetched, true)
								.await),
					}
				},
			}
		}
	}

	async fn commit_list(
		&self,
		query_id: u64,
		objects: Vec<Arc<Value>>,
		total: usize,
		next_url: Option<String>,
		pages_fetched: u32,
		paginated: bool,
	) -> Option<ListSnapshot> {
		let mut table = self.queries().lock().await;
		let query = table.get_mut_by_id(query_id)?;
		let complete = next_url.is_none();

		query.result = QueryResult::List(ListState {
			objects: objects.clone(),
			total,
			complete,
			paginated,
		});
		query.next_url = next_url;
		query.next_page += pages_fetched;
		query.time = Utc::now();
		query.expired = false;

		Some(ListSnapshot { objects, total, complete })
	}

	pub(crate) fn list_result(&self, query_id: u64, snapshot: ListSnapshot) -> ObjectList {
		if snapshot.complete {
			ObjectList::finished(snapshot.objects, snapshot.total)
		} else {
			ObjectList::growing(snapshot.objects, snapshot.total, self.downgrade(), query_id)
		}
	}
}

fn page_state(payload: CollectionPayload) -> ListState {
	match payload {
		CollectionPayload::Complete(incoming) => {
			let objects = object::append_objects(&[], incoming);
			let total = objects.len();

			ListState { objects, total, complete: true, paginated: false }
		},
		CollectionPayload::Page { results, count, .. } => {
			let objects = object::append_objects(&[], results);
			let total = count.unwrap_or(objects.len());

			ListState { objects, total, complete: true, paginated: true }
		},
	}
}
