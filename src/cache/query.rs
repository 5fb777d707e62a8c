//! Query records, per-query options, and the list result wrapper.

// std
use std::{
	fmt::{Debug, Formatter, Result as FmtResult},
	sync::Weak,
};
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, mutation::Hook, source::DataSource, sync::Completion};

/// How many objects a batched or paginated fetch must deliver before resolving.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Minimum {
	/// Absolute number of objects.
	Count(usize),
	/// Percentage of the total, rounded up.
	Percent(u32),
	/// Everything but the given number of trailing objects, never below one.
	FromEnd(usize),
}

/// Per-query options recognized by the fetch pipeline.
///
/// Options participate in query identity: two fetches with structurally equal
/// options share one cache entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchOptions {
	/// Early-return threshold for list and batch fetches.
	pub minimum: Option<Minimum>,
	/// Marks the query as abbreviated: its results carry partial objects and
	/// may not be used to derive object queries.
	pub abbreviated: bool,
	/// Policy applied when an insert under the same folder succeeds.
	pub after_insert: Option<Hook>,
	/// Policy applied when an update under the same folder succeeds.
	pub after_update: Option<Hook>,
	/// Policy applied when a delete under the same folder succeeds.
	pub after_delete: Option<Hook>,
}

/// Shape of a cached query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum QueryKind {
	Object,
	Page(u32),
	List,
}

/// Cached objects of a list-shaped query plus server-reported metadata.
#[derive(Clone, Debug)]
pub(crate) struct ListState {
	pub(crate) objects: Vec<Arc<Value>>,
	pub(crate) total: usize,
	/// No further pages exist.
	pub(crate) complete: bool,
	/// The server answered with `{count, results, next}` rather than a bare
	/// array.
	pub(crate) paginated: bool,
}

/// Value delivered to waiters coalesced onto one list fetch.
#[derive(Clone, Debug)]
pub(crate) struct ListSnapshot {
	pub(crate) objects: Vec<Arc<Value>>,
	pub(crate) total: usize,
	pub(crate) complete: bool,
}

/// Result slot of a query.
#[derive(Clone, Debug)]
pub(crate) enum QueryResult {
	PendingObject(Completion<Result<Arc<Value>>>),
	Object(Arc<Value>),
	PendingList(Completion<Result<ListSnapshot>>),
	List(ListState),
}

/// One cached read.
///
/// Queries are identified structurally by `(kind, url, options)` and relocated
/// across suspension points by `id`.
#[derive(Clone, Debug)]
pub(crate) struct Query {
	pub(crate) id: u64,
	pub(crate) kind: QueryKind,
	pub(crate) url: String,
	pub(crate) options: FetchOptions,
	pub(crate) result: QueryResult,
	/// Wall-clock time of the latest successful fetch.
	pub(crate) time: DateTime<Utc>,
	pub(crate) expired: bool,
	pub(crate) refreshing: bool,
	/// URL of the next page reported by the server, list queries only.
	pub(crate) next_url: Option<String>,
	/// Number of pages fetched so far, list queries only.
	pub(crate) next_page: u32,
	/// Coalesces concurrent page appends onto one in-flight request.
	pub(crate) next_flight: Option<Completion<Result<ListSnapshot>>>,
	/// Parks page appends while a list refresh re-walks the pages.
	pub(crate) parked: Option<Completion<()>>,
}
impl Query {
	pub(crate) fn pending_object(
		id: u64,
		url: String,
		options: FetchOptions,
		completion: Completion<Result<Arc<Value>>>,
	) -> Self {
		Self {
			id,
			kind: QueryKind::Object,
			url,
			options,
			result: QueryResult::PendingObject(completion),
			time: Utc::now(),
			expired: false,
			refreshing: false,
			next_url: None,
			next_page: 0,
			next_flight: None,
			parked: None,
		}
	}

	pub(crate) fn object_query(
		id: u64,
		url: String,
		options: FetchOptions,
		object: Arc<Value>,
		time: DateTime<Utc>,
	) -> Self {
		Self {
			id,
			kind: QueryKind::Object,
			url,
			options,
			result: QueryResult::Object(object),
			time,
			expired: false,
			refreshing: false,
			next_url: None,
			next_page: 0,
			next_flight: None,
			parked: None,
		}
	}

	pub(crate) fn pending_list(
		id: u64,
		kind: QueryKind,
		url: String,
		options: FetchOptions,
		completion: Completion<Result<ListSnapshot>>,
	) -> Self {
		Self {
			id,
			kind,
			url,
			options,
			result: QueryResult::PendingList(completion),
			time: Utc::now(),
			expired: false,
			refreshing: false,
			next_url: None,
			next_page: 0,
			next_flight: None,
			parked: None,
		}
	}

	pub(crate) fn object(&self) -> Option<&Arc<Value>> {
		match &self.result {
			QueryResult::Object(object) => Some(object),
			_ => None,
		}
	}

	pub(crate) fn list(&self) -> Option<&ListState> {
		match &self.result {
			QueryResult::List(list) => Some(list),
			_ => None,
		}
	}

	pub(crate) fn list_mut(&mut self) -> Option<&mut ListState> {
		match &mut self.result {
			QueryResult::List(list) => Some(list),
			_ => None,
		}
	}

	pub(crate) fn list_snapshot(&self) -> Option<ListSnapshot> {
		self.list().map(|list| ListSnapshot {
			objects: list.objects.clone(),
			total: list.total,
			complete: list.complete,
		})
	}
}

/// Result of a list or page fetch: the objects plus server-reported metadata.
///
/// The "fetch more" capability travels as part of the record rather than as a
/// property attached to the array; [`ObjectList::more`] either fetches the next
/// page or resolves immediately when the list is complete.
#[derive(Clone)]
pub struct ObjectList {
	objects: Vec<Arc<Value>>,
	total: usize,
	more: More,
}
#[derive(Clone)]
enum More {
	Done,
	Fetch { source: Weak<crate::source::Inner>, query_id: u64 },
}
impl ObjectList {
	pub(crate) fn finished(objects: Vec<Arc<Value>>, total: usize) -> Self {
		Self { objects, total, more: More::Done }
	}

	pub(crate) fn growing(
		objects: Vec<Arc<Value>>,
		total: usize,
		source: Weak<crate::source::Inner>,
		query_id: u64,
	) -> Self {
		Self { objects, total, more: More::Fetch { source, query_id } }
	}

	/// Objects fetched so far.
	pub fn objects(&self) -> &[Arc<Value>] {
		&self.objects
	}

	/// Server-reported total count of the collection.
	pub fn total(&self) -> usize {
		self.total
	}

	/// Number of objects fetched so far.
	pub fn len(&self) -> usize {
		self.objects.len()
	}

	/// Whether no objects have been fetched.
	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	/// Whether another page can be fetched.
	pub fn has_more(&self) -> bool {
		matches!(self.more, More::Fetch { .. })
	}

	/// Fetch the next page and resolve with the grown list.
	///
	/// Resolves immediately with the current contents when the list is
	/// complete, when the owning source is gone, or when the query has been
	/// evicted. Concurrent calls coalesce onto one request; calls racing a
	/// list refresh wait for the refresh to settle first.
	pub async fn more(&self) -> Result<ObjectList> {
		match &self.more {
			More::Done => Ok(self.clone()),
			More::Fetch { source, query_id } => match source.upgrade() {
				Some(inner) => {
					let source = DataSource::from_inner(inner);

					match source.fetch_next_page(*query_id, false).await? {
						Some(list) => Ok(list),
						None => Ok(self.clone()),
					}
				},
				None => Ok(self.clone()),
			},
		}
	}
}
impl Debug for ObjectList {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("ObjectList")
			.field("len", &self.objects.len())
			.field("total", &self.total)
			.field("has_more", &self.has_more())
			.finish()
	}
}
