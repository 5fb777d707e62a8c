//! The owning query table: structural lookup, derivation, and expiration.

// self
use crate::{
	_prelude::*,
	cache::query::{FetchOptions, Query, QueryKind, QueryResult},
	urls,
};

/// All queries of one source, most recent object queries first.
///
/// The table is the single owner; consumers address entries by index or by the
/// process-unique query id, never by reference held across a suspension point.
#[derive(Debug, Default)]
pub(crate) struct QueryTable {
	queries: Vec<Query>,
	sequence: u64,
}
impl QueryTable {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn next_id(&mut self) -> u64 {
		self.sequence += 1;

		self.sequence
	}

	/// First entry structurally equal on kind, URL, and options.
	pub(crate) fn position(
		&self,
		kind: QueryKind,
		url: &str,
		options: &FetchOptions,
	) -> Option<usize> {
		self.queries
			.iter()
			.position(|query| query.kind == kind && query.url == url && query.options == *options)
	}

	pub(crate) fn index_mut(&mut self, index: usize) -> &mut Query {
		&mut self.queries[index]
	}

	pub(crate) fn get_by_id(&self, id: u64) -> Option<&Query> {
		self.queries.iter().find(|query| query.id == id)
	}

	pub(crate) fn get_mut_by_id(&mut self, id: u64) -> Option<&mut Query> {
		self.queries.iter_mut().find(|query| query.id == id)
	}

	pub(crate) fn insert_front(&mut self, query: Query) {
		self.queries.insert(0, query);
	}

	pub(crate) fn push_back(&mut self, query: Query) {
		self.queries.push(query);
	}

	pub(crate) fn iter(&self) -> impl Iterator<Item = &Query> {
		self.queries.iter()
	}

	pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Query> {
		self.queries.iter_mut()
	}

	pub(crate) fn remove_by_id(&mut self, id: u64) -> bool {
		match self.queries.iter().position(|query| query.id == id) {
			Some(index) => {
				abandon(self.queries.remove(index));

				true
			},
			None => false,
		}
	}

	/// Drop every query whose URL falls under any of the given prefixes.
	pub(crate) fn evict_matching(&mut self, prefixes: &[String]) -> usize {
		let mut evicted = Vec::new();
		let mut index = 0;

		while index < self.queries.len() {
			if urls::match_any_url(&self.queries[index].url, prefixes) {
				evicted.push(self.queries.remove(index));
			} else {
				index += 1;
			}
		}

		let count = evicted.len();

		for query in evicted {
			abandon(query);
		}

		count
	}

	/// Mark every query whose fetch time is at or before `cutoff` (every query,
	/// absent a cutoff) as expired. Returns whether anything newly expired.
	pub(crate) fn invalidate(&mut self, cutoff: Option<DateTime<Utc>>) -> bool {
		let mut changed = false;

		for query in &mut self.queries {
			if query.expired {
				continue;
			}
			if let Some(cutoff) = cutoff
				&& query.time > cutoff
			{
				continue;
			}

			query.expired = true;
			changed = true;
		}

		changed
	}

	/// Record a freshly written object as an object query, updating the default
	/// entry for its URL in place rather than inserting a duplicate.
	pub(crate) fn upsert_object_query(&mut self, url: String, object: Arc<Value>) {
		let now = Utc::now();

		if let Some(index) = self.position(QueryKind::Object, &url, &FetchOptions::default()) {
			let query = &mut self.queries[index];

			if query.object().is_some() {
				query.result = QueryResult::Object(object);
				query.time = now;
				query.expired = false;

				return;
			}
		} else {
			let id = self.next_id();

			self.insert_front(Query::object_query(id, url, FetchOptions::default(), object, now));
		}
	}

	/// Synthesize an object query for `abs_url` from a cached list or page that
	/// contains a matching entry, splicing it to the front of the table.
	///
	/// Reuses an existing default-options object query instead of inserting a
	/// duplicate. Returns the derived object.
	pub(crate) fn derive_query(&mut self, abs_url: &str) -> Option<Arc<Value>> {
		if let Some(index) = self.position(QueryKind::Object, abs_url, &FetchOptions::default())
			&& let Some(object) = self.queries[index].object()
		{
			return Some(object.clone());
		}

		let (object, time) = self.derivable(abs_url)?;
		let id = self.next_id();
		let query =
			Query::object_query(id, abs_url.to_string(), FetchOptions::default(), object.clone(), time);

		self.insert_front(query);

		Some(object)
	}

	/// Matching entry of a non-expired, non-abbreviated list or page query
	/// under `abs_url`'s folder, together with the parent's fetch time.
	pub(crate) fn derivable(&self, abs_url: &str) -> Option<(Arc<Value>, DateTime<Utc>)> {
		let folder = urls::folder_url(abs_url)?;
		let id = urls::trailing_id(abs_url);

		for query in &self.queries {
			if !matches!(query.kind, QueryKind::Page(_) | QueryKind::List)
				|| query.expired
				|| query.options.abbreviated
				|| urls::omit_query(&query.url) != folder
			{
				continue;
			}

			let Some(list) = query.list() else { continue };

			for object in &list.objects {
				let matched = object.get("url").and_then(Value::as_str) == Some(abs_url)
					|| (id.is_some() && object.get("id").and_then(Value::as_i64) == id);

				if matched {
					return Some((object.clone(), query.time));
				}
			}
		}

		None
	}

	/// Whether an object for `abs_url` is available, directly or by derivation.
	pub(crate) fn object_available(
		&self,
		abs_url: &str,
		check_expiration: bool,
		no_derivation: bool,
	) -> bool {
		for query in &self.queries {
			if query.kind == QueryKind::Object && query.url == abs_url && query.object().is_some() {
				return !(check_expiration && query.expired);
			}
		}

		!no_derivation && self.derivable(abs_url).is_some()
	}
}

/// Settle the completions of a query leaving the table so no waiter hangs.
fn abandon(query: Query) {
	match query.result {
		QueryResult::PendingObject(completion) => completion.complete(Err(Error::Evicted)),
		QueryResult::PendingList(completion) => completion.complete(Err(Error::Evicted)),
		QueryResult::Object(_) | QueryResult::List(_) => {},
	}

	if let Some(flight) = query.next_flight {
		flight.complete(Err(Error::Evicted));
	}
	if let Some(parked) = query.parked {
		parked.complete(());
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;
	use crate::{cache::query::ListState, sync::Completion};

	fn list_query(table: &mut QueryTable, url: &str, objects: Vec<Value>) -> u64 {
		let id = table.next_id();
		let total = objects.len();
		let mut query = Query::pending_list(
			id,
			QueryKind::List,
			url.to_string(),
			FetchOptions::default(),
			Completion::new(),
		);

		query.result = QueryResult::List(ListState {
			objects: objects.into_iter().map(Arc::new).collect(),
			total,
			complete: true,
			paginated: false,
		});
		table.insert_front(query);

		id
	}

	#[test]
	fn position_matches_kind_url_and_options() {
		let mut table = QueryTable::new();
		let id = list_query(&mut table, "/api/items/", vec![json!({ "id": 1 })]);

		assert!(table.position(QueryKind::List, "/api/items/", &FetchOptions::default()).is_some());
		assert!(table.position(QueryKind::Object, "/api/items/", &FetchOptions::default()).is_none());
		assert!(
			table
				.position(
					QueryKind::List,
					"/api/items/",
					&FetchOptions { abbreviated: true, ..Default::default() }
				)
				.is_none()
		);
		assert!(table.get_by_id(id).is_some());
	}

	#[test]
	fn derive_query_splices_an_object_query_to_the_front() {
		let mut table = QueryTable::new();

		list_query(&mut table, "/api/items/", vec![json!({ "id": 5, "name": "e" })]);

		let object = table.derive_query("/api/items/5/").expect("derivable");

		assert_eq!(object.get("name").and_then(Value::as_str), Some("e"));
		assert!(table.position(QueryKind::Object, "/api/items/5/", &FetchOptions::default()).is_some());

		// A second derivation reuses the spliced query.
		let before = table.iter().count();

		table.derive_query("/api/items/5/").expect("still derivable");

		assert_eq!(table.iter().count(), before);
	}

	#[test]
	fn expired_parents_do_not_derive() {
		let mut table = QueryTable::new();
		let id = list_query(&mut table, "/api/items/", vec![json!({ "id": 5 })]);

		table.get_mut_by_id(id).expect("present").expired = true;

		assert!(table.derive_query("/api/items/5/").is_none());
	}

	#[test]
	fn invalidate_honours_the_cutoff() {
		let mut table = QueryTable::new();
		let id = list_query(&mut table, "/api/items/", vec![json!({ "id": 1 })]);

		assert!(!table.invalidate(Some(Utc::now() - chrono::Duration::seconds(60))));
		assert!(table.invalidate(None));
		assert!(table.get_by_id(id).expect("present").expired);
	}

	#[test]
	fn evict_matching_drops_whole_scopes() {
		let mut table = QueryTable::new();

		list_query(&mut table, "https://api.test/items/", vec![json!({ "id": 1 })]);
		list_query(&mut table, "https://other.test/items/", vec![json!({ "id": 2 })]);

		assert_eq!(table.evict_matching(&["https://api.test/".to_string()]), 1);
		assert_eq!(table.iter().count(), 1);
	}
}
