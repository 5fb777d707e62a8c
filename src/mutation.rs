//! Local write operations and the propagation hooks that keep every cached
//! query coherent with them.
//!
//! Each write (insert/update/delete) talks to the server first, then the
//! results are segregated by target folder and routed through every cached
//! query's hook. Server answers of 404, 409, and 410 mean the entity no longer
//! matches server state; such objects travel as rejects and expire whatever
//! still caches them.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use futures::future::join_all;
use http::StatusCode;
// self
use crate::{
	_prelude::*,
	cache::{
		query::{FetchOptions, Query, QueryKind, QueryResult},
		table::QueryTable,
	},
	object,
	source::DataSource,
	urls,
};

/// Value handed to a [`Hook::Custom`] function.
pub enum HookContext<'a> {
	/// The hook runs against a cached single object.
	Object {
		/// Currently cached object.
		cached: &'a Value,
		/// Object produced by the write.
		fresh: &'a Value,
	},
	/// The hook runs against a cached list or page.
	List {
		/// Currently cached objects.
		cached: &'a [Arc<Value>],
		/// Objects produced by the write, filtered per the hook's matching
		/// rule.
		fresh: &'a [Arc<Value>],
	},
}

/// Decision returned by a custom hook.
pub enum HookAction {
	/// Leave the cached value untouched.
	Unchanged,
	/// Mark the query expired so the next read refreshes it.
	Expire,
	/// Replace the cached object outright.
	ReplaceObject(Value),
	/// Replace the cached list outright.
	ReplaceList(Vec<Value>),
}

/// Custom hook function.
pub type HookFn = Arc<dyn Fn(HookContext<'_>) -> Result<HookAction> + Send + Sync>;

/// Per-query policy mapping a write operation's results to a cache update.
#[derive(Clone)]
pub enum Hook {
	/// Mark the query expired.
	Refresh,
	/// Leave the query untouched.
	Ignore,
	/// Replace the cached object, or matching list entries in place.
	Replace,
	/// Prepend new entries; list-shaped queries only.
	Unshift,
	/// Append new entries; list-shaped queries only.
	Push,
	/// Drop the object query, or filter matching entries out of a list.
	Remove,
	/// User-supplied policy. A failure is logged and downgraded to `Refresh`.
	Custom(HookFn),
}
impl Hook {
	fn valid_for(&self, kind: QueryKind) -> bool {
		match self {
			Self::Unshift | Self::Push => kind != QueryKind::Object,
			_ => true,
		}
	}
}
impl PartialEq for Hook {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Refresh, Self::Refresh)
			| (Self::Ignore, Self::Ignore)
			| (Self::Replace, Self::Replace)
			| (Self::Unshift, Self::Unshift)
			| (Self::Push, Self::Push)
			| (Self::Remove, Self::Remove) => true,
			(Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
			_ => false,
		}
	}
}
impl Debug for Hook {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		match self {
			Self::Refresh => f.write_str("Refresh"),
			Self::Ignore => f.write_str("Ignore"),
			Self::Replace => f.write_str("Replace"),
			Self::Unshift => f.write_str("Unshift"),
			Self::Push => f.write_str("Push"),
			Self::Remove => f.write_str("Remove"),
			Self::Custom(_) => f.write_str("Custom(..)"),
		}
	}
}

/// Reject hook configurations that cannot apply to the query shape.
pub(crate) fn validate_hooks(options: &FetchOptions, kind: QueryKind) -> Result<()> {
	let hooks = [
		("after_insert", &options.after_insert),
		("after_update", &options.after_update),
		("after_delete", &options.after_delete),
	];

	for (field, hook) in hooks {
		if let Some(hook) = hook
			&& !hook.valid_for(kind)
		{
			return Err(Error::Validation {
				field,
				reason: format!("The {hook:?} hook cannot apply to an object query."),
			});
		}
	}

	Ok(())
}

/// One folder's worth of write results.
pub(crate) struct WriteOp {
	/// Canonical folder URL the affected objects live under.
	pub(crate) url: String,
	pub(crate) results: Vec<Arc<Value>>,
	pub(crate) rejects: Vec<Arc<Value>>,
}

enum HookEffect {
	Unchanged,
	Changed,
	Drop,
}

impl DataSource {
	/// Insert one object into a folder.
	pub async fn insert_one(&self, folder_url: &str, object: Value) -> Result<Value> {
		let mut results = self.insert_multiple(folder_url, vec![object]).await?;

		Ok(results.remove(0))
	}

	/// Insert objects into a folder, POSTing them in parallel.
	///
	/// Every request settles before the call resolves; when any fails, the
	/// error carries the aligned per-object results and errors.
	pub async fn insert_multiple(&self, folder_url: &str, objects: Vec<Value>) -> Result<Vec<Value>> {
		let folder_abs_url = self.absolute_url(folder_url)?;
		let requests = objects.iter().map(|object| self.post(&folder_abs_url, object.clone()));
		let outcomes = join_all(requests).await;
		let mut results = Vec::with_capacity(objects.len());
		let mut errors = Vec::with_capacity(objects.len());
		let mut ops: Vec<WriteOp> = Vec::new();

		for outcome in outcomes {
			match flatten_body(outcome, &folder_abs_url) {
				Ok(created) => {
					let created = Arc::new(created);

					if let Some(folder) = urls::object_folder_url(&folder_abs_url, &created) {
						op_for(&mut ops, &folder).results.push(created.clone());
					}

					results.push(Some((*created).clone()));
					errors.push(None);
				},
				Err(err) => {
					results.push(None);
					errors.push(Some(err));
				},
			}
		}

		let changed = {
			let mut table = self.queries().lock().await;
			let mut changed = false;

			for op in &ops {
				changed |= run_insert_hooks(&mut table, op);
			}

			changed
		};

		self.notify_changes(changed).await;

		finish_batch(results, errors)
	}

	/// Update one object under a folder.
	pub async fn update_one(&self, folder_url: &str, object: Value) -> Result<Value> {
		let mut results = self.update_multiple(folder_url, vec![object]).await?;

		Ok(results.remove(0))
	}

	/// Update objects under a folder, PUTting them in parallel.
	pub async fn update_multiple(&self, folder_url: &str, objects: Vec<Value>) -> Result<Vec<Value>> {
		let folder_abs_url = self.absolute_url(folder_url)?;
		let targets: Vec<Option<String>> =
			objects.iter().map(|object| urls::object_url(&folder_abs_url, object)).collect();
		let requests = objects.iter().zip(&targets).map(|(object, target)| async move {
			match target {
				Some(url) => self.put(url, object.clone()).await,
				None => Err(missing_identity()),
			}
		});
		let outcomes = join_all(requests).await;
		let mut results = Vec::with_capacity(objects.len());
		let mut errors = Vec::with_capacity(objects.len());
		let mut ops: Vec<WriteOp> = Vec::new();

		for ((object, target), outcome) in objects.iter().zip(&targets).zip(outcomes) {
			match flatten_body(outcome, &folder_abs_url) {
				Ok(updated) => {
					let updated = Arc::new(updated);

					if let Some(folder) = urls::object_folder_url(&folder_abs_url, &updated) {
						op_for(&mut ops, &folder).results.push(updated.clone());
					}

					results.push(Some((*updated).clone()));
					errors.push(None);
				},
				Err(err) => {
					if is_reject(&err)
						&& let Some(target) = target
						&& let Some(folder) = urls::folder_url(target)
					{
						op_for(&mut ops, &folder).rejects.push(Arc::new(object.clone()));
					}

					results.push(None);
					errors.push(Some(err));
				},
			}
		}

		let changed = {
			let mut table = self.queries().lock().await;
			let mut changed = false;

			for op in &ops {
				changed |= run_update_hooks(&mut table, op, None);
			}

			changed
		};

		self.notify_changes(changed).await;

		finish_batch(results, errors)
	}

	/// Delete one object under a folder.
	pub async fn delete_one(&self, folder_url: &str, object: Value) -> Result<Value> {
		let mut results = self.delete_multiple(folder_url, vec![object]).await?;

		Ok(results.remove(0))
	}

	/// Delete objects under a folder, DELETEing them in parallel.
	pub async fn delete_multiple(&self, folder_url: &str, objects: Vec<Value>) -> Result<Vec<Value>> {
		let folder_abs_url = self.absolute_url(folder_url)?;
		let targets: Vec<Option<String>> =
			objects.iter().map(|object| urls::object_url(&folder_abs_url, object)).collect();
		let requests = targets.iter().map(|target| async move {
			match target {
				Some(url) => self.delete(url).await,
				None => Err(missing_identity()),
			}
		});
		let outcomes = join_all(requests).await;
		let mut results = Vec::with_capacity(objects.len());
		let mut errors = Vec::with_capacity(objects.len());
		let mut ops: Vec<WriteOp> = Vec::new();

		for ((object, target), outcome) in objects.iter().zip(&targets).zip(outcomes) {
			match outcome {
				Ok(_) => {
					let deleted = Arc::new(object.clone());

					if let Some(folder) = urls::object_folder_url(&folder_abs_url, &deleted) {
						op_for(&mut ops, &folder).results.push(deleted);
					}

					results.push(Some(object.clone()));
					errors.push(None);
				},
				Err(err) => {
					if is_reject(&err)
						&& let Some(target) = target
						&& let Some(folder) = urls::folder_url(target)
					{
						op_for(&mut ops, &folder).rejects.push(Arc::new(object.clone()));
					}

					results.push(None);
					errors.push(Some(err));
				},
			}
		}

		let changed = {
			let mut table = self.queries().lock().await;
			let mut changed = false;

			for op in &ops {
				changed |= run_delete_hooks(&mut table, op);
			}

			changed
		};

		self.notify_changes(changed).await;

		finish_batch(results, errors)
	}
}

/// Route a freshly fetched object through the update hooks of every other
/// query under the same folder.
pub(crate) fn process_fresh_object(
	table: &mut QueryTable,
	object: &Arc<Value>,
	object_url: &str,
	exclude: Option<u64>,
) -> bool {
	let Some(folder) = urls::folder_url(object_url) else { return false };
	let op = WriteOp { url: folder, results: vec![object.clone()], rejects: Vec::new() };

	run_update_hooks(table, &op, exclude)
}

fn run_insert_hooks(table: &mut QueryTable, op: &WriteOp) -> bool {
	let mut changed = false;

	for query in table.iter_mut() {
		changed |= matches!(run_insert_hook(query, op), HookEffect::Changed);
	}

	// Newly created objects are immediately readable as object queries.
	for object in &op.results {
		if let Some(url) = urls::object_url(&op.url, object) {
			table.upsert_object_query(url, object.clone());
		}
	}

	changed
}

fn run_insert_hook(query: &mut Query, op: &WriteOp) -> HookEffect {
	if query.kind == QueryKind::Object || urls::omit_query(&query.url) != op.url {
		return HookEffect::Unchanged;
	}

	let Some(list) = query.list() else { return HookEffect::Unchanged };
	let fresh: Vec<Arc<Value>> = op
		.results
		.iter()
		.filter(|object| object::find_object_index(&list.objects, object).is_none())
		.cloned()
		.collect();

	if fresh.is_empty() {
		return HookEffect::Unchanged;
	}

	let hook = query.options.after_insert.clone().unwrap_or(Hook::Refresh);

	apply_list_hook(query, &hook, &fresh)
}

pub(crate) fn run_update_hooks(table: &mut QueryTable, op: &WriteOp, exclude: Option<u64>) -> bool {
	walk(table, exclude, |query| run_update_hook(query, op))
}

fn run_update_hook(query: &mut Query, op: &WriteOp) -> HookEffect {
	match query.kind {
		QueryKind::Object => {
			if urls::folder_url(&query.url).as_deref() != Some(&op.url) {
				return HookEffect::Unchanged;
			}

			let Some(cached) = query.object().cloned() else { return HookEffect::Unchanged };

			if object::find_object_index(&op.rejects, &cached).is_some() {
				return expire(query);
			}

			let Some(fresh) = object::find_object(&op.results, &cached).cloned() else {
				return HookEffect::Unchanged;
			};

			if *fresh == *cached {
				return HookEffect::Unchanged;
			}

			let hook = query.options.after_update.clone().unwrap_or(Hook::Replace);

			apply_object_hook(query, &hook, &fresh)
		},
		QueryKind::Page(_) | QueryKind::List => {
			if urls::omit_query(&query.url) != op.url {
				return HookEffect::Unchanged;
			}

			let Some(list) = query.list() else { return HookEffect::Unchanged };

			if op
				.rejects
				.iter()
				.any(|reject| object::find_object_index(&list.objects, reject).is_some())
			{
				return expire(query);
			}

			let fresh: Vec<Arc<Value>> = op
				.results
				.iter()
				.filter(|object| {
					matches!(
						object::find_object_index(&list.objects, object),
						Some(index) if *list.objects[index] != ***object
					)
				})
				.cloned()
				.collect();

			if fresh.is_empty() {
				return HookEffect::Unchanged;
			}

			let hook = query.options.after_update.clone().unwrap_or(Hook::Refresh);

			apply_list_hook(query, &hook, &fresh)
		},
	}
}

fn run_delete_hooks(table: &mut QueryTable, op: &WriteOp) -> bool {
	walk(table, None, |query| run_delete_hook(query, op))
}

fn run_delete_hook(query: &mut Query, op: &WriteOp) -> HookEffect {
	match query.kind {
		QueryKind::Object => {
			if urls::folder_url(&query.url).as_deref() != Some(&op.url) {
				return HookEffect::Unchanged;
			}

			let Some(cached) = query.object().cloned() else { return HookEffect::Unchanged };

			if object::find_object_index(&op.rejects, &cached).is_some() {
				return expire(query);
			}
			if object::find_object_index(&op.results, &cached).is_none() {
				return HookEffect::Unchanged;
			}

			let Some(fresh) = object::find_object(&op.results, &cached).cloned() else {
				return HookEffect::Unchanged;
			};
			let hook = query.options.after_delete.clone().unwrap_or(Hook::Remove);

			apply_object_hook(query, &hook, &fresh)
		},
		QueryKind::Page(_) | QueryKind::List => {
			if urls::omit_query(&query.url) != op.url {
				return HookEffect::Unchanged;
			}

			let Some(list) = query.list() else { return HookEffect::Unchanged };

			if op
				.rejects
				.iter()
				.any(|reject| object::find_object_index(&list.objects, reject).is_some())
			{
				return expire(query);
			}

			let fresh: Vec<Arc<Value>> = op
				.results
				.iter()
				.filter(|object| object::find_object_index(&list.objects, object).is_some())
				.cloned()
				.collect();

			if fresh.is_empty() {
				return HookEffect::Unchanged;
			}

			let fallback =
				if query.kind == QueryKind::List { Hook::Remove } else { Hook::Refresh };
			let hook = query.options.after_delete.clone().unwrap_or(fallback);

			apply_list_hook(query, &hook, &fresh)
		},
	}
}

fn walk(
	table: &mut QueryTable,
	exclude: Option<u64>,
	mut hook: impl FnMut(&mut Query) -> HookEffect,
) -> bool {
	let mut changed = false;
	let mut dropped = Vec::new();

	for query in table.iter_mut() {
		if Some(query.id) == exclude {
			continue;
		}

		match hook(query) {
			HookEffect::Unchanged => {},
			HookEffect::Changed => changed = true,
			HookEffect::Drop => {
				dropped.push(query.id);
				changed = true;
			},
		}
	}

	for id in dropped {
		table.remove_by_id(id);
	}

	changed
}

fn apply_object_hook(query: &mut Query, hook: &Hook, fresh: &Arc<Value>) -> HookEffect {
	match hook {
		Hook::Refresh => expire(query),
		Hook::Ignore => HookEffect::Unchanged,
		Hook::Replace => {
			let identical = query.object().is_some_and(|object| **object == **fresh);

			if identical {
				HookEffect::Unchanged
			} else {
				query.result = QueryResult::Object(fresh.clone());

				HookEffect::Changed
			}
		},
		Hook::Remove => HookEffect::Drop,
		// Rejected for object queries at validation time.
		Hook::Unshift | Hook::Push => HookEffect::Unchanged,
		Hook::Custom(custom) => {
			let action = {
				let Some(cached) = query.object() else { return HookEffect::Unchanged };

				custom(HookContext::Object { cached, fresh })
			};

			match action {
				Ok(HookAction::Unchanged) => HookEffect::Unchanged,
				Ok(HookAction::Expire) => expire(query),
				Ok(HookAction::ReplaceObject(value)) => {
					query.result = QueryResult::Object(Arc::new(value));

					HookEffect::Changed
				},
				Ok(HookAction::ReplaceList(_)) => {
					tracing::warn!(url = %query.url, "list replacement returned for an object query");

					expire(query)
				},
				Err(err) => {
					tracing::warn!(url = %query.url, error = %err, "hook failed; marking query expired");

					expire(query)
				},
			}
		},
	}
}

fn apply_list_hook(query: &mut Query, hook: &Hook, subset: &[Arc<Value>]) -> HookEffect {
	match hook {
		Hook::Refresh => expire(query),
		Hook::Ignore => HookEffect::Unchanged,
		Hook::Replace => {
			let Some(list) = query.list_mut() else { return HookEffect::Unchanged };
			let mut replaced = false;

			for object in subset {
				if let Some(index) = object::find_object_index(&list.objects, object)
					&& *list.objects[index] != **object
				{
					list.objects[index] = object.clone();
					replaced = true;
				}
			}

			if replaced { HookEffect::Changed } else { HookEffect::Unchanged }
		},
		Hook::Unshift => {
			let Some(list) = query.list_mut() else { return HookEffect::Unchanged };
			let old_len = list.objects.len();
			let mut objects = subset.to_vec();

			objects.extend(list.objects.drain(..));
			list.objects = objects;
			list.total = (list.total + list.objects.len()).saturating_sub(old_len);

			HookEffect::Changed
		},
		Hook::Push => {
			let Some(list) = query.list_mut() else { return HookEffect::Unchanged };
			let old_len = list.objects.len();

			list.objects.extend(subset.iter().cloned());
			list.total = (list.total + list.objects.len()).saturating_sub(old_len);

			HookEffect::Changed
		},
		Hook::Remove => {
			let Some(list) = query.list_mut() else { return HookEffect::Unchanged };
			let old_len = list.objects.len();

			list.objects.retain(|object| object::find_object_index(subset, object).is_none());

			if list.objects.len() == old_len {
				return HookEffect::Unchanged;
			}

			list.total = (list.total + list.objects.len()).saturating_sub(old_len);

			HookEffect::Changed
		},
		Hook::Custom(custom) => {
			let action = {
				let Some(list) = query.list() else { return HookEffect::Unchanged };

				custom(HookContext::List { cached: &list.objects, fresh: subset })
			};

			match action {
				Ok(HookAction::Unchanged) => HookEffect::Unchanged,
				Ok(HookAction::Expire) => expire(query),
				Ok(HookAction::ReplaceList(objects)) => {
					let Some(list) = query.list_mut() else { return HookEffect::Unchanged };
					let old_len = list.objects.len();

					list.objects = objects.into_iter().map(Arc::new).collect();
					list.total = (list.total + list.objects.len()).saturating_sub(old_len);

					HookEffect::Changed
				},
				Ok(HookAction::ReplaceObject(_)) => {
					tracing::warn!(url = %query.url, "object replacement returned for a list query");

					expire(query)
				},
				Err(err) => {
					tracing::warn!(url = %query.url, error = %err, "hook failed; marking query expired");

					expire(query)
				},
			}
		},
	}
}

fn expire(query: &mut Query) -> HookEffect {
	if query.expired {
		HookEffect::Unchanged
	} else {
		query.expired = true;

		HookEffect::Changed
	}
}

fn op_for<'a>(ops: &'a mut Vec<WriteOp>, url: &str) -> &'a mut WriteOp {
	let index = match ops.iter().position(|op| op.url == url) {
		Some(index) => index,
		None => {
			ops.push(WriteOp { url: url.to_string(), results: Vec::new(), rejects: Vec::new() });

			ops.len() - 1
		},
	};

	&mut ops[index]
}

fn flatten_body(outcome: Result<Option<Value>>, url: &str) -> Result<Value> {
	outcome.and_then(|body| {
		body.ok_or_else(|| Error::Transport(format!("Empty response body from {url}")))
	})
}

fn is_reject(err: &Error) -> bool {
	err.status().is_some_and(|status| {
		status == StatusCode::NOT_FOUND
			|| status == StatusCode::CONFLICT
			|| status == StatusCode::GONE
	})
}

fn missing_identity() -> Error {
	Error::Validation { field: "object", reason: "Missing id and url identity keys.".into() }
}

fn finish_batch(results: Vec<Option<Value>>, errors: Vec<Option<Error>>) -> Result<Vec<Value>> {
	if let Some(first) = errors.iter().flatten().next().cloned() {
		return Err(Error::Batch { first: Box::new(first), results, errors });
	}

	Ok(results.into_iter().flatten().collect())
}
