//! Identity primitives over opaque JSON objects.
//!
//! Objects are plain JSON documents distinguished only by an identity key: the
//! `id` property when present, else the `url` property. Lists share object
//! references (`Arc`) across refreshes so that downstream consumers can detect
//! unchanged entries by pointer equality.

// self
use crate::_prelude::*;

/// Identity key of an object: `id` preferred, `url` otherwise.
pub(crate) fn identity(object: &Value) -> Option<&Value> {
	object.get("id").or_else(|| object.get("url"))
}

/// Position of the entry sharing `object`'s identity key.
pub(crate) fn find_object_index(list: &[Arc<Value>], object: &Value) -> Option<usize> {
	let key = identity(object)?;

	list.iter().position(|entry| identity(entry) == Some(key))
}

/// Entry sharing `object`'s identity key.
pub(crate) fn find_object<'a>(list: &'a [Arc<Value>], object: &Value) -> Option<&'a Arc<Value>> {
	find_object_index(list, object).map(|index| &list[index])
}

/// Append incoming objects onto an existing list, dropping entries whose
/// identity is already present so cached references win over re-sent ones.
pub(crate) fn append_objects(existing: &[Arc<Value>], incoming: Vec<Value>) -> Vec<Arc<Value>> {
	let mut combined = existing.to_vec();

	for object in incoming {
		if find_object_index(&combined, &object).is_none() {
			combined.push(Arc::new(object));
		}
	}

	combined
}

/// Concatenate the largest suffix of `previous` that does not intersect `fresh`
/// onto `fresh`.
///
/// Keeps entries the user already scrolled past but that no longer appear in a
/// re-walked prefix of the list.
pub(crate) fn join_object_lists(fresh: Vec<Arc<Value>>, previous: &[Arc<Value>]) -> Vec<Arc<Value>> {
	let mut boundary = 0;

	for (index, object) in previous.iter().enumerate().rev() {
		if find_object_index(&fresh, object).is_some() {
			boundary = index + 1;

			break;
		}
	}

	let mut joined = fresh;

	joined.extend(previous[boundary..].iter().cloned());

	joined
}

/// Substitute previous references for positionally identical entries.
///
/// Returns `None` when every position is structurally unchanged, so the caller
/// keeps the previous array and reference equality keeps signalling "same".
pub(crate) fn replace_identical_objects(
	fresh: Vec<Arc<Value>>,
	previous: &[Arc<Value>],
) -> Option<Vec<Arc<Value>>> {
	let mut changed = fresh.len() != previous.len();
	let mut merged = Vec::with_capacity(fresh.len());

	for (index, object) in fresh.into_iter().enumerate() {
		match previous.get(index) {
			Some(known) if **known == *object => merged.push(known.clone()),
			_ => {
				changed = true;

				merged.push(object);
			},
		}
	}

	changed.then_some(merged)
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	fn list(values: Vec<Value>) -> Vec<Arc<Value>> {
		values.into_iter().map(Arc::new).collect()
	}

	#[test]
	fn identity_prefers_id_and_falls_back_to_url() {
		let entries = list(vec![json!({ "id": 1 }), json!({ "url": "/api/items/2/" })]);

		assert_eq!(find_object_index(&entries, &json!({ "id": 1, "name": "a" })), Some(0));
		assert_eq!(find_object_index(&entries, &json!({ "url": "/api/items/2/" })), Some(1));
		assert_eq!(find_object_index(&entries, &json!({ "name": "anonymous" })), None);
	}

	#[test]
	fn append_objects_keeps_cached_references_over_duplicates() {
		let existing = list(vec![json!({ "id": 1, "name": "a" })]);
		let first = existing[0].clone();
		let combined =
			append_objects(&existing, vec![json!({ "id": 1, "name": "changed" }), json!({ "id": 2 })]);

		assert_eq!(combined.len(), 2);
		assert!(Arc::ptr_eq(&combined[0], &first));
	}

	#[test]
	fn join_object_lists_appends_the_non_intersecting_suffix() {
		let previous = list(vec![
			json!({ "id": 1 }),
			json!({ "id": 2 }),
			json!({ "id": 3 }),
			json!({ "id": 4 }),
		]);
		let fresh = list(vec![json!({ "id": 1 }), json!({ "id": 2 }), json!({ "id": 9 })]);
		let joined = join_object_lists(fresh, &previous);
		let ids: Vec<i64> = joined.iter().filter_map(|object| object.get("id")?.as_i64()).collect();

		assert_eq!(ids, vec![1, 2, 9, 3, 4]);
	}

	#[test]
	fn join_object_lists_without_overlap_keeps_the_whole_tail() {
		let previous = list(vec![json!({ "id": 1 }), json!({ "id": 2 })]);
		let fresh = list(vec![json!({ "id": 8 })]);
		let joined = join_object_lists(fresh, &previous);

		assert_eq!(joined.len(), 3);
	}

	#[test]
	fn replace_identical_objects_reuses_references_positionally() {
		let previous = list(vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b" })]);
		let fresh = list(vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b2" })]);
		let merged = replace_identical_objects(fresh, &previous).expect("second entry differs");

		assert!(Arc::ptr_eq(&merged[0], &previous[0]));
		assert!(!Arc::ptr_eq(&merged[1], &previous[1]));

		let unchanged = list(vec![json!({ "id": 1, "name": "a" }), json!({ "id": 2, "name": "b" })]);

		assert!(replace_identical_objects(unchanged, &previous).is_none());
	}
}
