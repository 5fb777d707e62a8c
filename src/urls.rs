//! URL helpers covering canonical form, folder identity, sub-path matching, and
//! the page query parameter.
//!
//! Canonical URLs always carry a trailing slash ahead of any search string; the
//! helpers here assume string-level canonical form and leave scheme-aware
//! resolution to [`crate::DataSource`].

// self
use crate::_prelude::*;

/// Strip the search string, if any.
pub(crate) fn omit_query(url: &str) -> &str {
	match url.find('?') {
		Some(index) => &url[..index],
		None => url,
	}
}

/// Ensure the path portion ends with a slash, preserving any search string.
pub(crate) fn add_trailing_slash(url: &str) -> String {
	let (path, query) = match url.find('?') {
		Some(index) => (&url[..index], Some(&url[index..])),
		None => (url, None),
	};

	if path.ends_with('/') {
		url.to_string()
	} else {
		match query {
			Some(query) => format!("{path}/{query}"),
			None => format!("{path}/"),
		}
	}
}

/// Parent-collection URL: everything up to and including the last slash ahead
/// of the final path segment, search string stripped.
pub(crate) fn folder_url(url: &str) -> Option<String> {
	let path = omit_query(url);
	let path = path.strip_suffix('/').unwrap_or(path);
	let index = path.rfind('/')?;

	Some(path[..=index].to_string())
}

/// Canonical URL of an object under a folder: `folder + id + '/'` when both are
/// present, else the object's own `url` property. Any scalar identity works as
/// the path segment, numeric or not.
pub(crate) fn object_url(folder_url: &str, object: &Value) -> Option<String> {
	if let Some(id) = object.get("id").and_then(id_segment) {
		let folder = omit_query(folder_url);
		let folder = folder.strip_suffix('/').unwrap_or(folder);

		Some(format!("{folder}/{id}/"))
	} else {
		object.get("url").and_then(Value::as_str).map(str::to_string)
	}
}

/// Render an identity key into a path segment; compound values carry no
/// meaning there.
fn id_segment(id: &Value) -> Option<String> {
	match id {
		Value::Number(id) => Some(id.to_string()),
		Value::String(id) if !id.is_empty() => Some(id.clone()),
		_ => None,
	}
}

/// Folder URL an object belongs to, derived from its canonical object URL.
pub(crate) fn object_folder_url(folder: &str, object: &Value) -> Option<String> {
	folder_url(&object_url(folder, object)?)
}

/// Append the page query parameter; page one is the bare URL.
pub(crate) fn attach_page_number(url: &str, page: u32) -> String {
	if page <= 1 {
		url.to_string()
	} else if url.contains('?') {
		format!("{url}&page={page}")
	} else {
		format!("{url}?page={page}")
	}
}

/// Whether `url` equals `prefix` or is a sub-path of it, with a slash boundary.
pub(crate) fn match_url(url: &str, prefix: &str) -> bool {
	let url = omit_query(url);

	if url == prefix {
		return true;
	}

	match url.strip_prefix(prefix) {
		Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
		None => false,
	}
}

/// Whether `url` falls under any of the given prefixes.
pub(crate) fn match_any_url(url: &str, prefixes: &[String]) -> bool {
	prefixes.iter().any(|prefix| match_url(url, prefix))
}

/// Integer identifier in the trailing path segment of a canonical object URL.
pub(crate) fn trailing_id(url: &str) -> Option<i64> {
	let path = omit_query(url);
	let path = path.strip_suffix('/').unwrap_or(path);
	let index = path.rfind('/')?;

	path[index + 1..].parse().ok()
}

/// Rewrite a plain-HTTP URL to HTTPS.
pub(crate) fn rewrite_https(url: &str) -> String {
	match url.strip_prefix("http://") {
		Some(rest) => format!("https://{rest}"),
		None => url.to_string(),
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[test]
	fn folder_url_walks_up_one_segment() {
		assert_eq!(folder_url("/api/items/5/").as_deref(), Some("/api/items/"));
		assert_eq!(folder_url("/api/items/").as_deref(), Some("/api/"));
		assert_eq!(folder_url("/api/items/5/?page=2").as_deref(), Some("/api/items/"));
	}

	#[test]
	fn object_url_prefers_the_id_over_the_url_property() {
		let with_id = json!({ "id": 7, "url": "/elsewhere/7/" });
		let with_url = json!({ "url": "/api/items/9/" });

		assert_eq!(object_url("/api/items/", &with_id).as_deref(), Some("/api/items/7/"));
		assert_eq!(object_url("/api/items/", &with_url).as_deref(), Some("/api/items/9/"));
		assert_eq!(object_url("/api/items/", &json!({ "name": "x" })), None);
	}

	#[test]
	fn object_url_accepts_non_numeric_identities() {
		let uuid = json!({ "id": "0b54ab7e-dc44" });

		assert_eq!(object_url("/api/items/", &uuid).as_deref(), Some("/api/items/0b54ab7e-dc44/"));
		assert_eq!(object_url("/api/items/", &json!({ "id": "" })), None);
	}

	#[test]
	fn attach_page_number_skips_page_one() {
		assert_eq!(attach_page_number("/api/items/", 1), "/api/items/");
		assert_eq!(attach_page_number("/api/items/", 3), "/api/items/?page=3");
		assert_eq!(attach_page_number("/api/items/?sort=name", 2), "/api/items/?sort=name&page=2");
	}

	#[test]
	fn match_url_requires_a_slash_boundary() {
		assert!(match_url("/api/items/", "/api/items/"));
		assert!(match_url("/api/items/5/", "/api/items/"));
		assert!(match_url("/api/items/?page=2", "/api/items/"));
		assert!(!match_url("/api/itemsets/", "/api/items"));
		assert!(!match_url("/api/", "/api/items/"));
	}

	#[test]
	fn trailing_id_parses_only_numeric_segments() {
		assert_eq!(trailing_id("/api/items/42/"), Some(42));
		assert_eq!(trailing_id("/api/items/current/"), None);
	}

	#[test]
	fn add_trailing_slash_preserves_the_search_string() {
		assert_eq!(add_trailing_slash("/api/items"), "/api/items/");
		assert_eq!(add_trailing_slash("/api/items?page=2"), "/api/items/?page=2");
		assert_eq!(add_trailing_slash("/api/items/"), "/api/items/");
	}
}
