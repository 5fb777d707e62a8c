//! Integration tests for write propagation: insert, update, and delete hooks.

// std
use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use async_trait::async_trait;
use rest_cache::{DataSource, Error, EventHandler, FetchOptions, Hook, Result};
use serde_json::{Value, json};
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{method, path},
};

#[derive(Default)]
struct ChangeCounter {
	count: AtomicUsize,
}
#[async_trait]
impl EventHandler for ChangeCounter {
	async fn change(&self, _: &DataSource) {
		self.count.fetch_add(1, Ordering::SeqCst);
	}
}

async fn source_for(server: &MockServer) -> Result<DataSource> {
	let source = DataSource::builder().base_url(format!("{}/api/", server.uri())).build()?;

	source.activate().await;

	Ok(source)
}

/// Mount a folder whose GET reflects a shared item store and whose POST
/// appends to it.
async fn mount_folder(server: &MockServer, items: Arc<Mutex<Vec<Value>>>) {
	let store = items.clone();

	Mock::given(method("GET")).and(path("/api/items/")).respond_with(move |_: &Request| {
		let items = store.lock().expect("store").clone();

		ResponseTemplate::new(200).set_body_json(Value::Array(items))
	})
	.mount(server)
	.await;

	let store = items.clone();

	Mock::given(method("POST")).and(path("/api/items/")).respond_with(move |request: &Request| {
		let mut created: Value = serde_json::from_slice(&request.body).expect("json body");

		if created.get("id").is_none() {
			let mut items = store.lock().expect("store");
			let id = items.len() as i64 + 1;

			created["id"] = json!(id);
			items.push(created.clone());
		} else {
			store.lock().expect("store").push(created.clone());
		}

		ResponseTemplate::new(201).set_body_json(created)
	})
	.mount(server)
	.await;
}

fn seed() -> Vec<Value> {
	vec![
		json!({ "id": 1, "name": "a" }),
		json!({ "id": 2, "name": "b" }),
		json!({ "id": 3, "name": "c" }),
	]
}

#[tokio::test]
async fn insert_with_the_default_hook_expires_the_list() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let items = Arc::new(Mutex::new(seed()));

	mount_folder(&server, items).await;

	let source = source_for(&server).await?;
	let counter = Arc::new(ChangeCounter::default());
	let list = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(list.len(), 3);
	source.add_event_handler(counter.clone()).await;

	let created = source.insert_one("items/", json!({ "id": 4, "name": "d" })).await?;

	assert_eq!(created.get("id").and_then(Value::as_i64), Some(4));
	assert_eq!(counter.count.load(Ordering::SeqCst), 1);
	// The created object is immediately readable without another request.
	assert!(source.is_cached("items/4/", false).await?);

	// The expired list serves stale and refreshes in the background.
	let stale = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(stale.len(), 3);

	tokio::time::sleep(Duration::from_millis(300)).await;

	let refreshed = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(refreshed.len(), 4);

	Ok(())
}

#[tokio::test]
async fn insert_with_the_push_hook_appends_without_a_refetch() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let items = Arc::new(Mutex::new(seed()));

	mount_folder(&server, items).await;

	let source = source_for(&server).await?;
	let options = FetchOptions { after_insert: Some(Hook::Push), ..Default::default() };
	let list = source.fetch_list("items/", options.clone()).await?;

	assert_eq!(list.len(), 3);

	source.insert_one("items/", json!({ "id": 4, "name": "d" })).await?;

	let grown = source.fetch_list("items/", options).await?;

	assert_eq!(grown.len(), 4);
	assert_eq!(grown.total(), 4);
	assert_eq!(
		grown.objects()[3].get("name").and_then(Value::as_str),
		Some("d"),
		"pushed entries land at the tail"
	);

	Ok(())
}

#[tokio::test]
async fn update_replaces_the_cached_object_in_place() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/items/1/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "name": "old" })))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("PUT"))
		.and(path("/api/items/1/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "name": "x" })))
		.expect(1)
		.mount(&server)
		.await;

	let source = source_for(&server).await?;
	let counter = Arc::new(ChangeCounter::default());

	source.fetch_one("items/1/", FetchOptions::default()).await?;
	source.add_event_handler(counter.clone()).await;

	let updated = source.update_one("items/", json!({ "id": 1, "name": "x" })).await?;

	assert_eq!(updated.get("name").and_then(Value::as_str), Some("x"));
	assert_eq!(counter.count.load(Ordering::SeqCst), 1);

	let cached = source.fetch_one("items/1/", FetchOptions::default()).await?;

	assert_eq!(cached.get("name").and_then(Value::as_str), Some("x"));

	server.verify().await;
	Ok(())
}

#[tokio::test]
async fn delete_removes_the_object_query() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/items/5/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 5, "name": "e" })))
		.mount(&server)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/api/items/5/"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;

	let source = source_for(&server).await?;

	source.fetch_one("items/5/", FetchOptions::default()).await?;

	assert!(source.is_cached("items/5/", false).await?);

	source.delete_one("items/", json!({ "id": 5 })).await?;

	assert!(!source.is_cached("items/5/", false).await?);

	server.verify().await;
	Ok(())
}

#[tokio::test]
async fn delete_filters_list_entries_with_the_default_hook() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let items = Arc::new(Mutex::new(seed()));

	mount_folder(&server, items).await;
	Mock::given(method("DELETE"))
		.and(path("/api/items/2/"))
		.respond_with(ResponseTemplate::new(204))
		.mount(&server)
		.await;

	let source = source_for(&server).await?;
	let list = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(list.len(), 3);

	source.delete_one("items/", json!({ "id": 2 })).await?;

	let filtered = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(filtered.len(), 2);
	assert_eq!(filtered.total(), 2);
	assert!(filtered.objects().iter().all(|object| object.get("id").and_then(Value::as_i64) != Some(2)));

	Ok(())
}

#[tokio::test]
async fn custom_hooks_decide_the_cache_update() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let items = Arc::new(Mutex::new(seed()));

	mount_folder(&server, items).await;

	let source = source_for(&server).await?;
	let prepend: rest_cache::HookFn = Arc::new(|context| match context {
		rest_cache::HookContext::List { cached, fresh } => {
			let mut objects: Vec<Value> =
				fresh.iter().map(|object| (**object).clone()).collect();

			objects.extend(cached.iter().map(|object| (**object).clone()));

			Ok(rest_cache::HookAction::ReplaceList(objects))
		},
		rest_cache::HookContext::Object { .. } => Ok(rest_cache::HookAction::Unchanged),
	});
	let hook = Hook::Custom(prepend);
	let options = FetchOptions { after_insert: Some(hook), ..Default::default() };

	source.fetch_list("items/", options.clone()).await?;
	source.insert_one("items/", json!({ "id": 4, "name": "d" })).await?;

	let list = source.fetch_list("items/", options).await?;

	assert_eq!(list.len(), 4);
	assert_eq!(
		list.objects()[0].get("name").and_then(Value::as_str),
		Some("d"),
		"the custom hook prepends fresh entries"
	);

	Ok(())
}

#[tokio::test]
async fn unshift_hooks_are_rejected_on_object_queries() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let source = source_for(&server).await?;
	let options = FetchOptions { after_insert: Some(Hook::Unshift), ..Default::default() };
	let err = source.fetch_one("items/1/", options).await.unwrap_err();

	assert!(matches!(err, Error::Validation { field: "after_insert", .. }));

	Ok(())
}

#[tokio::test]
async fn string_identity_keys_flow_through_every_write() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/items/"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!([{ "id": "abc-123", "name": "a" }])),
		)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/api/items/abc-123/"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(json!({ "id": "abc-123", "name": "a" })),
		)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/api/items/"))
		.respond_with(
			ResponseTemplate::new(201).set_body_json(json!({ "id": "def-456", "name": "d" })),
		)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("PUT"))
		.and(path("/api/items/abc-123/"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(json!({ "id": "abc-123", "name": "x" })),
		)
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/api/items/def-456/"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&server)
		.await;

	let source = source_for(&server).await?;
	let options = FetchOptions { after_insert: Some(Hook::Push), ..Default::default() };
	let list = source.fetch_list("items/", options.clone()).await?;

	assert_eq!(list.len(), 1);

	source.fetch_one("items/abc-123/", FetchOptions::default()).await?;

	// Insert propagates into the list and registers a readable object query.
	source.insert_one("items/", json!({ "id": "def-456", "name": "d" })).await?;

	let grown = source.fetch_list("items/", options).await?;

	assert_eq!(grown.len(), 2);
	assert_eq!(grown.objects()[1].get("id").and_then(Value::as_str), Some("def-456"));
	assert!(source.is_cached("items/def-456/", false).await?);

	// Update addresses the item endpoint by its string id and replaces the
	// cached object in place.
	let updated = source.update_one("items/", json!({ "id": "abc-123", "name": "x" })).await?;

	assert_eq!(updated.get("name").and_then(Value::as_str), Some("x"));

	let cached = source.fetch_one("items/abc-123/", FetchOptions::default()).await?;

	assert_eq!(cached.get("name").and_then(Value::as_str), Some("x"));

	// Delete addresses the item endpoint the same way and drops the query.
	source.delete_one("items/", json!({ "id": "def-456" })).await?;

	assert!(!source.is_cached("items/def-456/", false).await?);

	server.verify().await;
	Ok(())
}

#[tokio::test]
async fn batch_errors_carry_aligned_results_and_expire_rejected_entries() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let items = Arc::new(Mutex::new(seed()));

	mount_folder(&server, items).await;
	Mock::given(method("PUT"))
		.and(path("/api/items/1/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "name": "a2" })))
		.mount(&server)
		.await;
	Mock::given(method("PUT"))
		.and(path("/api/items/2/"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let source = source_for(&server).await?;

	source.fetch_list("items/", FetchOptions::default()).await?;

	let err = source
		.update_multiple(
			"items/",
			vec![json!({ "id": 1, "name": "a2" }), json!({ "id": 2, "name": "b2" })],
		)
		.await
		.unwrap_err();

	match err {
		Error::Batch { first, results, errors } => {
			assert_eq!(first.status().map(|status| status.as_u16()), Some(404));
			assert_eq!(results.len(), 2);
			assert!(results[0].is_some() && results[1].is_none());
			assert!(errors[0].is_none() && errors[1].is_some());
		},
		other => panic!("expected a batch error, got {other:?}"),
	}

	// The rejected entity expires the list; the next read refreshes it.
	let stale = source.fetch_list("items/", FetchOptions::default()).await?;

	assert_eq!(stale.len(), 3);

	tokio::time::sleep(Duration::from_millis(300)).await;
	Ok(())
}
