//! Refresh behaviour over HTTP: sentinel polling and page-etag probing.

// std
use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use appconfig_provider::{
	ConfigurationProvider, ProviderOptions, RefreshOptions, WatchedSetting,
};
use serde_json::json;
use wiremock::{
	Mock, MockServer, Request, ResponseTemplate,
	matchers::{method, path},
};

fn connection_string(server: &MockServer) -> String {
	format!("Endpoint={};Id=test-id;Secret=c2VjcmV0", server.uri())
}

fn options() -> ProviderOptions {
	ProviderOptions::new().with_replica_discovery(false)
}

#[tokio::test]
async fn sentinel_change_reloads_and_notifies_once() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = MockServer::start().await;
	let list_counter = Arc::new(AtomicUsize::new(0));
	let list_handle = list_counter.clone();

	Mock::given(method("GET"))
		.and(path("/kv"))
		.respond_with(move |_: &Request| {
			let idx = list_handle.fetch_add(1, Ordering::SeqCst);
			let (color, etag) = if idx == 0 { ("red", "e1") } else { ("blue", "e2") };

			ResponseTemplate::new(200)
				.set_body_json(json!({
					"items": [{ "key": "app.settings.fontColor", "value": color, "etag": etag }]
				}))
				.insert_header("etag", "page-1")
		})
		.mount(&server)
		.await;

	let get_counter = Arc::new(AtomicUsize::new(0));
	let get_handle = get_counter.clone();

	Mock::given(method("GET"))
		.and(path("/kv/app.settings.fontColor"))
		.respond_with(move |request: &Request| {
			assert!(request.headers.contains_key("if-none-match"), "conditional header missing");

			match get_handle.fetch_add(1, Ordering::SeqCst) {
				0 => ResponseTemplate::new(200).set_body_json(json!({
					"key": "app.settings.fontColor",
					"value": "blue",
					"etag": "e2"
				})),
				_ => ResponseTemplate::new(304),
			}
		})
		.mount(&server)
		.await;

	let options = options().with_refresh(
		RefreshOptions::new()
			.with_interval(Duration::from_secs(2))
			.with_watched_settings([WatchedSetting::new("app.settings.fontColor")]),
	);
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options)
			.await
			.unwrap();
	let notified = Arc::new(AtomicUsize::new(0));
	let counter = notified.clone();
	let _guard = provider
		.on_refresh(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();

	// The gate is still closed; nothing is probed and nothing changes.
	provider.refresh().await.unwrap();

	assert_eq!(provider.get("app.settings.fontColor"), Some(json!("red")));
	assert_eq!(get_counter.load(Ordering::SeqCst), 0);

	tokio::time::sleep(Duration::from_millis(2_100)).await;
	provider.refresh().await.unwrap();

	assert_eq!(provider.get("app.settings.fontColor"), Some(json!("blue")));
	assert_eq!(notified.load(Ordering::SeqCst), 1);

	// A matching etag answers 304 and leaves the snapshot untouched.
	tokio::time::sleep(Duration::from_millis(2_100)).await;
	provider.refresh().await.unwrap();

	assert_eq!(notified.load(Ordering::SeqCst), 1);
	assert_eq!(list_counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn page_etag_probe_skips_reload_until_pages_change() {
	let server = MockServer::start().await;
	let state = Arc::new(Mutex::new((json!([{ "key": "app", "value": "one", "etag": "e1" }]), "page-1")));
	let responder_state = state.clone();

	Mock::given(method("GET"))
		.and(path("/kv"))
		.respond_with(move |request: &Request| {
			let (items, page_etag) = responder_state.lock().unwrap().clone();
			let presented = request
				.headers
				.get("if-none-match")
				.and_then(|value| value.to_str().ok())
				.map(str::to_string);

			if presented.as_deref() == Some(page_etag) {
				ResponseTemplate::new(304).insert_header("etag", page_etag)
			} else {
				ResponseTemplate::new(200)
					.set_body_json(json!({ "items": items }))
					.insert_header("etag", page_etag)
			}
		})
		.mount(&server)
		.await;

	let options = options()
		.with_refresh(RefreshOptions::new().with_interval(Duration::from_secs(1)));
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options)
			.await
			.unwrap();
	let notified = Arc::new(AtomicUsize::new(0));
	let counter = notified.clone();
	let _guard = provider
		.on_refresh(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();

	tokio::time::sleep(Duration::from_millis(1_100)).await;
	provider.refresh().await.unwrap();

	// All pages answered 304; no reload, no notification.
	assert_eq!(provider.get("app"), Some(json!("one")));
	assert_eq!(notified.load(Ordering::SeqCst), 0);

	*state.lock().unwrap() = (json!([{ "key": "app", "value": "two", "etag": "e2" }]), "page-2");

	tokio::time::sleep(Duration::from_millis(1_100)).await;
	provider.refresh().await.unwrap();

	assert_eq!(provider.get("app"), Some(json!("two")));
	assert_eq!(notified.load(Ordering::SeqCst), 1);
}
