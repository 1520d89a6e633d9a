//! Initial-load behaviour over HTTP.

// crates.io
use appconfig_provider::{ConfigurationProvider, Error, ProviderOptions, SettingSelector};
use serde_json::json;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

fn kv_page(items: serde_json::Value, page_etag: &str) -> ResponseTemplate {
	ResponseTemplate::new(200)
		.set_body_json(json!({ "items": items }))
		.insert_header("etag", page_etag)
}

async fn start_store(items: serde_json::Value) -> MockServer {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/kv"))
		.respond_with(kv_page(items, "page-1"))
		.mount(&server)
		.await;

	server
}

fn connection_string(server: &MockServer) -> String {
	format!("Endpoint={};Id=test-id;Secret=c2VjcmV0", server.uri())
}

fn options() -> ProviderOptions {
	ProviderOptions::new().with_replica_discovery(false)
}

#[tokio::test]
async fn load_with_connection_string_materializes_settings() {
	let _ = tracing_subscriber::fmt::try_init();

	let server = start_store(json!([
		{ "key": "app.settings.fontColor", "value": "red", "etag": "e1" },
		{ "key": "app.settings.fontSize", "value": "40", "etag": "e2" }
	]))
	.await;
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options())
			.await
			.unwrap();

	assert_eq!(provider.get("app.settings.fontColor"), Some(json!("red")));
	assert_eq!(provider.get("app.settings.fontSize"), Some(json!("40")));
	assert_eq!(provider.len(), 2);
	assert!(provider.has("app.settings.fontColor"));
	assert!(!provider.has("app.settings.fontFamily"));
}

#[tokio::test]
async fn selectors_and_trim_prefixes_shape_the_keys() {
	let server = start_store(json!([
		{ "key": "app.settings.fontColor", "value": "red", "etag": "e1" }
	]))
	.await;
	let options = options()
		.with_selectors([SettingSelector::new("app.settings.*", "\0")])
		.with_trim_key_prefixes(["app.settings."]);
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options)
			.await
			.unwrap();

	assert_eq!(provider.get("fontColor"), Some(json!("red")));
	assert!(!provider.has("app.settings.fontColor"));
}

#[tokio::test]
async fn json_content_types_parse_into_trees() {
	let server = start_store(json!([
		{
			"key": "app.json",
			"value": "{\"Test\":{\"Level\":\"Debug\"}}",
			"content_type": "application/json",
			"etag": "e1"
		},
		{
			"key": "app.broken",
			"value": "{not json",
			"content_type": "application/json",
			"etag": "e2"
		}
	]))
	.await;
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options())
			.await
			.unwrap();

	assert_eq!(
		provider.get("app.json").unwrap().pointer("/Test/Level"),
		Some(&json!("Debug"))
	);
	// Parse failures fall back to the raw string.
	assert_eq!(provider.get("app.broken"), Some(json!("{not json")));
}

#[tokio::test]
async fn configuration_object_construction_round_trips_and_rejects_collisions() {
	let server = start_store(json!([
		{ "key": "app.settings.fontColor", "value": "red", "etag": "e1" },
		{ "key": "app.settings.fontSize", "value": "40", "etag": "e2" }
	]))
	.await;
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options())
			.await
			.unwrap();
	let tree = provider.construct_configuration_object(None).unwrap();

	assert_eq!(
		tree,
		json!({ "app": { "settings": { "fontColor": "red", "fontSize": "40" } } })
	);
	assert!(matches!(
		provider.construct_configuration_object(Some("|")).unwrap_err(),
		Error::InvalidArgument { .. }
	));

	let server = start_store(json!([
		{ "key": "a.b", "value": "x", "etag": "e1" },
		{ "key": "a.b.c", "value": "y", "etag": "e2" }
	]))
	.await;
	let provider =
		ConfigurationProvider::load_with_connection_string(&connection_string(&server), options())
			.await
			.unwrap();

	assert!(matches!(
		provider.construct_configuration_object(None).unwrap_err(),
		Error::AmbiguousPath { .. }
	));
}

#[tokio::test]
async fn malformed_connection_strings_are_rejected() {
	let err = ConfigurationProvider::load_with_connection_string(
		"Endpoint=https://store.azconfig.io;Id=abc",
		options(),
	)
	.await
	.unwrap_err();

	assert!(matches!(err, Error::InvalidArgument { .. }));
}
