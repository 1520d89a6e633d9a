//! Construction of a nested configuration object from the flat map.

// crates.io
use indexmap::IndexMap;
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// Separators accepted by [`construct`].
pub const ALLOWED_SEPARATORS: [&str; 8] = [".", ",", ";", "-", "_", "__", "/", ":"];

/// Convert the flat configuration map into a nested JSON object by splitting
/// each key on `separator`.
///
/// Numeric-only segments stay object keys. Construction fails with
/// [`Error::InvalidKey`] on an empty path segment and with
/// [`Error::AmbiguousPath`] when a key's path collides with an existing
/// value, as with `a.b` alongside `a.b.c`.
pub fn construct(map: &IndexMap<String, Value>, separator: &str) -> Result<Value> {
	if !ALLOWED_SEPARATORS.contains(&separator) {
		return Err(Error::InvalidArgument {
			field: "separator",
			reason: format!("'{separator}' is not one of {ALLOWED_SEPARATORS:?}."),
		});
	}

	let mut root = Map::new();

	for (key, value) in map {
		insert_path(&mut root, key, separator, value)?;
	}

	Ok(Value::Object(root))
}

fn insert_path(root: &mut Map<String, Value>, key: &str, separator: &str, value: &Value) -> Result<()> {
	let segments = key.split(separator).collect::<Vec<_>>();

	if segments.iter().any(|segment| segment.is_empty()) {
		return Err(Error::InvalidKey {
			key: key.to_string(),
			reason: format!("The key contains an empty segment when split on '{separator}'."),
		});
	}

	let (leaf, path) = segments.split_last().expect("split always yields one segment");
	let mut current = root;

	for segment in path {
		let slot = current
			.entry(segment.to_string())
			.or_insert_with(|| Value::Object(Map::new()));

		match slot {
			Value::Object(next) => current = next,
			_ => return Err(Error::AmbiguousPath { key: key.to_string() }),
		}
	}

	if current.contains_key(*leaf) {
		return Err(Error::AmbiguousPath { key: key.to_string() });
	}

	current.insert(leaf.to_string(), value.clone());

	Ok(())
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	fn map(entries: &[(&str, Value)]) -> IndexMap<String, Value> {
		entries.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
	}

	#[test]
	fn nests_keys_on_the_separator() {
		let flat = map(&[
			("app.settings.fontColor", json!("red")),
			("app.settings.fontSize", json!(40)),
			("app.name", json!("demo")),
		]);
		let tree = construct(&flat, ".").unwrap();

		assert_eq!(
			tree,
			json!({
				"app": {
					"settings": { "fontColor": "red", "fontSize": 40 },
					"name": "demo"
				}
			})
		);
	}

	#[test]
	fn round_trips_a_serialized_tree() {
		let flat = map(&[
			("database/host", json!("localhost")),
			("database/port", json!(5432)),
			("cache/ttl", json!(60)),
		]);
		let tree = construct(&flat, "/").unwrap();

		assert_eq!(
			tree,
			json!({
				"database": { "host": "localhost", "port": 5432 },
				"cache": { "ttl": 60 }
			})
		);
	}

	#[test]
	fn leaf_under_existing_subtree_is_ambiguous() {
		let flat = map(&[("a.b", json!("x")), ("a.b.c", json!("y"))]);
		let err = construct(&flat, ".").unwrap_err();

		assert!(matches!(err, Error::AmbiguousPath { .. }));

		let flat = map(&[("a.b.c", json!("y")), ("a.b", json!("x"))]);
		let err = construct(&flat, ".").unwrap_err();

		assert!(matches!(err, Error::AmbiguousPath { .. }));
	}

	#[test]
	fn empty_segments_are_invalid() {
		let flat = map(&[("a..b", json!("x"))]);

		assert!(matches!(construct(&flat, ".").unwrap_err(), Error::InvalidKey { .. }));

		let flat = map(&[(".a", json!("x"))]);

		assert!(matches!(construct(&flat, ".").unwrap_err(), Error::InvalidKey { .. }));
	}

	#[test]
	fn unknown_separators_are_rejected() {
		let flat = map(&[("a|b", json!("x"))]);

		assert!(matches!(construct(&flat, "|").unwrap_err(), Error::InvalidArgument { .. }));
	}

	#[test]
	fn numeric_segments_stay_object_keys() {
		let flat = map(&[("servers.0", json!("alpha")), ("servers.1", json!("beta"))]);
		let tree = construct(&flat, ".").unwrap();

		assert_eq!(tree, json!({ "servers": { "0": "alpha", "1": "beta" } }));
	}
}
