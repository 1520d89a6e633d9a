//! Feature-flag document handling.
//!
//! Flags are JSON documents stored under a reserved key prefix and content
//! type; the provider parses them, optionally annotates telemetry metadata,
//! and publishes them under the reserved `feature_management` key. Flag
//! evaluation itself is left to downstream feature-management libraries.

// crates.io
use serde_json::{Map, Value};
use url::Url;
// self
use crate::{adapter::parse_json_lenient, setting::ConfigurationSetting};

const TIME_WINDOW_FILTER_NAMES: [&str; 4] =
	["TimeWindow", "Microsoft.TimeWindow", "TimeWindowFilter", "Microsoft.TimeWindowFilter"];
const TARGETING_FILTER_NAMES: [&str; 4] =
	["Targeting", "Microsoft.Targeting", "TargetingFilter", "Microsoft.TargetingFilter"];

/// Aggregate feature-flag usage observed on the last flag load.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureFlagUsage {
	/// A flag uses a filter that is neither time-window nor targeting.
	pub uses_custom_filter: bool,
	/// A flag uses a time-window filter.
	pub uses_time_window_filter: bool,
	/// A flag uses a targeting filter.
	pub uses_targeting_filter: bool,
	/// Largest variant count across all flags.
	pub max_variants: usize,
	/// A flag pins its allocation with a seed.
	pub uses_seed: bool,
	/// A flag has telemetry enabled.
	pub uses_telemetry: bool,
}
impl FeatureFlagUsage {
	/// Filter tags for the correlation context, in emission order.
	pub fn filter_tags(&self) -> Vec<&'static str> {
		let mut tags = Vec::new();

		if self.uses_custom_filter {
			tags.push("CSTM");
		}
		if self.uses_time_window_filter {
			tags.push("TIME");
		}
		if self.uses_targeting_filter {
			tags.push("TRGT");
		}

		tags
	}

	/// Flag-feature tags for the correlation context, in emission order.
	pub fn feature_tags(&self) -> Vec<&'static str> {
		let mut tags = Vec::new();

		if self.uses_seed {
			tags.push("Seed");
		}
		if self.uses_telemetry {
			tags.push("Telemetry");
		}

		tags
	}

	/// Fold one parsed flag document into the aggregates.
	pub fn observe(&mut self, flag: &Value) {
		if let Some(filters) = flag
			.pointer("/conditions/client_filters")
			.and_then(Value::as_array)
		{
			for filter in filters {
				match filter.get("name").and_then(Value::as_str) {
					Some(name) if TIME_WINDOW_FILTER_NAMES.contains(&name) =>
						self.uses_time_window_filter = true,
					Some(name) if TARGETING_FILTER_NAMES.contains(&name) =>
						self.uses_targeting_filter = true,
					Some(_) => self.uses_custom_filter = true,
					None => {},
				}
			}
		}
		if let Some(variants) = flag.get("variants").and_then(Value::as_array) {
			self.max_variants = self.max_variants.max(variants.len());
		}
		if flag.pointer("/allocation/seed").is_some_and(|seed| !seed.is_null()) {
			self.uses_seed = true;
		}
		if flag.pointer("/telemetry/enabled").and_then(Value::as_bool) == Some(true) {
			self.uses_telemetry = true;
		}
	}
}

/// Parse a feature-flag setting into its JSON document.
///
/// Returns `None` when the value is absent or does not parse as a JSON
/// object; such flags are skipped.
pub fn parse_feature_flag(setting: &ConfigurationSetting) -> Option<Value> {
	let value = setting.value.as_deref()?;

	match parse_json_lenient(value) {
		Ok(document @ Value::Object(_)) => Some(document),
		Ok(_) | Err(_) => {
			tracing::warn!(key = %setting.key, "skipping malformed feature flag document");

			None
		},
	}
}

/// Canonical reference URI for a flag: `{origin}/kv/{key}[?label={label}]`.
pub fn feature_flag_reference(endpoint: &Url, key: &str, label: Option<&str>) -> String {
	let origin = endpoint.origin().ascii_serialization();
	let mut reference = format!("{origin}/kv/{key}");

	if let Some(label) = label
		&& !label.is_empty()
	{
		reference.push_str("?label=");
		reference.push_str(label);
	}

	reference
}

/// Attach `ETag` and `FeatureFlagReference` telemetry metadata to a flag
/// whose telemetry is enabled.
pub fn annotate_telemetry(flag: &mut Value, etag: Option<&str>, reference: String) {
	if flag.pointer("/telemetry/enabled").and_then(Value::as_bool) != Some(true) {
		return;
	}

	let Some(telemetry) = flag.get_mut("telemetry").and_then(Value::as_object_mut) else {
		return;
	};
	let metadata = telemetry
		.entry("metadata")
		.or_insert_with(|| Value::Object(Map::new()));

	if let Some(metadata) = metadata.as_object_mut() {
		if let Some(etag) = etag {
			metadata.insert("ETag".into(), Value::String(etag.into()));
		}

		metadata.insert("FeatureFlagReference".into(), Value::String(reference));
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use serde_json::json;
	// self
	use super::*;

	#[test]
	fn usage_aggregates_cover_filters_variants_and_telemetry() {
		let mut usage = FeatureFlagUsage::default();

		usage.observe(&json!({
			"id": "beta",
			"conditions": { "client_filters": [
				{ "name": "Microsoft.TimeWindow" },
				{ "name": "Ring" }
			]},
			"variants": [{ "name": "on" }, { "name": "off" }, { "name": "half" }],
			"allocation": { "seed": 7 },
			"telemetry": { "enabled": true }
		}));
		usage.observe(&json!({
			"id": "gamma",
			"conditions": { "client_filters": [{ "name": "Microsoft.Targeting" }] }
		}));

		assert_eq!(usage.filter_tags(), vec!["CSTM", "TIME", "TRGT"]);
		assert_eq!(usage.feature_tags(), vec!["Seed", "Telemetry"]);
		assert_eq!(usage.max_variants, 3);
	}

	#[test]
	fn reference_uri_carries_the_label_query() {
		let endpoint = Url::parse("https://store.azconfig.io").unwrap();

		assert_eq!(
			feature_flag_reference(&endpoint, ".appconfig.featureflag/beta", None),
			"https://store.azconfig.io/kv/.appconfig.featureflag/beta"
		);
		assert_eq!(
			feature_flag_reference(&endpoint, ".appconfig.featureflag/beta", Some("Prod")),
			"https://store.azconfig.io/kv/.appconfig.featureflag/beta?label=Prod"
		);
	}

	#[test]
	fn telemetry_annotation_only_touches_enabled_flags() {
		let mut enabled = json!({ "id": "beta", "telemetry": { "enabled": true } });

		annotate_telemetry(&mut enabled, Some("v1"), "ref".into());

		assert_eq!(enabled.pointer("/telemetry/metadata/ETag"), Some(&json!("v1")));
		assert_eq!(enabled.pointer("/telemetry/metadata/FeatureFlagReference"), Some(&json!("ref")));

		let mut disabled = json!({ "id": "beta" });

		annotate_telemetry(&mut disabled, Some("v1"), "ref".into());

		assert_eq!(disabled.pointer("/telemetry"), None);
	}
}
