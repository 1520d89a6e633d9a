//! Configuration setting wire model and content-type classification.

// std
use std::collections::HashMap;
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Key prefix reserved for feature-flag settings.
pub const FEATURE_FLAG_KEY_PREFIX: &str = ".appconfig.featureflag/";
/// Reserved top-level key under which feature-flag documents are published.
pub const FEATURE_MANAGEMENT_KEY: &str = "feature_management";
/// Key of the flag list inside the `feature_management` section.
pub const FEATURE_FLAGS_KEY: &str = "feature_flags";
/// Content type marking a setting as a feature-flag document.
pub const FEATURE_FLAG_CONTENT_TYPE: &str = "application/vnd.microsoft.appconfig.ff+json";
/// Content type marking a setting as a Key-Vault secret reference.
pub const SECRET_REFERENCE_CONTENT_TYPE: &str =
	"application/vnd.microsoft.appconfig.keyvaultref+json";
/// Content type marking a setting as a reference to a server-side snapshot.
pub const SNAPSHOT_REFERENCE_CONTENT_TYPE: &str =
	"application/vnd.microsoft.appconfig.snapshotref+json";
/// Sentinel filter matching settings that carry no label.
pub const NULL_LABEL: &str = "\0";

/// One remote key-value record.
///
/// Equality for change detection is defined by `etag`; two settings with the
/// same etag are the same revision regardless of the remaining fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigurationSetting {
	/// Full key of the setting, including any application prefix.
	pub key: String,
	/// Label the setting is stored under; `None` for the null label.
	#[serde(default)]
	pub label: Option<String>,
	/// Raw string value; `None` when the setting has no value.
	#[serde(default)]
	pub value: Option<String>,
	/// MIME content type driving adapter selection.
	#[serde(default)]
	pub content_type: Option<String>,
	/// Entity tag identifying the stored revision.
	#[serde(default)]
	pub etag: Option<String>,
	/// Free-form tags attached to the setting.
	#[serde(default)]
	pub tags: HashMap<String, String>,
	/// Server-side modification timestamp.
	#[serde(default)]
	pub last_modified: Option<DateTime<Utc>>,
}
impl ConfigurationSetting {
	/// Whether this record is a feature-flag document.
	pub fn is_feature_flag(&self) -> bool {
		self.key.starts_with(FEATURE_FLAG_KEY_PREFIX)
			&& mime_of(self.content_type.as_deref()) == Some(FEATURE_FLAG_CONTENT_TYPE.into())
	}

	/// Whether this record is a Key-Vault secret reference.
	pub fn is_secret_reference(&self) -> bool {
		mime_of(self.content_type.as_deref()) == Some(SECRET_REFERENCE_CONTENT_TYPE.into())
	}

	/// Whether this record references a server-side snapshot.
	pub fn is_snapshot_reference(&self) -> bool {
		mime_of(self.content_type.as_deref()) == Some(SNAPSHOT_REFERENCE_CONTENT_TYPE.into())
	}

	/// Whether the value is eligible for JSON parsing.
	///
	/// Any `application/…+json` type qualifies except the reserved
	/// feature-flag and secret-reference types.
	pub fn is_json_content_type(&self) -> bool {
		let Some(mime) = mime_of(self.content_type.as_deref()) else {
			return false;
		};

		if mime == FEATURE_FLAG_CONTENT_TYPE
			|| mime == SECRET_REFERENCE_CONTENT_TYPE
			|| mime == SNAPSHOT_REFERENCE_CONTENT_TYPE
		{
			return false;
		}

		let Some(subtype) = mime.strip_prefix("application/") else {
			return false;
		};

		subtype == "json" || subtype.ends_with("+json")
	}
}

fn mime_of(content_type: Option<&str>) -> Option<String> {
	let essence = content_type?.split(';').next()?.trim();

	if essence.is_empty() { None } else { Some(essence.to_ascii_lowercase()) }
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn setting(content_type: Option<&str>) -> ConfigurationSetting {
		ConfigurationSetting {
			key: "app.settings.fontColor".into(),
			label: None,
			value: Some("red".into()),
			content_type: content_type.map(str::to_string),
			etag: Some("abc".into()),
			tags: HashMap::new(),
			last_modified: None,
		}
	}

	#[test]
	fn json_content_types_are_classified() {
		assert!(setting(Some("application/json")).is_json_content_type());
		assert!(setting(Some("application/json; charset=utf-8")).is_json_content_type());
		assert!(setting(Some("application/activity+json")).is_json_content_type());
		assert!(!setting(Some("text/json")).is_json_content_type());
		assert!(!setting(Some("application/octet-stream")).is_json_content_type());
		assert!(!setting(None).is_json_content_type());
	}

	#[test]
	fn reserved_content_types_are_not_json() {
		assert!(!setting(Some(FEATURE_FLAG_CONTENT_TYPE)).is_json_content_type());
		assert!(!setting(Some(SECRET_REFERENCE_CONTENT_TYPE)).is_json_content_type());
		assert!(!setting(Some(SNAPSHOT_REFERENCE_CONTENT_TYPE)).is_json_content_type());
	}

	#[test]
	fn feature_flags_require_prefix_and_content_type() {
		let mut flag = setting(Some(FEATURE_FLAG_CONTENT_TYPE));

		assert!(!flag.is_feature_flag());

		flag.key = format!("{FEATURE_FLAG_KEY_PREFIX}beta");

		assert!(flag.is_feature_flag());
	}
}
