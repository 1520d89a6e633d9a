//! Adapters transforming raw settings into configuration values.
//!
//! Adapters are consulted in order: secret references first, then JSON
//! parsing; a setting no adapter claims passes through as its raw string.
//! Snapshot references are expanded by the provider before adaptation since
//! they inline whole pages rather than a single value.

// crates.io
use serde_json::Value;
// self
use crate::{_prelude::*, secret::SecretProvider, setting::ConfigurationSetting};

/// One transformation step over a raw setting.
#[derive(Debug)]
pub(crate) enum KeyValueAdapter {
	/// Resolves Key-Vault secret references through the secret provider.
	SecretReference(Arc<SecretProvider>),
	/// Parses `application/…+json` values into JSON trees.
	Json,
}
impl KeyValueAdapter {
	/// Whether this adapter claims the given setting.
	pub fn can_process(&self, setting: &ConfigurationSetting) -> bool {
		match self {
			Self::SecretReference(_) => setting.is_secret_reference(),
			Self::Json => setting.is_json_content_type(),
		}
	}

	/// Transform the setting's value.
	pub async fn process(&self, setting: &ConfigurationSetting) -> Result<Value> {
		match self {
			Self::SecretReference(secrets) => {
				let resolved = resolve_secret(secrets, setting).await.map_err(|err| {
					Error::KeyVaultReference {
						key: setting.key.clone(),
						label: setting.label.clone(),
						source: Box::new(err),
					}
				})?;

				Ok(Value::String(resolved))
			},
			Self::Json => {
				let Some(raw) = setting.value.as_deref() else {
					return Ok(Value::Null);
				};

				// Unparsable bodies keep their raw string form.
				Ok(parse_json_lenient(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
			},
		}
	}
}

/// Run the setting through the first matching adapter, falling back to the
/// raw string (or null) when none claims it.
pub(crate) async fn adapt_setting(
	adapters: &[KeyValueAdapter],
	setting: &ConfigurationSetting,
) -> Result<Value> {
	for adapter in adapters {
		if adapter.can_process(setting) {
			return adapter.process(setting).await;
		}
	}

	Ok(setting.value.as_deref().map_or(Value::Null, |raw| Value::String(raw.to_string())))
}

async fn resolve_secret(
	secrets: &SecretProvider,
	setting: &ConfigurationSetting,
) -> Result<String> {
	let raw = setting.value.as_deref().ok_or_else(|| Error::InvalidArgument {
		field: "secret_reference",
		reason: "The setting has no value.".into(),
	})?;
	let reference = crate::secret::SecretReference::parse(raw)?;

	secrets.resolve(&reference).await
}

/// Parse JSON tolerating `//` line and `/* */` block comments.
pub(crate) fn parse_json_lenient(raw: &str) -> serde_json::Result<Value> {
	serde_json::from_str(raw).or_else(|err| {
		let stripped = strip_json_comments(raw);

		if stripped == raw { Err(err) } else { serde_json::from_str(&stripped) }
	})
}

fn strip_json_comments(raw: &str) -> String {
	#[derive(PartialEq)]
	enum State {
		Code,
		Str { escaped: bool },
		LineComment,
		BlockComment,
	}

	let mut output = String::with_capacity(raw.len());
	let mut state = State::Code;
	let mut chars = raw.chars().peekable();

	while let Some(c) = chars.next() {
		match state {
			State::Code => match c {
				'"' => {
					state = State::Str { escaped: false };
					output.push(c);
				},
				'/' if chars.peek() == Some(&'/') => {
					chars.next();
					state = State::LineComment;
					output.push_str("  ");
				},
				'/' if chars.peek() == Some(&'*') => {
					chars.next();
					state = State::BlockComment;
					output.push_str("  ");
				},
				_ => output.push(c),
			},
			State::Str { escaped } => {
				if !escaped && c == '"' {
					state = State::Code;
				} else {
					state = State::Str { escaped: !escaped && c == '\\' };
				}

				output.push(c);
			},
			State::LineComment => {
				if c == '\n' {
					state = State::Code;
					output.push(c);
				} else {
					output.push(' ');
				}
			},
			State::BlockComment => {
				if c == '*' && chars.peek() == Some(&'/') {
					chars.next();
					state = State::Code;
					output.push_str("  ");
				} else if c == '\n' {
					output.push(c);
				} else {
					output.push(' ');
				}
			},
		}
	}

	output
}

#[cfg(test)]
mod tests {
	// std
	use std::collections::HashMap;
	// crates.io
	use serde_json::json;
	// self
	use super::*;
	use crate::setting::SECRET_REFERENCE_CONTENT_TYPE;

	fn setting(value: &str, content_type: &str) -> ConfigurationSetting {
		ConfigurationSetting {
			key: "app.settings.config".into(),
			label: None,
			value: Some(value.into()),
			content_type: Some(content_type.into()),
			etag: Some("v1".into()),
			tags: HashMap::new(),
			last_modified: None,
		}
	}

	#[tokio::test]
	async fn json_values_become_trees() {
		let adapters = [KeyValueAdapter::Json];
		let value = adapt_setting(
			&adapters,
			&setting(r#"{"Test":{"Level":"Debug"}}"#, "application/json"),
		)
		.await
		.unwrap();

		assert_eq!(value, json!({ "Test": { "Level": "Debug" } }));
	}

	#[tokio::test]
	async fn unparsable_json_falls_back_to_the_raw_string() {
		let adapters = [KeyValueAdapter::Json];
		let value = adapt_setting(&adapters, &setting("{not json", "application/json"))
			.await
			.unwrap();

		assert_eq!(value, json!("{not json"));
	}

	#[tokio::test]
	async fn plain_settings_pass_through() {
		let adapters = [KeyValueAdapter::Json];
		let value = adapt_setting(&adapters, &setting("red", "text/plain")).await.unwrap();

		assert_eq!(value, json!("red"));
	}

	#[tokio::test]
	async fn unresolvable_secret_references_carry_setting_context() {
		let secrets = Arc::new(SecretProvider::new(Vec::new(), None, None));
		let adapters = [KeyValueAdapter::SecretReference(secrets), KeyValueAdapter::Json];
		let err = adapt_setting(
			&adapters,
			&setting(
				r#"{"secretId":"https://v.vault.azure.net/secrets/token"}"#,
				SECRET_REFERENCE_CONTENT_TYPE,
			),
		)
		.await
		.unwrap_err();

		assert!(matches!(err, Error::KeyVaultReference { .. }));
	}

	#[test]
	fn comments_are_tolerated_in_json() {
		let raw = r#"{
			// line comment
			"a": "b/c", /* block
			comment */ "url": "http://example.com"
		}"#;

		assert_eq!(
			parse_json_lenient(raw).unwrap(),
			json!({ "a": "b/c", "url": "http://example.com" })
		);
	}

	#[test]
	fn comment_markers_inside_strings_survive() {
		let raw = r#"{ "path": "a//b", "note": "c /* d */" }"#;

		assert_eq!(
			parse_json_lenient(raw).unwrap(),
			json!({ "path": "a//b", "note": "c /* d */" })
		);
	}
}
