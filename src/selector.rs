//! Setting selectors, paginated-etag bookkeeping, and watched settings.

// self
use crate::{
	_prelude::*,
	setting::{FEATURE_FLAG_KEY_PREFIX, NULL_LABEL},
};

/// Maximum number of tag filters a selector may carry.
pub const MAX_TAG_FILTERS: usize = 5;

/// Declarative filter over the remote store.
///
/// A selector is either a key/label/tag filter or a reference to a
/// server-side snapshot; the two forms are mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingSelector {
	/// Key filter; `*` is allowed only as a trailing wildcard.
	pub key_filter: String,
	/// Label filter; defaults to the null-label sentinel.
	pub label_filter: String,
	/// `name=value` tag filters, at most [`MAX_TAG_FILTERS`].
	pub tag_filters: Vec<String>,
	/// Name of a pre-materialized server-side snapshot.
	pub snapshot_name: Option<String>,
}
impl SettingSelector {
	/// Selector over a key filter and label filter.
	pub fn new(key_filter: impl Into<String>, label_filter: impl Into<String>) -> Self {
		Self {
			key_filter: key_filter.into(),
			label_filter: label_filter.into(),
			tag_filters: Vec::new(),
			snapshot_name: None,
		}
	}

	/// Selector over every key carrying the null label.
	pub fn all() -> Self {
		Self::new("*", NULL_LABEL)
	}

	/// Selector referring to a server-side snapshot.
	pub fn snapshot(name: impl Into<String>) -> Self {
		Self {
			key_filter: String::new(),
			label_filter: String::new(),
			tag_filters: Vec::new(),
			snapshot_name: Some(name.into()),
		}
	}

	/// Attach tag filters to this selector.
	pub fn with_tag_filters<I, S>(mut self, tag_filters: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.tag_filters = tag_filters.into_iter().map(Into::into).collect();

		self
	}

	/// Validate the selector against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if let Some(name) = &self.snapshot_name {
			if name.is_empty() {
				return Err(Error::InvalidArgument {
					field: "selector.snapshot_name",
					reason: "Must not be empty.".into(),
				});
			}
			if !self.key_filter.is_empty()
				|| !self.label_filter.is_empty()
				|| !self.tag_filters.is_empty()
			{
				return Err(Error::InvalidArgument {
					field: "selector.snapshot_name",
					reason: "Snapshot selectors cannot carry key, label, or tag filters.".into(),
				});
			}

			return Ok(());
		}

		if self.key_filter.is_empty() {
			return Err(Error::InvalidArgument {
				field: "selector.key_filter",
				reason: "Must not be empty.".into(),
			});
		}
		if let Some(index) = self.key_filter.find('*')
			&& index != self.key_filter.len() - 1
		{
			return Err(Error::InvalidArgument {
				field: "selector.key_filter",
				reason: "'*' is only allowed as a trailing wildcard.".into(),
			});
		}
		if self.label_filter.contains(',') {
			return Err(Error::InvalidArgument {
				field: "selector.label_filter",
				reason: "Must not contain ','.".into(),
			});
		}
		if self.label_filter.is_empty() {
			return Err(Error::InvalidArgument {
				field: "selector.label_filter",
				reason: "Must not be empty; use the null-label sentinel instead.".into(),
			});
		}
		if self.tag_filters.len() > MAX_TAG_FILTERS {
			return Err(Error::InvalidArgument {
				field: "selector.tag_filters",
				reason: format!("At most {MAX_TAG_FILTERS} tag filters are allowed."),
			});
		}
		for tag_filter in &self.tag_filters {
			let valid = tag_filter
				.split_once('=')
				.is_some_and(|(name, value)| !name.is_empty() && !value.is_empty());

			if !valid {
				return Err(Error::InvalidArgument {
					field: "selector.tag_filters",
					reason: format!("Tag filter '{tag_filter}' must have the form 'name=value'."),
				});
			}
		}

		Ok(())
	}

	fn dedup_key(&self) -> (String, String, Option<String>) {
		(self.key_filter.clone(), self.label_filter.clone(), self.snapshot_name.clone())
	}
}

/// A selector together with the page etags observed on its last successful
/// fetch; conditional listing against these etags is the cheap change probe.
#[derive(Clone, Debug)]
pub struct PagedSelector {
	/// The declarative filter.
	pub selector: SettingSelector,
	/// Etag of each page, in page order.
	pub page_etags: Vec<String>,
}
impl PagedSelector {
	fn new(selector: SettingSelector) -> Self {
		Self { selector, page_etags: Vec::new() }
	}
}

/// A `(key, label)` pair whose etag change triggers a reload of every
/// key-value selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedSetting {
	/// Literal key of the watched setting.
	pub key: String,
	/// Literal label, `None` for the null label.
	pub label: Option<String>,
	/// Etag recorded on the last load; `None` when the setting was absent.
	pub etag: Option<String>,
}
impl WatchedSetting {
	/// Watch a setting stored under the null label.
	pub fn new(key: impl Into<String>) -> Self {
		Self { key: key.into(), label: None, etag: None }
	}

	/// Watch a setting stored under the given label.
	pub fn with_label(key: impl Into<String>, label: impl Into<String>) -> Self {
		Self { key: key.into(), label: Some(label.into()), etag: None }
	}

	/// Validate that key and label are literal, without filter characters.
	pub fn validate(&self) -> Result<()> {
		if self.key.is_empty() {
			return Err(Error::InvalidArgument {
				field: "watched_setting.key",
				reason: "Must not be empty.".into(),
			});
		}
		if self.key.contains('*') || self.key.contains(',') {
			return Err(Error::InvalidArgument {
				field: "watched_setting.key",
				reason: "Must be a literal key without '*' or ','.".into(),
			});
		}
		if let Some(label) = &self.label
			&& (label.contains('*') || label.contains(','))
		{
			return Err(Error::InvalidArgument {
				field: "watched_setting.label",
				reason: "Must be a literal label without '*' or ','.".into(),
			});
		}

		Ok(())
	}
}

/// Normalize key-value selectors: default when empty, validate each, and
/// deduplicate by `(key_filter, label_filter, snapshot_name)` keeping the
/// later occurrence so later selectors keep precedence.
pub fn normalize_kv_selectors(selectors: Vec<SettingSelector>) -> Result<Vec<PagedSelector>> {
	let selectors = if selectors.is_empty() { vec![SettingSelector::all()] } else { selectors };

	dedup_last_wins(selectors)
}

/// Normalize feature-flag selectors: the reserved feature-flag prefix is
/// prepended to every key filter, defaulting to the full flag namespace.
pub fn normalize_ff_selectors(selectors: Vec<SettingSelector>) -> Result<Vec<PagedSelector>> {
	let selectors = if selectors.is_empty() { vec![SettingSelector::new("*", NULL_LABEL)] } else { selectors };
	let selectors = selectors
		.into_iter()
		.map(|mut selector| {
			if selector.snapshot_name.is_none() {
				selector.key_filter = format!("{FEATURE_FLAG_KEY_PREFIX}{}", selector.key_filter);
			}

			selector
		})
		.collect();

	dedup_last_wins(selectors)
}

fn dedup_last_wins(selectors: Vec<SettingSelector>) -> Result<Vec<PagedSelector>> {
	let mut normalized: Vec<SettingSelector> = Vec::with_capacity(selectors.len());

	for selector in selectors {
		selector.validate()?;

		let key = selector.dedup_key();

		normalized.retain(|existing| existing.dedup_key() != key);
		normalized.push(selector);
	}

	Ok(normalized.into_iter().map(PagedSelector::new).collect())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn empty_kv_selectors_default_to_everything_under_null_label() {
		let selectors = normalize_kv_selectors(Vec::new()).unwrap();

		assert_eq!(selectors.len(), 1);
		assert_eq!(selectors[0].selector.key_filter, "*");
		assert_eq!(selectors[0].selector.label_filter, NULL_LABEL);
	}

	#[test]
	fn duplicate_selectors_keep_the_later_occurrence() {
		let first = SettingSelector::new("app.*", "Test");
		let second = SettingSelector::new("db.*", "Test");
		let duplicate = SettingSelector::new("app.*", "Test");
		let selectors = normalize_kv_selectors(vec![first, second, duplicate]).unwrap();

		assert_eq!(selectors.len(), 2);
		assert_eq!(selectors[0].selector.key_filter, "db.*");
		assert_eq!(selectors[1].selector.key_filter, "app.*");
	}

	#[test]
	fn wildcard_is_only_valid_at_the_end() {
		assert!(SettingSelector::new("app.*", NULL_LABEL).validate().is_ok());
		assert!(SettingSelector::new("*", NULL_LABEL).validate().is_ok());
		assert!(SettingSelector::new("app.*.settings", NULL_LABEL).validate().is_err());
	}

	#[test]
	fn label_filter_rejects_commas() {
		assert!(SettingSelector::new("*", "a,b").validate().is_err());
	}

	#[test]
	fn tag_filters_are_bounded_and_shaped() {
		let too_many: Vec<String> = (0..6).map(|i| format!("tag{i}=v")).collect();

		assert!(SettingSelector::new("*", NULL_LABEL).with_tag_filters(too_many).validate().is_err());
		assert!(
			SettingSelector::new("*", NULL_LABEL)
				.with_tag_filters(["name=value"])
				.validate()
				.is_ok()
		);
		assert!(
			SettingSelector::new("*", NULL_LABEL).with_tag_filters(["novalue"]).validate().is_err()
		);
		assert!(
			SettingSelector::new("*", NULL_LABEL).with_tag_filters(["=value"]).validate().is_err()
		);
	}

	#[test]
	fn snapshot_selectors_reject_filters() {
		let mut selector = SettingSelector::snapshot("release-1");

		assert!(selector.validate().is_ok());

		selector.key_filter = "app.*".into();

		assert!(selector.validate().is_err());
	}

	#[test]
	fn ff_selectors_gain_the_reserved_prefix() {
		let selectors = normalize_ff_selectors(vec![SettingSelector::new("beta*", NULL_LABEL)]).unwrap();

		assert_eq!(selectors[0].selector.key_filter, ".appconfig.featureflag/beta*");

		let defaulted = normalize_ff_selectors(Vec::new()).unwrap();

		assert_eq!(defaulted[0].selector.key_filter, ".appconfig.featureflag/*");
	}

	#[test]
	fn watched_settings_must_be_literal() {
		assert!(WatchedSetting::new("app.sentinel").validate().is_ok());
		assert!(WatchedSetting::new("app.*").validate().is_err());
		assert!(WatchedSetting::with_label("app.sentinel", "a,b").validate().is_err());
	}
}
