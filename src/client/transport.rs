//! Transport contract for the configuration service.
//!
//! The provider core speaks to the service exclusively through
//! [`SettingsClient`]; retries, timeouts, and authentication live behind
//! this seam.

// std
use std::fmt::Debug;
// crates.io
use async_trait::async_trait;
use serde::Deserialize;
// self
use crate::{_prelude::*, selector::SettingSelector, setting::ConfigurationSetting};

/// Per-request context carried down to the transport.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
	/// Pre-built `Correlation-Context` header value, if tracing is active.
	pub correlation: Option<String>,
}

/// One page of a paginated listing.
#[derive(Clone, Debug)]
pub struct SettingsPage {
	/// Etag identifying this page's revision.
	pub etag: Option<String>,
	/// Settings on the page; empty for a not-modified page.
	pub settings: Vec<ConfigurationSetting>,
	/// Whether the service answered 304 for this page.
	pub not_modified: bool,
}

/// Outcome of a conditional point read.
#[derive(Clone, Debug)]
pub enum SettingResponse {
	/// The setting exists and differs from the presented etag.
	Modified(ConfigurationSetting),
	/// The setting exists and matches the presented etag.
	NotModified,
	/// No setting exists under the key and label.
	NotFound,
}

/// Metadata of a server-side snapshot.
#[derive(Clone, Debug, Deserialize)]
pub struct SnapshotInfo {
	/// Snapshot name.
	pub name: String,
	/// How the snapshot's contents are composed; only `key` composition is
	/// consumable by the provider.
	pub composition_type: String,
}

/// Read operations against one configuration-service endpoint.
#[async_trait]
pub trait SettingsClient: Debug + Send + Sync {
	/// List settings matching the selector, one page at a time.
	///
	/// When `prior_page_etags` is given the listing is conditional: a page
	/// whose etag still matches comes back as `not_modified` with no
	/// settings.
	async fn list_settings(
		&self,
		selector: &SettingSelector,
		prior_page_etags: Option<&[String]>,
		context: &RequestContext,
	) -> Result<Vec<SettingsPage>>;

	/// Read one setting, optionally conditional on an etag.
	async fn get_setting(
		&self,
		key: &str,
		label: Option<&str>,
		if_none_match: Option<&str>,
		context: &RequestContext,
	) -> Result<SettingResponse>;

	/// Fetch snapshot metadata.
	async fn get_snapshot(&self, name: &str, context: &RequestContext) -> Result<SnapshotInfo>;

	/// List the contents of a snapshot.
	async fn list_snapshot_settings(
		&self,
		name: &str,
		context: &RequestContext,
	) -> Result<Vec<SettingsPage>>;
}
