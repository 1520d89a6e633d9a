//! Async configuration provider that materializes a remote key-value store
//! into an in-process snapshot, with ETag-based refresh, Key-Vault-style
//! secret resolution, and replica failover.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod client;
pub mod feature;
pub mod options;
pub mod secret;
pub mod selector;
pub mod setting;
pub mod telemetry;
pub mod timer;
pub mod tree;

mod adapter;
mod error;
mod provider;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}
pub use crate::{
	client::rest::{Credential, TokenCredential},
	error::{Error, Result},
	options::{
		ClientOptions, FeatureFlagOptions, KeyVaultOptions, ProviderOptions, RefreshOptions,
		RetryOptions, StartupOptions,
	},
	provider::{ConfigurationProvider, RefreshListenerGuard, STARTUP_MIN_PROPAGATION},
	secret::{SecretClient, SecretResolver},
	selector::{SettingSelector, WatchedSetting},
	setting::ConfigurationSetting,
};

#[cfg(test)]
mod _test {
	use serial_test as _;
	use tracing_subscriber as _;
	use wiremock as _;
}
