//! User-facing provider options and their validation.

// self
use crate::{
	_prelude::*,
	secret::{SecretClient, SecretResolver},
	selector::{SettingSelector, WatchedSetting},
};

/// Default interval between key-value refresh probes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default interval between feature-flag refresh probes.
pub const DEFAULT_FF_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
/// Default interval after which cached secrets are re-resolved.
pub const DEFAULT_SECRET_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default overall deadline for the initial load.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(100);
/// Smallest accepted refresh interval.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
/// Smallest accepted secret refresh interval.
pub const MIN_SECRET_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Options controlling what the provider loads and how it behaves.
#[derive(Debug, Default)]
pub struct ProviderOptions {
	/// Key-value selectors; defaults to every key under the null label.
	pub selectors: Vec<SettingSelector>,
	/// Key prefixes stripped from loaded keys, longest match first.
	pub trim_key_prefixes: Vec<String>,
	/// Key-value refresh configuration; absent means refresh is disabled.
	pub refresh: Option<RefreshOptions>,
	/// Feature-flag configuration; absent means flags are not loaded.
	pub feature_flags: Option<FeatureFlagOptions>,
	/// Key Vault secret-resolution configuration.
	pub key_vault: Option<KeyVaultOptions>,
	/// Transport-level client configuration.
	pub client: ClientOptions,
	/// Startup deadline and retry behaviour.
	pub startup: StartupOptions,
	/// Whether to discover replica endpoints over DNS (default true).
	pub replica_discovery_enabled: bool,
	/// Whether to rotate requests across available replicas (default false).
	pub load_balancing_enabled: bool,
}
impl ProviderOptions {
	/// Options with defaults: replica discovery on, everything else off.
	pub fn new() -> Self {
		Self { replica_discovery_enabled: true, ..Default::default() }
	}

	/// Replace the key-value selectors.
	pub fn with_selectors<I>(mut self, selectors: I) -> Self
	where
		I: IntoIterator<Item = SettingSelector>,
	{
		self.selectors = selectors.into_iter().collect();

		self
	}

	/// Replace the trimmed key prefixes.
	pub fn with_trim_key_prefixes<I, S>(mut self, prefixes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.trim_key_prefixes = prefixes.into_iter().map(Into::into).collect();

		self
	}

	/// Enable key-value refresh.
	pub fn with_refresh(mut self, refresh: RefreshOptions) -> Self {
		self.refresh = Some(refresh);

		self
	}

	/// Enable feature-flag loading.
	pub fn with_feature_flags(mut self, feature_flags: FeatureFlagOptions) -> Self {
		self.feature_flags = Some(feature_flags);

		self
	}

	/// Configure Key Vault secret resolution.
	pub fn with_key_vault(mut self, key_vault: KeyVaultOptions) -> Self {
		self.key_vault = Some(key_vault);

		self
	}

	/// Configure the transport client.
	pub fn with_client(mut self, client: ClientOptions) -> Self {
		self.client = client;

		self
	}

	/// Configure startup behaviour.
	pub fn with_startup(mut self, startup: StartupOptions) -> Self {
		self.startup = startup;

		self
	}

	/// Toggle DNS replica discovery.
	pub fn with_replica_discovery(mut self, enabled: bool) -> Self {
		self.replica_discovery_enabled = enabled;

		self
	}

	/// Toggle load balancing across available replicas.
	pub fn with_load_balancing(mut self, enabled: bool) -> Self {
		self.load_balancing_enabled = enabled;

		self
	}

	/// Validate every option group against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		if let Some(refresh) = &self.refresh {
			refresh.validate()?;
		}
		if let Some(feature_flags) = &self.feature_flags {
			feature_flags.validate()?;
		}
		if let Some(key_vault) = &self.key_vault {
			key_vault.validate()?;
		}
		for prefix in &self.trim_key_prefixes {
			if prefix.is_empty() {
				return Err(Error::InvalidArgument {
					field: "trim_key_prefixes",
					reason: "Prefixes must not be empty.".into(),
				});
			}
		}

		Ok(())
	}
}

/// Key-value refresh configuration.
#[derive(Clone, Debug)]
pub struct RefreshOptions {
	/// Whether refresh is active.
	pub enabled: bool,
	/// Minimum spacing between refresh probes.
	pub interval: Duration,
	/// Sentinels whose etag change triggers a full reload. When empty, every
	/// selector page is watched instead.
	pub watched_settings: Vec<WatchedSetting>,
}
impl RefreshOptions {
	/// Refresh configuration with the default interval and no sentinels.
	pub fn new() -> Self {
		Self { enabled: true, interval: DEFAULT_REFRESH_INTERVAL, watched_settings: Vec::new() }
	}

	/// Override the refresh interval.
	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;

		self
	}

	/// Watch the given settings instead of whole selector pages.
	pub fn with_watched_settings<I>(mut self, watched: I) -> Self
	where
		I: IntoIterator<Item = WatchedSetting>,
	{
		self.watched_settings = watched.into_iter().collect();

		self
	}

	fn validate(&self) -> Result<()> {
		if self.interval < MIN_REFRESH_INTERVAL {
			return Err(Error::InvalidArgument {
				field: "refresh.interval",
				reason: format!("Must be at least {MIN_REFRESH_INTERVAL:?}."),
			});
		}
		for watched in &self.watched_settings {
			watched.validate()?;
		}

		Ok(())
	}
}
impl Default for RefreshOptions {
	fn default() -> Self {
		Self::new()
	}
}

/// Feature-flag loading and refresh configuration.
#[derive(Clone, Debug)]
pub struct FeatureFlagOptions {
	/// Whether feature flags are loaded at all.
	pub enabled: bool,
	/// Flag selectors; the reserved flag prefix is prepended automatically.
	pub selectors: Vec<SettingSelector>,
	/// Whether flag pages are re-probed on refresh.
	pub refresh_enabled: bool,
	/// Minimum spacing between flag refresh probes.
	pub refresh_interval: Duration,
}
impl FeatureFlagOptions {
	/// Flag configuration covering every flag under the null label.
	pub fn new() -> Self {
		Self {
			enabled: true,
			selectors: Vec::new(),
			refresh_enabled: false,
			refresh_interval: DEFAULT_FF_REFRESH_INTERVAL,
		}
	}

	/// Replace the flag selectors.
	pub fn with_selectors<I>(mut self, selectors: I) -> Self
	where
		I: IntoIterator<Item = SettingSelector>,
	{
		self.selectors = selectors.into_iter().collect();

		self
	}

	/// Enable flag refresh with the given interval.
	pub fn with_refresh(mut self, interval: Duration) -> Self {
		self.refresh_enabled = true;
		self.refresh_interval = interval;

		self
	}

	fn validate(&self) -> Result<()> {
		if self.refresh_enabled && self.refresh_interval < MIN_REFRESH_INTERVAL {
			return Err(Error::InvalidArgument {
				field: "feature_flags.refresh_interval",
				reason: format!("Must be at least {MIN_REFRESH_INTERVAL:?}."),
			});
		}

		Ok(())
	}
}
impl Default for FeatureFlagOptions {
	fn default() -> Self {
		Self::new()
	}
}

/// Key Vault secret-resolution configuration.
#[derive(Clone, Debug, Default)]
pub struct KeyVaultOptions {
	/// Clients registered per vault host.
	pub secret_clients: Vec<Arc<dyn SecretClient>>,
	/// Fallback resolver invoked when no client matches the vault host.
	pub secret_resolver: Option<Arc<dyn SecretResolver>>,
	/// Interval after which cached secrets are re-resolved; `None` caches for
	/// the process lifetime.
	pub secret_refresh_interval: Option<Duration>,
}
impl KeyVaultOptions {
	/// Empty Key Vault configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a secret client for its vault host.
	pub fn with_secret_client(mut self, client: Arc<dyn SecretClient>) -> Self {
		self.secret_clients.push(client);

		self
	}

	/// Install a fallback secret resolver.
	pub fn with_secret_resolver(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
		self.secret_resolver = Some(resolver);

		self
	}

	/// Re-resolve cached secrets after the given interval.
	pub fn with_secret_refresh_interval(mut self, interval: Duration) -> Self {
		self.secret_refresh_interval = Some(interval);

		self
	}

	fn validate(&self) -> Result<()> {
		if let Some(interval) = self.secret_refresh_interval
			&& interval < MIN_SECRET_REFRESH_INTERVAL
		{
			return Err(Error::InvalidArgument {
				field: "key_vault.secret_refresh_interval",
				reason: format!("Must be at least {MIN_SECRET_REFRESH_INTERVAL:?}."),
			});
		}

		Ok(())
	}
}

/// Transport-level client configuration.
#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
	/// Prefix prepended to the crate's own `User-Agent` product.
	pub user_agent_prefix: Option<String>,
	/// Per-request retry policy applied inside the transport.
	pub retry: RetryOptions,
}

/// Retry policy for individual transport requests.
#[derive(Clone, Debug)]
pub struct RetryOptions {
	/// Retries performed after the initial attempt.
	pub max_retries: u32,
	/// Timeout applied to each attempt.
	pub attempt_timeout: Duration,
	/// Initial delay before the first retry.
	pub initial_backoff: Duration,
	/// Upper bound on the exponential retry delay.
	pub max_backoff: Duration,
}
impl Default for RetryOptions {
	fn default() -> Self {
		Self {
			max_retries: 2,
			attempt_timeout: Duration::from_secs(30),
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(8),
		}
	}
}

/// Startup deadline and retry behaviour for the initial load.
#[derive(Clone, Debug)]
pub struct StartupOptions {
	/// Overall deadline for the initial load.
	pub timeout: Duration,
	/// Whether failover-eligible startup failures are retried until the
	/// deadline.
	pub retry_enabled: bool,
}
impl Default for StartupOptions {
	fn default() -> Self {
		Self { timeout: DEFAULT_STARTUP_TIMEOUT, retry_enabled: true }
	}
}
