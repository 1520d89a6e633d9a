//! Provider orchestrating load, refresh, and read access.

// std
use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Mutex as StdMutex, Weak,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
};
// crates.io
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::{sync::Mutex, time};
use url::Url;
// self
use crate::{
	_prelude::*,
	adapter::{KeyValueAdapter, adapt_setting},
	client::{
		manager::{ClientManager, SrvResolver, SystemSrvResolver, parse_connection_string},
		rest::Credential,
		transport::{SettingResponse, SettingsPage},
	},
	feature::{FeatureFlagUsage, annotate_telemetry, feature_flag_reference, parse_feature_flag},
	options::ProviderOptions,
	secret::SecretProvider,
	selector::{PagedSelector, WatchedSetting, normalize_ff_selectors, normalize_kv_selectors},
	setting::{ConfigurationSetting, FEATURE_FLAGS_KEY, FEATURE_MANAGEMENT_KEY},
	telemetry::{RequestTracing, RequestType},
	timer::{RefreshTimer, jittered_backoff},
	tree,
};

/// Minimum time a fatal startup error is held back, bounding the restart
/// rate of a crash-looping host.
pub const STARTUP_MIN_PROPAGATION: Duration = Duration::from_secs(5);

const STARTUP_RETRY_BASE: Duration = Duration::from_secs(5);
const STARTUP_RETRY_CAP: Duration = Duration::from_secs(30);
const SNAPSHOT_COMPOSITION_KEY: &str = "key";

/// Read-only view over the remote configuration store.
///
/// Created once via [`load`](Self::load) or
/// [`load_with_connection_string`](Self::load_with_connection_string), then
/// serves `get`/`refresh` until the owning process ends. Cloning is cheap
/// and shares the underlying state.
#[derive(Clone, Debug)]
pub struct ConfigurationProvider {
	inner: Arc<ProviderInner>,
}
impl ConfigurationProvider {
	/// Load configuration using an `Endpoint=…;Id=…;Secret=…` connection
	/// string.
	pub async fn load_with_connection_string(
		connection_string: &str,
		options: ProviderOptions,
	) -> Result<Self> {
		let (endpoint, credential) = parse_connection_string(connection_string)?;

		Self::load(endpoint, credential, options).await
	}

	/// Load configuration from the endpoint with the given credential.
	pub async fn load(
		endpoint: Url,
		credential: Credential,
		options: ProviderOptions,
	) -> Result<Self> {
		let resolver: Option<Arc<dyn SrvResolver>> = if options.replica_discovery_enabled {
			match SystemSrvResolver::from_system_conf() {
				Ok(resolver) => Some(Arc::new(resolver)),
				Err(err) => {
					tracing::warn!(
						error = %err,
						"system DNS configuration unavailable; replica discovery disabled"
					);

					None
				},
			}
		} else {
			None
		};
		let manager = ClientManager::new(
			endpoint,
			credential,
			options.client.clone(),
			resolver,
			options.load_balancing_enabled,
		)?;

		Self::load_with_manager(Arc::new(manager), options).await
	}

	pub(crate) async fn load_with_manager(
		manager: Arc<ClientManager>,
		options: ProviderOptions,
	) -> Result<Self> {
		options.validate()?;

		let ProviderOptions {
			selectors,
			trim_key_prefixes,
			refresh,
			feature_flags,
			key_vault,
			startup,
			..
		} = options;
		let kv_selectors = normalize_kv_selectors(selectors)?;
		let refresh = refresh.filter(|refresh| refresh.enabled);
		let kv_refresh_enabled = refresh.is_some();
		let (sentinels, kv_timer) = match &refresh {
			Some(refresh) => (
				refresh.watched_settings.clone(),
				Some(RefreshTimer::new(refresh.interval)),
			),
			None => (Vec::new(), None),
		};
		let watch_all = kv_refresh_enabled && sentinels.is_empty();
		let feature_flags = feature_flags.filter(|feature_flags| feature_flags.enabled);
		let ff_enabled = feature_flags.is_some();
		let (ff_selectors, ff_refresh_enabled, ff_timer) = match &feature_flags {
			Some(feature_flags) => (
				normalize_ff_selectors(feature_flags.selectors.clone())?,
				feature_flags.refresh_enabled,
				feature_flags
					.refresh_enabled
					.then(|| RefreshTimer::new(feature_flags.refresh_interval)),
			),
			None => (Vec::new(), false, None),
		};
		let secrets = key_vault.map(|key_vault| {
			Arc::new(SecretProvider::new(
				key_vault.secret_clients,
				key_vault.secret_resolver,
				key_vault.secret_refresh_interval,
			))
		});
		let uses_key_vault = secrets.is_some();
		let mut adapters = Vec::new();

		if let Some(secrets) = &secrets {
			adapters.push(KeyValueAdapter::SecretReference(secrets.clone()));
		}

		adapters.push(KeyValueAdapter::Json);

		// Descending order makes the longest of any nested prefixes match
		// first.
		let mut trim_key_prefixes = trim_key_prefixes;

		trim_key_prefixes.sort_by(|a, b| b.cmp(a));

		let inner = Arc::new(ProviderInner {
			manager,
			adapters,
			trim_key_prefixes,
			uses_key_vault,
			ff_enabled,
			kv_refresh_enabled,
			ff_refresh_enabled,
			watch_all,
			map: ArcSwap::from_pointee(IndexMap::new()),
			refresh_state: Mutex::new(RefreshState {
				kv_selectors,
				ff_selectors,
				sentinels,
				kv_timer,
				ff_timer,
			}),
			listeners: StdMutex::new(Vec::new()),
			listener_seq: AtomicU64::new(0),
			initial_load_done: AtomicBool::new(false),
			ff_usage: StdMutex::new(FeatureFlagUsage::default()),
		});
		let started = Instant::now();
		let deadline = started + startup.timeout;
		let mut attempts = 0;
		let result = loop {
			match inner.load_all().await {
				Ok(()) => break Ok(()),
				Err(err) => {
					let retryable = startup.retry_enabled
						&& (matches!(err, Error::AllClientsFailed) || err.is_failover_eligible());

					if !retryable {
						break Err(err);
					}

					attempts += 1;

					let delay = jittered_backoff(STARTUP_RETRY_BASE, STARTUP_RETRY_CAP, attempts);

					if Instant::now() + delay >= deadline {
						break Err(err);
					}

					tracing::warn!(error = %err, attempts, ?delay, "startup load failed; retrying");
					time::sleep(delay).await;
				},
			}
		};

		if let Err(err) = result {
			let elapsed = started.elapsed();

			if elapsed < STARTUP_MIN_PROPAGATION {
				time::sleep(STARTUP_MIN_PROPAGATION - elapsed).await;
			}

			return Err(Error::Startup(Box::new(err)));
		}

		Ok(Self { inner })
	}

	/// Value stored under the key, if any.
	pub fn get(&self, key: &str) -> Option<Value> {
		self.inner.map.load().get(key).cloned()
	}

	/// Whether the key is present.
	pub fn has(&self, key: &str) -> bool {
		self.inner.map.load().contains_key(key)
	}

	/// Number of entries in the current snapshot.
	pub fn len(&self) -> usize {
		self.inner.map.load().len()
	}

	/// Whether the current snapshot is empty.
	pub fn is_empty(&self) -> bool {
		self.inner.map.load().is_empty()
	}

	/// Stable handle onto the current snapshot, iterable in insertion order.
	///
	/// The handle keeps observing the same version even while a refresh
	/// swaps in a newer one.
	pub fn snapshot(&self) -> Arc<IndexMap<String, Value>> {
		self.inner.map.load_full()
	}

	/// Build a nested configuration object by splitting keys on `separator`
	/// (default `.`).
	pub fn construct_configuration_object(&self, separator: Option<&str>) -> Result<Value> {
		let map = self.inner.map.load_full();

		tree::construct(&map, separator.unwrap_or("."))
	}

	/// Probe the store for changes and reload what changed.
	///
	/// Returns immediately when a refresh is already in flight. Fails with
	/// [`Error::NotEnabled`] when neither key-value nor feature-flag refresh
	/// is configured.
	pub async fn refresh(&self) -> Result<()> {
		self.inner.refresh().await
	}

	/// Register a listener invoked after every refresh that changed the
	/// snapshot; dropping the returned guard unregisters it.
	pub fn on_refresh(
		&self,
		listener: impl Fn() + Send + Sync + 'static,
	) -> Result<RefreshListenerGuard> {
		if !self.inner.kv_refresh_enabled && !self.inner.ff_refresh_enabled {
			return Err(Error::NotEnabled);
		}

		let id = self.inner.listener_seq.fetch_add(1, Ordering::Relaxed);

		self.inner
			.listeners
			.lock()
			.expect("listener list poisoned")
			.push(Listener { id, callback: Arc::new(listener) });

		Ok(RefreshListenerGuard { inner: Arc::downgrade(&self.inner), id })
	}

	/// Endpoint that served the most recent successful request.
	pub fn last_successful_endpoint(&self) -> Option<Url> {
		self.inner.manager.last_successful_endpoint()
	}
}

/// Unregisters its refresh listener when dropped.
#[derive(Debug)]
pub struct RefreshListenerGuard {
	inner: Weak<ProviderInner>,
	id: u64,
}
impl RefreshListenerGuard {
	/// Unregister the listener now.
	pub fn dispose(self) {}
}
impl Drop for RefreshListenerGuard {
	fn drop(&mut self) {
		if let Some(inner) = self.inner.upgrade() {
			inner.listeners.lock().expect("listener list poisoned").retain(|l| l.id != self.id);
		}
	}
}

struct Listener {
	id: u64,
	callback: Arc<dyn Fn() + Send + Sync>,
}
impl std::fmt::Debug for Listener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Listener").field("id", &self.id).finish()
	}
}

/// Selector, sentinel, and timer state; mutated only while the single
/// refresh-in-flight lock is held.
#[derive(Debug)]
struct RefreshState {
	kv_selectors: Vec<PagedSelector>,
	ff_selectors: Vec<PagedSelector>,
	sentinels: Vec<WatchedSetting>,
	kv_timer: Option<RefreshTimer>,
	ff_timer: Option<RefreshTimer>,
}

#[derive(Debug)]
struct ProviderInner {
	manager: Arc<ClientManager>,
	adapters: Vec<KeyValueAdapter>,
	trim_key_prefixes: Vec<String>,
	uses_key_vault: bool,
	ff_enabled: bool,
	kv_refresh_enabled: bool,
	ff_refresh_enabled: bool,
	watch_all: bool,
	map: ArcSwap<IndexMap<String, Value>>,
	refresh_state: Mutex<RefreshState>,
	listeners: StdMutex<Vec<Listener>>,
	listener_seq: AtomicU64,
	initial_load_done: AtomicBool,
	ff_usage: StdMutex<FeatureFlagUsage>,
}
impl ProviderInner {
	async fn request_tracing(&self) -> RequestTracing {
		let request_type = if self.initial_load_done.load(Ordering::Relaxed) {
			RequestType::Watch
		} else {
			RequestType::Startup
		};

		RequestTracing {
			request_type: Some(request_type),
			replica_count: self.manager.replica_count().await,
			uses_key_vault: self.uses_key_vault,
			is_failover: false,
			features: *self.ff_usage.lock().expect("usage state poisoned"),
		}
	}

	async fn load_all(&self) -> Result<()> {
		let mut state = self.refresh_state.lock().await;

		self.load_kv(&mut state).await?;

		if self.ff_enabled {
			self.load_ff(&mut state).await?;
		}

		self.initial_load_done.store(true, Ordering::Relaxed);

		Ok(())
	}

	/// Fetch every key-value selector, repopulate sentinels, and swap in the
	/// rebuilt map.
	async fn load_kv(&self, state: &mut RefreshState) -> Result<()> {
		let tracing = self.request_tracing().await;
		let mut raw: Vec<ConfigurationSetting> = Vec::new();

		for paged in &mut state.kv_selectors {
			if let Some(name) = paged.selector.snapshot_name.clone() {
				raw.extend(self.fetch_snapshot_contents(&name, &tracing).await?);
			} else {
				let selector = paged.selector.clone();
				let pages = self
					.manager
					.execute_with_failover(&tracing, move |client, context| {
						let selector = selector.clone();

						Box::pin(
							async move { client.list_settings(&selector, None, &context).await },
						)
					})
					.await?;

				paged.page_etags = page_etags(&pages);

				for page in pages {
					raw.extend(page.settings.into_iter().filter(|s| !s.is_feature_flag()));
				}
			}
		}

		if self.kv_refresh_enabled && !state.sentinels.is_empty() {
			self.populate_sentinels(&mut state.sentinels, &raw, &tracing).await?;
		}

		// Rebuild from scratch; only the reserved feature-flag section
		// survives a key-value reload.
		let feature_management = self.map.load().get(FEATURE_MANAGEMENT_KEY).cloned();
		let mut next = IndexMap::with_capacity(raw.len() + 1);

		if let Some(feature_management) = feature_management {
			next.insert(FEATURE_MANAGEMENT_KEY.to_string(), feature_management);
		}

		for setting in &raw {
			if setting.is_snapshot_reference() {
				for inner in self.resolve_snapshot_reference(setting, &tracing).await? {
					let (key, value) = self.process_setting(&inner).await?;

					next.insert(key, value);
				}

				continue;
			}

			let (key, value) = self.process_setting(setting).await?;

			next.insert(key, value);
		}

		self.map.store(Arc::new(next));

		Ok(())
	}

	/// Fetch every feature-flag selector and swap in a map with the rebuilt
	/// `feature_management` section.
	async fn load_ff(&self, state: &mut RefreshState) -> Result<()> {
		let tracing = self.request_tracing().await;
		let mut flags = Vec::new();
		let mut usage = FeatureFlagUsage::default();

		for paged in &mut state.ff_selectors {
			let pages = if let Some(name) = paged.selector.snapshot_name.clone() {
				let contents = self.fetch_snapshot_settings(&name, &tracing).await?;

				paged.page_etags.clear();

				contents
			} else {
				let selector = paged.selector.clone();
				let pages = self
					.manager
					.execute_with_failover(&tracing, move |client, context| {
						let selector = selector.clone();

						Box::pin(
							async move { client.list_settings(&selector, None, &context).await },
						)
					})
					.await?;

				paged.page_etags = page_etags(&pages);

				pages
			};

			for setting in pages.into_iter().flat_map(|page| page.settings) {
				if !setting.is_feature_flag() {
					continue;
				}
				if let Some(mut flag) = parse_feature_flag(&setting) {
					usage.observe(&flag);

					let reference = feature_flag_reference(
						self.manager.primary_endpoint(),
						&setting.key,
						setting.label.as_deref(),
					);

					annotate_telemetry(&mut flag, setting.etag.as_deref(), reference);
					flags.push(flag);
				}
			}
		}

		let mut section = Map::new();

		section.insert(FEATURE_FLAGS_KEY.to_string(), Value::Array(flags));

		let mut next = (*self.map.load_full()).clone();

		next.insert(FEATURE_MANAGEMENT_KEY.to_string(), Value::Object(section));
		self.map.store(Arc::new(next));

		*self.ff_usage.lock().expect("usage state poisoned") = usage;

		Ok(())
	}

	async fn fetch_snapshot_contents(
		&self,
		name: &str,
		tracing: &RequestTracing,
	) -> Result<Vec<ConfigurationSetting>> {
		let pages = self.fetch_snapshot_settings(name, tracing).await?;

		Ok(pages
			.into_iter()
			.flat_map(|page| page.settings)
			.filter(|setting| !setting.is_feature_flag())
			.collect())
	}

	async fn fetch_snapshot_settings(
		&self,
		name: &str,
		tracing: &RequestTracing,
	) -> Result<Vec<SettingsPage>> {
		let snapshot_name = name.to_string();
		let info = self
			.manager
			.execute_with_failover(tracing, move |client, context| {
				let name = snapshot_name.clone();

				Box::pin(async move { client.get_snapshot(&name, &context).await })
			})
			.await?;

		if info.composition_type != SNAPSHOT_COMPOSITION_KEY {
			return Err(Error::Snapshot {
				name: name.to_string(),
				reason: format!(
					"composition type '{}' is not supported; only '{SNAPSHOT_COMPOSITION_KEY}' snapshots can be loaded",
					info.composition_type
				),
			});
		}

		let snapshot_name = name.to_string();

		self.manager
			.execute_with_failover(tracing, move |client, context| {
				let name = snapshot_name.clone();

				Box::pin(async move { client.list_snapshot_settings(&name, &context).await })
			})
			.await
	}

	async fn resolve_snapshot_reference(
		&self,
		setting: &ConfigurationSetting,
		tracing: &RequestTracing,
	) -> Result<Vec<ConfigurationSetting>> {
		let name = match setting
			.value
			.as_deref()
			.and_then(|raw| serde_json::from_str::<Value>(raw).ok())
			.and_then(|doc| doc.get("snapshot_name").and_then(Value::as_str).map(str::to_string))
		{
			Some(name) => name,
			None => {
				tracing::warn!(key = %setting.key, "skipping malformed snapshot reference");

				return Ok(Vec::new());
			},
		};
		let mut contents = self.fetch_snapshot_contents(&name, tracing).await?;

		// Nested snapshot references are not expanded.
		contents.retain(|inner| {
			if inner.is_snapshot_reference() {
				tracing::warn!(key = %inner.key, "ignoring nested snapshot reference");

				false
			} else {
				true
			}
		});

		Ok(contents)
	}

	async fn populate_sentinels(
		&self,
		sentinels: &mut [WatchedSetting],
		raw: &[ConfigurationSetting],
		tracing: &RequestTracing,
	) -> Result<()> {
		for sentinel in sentinels {
			if let Some(setting) = raw
				.iter()
				.find(|s| s.key == sentinel.key && label_matches(&s.label, &sentinel.label))
			{
				sentinel.etag = setting.etag.clone();

				continue;
			}

			let key = sentinel.key.clone();
			let label = sentinel.label.clone();
			let response = self
				.manager
				.execute_with_failover(tracing, move |client, context| {
					let key = key.clone();
					let label = label.clone();

					Box::pin(async move {
						client.get_setting(&key, label.as_deref(), None, &context).await
					})
				})
				.await?;

			sentinel.etag = match response {
				SettingResponse::Modified(setting) => setting.etag,
				SettingResponse::NotModified | SettingResponse::NotFound => None,
			};
		}

		Ok(())
	}

	async fn process_setting(&self, setting: &ConfigurationSetting) -> Result<(String, Value)> {
		let value = adapt_setting(&self.adapters, setting).await?;

		Ok((self.trim_key(&setting.key), value))
	}

	fn trim_key(&self, key: &str) -> String {
		for prefix in &self.trim_key_prefixes {
			if let Some(stripped) = key.strip_prefix(prefix) {
				return stripped.to_string();
			}
		}

		key.to_string()
	}

	async fn refresh(&self) -> Result<()> {
		if !self.kv_refresh_enabled && !self.ff_refresh_enabled {
			return Err(Error::NotEnabled);
		}

		// At most one refresh in flight; concurrent callers return
		// immediately and observe whatever the in-flight pass produces.
		let Ok(mut state) = self.refresh_state.try_lock() else {
			tracing::debug!("refresh already in flight");

			return Ok(());
		};
		let state = &mut *state;
		let mut attempted = 0;
		let mut failures = Vec::new();
		let mut reloaded = false;

		if self.kv_refresh_enabled
			&& state.kv_timer.as_ref().is_some_and(RefreshTimer::can_refresh)
		{
			attempted += 1;

			match self.refresh_kv(state).await {
				Ok(changed) => {
					reloaded |= changed;
					state.kv_timer.as_mut().expect("timer gated above").reset();
				},
				Err(err) => {
					state.kv_timer.as_mut().expect("timer gated above").backoff();
					failures.push(err);
				},
			}
		}
		if self.ff_refresh_enabled
			&& state.ff_timer.as_ref().is_some_and(RefreshTimer::can_refresh)
		{
			attempted += 1;

			match self.refresh_ff(state).await {
				Ok(changed) => {
					reloaded |= changed;
					state.ff_timer.as_mut().expect("timer gated above").reset();
				},
				Err(err) => {
					state.ff_timer.as_mut().expect("timer gated above").backoff();
					failures.push(err);
				},
			}
		}

		if reloaded {
			self.notify_listeners();
		}

		// Branch failures only surface when every attempted branch failed.
		if attempted > 0 && failures.len() == attempted {
			let mut failures = failures.into_iter();
			let first = failures.next().expect("at least one failure");

			for err in failures {
				tracing::warn!(error = %err, "additional refresh branch failed");
			}

			return Err(first);
		}

		for err in &failures {
			tracing::warn!(error = %err, "refresh branch failed; keeping previous values");
		}

		Ok(())
	}

	async fn refresh_kv(&self, state: &mut RefreshState) -> Result<bool> {
		let tracing = self.request_tracing().await;
		let mut needs_reload = false;

		if self.watch_all {
			for paged in &state.kv_selectors {
				if paged.selector.snapshot_name.is_some() {
					continue;
				}
				if self.pages_changed(paged, &tracing).await? {
					needs_reload = true;

					break;
				}
			}
		} else {
			for sentinel in &mut state.sentinels {
				let key = sentinel.key.clone();
				let label = sentinel.label.clone();
				let etag = sentinel.etag.clone();
				let response = self
					.manager
					.execute_with_failover(&tracing, move |client, context| {
						let key = key.clone();
						let label = label.clone();
						let etag = etag.clone();

						Box::pin(async move {
							client
								.get_setting(&key, label.as_deref(), etag.as_deref(), &context)
								.await
						})
					})
					.await?;

				match response {
					SettingResponse::Modified(setting) => {
						sentinel.etag = setting.etag;
						needs_reload = true;
					},
					SettingResponse::NotFound if sentinel.etag.is_some() => {
						sentinel.etag = None;
						needs_reload = true;
					},
					SettingResponse::NotModified | SettingResponse::NotFound => {},
				}

				if needs_reload {
					break;
				}
			}
		}

		if needs_reload {
			self.load_kv(state).await?;
		}

		Ok(needs_reload)
	}

	async fn refresh_ff(&self, state: &mut RefreshState) -> Result<bool> {
		let tracing = self.request_tracing().await;
		let mut changed = false;

		for paged in &state.ff_selectors {
			if paged.selector.snapshot_name.is_some() {
				continue;
			}
			if self.pages_changed(paged, &tracing).await? {
				changed = true;

				break;
			}
		}

		if changed {
			self.load_ff(state).await?;
		}

		Ok(changed)
	}

	async fn pages_changed(
		&self,
		paged: &PagedSelector,
		tracing: &RequestTracing,
	) -> Result<bool> {
		let selector = paged.selector.clone();
		let etags = paged.page_etags.clone();
		let pages = self
			.manager
			.execute_with_failover(tracing, move |client, context| {
				let selector = selector.clone();
				let etags = etags.clone();

				Box::pin(async move {
					client.list_settings(&selector, Some(&etags), &context).await
				})
			})
			.await?;

		Ok(pages.iter().any(|page| !page.not_modified) || pages.len() != paged.page_etags.len())
	}

	fn notify_listeners(&self) {
		let callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = {
			let listeners = self.listeners.lock().expect("listener list poisoned");

			listeners.iter().map(|listener| listener.callback.clone()).collect()
		};

		for callback in callbacks {
			// One listener must never prevent another from running.
			if panic::catch_unwind(AssertUnwindSafe(|| (*callback)())).is_err() {
				tracing::warn!("refresh listener panicked");
			}
		}
	}
}

fn page_etags(pages: &[SettingsPage]) -> Vec<String> {
	pages.iter().filter_map(|page| page.etag.clone()).collect()
}

fn label_matches(setting_label: &Option<String>, watched_label: &Option<String>) -> bool {
	let normalize =
		|label: &Option<String>| label.as_deref().filter(|l| !l.is_empty()).map(str::to_string);

	normalize(setting_label) == normalize(watched_label)
}
