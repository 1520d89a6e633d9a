//! Endpoint discovery, failover rotation, and load balancing.

// std
use std::sync::Mutex as StdMutex;
// crates.io
use async_trait::async_trait;
use futures::future::BoxFuture;
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Mutex;
use url::Url;
// self
use crate::{
	_prelude::*,
	client::{
		rest::{Credential, RestClient},
		transport::{RequestContext, SettingsClient},
		wrapper::ClientWrapper,
	},
	options::ClientOptions,
	telemetry::RequestTracing,
};

/// Minimum spacing between replica discovery attempts.
pub const DISCOVERY_MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Lifetime of a discovery result before it is refreshed.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
/// Upper bound on `_altN` alternate lookups.
pub const MAX_ALTERNATES: usize = 10;

const TRUSTED_SUFFIX_MARKERS: [&str; 2] = [".azconfig.", ".appconfig."];

/// DNS SRV lookup seam; resolution itself is an external concern.
#[async_trait]
pub trait SrvResolver: std::fmt::Debug + Send + Sync {
	/// Resolve the SRV record set for `name` into target hostnames.
	///
	/// A name with no records may come back as an empty list or as a
	/// name-not-found error; both end the alternate scan.
	async fn lookup_srv_targets(&self, name: &str) -> Result<Vec<String>>;
}

/// [`SrvResolver`] backed by the system's DNS configuration.
#[derive(Debug)]
pub struct SystemSrvResolver {
	resolver: TokioAsyncResolver,
}
impl SystemSrvResolver {
	/// Build a resolver from the system configuration.
	pub fn from_system_conf() -> Result<Self> {
		Ok(Self { resolver: TokioAsyncResolver::tokio_from_system_conf()? })
	}
}
#[async_trait]
impl SrvResolver for SystemSrvResolver {
	async fn lookup_srv_targets(&self, name: &str) -> Result<Vec<String>> {
		let lookup = self.resolver.srv_lookup(name).await?;

		Ok(lookup
			.iter()
			.map(|record| record.target().to_utf8().trim_end_matches('.').to_string())
			.collect())
	}
}

/// Parse a `Endpoint=…;Id=…;Secret=…` connection string.
///
/// The three tokens are required, each at most once, and no others are
/// accepted.
pub(crate) fn parse_connection_string(connection_string: &str) -> Result<(Url, Credential)> {
	let mut endpoint = None;
	let mut id = None;
	let mut secret = None;

	for part in connection_string.split(';').filter(|part| !part.is_empty()) {
		let (name, value) = part.split_once('=').ok_or_else(|| Error::InvalidArgument {
			field: "connection_string",
			reason: format!("Segment '{part}' is not a 'Name=value' token."),
		})?;
		let slot = match name {
			"Endpoint" => &mut endpoint,
			"Id" => &mut id,
			"Secret" => &mut secret,
			_ =>
				return Err(Error::InvalidArgument {
					field: "connection_string",
					reason: format!("Unknown token '{name}'."),
				}),
		};

		if slot.replace(value).is_some() {
			return Err(Error::InvalidArgument {
				field: "connection_string",
				reason: format!("Duplicate token '{name}'."),
			});
		}
	}

	match (endpoint, id, secret) {
		(Some(endpoint), Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
			let endpoint = Url::parse(endpoint)?;

			Ok((endpoint, Credential::AccessKey { id: id.into(), secret: secret.into() }))
		},
		_ => Err(Error::InvalidArgument {
			field: "connection_string",
			reason: "Endpoint, Id, and Secret are all required.".into(),
		}),
	}
}

/// Trailing trusted domain of the primary host, from the final `.azconfig.`
/// or `.appconfig.` occurrence onward.
fn trusted_domain(host: &str) -> Option<String> {
	let lower = host.to_ascii_lowercase();
	let index = TRUSTED_SUFFIX_MARKERS.iter().filter_map(|marker| lower.rfind(marker)).max()?;

	Some(lower[index..].to_string())
}

#[derive(Debug, Default)]
struct DiscoveryState {
	replicas: Vec<Arc<ClientWrapper>>,
	discovered_at: Option<Instant>,
	last_attempt: Option<Instant>,
	rediscover_requested: bool,
}

/// Owns the static client and dynamically discovered replicas, and decides
/// which endpoint serves each request.
#[derive(Debug)]
pub(crate) struct ClientManager {
	primary_endpoint: Url,
	static_wrapper: Arc<ClientWrapper>,
	credential: Option<Credential>,
	client_options: ClientOptions,
	resolver: Option<Arc<dyn SrvResolver>>,
	load_balancing_enabled: bool,
	discovery: Mutex<DiscoveryState>,
	last_successful: StdMutex<Option<Url>>,
}
impl ClientManager {
	/// Build a manager around a REST client for the endpoint.
	pub fn new(
		endpoint: Url,
		credential: Credential,
		client_options: ClientOptions,
		resolver: Option<Arc<dyn SrvResolver>>,
		load_balancing_enabled: bool,
	) -> Result<Self> {
		let client =
			Arc::new(RestClient::new(endpoint.clone(), credential.clone(), &client_options)?);

		Ok(Self {
			primary_endpoint: endpoint.clone(),
			static_wrapper: Arc::new(ClientWrapper::new(endpoint, client)),
			credential: Some(credential),
			client_options,
			resolver,
			load_balancing_enabled,
			discovery: Mutex::new(DiscoveryState::default()),
			last_successful: StdMutex::new(None),
		})
	}

	#[cfg(test)]
	pub fn for_tests(
		primary_endpoint: Url,
		static_wrapper: Arc<ClientWrapper>,
		replicas: Vec<Arc<ClientWrapper>>,
		load_balancing_enabled: bool,
	) -> Self {
		Self {
			primary_endpoint,
			static_wrapper,
			credential: None,
			client_options: ClientOptions::default(),
			resolver: None,
			load_balancing_enabled,
			discovery: Mutex::new(DiscoveryState {
				replicas,
				discovered_at: Some(Instant::now()),
				last_attempt: Some(Instant::now()),
				rediscover_requested: false,
			}),
			last_successful: StdMutex::new(None),
		}
	}

	/// Primary endpoint URL.
	pub fn primary_endpoint(&self) -> &Url {
		&self.primary_endpoint
	}

	/// Endpoint that served the most recent successful request.
	pub fn last_successful_endpoint(&self) -> Option<Url> {
		self.last_successful.lock().expect("endpoint state poisoned").clone()
	}

	/// Number of currently known dynamic replicas.
	pub async fn replica_count(&self) -> usize {
		self.discovery.lock().await.replicas.len()
	}

	/// Ordered list of available wrappers: the static client first, then
	/// discovered replicas, rotated for load balancing when enabled.
	pub async fn get_clients(&self) -> Vec<Arc<ClientWrapper>> {
		self.refresh_replicas().await;

		let replicas = { self.discovery.lock().await.replicas.clone() };
		let mut clients: Vec<Arc<ClientWrapper>> =
			std::iter::once(self.static_wrapper.clone()).chain(replicas).collect();

		clients.retain(|wrapper| wrapper.is_available());

		if self.load_balancing_enabled
			&& clients.len() > 1
			&& let Some(last) = self.last_successful_endpoint()
			&& let Some(index) = clients.iter().position(|wrapper| *wrapper.endpoint() == last)
		{
			let len = clients.len();
			clients.rotate_left((index + 1) % len);
		}

		clients
	}

	/// Run `op` against each available client in order, rotating past
	/// failover-eligible errors; exhaustion schedules rediscovery.
	pub async fn execute_with_failover<T, F>(&self, tracing: &RequestTracing, op: F) -> Result<T>
	where
		F: Fn(Arc<dyn SettingsClient>, RequestContext) -> BoxFuture<'static, Result<T>>,
	{
		let clients = self.get_clients().await;
		let mut failed_over = false;

		for wrapper in clients {
			let mut tracing = tracing.clone();

			tracing.is_failover = failed_over;

			let context = RequestContext { correlation: tracing.header_value() };

			match op(wrapper.client().clone(), context).await {
				Ok(value) => {
					wrapper.update_backoff(true);
					*self.last_successful.lock().expect("endpoint state poisoned") =
						Some(wrapper.endpoint().clone());

					return Ok(value);
				},
				Err(err) if err.is_failover_eligible() => {
					tracing::warn!(
						endpoint = %wrapper.endpoint(),
						error = %err,
						"request failed; rotating to the next replica"
					);
					wrapper.update_backoff(false);

					failed_over = true;
				},
				Err(err) => return Err(err),
			}
		}

		self.request_rediscovery().await;

		Err(Error::AllClientsFailed)
	}

	/// Ask for a fresh discovery pass on the next client listing.
	pub async fn request_rediscovery(&self) {
		self.discovery.lock().await.rediscover_requested = true;
	}

	async fn refresh_replicas(&self) {
		let Some(resolver) = self.resolver.clone() else {
			return;
		};
		let mut state = self.discovery.lock().await;
		let now = Instant::now();
		let due = state.rediscover_requested
			|| state.discovered_at.is_none_or(|at| now >= at + DISCOVERY_CACHE_TTL);

		if !due || state.last_attempt.is_some_and(|at| now < at + DISCOVERY_MIN_INTERVAL) {
			return;
		}

		state.last_attempt = Some(now);

		match self.discover(resolver.as_ref()).await {
			Ok(hosts) => {
				let previous = std::mem::take(&mut state.replicas);

				state.replicas = self.build_replicas(hosts, previous);
				state.discovered_at = Some(now);
				state.rediscover_requested = false;

				tracing::debug!(
					replicas = state.replicas.len(),
					endpoint = %self.primary_endpoint,
					"replica discovery complete"
				);
			},
			Err(err) => {
				tracing::warn!(error = %err, "replica discovery failed");
			},
		}
	}

	async fn discover(&self, resolver: &dyn SrvResolver) -> Result<Vec<String>> {
		let Some(primary_host) = self.primary_endpoint.host_str() else {
			return Ok(Vec::new());
		};
		let Some(trusted) = trusted_domain(primary_host) else {
			return Ok(Vec::new());
		};
		let origins = match resolver.lookup_srv_targets(&format!("_origin._tcp.{primary_host}")).await
		{
			Ok(origins) => origins,
			Err(err) if is_name_not_found(&err) => return Ok(Vec::new()),
			Err(err) => return Err(err),
		};
		let Some(origin) = origins.first() else {
			return Ok(Vec::new());
		};
		let mut hosts = vec![origin.clone()];

		for index in 0..MAX_ALTERNATES {
			match resolver.lookup_srv_targets(&format!("_alt{index}._tcp.{origin}")).await {
				Ok(targets) if targets.is_empty() => break,
				Ok(targets) => hosts.extend(targets),
				Err(err) if is_name_not_found(&err) => break,
				Err(err) => return Err(err),
			}
		}

		let primary = primary_host.to_ascii_lowercase();
		let mut validated = Vec::new();

		for host in hosts {
			let lower = host.to_ascii_lowercase();

			if lower == primary || validated.contains(&lower) {
				continue;
			}
			if !lower.ends_with(&trusted) {
				tracing::warn!(host = %host, "discovered replica is outside the trusted domain");

				continue;
			}

			validated.push(lower);
		}

		Ok(validated)
	}

	fn build_replicas(
		&self,
		hosts: Vec<String>,
		previous: Vec<Arc<ClientWrapper>>,
	) -> Vec<Arc<ClientWrapper>> {
		let Some(credential) = &self.credential else {
			return previous;
		};
		let mut replicas = Vec::with_capacity(hosts.len());

		for host in hosts {
			let Ok(endpoint) = Url::parse(&format!("https://{host}")) else {
				continue;
			};

			// Keep the wrapper, and with it the backoff state, when the
			// endpoint survived rediscovery.
			if let Some(existing) =
				previous.iter().find(|wrapper| *wrapper.endpoint() == endpoint)
			{
				replicas.push(existing.clone());

				continue;
			}

			match RestClient::new(endpoint.clone(), credential.clone(), &self.client_options) {
				Ok(client) => replicas.push(Arc::new(ClientWrapper::new(endpoint, Arc::new(client)))),
				Err(err) => tracing::warn!(error = %err, "failed to build replica client"),
			}
		}

		replicas
	}
}

fn is_name_not_found(err: &Error) -> bool {
	matches!(
		err,
		Error::Dns(resolve)
			if matches!(
				resolve.kind(),
				hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
			)
	)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn connection_strings_require_exact_tokens() {
		let (endpoint, credential) =
			parse_connection_string("Endpoint=https://store.azconfig.io;Id=abc;Secret=c2VjcmV0")
				.unwrap();

		assert_eq!(endpoint.as_str(), "https://store.azconfig.io/");
		assert!(matches!(credential, Credential::AccessKey { .. }));

		assert!(parse_connection_string("Endpoint=https://store.azconfig.io;Id=abc").is_err());
		assert!(
			parse_connection_string("endpoint=https://store.azconfig.io;Id=abc;Secret=x").is_err()
		);
		assert!(
			parse_connection_string("Endpoint=https://a.io;Id=abc;Secret=x;Extra=1").is_err()
		);
		assert!(
			parse_connection_string("Endpoint=https://a.io;Id=abc;Id=def;Secret=x").is_err()
		);
	}

	#[test]
	fn secrets_keep_embedded_equals_signs() {
		let (_, credential) =
			parse_connection_string("Endpoint=https://store.azconfig.io;Id=abc;Secret=AbC==")
				.unwrap();

		match credential {
			Credential::AccessKey { secret, .. } => assert_eq!(secret, "AbC=="),
			_ => panic!("expected an access key"),
		}
	}

	#[test]
	fn trusted_domain_is_the_final_marker_occurrence() {
		assert_eq!(
			trusted_domain("store.azconfig.io").as_deref(),
			Some(".azconfig.io")
		);
		assert_eq!(
			trusted_domain("store.appconfig.azure.com").as_deref(),
			Some(".appconfig.azure.com")
		);
		assert_eq!(
			trusted_domain("a.azconfig.b.appconfig.io").as_deref(),
			Some(".appconfig.io")
		);
		assert_eq!(trusted_domain("example.com"), None);
	}
}
