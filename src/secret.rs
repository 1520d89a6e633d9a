//! Key-Vault-style secret reference resolution with a TTL cache.

// std
use std::{collections::HashMap, fmt::Debug};
// crates.io
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;
// self
use crate::_prelude::*;

/// Client able to read secrets from a single vault.
#[async_trait]
pub trait SecretClient: Debug + Send + Sync {
	/// Host of the vault this client is bound to.
	fn vault_host(&self) -> &str;

	/// Fetch the value of a secret, optionally at a pinned version.
	async fn get_secret(&self, name: &str, version: Option<&str>) -> Result<String>;
}

/// Fallback resolver invoked with the full secret identifier when no
/// registered client matches the vault host.
#[async_trait]
pub trait SecretResolver: Debug + Send + Sync {
	/// Produce the secret value for the given identifier.
	async fn resolve(&self, source_id: &str) -> Result<String>;
}

/// Parsed form of a secret-reference setting value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretReference {
	/// Host of the vault holding the secret.
	pub vault_host: String,
	/// Name of the secret.
	pub name: String,
	/// Pinned secret version, when present.
	pub version: Option<String>,
	/// Full identifier URI, used as the cache key.
	pub source_id: String,
}
impl SecretReference {
	/// Parse a secret reference from a setting value document.
	///
	/// The document carries the identifier under `secretId` (older revisions
	/// used `uri`); the identifier itself has the shape
	/// `https://{vault}/secrets/{name}[/{version}]`.
	pub fn parse(value: &str) -> Result<Self> {
		#[derive(Deserialize)]
		struct Document {
			#[serde(alias = "uri")]
			#[serde(rename = "secretId")]
			secret_id: String,
		}

		let document: Document = serde_json::from_str(value)?;
		let url = Url::parse(&document.secret_id)?;
		let vault_host = url
			.host_str()
			.ok_or_else(|| Error::InvalidArgument {
				field: "secret_reference",
				reason: format!("Identifier '{}' has no host.", document.secret_id),
			})?
			.to_ascii_lowercase();
		let mut segments = url
			.path_segments()
			.map(|segments| segments.filter(|s| !s.is_empty()))
			.ok_or_else(|| Error::InvalidArgument {
				field: "secret_reference",
				reason: format!("Identifier '{}' has no path.", document.secret_id),
			})?;

		if segments.next() != Some("secrets") {
			return Err(Error::InvalidArgument {
				field: "secret_reference",
				reason: format!("Identifier '{}' is not a secret URI.", document.secret_id),
			});
		}

		let name = segments.next().filter(|name| !name.is_empty()).ok_or_else(|| {
			Error::InvalidArgument {
				field: "secret_reference",
				reason: format!("Identifier '{}' is missing the secret name.", document.secret_id),
			}
		})?;
		let version = segments.next().map(str::to_string);

		Ok(Self {
			vault_host,
			name: name.to_string(),
			version,
			source_id: document.secret_id.clone(),
		})
	}
}

#[derive(Debug)]
struct CachedSecret {
	value: String,
	resolved_at: Instant,
}

/// Resolves secret references through registered clients or a fallback
/// resolver, caching values by identifier.
#[derive(Debug)]
pub(crate) struct SecretProvider {
	clients: HashMap<String, Arc<dyn SecretClient>>,
	resolver: Option<Arc<dyn SecretResolver>>,
	refresh_interval: Option<Duration>,
	cache: RwLock<HashMap<String, CachedSecret>>,
}
impl SecretProvider {
	pub fn new(
		secret_clients: Vec<Arc<dyn SecretClient>>,
		resolver: Option<Arc<dyn SecretResolver>>,
		refresh_interval: Option<Duration>,
	) -> Self {
		let clients = secret_clients
			.into_iter()
			.map(|client| (client.vault_host().to_ascii_lowercase(), client))
			.collect();

		Self { clients, resolver, refresh_interval, cache: RwLock::new(HashMap::new()) }
	}

	/// Resolve a reference, serving from the cache while it is fresh.
	pub async fn resolve(&self, reference: &SecretReference) -> Result<String> {
		let now = Instant::now();

		{
			let cache = self.cache.read().await;

			if let Some(cached) = cache.get(&reference.source_id)
				&& self
					.refresh_interval
					.is_none_or(|interval| now < cached.resolved_at + interval)
			{
				return Ok(cached.value.clone());
			}
		}

		let value = self.resolve_uncached(reference).await?;

		{
			let mut cache = self.cache.write().await;

			cache.insert(
				reference.source_id.clone(),
				CachedSecret { value: value.clone(), resolved_at: now },
			);
		}

		Ok(value)
	}

	async fn resolve_uncached(&self, reference: &SecretReference) -> Result<String> {
		if let Some(client) = self.clients.get(&reference.vault_host) {
			return client.get_secret(&reference.name, reference.version.as_deref()).await;
		}
		if let Some(resolver) = &self.resolver {
			return resolver.resolve(&reference.source_id).await;
		}

		Err(Error::MissingSecretResolver { source_id: reference.source_id.clone() })
	}
}
