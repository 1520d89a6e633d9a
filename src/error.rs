//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the configuration provider crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Dns(#[from] hickory_resolver::error::ResolveError),
	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("All replica clients failed; the operation could not be completed on any endpoint.")]
	AllClientsFailed,
	#[error("Ambiguous key '{key}': the path is already occupied by another value.")]
	AmbiguousPath { key: String },
	#[error("Upstream HTTP status {status} from {endpoint}: {body:?}")]
	HttpStatus { status: http::StatusCode, endpoint: url::Url, body: Option<String> },
	#[error("Invalid key '{key}': {reason}")]
	InvalidKey { key: String, reason: String },
	#[error("Key Vault reference '{key}' (label {label:?}) could not be resolved.")]
	KeyVaultReference {
		key: String,
		label: Option<String>,
		#[source]
		source: Box<Error>,
	},
	#[error(
		"No Key Vault client or secret resolver is configured for '{source_id}'. Register a secret client for the vault or supply a secret resolver."
	)]
	MissingSecretResolver { source_id: String },
	#[error(
		"Refresh is not enabled: no watched settings, key-value refresh, or feature-flag refresh is configured."
	)]
	NotEnabled,
	#[error("Snapshot '{name}': {reason}")]
	Snapshot { name: String, reason: String },
	#[error("Configuration provider failed to start up.")]
	Startup(#[source] Box<Error>),
	#[error("Validation failed for {field}: {reason}")]
	InvalidArgument { field: &'static str, reason: String },
}
impl Error {
	/// Whether this error should rotate the request onto the next replica
	/// client instead of propagating.
	///
	/// Covers DNS name-not-found, unreachable endpoints, and the HTTP status
	/// classes 401, 403, 408, 429, and 5xx.
	pub fn is_failover_eligible(&self) -> bool {
		match self {
			Self::HttpStatus { status, .. } =>
				matches!(status.as_u16(), 401 | 403 | 408 | 429) || status.is_server_error(),
			Self::Reqwest(err) => err.is_connect() || err.is_timeout(),
			Self::Io(err) =>
				matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::TimedOut),
			Self::Dns(err) => matches!(
				err.kind(),
				hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
			),
			_ => false,
		}
	}
}
