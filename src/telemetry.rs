//! Correlation-Context header construction.
//!
//! The header is an opaque comma-separated list of `k=v` pairs and bare
//! tags describing how the provider is being used. Environment variables
//! are read at header-construction time, once per request.

// std
use std::env;
// self
use crate::feature::FeatureFlagUsage;

/// Name of the telemetry header attached to service requests.
pub const CORRELATION_CONTEXT_HEADER: &str = "Correlation-Context";

/// Environment variable suppressing the telemetry header entirely.
pub const TRACING_DISABLED_VAR: &str = "AZURE_APP_CONFIGURATION_TRACING_DISABLED";

const FUNCTIONS_VAR: &str = "FUNCTIONS_EXTENSION_VERSION";
const WEB_APP_VAR: &str = "WEBSITE_SITE_NAME";
const CONTAINER_APP_VAR: &str = "CONTAINER_APP_NAME";
const KUBERNETES_VAR: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_FABRIC_VAR: &str = "Fabric_NodeName";
const ENVIRONMENT_VAR: &str = "ENVIRONMENT";

/// Phase of the provider issuing the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
	/// Initial load has not completed yet.
	Startup,
	/// Steady-state refresh traffic.
	Watch,
}
impl RequestType {
	fn as_str(&self) -> &'static str {
		match self {
			Self::Startup => "Startup",
			Self::Watch => "Watch",
		}
	}
}

/// Usage facts accompanying one request.
#[derive(Clone, Debug, Default)]
pub struct RequestTracing {
	/// Phase of the provider issuing the request.
	pub request_type: Option<RequestType>,
	/// Number of dynamically discovered replicas.
	pub replica_count: usize,
	/// Whether Key Vault resolution is configured.
	pub uses_key_vault: bool,
	/// Whether this request is going to a non-primary endpoint after a
	/// failover.
	pub is_failover: bool,
	/// Aggregate feature-flag usage observed on the last load.
	pub features: FeatureFlagUsage,
}
impl RequestTracing {
	/// Build the header value, or `None` when tracing is disabled.
	pub fn header_value(&self) -> Option<String> {
		if tracing_disabled() {
			return None;
		}

		let mut parts = Vec::new();

		if let Some(request_type) = self.request_type {
			parts.push(format!("RequestType={}", request_type.as_str()));
		}
		if let Some(host) = detect_host() {
			parts.push(format!("Host={host}"));
		}
		if is_dev_environment() {
			parts.push("Env=Dev".into());
		}
		if self.replica_count > 0 {
			parts.push(format!("ReplicaCount={}", self.replica_count));
		}

		let filters = self.features.filter_tags();

		if !filters.is_empty() {
			parts.push(format!("Filter={}", filters.join("+")));
		}
		if self.features.max_variants > 0 {
			parts.push(format!("MaxVariants={}", self.features.max_variants));
		}

		let ff_features = self.features.feature_tags();

		if !ff_features.is_empty() {
			parts.push(format!("FFFeatures={}", ff_features.join("+")));
		}
		if self.uses_key_vault {
			parts.push("UsesKeyVault".into());
		}
		if self.is_failover {
			parts.push("Failover".into());
		}

		Some(parts.join(","))
	}
}

fn tracing_disabled() -> bool {
	env::var(TRACING_DISABLED_VAR).is_ok_and(|value| value.eq_ignore_ascii_case("true"))
}

fn detect_host() -> Option<&'static str> {
	if env::var_os(FUNCTIONS_VAR).is_some() {
		Some("AzureFunction")
	} else if env::var_os(WEB_APP_VAR).is_some() {
		Some("AzureWebApp")
	} else if env::var_os(CONTAINER_APP_VAR).is_some() {
		Some("ContainerApp")
	} else if env::var_os(KUBERNETES_VAR).is_some() {
		Some("Kubernetes")
	} else if env::var_os(SERVICE_FABRIC_VAR).is_some() {
		Some("ServiceFabric")
	} else {
		None
	}
}

fn is_dev_environment() -> bool {
	env::var(ENVIRONMENT_VAR).is_ok_and(|value| value.eq_ignore_ascii_case("development"))
}
