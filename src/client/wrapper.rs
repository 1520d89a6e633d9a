//! Per-endpoint client handle with backoff state.

// std
use std::sync::Mutex;
// crates.io
use url::Url;
// self
use crate::{
	_prelude::*,
	client::transport::SettingsClient,
	timer::{MAX_BACKOFF, MIN_BACKOFF, jittered_backoff},
};

#[derive(Debug)]
struct BackoffState {
	failed_attempts: u32,
	backoff_end: Instant,
}

/// One endpoint's transport handle together with its failure bookkeeping.
///
/// The wrapper is shared between the manager's rotation logic and the
/// request path; backoff state is only updated by whichever component
/// issued the request.
#[derive(Debug)]
pub(crate) struct ClientWrapper {
	endpoint: Url,
	client: Arc<dyn SettingsClient>,
	state: Mutex<BackoffState>,
}
impl ClientWrapper {
	pub fn new(endpoint: Url, client: Arc<dyn SettingsClient>) -> Self {
		Self {
			endpoint,
			client,
			state: Mutex::new(BackoffState { failed_attempts: 0, backoff_end: Instant::now() }),
		}
	}

	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	pub fn client(&self) -> &Arc<dyn SettingsClient> {
		&self.client
	}

	/// Whether the endpoint's backoff window has expired.
	pub fn is_available(&self) -> bool {
		let state = self.state.lock().expect("backoff state poisoned");

		Instant::now() >= state.backoff_end
	}

	/// Record the outcome of a request against this endpoint.
	///
	/// Success clears the failure count and reopens the endpoint; failure
	/// pushes the endpoint out by the next exponential delay.
	pub fn update_backoff(&self, success: bool) {
		let mut state = self.state.lock().expect("backoff state poisoned");
		let now = Instant::now();

		if success {
			state.failed_attempts = 0;
			state.backoff_end = now;
		} else {
			state.failed_attempts = state.failed_attempts.saturating_add(1);
			state.backoff_end =
				now + jittered_backoff(MIN_BACKOFF, MAX_BACKOFF, state.failed_attempts);
		}
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use async_trait::async_trait;
	// self
	use super::*;
	use crate::{
		client::transport::{RequestContext, SettingResponse, SettingsPage, SnapshotInfo},
		selector::SettingSelector,
	};

	#[derive(Debug)]
	struct NoopClient;
	#[async_trait]
	impl SettingsClient for NoopClient {
		async fn list_settings(
			&self,
			_: &SettingSelector,
			_: Option<&[String]>,
			_: &RequestContext,
		) -> crate::Result<Vec<SettingsPage>> {
			Ok(Vec::new())
		}

		async fn get_setting(
			&self,
			_: &str,
			_: Option<&str>,
			_: Option<&str>,
			_: &RequestContext,
		) -> crate::Result<SettingResponse> {
			Ok(SettingResponse::NotFound)
		}

		async fn get_snapshot(&self, name: &str, _: &RequestContext) -> crate::Result<SnapshotInfo> {
			Ok(SnapshotInfo { name: name.into(), composition_type: "key".into() })
		}

		async fn list_snapshot_settings(
			&self,
			_: &str,
			_: &RequestContext,
		) -> crate::Result<Vec<SettingsPage>> {
			Ok(Vec::new())
		}
	}

	fn wrapper() -> ClientWrapper {
		ClientWrapper::new(Url::parse("https://store.azconfig.io").unwrap(), Arc::new(NoopClient))
	}

	#[test]
	fn failures_close_the_endpoint_and_success_reopens_it() {
		let wrapper = wrapper();

		assert!(wrapper.is_available());

		wrapper.update_backoff(false);

		assert!(!wrapper.is_available());

		wrapper.update_backoff(true);

		assert!(wrapper.is_available());
	}
}
