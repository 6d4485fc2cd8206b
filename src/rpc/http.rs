//! Session client that talks to a protocol gateway over HTTP
//!
//! The gateway owns envelope signing and the wire encoding; this adapter
//! posts JSON envelopes to it and maps HTTP failures onto [`ScanError`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{Envelope, RpcCall, SessionClient, SessionFactory};
use crate::geo::Location;
use crate::identity::{Credentials, DeviceInfo, Provider};
use crate::types::{now_secs, Result, ScanError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: Option<&'a str>,
    provider: Provider,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    position: Location,
    device: &'a DeviceInfo,
    access_token: &'a str,
    requests: &'a [RpcCall],
}

/// Creates [`HttpSessionClient`]s bound to one gateway endpoint
pub struct HttpSessionFactory {
    endpoint: String,
}

impl HttpSessionFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self, device: &DeviceInfo, proxy: Option<&str>) -> Arc<dyn SessionClient> {
        Arc::new(HttpSessionClient::new(&self.endpoint, device.clone(), proxy))
    }
}

pub struct HttpSessionClient {
    endpoint: String,
    device: DeviceInfo,
    client: std::result::Result<reqwest::Client, String>,
    runtime: Option<Handle>,
    position: Mutex<Location>,
    credentials: Mutex<Option<Credentials>>,
}

impl HttpSessionClient {
    pub fn new(endpoint: &str, device: DeviceInfo, proxy: Option<&str>) -> Self {
        let client = build_client(proxy).map_err(|e| {
            warn!(proxy = ?proxy, error = %e, "Failed to build session HTTP client");
            e
        });

        Self {
            endpoint: endpoint.to_string(),
            device,
            client,
            runtime: Handle::try_current().ok(),
            position: Mutex::new(Location::default()),
            credentials: Mutex::new(None),
        }
    }

    /// Run a request future to completion from a blocking thread
    fn post(&self, path: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let client = self.client.as_ref().map_err(|e| ScanError::Transport(e.clone()))?;
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ScanError::Internal("session opened outside a runtime".into()))?;
        let url = format!("{}/{}", self.endpoint, path);

        runtime
            .block_on(client.post(&url).json(body).send())
            .map_err(map_transport_error)
    }

    fn read_json(&self, response: reqwest::Response) -> Result<Value> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ScanError::Internal("session opened outside a runtime".into()))?;
        runtime
            .block_on(response.json::<Value>())
            .map_err(|e| ScanError::MalformedResponse(e.to_string()))
    }
}

fn build_client(proxy: Option<&str>) -> std::result::Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| format!("invalid proxy: {}", e))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| e.to_string())
}

fn map_transport_error(e: reqwest::Error) -> ScanError {
    if e.is_timeout() || e.is_connect() {
        ScanError::ServerBusy
    } else {
        ScanError::Transport(e.to_string())
    }
}

/// Map a gateway status code onto the failure taxonomy
pub fn classify_status(status: StatusCode) -> Option<ScanError> {
    match status {
        s if s.is_success() => None,
        StatusCode::FORBIDDEN => Some(ScanError::EgressBanned),
        StatusCode::UNAUTHORIZED => Some(ScanError::NotAuthenticated),
        StatusCode::TOO_MANY_REQUESTS => Some(ScanError::Throttled),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Some(ScanError::ServerBusy)
        }
        other => Some(ScanError::Transport(format!("gateway returned {}", other))),
    }
}

impl SessionClient for HttpSessionClient {
    fn set_position(&self, location: Location) {
        *self.position.lock().unwrap_or_else(|e| e.into_inner()) = location;
    }

    fn authenticate(
        &self,
        username: &str,
        password: Option<&str>,
        provider: Provider,
    ) -> Result<Credentials> {
        let response = self.post(
            "auth",
            &AuthRequest {
                username,
                password,
                provider,
            },
        )?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ScanError::AuthRejected(format!("gateway returned {}", status)));
        }
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let credentials: Credentials = serde_json::from_value(self.read_json(response)?)?;
        debug!(username, expiry = credentials.expiry, "Authenticated");
        *self.credentials.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        Ok(credentials)
    }

    fn restore(&self, credentials: &Credentials) -> bool {
        if !credentials.is_valid_at(now_secs()) {
            return false;
        }
        *self.credentials.lock().unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        true
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn send(&self, envelope: &Envelope) -> Result<Value> {
        let token = self
            .credentials()
            .map(|c| c.access_token)
            .ok_or(ScanError::NotAuthenticated)?;
        let position = *self.position.lock().unwrap_or_else(|e| e.into_inner());

        let response = self.post(
            "rpc",
            &RpcRequest {
                position,
                device: &self.device,
                access_token: &token,
                requests: &envelope.calls,
            },
        )?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }
        self.read_json(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            Some(ScanError::EgressBanned)
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(ScanError::NotAuthenticated)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ScanError::Throttled)
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(ScanError::ServerBusy)
        );
        assert!(matches!(
            classify_status(StatusCode::IM_A_TEAPOT),
            Some(ScanError::Transport(_))
        ));
    }

    #[test]
    fn test_send_requires_credentials() {
        let device = DeviceInfo::for_identity(&crate::identity::Identity::new("walker1", "pw"));
        let client = HttpSessionClient::new("http://127.0.0.1:1", device, None);
        assert_eq!(
            client.send(&Envelope::empty()).unwrap_err(),
            ScanError::NotAuthenticated
        );
    }

    #[test]
    fn test_restore_rejects_expired() {
        let device = DeviceInfo::for_identity(&crate::identity::Identity::new("walker1", "pw"));
        let client = HttpSessionClient::new("http://127.0.0.1:1", device, None);
        let expired = Credentials {
            access_token: "t".into(),
            expiry: 1,
            refresh_token: Some("r".into()),
        };
        assert!(!client.restore(&expired));
        assert!(client.credentials().is_none());

        let fresh = Credentials {
            expiry: now_secs() + 3600,
            ..expired
        };
        assert!(client.restore(&fresh));
        assert_eq!(client.credentials(), Some(fresh));
    }
}
