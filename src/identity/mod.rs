//! Identities - remote accounts and their session state
//!
//! An [`Identity`] is everything the worker needs to resume an account:
//! credentials, last position, pacing timestamps and the inventory snapshot.
//! It is owned by exactly one worker at a time and written back to the
//! [`AccountPool`] whenever it changes hands.

pub mod pool;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geo::Location;

pub use pool::AccountPool;

/// Seconds of access-token lifetime we require before trusting a stored token
const TOKEN_MARGIN_SECS: u64 = 60;

/// Authentication provider for an account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ptc,
    Google,
}

/// Token material returned by (and handed back to) a session client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    /// Access token expiry, seconds since the epoch
    pub expiry: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Credentials {
    pub fn is_valid_at(&self, now_secs: u64) -> bool {
        !self.access_token.is_empty() && self.expiry > now_secs + TOKEN_MARGIN_SECS
    }
}

/// One remote account and its persisted session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub location: Location,
    /// Milliseconds since the epoch of the last request sent
    #[serde(default)]
    pub last_request_ms: u64,
    #[serde(default)]
    pub last_action_ms: u64,
    #[serde(default)]
    pub last_map_fetch_ms: u64,
    /// Item id to carried count
    #[serde(default)]
    pub items: BTreeMap<u32, u32>,
    /// Inventory delta cursor
    #[serde(default)]
    pub inventory_timestamp: Option<u64>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub captcha: bool,
}

impl Identity {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            provider: Provider::Ptc,
            credentials: None,
            location: Location::default(),
            last_request_ms: 0,
            last_action_ms: 0,
            last_map_fetch_ms: 0,
            items: BTreeMap::new(),
            inventory_timestamp: None,
            banned: false,
            captcha: false,
        }
    }

    /// Carried item count across all item kinds
    pub fn item_count(&self) -> u32 {
        self.items.values().sum()
    }

    /// Credentials that can resume a session without logging in again
    pub fn resumable_credentials(&self, now_secs: u64) -> Option<&Credentials> {
        self.credentials
            .as_ref()
            .filter(|c| c.refresh_token.is_some() && c.is_valid_at(now_secs))
    }
}

/// Device fingerprint presented by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_brand: String,
    pub device_model: String,
    pub hardware_model: String,
    pub firmware_brand: String,
    pub firmware_type: String,
}

const DEVICE_MODELS: &[(&str, &str)] = &[
    ("iPhone", "iPhone8,1"),
    ("iPhone", "iPhone8,2"),
    ("iPhone", "iPhone9,1"),
    ("iPhone", "iPhone9,3"),
    ("iPad", "iPad5,4"),
    ("iPad", "iPad6,4"),
];

const FIRMWARE_VERSIONS: &[&str] = &["9.3.5", "10.0.2", "10.1.1", "10.2"];

impl DeviceInfo {
    /// Stable fingerprint derived from the username, so an account always
    /// presents the same device across runs.
    pub fn for_identity(identity: &Identity) -> Self {
        let digest = Sha256::digest(identity.username.as_bytes());
        let (model, hardware) = DEVICE_MODELS[digest[0] as usize % DEVICE_MODELS.len()];
        let firmware = FIRMWARE_VERSIONS[digest[1] as usize % FIRMWARE_VERSIONS.len()];

        Self {
            device_id: hex::encode(&digest[..16]),
            device_brand: "Apple".to_string(),
            device_model: model.to_string(),
            hardware_model: hardware.to_string(),
            firmware_brand: "iOS".to_string(),
            firmware_type: firmware.to_string(),
        }
    }
}
