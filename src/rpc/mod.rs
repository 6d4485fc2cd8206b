//! Remote calls: envelopes, the session client seam and the network pool
//!
//! The wire protocol itself lives behind [`SessionClient`]. Everything in
//! this module is about what the workers ask for, not how it is encoded.

pub mod chain;
pub mod http;
pub mod payload;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::geo::Location;
use crate::identity::{Credentials, DeviceInfo, Provider};
use crate::types::{Result, ScanError};

pub use chain::{ChainOptions, RequestChain, Responses, SettingsHash};

/// Locale reported with player fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLocale {
    pub country: String,
    pub language: String,
    pub timezone: String,
}

impl Default for PlayerLocale {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            language: "en".to_string(),
            timezone: "America/Denver".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Avatar {
    pub hair: u32,
    pub shirt: u32,
    pub pants: u32,
    pub shoes: u32,
    pub gender: u32,
    pub eyes: u32,
    pub backpack: u32,
}

/// One call inside an envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCall {
    GetPlayer {
        player_locale: PlayerLocale,
    },
    DownloadRemoteConfigVersion {
        platform: u32,
        app_version: u32,
    },
    GetAssetDigest {
        platform: u32,
        app_version: u32,
    },
    GetPlayerProfile,
    LevelUpRewards {
        level: u32,
    },
    RegisterBackgroundDevice {
        device_type: String,
    },
    MarkTutorialComplete {
        tutorials_completed: u32,
    },
    SetAvatar {
        player_avatar: Avatar,
    },
    GetDownloadUrls {
        asset_id: Vec<String>,
    },
    EncounterTutorialComplete {
        pokemon_id: u32,
    },
    ClaimCodename {
        codename: String,
    },
    SetBuddyPokemon {
        pokemon_id: u64,
    },
    GetMapObjects {
        cell_id: Vec<u64>,
        since_timestamp_ms: Vec<u64>,
        latitude: f64,
        longitude: f64,
    },
    FortDetails {
        fort_id: String,
        latitude: f64,
        longitude: f64,
    },
    FortSearch {
        fort_id: String,
        player_latitude: f64,
        player_longitude: f64,
        fort_latitude: f64,
        fort_longitude: f64,
    },
    Encounter {
        encounter_id: u64,
        spawn_point_id: String,
        player_latitude: f64,
        player_longitude: f64,
    },
    CheckChallenge,
    GetHatchedEggs,
    GetInventory {
        #[serde(skip_serializing_if = "Option::is_none")]
        last_timestamp_ms: Option<u64>,
    },
    CheckAwardedBadges,
    DownloadSettings {
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
    GetBuddyWalked,
}

impl RpcCall {
    /// Key of this call's payload in the response map
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::GetPlayer { .. } => "GET_PLAYER",
            RpcCall::DownloadRemoteConfigVersion { .. } => "DOWNLOAD_REMOTE_CONFIG_VERSION",
            RpcCall::GetAssetDigest { .. } => "GET_ASSET_DIGEST",
            RpcCall::GetPlayerProfile => "GET_PLAYER_PROFILE",
            RpcCall::LevelUpRewards { .. } => "LEVEL_UP_REWARDS",
            RpcCall::RegisterBackgroundDevice { .. } => "REGISTER_BACKGROUND_DEVICE",
            RpcCall::MarkTutorialComplete { .. } => "MARK_TUTORIAL_COMPLETE",
            RpcCall::SetAvatar { .. } => "SET_AVATAR",
            RpcCall::GetDownloadUrls { .. } => "GET_DOWNLOAD_URLS",
            RpcCall::EncounterTutorialComplete { .. } => "ENCOUNTER_TUTORIAL_COMPLETE",
            RpcCall::ClaimCodename { .. } => "CLAIM_CODENAME",
            RpcCall::SetBuddyPokemon { .. } => "SET_BUDDY_POKEMON",
            RpcCall::GetMapObjects { .. } => "GET_MAP_OBJECTS",
            RpcCall::FortDetails { .. } => "FORT_DETAILS",
            RpcCall::FortSearch { .. } => "FORT_SEARCH",
            RpcCall::Encounter { .. } => "ENCOUNTER",
            RpcCall::CheckChallenge => "CHECK_CHALLENGE",
            RpcCall::GetHatchedEggs => "GET_HATCHED_EGGS",
            RpcCall::GetInventory { .. } => "GET_INVENTORY",
            RpcCall::CheckAwardedBadges => "CHECK_AWARDED_BADGES",
            RpcCall::DownloadSettings { .. } => "DOWNLOAD_SETTINGS",
            RpcCall::GetBuddyWalked => "GET_BUDDY_WALKED",
        }
    }
}

/// An ordered batch of calls sent as one request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Envelope {
    pub calls: Vec<RpcCall>,
}

impl Envelope {
    /// An envelope with no calls (used as a warm-up request)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(call: RpcCall) -> Self {
        Self { calls: vec![call] }
    }

    pub fn push(&mut self, call: RpcCall) {
        self.calls.push(call);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.calls.iter().map(RpcCall::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.calls.iter().any(|c| c.name() == name)
    }
}

/// A signed, authenticated connection to the remote service for one
/// identity.
///
/// Implementations block; the worker only calls them through
/// [`NetworkExecutor`] so slow round trips never stall the runtime.
pub trait SessionClient: Send + Sync {
    fn set_position(&self, location: Location);

    /// Log in and return the resulting credentials
    fn authenticate(
        &self,
        username: &str,
        password: Option<&str>,
        provider: Provider,
    ) -> Result<Credentials>;

    /// Resume from stored credentials; returns whether the session is usable
    fn restore(&self, credentials: &Credentials) -> bool;

    /// Current credentials, if the session ever authenticated
    fn credentials(&self) -> Option<Credentials>;

    /// Send an envelope and return the decoded response tree
    fn send(&self, envelope: &Envelope) -> Result<Value>;
}

/// Opens session clients for identities
pub trait SessionFactory: Send + Sync {
    fn open(&self, device: &DeviceInfo, proxy: Option<&str>) -> Arc<dyn SessionClient>;
}

/// Bounded pool for blocking network calls.
///
/// The permit count is independent of the worker count; workers beyond it
/// simply queue.
#[derive(Clone)]
pub struct NetworkExecutor {
    permits: Arc<Semaphore>,
}

impl NetworkExecutor {
    pub fn new(threads: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(threads.max(1))),
        }
    }

    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScanError::Internal("network pool closed".into()))?;

        tokio::task::spawn_blocking(call)
            .await
            .map_err(|e| ScanError::Internal(format!("network task failed: {}", e)))?
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serializes_with_method_tag() {
        let call = RpcCall::GetInventory {
            last_timestamp_ms: Some(42),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["method"], "GET_INVENTORY");
        assert_eq!(json["last_timestamp_ms"], 42);

        let full = serde_json::to_value(RpcCall::GetInventory {
            last_timestamp_ms: None,
        })
        .unwrap();
        assert!(full.get("last_timestamp_ms").is_none());
    }

    #[test]
    fn test_names_match_serialized_method() {
        let calls = vec![
            RpcCall::GetPlayerProfile,
            RpcCall::CheckAwardedBadges,
            RpcCall::DownloadRemoteConfigVersion {
                platform: 1,
                app_version: 5102,
            },
            RpcCall::GetBuddyWalked,
        ];
        for call in calls {
            let json = serde_json::to_value(&call).unwrap();
            assert_eq!(json["method"], call.name());
        }
    }

    #[tokio::test]
    async fn test_executor_runs_blocking_call() {
        let executor = NetworkExecutor::new(2);
        let value = executor.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(executor.available(), 2);

        let err = executor
            .run(|| -> Result<()> { Err(ScanError::ServerBusy) })
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::ServerBusy);
    }
}
