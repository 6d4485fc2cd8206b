//! Request chaining
//!
//! Every primary call goes out with the same bookkeeping calls appended
//! (challenge check, hatched eggs, inventory delta, badges, settings hash
//! and optionally buddy status). The responses to those calls are folded
//! back into the identity before the caller sees anything, so inventory and
//! challenge handling behave the same for a login step, a map fetch or a
//! waypoint spin.

use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::payload::{decode, InventoryResponse};
use super::{Envelope, NetworkExecutor, RpcCall, SessionClient};
use crate::identity::Identity;
use crate::types::{now_ms, Result, ScanError};

/// Outer status code marking the account as banned
const STATUS_ACCOUNT_BANNED: i64 = 3;

/// Settings hash the service hands out before any download
pub const INITIAL_SETTINGS_HASH: &str = "d3da400db60abf79ea05abc38e2396f0bbd453f9";

/// Which optional parts of the bookkeeping to include
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainOptions {
    /// Ask for an inventory delta from the stored cursor instead of a full fetch
    pub stamp: bool,
    pub buddy: bool,
    /// Send the cached settings hash with the settings check
    pub settings_hash: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            stamp: true,
            buddy: true,
            settings_hash: true,
        }
    }
}

impl ChainOptions {
    pub fn without_buddy() -> Self {
        Self {
            buddy: false,
            ..Self::default()
        }
    }
}

/// The settings hash shared by every session in the process
#[derive(Debug)]
pub struct SettingsHash(RwLock<String>);

impl Default for SettingsHash {
    fn default() -> Self {
        Self(RwLock::new(INITIAL_SETTINGS_HASH.to_string()))
    }
}

impl SettingsHash {
    pub fn get(&self) -> String {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, hash: &str) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = hash.to_string();
    }
}

/// Per-call payloads keyed by call name
#[derive(Debug, Clone, Default)]
pub struct Responses(Map<String, Value>);

static NULL: Value = Value::Null;

impl Responses {
    /// Payload for a call, `Null` when the response did not include it
    pub fn get(&self, name: &str) -> &Value {
        self.0.get(name).unwrap_or(&NULL)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Decode a payload that must be present
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        match self.0.get(name) {
            Some(value) => decode(name, value),
            None => Err(ScanError::MalformedResponse(format!("missing {}", name))),
        }
    }

    /// Decode a payload, falling back to the default when absent
    pub fn decode_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        match self.0.get(name) {
            Some(Value::Null) | None => Ok(T::default()),
            Some(value) => decode(name, value),
        }
    }

    pub fn settings_hash(&self) -> Option<&str> {
        self.get("DOWNLOAD_SETTINGS")
            .get("hash")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
    }

    pub fn challenge_url(&self) -> Option<&str> {
        self.get("CHECK_CHALLENGE")
            .get("challenge_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Build the envelope for a primary call plus bookkeeping
pub fn compose(
    primary: Option<RpcCall>,
    identity: &Identity,
    settings_hash: &str,
    options: ChainOptions,
) -> Envelope {
    let mut envelope = Envelope::default();
    if let Some(call) = primary {
        envelope.push(call);
    }
    envelope.push(RpcCall::CheckChallenge);
    envelope.push(RpcCall::GetHatchedEggs);
    envelope.push(RpcCall::GetInventory {
        last_timestamp_ms: identity.inventory_timestamp.filter(|_| options.stamp),
    });
    envelope.push(RpcCall::CheckAwardedBadges);
    envelope.push(RpcCall::DownloadSettings {
        hash: options.settings_hash.then(|| settings_hash.to_string()),
    });
    if options.buddy {
        envelope.push(RpcCall::GetBuddyWalked);
    }
    envelope
}

/// Fold the bookkeeping payloads of a response into the identity.
///
/// Order matters: a banned account is reported even when the rest of the
/// response is missing, and inventory is applied before a challenge is
/// raised so the snapshot stays current for the benched account.
pub fn apply_bookkeeping(identity: &mut Identity, response: &Value) -> Result<Responses> {
    if response.get("status_code").and_then(Value::as_i64) == Some(STATUS_ACCOUNT_BANNED) {
        return Err(ScanError::AccountBanned);
    }

    let responses = match response.get("responses") {
        Some(Value::Object(map)) => Responses(map.clone()),
        Some(_) => {
            return Err(ScanError::MalformedResponse(
                "responses is not an object".into(),
            ))
        }
        None => return Err(ScanError::MalformedResponse("missing responses".into())),
    };

    let inventory: InventoryResponse = responses.decode_or_default("GET_INVENTORY")?;
    let delta = inventory.inventory_delta;
    for entry in &delta.inventory_items {
        if let Some(item) = &entry.inventory_item_data.item {
            identity.items.insert(item.item_id, item.count);
        }
    }
    if let Some(stamp) = delta.new_timestamp_ms.filter(|s| *s > 0) {
        identity.inventory_timestamp = Some(stamp);
    }

    if let Some(url) = responses.challenge_url() {
        return Err(ScanError::ChallengeRequired(url.to_string()));
    }

    Ok(responses)
}

/// Sends chained requests for one session
pub struct RequestChain<'a> {
    client: Arc<dyn SessionClient>,
    network: &'a NetworkExecutor,
    settings_hash: &'a SettingsHash,
}

impl<'a> RequestChain<'a> {
    pub fn new(
        client: Arc<dyn SessionClient>,
        network: &'a NetworkExecutor,
        settings_hash: &'a SettingsHash,
    ) -> Self {
        Self {
            client,
            network,
            settings_hash,
        }
    }

    /// Send `primary` with the bookkeeping calls and apply their results
    pub async fn call(
        &self,
        identity: &mut Identity,
        primary: RpcCall,
        options: ChainOptions,
    ) -> Result<Responses> {
        let method = primary.name();
        let envelope = compose(Some(primary), identity, &self.settings_hash.get(), options);
        let response = self.send(envelope).await?;
        identity.last_request_ms = now_ms();

        let responses = apply_bookkeeping(identity, &response).map_err(|e| {
            if let ScanError::ChallengeRequired(url) = &e {
                warn!(username = %identity.username, challenge_url = %url, "Challenge received");
            }
            e
        })?;
        if let Some(hash) = responses.settings_hash() {
            self.settings_hash.set(hash);
        }
        debug!(username = %identity.username, method, "Chained call complete");
        Ok(responses)
    }

    /// Send an envelope as is, without bookkeeping
    pub async fn send(&self, envelope: Envelope) -> Result<Value> {
        let client = Arc::clone(&self.client);
        self.network.run(move || client.send(&envelope)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::new("walker1", "pw")
    }

    #[test]
    fn test_compose_full_inventory_without_cursor() {
        let id = identity();
        let envelope = compose(
            Some(RpcCall::GetPlayerProfile),
            &id,
            "abc",
            ChainOptions::default(),
        );
        assert_eq!(
            envelope.names(),
            vec![
                "GET_PLAYER_PROFILE",
                "CHECK_CHALLENGE",
                "GET_HATCHED_EGGS",
                "GET_INVENTORY",
                "CHECK_AWARDED_BADGES",
                "DOWNLOAD_SETTINGS",
                "GET_BUDDY_WALKED",
            ]
        );
        assert!(envelope.calls.contains(&RpcCall::GetInventory {
            last_timestamp_ms: None
        }));
    }

    #[test]
    fn test_compose_respects_options() {
        let mut id = identity();
        id.inventory_timestamp = Some(1234);

        let stamped = compose(None, &id, "abc", ChainOptions::default());
        assert!(stamped.calls.contains(&RpcCall::GetInventory {
            last_timestamp_ms: Some(1234)
        }));
        assert!(stamped.calls.contains(&RpcCall::DownloadSettings {
            hash: Some("abc".into())
        }));

        let bare = compose(
            None,
            &id,
            "abc",
            ChainOptions {
                stamp: false,
                buddy: false,
                settings_hash: false,
            },
        );
        assert!(bare.calls.contains(&RpcCall::GetInventory {
            last_timestamp_ms: None
        }));
        assert!(bare.calls.contains(&RpcCall::DownloadSettings { hash: None }));
        assert!(!bare.contains("GET_BUDDY_WALKED"));
    }

    #[test]
    fn test_bookkeeping_updates_inventory_and_cursor() {
        let mut id = identity();
        id.items.insert(2, 7);
        let response = json!({
            "status_code": 1,
            "responses": {
                "GET_INVENTORY": {"inventory_delta": {
                    "new_timestamp_ms": 5000,
                    "inventory_items": [{"inventory_item_data": {"item": {"item_id": 1, "count": 10}}}]
                }},
                "DOWNLOAD_SETTINGS": {"hash": "newhash"},
                "CHECK_CHALLENGE": {"challenge_url": " "}
            }
        });

        let responses = apply_bookkeeping(&mut id, &response).unwrap();
        assert_eq!(id.item_count(), 17);
        assert_eq!(id.inventory_timestamp, Some(5000));
        assert_eq!(responses.settings_hash(), Some("newhash"));
    }

    #[test]
    fn test_bookkeeping_keeps_cursor_when_absent() {
        let mut id = identity();
        id.inventory_timestamp = Some(42);
        let response = json!({"status_code": 1, "responses": {}});
        apply_bookkeeping(&mut id, &response).unwrap();
        assert_eq!(id.inventory_timestamp, Some(42));
    }

    #[test]
    fn test_bookkeeping_failures() {
        let mut id = identity();

        let banned = json!({"status_code": 3});
        assert_eq!(
            apply_bookkeeping(&mut id, &banned).unwrap_err(),
            ScanError::AccountBanned
        );

        let missing = json!({"status_code": 1});
        assert!(matches!(
            apply_bookkeeping(&mut id, &missing).unwrap_err(),
            ScanError::MalformedResponse(_)
        ));

        let challenged = json!({
            "status_code": 1,
            "responses": {"CHECK_CHALLENGE": {"challenge_url": "https://challenge.example/1"}}
        });
        assert_eq!(
            apply_bookkeeping(&mut id, &challenged).unwrap_err(),
            ScanError::ChallengeRequired("https://challenge.example/1".into())
        );
    }

    #[test]
    fn test_settings_hash_shared() {
        let hash = SettingsHash::default();
        assert_eq!(hash.get(), INITIAL_SETTINGS_HASH);
        hash.set("fresh");
        assert_eq!(hash.get(), "fresh");
    }
}
