//! Typed views over the response payloads the worker reads
//!
//! Session clients hand back a JSON tree. Only the parts the worker acts on
//! are given a shape here; everything else stays as `Value`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::types::{Result, ScanError};

/// Decode one response payload, reporting shape problems as malformed
pub fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T> {
    T::deserialize(value)
        .map_err(|e| ScanError::MalformedResponse(format!("{}: {}", name, e)))
}

/// Status value of a successful map fetch
pub const MAP_STATUS_SUCCESS: i64 = 1;
/// Fort type of interactable waypoints
pub const FORT_TYPE_WAYPOINT: i64 = 1;
/// Result code of a successful waypoint interaction
pub const FORT_SEARCH_SUCCESS: i64 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapObjects {
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub map_cells: Vec<MapCell>,
}

impl MapObjects {
    pub fn is_success(&self) -> bool {
        self.status == Some(MAP_STATUS_SUCCESS)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapCell {
    pub current_timestamp_ms: i64,
    #[serde(default)]
    pub wild_pokemons: Vec<WildSighting>,
    #[serde(default)]
    pub forts: Vec<Fort>,
    #[serde(default)]
    pub spawn_points: Vec<SpawnPoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeciesData {
    pub pokemon_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WildSighting {
    pub encounter_id: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub spawn_point_id: String,
    pub time_till_hidden_ms: i64,
    pub last_modified_timestamp_ms: i64,
    pub pokemon_data: SpeciesData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LureInfo {
    pub encounter_id: u64,
    pub active_pokemon_id: u32,
    pub lure_expires_timestamp_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fort {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub fort_type: i64,
    #[serde(default)]
    pub lure_info: Option<LureInfo>,
    #[serde(default)]
    pub owned_by_team: u32,
    #[serde(default)]
    pub gym_points: u64,
    #[serde(default)]
    pub guard_pokemon_id: u32,
    #[serde(default)]
    pub last_modified_timestamp_ms: i64,
    #[serde(default)]
    pub cooldown_complete_timestamp_ms: Option<i64>,
}

impl Fort {
    pub fn is_waypoint(&self) -> bool {
        self.fort_type == FORT_TYPE_WAYPOINT
    }
}

/// An advertised spawn location not currently holding a sighting
#[derive(Debug, Clone, Deserialize)]
pub struct SpawnPoint {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// `GET_PLAYER` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerResponse {
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub player_data: PlayerData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerData {
    #[serde(default)]
    pub tutorial_state: Vec<u32>,
    #[serde(default)]
    pub max_item_storage: Option<u32>,
}

/// `GET_INVENTORY` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryResponse {
    #[serde(default)]
    pub inventory_delta: InventoryDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryDelta {
    #[serde(default)]
    pub new_timestamp_ms: Option<u64>,
    #[serde(default)]
    pub inventory_items: Vec<InventoryItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryItem {
    #[serde(default)]
    pub inventory_item_data: InventoryItemData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryItemData {
    #[serde(default)]
    pub item: Option<ItemCount>,
    #[serde(default)]
    pub player_stats: Option<PlayerStats>,
    #[serde(default)]
    pub pokemon_data: Option<OwnedPokemon>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemCount {
    pub item_id: u32,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerStats {
    #[serde(default)]
    pub level: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnedPokemon {
    pub id: u64,
}

impl InventoryDelta {
    pub fn player_level(&self) -> Option<u32> {
        self.inventory_items
            .iter()
            .find_map(|i| i.inventory_item_data.player_stats.as_ref())
            .and_then(|s| s.level)
    }

    /// Last owned creature in the delta (the starter right after the tutorial)
    pub fn last_owned(&self) -> Option<u64> {
        self.inventory_items
            .iter()
            .filter_map(|i| i.inventory_item_data.pokemon_data.as_ref())
            .map(|p| p.id)
            .last()
    }
}

/// `ENCOUNTER` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncounterResponse {
    #[serde(default)]
    pub wild_pokemon: Option<EncounterWild>,
    #[serde(default)]
    pub capture_probability: Option<CaptureProbability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncounterWild {
    #[serde(default)]
    pub pokemon_data: EncounterData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncounterData {
    #[serde(default)]
    pub cp: Option<u32>,
    #[serde(default)]
    pub individual_attack: Option<u32>,
    #[serde(default)]
    pub individual_defense: Option<u32>,
    #[serde(default)]
    pub individual_stamina: Option<u32>,
    #[serde(default)]
    pub move_1: Option<u32>,
    #[serde(default)]
    pub move_2: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureProbability {
    /// Per-ball capture probability
    #[serde(default)]
    pub capture_probability: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_map_objects() {
        let value = json!({
            "status": 1,
            "map_cells": [{
                "current_timestamp_ms": 1_500_000_000_000i64,
                "wild_pokemons": [{
                    "encounter_id": 7,
                    "latitude": 40.0,
                    "longitude": -105.0,
                    "spawn_point_id": "87a2b",
                    "time_till_hidden_ms": 45000,
                    "last_modified_timestamp_ms": 1_500_000_000_000i64,
                    "pokemon_data": {"pokemon_id": 16}
                }],
                "forts": [{"id": "f1", "latitude": 40.0, "longitude": -105.0, "enabled": true, "type": 1}]
            }]
        });
        let map: MapObjects = decode("GET_MAP_OBJECTS", &value).unwrap();
        assert!(map.is_success());
        assert_eq!(map.map_cells[0].wild_pokemons[0].pokemon_data.pokemon_id, 16);
        assert!(map.map_cells[0].forts[0].is_waypoint());
        assert!(map.map_cells[0].spawn_points.is_empty());
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let value = json!({"status": 1, "map_cells": [{"wild_pokemons": []}]});
        let err = decode::<MapObjects>("GET_MAP_OBJECTS", &value).unwrap_err();
        assert!(matches!(err, ScanError::MalformedResponse(_)));
    }

    #[test]
    fn test_inventory_level_and_starter() {
        let value = json!({
            "inventory_delta": {
                "new_timestamp_ms": 99,
                "inventory_items": [
                    {"inventory_item_data": {"item": {"item_id": 1, "count": 5}}},
                    {"inventory_item_data": {"player_stats": {"level": 3}}},
                    {"inventory_item_data": {"pokemon_data": {"id": 1234}}}
                ]
            }
        });
        let inv: InventoryResponse = decode("GET_INVENTORY", &value).unwrap();
        assert_eq!(inv.inventory_delta.player_level(), Some(3));
        assert_eq!(inv.inventory_delta.last_owned(), Some(1234));
        assert_eq!(inv.inventory_delta.new_timestamp_ms, Some(99));
    }
}
