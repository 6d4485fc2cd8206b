//! Normalized entities handed to the store
//!
//! Raw map payloads are turned into these value types once per observation.
//! Equality is by content, which is what the dedupe sets compare on.

use serde::{Deserialize, Serialize};

use crate::rpc::payload::{EncounterData, Fort, WildSighting};

/// Largest time-till-hidden the service reports accurately (ms)
pub const MAX_ACCURATE_TTH_MS: i64 = 90_000;

/// Spawn id used for sightings attached to a lure instead of a spawn point
pub const LURE_SPAWN_ID: i64 = -1;

/// How much the expiry of a sighting can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    /// Expiry derived from an accurate reported timer
    Valid,
    /// Timer was out of range; expiry patched from the despawn estimator
    Fixed,
    /// Timer out of range and no estimate available
    Invalid,
    /// Expiry taken from a lure on a waypoint
    Lure,
}

impl Validity {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Validity::Invalid)
    }
}

/// Stats attached after a deep encounter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncounterStats {
    pub cp: u32,
    pub individual_attack: u32,
    pub individual_defense: u32,
    pub individual_stamina: u32,
    pub move_1: Option<u32>,
    pub move_2: Option<u32>,
    pub probability: Vec<f64>,
}

impl EncounterStats {
    /// Build stats from an encounter payload; `None` when no combat
    /// power was reported. Missing per-stat values default to zero.
    pub fn from_payload(data: &EncounterData, probability: Vec<f64>) -> Option<Self> {
        let cp = data.cp?;
        Some(Self {
            cp,
            individual_attack: data.individual_attack.unwrap_or(0),
            individual_defense: data.individual_defense.unwrap_or(0),
            individual_stamina: data.individual_stamina.unwrap_or(0),
            move_1: data.move_1,
            move_2: data.move_2,
            probability,
        })
    }
}

/// A creature observation, wild or lured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub encounter_id: u64,
    pub species_id: u32,
    /// Seconds since the epoch
    pub expire_timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub spawn_id: i64,
    pub time_till_hidden_ms: i64,
    /// Last-modified time reported by the service, seconds since the epoch
    pub seen: Option<i64>,
    pub valid: Validity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encounter: Option<EncounterStats>,
}

/// Dedupe key for sightings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SightingKey {
    pub encounter_id: u64,
    pub expire_timestamp: i64,
}

impl Sighting {
    pub fn key(&self) -> SightingKey {
        SightingKey {
            encounter_id: self.encounter_id,
            expire_timestamp: self.expire_timestamp,
        }
    }

    /// Whether the reported timer falls inside the accurate window
    pub fn has_accurate_timer(&self) -> bool {
        (0..=MAX_ACCURATE_TTH_MS).contains(&self.time_till_hidden_ms)
    }

    /// Apply a despawn estimate to an out-of-range sighting
    pub fn resolve_validity(&mut self, estimate: Option<i64>, request_time_ms: i64) {
        if self.has_accurate_timer() {
            self.valid = Validity::Valid;
            return;
        }
        match estimate {
            Some(despawn) => {
                self.expire_timestamp = despawn;
                self.time_till_hidden_ms = despawn * 1000 - request_time_ms;
                self.valid = Validity::Fixed;
            }
            None => self.valid = Validity::Invalid,
        }
    }

    pub fn with_encounter(mut self, stats: Option<EncounterStats>) -> Self {
        self.encounter = stats;
        self
    }
}

/// Spawn ids are hex strings on the wire
pub fn parse_spawn_id(raw: &str) -> i64 {
    i64::from_str_radix(raw, 16).unwrap_or(0)
}

/// Round milliseconds to whole seconds
fn ms_to_secs(ms: i64) -> i64 {
    (ms as f64 / 1000.0).round() as i64
}

/// Normalize a wild sighting. Validity is left `Valid` for accurate timers
/// and `Invalid` otherwise until [`Sighting::resolve_validity`] runs.
pub fn normalize_wild(raw: &WildSighting, request_time_ms: i64) -> Sighting {
    let mut sighting = Sighting {
        encounter_id: raw.encounter_id,
        species_id: raw.pokemon_data.pokemon_id,
        expire_timestamp: ms_to_secs(request_time_ms + raw.time_till_hidden_ms),
        lat: raw.latitude,
        lon: raw.longitude,
        spawn_id: parse_spawn_id(&raw.spawn_point_id),
        time_till_hidden_ms: raw.time_till_hidden_ms,
        seen: Some(ms_to_secs(raw.last_modified_timestamp_ms)),
        valid: Validity::Invalid,
        encounter: None,
    };
    if sighting.has_accurate_timer() {
        sighting.valid = Validity::Valid;
    }
    sighting
}

/// Synthesize the sighting attached to a lured waypoint
pub fn normalize_lured(fort: &Fort, request_time_ms: i64) -> Option<Sighting> {
    let lure = fort.lure_info.as_ref()?;
    Some(Sighting {
        encounter_id: lure.encounter_id,
        species_id: lure.active_pokemon_id,
        expire_timestamp: lure.lure_expires_timestamp_ms / 1000,
        lat: fort.latitude,
        lon: fort.longitude,
        spawn_id: LURE_SPAWN_ID,
        time_till_hidden_ms: lure.lure_expires_timestamp_ms - request_time_ms,
        seen: None,
        valid: Validity::Lure,
        encounter: None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gym {
    pub external_id: String,
    pub lat: f64,
    pub lon: f64,
    pub team: u32,
    pub prestige: u64,
    pub guard_pokemon_id: u32,
    /// Seconds since the epoch
    pub last_modified: i64,
}

pub fn normalize_gym(fort: &Fort) -> Gym {
    Gym {
        external_id: fort.id.clone(),
        lat: fort.latitude,
        lon: fort.longitude,
        team: fort.owned_by_team,
        prestige: fort.gym_points,
        guard_pokemon_id: fort.guard_pokemon_id,
        last_modified: ms_to_secs(fort.last_modified_timestamp_ms),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub external_id: String,
    pub lat: f64,
    pub lon: f64,
}

pub fn normalize_waypoint(fort: &Fort) -> Waypoint {
    Waypoint {
        external_id: fort.id.clone(),
        lat: fort.latitude,
        lon: fort.longitude,
    }
}

/// Everything the store accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entity {
    Wild(Sighting),
    Lured(Sighting),
    Gym(Gym),
    Waypoint(Waypoint),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Wild(_) => "wild",
            Entity::Lured(_) => "lured",
            Entity::Gym(_) => "gym",
            Entity::Waypoint(_) => "waypoint",
        }
    }

    pub fn sighting(&self) -> Option<&Sighting> {
        match self {
            Entity::Wild(s) | Entity::Lured(s) => Some(s),
            _ => None,
        }
    }
}
