//! Despawn estimation, terrain altitudes and spawn candidates

use std::collections::HashMap;
use std::path::Path;

use dashmap::{DashMap, DashSet};
use serde::Deserialize;
use tracing::info;

use crate::geo::{Coordinate, GridKey};
use crate::types::{Result, ScanError};

/// Decimal places used for altitude lookups
pub const ALTITUDE_PRECISION: u8 = 3;
/// Decimal places used for spawn candidates (and the cell grid)
pub const CANDIDATE_PRECISION: u8 = 4;

const DEFAULT_ALTITUDE: f64 = 1800.0;

pub trait DespawnEstimator: Send + Sync {
    /// Despawn time (seconds since the epoch) for a spawn observed at `seen`
    fn estimate(&self, spawn_id: i64, seen: i64) -> Option<i64>;

    fn altitude_at(&self, key: GridKey) -> f64;

    /// Remember an advertised spawn location for a later survey
    fn record_candidate(&self, key: GridKey);
}

#[derive(Debug, Deserialize)]
struct AltitudeEntry {
    lat: f64,
    lon: f64,
    alt: f64,
}

#[derive(Debug, Deserialize)]
struct SpawnTableFile {
    #[serde(default)]
    default_altitude: Option<f64>,
    /// Spawn id to despawn second within the hour
    #[serde(default)]
    spawns: HashMap<i64, u32>,
    #[serde(default)]
    altitudes: Vec<AltitudeEntry>,
}

/// Known spawn points with their despawn second-of-hour
pub struct SpawnRegistry {
    despawn_seconds: DashMap<i64, u32>,
    altitudes: DashMap<GridKey, f64>,
    default_altitude: f64,
    candidates: DashSet<GridKey>,
}

impl Default for SpawnRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ALTITUDE)
    }
}

impl SpawnRegistry {
    pub fn new(default_altitude: f64) -> Self {
        Self {
            despawn_seconds: DashMap::new(),
            altitudes: DashMap::new(),
            default_altitude,
            candidates: DashSet::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: SpawnTableFile = serde_json::from_str(&content)
            .map_err(|e| ScanError::Io(format!("invalid spawn table: {}", e)))?;

        let registry = Self::new(file.default_altitude.unwrap_or(DEFAULT_ALTITUDE));
        for (spawn_id, second) in file.spawns {
            registry.insert_spawn(spawn_id, second);
        }
        for entry in file.altitudes {
            registry.insert_altitude(Coordinate::new(entry.lat, entry.lon), entry.alt);
        }
        info!(
            path = %path.display(),
            spawns = registry.despawn_seconds.len(),
            altitudes = registry.altitudes.len(),
            "Loaded spawn table"
        );
        Ok(registry)
    }

    pub fn insert_spawn(&self, spawn_id: i64, despawn_second: u32) {
        self.despawn_seconds.insert(spawn_id, despawn_second % 3600);
    }

    pub fn insert_altitude(&self, point: Coordinate, altitude: f64) {
        self.altitudes
            .insert(GridKey::round(point, ALTITUDE_PRECISION), altitude);
    }

    pub fn candidates(&self) -> Vec<GridKey> {
        let mut all: Vec<GridKey> = self.candidates.iter().map(|k| *k).collect();
        all.sort();
        all
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

impl DespawnEstimator for SpawnRegistry {
    fn estimate(&self, spawn_id: i64, seen: i64) -> Option<i64> {
        let second = i64::from(*self.despawn_seconds.get(&spawn_id)?);
        let hour_start = seen - seen.rem_euclid(3600);
        let mut despawn = hour_start + second;
        if despawn < seen {
            despawn += 3600;
        }
        Some(despawn)
    }

    fn altitude_at(&self, key: GridKey) -> f64 {
        self.altitudes
            .get(&key)
            .map(|a| *a)
            .unwrap_or(self.default_altitude)
    }

    fn record_candidate(&self, key: GridKey) {
        self.candidates.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_next_despawn() {
        let registry = SpawnRegistry::default();
        registry.insert_spawn(42, 1800);

        // 00:10 into the hour, despawn at 00:30
        let hour = 1_500_000_000 - 1_500_000_000 % 3600;
        assert_eq!(registry.estimate(42, hour + 600), Some(hour + 1800));
        // 00:40 into the hour, despawn at 00:30 of the next hour
        assert_eq!(registry.estimate(42, hour + 2400), Some(hour + 3600 + 1800));
        assert_eq!(registry.estimate(7, hour), None);
    }

    #[test]
    fn test_altitude_fallback() {
        let registry = SpawnRegistry::new(1500.0);
        let point = Coordinate::new(40.0011, -105.0013);
        registry.insert_altitude(point, 1620.0);

        assert_eq!(registry.altitude_at(GridKey::round(point, ALTITUDE_PRECISION)), 1620.0);
        assert_eq!(
            registry.altitude_at(GridKey::round(Coordinate::new(10.0, 10.0), ALTITUDE_PRECISION)),
            1500.0
        );
    }

    #[test]
    fn test_load_spawn_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawns.json");
        std::fs::write(
            &path,
            r#"{"default_altitude": 1700, "spawns": {"555": 120}, "altitudes": [{"lat": 1.0, "lon": 2.0, "alt": 30.0}]}"#,
        )
        .unwrap();

        let registry = SpawnRegistry::load(&path).unwrap();
        assert_eq!(registry.estimate(555, 0), Some(120));
        assert_eq!(
            registry.altitude_at(GridKey::round(Coordinate::new(1.0, 2.0), ALTITUDE_PRECISION)),
            30.0
        );
    }

    #[test]
    fn test_candidates_deduplicate() {
        let registry = SpawnRegistry::default();
        let key = GridKey::round(Coordinate::new(40.00011, -105.00013), CANDIDATE_PRECISION);
        registry.record_candidate(key);
        registry.record_candidate(key);
        assert_eq!(registry.candidate_count(), 1);
    }
}
