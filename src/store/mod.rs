//! Persistence and dedupe
//!
//! The worker only needs two things from storage: "have we already got
//! this sighting?" and "keep this entity". [`MemoryStore`] answers both from
//! in-process sets and can mirror new records to an [`EntityLog`].

pub mod writer;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::entity::{Entity, Sighting, SightingKey, Validity};

pub use writer::EntityLog;

/// The two logical dedupe sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSet {
    /// Sightings with a trusted expiry
    Sightings,
    /// Sightings whose expiry is unknown
    Mysteries,
}

pub trait EntityStore: Send + Sync {
    fn contains(&self, set: CacheSet, sighting: &Sighting) -> bool;

    /// Persist an entity. Adding the same entity again is a no-op.
    fn add(&self, entity: Entity);
}

#[derive(Default)]
pub struct MemoryStore {
    sightings: DashMap<SightingKey, Sighting>,
    mysteries: DashSet<u64>,
    forts: DashMap<String, Entity>,
    log: Option<EntityLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: EntityLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn sightings_len(&self) -> usize {
        self.sightings.len()
    }

    pub fn mysteries_len(&self) -> usize {
        self.mysteries.len()
    }

    pub fn forts_len(&self) -> usize {
        self.forts.len()
    }

    pub fn fort(&self, external_id: &str) -> Option<Entity> {
        self.forts.get(external_id).map(|e| e.value().clone())
    }

    pub fn sightings(&self) -> Vec<Sighting> {
        self.sightings.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop sightings that expired before `now_secs`
    pub fn prune(&self, now_secs: i64) -> usize {
        let before = self.sightings.len();
        self.sightings.retain(|_, s| s.expire_timestamp >= now_secs);
        before - self.sightings.len()
    }

    fn insert_sighting(&self, sighting: &Sighting) -> bool {
        if sighting.valid == Validity::Invalid {
            return self.mysteries.insert(sighting.encounter_id);
        }
        let key = sighting.key();
        if self.sightings.contains_key(&key) {
            return false;
        }
        self.sightings.insert(key, sighting.clone());
        true
    }

    fn fort_id(entity: &Entity) -> Option<&str> {
        match entity {
            Entity::Gym(g) => Some(&g.external_id),
            Entity::Waypoint(w) => Some(&w.external_id),
            _ => None,
        }
    }
}

impl EntityStore for MemoryStore {
    fn contains(&self, set: CacheSet, sighting: &Sighting) -> bool {
        match set {
            CacheSet::Sightings => self.sightings.contains_key(&sighting.key()),
            CacheSet::Mysteries => self.mysteries.contains(&sighting.encounter_id),
        }
    }

    fn add(&self, entity: Entity) {
        let stored = match &entity {
            Entity::Wild(s) | Entity::Lured(s) => self.insert_sighting(s),
            Entity::Gym(_) | Entity::Waypoint(_) => match Self::fort_id(&entity) {
                Some(id) => {
                    let changed = self.forts.get(id).map_or(true, |prev| *prev != entity);
                    if changed {
                        self.forts.insert(id.to_string(), entity.clone());
                    }
                    changed
                }
                None => false,
            },
        };

        if !stored {
            return;
        }
        debug!(kind = entity.kind(), "Entity stored");
        if let Some(log) = &self.log {
            log.append(&entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Gym, Waypoint};

    fn sighting(id: u64, valid: Validity) -> Sighting {
        Sighting {
            encounter_id: id,
            species_id: 16,
            expire_timestamp: 1_500_000_045,
            lat: 40.0,
            lon: -105.0,
            spawn_id: 1,
            time_till_hidden_ms: 45_000,
            seen: Some(1_500_000_000),
            valid,
            encounter: None,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.jsonl");
        let store = MemoryStore::with_log(EntityLog::open(&path).unwrap());

        let entity = Entity::Wild(sighting(1, Validity::Valid));
        store.add(entity.clone());
        store.add(entity);

        assert_eq!(store.sightings_len(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_invalid_sightings_become_mysteries() {
        let store = MemoryStore::new();
        let s = sighting(2, Validity::Invalid);
        store.add(Entity::Wild(s.clone()));

        assert!(store.contains(CacheSet::Mysteries, &s));
        assert!(!store.contains(CacheSet::Sightings, &s));
        assert_eq!(store.sightings_len(), 0);
    }

    #[test]
    fn test_forts_upsert_by_id() {
        let store = MemoryStore::new();
        let mut gym = Gym {
            external_id: "g1".into(),
            lat: 1.0,
            lon: 2.0,
            team: 1,
            prestige: 100,
            guard_pokemon_id: 3,
            last_modified: 10,
        };
        store.add(Entity::Gym(gym.clone()));
        gym.team = 2;
        store.add(Entity::Gym(gym));
        store.add(Entity::Waypoint(Waypoint {
            external_id: "w1".into(),
            lat: 1.0,
            lon: 2.0,
        }));

        assert_eq!(store.forts_len(), 2);
        match store.fort("g1") {
            Some(Entity::Gym(g)) => assert_eq!(g.team, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prune_expired() {
        let store = MemoryStore::new();
        store.add(Entity::Wild(sighting(3, Validity::Valid)));
        assert_eq!(store.prune(1_500_000_000), 0);
        assert_eq!(store.prune(1_500_000_100), 1);
        assert_eq!(store.sightings_len(), 0);
    }
}
