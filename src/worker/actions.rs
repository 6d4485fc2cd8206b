//! Deeper interactions at a point: encounters, waypoint spins, egress swaps

use tracing::{info, warn};

use super::{reopen_session, Session, Worker};
use crate::egress::Rotation;
use crate::entity::{EncounterStats, Waypoint};
use crate::geo::{distance_m, Coordinate, Location};
use crate::pacing::{random_sleep, secs, triangular, uniform};
use crate::rpc::payload::{EncounterResponse, WildSighting, FORT_SEARCH_SUCCESS};
use crate::rpc::{ChainOptions, RpcCall};
use crate::status::WorkerStatus;
use crate::types::{now_ms, Result};

/// Encounters farther than this (m) need a walk first
const ENCOUNTER_REACH_M: f64 = 47.0;
/// Distance (m) left between the walker and the sighting after a walk
const ENCOUNTER_STANDOFF_M: f64 = 46.0;
/// Walking pace used to derive the delay before an encounter (m/s)
const WALK_SPEED_MPS: f64 = 8.0;
/// Waypoints farther than this (m) cannot be spun
const SPIN_REACH_M: f64 = 40.0;
const POSITION_JITTER_DEG: f64 = 0.00002;

impl Worker {
    /// Walk toward a sighting if needed, then encounter it.
    ///
    /// Returns stats when the response carried them.
    pub(crate) async fn encounter(
        &self,
        session: &mut Session,
        raw: &WildSighting,
    ) -> Result<Option<EncounterStats>> {
        let target = Coordinate::new(raw.latitude, raw.longitude);
        let here = session.identity.location;
        let distance = distance_m(here.coordinate(), target);

        let delay = if distance > ENCOUNTER_REACH_M {
            let percent = 1.0 - ENCOUNTER_STANDOFF_M / distance;
            let moved = Location {
                lat: here.lat - (here.lat - target.lat) * percent,
                lon: here.lon - (here.lon - target.lon) * percent,
                alt: uniform(here.alt - 3.0, here.alt + 3.0),
            };
            session.identity.location = moved;
            session.client.set_position(moved);

            let walk = distance * percent / WALK_SPEED_MPS;
            if walk < 1.5 {
                triangular(1.25, 4.0, 2.0)
            } else {
                walk
            }
        } else {
            self.jitter(session);
            triangular(1.25, 4.0, 2.0)
        };

        let since_request = now_ms().saturating_sub(session.identity.last_request_ms) as f64 / 1000.0;
        if since_request < delay {
            self.set_status(WorkerStatus::Waiting);
            tokio::time::sleep(secs(delay - since_request)).await;
        }

        self.set_status(WorkerStatus::Encountering);
        let location = session.identity.location;
        let responses = self
            .chain(
                session,
                RpcCall::Encounter {
                    encounter_id: raw.encounter_id,
                    spawn_point_id: raw.spawn_point_id.clone(),
                    player_latitude: location.lat,
                    player_longitude: location.lon,
                },
                ChainOptions::default(),
            )
            .await?;
        session.identity.last_action_ms = now_ms() + 1500;

        let response: EncounterResponse = responses.decode_or_default("ENCOUNTER")?;
        let data = response
            .wild_pokemon
            .map(|w| w.pokemon_data)
            .unwrap_or_default();
        let probability = response
            .capture_probability
            .map(|p| p.capture_probability)
            .unwrap_or_default();

        self.set_status(WorkerStatus::Visiting);
        Ok(EncounterStats::from_payload(&data, probability))
    }

    /// Spin a waypoint within reach.
    ///
    /// Returns `Ok(false)` when it was out of reach. A failed spin result is
    /// logged, not raised.
    pub(crate) async fn spin(&self, session: &mut Session, waypoint: &Waypoint) -> Result<bool> {
        self.set_status(WorkerStatus::Spinning);
        let here = session.identity.location;
        let target = Coordinate::new(waypoint.lat, waypoint.lon);
        if distance_m(here.coordinate(), target) > SPIN_REACH_M {
            self.set_status(WorkerStatus::Visiting);
            return Ok(false);
        }

        if now_ms() < session.identity.last_action_ms.saturating_add(1000) {
            tokio::time::sleep(secs(1.0)).await;
        }

        let responses = self
            .chain(
                session,
                RpcCall::FortDetails {
                    fort_id: waypoint.external_id.clone(),
                    latitude: waypoint.lat,
                    longitude: waypoint.lon,
                },
                ChainOptions::default(),
            )
            .await?;
        let name = responses
            .get("FORT_DETAILS")
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        random_sleep(0.6, 1.2).await;

        let responses = self
            .chain(
                session,
                RpcCall::FortSearch {
                    fort_id: waypoint.external_id.clone(),
                    player_latitude: here.lat,
                    player_longitude: here.lon,
                    fort_latitude: waypoint.lat,
                    fort_longitude: waypoint.lon,
                },
                ChainOptions::default(),
            )
            .await?;
        session.identity.last_action_ms = now_ms() + 250;

        let result = responses.get("FORT_SEARCH").get("result").and_then(|r| r.as_i64());
        if result == Some(FORT_SEARCH_SUCCESS) {
            info!(worker = self.id, waypoint = %name, "Spun waypoint");
        } else {
            warn!(worker = self.id, waypoint = %name, result = ?result, "Failed spinning waypoint");
        }
        self.set_status(WorkerStatus::Visiting);
        Ok(true)
    }

    /// Nudge the reported position a little
    fn jitter(&self, session: &mut Session) {
        let here = session.identity.location;
        let moved = Location {
            lat: uniform(here.lat - POSITION_JITTER_DEG, here.lat + POSITION_JITTER_DEG),
            lon: uniform(here.lon - POSITION_JITTER_DEG, here.lon + POSITION_JITTER_DEG),
            alt: uniform(here.alt - 1.5, here.alt + 1.5),
        };
        session.identity.location = moved;
        session.client.set_position(moved);
    }

    /// Get a fresh egress path for the session
    pub(crate) async fn rotate_egress(&self, session: &mut Session, reason: &str) {
        let current = session.proxy.clone();
        match self.ctx.egress.rotate(current.as_deref(), reason).await {
            Rotation::Swapped(proxy) => {
                reopen_session(&self.ctx, session, Some(proxy));
            }
            Rotation::Rotated | Rotation::Skipped(_) | Rotation::Unchanged => {}
        }
    }
}
