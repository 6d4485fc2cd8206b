//! Visiting a point: the retry loop and the map-fetch pipeline

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{Session, Worker};
use crate::classifier::{classify, status_for, Recovery};
use crate::config::EncounterMode;
use crate::entity::{
    normalize_gym, normalize_lured, normalize_waypoint, normalize_wild, Entity, Sighting,
};
use crate::geo::{Coordinate, GridKey};
use crate::pacing::uniform;
use crate::rpc::payload::{MapObjects, WildSighting};
use crate::rpc::{ChainOptions, RpcCall};
use crate::spawns::{ALTITUDE_PRECISION, CANDIDATE_PRECISION};
use crate::status::{WorkerSnapshot, WorkerStatus};
use crate::store::CacheSet;
use crate::types::{now_ms, Result};

/// Pause after a login attempt that did not complete
const LOGIN_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// What one pass over a map response found
#[derive(Debug, Default)]
struct VisitTally {
    seen: u64,
    forts: u64,
    notified: bool,
}

impl Worker {
    /// Visit `point`, retrying recoverable failures.
    ///
    /// Returns whether the point was processed. Identity-level failures swap
    /// the identity and give up on the point.
    pub async fn visit(&self, point: Coordinate, bootstrap: bool) -> bool {
        let mut session = self.session.acquire().await;
        self.visit_with(&mut session, point, bootstrap).await
    }

    async fn visit_with(&self, session: &mut Session, point: Coordinate, bootstrap: bool) -> bool {
        let policy = &self.ctx.settings.retry;

        for attempt in 0..policy.max_attempts {
            if self.is_killed() {
                return false;
            }

            let error = match self.attempt(session, point, bootstrap).await {
                Ok(Some(visited)) => return visited,
                Ok(None) => {
                    tokio::time::sleep(LOGIN_RETRY_PAUSE).await;
                    continue;
                }
                Err(e) => e,
            };

            self.set_status(status_for(&error));
            match classify(&error, attempt, policy) {
                Recovery::Retry {
                    backoff,
                    rotate_egress,
                } => {
                    warn!(
                        worker = self.id,
                        attempt = attempt + 1,
                        proxy = ?session.proxy,
                        error = %error,
                        "Visit attempt failed, retrying"
                    );
                    if rotate_egress {
                        self.rotate_egress(session, "ban").await;
                    }
                    if let Some(backoff) = backoff {
                        backoff.sleep().await;
                    }
                }
                Recovery::SwapIdentity => {
                    warn!(worker = self.id, username = %session.identity.username, error = %error, "Session rejected");
                    self.swap_account(session, &error.to_string()).await;
                    return false;
                }
                Recovery::RemoveIdentity => {
                    self.remove_account(session).await;
                    return false;
                }
                Recovery::BenchIdentity => {
                    self.bench_account(session).await;
                    self.ctx.metrics.record_captcha();
                    return false;
                }
                Recovery::Abandon => {
                    error!(worker = self.id, error = %error, "Unexpected failure while visiting");
                    return false;
                }
            }
        }

        warn!(
            worker = self.id,
            lat = point.lat,
            lon = point.lon,
            attempts = policy.max_attempts,
            "Giving up on point"
        );
        false
    }

    /// One attempt: log in if needed, then visit. `Ok(None)` means the
    /// login did not complete.
    async fn attempt(
        &self,
        session: &mut Session,
        point: Coordinate,
        bootstrap: bool,
    ) -> Result<Option<bool>> {
        if !session.is_authenticated() {
            let alt = session.identity.location.alt;
            session.client.set_position(point.with_altitude(alt));
            if !self.login(session).await? {
                return Ok(None);
            }
        }
        self.visit_point(session, point, bootstrap).await.map(Some)
    }

    /// Fetch the map around `point` and process everything in it
    pub(crate) async fn visit_point(
        &self,
        session: &mut Session,
        point: Coordinate,
        bootstrap: bool,
    ) -> Result<bool> {
        let ctx = &self.ctx;
        let altitude = ctx
            .spawns
            .altitude_at(GridKey::round(point, ALTITUDE_PRECISION));
        let location = point.with_altitude(uniform(altitude - 1.0, altitude + 1.0));

        self.set_status(WorkerStatus::Visiting);
        info!(worker = self.id, "Visiting {:.4},{:.4}", point.lat, point.lon);
        let started_at = now_ms();
        session.identity.location = location;
        session.client.set_position(location);

        let cells = ctx.cell_ids(point);
        let call = RpcCall::GetMapObjects {
            cell_id: cells.to_vec(),
            since_timestamp_ms: vec![0; cells.len()],
            latitude: point.lat,
            longitude: point.lon,
        };
        let responses = self.chain(session, call, ChainOptions::default()).await?;
        session.identity.last_map_fetch_ms = now_ms();

        let map: MapObjects = responses.decode_or_default("GET_MAP_OBJECTS")?;
        if !map.is_success() {
            self.set_status(WorkerStatus::UnknownResponse);
            warn!(worker = self.id, status = ?map.status, "Unexpected map response");
            session.empty_visits += 1;
            if session.empty_visits >= ctx.settings.empty_visit_limit {
                let reason = format!("{} empty visits", session.empty_visits);
                self.swap_account(session, &reason).await;
            }
            self.track(session);
            return Ok(false);
        }

        let tally = self.process_cells(session, &map, bootstrap).await?;
        self.settle_visit(session, &tally).await;

        let visits = self.visits.fetch_add(1, Ordering::Relaxed) + 1;
        ctx.status.update(
            self.id,
            WorkerSnapshot {
                location: point,
                started_at,
                speed: super::lock(&self.tracker).speed,
                total_seen: self.total_seen(),
                visits,
                seen_this_visit: tally.seen,
                notified: tally.notified,
            },
        );
        info!(
            worker = self.id,
            "Point processed, {} sightings and {} forts seen", tally.seen, tally.forts
        );
        self.persist(session);
        Ok(true)
    }

    async fn process_cells(
        &self,
        session: &mut Session,
        map: &MapObjects,
        bootstrap: bool,
    ) -> Result<VisitTally> {
        let ctx = &self.ctx;
        let mut tally = VisitTally::default();

        for cell in &map.map_cells {
            let request_time_ms = cell.current_timestamp_ms;

            for raw in &cell.wild_pokemons {
                tally.seen += 1;
                let mut sighting = normalize_wild(raw, request_time_ms);
                if !sighting.has_accurate_timer() {
                    let estimate = sighting
                        .seen
                        .and_then(|seen| ctx.spawns.estimate(sighting.spawn_id, seen));
                    sighting.resolve_validity(estimate, request_time_ms);
                }

                let (sighting, sent) = self.notify(session, sighting, raw).await;
                tally.notified |= sent;

                if ctx.store.contains(CacheSet::Sightings, &sighting)
                    || ctx.store.contains(CacheSet::Mysteries, &sighting)
                {
                    continue;
                }
                session.account_seen += 1;
                let sighting = if ctx.settings.encounter == EncounterMode::All
                    && sighting.encounter.is_none()
                {
                    self.try_encounter(session, sighting, raw).await
                } else {
                    sighting
                };
                ctx.store.add(Entity::Wild(sighting));
            }

            for fort in &cell.forts {
                if !fort.enabled {
                    continue;
                }
                tally.forts += 1;

                if !fort.is_waypoint() {
                    ctx.store.add(Entity::Gym(normalize_gym(fort)));
                    continue;
                }

                if let Some(lured) = normalize_lured(fort, request_time_ms) {
                    tally.seen += 1;
                    if !ctx.store.contains(CacheSet::Sightings, &lured) {
                        session.account_seen += 1;
                        ctx.store.add(Entity::Lured(lured));
                    }
                }
                let waypoint = normalize_waypoint(fort);
                ctx.store.add(Entity::Waypoint(waypoint.clone()));

                if ctx.settings.spin_pokestops
                    && session.identity.item_count() < session.item_capacity
                {
                    let ready = fort
                        .cooldown_complete_timestamp_ms
                        .map_or(true, |until| now_ms() as i64 > until);
                    if ready {
                        self.spin(session, &waypoint).await?;
                    }
                }
            }

            if bootstrap {
                for spawn in &cell.spawn_points {
                    if let (Some(lat), Some(lon)) = (spawn.latitude, spawn.longitude) {
                        ctx.spawns.record_candidate(GridKey::round(
                            Coordinate::new(lat, lon),
                            CANDIDATE_PRECISION,
                        ));
                    }
                }
            }
        }

        Ok(tally)
    }

    /// Empty-visit and circuit accounting after a processed visit
    async fn settle_visit(&self, session: &mut Session, tally: &VisitTally) {
        let ctx = &self.ctx;
        let proxy = session.proxy.clone();

        if tally.seen > 0 {
            self.set_status(WorkerStatus::SeenSomething);
            self.total_seen.fetch_add(tally.seen, Ordering::Relaxed);
            ctx.metrics.record_seen(tally.seen);
            session.empty_visits = 0;
            ctx.egress.record_success(proxy.as_deref());
            return;
        }

        session.empty_visits += 1;
        let mut swapped = false;
        if tally.forts == 0 {
            self.set_status(WorkerStatus::NothingSeen);
            if ctx.settings.swap_on_dead_zone {
                swapped = self.swap_account(session, "no sightings or forts seen").await;
            }
        } else {
            self.set_status(WorkerStatus::FortsOnly);
        }

        if !swapped && session.empty_visits >= ctx.settings.empty_visit_limit {
            let reason = format!("{} empty visits", session.empty_visits);
            self.swap_account(session, &reason).await;
        }

        if ctx.egress.rotation_enabled() && ctx.egress.record_empty(proxy.as_deref()) {
            let failures = proxy
                .as_deref()
                .map_or(0, |p| ctx.egress.failures(p));
            let reason = format!("{} empty visits", failures);
            self.rotate_egress(session, &reason).await;
        }
    }

    /// Hand an eligible sighting to the notifier, encountering it first when
    /// configured to
    async fn notify(
        &self,
        session: &mut Session,
        sighting: Sighting,
        raw: &WildSighting,
    ) -> (Sighting, bool) {
        let Some(notifier) = self.ctx.notifier.clone() else {
            return (sighting, false);
        };
        if !notifier.is_eligible(&sighting) {
            return (sighting, false);
        }

        let sighting = match self.ctx.settings.encounter {
            EncounterMode::Notifying | EncounterMode::All => {
                self.try_encounter(session, sighting, raw).await
            }
            EncounterMode::None => sighting,
        };

        self.set_status(WorkerStatus::Notifying);
        let (sent, explanation) = notifier.notify(&sighting).await;
        info!(worker = self.id, sent, "{}", explanation);
        if sent {
            self.ctx.metrics.record_sent();
        }
        self.set_status(WorkerStatus::Visiting);
        (sighting, sent)
    }

    /// Encounter a sighting, keeping it unchanged if the encounter fails
    async fn try_encounter(
        &self,
        session: &mut Session,
        sighting: Sighting,
        raw: &WildSighting,
    ) -> Sighting {
        match self.encounter(session, raw).await {
            Ok(stats) => sighting.with_encounter(stats),
            Err(e) => {
                warn!(worker = self.id, encounter_id = raw.encounter_id, error = %e, "Encounter failed");
                self.set_status(WorkerStatus::Visiting);
                sighting
            }
        }
    }
}
