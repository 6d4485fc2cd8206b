//! The worker: one long-running loop walking a route for one identity
//!
//! A worker owns a [`Session`] behind its [`BusyGate`]. Visits, logins and
//! identity swaps all happen while holding the gate, so at most one of them
//! is ever in flight. The identity inside the session can be swapped without
//! recreating the worker.

mod actions;
mod login;
mod visit;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::busy::BusyGate;
use crate::context::ScanContext;
use crate::geo::{degree_distance, distance_miles, Coordinate, Location};
use crate::identity::{Credentials, DeviceInfo, Identity};
use crate::rpc::{ChainOptions, Envelope, RequestChain, Responses, RpcCall, SessionClient};
use crate::status::{status_line, WorkerStatus};
use crate::types::{now_ms, now_secs, Result};

/// Degrees per second to miles per hour, roughly
const DEGREES_PER_SEC_TO_MPH: f64 = 223_694.0;
/// Idle time after which a stale status code is cleared
const STALE_STATUS_SECS: f64 = 60.0;
/// Session age before a seen-rate is reported
const MIN_RATE_WINDOW_SECS: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating,
    /// First-time app simulation in progress
    SimulatingClient,
    Authenticated,
}

/// The identity a worker currently holds and its live session
pub struct Session {
    pub identity: Identity,
    client: Arc<dyn SessionClient>,
    pub proxy: Option<String>,
    pub phase: SessionPhase,
    pub ever_authenticated: bool,
    pub empty_visits: u32,
    /// Sightings counted for this identity since it was taken
    pub account_seen: u64,
    pub account_start_ms: Option<u64>,
    pub item_capacity: u32,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }

    pub fn client(&self) -> Arc<dyn SessionClient> {
        Arc::clone(&self.client)
    }
}

/// Lock-free-to-read copy of the session fields the scheduler asks about
#[derive(Debug, Clone, Default)]
struct Tracker {
    username: String,
    location: Location,
    last_request_ms: u64,
    last_map_fetch_ms: u64,
    account_start_ms: Option<u64>,
    account_seen: u64,
    speed: f64,
}

pub struct Worker {
    pub id: usize,
    ctx: Arc<ScanContext>,
    session: BusyGate<Session>,
    status: Mutex<WorkerStatus>,
    tracker: Mutex<Tracker>,
    killed: AtomicBool,
    kill_signal: Notify,
    total_seen: AtomicU64,
    visits: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<ScanContext>, identity: Identity) -> Self {
        let proxy = ctx.egress.assign(id);
        let session = open_session(&ctx, identity, proxy);
        let worker = Self {
            id,
            ctx,
            session: BusyGate::new(session),
            status: Mutex::new(WorkerStatus::Init),
            tracker: Mutex::new(Tracker::default()),
            killed: AtomicBool::new(false),
            kill_signal: Notify::new(),
            total_seen: AtomicU64::new(0),
            visits: AtomicU64::new(0),
        };
        if let Some(session) = worker.session.try_takeover() {
            worker.track(&session);
        }
        worker
    }

    /// Build a worker around the next identity in the pool
    pub async fn from_pool(id: usize, ctx: Arc<ScanContext>) -> Self {
        let identity = ctx.accounts.take().await;
        Self::new(id, ctx, identity)
    }

    pub fn status(&self) -> WorkerStatus {
        *lock(&self.status)
    }

    /// Update the status code; a killed worker keeps `KILLED`
    pub(crate) fn set_status(&self, status: WorkerStatus) {
        if self.is_killed() {
            return;
        }
        *lock(&self.status) = status;
    }

    pub fn status_line(&self) -> String {
        status_line(self.id, self.status(), self.total_seen())
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen.load(Ordering::Relaxed)
    }

    pub fn visits(&self) -> u64 {
        self.visits.load(Ordering::Relaxed)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_busy()
    }

    /// Username of the identity currently held
    pub fn username(&self) -> String {
        lock(&self.tracker).username.clone()
    }

    pub fn location(&self) -> Location {
        lock(&self.tracker).location
    }

    /// Mark the worker killed. The loop exits after its current attempt;
    /// the identity is written back here if the gate is free, otherwise
    /// when the loop exits.
    pub fn kill(&self) {
        *lock(&self.status) = WorkerStatus::Killed;
        self.killed.store(true, Ordering::Release);
        self.kill_signal.notify_waiters();
        if let Some(mut session) = self.session.try_takeover() {
            if session.ever_authenticated {
                self.persist(&mut session);
            }
        }
        info!(worker = self.id, "Worker killed");
    }

    async fn killed_wait(&self) {
        loop {
            let notified = self.kill_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_killed() {
                return;
            }
            notified.await;
        }
    }

    /// Copy the scheduler-visible fields out of the session
    fn track(&self, session: &Session) {
        let mut tracker = lock(&self.tracker);
        tracker.username.clone_from(&session.identity.username);
        tracker.location = session.identity.location;
        tracker.last_request_ms = session.identity.last_request_ms;
        tracker.last_map_fetch_ms = session.identity.last_map_fetch_ms;
        tracker.account_start_ms = session.account_start_ms;
        tracker.account_seen = session.account_seen;
    }

    /// Write the identity back to the pool registry with current credentials.
    ///
    /// The refresh token is always kept; the access token only while valid.
    pub(crate) fn persist(&self, session: &mut Session) {
        if let Some(credentials) = session.client.credentials() {
            session.identity.credentials = Some(if credentials.is_valid_at(now_secs()) {
                credentials
            } else {
                Credentials {
                    access_token: String::new(),
                    expiry: 0,
                    refresh_token: credentials.refresh_token,
                }
            });
        }
        self.ctx.accounts.record(&session.identity);
        self.track(session);
    }

    async fn next_identity(&self) -> Option<Identity> {
        tokio::select! {
            identity = self.ctx.accounts.take() => Some(identity),
            _ = self.killed_wait() => None,
        }
    }

    /// Replace the session's identity with the next one from the pool.
    /// Returns the outgoing identity, or `None` if killed while waiting.
    async fn replace_identity(&self, session: &mut Session) -> Option<Identity> {
        let next = self.next_identity().await?;
        let proxy = session.proxy.clone();
        let fresh = open_session(&self.ctx, next, proxy);
        let old = std::mem::replace(session, fresh);
        info!(
            worker = self.id,
            from = %old.identity.username,
            to = %session.identity.username,
            "Identity replaced"
        );
        self.set_status(WorkerStatus::Healthy);
        self.track(session);
        Some(old.identity)
    }

    /// Return the identity to the pool and continue with another one
    pub(crate) async fn swap_account(&self, session: &mut Session, reason: &str) -> bool {
        self.set_status(WorkerStatus::Swapping);
        warn!(worker = self.id, username = %session.identity.username, reason, "Swapping out identity");
        self.persist(session);
        match self.replace_identity(session).await {
            Some(old) => {
                self.ctx.accounts.put(old);
                true
            }
            None => false,
        }
    }

    /// Mark the identity banned; it is not returned to the pool
    pub(crate) async fn remove_account(&self, session: &mut Session) -> bool {
        self.set_status(WorkerStatus::Removing);
        warn!(worker = self.id, username = %session.identity.username, "Removing identity due to ban");
        session.identity.banned = true;
        self.persist(session);
        self.replace_identity(session).await.is_some()
    }

    /// Set a challenged identity aside for resolution
    pub(crate) async fn bench_account(&self, session: &mut Session) -> bool {
        self.set_status(WorkerStatus::Benching);
        warn!(worker = self.id, username = %session.identity.username, "Benching identity due to challenge");
        session.identity.captcha = true;
        self.persist(session);
        match self.replace_identity(session).await {
            Some(old) => {
                self.ctx.accounts.put_benched(old);
                true
            }
            None => false,
        }
    }

    /// Swap identity right away, skipping the queue of visit work.
    ///
    /// Fails without side effects when the worker is busy or anyone is
    /// waiting for it.
    pub async fn swap_now(&self, reason: &str) -> bool {
        let Some(mut session) = self.session.try_takeover() else {
            debug!(worker = self.id, "Swap skipped, worker busy");
            return false;
        };
        self.swap_account(&mut session, reason).await
    }

    /// Send a primary call with the bookkeeping chain
    pub(crate) async fn chain(
        &self,
        session: &mut Session,
        call: RpcCall,
        options: ChainOptions,
    ) -> Result<Responses> {
        let chain = RequestChain::new(
            session.client(),
            &self.ctx.network,
            &self.ctx.settings_hash,
        );
        chain.call(&mut session.identity, call, options).await
    }

    /// Send an envelope without bookkeeping
    pub(crate) async fn send_raw(
        &self,
        session: &mut Session,
        envelope: Envelope,
    ) -> Result<serde_json::Value> {
        let chain = RequestChain::new(
            session.client(),
            &self.ctx.network,
            &self.ctx.settings_hash,
        );
        let response = chain.send(envelope).await?;
        session.identity.last_request_ms = now_ms();
        Ok(response)
    }

    /// Cheap speed estimate (mph) for travelling to `point` now.
    ///
    /// `None` while busy, killed, or before the scan delay since the last
    /// map fetch has passed.
    pub fn fast_speed(&self, point: Coordinate) -> Option<f64> {
        if self.is_busy() || self.is_killed() {
            return None;
        }
        let tracker = lock(&self.tracker).clone();
        let now = now_ms();
        let since_fetch = now.saturating_sub(tracker.last_map_fetch_ms) as f64 / 1000.0;
        if since_fetch < self.ctx.settings.scan_delay_secs {
            return None;
        }
        let elapsed = now.saturating_sub(tracker.last_request_ms) as f64 / 1000.0;
        if elapsed > STALE_STATUS_SECS {
            self.set_status(WorkerStatus::Healthy);
        }
        if elapsed <= 0.0 {
            return None;
        }
        let distance = degree_distance(tracker.location.coordinate(), point);
        Some(distance / elapsed * DEGREES_PER_SEC_TO_MPH)
    }

    /// Great-circle speed estimate (mph) for travelling to `point` now
    pub fn accurate_speed(&self, point: Coordinate) -> Option<f64> {
        let tracker = lock(&self.tracker).clone();
        let elapsed = now_ms().saturating_sub(tracker.last_request_ms) as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        let miles = distance_miles(tracker.location.coordinate(), point);
        Some(miles / elapsed * 3600.0)
    }

    /// Sightings per second for the current identity, once it has been
    /// active long enough to mean something
    pub fn seen_per_second(&self, now_ms: u64) -> Option<f64> {
        let tracker = lock(&self.tracker).clone();
        let start = tracker.account_start_ms?;
        let active = now_ms.saturating_sub(start) as f64 / 1000.0;
        if active < MIN_RATE_WINDOW_SECS {
            return None;
        }
        Some(tracker.account_seen as f64 / active)
    }

    /// Walk `route` until killed, honoring the scan delay between map
    /// fetches of the same identity.
    pub async fn run(&self, route: Vec<Coordinate>, bootstrap: bool) {
        if route.is_empty() {
            warn!(worker = self.id, "Empty route, nothing to do");
            return;
        }
        info!(worker = self.id, points = route.len(), "Worker started");

        'walk: while !self.is_killed() {
            for point in &route {
                if self.is_killed() {
                    break 'walk;
                }
                self.wait_for_scan_delay().await;
                if let Some(speed) = self.accurate_speed(*point) {
                    lock(&self.tracker).speed = speed;
                }
                if !self.visit(*point, bootstrap).await {
                    debug!(worker = self.id, lat = point.lat, lon = point.lon, "Point not visited");
                }
            }
        }

        let mut session = self.session.acquire().await;
        if session.ever_authenticated {
            self.persist(&mut session);
        }
        info!(worker = self.id, seen = self.total_seen(), visits = self.visits(), "Worker stopped");
    }

    async fn wait_for_scan_delay(&self) {
        let last = lock(&self.tracker).last_map_fetch_ms;
        let since = now_ms().saturating_sub(last) as f64 / 1000.0;
        let remaining = self.ctx.settings.scan_delay_secs - since;
        if remaining <= 0.0 {
            return;
        }
        if let Ok(delay) = Duration::try_from_secs_f64(remaining) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.killed_wait() => {}
            }
        }
    }
}

/// Open a client for `identity`, resuming stored credentials when possible
fn open_session(ctx: &ScanContext, identity: Identity, proxy: Option<String>) -> Session {
    let device = DeviceInfo::for_identity(&identity);
    let client = ctx.sessions.open(&device, proxy.as_deref());
    client.set_position(identity.location);

    let resumed = identity
        .resumable_credentials(now_secs())
        .map(|c| client.restore(c))
        .unwrap_or(false);
    if resumed {
        debug!(username = %identity.username, "Resumed stored credentials");
    }

    Session {
        identity,
        client,
        proxy,
        phase: if resumed {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        },
        ever_authenticated: resumed,
        empty_visits: 0,
        account_seen: 0,
        account_start_ms: None,
        item_capacity: ctx.settings.item_capacity,
    }
}

/// Reopen the session's client on a different proxy, keeping credentials
fn reopen_session(ctx: &ScanContext, session: &mut Session, proxy: Option<String>) {
    let credentials = session.client.credentials();
    let device = DeviceInfo::for_identity(&session.identity);
    let client = ctx.sessions.open(&device, proxy.as_deref());
    client.set_position(session.identity.location);

    let restored = credentials.map(|c| client.restore(&c)).unwrap_or(false);
    if !restored {
        session.phase = SessionPhase::Unauthenticated;
    }
    session.client = client;
    session.proxy = proxy;
}
