//! Scripted in-memory session clients shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use mapwalker::config::ScanSettings;
use mapwalker::context::ScanContext;
use mapwalker::geo::Location;
use mapwalker::identity::{AccountPool, Credentials, DeviceInfo, Identity, Provider};
use mapwalker::rpc::{Envelope, SessionClient, SessionFactory};
use mapwalker::store::MemoryStore;
use mapwalker::types::{now_ms, now_secs, Result, ScanError};

pub type Handler = dyn Fn(&Envelope) -> Result<Value> + Send + Sync;

/// Answers every envelope with the shared handler and records what was sent
pub struct ScriptedFactory {
    handler: Arc<Handler>,
    sent: Arc<Mutex<Vec<Vec<&'static str>>>>,
    proxies: Mutex<Vec<Option<String>>>,
    rejected: Arc<Vec<String>>,
    logins: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(handler: impl Fn(&Envelope) -> Result<Value> + Send + Sync + 'static) -> Arc<Self> {
        Self::rejecting(&[], handler)
    }

    /// Like `new`, but logins for `usernames` are refused
    pub fn rejecting(
        usernames: &[&str],
        handler: impl Fn(&Envelope) -> Result<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            sent: Arc::new(Mutex::new(Vec::new())),
            proxies: Mutex::new(Vec::new()),
            rejected: Arc::new(usernames.iter().map(|u| u.to_string()).collect()),
            logins: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Call names of every envelope sent so far, in order
    pub fn sent(&self) -> Vec<Vec<&'static str>> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of envelopes whose primary call was `name`
    pub fn count(&self, name: &str) -> usize {
        self.sent()
            .iter()
            .filter(|names| names.first() == Some(&name))
            .count()
    }

    pub fn opened(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    /// Proxy each client was opened on, in order
    pub fn proxies(&self) -> Vec<Option<String>> {
        self.proxies.lock().unwrap().clone()
    }

    /// Number of authentication attempts across all clients
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

impl SessionFactory for ScriptedFactory {
    fn open(&self, _device: &DeviceInfo, proxy: Option<&str>) -> Arc<dyn SessionClient> {
        self.proxies.lock().unwrap().push(proxy.map(str::to_string));
        Arc::new(ScriptedSession {
            handler: Arc::clone(&self.handler),
            sent: Arc::clone(&self.sent),
            rejected: Arc::clone(&self.rejected),
            logins: Arc::clone(&self.logins),
            credentials: Mutex::new(None),
        })
    }
}

pub struct ScriptedSession {
    handler: Arc<Handler>,
    sent: Arc<Mutex<Vec<Vec<&'static str>>>>,
    rejected: Arc<Vec<String>>,
    logins: Arc<AtomicUsize>,
    credentials: Mutex<Option<Credentials>>,
}

impl SessionClient for ScriptedSession {
    fn set_position(&self, _location: Location) {}

    fn authenticate(&self, username: &str, _: Option<&str>, _: Provider) -> Result<Credentials> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.rejected.iter().any(|u| u == username) {
            return Err(ScanError::AuthRejected("invalid username or password".into()));
        }
        let credentials = valid_credentials();
        *self.credentials.lock().unwrap() = Some(credentials.clone());
        Ok(credentials)
    }

    fn restore(&self, credentials: &Credentials) -> bool {
        *self.credentials.lock().unwrap() = Some(credentials.clone());
        true
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().unwrap().clone()
    }

    fn send(&self, envelope: &Envelope) -> Result<Value> {
        self.sent.lock().unwrap().push(envelope.names());
        (self.handler)(envelope)
    }
}

pub fn valid_credentials() -> Credentials {
    Credentials {
        access_token: "access".to_string(),
        expiry: now_secs() + 3600,
        refresh_token: Some("refresh".to_string()),
    }
}

/// An identity that resumes its session without logging in
pub fn identity(username: &str) -> Identity {
    let mut identity = Identity::new(username, "hunter2");
    identity.credentials = Some(valid_credentials());
    identity
}

/// A chained response carrying `payload` under `method`
pub fn ok_response(method: &str, payload: Value) -> Value {
    json!({
        "status_code": 1,
        "responses": {
            method: payload,
            "CHECK_CHALLENGE": {"show_challenge": false, "challenge_url": " "},
            "GET_INVENTORY": {"inventory_delta": {"inventory_items": []}}
        }
    })
}

pub fn map_response(status: i64, cells: Vec<Value>) -> Value {
    ok_response(
        "GET_MAP_OBJECTS",
        json!({"status": status, "map_cells": cells}),
    )
}

pub fn cell(wild: Vec<Value>, forts: Vec<Value>) -> Value {
    json!({
        "current_timestamp_ms": now_ms(),
        "wild_pokemons": wild,
        "forts": forts,
        "spawn_points": []
    })
}

pub fn wild(encounter_id: u64, species: u32, time_till_hidden_ms: i64) -> Value {
    json!({
        "encounter_id": encounter_id,
        "latitude": 40.0011,
        "longitude": -105.0013,
        "spawn_point_id": "87a2b3c",
        "time_till_hidden_ms": time_till_hidden_ms,
        "last_modified_timestamp_ms": now_ms(),
        "pokemon_data": {"pokemon_id": species}
    })
}

pub struct Harness {
    pub ctx: Arc<ScanContext>,
    pub accounts: Arc<AccountPool>,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<ScriptedFactory>,
}

pub fn harness(
    settings: ScanSettings,
    usernames: &[&str],
    sessions: Arc<ScriptedFactory>,
) -> Harness {
    harness_with(settings, usernames, sessions, |ctx| ctx)
}

/// Like `harness`, with a chance to attach more collaborators to the context
pub fn harness_with(
    settings: ScanSettings,
    usernames: &[&str],
    sessions: Arc<ScriptedFactory>,
    configure: impl FnOnce(ScanContext) -> ScanContext,
) -> Harness {
    let accounts = Arc::new(AccountPool::from_identities(
        usernames.iter().map(|u| identity(u)),
    ));
    let store = Arc::new(MemoryStore::new());
    let ctx = ScanContext::new(settings, Arc::clone(&accounts), sessions.clone())
        .with_store(store.clone());
    Harness {
        ctx: Arc::new(configure(ctx)),
        accounts,
        store,
        sessions,
    }
}
