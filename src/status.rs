//! Worker status codes and the shared status board

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;

use crate::geo::Coordinate;

/// Short status token shown in a worker's status line.
///
/// `Healthy` is rendered as the worker's seen count instead of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Healthy,
    Init,
    Login,
    AppSimulation,
    Tutorial,
    Visiting,
    SeenSomething,
    FortsOnly,
    NothingSeen,
    UnknownResponse,
    IpBanned,
    FailedLogin,
    NotAuthenticated,
    Retrying,
    Throttle,
    Banned,
    Captcha,
    Malformed,
    Exception,
    Removing,
    Benching,
    Swapping,
    Spinning,
    Waiting,
    Encountering,
    Notifying,
    Killed,
}

impl WorkerStatus {
    pub fn token(&self) -> &'static str {
        match self {
            WorkerStatus::Healthy => "",
            WorkerStatus::Init => "INIT",
            WorkerStatus::Login => "LOGIN",
            WorkerStatus::AppSimulation => "APP SIMULATION",
            WorkerStatus::Tutorial => "TUTORIAL",
            WorkerStatus::Visiting => "!",
            WorkerStatus::SeenSomething => ":",
            WorkerStatus::FortsOnly => ",",
            WorkerStatus::NothingSeen => "NOTHING SEEN",
            WorkerStatus::UnknownResponse => "UNKNOWNRESPONSE",
            WorkerStatus::IpBanned => "IP BANNED",
            WorkerStatus::FailedLogin => "FAILED LOGIN",
            WorkerStatus::NotAuthenticated => "NOT AUTHENTICATED",
            WorkerStatus::Retrying => "RETRYING",
            WorkerStatus::Throttle => "THROTTLE",
            WorkerStatus::Banned => "BANNED?",
            WorkerStatus::Captcha => "CAPTCHA",
            WorkerStatus::Malformed => "MALFORMED RESPONSE",
            WorkerStatus::Exception => "EXCEPTION",
            WorkerStatus::Removing => "REMOVING",
            WorkerStatus::Benching => "BENCHING",
            WorkerStatus::Swapping => "SWAPPING",
            WorkerStatus::Spinning => "$",
            WorkerStatus::Waiting => "~",
            WorkerStatus::Encountering => "ENCOUNTERING",
            WorkerStatus::Notifying => "*",
            WorkerStatus::Killed => "KILLED",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Render the status line for a worker: `[W<id>: <code>]` or `[W<id>: P<seen>]`
pub fn status_line(worker_id: usize, status: WorkerStatus, total_seen: u64) -> String {
    match status {
        WorkerStatus::Healthy => format!("[W{}: P{}]", worker_id, total_seen),
        other => format!("[W{}: {}]", worker_id, other),
    }
}

/// What a worker last reported after visiting a point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub location: Coordinate,
    /// Visit start, milliseconds since the epoch
    pub started_at: u64,
    pub speed: f64,
    pub total_seen: u64,
    pub visits: u64,
    pub seen_this_visit: u64,
    pub notified: bool,
}

/// Latest snapshot per worker, for map displays
#[derive(Debug, Default)]
pub struct StatusBoard {
    workers: DashMap<usize, WorkerSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, worker_id: usize, snapshot: WorkerSnapshot) {
        self.workers.insert(worker_id, snapshot);
    }

    pub fn get(&self, worker_id: usize) -> Option<WorkerSnapshot> {
        self.workers.get(&worker_id).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<(usize, WorkerSnapshot)> {
        let mut all: Vec<_> = self
            .workers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}
