//! Mapwalker - account-pooled map survey workers
//!
//! Each worker walks a route with one identity at a time. Around every
//! point it fetches the map through a bookkeeping request chain, normalizes
//! what it finds into entities, and keeps its session healthy: failed
//! logins, bans, challenges and throttling are classified and answered with
//! a retry, an identity swap, or a fresh egress path.
//!
//! ## Layout
//!
//! - **worker**: the per-worker lifecycle (login, app simulation, visits)
//! - **rpc**: the session client seam and the request chain
//! - **classifier**: failure classification and retry policy
//! - **identity**: accounts, device fingerprints and the shared pool
//! - **egress**: proxy assignment and circuit rotation
//! - **store** / **spawns** / **notify**: where results go

pub mod busy;
pub mod classifier;
pub mod config;
pub mod context;
pub mod egress;
pub mod entity;
pub mod geo;
pub mod identity;
pub mod metrics;
pub mod notify;
pub mod pacing;
pub mod rpc;
pub mod spawns;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{Args, EncounterMode, ScanSettings};
pub use context::ScanContext;
pub use types::{Result, ScanError};
pub use worker::{Session, SessionPhase, Worker};
