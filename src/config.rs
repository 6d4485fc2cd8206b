//! Configuration
//!
//! CLI arguments and environment variables (clap), turned into the
//! library-level [`ScanSettings`] the workers read.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::classifier::RetryPolicy;
use crate::rpc::PlayerLocale;

/// When to deep-encounter a sighting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterMode {
    #[default]
    None,
    /// Only sightings that are about to be notified
    Notifying,
    /// Every first-seen sighting
    All,
}

/// Settings shared by every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    pub encounter: EncounterMode,
    pub spin_pokestops: bool,
    pub complete_tutorial: bool,
    pub network_threads: usize,
    pub login_concurrency: usize,
    pub simulation_concurrency: usize,
    /// Minimum seconds between map fetches of one identity
    pub scan_delay_secs: f64,
    /// Consecutive empty visits tolerated before swapping identity
    pub empty_visit_limit: u32,
    /// Swap immediately on a visit with no sightings and no forts, instead
    /// of only counting it toward `empty_visit_limit`
    pub swap_on_dead_zone: bool,
    pub circuit_failure_limit: u32,
    pub circuit_cooldown_secs: u64,
    /// Item capacity assumed until the player payload says otherwise
    pub item_capacity: u32,
    pub cell_radius_m: f64,
    pub app_version: u32,
    pub locale: PlayerLocale,
    pub retry: RetryPolicy,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            encounter: EncounterMode::None,
            spin_pokestops: false,
            complete_tutorial: true,
            network_threads: 20,
            login_concurrency: 2,
            simulation_concurrency: 4,
            scan_delay_secs: 10.0,
            empty_visit_limit: 3,
            swap_on_dead_zone: false,
            circuit_failure_limit: 20,
            circuit_cooldown_secs: 180,
            item_capacity: 350,
            cell_radius_m: 500.0,
            app_version: 5102,
            locale: PlayerLocale::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ScanSettings {
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }
}

/// Mapwalker - account-pooled map survey workers
#[derive(Parser, Debug, Clone)]
#[command(name = "mapwalker")]
#[command(about = "Walks map routes with a pool of worker sessions")]
pub struct Args {
    /// Accounts file (JSON array), rewritten on shutdown
    #[arg(long, env = "ACCOUNTS_FILE", default_value = "accounts.json")]
    pub accounts: PathBuf,

    /// Route file: JSON array of [lat, lon] points
    #[arg(long, env = "ROUTE_FILE", default_value = "route.json")]
    pub route: PathBuf,

    /// Spawn table with despawn seconds and altitudes
    #[arg(long, env = "SPAWNS_FILE")]
    pub spawns: Option<PathBuf>,

    /// Cell grid cache, loaded at start and flushed at shutdown
    #[arg(long, env = "CELLS_FILE", default_value = "cells.json")]
    pub cells: PathBuf,

    /// Append-only log of persisted entities
    #[arg(long, env = "SIGHTINGS_LOG", default_value = "sightings.jsonl")]
    pub sightings_log: PathBuf,

    /// Protocol gateway base URL
    #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:5000")]
    pub gateway_url: String,

    /// Number of workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    pub workers: usize,

    /// Proxies, comma separated
    #[arg(long, env = "PROXIES", value_delimiter = ',')]
    pub proxies: Vec<String>,

    /// Control sockets as proxy=socket pairs, comma separated
    #[arg(long, env = "CONTROL_SOCKETS", value_delimiter = ',')]
    pub control_sockets: Vec<String>,

    /// Control socket password
    #[arg(long, env = "CONTROL_PASSWORD")]
    pub control_password: Option<String>,

    /// Encounter mode
    #[arg(long, env = "ENCOUNTER", value_enum, default_value = "none")]
    pub encounter: EncounterMode,

    /// Spin waypoints within reach
    #[arg(long, env = "SPIN_POKESTOPS", default_value = "false")]
    pub spin_pokestops: bool,

    /// Skip the tutorial script for new accounts
    #[arg(long, env = "SKIP_TUTORIAL", default_value = "false")]
    pub skip_tutorial: bool,

    /// Record advertised spawn points for a later survey
    #[arg(long, env = "BOOTSTRAP", default_value = "false")]
    pub bootstrap: bool,

    /// Threads for blocking network calls
    #[arg(long, env = "NETWORK_THREADS", default_value = "20")]
    pub network_threads: usize,

    /// Concurrent logins
    #[arg(long, env = "LOGIN_CONCURRENCY", default_value = "2")]
    pub login_concurrency: usize,

    /// Concurrent first-time app simulations
    #[arg(long, env = "SIMULATION_CONCURRENCY", default_value = "4")]
    pub simulation_concurrency: usize,

    /// Minimum seconds between map fetches of one account
    #[arg(long, env = "SCAN_DELAY", default_value = "10")]
    pub scan_delay: f64,

    /// Swap accounts immediately on visits with nothing at all
    #[arg(long, env = "SWAP_ON_DEAD_ZONE", default_value = "false")]
    pub swap_on_dead_zone: bool,

    /// Empty visits before a circuit is renewed
    #[arg(long, env = "CIRCUIT_FAILURE_LIMIT", default_value = "20")]
    pub circuit_failure_limit: u32,

    /// Webhook for sighting notifications
    #[arg(long, env = "NOTIFY_WEBHOOK")]
    pub notify_webhook: Option<String>,

    /// Species ids to notify about, comma separated
    #[arg(long, env = "NOTIFY_SPECIES", value_delimiter = ',')]
    pub notify_species: Vec<u32>,

    /// Seconds between status screen updates
    #[arg(long, env = "STATUS_INTERVAL", default_value = "30")]
    pub status_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("WORKERS must be at least 1".to_string());
        }
        if self.network_threads == 0 {
            return Err("NETWORK_THREADS must be at least 1".to_string());
        }
        if self.login_concurrency == 0 || self.simulation_concurrency == 0 {
            return Err("LOGIN_CONCURRENCY and SIMULATION_CONCURRENCY must be at least 1".to_string());
        }
        if !self.scan_delay.is_finite() || self.scan_delay < 0.0 {
            return Err("SCAN_DELAY must be a finite, non-negative number".to_string());
        }
        if !self.control_sockets.is_empty() && self.proxies.is_empty() {
            return Err("CONTROL_SOCKETS requires PROXIES".to_string());
        }
        if self.notify_webhook.is_some() && self.notify_species.is_empty() {
            return Err("NOTIFY_WEBHOOK requires NOTIFY_SPECIES".to_string());
        }
        Ok(())
    }

    pub fn settings(&self) -> ScanSettings {
        ScanSettings {
            encounter: self.encounter,
            spin_pokestops: self.spin_pokestops,
            complete_tutorial: !self.skip_tutorial,
            network_threads: self.network_threads,
            login_concurrency: self.login_concurrency,
            simulation_concurrency: self.simulation_concurrency,
            scan_delay_secs: self.scan_delay,
            swap_on_dead_zone: self.swap_on_dead_zone,
            circuit_failure_limit: self.circuit_failure_limit,
            ..ScanSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mapwalker").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert!(args.validate().is_ok());
        let settings = args.settings();
        assert_eq!(settings.encounter, EncounterMode::None);
        assert!(settings.complete_tutorial);
        assert_eq!(settings.empty_visit_limit, 3);
        assert_eq!(settings.retry.max_attempts, 4);
    }

    #[test]
    fn test_lists_and_modes() {
        let args = parse(&[
            "--proxies",
            "socks5://a:1,socks5://b:2",
            "--encounter",
            "all",
            "--spin-pokestops",
            "--skip-tutorial",
        ]);
        assert_eq!(args.proxies.len(), 2);
        let settings = args.settings();
        assert_eq!(settings.encounter, EncounterMode::All);
        assert!(settings.spin_pokestops);
        assert!(!settings.complete_tutorial);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(parse(&["--workers", "0"]).validate().is_err());
        assert!(parse(&["--control-sockets", "a=/tmp/s"]).validate().is_err());
        assert!(parse(&["--notify-webhook", "http://hook"]).validate().is_err());
    }

    #[test]
    fn test_validate_scan_delay() {
        assert!(parse(&["--scan-delay", "12.5"]).validate().is_ok());
        assert!(parse(&["--scan-delay=-1"]).validate().is_err());
        assert!(parse(&["--scan-delay", "inf"]).validate().is_err());
        assert!(parse(&["--scan-delay", "NaN"]).validate().is_err());
    }
}
