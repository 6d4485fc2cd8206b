//! Egress paths: proxies and the circuits behind them
//!
//! With control sockets configured, every proxy is a circuit that can be
//! rotated (at most once per cool-down) and that counts consecutive empty
//! visits. Without control sockets a bad path is simply swapped for a
//! random proxy.

#[cfg(unix)]
pub mod control;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::Result;

#[cfg(unix)]
pub use control::ControlSockets;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(180);
pub const DEFAULT_FAILURE_LIMIT: u32 = 20;

/// Requests a fresh circuit on an egress path
#[async_trait]
pub trait EgressControl: Send + Sync {
    async fn rotate(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct CircuitState {
    last_rotation: Instant,
    failures: u32,
}

/// Result of asking for a new egress path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The circuit behind the current path was renewed
    Rotated,
    /// Renewed too recently; nothing changed
    Skipped(Duration),
    /// No circuit control; use this proxy instead
    Swapped(String),
    /// Nothing to rotate
    Unchanged,
}

pub struct EgressTable {
    proxies: Vec<String>,
    circuits: DashMap<String, CircuitState>,
    control: Option<Arc<dyn EgressControl>>,
    cooldown: Duration,
    failure_limit: u32,
}

impl Default for EgressTable {
    fn default() -> Self {
        Self::new(Vec::new(), None, DEFAULT_COOLDOWN, DEFAULT_FAILURE_LIMIT)
    }
}

impl EgressTable {
    /// Circuits start "just rotated", so the first rotation waits a full
    /// cool-down after startup.
    pub fn new(
        proxies: Vec<String>,
        control: Option<Arc<dyn EgressControl>>,
        cooldown: Duration,
        failure_limit: u32,
    ) -> Self {
        let circuits = DashMap::new();
        if control.is_some() {
            let now = Instant::now();
            for proxy in &proxies {
                circuits.insert(
                    proxy.clone(),
                    CircuitState {
                        last_rotation: now,
                        failures: 0,
                    },
                );
            }
        }
        Self {
            proxies,
            circuits,
            control,
            cooldown,
            failure_limit,
        }
    }

    /// Proxy for the worker with this index, spreading workers evenly
    pub fn assign(&self, worker_id: usize) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        Some(self.proxies[worker_id % self.proxies.len()].clone())
    }

    pub fn random(&self) -> Option<String> {
        self.proxies.choose(&mut rand::thread_rng()).cloned()
    }

    /// Whether circuit counters and rotation are active
    pub fn rotation_enabled(&self) -> bool {
        self.control.is_some() && !self.circuits.is_empty()
    }

    pub fn failures(&self, path: &str) -> u32 {
        self.circuits.get(path).map_or(0, |c| c.failures)
    }

    /// Count an empty visit; returns true once the path is past its limit
    pub fn record_empty(&self, path: Option<&str>) -> bool {
        let Some(path) = path else { return false };
        match self.circuits.get_mut(path) {
            Some(mut circuit) => {
                circuit.failures += 1;
                circuit.failures > self.failure_limit
            }
            None => false,
        }
    }

    pub fn record_success(&self, path: Option<&str>) {
        if let Some(mut circuit) = path.and_then(|p| self.circuits.get_mut(p)) {
            circuit.failures = 0;
        }
    }

    /// Get a fresh egress path for `current`
    pub async fn rotate(&self, current: Option<&str>, reason: &str) -> Rotation {
        let Some(control) = &self.control else {
            return match self.random() {
                Some(proxy) => {
                    warn!(from = ?current, to = %proxy, reason, "Swapped proxy");
                    Rotation::Swapped(proxy)
                }
                None => Rotation::Unchanged,
            };
        };
        let Some(path) = current else {
            return Rotation::Unchanged;
        };

        // Claim the rotation before the control round trip so concurrent
        // callers on the same path see the new timestamp.
        {
            let Some(mut circuit) = self.circuits.get_mut(path) else {
                return Rotation::Unchanged;
            };
            let elapsed = circuit.last_rotation.elapsed();
            if elapsed <= self.cooldown {
                info!(proxy = path, elapsed_secs = elapsed.as_secs(), "Skipped circuit change");
                return Rotation::Skipped(elapsed);
            }
            circuit.last_rotation = Instant::now();
            circuit.failures = 0;
        }

        match control.rotate(path).await {
            Ok(()) => {
                warn!(proxy = path, reason, "Changed circuit");
                Rotation::Rotated
            }
            Err(e) => {
                warn!(proxy = path, error = %e, "Circuit change failed");
                Rotation::Unchanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingControl {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EgressControl for CountingControl {
        async fn rotate(&self, _path: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn proxies() -> Vec<String> {
        vec!["socks5://127.0.0.1:9050".into(), "socks5://127.0.0.1:9051".into()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_respects_cooldown() {
        let control = Arc::new(CountingControl::default());
        let table = EgressTable::new(proxies(), Some(control.clone()), DEFAULT_COOLDOWN, 20);
        let path = "socks5://127.0.0.1:9050";

        assert!(matches!(table.rotate(Some(path), "ban").await, Rotation::Skipped(_)));
        assert_eq!(control.calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(181)).await;
        assert_eq!(table.rotate(Some(path), "ban").await, Rotation::Rotated);
        assert!(matches!(table.rotate(Some(path), "ban").await, Rotation::Skipped(_)));
        assert_eq!(control.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_without_control_swaps_random_proxy() {
        let table = EgressTable::new(proxies(), None, DEFAULT_COOLDOWN, 20);
        assert!(!table.rotation_enabled());
        match table.rotate(Some("socks5://127.0.0.1:9050"), "ban").await {
            Rotation::Swapped(proxy) => assert!(proxies().contains(&proxy)),
            other => panic!("unexpected {:?}", other),
        }

        let empty = EgressTable::default();
        assert_eq!(empty.rotate(None, "ban").await, Rotation::Unchanged);
    }

    #[tokio::test]
    async fn test_failure_counter() {
        let control = Arc::new(CountingControl::default());
        let table = EgressTable::new(proxies(), Some(control), DEFAULT_COOLDOWN, 2);
        let path = Some("socks5://127.0.0.1:9051");

        assert!(!table.record_empty(path));
        assert!(!table.record_empty(path));
        assert!(table.record_empty(path));
        assert_eq!(table.failures("socks5://127.0.0.1:9051"), 3);

        table.record_success(path);
        assert_eq!(table.failures("socks5://127.0.0.1:9051"), 0);
        assert!(!table.record_empty(None));
    }

    #[test]
    fn test_assign_spreads_workers() {
        let table = EgressTable::new(proxies(), None, DEFAULT_COOLDOWN, 20);
        assert_eq!(table.assign(0), Some(proxies()[0].clone()));
        assert_eq!(table.assign(3), Some(proxies()[1].clone()));
        assert_eq!(EgressTable::default().assign(0), None);
    }
}
