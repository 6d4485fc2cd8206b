//! State shared by every worker in the process
//!
//! One [`ScanContext`] is built at startup and handed to each worker as an
//! `Arc`. It owns the collaborators (sessions, store, estimator, notifier),
//! the process-wide caches, and the concurrency limits for logins and app
//! simulations. [`ScanContext::teardown`] flushes what must survive a restart.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::ScanSettings;
use crate::egress::EgressTable;
use crate::geo::{CellCoverer, Coordinate, GridCoverer, GridKey};
use crate::identity::AccountPool;
use crate::metrics::ScanMetrics;
use crate::notify::Notifier;
use crate::rpc::{NetworkExecutor, SessionFactory, SettingsHash};
use crate::spawns::{DespawnEstimator, SpawnRegistry, CANDIDATE_PRECISION};
use crate::status::StatusBoard;
use crate::store::{EntityStore, MemoryStore};
use crate::types::{Result, ScanError};

pub struct ScanContext {
    pub settings: ScanSettings,
    pub accounts: Arc<AccountPool>,
    pub sessions: Arc<dyn SessionFactory>,
    pub store: Arc<dyn EntityStore>,
    pub spawns: Arc<dyn DespawnEstimator>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub coverer: Arc<dyn CellCoverer>,
    pub egress: EgressTable,
    pub metrics: ScanMetrics,
    pub status: StatusBoard,
    pub network: NetworkExecutor,
    pub login_gate: Semaphore,
    pub simulation_gate: Semaphore,
    pub settings_hash: SettingsHash,
    cell_grid: DashMap<GridKey, Arc<[u64]>>,
}

impl ScanContext {
    /// Context with in-memory collaborators; replace them with the `with_*`
    /// methods.
    pub fn new(
        settings: ScanSettings,
        accounts: Arc<AccountPool>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let egress = EgressTable::new(
            Vec::new(),
            None,
            settings.circuit_cooldown(),
            settings.circuit_failure_limit,
        );
        Self {
            network: NetworkExecutor::new(settings.network_threads),
            login_gate: Semaphore::new(settings.login_concurrency.max(1)),
            simulation_gate: Semaphore::new(settings.simulation_concurrency.max(1)),
            settings,
            accounts,
            sessions,
            store: Arc::new(MemoryStore::new()),
            spawns: Arc::new(SpawnRegistry::default()),
            notifier: None,
            coverer: Arc::new(GridCoverer::default()),
            egress,
            metrics: ScanMetrics::new(),
            status: StatusBoard::new(),
            settings_hash: SettingsHash::default(),
            cell_grid: DashMap::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_spawns(mut self, spawns: Arc<dyn DespawnEstimator>) -> Self {
        self.spawns = spawns;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_coverer(mut self, coverer: Arc<dyn CellCoverer>) -> Self {
        self.coverer = coverer;
        self
    }

    pub fn with_egress(mut self, egress: EgressTable) -> Self {
        self.egress = egress;
        self
    }

    /// Cell ids covering `point`, computed once per rounded coordinate
    pub fn cell_ids(&self, point: Coordinate) -> Arc<[u64]> {
        let key = GridKey::round(point, CANDIDATE_PRECISION);
        if let Some(cells) = self.cell_grid.get(&key) {
            return Arc::clone(&cells);
        }
        let cells: Arc<[u64]> = self
            .coverer
            .cover(key.coordinate(), self.settings.cell_radius_m)
            .into();
        Arc::clone(&self.cell_grid.entry(key).or_insert(cells))
    }

    pub fn cell_grid_len(&self) -> usize {
        self.cell_grid.len()
    }

    /// Load a previously flushed cell grid; a missing file is an empty grid
    pub fn load_cell_grid(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let entries: Vec<(GridKey, Vec<u64>)> = serde_json::from_str(&content)
            .map_err(|e| ScanError::Io(format!("invalid cell grid file: {}", e)))?;
        let count = entries.len();
        for (key, cells) in entries {
            self.cell_grid.entry(key).or_insert_with(|| cells.into());
        }
        info!(path = %path.display(), entries = count, "Loaded cell grid");
        Ok(count)
    }

    pub fn flush_cell_grid(&self, path: &Path) -> Result<()> {
        let mut entries: Vec<(GridKey, Vec<u64>)> = self
            .cell_grid
            .iter()
            .map(|e| (*e.key(), e.value().to_vec()))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        let json = serde_json::to_string(&entries)
            .map_err(|e| ScanError::Internal(format!("failed to encode cell grid: {}", e)))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), entries = entries.len(), "Flushed cell grid");
        Ok(())
    }

    /// Persist the cell grid and every account
    pub fn teardown(&self, cells: &Path, accounts: &Path) -> Result<()> {
        self.flush_cell_grid(cells)?;
        self.accounts.save(accounts)
    }
}
