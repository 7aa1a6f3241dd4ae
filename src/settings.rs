use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::session::DEFAULT_INTERRUPTION_REASON;

pub const DATA_DIR_ENV: &str = "CHAINLOCK_DATA_DIR";

/// Session lengths offered when creating a chain, in minutes.
pub const DURATION_PRESETS: [u32; 6] = [15, 25, 30, 45, 60, 90];

/// Booking windows offered for the auxiliary chain, in minutes.
pub const AUXILIARY_PRESETS: [u32; 5] = [5, 10, 15, 20, 30];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub session_sweep_interval_secs: u64,
    pub group_sweep_interval_secs: u64,
    pub query_cache_ttl_secs: u64,
    pub deleted_chain_retention_days: u32,
    pub default_interruption_reason: String,
    /// Minutes an expired booking may wait for a judgment before it is
    /// failed automatically. Unset means it waits indefinitely.
    pub lapse_grace_mins: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            session_sweep_interval_secs: 10,
            group_sweep_interval_secs: 60,
            query_cache_ttl_secs: 30,
            deleted_chain_retention_days: 30,
            default_interruption_reason: DEFAULT_INTERRUPTION_REASON.into(),
            lapse_grace_mins: None,
        }
    }
}

impl EngineSettings {
    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.max(1))
    }

    pub fn group_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.group_sweep_interval_secs.max(1))
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn lapse_grace(&self) -> Option<chrono::Duration> {
        self.lapse_grace_mins
            .map(|mins| chrono::Duration::minutes(i64::from(mins)))
    }
}

/// `CHAINLOCK_DATA_DIR` if set, otherwise the platform data directory.
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|dir| dir.join("chainlock"))
        .ok_or_else(|| anyhow!("no platform data directory; set {DATA_DIR_ENV}"))
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<EngineSettings>,
}

impl SettingsStore {
    /// Loads settings from `path`. A missing or malformed file falls back to defaults.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("ignoring malformed settings at {}: {err}", path.display());
                EngineSettings::default()
            })
        } else {
            EngineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> EngineSettings {
        self.read().clone()
    }

    pub fn update_engine(&self, settings: EngineSettings) -> Result<()> {
        let mut guard = self.write();
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &EngineSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
