use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::domain::{ChargingEvent, Vehicle, VehicleState};

/// Events kept per vehicle in a snapshot, newest last.
pub const SNAPSHOT_EVENTS_PER_VEHICLE: usize = 500;

/// Durable part of the store: everything that must survive a restart.
///
/// Surplus samples and spot prices are short-lived and re-reported, so they
/// are left out.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub vehicles: Vec<Vehicle>,
    pub states: Vec<VehicleState>,
    pub events: Vec<ChargingEvent>,
    pub hour_blocks: Vec<(String, DateTime<Utc>)>,
    /// Keyed by the setting's snake_case name.
    pub settings: BTreeMap<String, String>,
}

/// JSON file holding the latest [`Snapshot`].
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` if no snapshot was written yet.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt snapshot {}", self.path.display()))?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading snapshot {}", self.path.display())),
        }
    }

    /// Serializes writers. Take the snapshot only after acquiring it so a
    /// slower writer never replaces newer data with older.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing snapshot {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_snapshot_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("chargebot-{}-{name}", std::process::id()))
        .join("state.json")
}
