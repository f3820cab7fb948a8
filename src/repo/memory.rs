use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use super::snapshot::{Snapshot, SnapshotFile, SNAPSHOT_EVENTS_PER_VEHICLE};
use super::{PriceSource, SettingKey, Store};
use crate::domain::{
    hour_start, ChargeState, ChargingEvent, ChargingEventKind, GridPrice, PriceOrder,
    SurplusRecord, Vehicle, VehicleState,
};

#[derive(Debug, Default)]
struct Inner {
    vehicles: BTreeMap<String, Vehicle>,
    states: HashMap<String, VehicleState>,
    events: HashMap<String, Vec<ChargingEvent>>,
    /// Oldest first.
    surpluses: Vec<SurplusRecord>,
    hour_blocks: HashSet<(String, DateTime<Utc>)>,
    settings: HashMap<SettingKey, String>,
    prices: HashMap<String, Vec<GridPrice>>,
}

/// Surplus samples older than this, relative to the newest one, are dropped.
pub const SURPLUS_RETENTION_MINUTES: i64 = 60;

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let mut events: Vec<ChargingEvent> = Vec::new();
        for per_vehicle in self.events.values() {
            let skip = per_vehicle.len().saturating_sub(SNAPSHOT_EVENTS_PER_VEHICLE);
            events.extend(per_vehicle.iter().skip(skip).cloned());
        }
        Snapshot {
            vehicles: self.vehicles.values().cloned().collect(),
            states: self
                .states
                .values()
                .cloned()
                .sorted_by(|a, b| a.vin.cmp(&b.vin))
                .collect(),
            events,
            hour_blocks: self.hour_blocks.iter().cloned().sorted().collect(),
            settings: self
                .settings
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.vehicles = snapshot
            .vehicles
            .into_iter()
            .map(|v| (v.vin.clone(), v))
            .collect();
        self.states = snapshot
            .states
            .into_iter()
            .map(|s| (s.vin.clone(), s))
            .collect();
        self.events.clear();
        for event in snapshot.events {
            self.events.entry(event.vin.clone()).or_default().push(event);
        }
        self.hour_blocks = snapshot.hour_blocks.into_iter().collect();
        self.settings.clear();
        for (key, value) in snapshot.settings {
            match SettingKey::from_str(&key) {
                Ok(key) => {
                    self.settings.insert(key, value);
                }
                Err(_) => warn!(%key, "ignoring unknown setting in snapshot"),
            }
        }
    }
}

/// In-process store backing the service and the tests.
///
/// Optionally mirrors its durable part into a [`SnapshotFile`] after every
/// write, so settings, vehicle state, events and hour memos survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
    snapshot: Option<SnapshotFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store persisted to `path`, restored from it when the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = SnapshotFile::new(path);
        let mut inner = Inner::default();
        if let Some(snapshot) = file.load().await? {
            info!(
                path = %file.path().display(),
                vehicles = snapshot.vehicles.len(),
                "restored store snapshot"
            );
            inner.restore(snapshot);
        }
        Ok(Self {
            inner: RwLock::new(inner),
            unavailable: AtomicBool::new(false),
            snapshot: Some(file),
        })
    }

    async fn persist(&self) -> Result<()> {
        let Some(file) = &self.snapshot else {
            return Ok(());
        };
        let _writer = file.lock().await;
        let snapshot = self.inner.read().snapshot();
        file.save(&snapshot).await
    }

    /// Replaces the known prices of a vehicle's grid provider.
    pub fn set_grid_prices(&self, vin: &str, prices: Vec<GridPrice>) {
        self.inner.write().prices.insert(vin.to_string(), prices);
    }

    /// Simulates an outage: every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }

    async fn update_state(&self, vin: &str, f: impl FnOnce(&mut VehicleState)) -> Result<()> {
        self.check()?;
        {
            let mut inner = self.inner.write();
            let state = inner
                .states
                .entry(vin.to_string())
                .or_insert_with(|| VehicleState::new(vin));
            f(state);
        }
        self.persist().await
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn vehicles(&self) -> Result<Vec<Vehicle>> {
        self.check()?;
        Ok(self.inner.read().vehicles.values().cloned().collect())
    }

    async fn vehicle(&self, vin: &str) -> Result<Option<Vehicle>> {
        self.check()?;
        Ok(self.inner.read().vehicles.get(vin).cloned())
    }

    async fn upsert_vehicle(&self, vehicle: Vehicle) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .vehicles
            .insert(vehicle.vin.clone(), vehicle);
        self.persist().await
    }

    async fn delete_vehicle(&self, vin: &str) -> Result<()> {
        self.check()?;
        {
            let mut inner = self.inner.write();
            inner.vehicles.remove(vin);
            inner.states.remove(vin);
            inner.events.remove(vin);
            inner.prices.remove(vin);
            inner.hour_blocks.retain(|(v, _)| v != vin);
        }
        self.persist().await
    }

    async fn vehicle_state(&self, vin: &str) -> Result<Option<VehicleState>> {
        self.check()?;
        Ok(self.inner.read().states.get(vin).cloned())
    }

    async fn set_state_plugged_in(&self, vin: &str, plugged_in: bool) -> Result<()> {
        self.update_state(vin, |s| s.plugged_in = plugged_in).await
    }

    async fn set_state_charging(&self, vin: &str, charging: ChargeState) -> Result<()> {
        self.update_state(vin, |s| s.charging = charging).await
    }

    async fn set_state_soc(&self, vin: &str, soc: i32) -> Result<()> {
        self.update_state(vin, |s| s.soc = soc).await
    }

    async fn set_state_amps(&self, vin: &str, amps: i32) -> Result<()> {
        self.update_state(vin, |s| s.amps = amps).await
    }

    async fn set_state_charge_limit(&self, vin: &str, limit: i32) -> Result<()> {
        self.update_state(vin, |s| s.charge_limit = limit).await
    }

    async fn append_event(
        &self,
        vin: &str,
        kind: ChargingEventKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .events
            .entry(vin.to_string())
            .or_default()
            .push(ChargingEvent {
                vin: vin.to_string(),
                timestamp: at,
                kind,
                detail: detail.to_string(),
            });
        self.persist().await
    }

    async fn latest_event(&self, vin: &str, kind: ChargingEventKind) -> Result<Option<ChargingEvent>> {
        self.check()?;
        let inner = self.inner.read();
        Ok(inner.events.get(vin).and_then(|events| {
            events
                .iter()
                .filter(|e| e.kind == kind)
                .max_by_key(|e| e.timestamp)
                .cloned()
        }))
    }

    async fn latest_events(&self, vin: &str, limit: usize) -> Result<Vec<ChargingEvent>> {
        self.check()?;
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(vin)
            .map(|events| {
                events
                    .iter()
                    .rev()
                    .sorted_by(|a, b| b.timestamp.cmp(&a.timestamp))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_surplus(&self, record: SurplusRecord) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.write();
        let surpluses = &mut inner.surpluses;
        let pos = surpluses.partition_point(|s| s.timestamp <= record.timestamp);
        surpluses.insert(pos, record);

        if let Some(newest) = surpluses.last().map(|s| s.timestamp) {
            let cutoff = newest - Duration::minutes(SURPLUS_RETENTION_MINUTES);
            let stale = surpluses.partition_point(|s| s.timestamp < cutoff);
            surpluses.drain(..stale);
        }
        Ok(())
    }

    async fn latest_surpluses(&self, limit: usize) -> Result<Vec<SurplusRecord>> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .surpluses
            .iter()
            .rev()
            .take(limit)
            .copied()
            .collect())
    }

    async fn is_selected_hour_block(&self, vin: &str, hour: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        Ok(self
            .inner
            .read()
            .hour_blocks
            .contains(&(vin.to_string(), hour_start(hour))))
    }

    async fn record_selected_hour_block(&self, vin: &str, hour: DateTime<Utc>) -> Result<()> {
        self.check()?;
        self.inner
            .write()
            .hour_blocks
            .insert((vin.to_string(), hour_start(hour)));
        self.persist().await
    }

    async fn setting(&self, key: SettingKey) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.read().settings.get(&key).cloned())
    }

    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<()> {
        self.check()?;
        self.inner.write().settings.insert(key, value.to_string());
        self.persist().await
    }
}

#[async_trait]
impl PriceSource for MemoryStore {
    async fn upcoming_prices(
        &self,
        vehicle: &Vehicle,
        from: DateTime<Utc>,
        order: PriceOrder,
    ) -> Result<Vec<GridPrice>> {
        self.check()?;
        if vehicle.grid_provider.is_none() {
            return Ok(Vec::new());
        }
        let current_hour = hour_start(from);
        let inner = self.inner.read();
        let upcoming = inner
            .prices
            .get(&vehicle.vin)
            .into_iter()
            .flatten()
            .filter(|p| p.starts_at >= current_hour)
            .copied();
        let prices = match order {
            // stable sort keeps equal prices in time order
            PriceOrder::ByPrice => upcoming
                .sorted_by_key(|p| p.starts_at)
                .sorted_by(|a, b| a.total.total_cmp(&b.total))
                .collect(),
            PriceOrder::ByTime => upcoming.sorted_by_key(|p| p.starts_at).collect(),
        };
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GridProvider, GridStrategy};
    use chrono::{Duration, TimeZone};

    fn vehicle(vin: &str) -> Vehicle {
        Vehicle {
            vin: vin.into(),
            display_name: "Test".into(),
            enabled: true,
            target_soc: 70,
            max_amps: 16,
            num_phases: 3,
            surplus_charging: true,
            min_surplus: 2000,
            min_charge_time: 15,
            lowcost_charging: true,
            max_price: 20,
            grid_provider: Some(GridProvider::Tibber),
            grid_strategy: GridStrategy::NoDeparturePriceLimit,
            depart_days: "12345".into(),
            depart_time: "07:00".into(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_latest_event_by_kind() {
        let store = MemoryStore::new();
        store
            .append_event("V1", ChargingEventKind::ChargeStart, "", t0())
            .await
            .unwrap();
        store
            .append_event("V1", ChargingEventKind::ChargeStop, "stopped", t0() + Duration::minutes(5))
            .await
            .unwrap();
        store
            .append_event("V1", ChargingEventKind::ChargeStart, "again", t0() + Duration::minutes(10))
            .await
            .unwrap();

        let latest = store
            .latest_event("V1", ChargingEventKind::ChargeStart)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.detail, "again");
        assert!(store
            .latest_event("V1", ChargingEventKind::WakeVehicle)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .latest_event("V2", ChargingEventKind::ChargeStart)
            .await
            .unwrap()
            .is_none());

        let events = store.latest_events("V1", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, "again");
        assert_eq!(events[1].detail, "stopped");
    }

    #[tokio::test]
    async fn test_latest_surpluses_newest_first() {
        let store = MemoryStore::new();
        for (i, watts) in [100, 200, 300].into_iter().enumerate() {
            store
                .record_surplus(SurplusRecord {
                    timestamp: t0() + Duration::minutes(i as i64),
                    watts,
                })
                .await
                .unwrap();
        }
        let latest = store.latest_surpluses(2).await.unwrap();
        assert_eq!(latest.iter().map(|s| s.watts).collect::<Vec<_>>(), vec![300, 200]);
    }

    #[tokio::test]
    async fn test_surpluses_ordered_and_pruned() {
        let store = MemoryStore::new();
        let at = |minutes: i64, watts: i32| SurplusRecord {
            timestamp: t0() + Duration::minutes(minutes),
            watts,
        };
        store.record_surplus(at(0, 100)).await.unwrap();
        store.record_surplus(at(10, 300)).await.unwrap();
        // late arrival lands in time order
        store.record_surplus(at(5, 200)).await.unwrap();
        let latest = store.latest_surpluses(3).await.unwrap();
        assert_eq!(latest.iter().map(|s| s.watts).collect::<Vec<_>>(), vec![300, 200, 100]);

        store
            .record_surplus(at(SURPLUS_RETENTION_MINUTES + 6, 400))
            .await
            .unwrap();
        let latest = store.latest_surpluses(10).await.unwrap();
        assert_eq!(latest.iter().map(|s| s.watts).collect::<Vec<_>>(), vec![400, 300]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let path = crate::repo::snapshot::temp_snapshot_path("reopen");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());

        let store = MemoryStore::open(&path).await.unwrap();
        store.upsert_vehicle(vehicle("V1")).await.unwrap();
        store.set_state_plugged_in("V1", true).await.unwrap();
        store.set_state_soc("V1", 42).await.unwrap();
        store
            .append_event("V1", ChargingEventKind::ChargeStart, "", t0())
            .await
            .unwrap();
        store.record_selected_hour_block("V1", t0()).await.unwrap();
        store.set_setting(SettingKey::PermanentError, "1").await.unwrap();
        store
            .record_surplus(SurplusRecord {
                timestamp: t0(),
                watts: 3000,
            })
            .await
            .unwrap();
        drop(store);

        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.setting(SettingKey::PermanentError).await.unwrap().as_deref(),
            Some("1")
        );
        let state = reopened.vehicle_state("V1").await.unwrap().unwrap();
        assert!(state.plugged_in);
        assert_eq!(state.soc, 42);
        assert!(reopened.vehicle("V1").await.unwrap().is_some());
        assert!(reopened
            .latest_event("V1", ChargingEventKind::ChargeStart)
            .await
            .unwrap()
            .is_some());
        assert!(reopened.is_selected_hour_block("V1", t0()).await.unwrap());
        assert!(reopened.latest_surpluses(1).await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_hour_block_memo_uses_hour_granularity() {
        let store = MemoryStore::new();
        store
            .record_selected_hour_block("V1", t0() + Duration::minutes(25))
            .await
            .unwrap();
        assert!(store.is_selected_hour_block("V1", t0()).await.unwrap());
        assert!(store
            .is_selected_hour_block("V1", t0() + Duration::minutes(59))
            .await
            .unwrap());
        assert!(!store
            .is_selected_hour_block("V1", t0() + Duration::hours(1))
            .await
            .unwrap());
        assert!(!store.is_selected_hour_block("V2", t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_vehicle_cascades() {
        let store = MemoryStore::new();
        store.upsert_vehicle(vehicle("V1")).await.unwrap();
        store.set_state_plugged_in("V1", true).await.unwrap();
        store
            .append_event("V1", ChargingEventKind::VehiclePlugIn, "", t0())
            .await
            .unwrap();
        store.record_selected_hour_block("V1", t0()).await.unwrap();

        store.delete_vehicle("V1").await.unwrap();

        assert!(store.vehicle("V1").await.unwrap().is_none());
        assert!(store.vehicle_state("V1").await.unwrap().is_none());
        assert!(store.latest_events("V1", 10).await.unwrap().is_empty());
        assert!(!store.is_selected_hour_block("V1", t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_upcoming_prices_ordering() {
        let store = MemoryStore::new();
        let v = vehicle("V1");
        store.set_grid_prices(
            "V1",
            vec![
                GridPrice::new(0.30, t0() - Duration::hours(1)),
                GridPrice::new(0.25, t0()),
                GridPrice::new(0.15, t0() + Duration::hours(1)),
                GridPrice::new(0.25, t0() + Duration::hours(2)),
            ],
        );

        let now = t0() + Duration::minutes(30);
        let by_price = store.upcoming_prices(&v, now, PriceOrder::ByPrice).await.unwrap();
        assert_eq!(
            by_price.iter().map(|p| p.starts_at).collect::<Vec<_>>(),
            vec![t0() + Duration::hours(1), t0(), t0() + Duration::hours(2)]
        );

        let by_time = store.upcoming_prices(&v, now, PriceOrder::ByTime).await.unwrap();
        assert_eq!(by_time.first().map(|p| p.starts_at), Some(t0()));
        assert_eq!(by_time.len(), 3);

        let mut no_provider = v.clone();
        no_provider.grid_provider = None;
        assert!(store
            .upcoming_prices(&no_provider, now, PriceOrder::ByPrice)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.vehicles().await.is_err());
        store.set_unavailable(false);
        assert!(store.vehicles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_are_keyed() {
        let store = MemoryStore::new();
        assert!(store.setting(SettingKey::PermanentError).await.unwrap().is_none());
        store.set_setting(SettingKey::RefreshToken, "rt-1").await.unwrap();
        store.set_setting(SettingKey::PermanentError, "1").await.unwrap();
        assert_eq!(
            store.setting(SettingKey::RefreshToken).await.unwrap().as_deref(),
            Some("rt-1")
        );
        assert_eq!(SettingKey::PermanentError.to_string(), "permanent_error");
    }
}
