//! Persistence boundary of the charge controller.
//!
//! Storage is plain keyed CRUD; all decisions live in the controller.
//! Implementations must be safe for concurrent use by several vehicle tasks.

mod memory;
mod snapshot;

pub use memory::{MemoryStore, SURPLUS_RETENTION_MINUTES};
pub use snapshot::{Snapshot, SnapshotFile};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::domain::{
    ChargeState, ChargingEvent, ChargingEventKind, GridPrice, PriceOrder, SurplusRecord, Vehicle,
    VehicleState,
};

/// Global key-value settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    /// "1" halts all automated charging until an operator clears it.
    PermanentError,
    /// Token used to renew the command proxy access token.
    RefreshToken,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn vehicles(&self) -> Result<Vec<Vehicle>>;
    async fn vehicle(&self, vin: &str) -> Result<Option<Vehicle>>;
    async fn upsert_vehicle(&self, vehicle: Vehicle) -> Result<()>;
    /// Removes the vehicle together with its state, events and hour blocks.
    async fn delete_vehicle(&self, vin: &str) -> Result<()>;

    async fn vehicle_state(&self, vin: &str) -> Result<Option<VehicleState>>;
    // Setters create the state record on first write.
    async fn set_state_plugged_in(&self, vin: &str, plugged_in: bool) -> Result<()>;
    async fn set_state_charging(&self, vin: &str, charging: ChargeState) -> Result<()>;
    async fn set_state_soc(&self, vin: &str, soc: i32) -> Result<()>;
    async fn set_state_amps(&self, vin: &str, amps: i32) -> Result<()>;
    async fn set_state_charge_limit(&self, vin: &str, limit: i32) -> Result<()>;

    async fn append_event(
        &self,
        vin: &str,
        kind: ChargingEventKind,
        detail: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn latest_event(&self, vin: &str, kind: ChargingEventKind) -> Result<Option<ChargingEvent>>;
    /// Newest first.
    async fn latest_events(&self, vin: &str, limit: usize) -> Result<Vec<ChargingEvent>>;

    async fn record_surplus(&self, record: SurplusRecord) -> Result<()>;
    /// Newest first.
    async fn latest_surpluses(&self, limit: usize) -> Result<Vec<SurplusRecord>>;

    async fn is_selected_hour_block(&self, vin: &str, hour: DateTime<Utc>) -> Result<bool>;
    async fn record_selected_hour_block(&self, vin: &str, hour: DateTime<Utc>) -> Result<()>;

    async fn setting(&self, key: SettingKey) -> Result<Option<String>>;
    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<()>;
}

/// Source of upcoming spot prices for a vehicle's grid provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Hour blocks starting at or after the hour containing `from`.
    /// Vehicles without a grid provider get an empty list.
    async fn upcoming_prices(
        &self,
        vehicle: &Vehicle,
        from: DateTime<Utc>,
        order: PriceOrder,
    ) -> Result<Vec<GridPrice>>;
}
