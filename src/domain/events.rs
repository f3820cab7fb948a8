use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kinds of entries in the per-vehicle charging log.
///
/// The log doubles as timer state: "time since the latest event of kind X"
/// drives back-off, dwell time and rate limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChargingEventKind {
    ChargeStart,
    ChargeStop,
    VehiclePlugIn,
    VehicleUnplug,
    VehicleUpdateData,
    WakeVehicle,
    SetTargetSoC,
    SetChargingAmps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChargingEvent {
    pub vin: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ChargingEventKind,
    pub detail: String,
}

/// Site-wide solar surplus sample. Negative watts mean a deficit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurplusRecord {
    pub timestamp: DateTime<Utc>,
    pub watts: i32,
}
