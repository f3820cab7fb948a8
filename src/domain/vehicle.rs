use serde::{Deserialize, Serialize};

/// Charging state as persisted per vehicle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    #[default]
    NotCharging,
    ChargingOnSolar,
    ChargingOnGrid,
}

impl ChargeState {
    pub fn is_charging(self) -> bool {
        self != ChargeState::NotCharging
    }

    /// Human readable power source, used in notifications.
    pub fn source_label(self) -> &'static str {
        match self {
            ChargeState::NotCharging => "nothing",
            ChargeState::ChargingOnSolar => "solar power",
            ChargeState::ChargingOnGrid => "grid",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GridStrategy {
    /// Cheapest hours below the price cap, no deadline.
    #[default]
    NoDeparturePriceLimit,
    /// Earliest hours before the next departure, no price cap.
    DepartureNoPriceLimit,
    /// Capped hours before departure, uncapped hours if the capped ones are not enough.
    DepartureWithPriceLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GridProvider {
    Tibber,
}

/// Vehicle configuration. Owned by whoever registers the vehicle; read-only for the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vehicle {
    pub vin: String,
    pub display_name: String,
    pub enabled: bool,
    /// Percent.
    pub target_soc: i32,
    pub max_amps: i32,
    pub num_phases: i32,
    pub surplus_charging: bool,
    /// Watts.
    pub min_surplus: i32,
    /// Minutes a solar charge must run before it may be stopped.
    pub min_charge_time: i32,
    pub lowcost_charging: bool,
    /// Cents per kWh.
    pub max_price: i32,
    #[serde(default)]
    pub grid_provider: Option<GridProvider>,
    #[serde(default)]
    pub grid_strategy: GridStrategy,
    /// Weekday digits, 1 = Monday .. 7 = Sunday, e.g. "135".
    #[serde(default)]
    pub depart_days: String,
    /// "HH:MM" or "HH:MM:SS".
    #[serde(default)]
    pub depart_time: String,
}

impl Vehicle {
    /// Power drawn at the given current, assuming 230 V per phase.
    pub fn watts_at(&self, amps: i32) -> i32 {
        amps.saturating_mul(230).saturating_mul(self.num_phases)
    }
}

/// Mutable per-vehicle state written by the controller and by telemetry ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VehicleState {
    pub vin: String,
    pub plugged_in: bool,
    pub charging: ChargeState,
    pub soc: i32,
    pub amps: i32,
    pub charge_limit: i32,
}

impl VehicleState {
    pub fn new(vin: impl Into<String>) -> Self {
        Self {
            vin: vin.into(),
            ..Default::default()
        }
    }
}
