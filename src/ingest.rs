//! Telemetry reconciliation and surplus recording.
//!
//! Keeps persisted vehicle state in line with what the vehicle reports,
//! independent of the decision cycle.

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::controller::{Collaborators, CommandPacer};
use crate::domain::{
    ChargeState, ChargingEventKind, Command, CommandResultExt, SurplusRecord, Vehicle,
    VehicleCommandApi, VehicleState,
};
use crate::repo::Store;

/// Minimum minutes between two vehicle data polls.
pub const VEHICLE_DATA_INTERVAL_MINUTES: i64 = 5;

/// Charge-related telemetry pushed for a vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryUpdate {
    pub vin: String,
    pub plugged_in: bool,
    /// e.g. "Charging"; empty or anything else means not charging.
    #[serde(default)]
    pub charging_state: String,
    pub soc: i32,
    pub amps: i32,
    pub charge_limit: i32,
    /// Plug-ins away from home are ignored.
    #[serde(default = "default_true")]
    pub is_home: bool,
}

fn default_true() -> bool {
    true
}

impl TelemetryUpdate {
    pub fn is_charging(&self) -> bool {
        self.charging_state.eq_ignore_ascii_case("charging")
    }
}

pub struct TelemetryIngest {
    store: Arc<dyn Store>,
    api: Arc<dyn VehicleCommandApi>,
    clock: Arc<dyn Clock>,
    pacer: Arc<dyn CommandPacer>,
}

impl TelemetryIngest {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            store: collaborators.store.clone(),
            api: collaborators.api.clone(),
            clock: collaborators.clock.clone(),
            pacer: collaborators.pacer.clone(),
        }
    }

    /// Reconciles persisted state with a telemetry update. Unknown VINs are ignored.
    pub async fn apply_telemetry(&self, update: &TelemetryUpdate) -> Result<()> {
        let vin = update.vin.as_str();
        let Some(vehicle) = self.store.vehicle(vin).await? else {
            warn!(vin, "telemetry for unknown vehicle");
            return Ok(());
        };
        let known = self.store.vehicle_state(vin).await?;
        let old = known.clone().unwrap_or_else(|| VehicleState::new(vin));

        if known.is_none() || old.amps != update.amps {
            self.store.set_state_amps(vin, update.amps).await?;
        }
        if known.is_none() || old.soc != update.soc {
            self.store.set_state_soc(vin, update.soc).await?;
        }
        if known.is_none() || old.charge_limit != update.charge_limit {
            self.store
                .set_state_charge_limit(vin, update.charge_limit)
                .await?;
        }
        if old.charging.is_charging() && !update.is_charging() {
            info!(vin, "vehicle reports not charging, correcting state");
            self.store
                .set_state_charging(vin, ChargeState::NotCharging)
                .await?;
        }

        match (old.plugged_in, update.plugged_in) {
            (true, false) => self.on_unplugged(&vehicle, &old).await?,
            (false, true) if update.is_home => self.on_plugged_in(&vehicle).await?,
            (false, true) => debug!(vin, "plugged in away from home"),
            (false, false) if known.is_none() => {
                self.store.set_state_plugged_in(vin, false).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Manual plug state change. Returns false for unknown vehicles.
    pub async fn set_plugged_in(&self, vin: &str, plugged_in: bool) -> Result<bool> {
        let Some(vehicle) = self.store.vehicle(vin).await? else {
            return Ok(false);
        };
        if plugged_in {
            self.on_plugged_in(&vehicle).await?;
        } else {
            let old = self
                .store
                .vehicle_state(vin)
                .await?
                .unwrap_or_else(|| VehicleState::new(vin));
            self.on_unplugged(&vehicle, &old).await?;
        }
        Ok(true)
    }

    async fn on_unplugged(&self, vehicle: &Vehicle, old: &VehicleState) -> Result<()> {
        let vin = vehicle.vin.as_str();
        self.store.set_state_plugged_in(vin, false).await?;
        self.store
            .append_event(vin, ChargingEventKind::VehicleUnplug, "", self.clock.now())
            .await?;
        if old.charging.is_charging() {
            self.store
                .set_state_charging(vin, ChargeState::NotCharging)
                .await?;
        }
        info!(vin, "vehicle unplugged");
        Ok(())
    }

    /// Vehicles tend to start charging by themselves when plugged in; stop
    /// them so the controller decides.
    async fn on_plugged_in(&self, vehicle: &Vehicle) -> Result<()> {
        let vin = vehicle.vin.as_str();
        self.store.set_state_plugged_in(vin, true).await?;
        self.store
            .append_event(vin, ChargingEventKind::VehiclePlugIn, "", self.clock.now())
            .await?;
        info!(vin, "vehicle plugged in");
        if !vehicle.enabled {
            return Ok(());
        }

        if let Err(e) = self.api.wakeup(vin).await {
            warn!(vin, error = %e, "could not wake vehicle on plug in");
            return Ok(());
        }
        self.pacer.pace().await;
        if let Err(e) = self
            .api
            .charge_stop(vin)
            .await
            .normalized(Command::ChargeStop)
        {
            warn!(vin, error = %e, "could not stop charging on plug in");
        }
        Ok(())
    }

    /// Records a site-wide surplus sample at the current time.
    pub async fn record_surplus(&self, watts: i32) -> Result<()> {
        self.store
            .record_surplus(SurplusRecord {
                timestamp: self.clock.now(),
                watts,
            })
            .await
    }

    /// Polls vehicle data and stores the SoC, at most once per interval.
    /// Returns whether a poll was made.
    pub async fn refresh_vehicle_data(&self, vehicle: &Vehicle) -> Result<bool> {
        let vin = vehicle.vin.as_str();
        let now = self.clock.now();
        if let Some(last) = self
            .store
            .latest_event(vin, ChargingEventKind::VehicleUpdateData)
            .await?
        {
            if last.timestamp >= now - Duration::minutes(VEHICLE_DATA_INTERVAL_MINUTES) {
                return Ok(false);
            }
        }

        match self.api.vehicle_data(vin).await {
            Ok(data) => {
                self.store.set_state_soc(vin, data.soc).await?;
                self.store
                    .append_event(
                        vin,
                        ChargingEventKind::VehicleUpdateData,
                        &format!("vehicle SoC updated: {}", data.soc),
                        now,
                    )
                    .await?;
            }
            Err(e) => {
                warn!(vin, error = %e, "vehicle data poll failed");
                self.store
                    .append_event(vin, ChargingEventKind::VehicleUpdateData, &e.to_string(), now)
                    .await?;
            }
        }
        Ok(true)
    }

    /// Refreshes all enabled, plugged-in vehicles. Returns the number polled.
    pub async fn refresh_plugged_in(&self) -> Result<usize> {
        let mut polled = 0;
        for vehicle in self.store.vehicles().await? {
            if !vehicle.enabled {
                continue;
            }
            let plugged_in = self
                .store
                .vehicle_state(&vehicle.vin)
                .await?
                .is_some_and(|s| s.plugged_in);
            if plugged_in && self.refresh_vehicle_data(&vehicle).await? {
                polled += 1;
            }
        }
        Ok(polled)
    }
}
