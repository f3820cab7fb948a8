//! Shared wiring for the integration scenarios.
#![allow(dead_code)]

use chargebot::clock::{Clock, ManualClock};
use chargebot::controller::{ChargeController, Collaborators, ControllerSettings, NoPacing};
use chargebot::domain::{GridProvider, GridStrategy, SimulatedVehicleApi, Vehicle, VehicleState};
use chargebot::ingest::{TelemetryIngest, TelemetryUpdate};
use chargebot::notify::LogNotifier;
use chargebot::repo::{MemoryStore, Store};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

pub const VIN: &str = "5YJ3E7EB0KF000001";

pub struct Site {
    pub controller: Arc<ChargeController>,
    pub ingest: TelemetryIngest,
    pub store: Arc<MemoryStore>,
    pub api: SimulatedVehicleApi,
    pub clock: Arc<ManualClock>,
}

/// Monday 2024-03-04 00:00 UTC.
pub fn monday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

pub fn vehicle(vin: &str) -> Vehicle {
    Vehicle {
        vin: vin.into(),
        display_name: "Model 3".into(),
        enabled: true,
        target_soc: 70,
        max_amps: 16,
        num_phases: 3,
        surplus_charging: true,
        min_surplus: 2000,
        min_charge_time: 15,
        lowcost_charging: false,
        max_price: 20,
        grid_provider: Some(GridProvider::Tibber),
        grid_strategy: GridStrategy::NoDeparturePriceLimit,
        depart_days: String::new(),
        depart_time: String::new(),
    }
}

impl Site {
    pub fn new(start: DateTime<Utc>, api: SimulatedVehicleApi, concurrent: bool) -> Self {
        Self::with_store(start, api, concurrent, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        start: DateTime<Utc>,
        api: SimulatedVehicleApi,
        concurrent: bool,
        store: Arc<MemoryStore>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let collaborators = Collaborators {
            store: store.clone(),
            prices: store.clone(),
            api: Arc::new(api.clone()),
            notifier: Arc::new(LogNotifier),
            clock: clock.clone(),
            pacer: Arc::new(NoPacing),
        };
        let controller = Arc::new(ChargeController::new(
            collaborators.clone(),
            ControllerSettings {
                concurrent,
                ..Default::default()
            },
        ));
        Self {
            controller,
            ingest: TelemetryIngest::new(&collaborators),
            store,
            api,
            clock,
        }
    }

    /// Registers the vehicle and reports it plugged in at home.
    pub async fn plug_in(&self, vehicle: &Vehicle, soc: i32) {
        self.store.upsert_vehicle(vehicle.clone()).await.unwrap();
        self.api.add_vehicle(&vehicle.vin, soc).await;
        self.ingest
            .apply_telemetry(&telemetry(&vehicle.vin, soc, ""))
            .await
            .unwrap();
    }

    pub async fn surplus(&self, watts: i32) {
        self.ingest.record_surplus(watts).await.unwrap();
    }

    pub async fn state(&self, vin: &str) -> VehicleState {
        self.store.vehicle_state(vin).await.unwrap().unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

pub fn telemetry(vin: &str, soc: i32, charging_state: &str) -> TelemetryUpdate {
    TelemetryUpdate {
        vin: vin.into(),
        plugged_in: true,
        charging_state: charging_state.into(),
        soc,
        amps: 0,
        charge_limit: 80,
        is_home: true,
    }
}
