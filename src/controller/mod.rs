//! Charge decision engine.
//!
//! Once per tick every registered vehicle runs through [`ChargeController::process_vehicle`],
//! which picks one of: nothing, stop, check start, or supervise the running charge.

pub mod activation;
pub mod departure;
pub mod grid;
pub mod guard;
pub mod pacing;
pub mod scheduler;
pub mod solar;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use guard::{InTickSet, TickGuard, TickLease};
pub use pacing::{CommandPacer, FixedDelayPacer, NoPacing};
pub use scheduler::{TaskStatus, TickScheduler};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ControllerConfig};
use crate::domain::{
    ChargeState, ChargingEventKind, SimulatedVehicleApi, Vehicle, VehicleCommandApi, VehicleState,
};
use crate::hardware::CommandProxyClient;
use crate::ingest::TelemetryIngest;
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::repo::{MemoryStore, PriceSource, SettingKey, Store};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub controller: Arc<ChargeController>,
    pub ingest: Arc<TelemetryIngest>,
    pub scheduler: Arc<TickScheduler>,
    pub store: Arc<MemoryStore>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let store = Arc::new(match &cfg.storage.snapshot_path {
            Some(path) => MemoryStore::open(path).await?,
            None => {
                warn!("no snapshot path configured, controller state is lost on restart");
                MemoryStore::new()
            }
        });
        for vehicle in &cfg.vehicles {
            store.upsert_vehicle(vehicle.clone()).await?;
        }

        let api: Arc<dyn VehicleCommandApi> = if cfg.commands.endpoint.is_empty() {
            let sim = SimulatedVehicleApi::new();
            for vehicle in &cfg.vehicles {
                sim.add_vehicle(&vehicle.vin, 50).await;
            }
            info!(vehicles = cfg.vehicles.len(), "using simulated vehicle API");
            Arc::new(sim)
        } else {
            Arc::new(CommandProxyClient::new(&cfg.commands)?)
        };

        let notifier: Arc<dyn Notifier> = if cfg.notifications.telegram_token.is_empty() {
            Arc::new(LogNotifier)
        } else {
            Arc::new(TelegramNotifier::new(
                crate::notify::TELEGRAM_API,
                cfg.notifications.telegram_token.clone(),
                cfg.notifications.telegram_chat_id.clone(),
            )?)
        };

        let collaborators = Collaborators {
            store: store.clone(),
            prices: store.clone(),
            api,
            notifier,
            clock: Arc::new(SystemClock),
            pacer: Arc::new(FixedDelayPacer::new(std::time::Duration::from_millis(
                cfg.controller.command_delay_ms,
            ))),
        };

        let controller = Arc::new(ChargeController::new(
            collaborators.clone(),
            ControllerSettings::from(&cfg.controller),
        ));
        let ingest = Arc::new(TelemetryIngest::new(&collaborators));
        let scheduler = Arc::new(TickScheduler::new(
            controller.clone(),
            ingest.clone(),
            collaborators.clock.clone(),
            cfg.controller.tick_seconds,
        ));

        Ok(Self {
            cfg,
            controller,
            ingest,
            scheduler,
            store,
        })
    }
}

pub fn spawn_controller_tasks(state: AppState) {
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.run_tick_loop().await;
    });

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.run_refresh_loop().await;
    });
}

/// Tunables of the decision engine.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Process vehicles as independent tasks. Sequential mode keeps tests deterministic.
    pub concurrent: bool,
    pub max_charge_start_failures: u32,
    pub failure_backoff_minutes: i64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            concurrent: true,
            max_charge_start_failures: 10,
            failure_backoff_minutes: 5,
        }
    }
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            concurrent: cfg.concurrent,
            max_charge_start_failures: cfg.max_charge_start_failures,
            failure_backoff_minutes: cfg.failure_backoff_minutes,
        }
    }
}

/// External collaborators of the controller.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub prices: Arc<dyn PriceSource>,
    pub api: Arc<dyn VehicleCommandApi>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub pacer: Arc<dyn CommandPacer>,
}

/// Outcome of one decision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoState,
    NotPluggedIn,
    Disabled,
    Busy,
    Stop,
    CheckStart,
    Supervise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The permanent error flag is set; nothing was processed.
    Halted,
    Dispatched(usize),
}

/// Picks the action for a vehicle from its configuration and persisted state.
///
/// Evaluated in order, first match wins. The in-tick guard sits between the
/// idle checks and the actionable branches and is applied by the caller.
pub fn select_action(vehicle: &Vehicle, state: &VehicleState) -> Decision {
    if !state.plugged_in {
        return Decision::NotPluggedIn;
    }
    if !vehicle.enabled && !state.charging.is_charging() {
        return Decision::Disabled;
    }
    if !vehicle.enabled {
        return Decision::Stop;
    }
    match state.charging {
        ChargeState::ChargingOnSolar if !vehicle.surplus_charging => Decision::Stop,
        ChargeState::ChargingOnGrid if !vehicle.lowcost_charging => Decision::Stop,
        ChargeState::NotCharging => Decision::CheckStart,
        _ => Decision::Supervise,
    }
}

pub struct ChargeController {
    store: Arc<dyn Store>,
    prices: Arc<dyn PriceSource>,
    api: Arc<dyn VehicleCommandApi>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    pacer: Arc<dyn CommandPacer>,
    guard: Arc<dyn TickGuard>,
    settings: ControllerSettings,
    charge_start_failures: AtomicU32,
}

impl ChargeController {
    pub fn new(collaborators: Collaborators, settings: ControllerSettings) -> Self {
        Self {
            store: collaborators.store,
            prices: collaborators.prices,
            api: collaborators.api,
            notifier: collaborators.notifier,
            clock: collaborators.clock,
            pacer: collaborators.pacer,
            guard: Arc::new(InTickSet::new()),
            settings,
            charge_start_failures: AtomicU32::new(0),
        }
    }

    /// Replaces the default in-tick set.
    pub fn with_guard(mut self, guard: Arc<dyn TickGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Consecutive failed charge starts since the last success or trip.
    pub fn charge_start_failures(&self) -> u32 {
        self.charge_start_failures.load(Ordering::SeqCst)
    }

    pub async fn permanent_error(&self) -> Result<bool> {
        Ok(self.store.setting(SettingKey::PermanentError).await?.as_deref() == Some("1"))
    }

    /// Operator action releasing the permanent error halt.
    pub async fn clear_permanent_error(&self) -> Result<()> {
        self.store.set_setting(SettingKey::PermanentError, "0").await?;
        self.charge_start_failures.store(0, Ordering::SeqCst);
        info!("permanent error cleared");
        Ok(())
    }

    /// Runs one control tick over all registered vehicles.
    pub async fn on_tick(self: &Arc<Self>) -> Result<TickOutcome> {
        if self.permanent_error().await? {
            error!("ACTION REQUIRED: permanent error after recurring charge failures, automated charging halted until reset");
            return Ok(TickOutcome::Halted);
        }

        let vehicles = self.store.vehicles().await?;
        let count = vehicles.len();
        for vehicle in vehicles {
            if self.settings.concurrent {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_cycle(vehicle).await });
            } else {
                self.run_cycle(vehicle).await;
            }
        }
        Ok(TickOutcome::Dispatched(count))
    }

    async fn run_cycle(&self, vehicle: Vehicle) {
        match self.process_vehicle(&vehicle).await {
            Ok(decision) => debug!(vin = %vehicle.vin, ?decision, "decision cycle done"),
            Err(e) => warn!(vin = %vehicle.vin, error = %e, "decision cycle aborted"),
        }
    }

    /// One decision cycle for a single vehicle.
    pub async fn process_vehicle(&self, vehicle: &Vehicle) -> Result<Decision> {
        let Some(state) = self.store.vehicle_state(&vehicle.vin).await? else {
            return Ok(Decision::NoState);
        };

        let decision = select_action(vehicle, &state);
        if matches!(decision, Decision::NotPluggedIn | Decision::Disabled) {
            return Ok(decision);
        }

        let Some(_lease) = self.guard.try_acquire(&vehicle.vin) else {
            debug!(vin = %vehicle.vin, "previous cycle still running, skipping");
            return Ok(Decision::Busy);
        };

        // a cycle that just released the lease may have changed the state
        let Some(state) = self.store.vehicle_state(&vehicle.vin).await? else {
            return Ok(Decision::NoState);
        };
        let decision = select_action(vehicle, &state);

        match decision {
            Decision::Stop => self.stop_charging(vehicle, &state).await?,
            Decision::CheckStart => self.check_start_charging(vehicle, &state).await?,
            Decision::Supervise => self.check_charge_process(vehicle, &state).await?,
            _ => {}
        }
        Ok(decision)
    }

    /// Target charge state and current for the vehicle right now. Solar wins over grid.
    pub async fn check_target_state(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
    ) -> Result<(ChargeState, i32)> {
        if let Some(amps) = self.check_start_on_solar(vehicle, state).await? {
            return Ok((ChargeState::ChargingOnSolar, amps));
        }
        if let Some(amps) = self.check_start_on_grid(vehicle, state).await? {
            return Ok((ChargeState::ChargingOnGrid, amps));
        }
        Ok((ChargeState::NotCharging, 0))
    }

    /// Supervises a running charge: stop at target, resize solar current,
    /// stop once the power source is gone and the minimum dwell has passed.
    async fn check_charge_process(&self, vehicle: &Vehicle, state: &VehicleState) -> Result<()> {
        if state.soc >= vehicle.target_soc {
            return self.stop_charging(vehicle, state).await;
        }

        let (target_state, target_amps) = self.check_target_state(vehicle, state).await?;
        debug!(
            vin = %vehicle.vin,
            ?target_state,
            target_amps,
            "supervising charge"
        );

        self.adjust_solar_amps(vehicle, state, target_amps).await?;

        if !self.minimum_charge_time_reached(vehicle, state).await? {
            debug!(vin = %vehicle.vin, "minimum charge time not reached");
            return Ok(());
        }

        if target_state == ChargeState::NotCharging {
            self.stop_charging(vehicle, state).await?;
        }
        Ok(())
    }

    /// Solar charges must run `min_charge_time` minutes before they may be stopped.
    pub async fn minimum_charge_time_reached(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
    ) -> Result<bool> {
        let Some(started) = self
            .store
            .latest_event(&vehicle.vin, ChargingEventKind::ChargeStart)
            .await?
        else {
            return Ok(true);
        };
        if state.charging != ChargeState::ChargingOnSolar {
            return Ok(true);
        }
        let limit = self.now() - Duration::minutes(i64::from(vehicle.min_charge_time));
        Ok(started.timestamp < limit)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn log_event(&self, vin: &str, kind: ChargingEventKind, detail: &str) -> Result<()> {
        self.store.append_event(vin, kind, detail, self.now()).await
    }

    /// Notifications are best-effort.
    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.notify(text).await {
            warn!(error = %e, "notification failed");
        }
    }
}
