use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use thiserror::Error;
use tokio::sync::RwLock;

/// Vehicle command errors.
///
/// The remote side reports "already in the desired state" conditions as
/// errors; [`CommandError::from_api_message`] keeps them apart from real
/// failures so callers can normalize them with [`CommandResultExt`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("vehicle is already charging")]
    AlreadyCharging,
    #[error("vehicle is not charging")]
    NotCharging,
    #[error("value is already set")]
    AlreadySet,
    #[error("vehicle unavailable: {0}")]
    Unavailable(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl CommandError {
    /// Classifies an error string returned by the command endpoint.
    pub fn from_api_message(msg: &str) -> Self {
        if msg.contains("already_started") || msg.contains("is_charging") {
            CommandError::AlreadyCharging
        } else if msg.contains("not_charging") {
            CommandError::NotCharging
        } else if msg.contains("already_set") {
            CommandError::AlreadySet
        } else if msg.contains("vehicle unavailable") || msg.contains("asleep") {
            CommandError::Unavailable(msg.to_string())
        } else {
            CommandError::Api(msg.to_string())
        }
    }

    /// Whether this error means `command` already holds on the vehicle.
    pub fn satisfies(&self, command: Command) -> bool {
        matches!(
            (command, self),
            (Command::ChargeStart, CommandError::AlreadyCharging)
                | (Command::ChargeStop, CommandError::NotCharging)
                | (Command::SetChargeLimit, CommandError::AlreadySet)
                | (Command::SetChargeAmps, CommandError::AlreadySet)
        )
    }
}

pub type CommandResult<T = ()> = std::result::Result<T, CommandError>;

pub trait CommandResultExt {
    /// Turns "already in the desired state" errors into success.
    fn normalized(self, command: Command) -> CommandResult;
}

impl CommandResultExt for CommandResult {
    fn normalized(self, command: Command) -> CommandResult {
        match self {
            Err(e) if e.satisfies(command) => Ok(()),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    Wakeup,
    ChargeStart,
    ChargeStop,
    SetChargeLimit,
    SetChargeAmps,
    VehicleData,
}

/// Charge-related snapshot as reported by the vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VehicleData {
    #[serde(rename = "battery_level")]
    pub soc: i32,
    #[serde(rename = "charge_amps")]
    pub amps: i32,
    #[serde(rename = "charge_limit_soc")]
    pub charge_limit: i32,
    #[serde(default)]
    pub charging_state: String,
}

impl VehicleData {
    pub fn is_charging(&self) -> bool {
        self.charging_state.eq_ignore_ascii_case("charging")
    }
}

/// Remote vehicle command API.
#[async_trait]
pub trait VehicleCommandApi: Send + Sync {
    async fn wakeup(&self, vin: &str) -> CommandResult;
    async fn charge_start(&self, vin: &str) -> CommandResult;
    async fn charge_stop(&self, vin: &str) -> CommandResult;
    async fn set_charge_limit(&self, vin: &str, percent: i32) -> CommandResult;
    async fn set_charge_amps(&self, vin: &str, amps: i32) -> CommandResult;
    async fn vehicle_data(&self, vin: &str) -> CommandResult<VehicleData>;
}

#[derive(Debug, Clone, Default)]
struct SimVehicle {
    awake: bool,
    charging: bool,
    soc: i32,
    amps: i32,
    charge_limit: i32,
}

#[derive(Debug, Default)]
struct SimState {
    vehicles: HashMap<String, SimVehicle>,
    failures: HashMap<Command, CommandError>,
    queued_failures: VecDeque<(Command, CommandError)>,
    calls: VecDeque<(Command, String)>,
}

/// Older commands are dropped from the call log beyond this many.
pub const MAX_RECORDED_CALLS: usize = 1000;

/// In-memory vehicles for demo mode and tests.
///
/// Mirrors the remote "already in state" responses and supports fault
/// injection and artificial latency.
#[derive(Debug, Clone, Default)]
pub struct SimulatedVehicleApi {
    state: Arc<RwLock<SimState>>,
    latency: Option<Duration>,
}

impl SimulatedVehicleApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn add_vehicle(&self, vin: &str, soc: i32) {
        let mut st = self.state.write().await;
        st.vehicles.insert(
            vin.to_string(),
            SimVehicle {
                soc,
                charge_limit: 80,
                ..Default::default()
            },
        );
    }

    pub async fn set_soc(&self, vin: &str, soc: i32) {
        if let Some(v) = self.state.write().await.vehicles.get_mut(vin) {
            v.soc = soc;
        }
    }

    /// Makes every call of `command` fail until cleared.
    pub async fn fail_always(&self, command: Command, err: CommandError) {
        self.state.write().await.failures.insert(command, err);
    }

    pub async fn clear_failures(&self) {
        let mut st = self.state.write().await;
        st.failures.clear();
        st.queued_failures.clear();
    }

    /// Makes the next call of `command` fail once.
    pub async fn fail_next(&self, command: Command, err: CommandError) {
        self.state.write().await.queued_failures.push_back((command, err));
    }

    pub async fn is_charging(&self, vin: &str) -> bool {
        self.state
            .read()
            .await
            .vehicles
            .get(vin)
            .map(|v| v.charging)
            .unwrap_or(false)
    }

    pub async fn amps(&self, vin: &str) -> Option<i32> {
        self.state.read().await.vehicles.get(vin).map(|v| v.amps)
    }

    /// Most recent commands received, oldest first.
    pub async fn calls(&self) -> Vec<(Command, String)> {
        self.state.read().await.calls.iter().cloned().collect()
    }

    pub async fn count(&self, command: Command) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|(c, _)| *c == command)
            .count()
    }

    async fn apply<T>(
        &self,
        command: Command,
        vin: &str,
        f: impl FnOnce(&mut SimVehicle) -> CommandResult<T>,
    ) -> CommandResult<T> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut st = self.state.write().await;
        if st.calls.len() == MAX_RECORDED_CALLS {
            st.calls.pop_front();
        }
        st.calls.push_back((command, vin.to_string()));

        if let Some(pos) = st.queued_failures.iter().position(|(c, _)| *c == command) {
            if let Some((_, err)) = st.queued_failures.remove(pos) {
                return Err(err);
            }
        }
        if let Some(err) = st.failures.get(&command) {
            return Err(err.clone());
        }

        let vehicle = st
            .vehicles
            .get_mut(vin)
            .ok_or_else(|| CommandError::Api(format!("unknown vehicle {vin}")))?;
        if !vehicle.awake && !matches!(command, Command::Wakeup | Command::VehicleData) {
            return Err(CommandError::Unavailable("vehicle is asleep".into()));
        }
        f(vehicle)
    }
}

#[async_trait]
impl VehicleCommandApi for SimulatedVehicleApi {
    async fn wakeup(&self, vin: &str) -> CommandResult {
        self.apply(Command::Wakeup, vin, |v| {
            v.awake = true;
            Ok(())
        })
        .await
    }

    async fn charge_start(&self, vin: &str) -> CommandResult {
        self.apply(Command::ChargeStart, vin, |v| {
            if v.charging {
                return Err(CommandError::from_api_message("is_charging"));
            }
            v.charging = true;
            Ok(())
        })
        .await
    }

    async fn charge_stop(&self, vin: &str) -> CommandResult {
        self.apply(Command::ChargeStop, vin, |v| {
            if !v.charging {
                return Err(CommandError::from_api_message("not_charging"));
            }
            v.charging = false;
            Ok(())
        })
        .await
    }

    async fn set_charge_limit(&self, vin: &str, percent: i32) -> CommandResult {
        self.apply(Command::SetChargeLimit, vin, |v| {
            if v.charge_limit == percent {
                return Err(CommandError::from_api_message("already_set"));
            }
            v.charge_limit = percent;
            Ok(())
        })
        .await
    }

    async fn set_charge_amps(&self, vin: &str, amps: i32) -> CommandResult {
        self.apply(Command::SetChargeAmps, vin, |v| {
            if v.amps == amps {
                return Err(CommandError::from_api_message("already_set"));
            }
            v.amps = amps;
            Ok(())
        })
        .await
    }

    async fn vehicle_data(&self, vin: &str) -> CommandResult<VehicleData> {
        self.apply(Command::VehicleData, vin, |v| {
            Ok(VehicleData {
                soc: v.soc,
                amps: v.amps,
                charge_limit: v.charge_limit,
                charging_state: if v.charging { "Charging" } else { "Stopped" }.to_string(),
            })
        })
        .await
    }
}
