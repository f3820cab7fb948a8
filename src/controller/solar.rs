//! Solar surplus estimation.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::ChargeController;
use crate::domain::{ChargeState, ChargingEventKind, SurplusRecord, Vehicle, VehicleState};

/// Samples older than this are ignored.
pub const SURPLUS_WINDOW_MINUTES: i64 = 5;
pub const SURPLUS_SAMPLES: usize = 2;
/// Minimum distance between a current change and the surplus sample that justifies the next one.
pub const AMPS_ADJUST_INTERVAL_MINUTES: i64 = 5;

/// Surplus available to the vehicle, from the newest samples first.
///
/// `None` when no sample falls inside the window. While charging on solar the
/// vehicle's own draw is added back and the best sample counts. Otherwise the
/// first sample below `min_surplus` decides, so a single dip vetoes a start.
pub fn estimate_surplus(
    samples: &[SurplusRecord],
    now: DateTime<Utc>,
    vehicle: &Vehicle,
    state: &VehicleState,
) -> Option<i32> {
    let window_start = now - Duration::minutes(SURPLUS_WINDOW_MINUTES);
    let mut recent = samples
        .iter()
        .filter(|s| s.timestamp > window_start)
        .peekable();
    recent.peek()?;

    if state.charging == ChargeState::ChargingOnSolar {
        let own_draw = vehicle.watts_at(state.amps);
        return Some(recent.fold(0, |best, s| best.max(s.watts.saturating_add(own_draw))));
    }

    let mut best = 0;
    for sample in recent {
        if sample.watts < vehicle.min_surplus {
            return Some(sample.watts);
        }
        best = best.max(sample.watts);
    }
    Some(best)
}

/// Current that `surplus` watts can sustain, or `None` if it is too low.
pub fn surplus_to_amps(surplus: i32, vehicle: &Vehicle) -> Option<i32> {
    if surplus <= 0 || surplus < vehicle.min_surplus {
        return None;
    }
    let amps = surplus / 230 / vehicle.num_phases.max(1);
    if amps == 0 {
        return None;
    }
    Some(amps.min(vehicle.max_amps))
}

impl ChargeController {
    pub async fn actual_surplus(&self, vehicle: &Vehicle, state: &VehicleState) -> Result<Option<i32>> {
        let samples = self.store.latest_surpluses(SURPLUS_SAMPLES).await?;
        Ok(estimate_surplus(&samples, self.now(), vehicle, state))
    }

    /// Amps to charge with on solar, if the surplus allows it.
    pub async fn check_start_on_solar(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
    ) -> Result<Option<i32>> {
        if !vehicle.surplus_charging {
            return Ok(None);
        }
        let Some(surplus) = self.actual_surplus(vehicle, state).await? else {
            debug!(vin = %vehicle.vin, "no recent surplus");
            return Ok(None);
        };
        let amps = surplus_to_amps(surplus, vehicle);
        debug!(vin = %vehicle.vin, surplus, ?amps, "solar check");
        Ok(amps)
    }

    /// Whether a surplus sample arrived at least five minutes after the last
    /// current change or charge start.
    pub async fn can_adjust_solar_amps(&self, vehicle: &Vehicle) -> Result<bool> {
        let Some(latest) = self.store.latest_surpluses(1).await?.into_iter().next() else {
            return Ok(false);
        };
        let amps_set = self
            .store
            .latest_event(&vehicle.vin, ChargingEventKind::SetChargingAmps)
            .await?
            .map(|e| e.timestamp);
        let started = self
            .store
            .latest_event(&vehicle.vin, ChargingEventKind::ChargeStart)
            .await?
            .map(|e| e.timestamp);
        let Some(last_change) = amps_set.max(started) else {
            return Ok(false);
        };
        Ok(latest.timestamp - last_change >= Duration::minutes(AMPS_ADJUST_INTERVAL_MINUTES))
    }
}
