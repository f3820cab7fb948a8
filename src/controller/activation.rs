//! Remote command sequences: start with circuit breaker, stop, current adjustment.

use anyhow::Result;
use chrono::Duration;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use super::ChargeController;
use crate::domain::{
    ChargeState, ChargingEventKind, Command, CommandResultExt, Vehicle, VehicleState,
};
use crate::repo::SettingKey;

impl ChargeController {
    /// Starts charging when below target and solar or grid authorizes it.
    pub(super) async fn check_start_charging(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
    ) -> Result<()> {
        // one point of hysteresis below the target
        if state.soc >= vehicle.target_soc - 1 {
            return Ok(());
        }

        let (target_state, amps) = self.check_target_state(vehicle, state).await?;
        if target_state.is_charging() {
            self.activate_charging(vehicle, state, amps, target_state)
                .await?;
        }
        Ok(())
    }

    /// Drives wake, charge limit, current and charge start.
    ///
    /// Returns whether charging was started. Failed starts back off by
    /// `failures * failure_backoff_minutes` since the last attempt; once
    /// `max_charge_start_failures` is reached the permanent error flag is set.
    pub async fn activate_charging(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
        amps: i32,
        source: ChargeState,
    ) -> Result<bool> {
        let vin = vehicle.vin.as_str();
        let failures = self.charge_start_failures.load(Ordering::SeqCst);
        if failures > 0 {
            let wait = Duration::minutes(i64::from(failures) * self.settings.failure_backoff_minutes);
            if let Some(last) = self
                .store
                .latest_event(vin, ChargingEventKind::ChargeStart)
                .await?
            {
                if last.timestamp > self.now() - wait {
                    debug!(vin, failures, "charge start backing off");
                    return Ok(false);
                }
            }
            info!(vin, attempt = failures + 1, "retrying charge start after previous failures");
        }

        if let Err(e) = self.api.wakeup(vin).await {
            warn!(vin, error = %e, "wake failed");
            self.log_event(vin, ChargingEventKind::WakeVehicle, &format!("could not wake vehicle: {e}"))
                .await?;
            return Ok(false);
        }
        self.log_event(vin, ChargingEventKind::WakeVehicle, "").await?;
        self.pacer.pace().await;

        if state.charge_limit != vehicle.target_soc {
            let res = self
                .api
                .set_charge_limit(vin, vehicle.target_soc)
                .await
                .normalized(Command::SetChargeLimit);
            if let Err(e) = res {
                warn!(vin, error = %e, "set charge limit failed");
                self.log_event(vin, ChargingEventKind::SetTargetSoC, &format!("could not set target SoC: {e}"))
                    .await?;
                return Ok(false);
            }
            self.store
                .set_state_charge_limit(vin, vehicle.target_soc)
                .await?;
            self.log_event(
                vin,
                ChargingEventKind::SetTargetSoC,
                &format!("target SoC set to {}", vehicle.target_soc),
            )
            .await?;
            self.pacer.pace().await;
        }

        if state.amps != amps {
            let res = self
                .api
                .set_charge_amps(vin, amps)
                .await
                .normalized(Command::SetChargeAmps);
            if let Err(e) = res {
                warn!(vin, error = %e, "set charge amps failed");
                self.log_event(vin, ChargingEventKind::SetChargingAmps, &format!("could not set charge amps: {e}"))
                    .await?;
                return Ok(false);
            }
            self.log_event(
                vin,
                ChargingEventKind::SetChargingAmps,
                &format!("charge amps set to {amps}"),
            )
            .await?;
            self.pacer.pace().await;
        }

        let res = self
            .api
            .charge_start(vin)
            .await
            .normalized(Command::ChargeStart);
        if let Err(e) = res {
            let failures = self.charge_start_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(vin, failures, error = %e, "charge start failed");
            self.log_event(vin, ChargingEventKind::ChargeStart, &format!("could not start charging: {e}"))
                .await?;
            if failures >= self.settings.max_charge_start_failures {
                self.trip_permanent_error(failures).await?;
            }
            return Ok(false);
        }

        self.charge_start_failures.store(0, Ordering::SeqCst);
        self.log_event(vin, ChargingEventKind::ChargeStart, "").await?;
        self.store.set_state_amps(vin, amps).await?;
        self.store.set_state_charging(vin, source).await?;
        info!(vin, amps, ?source, soc = state.soc, "charging started");

        self.notify(&format!(
            "{} started charging on {} with {} amps at {} % SoC.",
            vehicle.display_name,
            source.source_label(),
            amps,
            state.soc
        ))
        .await;
        Ok(true)
    }

    async fn trip_permanent_error(&self, failures: u32) -> Result<()> {
        error!(failures, "charge start keeps failing, setting permanent error");
        self.store
            .set_setting(SettingKey::PermanentError, "1")
            .await?;
        self.charge_start_failures.store(0, Ordering::SeqCst);
        self.notify(&format!(
            "ACTION REQUIRED: Activate charging failed for {failures} times, giving up and setting permanent error. Resolve the issue and release the permanent error."
        ))
        .await;
        Ok(())
    }

    /// Stops charging. Nothing is persisted unless the vehicle confirmed.
    pub async fn stop_charging(&self, vehicle: &Vehicle, state: &VehicleState) -> Result<()> {
        let vin = vehicle.vin.as_str();
        if let Err(e) = self.api.wakeup(vin).await {
            warn!(vin, error = %e, "wake before stop failed");
            self.log_event(vin, ChargingEventKind::ChargeStop, &format!("could not wake vehicle: {e}"))
                .await?;
            return Ok(());
        }
        self.pacer.pace().await;

        let res = self
            .api
            .charge_stop(vin)
            .await
            .normalized(Command::ChargeStop);
        if let Err(e) = res {
            warn!(vin, error = %e, "charge stop failed");
            self.log_event(vin, ChargingEventKind::ChargeStop, &format!("could not stop charging: {e}"))
                .await?;
            return Ok(());
        }

        self.store
            .set_state_charging(vin, ChargeState::NotCharging)
            .await?;
        self.log_event(vin, ChargingEventKind::ChargeStop, "charging stopped")
            .await?;
        info!(vin, soc = state.soc, "charging stopped");

        self.notify(&format!(
            "{} stopped charging at {} % SoC.",
            vehicle.display_name, state.soc
        ))
        .await;
        Ok(())
    }

    /// Resizes a running solar charge, at most once per fresh surplus sample.
    pub(super) async fn adjust_solar_amps(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
        target_amps: i32,
    ) -> Result<()> {
        if state.charging != ChargeState::ChargingOnSolar
            || target_amps <= 0
            || target_amps == state.amps
        {
            return Ok(());
        }
        if !self.can_adjust_solar_amps(vehicle).await? {
            debug!(vin = %vehicle.vin, target_amps, "amps adjustment waits for fresh surplus data");
            return Ok(());
        }

        let vin = vehicle.vin.as_str();
        if let Err(e) = self.api.wakeup(vin).await {
            self.log_event(vin, ChargingEventKind::SetChargingAmps, &format!("could not wake vehicle: {e}"))
                .await?;
            return Ok(());
        }
        self.pacer.pace().await;

        let res = self
            .api
            .set_charge_amps(vin, target_amps)
            .await
            .normalized(Command::SetChargeAmps);
        if let Err(e) = res {
            warn!(vin, error = %e, "charge amps adjustment failed");
            self.log_event(vin, ChargingEventKind::SetChargingAmps, &format!("could not set charge amps: {e}"))
                .await?;
            return Ok(());
        }

        self.store.set_state_amps(vin, target_amps).await?;
        self.log_event(
            vin,
            ChargingEventKind::SetChargingAmps,
            &format!("charge amps set to {target_amps}"),
        )
        .await?;
        info!(vin, from = state.amps, to = target_amps, "charge amps adjusted");

        self.notify(&format!(
            "Adjusted {}'s current to {} amps.",
            vehicle.display_name, target_amps
        ))
        .await;
        Ok(())
    }
}
