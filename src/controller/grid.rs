//! Grid price strategies.
//!
//! All strategies honour the selected-hour-block memo first: an hour once
//! chosen for charging stays chosen even when later price data would pick
//! differently.
//!
//! Without a departure the cheapest hours are picked. The departure
//! strategies take the earliest hours before departure instead, so the
//! deadline is met; only the capped pass of `DepartureWithPriceLimit`
//! ranks by price.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::departure::next_departure;
use super::ChargeController;
use crate::domain::{hour_start, GridPrice, GridStrategy, PriceOrder, Vehicle, VehicleState};

/// Battery size assumed for duration estimates.
pub const ASSUMED_CAPACITY_KWH: f64 = 100.0;

/// Minutes needed to charge from the current SoC to the target at full current. Never negative.
pub fn estimated_charge_duration_minutes(vehicle: &Vehicle, state: &VehicleState) -> i64 {
    let watts = f64::from(vehicle.max_amps * vehicle.num_phases * 230);
    if watts <= 0.0 {
        return 0;
    }
    let percent = f64::from(vehicle.target_soc - state.soc);
    let hours = percent / 100.0 * ASSUMED_CAPACITY_KWH / (watts / 1000.0);
    ((hours * 60.0).round() as i64).max(0)
}

pub fn required_hour_blocks(minutes: i64) -> usize {
    usize::try_from((minutes + 59) / 60).unwrap_or(0)
}

/// Prices starting strictly before `limit`, order preserved.
pub fn prices_before(prices: &[GridPrice], limit: DateTime<Utc>) -> Vec<GridPrice> {
    prices
        .iter()
        .filter(|p| p.starts_at < limit)
        .copied()
        .collect()
}

/// Whether the known prices reach the departure hour.
pub fn covers_departure(prices: &[GridPrice], departure: DateTime<Utc>) -> bool {
    prices
        .iter()
        .any(|p| p.starts_at >= departure || departure - p.starts_at <= Duration::minutes(60))
}

fn current_price(prices: &[GridPrice], now: DateTime<Utc>) -> Option<GridPrice> {
    prices.iter().find(|p| p.is_hour_of(now)).copied()
}

/// Whether the current hour is among the first `n` entries.
fn within_first(prices: &[GridPrice], n: usize, now: DateTime<Utc>) -> bool {
    prices.iter().take(n).any(|p| p.is_hour_of(now))
}

enum Verdict {
    Reject,
    /// Authorize without memoizing the hour.
    Authorize,
    /// Authorize and memoize the hour.
    Select,
}

impl ChargeController {
    /// Full current if the configured grid strategy picks the current hour.
    pub async fn check_start_on_grid(
        &self,
        vehicle: &Vehicle,
        state: &VehicleState,
    ) -> Result<Option<i32>> {
        if !vehicle.lowcost_charging {
            return Ok(None);
        }
        let now = self.now();
        let prices = self
            .prices
            .upcoming_prices(vehicle, now, PriceOrder::ByPrice)
            .await?;
        if prices.is_empty() {
            debug!(vin = %vehicle.vin, "no upcoming grid prices");
            return Ok(None);
        }

        let hour = hour_start(now);
        if self.store.is_selected_hour_block(&vehicle.vin, hour).await? {
            return Ok(Some(vehicle.max_amps));
        }

        let minutes = estimated_charge_duration_minutes(vehicle, state);
        let blocks = required_hour_blocks(minutes);
        let verdict = match vehicle.grid_strategy {
            GridStrategy::NoDeparturePriceLimit => {
                capped_cheapest(&prices, vehicle.max_price, blocks, now)
            }
            GridStrategy::DepartureNoPriceLimit | GridStrategy::DepartureWithPriceLimit => {
                let departure = match next_departure(&vehicle.depart_days, &vehicle.depart_time, now) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(vin = %vehicle.vin, error = %e, "could not get next departure");
                        return Ok(None);
                    }
                };
                let mut by_time = prices.clone();
                by_time.sort_by_key(|p| p.starts_at);
                if vehicle.grid_strategy == GridStrategy::DepartureNoPriceLimit {
                    before_departure(&by_time, departure, minutes, blocks, now)
                } else {
                    before_departure_capped(
                        &prices,
                        &by_time,
                        departure,
                        vehicle.max_price,
                        minutes,
                        blocks,
                        now,
                    )
                }
            }
        };

        debug!(vin = %vehicle.vin, strategy = ?vehicle.grid_strategy, blocks, "grid check");
        match verdict {
            Verdict::Reject => Ok(None),
            Verdict::Authorize => Ok(Some(vehicle.max_amps)),
            Verdict::Select => {
                self.store
                    .record_selected_hour_block(&vehicle.vin, hour)
                    .await?;
                Ok(Some(vehicle.max_amps))
            }
        }
    }
}

/// Cheapest hours under the price cap. `prices` are sorted by price.
fn capped_cheapest(prices: &[GridPrice], max_price: i32, blocks: usize, now: DateTime<Utc>) -> Verdict {
    let Some(cheapest) = prices.first() else {
        return Verdict::Reject;
    };
    if cheapest.exceeds(max_price) {
        return Verdict::Reject;
    }
    let Some(current) = current_price(prices, now) else {
        return Verdict::Reject;
    };
    if current.exceeds(max_price) {
        return Verdict::Reject;
    }
    if current.total == cheapest.total {
        return Verdict::Authorize;
    }
    if within_first(prices, blocks, now) {
        return Verdict::Select;
    }
    Verdict::Reject
}

/// Whether to hold off because prices up to departure are still unknown and
/// there is plenty of time left.
fn wait_for_prices(
    upcoming: &[GridPrice],
    departure: DateTime<Utc>,
    minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    !covers_departure(upcoming, departure) && departure - now >= Duration::minutes(minutes * 2)
}

/// Earliest hours before departure regardless of price. `by_time` is sorted by start.
fn before_departure(
    by_time: &[GridPrice],
    departure: DateTime<Utc>,
    minutes: i64,
    blocks: usize,
    now: DateTime<Utc>,
) -> Verdict {
    let upcoming = prices_before(by_time, departure);
    if wait_for_prices(&upcoming, departure, minutes, now) {
        return Verdict::Reject;
    }
    if within_first(&upcoming, blocks, now) {
        return Verdict::Select;
    }
    Verdict::Reject
}

/// Cheapest capped hours before departure; the earliest hours once the
/// capped ones cannot cover the required blocks.
#[allow(clippy::too_many_arguments)]
fn before_departure_capped(
    by_price: &[GridPrice],
    by_time: &[GridPrice],
    departure: DateTime<Utc>,
    max_price: i32,
    minutes: i64,
    blocks: usize,
    now: DateTime<Utc>,
) -> Verdict {
    let upcoming = prices_before(by_price, departure);
    if upcoming.is_empty() {
        return Verdict::Reject;
    }
    match capped_cheapest(&upcoming, max_price, blocks, now) {
        Verdict::Reject => {}
        verdict => return verdict,
    }

    let capped = upcoming.iter().filter(|p| !p.exceeds(max_price)).count();
    if capped >= blocks {
        return Verdict::Reject;
    }
    before_departure(by_time, departure, minutes, blocks, now)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::repo::Store;
    use proptest::prelude::*;

    fn hours(totals: &[f64], from: DateTime<Utc>) -> Vec<GridPrice> {
        totals
            .iter()
            .enumerate()
            .map(|(i, t)| GridPrice::new(*t, from + Duration::hours(i as i64)))
            .collect()
    }

    fn soc(soc: i32) -> VehicleState {
        VehicleState {
            soc,
            ..VehicleState::new("VIN1")
        }
    }

    #[test]
    fn test_duration_estimate_examples() {
        let v = vehicle();
        assert_eq!(estimated_charge_duration_minutes(&v, &soc(50)), 109);
        assert_eq!(estimated_charge_duration_minutes(&v, &soc(80)), 0);
        assert_eq!(required_hour_blocks(109), 2);
        assert_eq!(required_hour_blocks(120), 2);
        assert_eq!(required_hour_blocks(0), 0);
    }

    proptest! {
        #[test]
        fn prop_duration_never_negative(
            target in 0i32..=100,
            current in 0i32..=100,
            amps in 0i32..=32,
            phases in 0i32..=3,
        ) {
            let mut v = vehicle();
            v.target_soc = target;
            v.max_amps = amps;
            v.num_phases = phases;
            let minutes = estimated_charge_duration_minutes(&v, &soc(current));
            prop_assert!(minutes >= 0);
            if current >= target {
                prop_assert_eq!(minutes, 0);
            }
        }
    }

    #[test]
    fn test_covers_departure() {
        let dep = t0() + Duration::hours(5);
        assert!(covers_departure(&hours(&[0.1], t0() + Duration::hours(4)), dep));
        assert!(!covers_departure(&hours(&[0.1, 0.2], t0()), dep));
    }

    #[tokio::test]
    async fn test_memoized_hour_authorizes_despite_prices() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        h.store.set_grid_prices(&v.vin, hours(&[0.90, 0.10], t0()));
        assert_eq!(h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(), None);

        h.store
            .record_selected_hour_block(&v.vin, t0())
            .await
            .unwrap();
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
    }

    #[tokio::test]
    async fn test_no_departure_price_limit_selects_needed_hour() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        // current hour is second cheapest and two blocks are needed
        h.store.set_grid_prices(&v.vin, hours(&[0.18, 0.15, 0.30], t0()));

        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
        assert!(h.store.is_selected_hour_block(&v.vin, t0()).await.unwrap());

        // monotonic: later price changes do not undo the selection
        h.store.set_grid_prices(&v.vin, hours(&[0.99, 0.15, 0.30], t0()));
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
    }

    #[tokio::test]
    async fn test_departure_waits_for_prices_until_departure() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        v.grid_strategy = GridStrategy::DepartureNoPriceLimit;
        v.depart_days = "2".into();
        v.depart_time = "07:00".into();
        // departure Tuesday 07:00, 21 hours away; prices known for 3 hours only
        h.store.set_grid_prices(&v.vin, hours(&[0.40, 0.50, 0.60], t0()));
        assert_eq!(h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(), None);

        // close to departure the known prices are used, cap ignored
        h.clock.set(t0() + Duration::hours(19));
        h.store.set_grid_prices(
            &v.vin,
            hours(&[0.90, 0.95], t0() + Duration::hours(19)),
        );
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
        assert!(h
            .store
            .is_selected_hour_block(&v.vin, t0() + Duration::hours(19))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_departure_takes_earliest_hours() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        v.grid_strategy = GridStrategy::DepartureNoPriceLimit;
        v.depart_days = "1".into();
        v.depart_time = "14:00".into();
        // 10:00..13:00 before departure; two blocks needed, price is not ranked
        h.store
            .set_grid_prices(&v.vin, hours(&[0.50, 0.20, 0.30, 0.10, 0.05], t0()));
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
        assert!(h.store.is_selected_hour_block(&v.vin, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_departure_abstains() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        v.grid_strategy = GridStrategy::DepartureWithPriceLimit;
        v.depart_days = "9".into();
        h.store.set_grid_prices(&v.vin, hours(&[0.05], t0()));
        assert_eq!(h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_departure_with_limit_prefers_capped_hours() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        v.grid_strategy = GridStrategy::DepartureWithPriceLimit;
        v.depart_days = "1".into();
        v.depart_time = "16:00".into();
        // enough capped hours (0.15, 0.18) exist, so the expensive current hour is skipped
        h.store
            .set_grid_prices(&v.vin, hours(&[0.35, 0.15, 0.18, 0.40, 0.45, 0.50], t0()));
        assert_eq!(h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(), None);

        h.clock.set(t0() + Duration::hours(2));
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
    }

    #[tokio::test]
    async fn test_departure_with_limit_falls_back_to_earliest_hours() {
        let h = harness();
        let mut v = vehicle();
        v.lowcost_charging = true;
        v.grid_strategy = GridStrategy::DepartureWithPriceLimit;
        v.depart_days = "1".into();
        v.depart_time = "14:00".into();
        // only one capped hour (12:00) for two needed blocks
        h.store
            .set_grid_prices(&v.vin, hours(&[0.35, 0.40, 0.15, 0.50], t0()));
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );

        // the expensive last hour before departure is still used
        h.clock.set(t0() + Duration::hours(3));
        assert_eq!(
            h.controller.check_start_on_grid(&v, &soc(50)).await.unwrap(),
            Some(16)
        );
    }
}
