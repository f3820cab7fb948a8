use chrono::{DateTime, DurationRound, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Spot price for one hour block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GridPrice {
    /// Currency units per kWh, e.g. 0.19.
    pub total: f64,
    /// UTC hour boundary.
    pub starts_at: DateTime<Utc>,
}

impl GridPrice {
    pub fn new(total: f64, starts_at: DateTime<Utc>) -> Self {
        Self { total, starts_at }
    }

    /// `max_price` is given in cents.
    pub fn exceeds(&self, max_price: i32) -> bool {
        self.total * 100.0 - f64::from(max_price) > 1e-6
    }

    pub fn is_hour_of(&self, now: DateTime<Utc>) -> bool {
        self.starts_at == hour_start(now)
    }
}

/// Requested ordering of upcoming prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceOrder {
    ByPrice,
    ByTime,
}

/// Truncates to the start of the UTC hour.
pub fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}
