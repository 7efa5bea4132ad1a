use std::{fmt::Display, ops::Add, str::FromStr};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A UTC calendar day, stored as the unix timestamp of its midnight in seconds. Every revenue
/// bucket is keyed by one of these; anything finer-grained gets floored onto one.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UtcDay(pub i64);

impl UtcDay {
    pub const SECONDS_PER_DAY: i64 = 86_400;

    /// Floors any unix timestamp in seconds to the midnight of its UTC day.
    pub fn from_timestamp(timestamp: i64) -> Self {
        Self(timestamp.div_euclid(Self::SECONDS_PER_DAY) * Self::SECONDS_PER_DAY)
    }

    pub fn from_date_time(date_time: &DateTime<Utc>) -> Self {
        Self::from_timestamp(date_time.timestamp())
    }

    pub fn today() -> Self {
        Self::from_date_time(&Utc::now())
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .expect("expect UtcDay timestamps to be valid unix timestamps")
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Self::SECONDS_PER_DAY)
    }

    pub fn plus_days(&self, days: i64) -> Self {
        Self(self.0 + days * Self::SECONDS_PER_DAY)
    }

    /// Number of days from self to other, inclusive of both. Zero when other is before self.
    pub fn days_until_inclusive(&self, other: &Self) -> i64 {
        if other.0 < self.0 {
            0
        } else {
            (other.0 - self.0) / Self::SECONDS_PER_DAY + 1
        }
    }
}

impl Display for UtcDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.date_time().format("%Y-%m-%d"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to parse '{0}' as a YYYY-MM-DD day")]
pub struct ParseUtcDayError(String);

impl FromStr for UtcDay {
    type Err = ParseUtcDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let date =
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ParseUtcDayError(s.to_string()))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .expect("expect midnight to exist for valid dates")
            .and_utc();
        Ok(Self(midnight.timestamp()))
    }
}

/// An amount of USD.
/// We use the imprecise f64 here because revenue is computed from f64 native amounts multiplied
/// by f64 spot prices, which is also imprecise.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UsdNewtype(pub f64);

impl UsdNewtype {
    pub const ZERO: Self = Self(0.0);

    pub fn from_native(amount: f64, usd_price: f64) -> Self {
        Self(amount * usd_price)
    }
}

impl Add for UsdNewtype {
    type Output = Self;

    fn add(self, UsdNewtype(rhs): Self) -> Self::Output {
        let UsdNewtype(lhs) = self;
        UsdNewtype(lhs + rhs)
    }
}

impl Display for UsdNewtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let UsdNewtype(amount) = self;
        write!(f, "{amount}")
    }
}

impl From<f64> for UsdNewtype {
    fn from(amount: f64) -> Self {
        UsdNewtype(amount)
    }
}
