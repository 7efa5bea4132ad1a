//! Typed import watermarks.
//!
//! The store keeps a single opaque string per project (`last_imported_id`). What that string
//! means is protocol-specific: a chain block height, the unix timestamp of a UTC day, or an
//! upstream pagination cursor. Each importer declares the kind it expects and parsing the stored
//! value against the wrong kind is a fatal configuration error, not a retryable one.

use std::fmt::Display;

use thiserror::Error;

use crate::units::UtcDay;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Watermark {
    BlockHeight(u64),
    UnixDay(UtcDay),
    Cursor(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatermarkKind {
    BlockHeight,
    UnixDay,
    Cursor,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseWatermarkError {
    #[error("expected a block height watermark, got '{0}'")]
    InvalidBlockHeight(String),
    #[error("expected a unix day watermark, got '{0}'")]
    InvalidUnixDay(String),
}

impl WatermarkKind {
    pub fn parse(&self, raw: &str) -> Result<Watermark, ParseWatermarkError> {
        match self {
            Self::BlockHeight => raw
                .parse::<u64>()
                .map(Watermark::BlockHeight)
                .map_err(|_| ParseWatermarkError::InvalidBlockHeight(raw.to_string())),
            Self::UnixDay => raw
                .parse::<i64>()
                .map(|timestamp| Watermark::UnixDay(UtcDay::from_timestamp(timestamp)))
                .map_err(|_| ParseWatermarkError::InvalidUnixDay(raw.to_string())),
            Self::Cursor => Ok(Watermark::Cursor(raw.to_string())),
        }
    }
}

impl Watermark {
    pub fn kind(&self) -> WatermarkKind {
        match self {
            Self::BlockHeight(_) => WatermarkKind::BlockHeight,
            Self::UnixDay(_) => WatermarkKind::UnixDay,
            Self::Cursor(_) => WatermarkKind::Cursor,
        }
    }

    /// The string persisted to `projects.last_imported_id`.
    pub fn to_db_value(&self) -> String {
        match self {
            Self::BlockHeight(height) => height.to_string(),
            Self::UnixDay(day) => day.0.to_string(),
            Self::Cursor(cursor) => cursor.clone(),
        }
    }

    /// Whether persisting self would move the watermark backwards relative to prior. Opaque
    /// cursors compare numerically when both sides are numeric and are otherwise assumed to only
    /// ever move forward.
    pub fn regresses_from(&self, prior: &Self) -> bool {
        match (self, prior) {
            (Self::BlockHeight(new), Self::BlockHeight(old)) => new < old,
            (Self::UnixDay(new), Self::UnixDay(old)) => new < old,
            (Self::Cursor(new), Self::Cursor(old)) => {
                match (new.parse::<u128>(), old.parse::<u128>()) {
                    (Ok(new), Ok(old)) => new < old,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockHeight(height) => write!(f, "block {height}"),
            Self::UnixDay(day) => write!(f, "day {day}"),
            Self::Cursor(cursor) => write!(f, "cursor {cursor}"),
        }
    }
}
