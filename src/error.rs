//! Error type shared by the sweep engine and the instrument drivers.
//!
//! Every variant except `Io` and `Record` maps to one failure class of a run:
//! bad configuration is caught before a session opens, range and settling
//! failures point at the sweep ordinal that caused them, and instrument
//! timeouts are never retried.

use std::time::Duration;
use thiserror::Error;

use crate::config::Quantity;

pub type SweepResult<T> = std::result::Result<T, SweepError>;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("point {ordinal}: commanded {quantity} {value:e} outside range [{lo:e}, {hi:e}]")]
    Range {
        ordinal: usize,
        quantity: Quantity,
        value: f64,
        lo: f64,
        hi: f64,
    },

    #[error(
        "point {ordinal}: {quantity} did not settle, commanded {commanded:e}, achieved {achieved:e} (tolerance {tolerance:e})"
    )]
    Settling {
        ordinal: usize,
        quantity: Quantity,
        commanded: f64,
        achieved: f64,
        tolerance: f64,
    },

    #[error("{device} did not answer '{operation}' within {timeout:?}")]
    InstrumentTimeout {
        device: String,
        operation: String,
        timeout: Duration,
    },

    #[error("{device}: {message}")]
    Instrument { device: String, message: String },

    #[error("run cancelled after {completed} points")]
    Cancelled { completed: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to record run: {0}")]
    Record(String),
}

impl SweepError {
    pub fn config(message: impl Into<String>) -> Self {
        SweepError::Config(message.into())
    }

    pub fn instrument(device: impl Into<String>, message: impl Into<String>) -> Self {
        SweepError::Instrument {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Sweep ordinal the error refers to, if any.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            SweepError::Range { ordinal, .. } | SweepError::Settling { ordinal, .. } => {
                Some(*ordinal)
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SweepError::InstrumentTimeout { .. })
    }
}

impl From<anyhow::Error> for SweepError {
    fn from(value: anyhow::Error) -> Self {
        SweepError::Record(format!("{value:#}"))
    }
}
