//! Signal envelope
//!
//! Every stage of the pipeline exchanges [`Signal`]s: a timestamped value
//! tagged with a health status and, for anything but `Ok`, the error that
//! degraded it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::{Error, Result};

/// Default capacity of the channels connecting pipeline stages
pub const SIGNAL_BUFFER: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Health of the data carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Data is fresh and trusted
    Ok,
    /// Data is present but degraded (stale, one of several sources failed)
    PartialFailure,
    /// No usable data; any value carried is a fallback
    TotalFailure,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::PartialFailure => write!(f, "partial_failure"),
            Status::TotalFailure => write!(f, "total_failure"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable timestamped value-or-error envelope
///
/// Construction enforces the envelope invariants: a missing value is only
/// allowed for [`Status::TotalFailure`], and any non-`Ok` status carries an
/// error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal<T> {
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<T>,
    status: Status,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    error: Option<Error>,
}

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl<T> Signal<T> {
    /// Create a healthy signal
    pub fn new(timestamp: DateTime<Utc>, value: T) -> Self {
        Self {
            timestamp,
            value: Some(value),
            status: Status::Ok,
            error: None,
        }
    }

    /// Create a degraded signal that still carries usable data
    pub fn partial(timestamp: DateTime<Utc>, value: T, error: Error) -> Self {
        Self {
            timestamp,
            value: Some(value),
            status: Status::PartialFailure,
            error: Some(error),
        }
    }

    /// Create a failed signal, optionally carrying a fallback value
    pub fn failure(timestamp: DateTime<Utc>, value: Option<T>, error: Error) -> Self {
        Self {
            timestamp,
            value,
            status: Status::TotalFailure,
            error: Some(error),
        }
    }

    /// Create a signal from raw parts, validating the envelope invariants
    pub fn try_new(
        timestamp: DateTime<Utc>,
        value: Option<T>,
        status: Status,
        error: Option<Error>,
    ) -> Result<Self> {
        if value.is_none() && status != Status::TotalFailure {
            return Err(Error::invalid(format!(
                "value can't be absent for status {status}"
            )));
        }

        if status != Status::Ok && error.is_none() {
            return Err(Error::invalid(format!(
                "status {status} requires an error"
            )));
        }

        Ok(Self {
            timestamp,
            value,
            status,
            error,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// True only when the data is fully trusted
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// True only for total failures; partial failures still carry data
    pub fn is_error(&self) -> bool {
        self.status == Status::TotalFailure
    }

    /// Transform the value, keeping timestamp, status and error
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        Signal {
            timestamp: self.timestamp,
            value: self.value.map(f),
            status: self.status,
            error: self.error,
        }
    }

    /// Replace the value, keeping timestamp, status and error
    pub fn with_value<U>(&self, value: U) -> Signal<U> {
        Signal {
            timestamp: self.timestamp,
            value: Some(value),
            status: self.status,
            error: self.error.clone(),
        }
    }

    /// Re-stamp the signal, e.g. when replaying it
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
