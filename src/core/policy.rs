//! Error-action policy
//!
//! Maps a failed source read or target write to what the job does next.
//! Read errors consult the source-side setting, write errors the
//! target-side one.

use crate::config::OnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// What the job does about a failed cluster copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Fail the job with the triggering error
    Abort,
    /// Mark the cluster copied without valid data and move on
    SkipAndContinue,
    /// Suspend the job until it is resumed or cancelled
    PauseForIntervention,
}

/// Which device an I/O error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoSide {
    /// Source read
    Source,
    /// Target write
    Target,
}

impl IoSide {
    /// Side of a read (`true`) or write (`false`) error
    pub fn from_read(is_read: bool) -> Self {
        if is_read {
            Self::Source
        } else {
            Self::Target
        }
    }
}

impl fmt::Display for IoSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Per-side error handling configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Applied to source read errors
    pub on_source_error: OnError,
    /// Applied to target write errors
    pub on_target_error: OnError,
}

impl ErrorPolicy {
    /// Build a policy from both settings
    pub fn new(on_source_error: OnError, on_target_error: OnError) -> Self {
        Self {
            on_source_error,
            on_target_error,
        }
    }

    /// Setting that governs `side`
    pub fn for_side(&self, side: IoSide) -> OnError {
        match side {
            IoSide::Source => self.on_source_error,
            IoSide::Target => self.on_target_error,
        }
    }

    /// Decide the action for an error on the read or write path
    pub fn decide(&self, is_read: bool, error: &io::Error) -> ErrorAction {
        match self.for_side(IoSide::from_read(is_read)) {
            OnError::Report => ErrorAction::Abort,
            OnError::Ignore => ErrorAction::SkipAndContinue,
            OnError::Stop => ErrorAction::PauseForIntervention,
            OnError::Enospc if error.kind() == io::ErrorKind::StorageFull => {
                ErrorAction::PauseForIntervention
            }
            OnError::Enospc => ErrorAction::Abort,
        }
    }

    /// Whether the device on `side` must support I/O status tracking
    pub fn requires_io_status(&self, side: IoSide) -> bool {
        self.for_side(side).requires_io_status()
    }
}
