use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionStatus {
    #[default]
    Idle,
    PreAcquisition,
    Running,
    EndedNormal,
    EndedError,
    PostAcquisition,
}

/// Events that move an acquisition through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusInput {
    /// The worker started the acquisition.
    ProcessStarted,
    /// Pre-acquisition finished and the ready signal is about to be sent.
    PreAcquisitionDone,
    /// `ACQUISITION_ENDED` arrived.
    AcquisitionEnded,
    /// `ERROR` arrived or the acquisition failed locally.
    ErrorReceived,
    /// Post-acquisition is about to run.
    PostAcquisitionStarted,
}

impl AcquisitionStatus {
    pub const fn new() -> Self {
        Self::Idle
    }

    /// `true` once the acquisition has ended, either way.
    #[must_use]
    pub const fn is_ended(self) -> bool {
        matches!(self, Self::EndedNormal | Self::EndedError)
    }
}

impl Display for AcquisitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Idle => "idle",
                Self::PreAcquisition => "pre-acquisition",
                Self::Running => "running",
                Self::EndedNormal => "ended normally",
                Self::EndedError => "ended with error",
                Self::PostAcquisition => "post-acquisition",
            }
        )
    }
}

impl Display for StatusInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ProcessStarted => "process started",
                Self::PreAcquisitionDone => "pre-acquisition done",
                Self::AcquisitionEnded => "acquisition ended",
                Self::ErrorReceived => "error received",
                Self::PostAcquisitionStarted => "post-acquisition started",
            }
        )
    }
}

impl AcquisitionStatus {
    /// # Errors
    /// Returns [`AcquisitionError::StatusTransition`] for every pair that is not
    /// part of the lifecycle.
    pub const fn next_state(self, input: StatusInput) -> Result<Self, AcquisitionError> {
        type SI = StatusInput;
        match (self, input) {
            (Self::Idle, SI::ProcessStarted) => Ok(Self::PreAcquisition),
            (Self::PreAcquisition, SI::PreAcquisitionDone) => Ok(Self::Running),
            (Self::Running, SI::AcquisitionEnded) => Ok(Self::EndedNormal),
            (Self::Running, SI::ErrorReceived) => Ok(Self::EndedError),
            (Self::EndedNormal | Self::EndedError, SI::PostAcquisitionStarted) => {
                Ok(Self::PostAcquisition)
            }

            // Listed explicitly to make sure we don't miss anything
            (
                Self::Idle,
                SI::PreAcquisitionDone
                | SI::AcquisitionEnded
                | SI::ErrorReceived
                | SI::PostAcquisitionStarted,
            )
            | (
                Self::PreAcquisition,
                SI::ProcessStarted
                | SI::AcquisitionEnded
                | SI::ErrorReceived
                | SI::PostAcquisitionStarted,
            )
            | (
                Self::Running,
                SI::ProcessStarted | SI::PreAcquisitionDone | SI::PostAcquisitionStarted,
            )
            | (
                Self::EndedNormal | Self::EndedError,
                SI::ProcessStarted
                | SI::PreAcquisitionDone
                | SI::AcquisitionEnded
                | SI::ErrorReceived,
            )
            | (Self::PostAcquisition, _) => Err(AcquisitionError::StatusTransition {
                state: self,
                input,
            }),
        }
    }
}
