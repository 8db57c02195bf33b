use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::acquisition::workflow::AcquisitionWorkflow;

/// The mass spectrometer families an algorithm can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentModel {
    Tribrid,
    Exploris,
    Mock,
}

impl InstrumentModel {
    pub const ALL: [Self; 3] = [Self::Tribrid, Self::Exploris, Self::Mock];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tribrid => "Tribrid",
            Self::Exploris => "Exploris",
            Self::Mock => "Mock",
        }
    }

    /// The mock server can only replay a raw file, so it only supports listening.
    #[must_use]
    pub const fn supports(self, workflow: &AcquisitionWorkflow) -> bool {
        match self {
            Self::Tribrid | Self::Exploris => true,
            Self::Mock => matches!(workflow, AcquisitionWorkflow::Listening),
        }
    }
}

impl Display for InstrumentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for InstrumentModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown instrument \"{s}\""))
    }
}
