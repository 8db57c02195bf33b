use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// File extension of instrument method files.
pub const METHOD_EXTENSION: &str = "meth";

/// A loosely typed workflow parameter as it comes from configuration or the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowParameter {
    None,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl WorkflowParameter {
    const fn kind(&self) -> &'static str {
        match self {
            Self::None => "nothing",
            Self::Integer(_) => "an integer",
            Self::Real(_) => "a real number",
            Self::Text(_) => "text",
        }
    }
}

impl From<serde_json::Value> for WorkflowParameter {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| n.as_f64().map_or(Self::None, Self::Real), Self::Integer),
            serde_json::Value::String(s) => Self::Text(s),
            _ => Self::None,
        }
    }
}

/// How an acquisition is triggered and bounded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum AcquisitionWorkflow {
    /// Observe scans without starting an acquisition.
    #[default]
    Listening,
    /// Run until explicitly stopped.
    Permanent,
    /// Stop after this many scans.
    LimitedByCount(i64),
    /// Stop after this many seconds.
    LimitedByDuration(f64),
    /// Run the given instrument method file.
    Method(PathBuf),
}

impl AcquisitionWorkflow {
    pub const LISTENING: &'static str = "listening";
    pub const PERMANENT: &'static str = "permanent";
    pub const LIMITED_BY_COUNT: &'static str = "limited by count";
    pub const LIMITED_BY_DURATION: &'static str = "limited by duration";
    pub const METHOD: &'static str = "method";

    /// # Errors
    /// [`AcquisitionError::InvalidWorkflowParameter`] unless `param` is an integer.
    pub fn limited_by_count(param: WorkflowParameter) -> Result<Self, AcquisitionError> {
        match param {
            WorkflowParameter::Integer(n) => Ok(Self::LimitedByCount(n)),
            other => Err(AcquisitionError::InvalidWorkflowParameter {
                workflow: Self::LIMITED_BY_COUNT,
                details: format!("expected an integer, got {}", other.kind()),
            }),
        }
    }

    /// # Errors
    /// [`AcquisitionError::InvalidWorkflowParameter`] unless `param` is an integer
    /// or a real number.
    #[allow(clippy::cast_precision_loss)]
    pub fn limited_by_duration(param: WorkflowParameter) -> Result<Self, AcquisitionError> {
        match param {
            WorkflowParameter::Integer(n) => Ok(Self::LimitedByDuration(n as f64)),
            WorkflowParameter::Real(x) => Ok(Self::LimitedByDuration(x)),
            other => Err(AcquisitionError::InvalidWorkflowParameter {
                workflow: Self::LIMITED_BY_DURATION,
                details: format!("expected a number, got {}", other.kind()),
            }),
        }
    }

    /// # Errors
    /// [`AcquisitionError::InvalidWorkflowParameter`] unless `param` is a path to a
    /// `.meth` file.
    pub fn method(param: WorkflowParameter) -> Result<Self, AcquisitionError> {
        match param {
            WorkflowParameter::Text(path) if is_method_file(Path::new(&path)) => {
                Ok(Self::Method(PathBuf::from(path)))
            }
            WorkflowParameter::Text(path) => Err(AcquisitionError::InvalidWorkflowParameter {
                workflow: Self::METHOD,
                details: format!("\"{path}\" is not a .{METHOD_EXTENSION} file"),
            }),
            other => Err(AcquisitionError::InvalidWorkflowParameter {
                workflow: Self::METHOD,
                details: format!("expected a file path, got {}", other.kind()),
            }),
        }
    }

    /// Build a workflow from its name.
    ///
    /// # Errors
    /// [`AcquisitionError::InvalidWorkflowParameter`] if the name is unknown or
    /// the parameter does not fit the workflow.
    pub fn from_name(name: &str, param: WorkflowParameter) -> Result<Self, AcquisitionError> {
        match name.trim().to_lowercase().as_str() {
            Self::LISTENING => Ok(Self::Listening),
            Self::PERMANENT => Ok(Self::Permanent),
            Self::LIMITED_BY_COUNT => Self::limited_by_count(param),
            Self::LIMITED_BY_DURATION => Self::limited_by_duration(param),
            Self::METHOD => Self::method(param),
            other => Err(AcquisitionError::InvalidWorkflowParameter {
                workflow: "unknown",
                details: format!("no workflow named \"{other}\""),
            }),
        }
    }

    /// Numeric id used as `AcquisitionType` in `CONFIG_ACQ_CMD`.
    #[must_use]
    pub const fn type_id(&self) -> u8 {
        match self {
            Self::Listening => 1,
            Self::Permanent => 2,
            Self::LimitedByCount(_) => 3,
            Self::LimitedByDuration(_) => 4,
            Self::Method(_) => 5,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Listening => Self::LISTENING,
            Self::Permanent => Self::PERMANENT,
            Self::LimitedByCount(_) => Self::LIMITED_BY_COUNT,
            Self::LimitedByDuration(_) => Self::LIMITED_BY_DURATION,
            Self::Method(_) => Self::METHOD,
        }
    }

    /// Whether the instrument must be told to start acquiring.
    #[must_use]
    pub const fn is_acquisition_triggering(&self) -> bool {
        !matches!(self, Self::Listening)
    }

    /// The parameter as sent in `AcquisitionParam`. `None` for workflows without
    /// one, which is the literal the server expects.
    #[must_use]
    pub fn parameter_string(&self) -> String {
        match self {
            Self::Listening | Self::Permanent => "None".to_string(),
            Self::LimitedByCount(n) => n.to_string(),
            Self::LimitedByDuration(x) => x.to_string(),
            Self::Method(path) => path.display().to_string(),
        }
    }
}

impl Display for AcquisitionWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening | Self::Permanent => write!(f, "{}", self.name()),
            _ => write!(f, "{} ({})", self.name(), self.parameter_string()),
        }
    }
}

fn is_method_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(METHOD_EXTENSION))
}
