use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::acquisition::workflow::AcquisitionWorkflow;

pub const DEFAULT_RAW_FILE_NAME: &str = "Default.RAW";
pub const DEFAULT_SAMPLE_NAME: &str = "-";
pub const DEFAULT_COMMENT: &str = "-";

/// Everything the instrument needs to configure an acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub workflow: AcquisitionWorkflow,
    pub single_processing_delay: f64,
    pub wait_for_contact_closure: bool,
    pub raw_file_name: String,
    pub sample_name: String,
    pub comment: String,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            workflow: AcquisitionWorkflow::default(),
            single_processing_delay: 0.0,
            wait_for_contact_closure: false,
            raw_file_name: DEFAULT_RAW_FILE_NAME.to_string(),
            sample_name: DEFAULT_SAMPLE_NAME.to_string(),
            comment: DEFAULT_COMMENT.to_string(),
        }
    }
}

impl AcquisitionSettings {
    #[must_use]
    pub fn new(workflow: AcquisitionWorkflow) -> Self {
        Self {
            workflow,
            ..Self::default()
        }
    }

    /// The `CONFIG_ACQ_CMD` payload. Every value is a string.
    #[must_use]
    pub fn to_config_map(&self) -> Value {
        let contact_closure = if self.wait_for_contact_closure {
            "True"
        } else {
            "False"
        };
        let entries = [
            ("AcquisitionType", self.workflow.type_id().to_string()),
            ("AcquisitionParam", self.workflow.parameter_string()),
            ("RawFileName", self.raw_file_name.clone()),
            ("SampleName", self.sample_name.clone()),
            ("Comment", self.comment.clone()),
            (
                "SingleProcessingDelay",
                self.single_processing_delay.to_string(),
            ),
            ("WaitForContactClosure", contact_closure.to_string()),
        ];
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), Value::from(v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod unit {
    use rmpv::Value;

    use super::AcquisitionSettings;
    use crate::acquisition::workflow::AcquisitionWorkflow;

    fn lookup<'a>(map: &'a Value, key: &str) -> Option<&'a str> {
        map.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .and_then(|(_, v)| v.as_str())
    }

    #[test]
    fn defaults_render_as_server_literals() {
        let map = AcquisitionSettings::default().to_config_map();
        assert_eq!(lookup(&map, "AcquisitionType"), Some("1"));
        assert_eq!(lookup(&map, "AcquisitionParam"), Some("None"));
        assert_eq!(lookup(&map, "RawFileName"), Some("Default.RAW"));
        assert_eq!(lookup(&map, "SampleName"), Some("-"));
        assert_eq!(lookup(&map, "Comment"), Some("-"));
        assert_eq!(lookup(&map, "SingleProcessingDelay"), Some("0"));
        assert_eq!(lookup(&map, "WaitForContactClosure"), Some("False"));
        assert_eq!(map.as_map().map(Vec::len), Some(7));
    }

    #[test]
    fn parameter_is_stringified() {
        let mut settings = AcquisitionSettings::new(AcquisitionWorkflow::LimitedByDuration(60.0));
        settings.wait_for_contact_closure = true;
        let map = settings.to_config_map();
        assert_eq!(lookup(&map, "AcquisitionType"), Some("4"));
        assert_eq!(lookup(&map, "AcquisitionParam"), Some("60"));
        assert_eq!(lookup(&map, "WaitForContactClosure"), Some("True"));
    }
}
