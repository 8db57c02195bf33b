//! A small JSON key/value file that carries state from one acquisition step to
//! the next within a single algorithm run.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::AcquisitionError;

pub const DEFAULT_FILE_NAME: &str = "transfer_register.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRegister {
    path: PathBuf,
    values: Map<String, Value>,
}

impl TransferRegister {
    /// The content a register starts each run with.
    #[must_use]
    pub fn default_values() -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("KEY".to_string(), Value::from("value"));
        values
    }

    /// A register with the default content that has not been written yet.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            values: Self::default_values(),
        }
    }

    /// Write a fresh register with the default content, replacing any previous one.
    ///
    /// # Errors
    /// [`AcquisitionError::TransferRegister`] if the file cannot be written.
    pub fn create_default(path: &Path) -> Result<Self, AcquisitionError> {
        let register = Self::new(path.to_path_buf());
        register.save()?;
        debug!("created transfer register {path:?}");
        Ok(register)
    }

    /// # Errors
    /// [`AcquisitionError::TransferRegister`] if the file is missing, unreadable
    /// or not a JSON object.
    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        let fail = |details: String| AcquisitionError::TransferRegister {
            path: path.to_path_buf(),
            details,
        };
        let raw = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        match serde_json::from_str::<Value>(&raw).map_err(|e| fail(e.to_string()))? {
            Value::Object(values) => Ok(Self {
                path: path.to_path_buf(),
                values,
            }),
            _ => Err(fail("not a JSON object".to_string())),
        }
    }

    /// # Errors
    /// [`AcquisitionError::TransferRegister`] if the file cannot be written.
    pub fn save(&self) -> Result<(), AcquisitionError> {
        let fail = |details: String| AcquisitionError::TransferRegister {
            path: self.path.clone(),
            details,
        };
        let contents = serde_json::to_string_pretty(&self.values).map_err(|e| fail(e.to_string()))?;
        fs::write(&self.path, contents).map_err(|e| fail(e.to_string()))
    }

    /// Delete the register file. A missing file is not an error.
    pub fn remove(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("removed transfer register {path:?}"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("unable to remove transfer register {path:?}: {e}"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    #[must_use]
    pub const fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod unit {
    use assert_matches::assert_matches;
    use serde_json::Value;

    use super::TransferRegister;
    use crate::error::AcquisitionError;

    #[test]
    fn values_survive_save_and_load() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("register.json");

        let mut register = TransferRegister::create_default(&path).expect("should create");
        assert_eq!(register.get("KEY"), Some(&Value::from("value")));
        register.set("monitor_scan_count", 5);
        register.save().expect("should save");

        let loaded = TransferRegister::load(&path).expect("should load");
        assert_eq!(loaded.get("monitor_scan_count"), Some(&Value::from(5)));
        assert_eq!(loaded.get("KEY"), Some(&Value::from("value")));
    }

    #[test]
    fn create_default_overwrites_previous_run() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("register.json");
        std::fs::write(&path, r#"{"stale": true}"#).expect("should write");

        let register = TransferRegister::create_default(&path).expect("should create");
        assert_eq!(register.get("stale"), None);
    }

    #[test]
    fn non_object_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("register.json");
        std::fs::write(&path, "[1, 2]").expect("should write");

        assert_matches!(
            TransferRegister::load(&path),
            Err(AcquisitionError::TransferRegister { .. })
        );
    }

    #[test]
    fn remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("register.json");
        TransferRegister::remove(&path);
        TransferRegister::create_default(&path).expect("should create");
        TransferRegister::remove(&path);
        assert!(!path.exists());
    }
}
