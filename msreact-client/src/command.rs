//! Messages exchanged between the algorithm manager and a running acquisition.
//!
//! Inbound messages ([`AcqMessage`]) flow from the manager to the acquisition,
//! outbound requests ([`AcqRequest`]) flow back. Both cross a process boundary
//! when acquisitions run in a worker process, so they are plain serializable
//! data.

use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::{
    acquisition::settings::AcquisitionSettings,
    scan::{Scan, ScanParams},
};

/// Key under which a request id is added to a custom scan request.
pub const REQUEST_ID_KEY: &str = "REQUEST_ID";

/// Ids of the messages crossing the manager/acquisition boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcqMsgId {
    Scan,
    RequestScan,
    RequestRepeatingScan,
    CancelRepeatingScan,
    ReadyForAcquisitionStart,
    RequestAcquisitionStop,
    AcquisitionEnded,
    Error,
    UpdateDefaultScanParams,
    SetScanLevel,
    SubscribeToScans,
    UnsubscribeFromScans,
    RequestRawFileNames,
    RawFileNames,
    RequestLastAcquisitionFile,
    RawFileDownloadFinished,
    Log,
}

impl AcqMsgId {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::RequestScan => "REQUEST_SCAN",
            Self::RequestRepeatingScan => "REQUEST_REPEATING_SCAN",
            Self::CancelRepeatingScan => "CANCEL_REPEATING_SCAN",
            Self::ReadyForAcquisitionStart => "READY_FOR_ACQUISITION_START",
            Self::RequestAcquisitionStop => "REQUEST_ACQUISITION_STOP",
            Self::AcquisitionEnded => "ACQUISITION_ENDED",
            Self::Error => "ERROR",
            Self::UpdateDefaultScanParams => "UPDATE_DEFAULT_SCAN_PARAMS",
            Self::SetScanLevel => "SET_SCAN_LEVEL",
            Self::SubscribeToScans => "SUBSCRIBE_TO_SCANS",
            Self::UnsubscribeFromScans => "UNSUBSCRIBE_FROM_SCANS",
            Self::RequestRawFileNames => "REQUEST_RAW_FILE_NAMES",
            Self::RawFileNames => "RAW_FILE_NAMES",
            Self::RequestLastAcquisitionFile => "REQUEST_LAST_ACQUISITION_FILE",
            Self::RawFileDownloadFinished => "RAW_FILE_DOWNLOAD_FINISHED",
            Self::Log => "LOG",
        }
    }
}

impl Display for AcqMsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Manager to acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcqMessage {
    Scan(Scan),
    AcquisitionEnded,
    /// The instrument or the connection failed; carries the reason if known.
    Error(Option<String>),
    RawFileNames(Vec<String>),
    /// `None` if the download failed.
    RawFileDownloadFinished(Option<PathBuf>),
}

impl AcqMessage {
    #[must_use]
    pub const fn id(&self) -> AcqMsgId {
        match self {
            Self::Scan(_) => AcqMsgId::Scan,
            Self::AcquisitionEnded => AcqMsgId::AcquisitionEnded,
            Self::Error(_) => AcqMsgId::Error,
            Self::RawFileNames(_) => AcqMsgId::RawFileNames,
            Self::RawFileDownloadFinished(_) => AcqMsgId::RawFileDownloadFinished,
        }
    }
}

/// A custom scan request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub params: ScanParams,
    pub request_id: Option<u64>,
}

/// Lowest and highest MS order the mock server should emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLevelRange {
    pub min: u8,
    pub max: u8,
}

impl ScanLevelRange {
    #[must_use]
    pub const fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.min <= self.max
    }
}

/// Acquisition to manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcqRequest {
    RequestScan(ScanRequest),
    RequestRepeatingScan(ScanParams),
    CancelRepeatingScan(ScanParams),
    /// Pre-acquisition is done. The instrument may be configured and started.
    ReadyForAcquisitionStart(AcquisitionSettings),
    RequestAcquisitionStop,
    Error(String),
    UpdateDefaultScanParams(ScanParams),
    SetScanLevel(ScanLevelRange),
    SubscribeToScans,
    UnsubscribeFromScans,
    RequestRawFileNames,
    RequestLastAcquisitionFile,
    /// A log record emitted inside a worker. Handled by the manager itself.
    Log(LogRecord),
}

impl AcqRequest {
    #[must_use]
    pub const fn id(&self) -> AcqMsgId {
        match self {
            Self::RequestScan(_) => AcqMsgId::RequestScan,
            Self::RequestRepeatingScan(_) => AcqMsgId::RequestRepeatingScan,
            Self::CancelRepeatingScan(_) => AcqMsgId::CancelRepeatingScan,
            Self::ReadyForAcquisitionStart(_) => AcqMsgId::ReadyForAcquisitionStart,
            Self::RequestAcquisitionStop => AcqMsgId::RequestAcquisitionStop,
            Self::Error(_) => AcqMsgId::Error,
            Self::UpdateDefaultScanParams(_) => AcqMsgId::UpdateDefaultScanParams,
            Self::SetScanLevel(_) => AcqMsgId::SetScanLevel,
            Self::SubscribeToScans => AcqMsgId::SubscribeToScans,
            Self::UnsubscribeFromScans => AcqMsgId::UnsubscribeFromScans,
            Self::RequestRawFileNames => AcqMsgId::RequestRawFileNames,
            Self::RequestLastAcquisitionFile => AcqMsgId::RequestLastAcquisitionFile,
            Self::Log(_) => AcqMsgId::Log,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(value: &tracing::Level) -> Self {
        match *value {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// A log event captured in a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Re-emit the record in this process, keeping the worker's target as a field.
    pub fn emit(&self) {
        let origin = self.target.as_str();
        let ts = self.timestamp.to_rfc3339();
        match self.level {
            LogLevel::Trace => trace!(origin, worker_time = %ts, "{}", self.message),
            LogLevel::Debug => debug!(origin, worker_time = %ts, "{}", self.message),
            LogLevel::Info => info!(origin, worker_time = %ts, "{}", self.message),
            LogLevel::Warn => warn!(origin, worker_time = %ts, "{}", self.message),
            LogLevel::Error => error!(origin, worker_time = %ts, "{}", self.message),
        }
    }
}

#[cfg(test)]
mod unit {
    use super::{AcqMessage, AcqMsgId, AcqRequest, ScanLevelRange};

    #[test]
    fn error_shares_one_id_in_both_directions() {
        assert_eq!(AcqMessage::Error(None).id(), AcqMsgId::Error);
        assert_eq!(AcqRequest::Error("boom".to_string()).id(), AcqMsgId::Error);
        assert_eq!(AcqMsgId::Error.to_string(), "ERROR");
    }

    #[test]
    fn scan_level_range_validity() {
        assert!(ScanLevelRange::new(1, 2).is_valid());
        assert!(ScanLevelRange::new(2, 2).is_valid());
        assert!(!ScanLevelRange::new(3, 1).is_valid());
    }
}
