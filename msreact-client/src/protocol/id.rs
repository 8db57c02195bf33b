//! Message ids of the MSReact wire protocol.
//!
//! Ids are split into commands (client to server), responses (server to client,
//! answering the pending command) and events (server to client, unsolicited).
//! Every id maps to exactly one byte on the wire.

use std::fmt::Display;

use crate::error::CodecError;

/// Commands the client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    GetServerSwVer = 3,
    GetServerProtoVer = 5,
    GetAcqRawFileName = 7,
    GetAvailableInstr = 20,
    GetInstrInfo = 22,
    GetInstrState = 24,
    SelectInstr = 26,
    DeselectInstr = 27,
    ConfigAcq = 100,
    StartAcq = 101,
    StopAcq = 102,
    SubscribeToScans = 104,
    UnsubscribeFromScans = 106,
    GetPossibleParams = 107,
    ReqCustomScan = 109,
    CancelCustomScan = 110,
    SetRepeatingScan = 111,
    ClearRepeatingScan = 112,
    UpdateDefScanParams = 113,
    GetLastAcqFile = 114,
    SetMsScanLvl = 200,
    ShutDownMockServer = 201,
}

impl CommandId {
    pub const ALL: [Self; 22] = [
        Self::GetServerSwVer,
        Self::GetServerProtoVer,
        Self::GetAcqRawFileName,
        Self::GetAvailableInstr,
        Self::GetInstrInfo,
        Self::GetInstrState,
        Self::SelectInstr,
        Self::DeselectInstr,
        Self::ConfigAcq,
        Self::StartAcq,
        Self::StopAcq,
        Self::SubscribeToScans,
        Self::UnsubscribeFromScans,
        Self::GetPossibleParams,
        Self::ReqCustomScan,
        Self::CancelCustomScan,
        Self::SetRepeatingScan,
        Self::ClearRepeatingScan,
        Self::UpdateDefScanParams,
        Self::GetLastAcqFile,
        Self::SetMsScanLvl,
        Self::ShutDownMockServer,
    ];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetServerSwVer => "GET_SERVER_SW_VER_CMD",
            Self::GetServerProtoVer => "GET_SERVER_PROTO_VER_CMD",
            Self::GetAcqRawFileName => "GET_ACQ_RAW_FILE_NAME_CMD",
            Self::GetAvailableInstr => "GET_AVAILABLE_INSTR_CMD",
            Self::GetInstrInfo => "GET_INSTR_INFO_CMD",
            Self::GetInstrState => "GET_INSTR_STATE_CMD",
            Self::SelectInstr => "SELECT_INSTR_CMD",
            Self::DeselectInstr => "DESELECT_INSTR_CMD",
            Self::ConfigAcq => "CONFIG_ACQ_CMD",
            Self::StartAcq => "START_ACQ_CMD",
            Self::StopAcq => "STOP_ACQ_CMD",
            Self::SubscribeToScans => "SUBSCRIBE_TO_SCANS_CMD",
            Self::UnsubscribeFromScans => "UNSUBSCRIBE_FROM_SCANS_CMD",
            Self::GetPossibleParams => "GET_POSSIBLE_PARAMS_CMD",
            Self::ReqCustomScan => "REQ_CUSTOM_SCAN_CMD",
            Self::CancelCustomScan => "CANCEL_CUSTOM_SCAN_CMD",
            Self::SetRepeatingScan => "SET_REPEATING_SCAN_CMD",
            Self::ClearRepeatingScan => "CLEAR_REPEATING_SCAN_CMD",
            Self::UpdateDefScanParams => "UPDATE_DEF_SCAN_PARAMS_CMD",
            Self::GetLastAcqFile => "GET_LAST_ACQ_FILE_CMD",
            Self::SetMsScanLvl => "SET_MS_SCAN_LVL_CMD",
            Self::ShutDownMockServer => "SHUT_DOWN_MOCK_SERVER_CMD",
        }
    }
}

/// Responses the server sends back for the pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseId {
    Ok = 0,
    Error = 1,
    ServerSwVer = 4,
    ServerProtoVer = 6,
    AcqRawFileName = 8,
    AvailableInstr = 21,
    InstrInfo = 23,
    InstrState = 25,
    PossibleParams = 108,
    LastAcqFile = 115,
}

impl ResponseId {
    pub const ALL: [Self; 10] = [
        Self::Ok,
        Self::Error,
        Self::ServerSwVer,
        Self::ServerProtoVer,
        Self::AcqRawFileName,
        Self::AvailableInstr,
        Self::InstrInfo,
        Self::InstrState,
        Self::PossibleParams,
        Self::LastAcqFile,
    ];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK_RSP",
            Self::Error => "ERROR_RSP",
            Self::ServerSwVer => "SERVER_SW_VER_RSP",
            Self::ServerProtoVer => "SERVER_PROTO_VER_RSP",
            Self::AcqRawFileName => "ACQ_RAW_FILE_NAME_RSP",
            Self::AvailableInstr => "AVAILABLE_INSTR_RSP",
            Self::InstrInfo => "INSTR_INFO_RSP",
            Self::InstrState => "INSTR_STATE_RSP",
            Self::PossibleParams => "POSSIBLE_PARAMS_RSP",
            Self::LastAcqFile => "LAST_ACQ_FILE_RSP",
        }
    }
}

/// Unsolicited server notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventId {
    Error = 2,
    FinishedAcq = 103,
    Scan = 105,
}

impl EventId {
    pub const ALL: [Self; 3] = [Self::Error, Self::FinishedAcq, Self::Scan];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR_EVT",
            Self::FinishedAcq => "FINISHED_ACQ_EVT",
            Self::Scan => "SCAN_EVT",
        }
    }
}

/// Any message id of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Command(CommandId),
    Response(ResponseId),
    Event(EventId),
}

impl MessageId {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Command(c) => c.as_u8(),
            Self::Response(r) => r.as_u8(),
            Self::Event(e) => e.as_u8(),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Command(c) => c.name(),
            Self::Response(r) => r.name(),
            Self::Event(e) => e.name(),
        }
    }
}

impl TryFrom<u8> for MessageId {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        CommandId::ALL
            .iter()
            .find(|c| c.as_u8() == value)
            .map(|c| Self::Command(*c))
            .or_else(|| {
                ResponseId::ALL
                    .iter()
                    .find(|r| r.as_u8() == value)
                    .map(|r| Self::Response(*r))
            })
            .or_else(|| {
                EventId::ALL
                    .iter()
                    .find(|e| e.as_u8() == value)
                    .map(|e| Self::Event(*e))
            })
            .ok_or_else(|| CodecError::MalformedFrame {
                details: format!("unknown message id {value}"),
            })
    }
}

impl From<CommandId> for MessageId {
    fn from(value: CommandId) -> Self {
        Self::Command(value)
    }
}

impl From<ResponseId> for MessageId {
    fn from(value: ResponseId) -> Self {
        Self::Response(value)
    }
}

impl From<EventId> for MessageId {
    fn from(value: EventId) -> Self {
        Self::Event(value)
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
