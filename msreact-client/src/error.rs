//! All the errors that this crate can emit, one enum per layer.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    protocol::id::{CommandId, ResponseId},
    state_machine::{AcquisitionStatus, StatusInput},
    transport::ConnectionState,
};

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum TransportError {
    /// The operation is not legal in the current connection state.
    #[error("cannot {operation} while the transport is {state}")]
    InvalidState {
        /// The attempted operation
        operation: &'static str,
        /// The state the transport was in
        state: ConnectionState,
    },

    /// The peer went away and every reconnection attempt failed.
    #[error("connection lost, {attempts} reconnection attempts failed")]
    Disconnection {
        /// How many reconnection attempts were made
        attempts: u32,
    },

    /// The server address could not be turned into a WebSocket URI.
    #[error("invalid server address \"{address}\"")]
    InvalidAddress {
        /// The address as given by the caller
        address: String,
    },

    /// An error from the underlying WebSocket.
    #[error("websocket error: {source}")]
    WebSocket {
        /// The original error
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Errors raised while encoding or decoding wire frames.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum CodecError {
    /// The frame was empty or carried an unknown message id.
    #[error("malformed frame: {details}")]
    MalformedFrame {
        /// Why the frame was rejected
        details: String,
    },

    /// The bytes following the message id are not a single msgpack value.
    #[error("could not decode payload: {details}")]
    PayloadDecode {
        /// Why decoding failed
        details: String,
    },

    /// The payload could not be serialized.
    #[error("could not encode payload: {source}")]
    PayloadEncode {
        /// The original error
        #[from]
        source: rmpv::encode::Error,
    },
}

/// Errors raised by [`crate::protocol::ProtocolClient`].
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum ProtocolError {
    /// The transport failed while sending.
    #[error("transport error: {source}")]
    Transport {
        /// The original error
        #[from]
        source: TransportError,
    },

    /// The message could not be packed into a frame.
    #[error("packing error: {details}")]
    Packing {
        /// Why packing failed
        details: String,
    },

    /// A received frame could not be decoded.
    #[error("parsing error: {source}")]
    Parsing {
        /// The original error
        source: CodecError,
    },
}

/// Errors raised by [`crate::instrument::InstrumentClient`].
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum InstrumentClientError {
    /// The protocol layer failed.
    #[error("protocol error: {source}")]
    Protocol {
        /// The original error
        #[from]
        source: ProtocolError,
    },

    /// `SELECT_INSTR_CMD` was not acknowledged.
    #[error("problem with instrument selection: {details}")]
    InstrumentSelectionFailed {
        /// What the server answered
        details: String,
    },

    /// Subscribing to or unsubscribing from scans was not acknowledged.
    #[error("problem with scan subscription: {details}")]
    SubscriptionFailed {
        /// What the server answered
        details: String,
    },

    /// `CONFIG_ACQ_CMD` was not acknowledged.
    #[error("problem with configuring acquisition: {details}")]
    AcquisitionConfigurationFailed {
        /// What the server answered
        details: String,
    },

    /// `START_ACQ_CMD` was not acknowledged.
    #[error("problem with starting acquisition: {details}")]
    AcquisitionStartFailed {
        /// What the server answered
        details: String,
    },

    /// `STOP_ACQ_CMD` was not acknowledged.
    #[error("problem with stopping acquisition: {details}")]
    AcquisitionStopFailed {
        /// What the server answered
        details: String,
    },

    /// `UPDATE_DEF_SCAN_PARAMS_CMD` was not acknowledged.
    #[error("problem with updating default scan parameters: {details}")]
    ScanParameterUpdateFailed {
        /// What the server answered
        details: String,
    },

    /// A query command received a response other than the one it expects.
    #[error("unexpected response {received} to {command}: {details}")]
    UnexpectedResponse {
        /// The command that was sent
        command: CommandId,
        /// The response that arrived instead
        received: ResponseId,
        /// What the server answered
        details: String,
    },

    /// The listening loop ended while a command was waiting for its response.
    #[error("connection closed while waiting for a response")]
    ConnectionClosed,

    /// No response arrived in time.
    #[error("no response to {command} within {timeout:?}")]
    ResponseTimeout {
        /// The command that was sent
        command: CommandId,
        /// How long we waited
        timeout: Duration,
    },

    /// The HTTP download of a raw file failed.
    #[error("download error: {source}")]
    Download {
        /// The original error
        #[from]
        source: reqwest::Error,
    },

    /// An IO error occurred
    #[error("IO error occurred: {source}")]
    IOError {
        /// The original `[std::io::Error]`
        #[from]
        source: std::io::Error,
    },
}

/// Errors raised while running an acquisition.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum AcquisitionError {
    /// A workflow was constructed with a parameter it cannot accept.
    #[error("invalid parameter for the \"{workflow}\" workflow: {details}")]
    InvalidWorkflowParameter {
        /// The workflow name
        workflow: &'static str,
        /// What was wrong with the parameter
        details: String,
    },

    /// An illegal acquisition status transition was requested.
    #[error("acquisition status transition error: in \"{state}\" state, encountered unexpected input \"{input}\"")]
    StatusTransition {
        /// The status we were in
        state: AcquisitionStatus,
        /// The input causing the transition
        input: StatusInput,
    },

    /// The intra-acquisition thread did not finish after the acquisition ended.
    #[error("intra acquisition did not finish within {timeout:?} after the acquisition ended")]
    IntraAcquisitionTimeout {
        /// How long the runner waited
        timeout: Duration,
    },

    /// A lifecycle hook panicked.
    #[error("{hook} panicked")]
    HookPanicked {
        /// Which hook
        hook: &'static str,
    },

    /// A lifecycle hook returned an error.
    #[error("{hook} failed: {details}")]
    HookFailed {
        /// Which hook
        hook: &'static str,
        /// The error returned by the hook
        details: String,
    },

    /// The algorithm name is not registered.
    #[error("unknown algorithm \"{name}\"")]
    UnknownAlgorithm {
        /// The requested name
        name: String,
    },

    /// The algorithm has no step with the given index.
    #[error("algorithm \"{algorithm}\" has no acquisition step {index}")]
    UnknownStep {
        /// The algorithm name
        algorithm: String,
        /// The requested step
        index: usize,
    },

    /// Reading or writing the transfer register failed.
    #[error("transfer register {path:?}: {details}")]
    TransferRegister {
        /// The register file
        path: PathBuf,
        /// What went wrong
        details: String,
    },

    /// The per-algorithm configuration could not be loaded.
    #[error("configuration error: {source}")]
    Config {
        /// The original error
        #[from]
        source: ConfigError,
    },

    /// The framed link to the parent process failed.
    #[error("worker link error: {source}")]
    Ipc {
        /// The original error
        #[from]
        source: IpcError,
    },

    /// An IO error occurred
    #[error("IO error occurred: {source}")]
    IOError {
        /// The original `[std::io::Error]`
        #[from]
        source: std::io::Error,
    },
}

/// Errors from the length-prefixed msgpack link between manager and worker.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum IpcError {
    /// An IO error occurred
    #[error("IO error occurred: {source}")]
    IOError {
        /// The original `[std::io::Error]`
        #[from]
        source: std::io::Error,
    },

    /// A message could not be serialized.
    #[error("could not encode message: {source}")]
    Encode {
        /// The original error
        #[from]
        source: rmp_serde::encode::Error,
    },

    /// A frame did not hold a valid message.
    #[error("could not decode message: {source}")]
    Decode {
        /// The original error
        #[from]
        source: rmp_serde::decode::Error,
    },

    /// A frame exceeded the maximum length.
    #[error("frame of {len} bytes exceeds the limit")]
    FrameTooLarge {
        /// The offending length
        len: usize,
    },
}

/// Errors while loading configuration files.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    /// An IO error occurred
    #[error("IO error occurred: {source}")]
    IOError {
        /// The original `[std::io::Error]`
        #[from]
        source: std::io::Error,
    },

    /// There was an error deserializing a JSON file
    #[error("deserialization error: {source}")]
    DeserializationError {
        ///The original error
        #[from]
        source: serde_json::Error,
    },

    /// The configuration file does not hold a JSON object at the top level.
    #[error("configuration {path:?} is not a JSON object")]
    NotAnObject {
        /// The configuration file
        path: PathBuf,
    },

    /// The path is not an existing `.json` file.
    #[error("configuration path {path:?} is not a JSON file")]
    InvalidPath {
        /// The rejected path
        path: PathBuf,
    },
}

/// Reasons why [`crate::manager::AlgorithmManager::select_algorithm`] rejects a
/// selection. These are logged, not propagated.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum AlgorithmSelectionError {
    /// No algorithm with this name is registered.
    #[error("algorithm {name} cannot be selected: not found")]
    UnknownAlgorithm {
        /// The requested name
        name: String,
    },

    /// An acquisition step does not support the connected instrument.
    #[error("available instrument {instrument} not compatible with {algorithm} step {step}")]
    InstrumentMismatch {
        /// The algorithm name
        algorithm: String,
        /// The acquisition class of the step
        step: String,
        /// The connected instrument
        instrument: String,
    },

    /// Rows of the sequence file did not match any acquisition of the algorithm.
    #[error("could not resolve {} sequence row(s): {rows:?}", rows.len())]
    SequenceMismatch {
        /// One-based row numbers that did not match
        rows: Vec<usize>,
    },

    /// The sequence file could not be read.
    #[error("sequence file {path:?}: {details}")]
    SequenceFile {
        /// The sequence file
        path: PathBuf,
        /// What went wrong
        details: String,
    },
}

/// Errors raised by [`crate::manager::AlgorithmManager`] and the executors.
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum ManagerError {
    /// `run_algorithm` was called before a successful selection.
    #[error("no algorithm selected")]
    NoAlgorithmSelected,

    /// The acquisition failed inside the worker.
    #[error("acquisition error: {source}")]
    Acquisition {
        /// The original error
        #[from]
        source: AcquisitionError,
    },

    /// The acquisition ended because of an error.
    #[error("acquisition {acquisition} ended with an error")]
    EndedWithError {
        /// The acquisition class name
        acquisition: String,
    },

    /// The run was stopped before all steps were executed.
    #[error("algorithm run interrupted")]
    Interrupted,

    /// The worker process exited abnormally.
    #[error("acquisition worker for {acquisition} exited abnormally (code {code:?})")]
    WorkerFailed {
        /// The acquisition class name
        acquisition: String,
        /// The exit code, if the process was not killed by a signal
        code: Option<i32>,
    },

    /// A blocking task could not be joined.
    #[error("worker task failed: {source}")]
    Join {
        /// The original error
        #[from]
        source: tokio::task::JoinError,
    },

    /// The worker pool was closed.
    #[error("worker pool closed: {source}")]
    Pool {
        /// The original error
        #[from]
        source: tokio::sync::AcquireError,
    },

    /// An IO error occurred
    #[error("IO error occurred: {source}")]
    IOError {
        /// The original `[std::io::Error]`
        #[from]
        source: std::io::Error,
    },
}

/// Errors surfaced by the session orchestrator in [`crate::client`].
#[derive(Error, Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum ClientError {
    /// The server refused the connection.
    #[error("connection to {address} failed")]
    ConnectionFailed {
        /// The server address
        address: String,
    },

    /// An instrument command failed.
    #[error("instrument error: {source}")]
    Instrument {
        /// The original error
        #[from]
        source: InstrumentClientError,
    },

    /// The requested workflow is not supported by the connected instrument.
    #[error("{instrument} does not support the {workflow} workflow")]
    UnsupportedWorkflow {
        /// The instrument model
        instrument: String,
        /// The workflow name
        workflow: &'static str,
    },
}
