//! Instrument client: correlates commands with their responses and hands
//! server events to an [`EventHandler`].
//!
//! Only one command is in flight at a time. Responses land in a single slot
//! that the waiting command takes. The slot is cleared before every send, so a
//! late response to an earlier command is discarded instead of being taken as
//! the answer to the next one.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rmpv::Value;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    acquisition::settings::AcquisitionSettings,
    command::{ScanLevelRange, ScanRequest, REQUEST_ID_KEY},
    download::download,
    error::{InstrumentClientError, ProtocolError},
    protocol::{
        id::{CommandId, EventId, MessageId, ResponseId},
        ProtocolClient, PROTOCOL_VERSION,
    },
    scan::{params_to_value, Scan, ScanParams},
    transport::Transport,
};

/// Server notifications handed to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    Scan(Scan),
    FinishedAcquisition,
    /// The server reported an error, or the connection was lost.
    Error(Option<String>),
}

/// Receives [`InstrumentEvent`]s on the listening task. Must not block.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: InstrumentEvent);
}

impl<F> EventHandler for F
where
    F: Fn(InstrumentEvent) + Send + Sync,
{
    fn handle_event(&self, event: InstrumentEvent) {
        self(event);
    }
}

/// One entry of `POSSIBLE_PARAMS_RSP`: a parameter accepted in scan requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PossibleParam {
    pub name: String,
    pub selection: String,
    pub default_value: String,
    pub help: String,
}

impl PossibleParam {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Map(entries) = value else {
            return None;
        };
        let field = |key: &str| {
            entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| value_to_string(v))
                .unwrap_or_default()
        };
        let name = field("Name");
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            selection: field("Selection"),
            default_value: field("DefaultValue"),
            help: field("Help"),
        })
    }
}

/// Strings are taken as they are, anything else is rendered.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
        Value::Nil => String::new(),
        v => v.to_string(),
    }
}

fn payload_to_string(payload: Option<&Value>) -> String {
    payload.map(value_to_string).unwrap_or_default()
}

/// A single string or an array of strings.
fn payload_to_strings(payload: Option<&Value>) -> Vec<String> {
    match payload {
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(Value::Nil) | None => Vec::new(),
        Some(v) => vec![value_to_string(v)],
    }
}

#[derive(Debug, Default)]
struct ResponseSlot {
    value: Option<(ResponseId, Option<Value>)>,
    /// Set when the listening loop ends. Waiters give up instead of waiting
    /// for a response that can no longer arrive.
    closed: bool,
}

pub struct InstrumentClient<T: Transport> {
    proto: ProtocolClient<T>,
    handler: Arc<dyn EventHandler>,
    slot: Mutex<ResponseSlot>,
    response_ready: Notify,
    command_lock: tokio::sync::Mutex<()>,
    acquisition_running: AtomicBool,
    listening: AtomicBool,
    stop_requested: AtomicBool,
    response_timeout: Option<Duration>,
    download_dir: PathBuf,
    possible_params: Mutex<Vec<PossibleParam>>,
}

impl<T: Transport> std::fmt::Debug for InstrumentClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentClient")
            .field("listening", &self.is_listening())
            .field("response_timeout", &self.response_timeout)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> InstrumentClient<T> {
    pub fn new<H>(transport: T, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        Self {
            proto: ProtocolClient::new(transport),
            handler: Arc::new(handler),
            slot: Mutex::new(ResponseSlot::default()),
            response_ready: Notify::new(),
            command_lock: tokio::sync::Mutex::new(()),
            acquisition_running: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            response_timeout: None,
            download_dir: PathBuf::from("."),
            possible_params: Mutex::new(Vec::new()),
        }
    }

    /// Give up on a command if no response arrives within `timeout`.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Where [`Self::request_last_acquisition_file`] stores raw files.
    #[must_use]
    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = dir;
        self
    }

    pub const fn protocol(&self) -> &ProtocolClient<T> {
        &self.proto
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_acquisition_running(&self) -> bool {
        self.acquisition_running.load(Ordering::Acquire)
    }

    /// Parameters collected by the last [`Self::get_possible_params`].
    pub fn possible_params(&self) -> Vec<PossibleParam> {
        lock(&self.possible_params).clone()
    }

    /// Connect to the server. `Ok(false)` means the server refused.
    ///
    /// # Errors
    /// [`InstrumentClientError::Protocol`] if no connection could be attempted.
    pub async fn connect(&self, address: Option<String>) -> Result<bool, InstrumentClientError> {
        Ok(self.proto.connect(address).await?)
    }

    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the client was not connected.
    pub async fn disconnect(&self) -> Result<(), InstrumentClientError> {
        Ok(self.proto.disconnect().await?)
    }

    /// Send a command and wait for the response that follows it.
    #[instrument(skip(self, payload))]
    async fn command(
        &self,
        id: CommandId,
        payload: Option<&Value>,
    ) -> Result<(ResponseId, Option<Value>), InstrumentClientError> {
        let _guard = self.command_lock.lock().await;
        let stale = lock(&self.slot).value.take();
        if let Some((stale, _)) = stale {
            warn!("discarding unsolicited {stale}");
        }
        self.proto.send_message(id.into(), payload).await?;
        let response = self.wait_for_response(id).await?;
        debug!("response: {}", response.0);
        Ok(response)
    }

    async fn wait_for_response(
        &self,
        command: CommandId,
    ) -> Result<(ResponseId, Option<Value>), InstrumentClientError> {
        let wait = async {
            loop {
                let notified = self.response_ready.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut slot = lock(&self.slot);
                    if let Some(response) = slot.value.take() {
                        return Ok(response);
                    }
                    if slot.closed {
                        return Err(InstrumentClientError::ConnectionClosed);
                    }
                }
                notified.await;
            }
        };
        match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| InstrumentClientError::ResponseTimeout { command, timeout })?,
            None => wait.await,
        }
    }

    /// Send a command that is acknowledged with `OK_RSP`. Anything else becomes
    /// the error built by `failed` from the server's message.
    async fn acknowledged<F>(
        &self,
        id: CommandId,
        payload: Option<&Value>,
        failed: F,
    ) -> Result<(), InstrumentClientError>
    where
        F: FnOnce(String) -> InstrumentClientError,
    {
        match self.command(id, payload).await? {
            (ResponseId::Ok, _) => Ok(()),
            (ResponseId::Error, message) => {
                let e = failed(payload_to_string(message.as_ref()));
                error!("{e}");
                Err(e)
            }
            (other, _) => {
                let e = failed(format!("received {other}"));
                error!("{e}");
                Err(e)
            }
        }
    }

    /// Send a query and return the payload of the `expected` response.
    async fn query(
        &self,
        id: CommandId,
        payload: Option<&Value>,
        expected: ResponseId,
    ) -> Result<Option<Value>, InstrumentClientError> {
        match self.command(id, payload).await? {
            (received, payload) if received == expected => Ok(payload),
            (received, payload) => Err(InstrumentClientError::UnexpectedResponse {
                command: id,
                received,
                details: payload_to_string(payload.as_ref()),
            }),
        }
    }

    /// Send a command without waiting for a response.
    async fn fire(
        &self,
        id: CommandId,
        payload: Option<&Value>,
    ) -> Result<(), InstrumentClientError> {
        Ok(self.proto.send_message(id.into(), payload).await?)
    }

    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_server_version(&self) -> Result<String, InstrumentClientError> {
        info!("Getting server software version");
        let payload = self
            .query(CommandId::GetServerSwVer, None, ResponseId::ServerSwVer)
            .await?;
        let version = payload_to_string(payload.as_ref());
        info!("Received server software version: {version}");
        Ok(version)
    }

    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_protocol_version(&self) -> Result<String, InstrumentClientError> {
        info!("Getting protocol version");
        let payload = self
            .query(CommandId::GetServerProtoVer, None, ResponseId::ServerProtoVer)
            .await?;
        let version = payload_to_string(payload.as_ref());
        info!("Received protocol version: {version}");
        if version != PROTOCOL_VERSION {
            warn!("server speaks protocol {version}, this client speaks {PROTOCOL_VERSION}");
        }
        Ok(version)
    }

    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_available_instruments(&self) -> Result<Option<Value>, InstrumentClientError> {
        info!("Getting available instruments");
        let payload = self
            .query(CommandId::GetAvailableInstr, None, ResponseId::AvailableInstr)
            .await?;
        info!("Available instruments: {}", payload_to_string(payload.as_ref()));
        Ok(payload)
    }

    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_instrument_info(
        &self,
        instrument: i64,
    ) -> Result<Option<Value>, InstrumentClientError> {
        info!("Requesting info about instrument {instrument}");
        self.query(
            CommandId::GetInstrInfo,
            Some(&Value::from(instrument)),
            ResponseId::InstrInfo,
        )
        .await
    }

    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_instrument_state(
        &self,
        instrument: i64,
    ) -> Result<Option<Value>, InstrumentClientError> {
        info!("Getting state of instrument {instrument}");
        self.query(
            CommandId::GetInstrState,
            Some(&Value::from(instrument)),
            ResponseId::InstrState,
        )
        .await
    }

    /// # Errors
    /// [`InstrumentClientError::InstrumentSelectionFailed`] unless acknowledged.
    pub async fn select_instrument(&self, instrument: i64) -> Result<(), InstrumentClientError> {
        info!("Selecting instrument {instrument}");
        self.acknowledged(
            CommandId::SelectInstr,
            Some(&Value::from(instrument)),
            |details| InstrumentClientError::InstrumentSelectionFailed { details },
        )
        .await
    }

    /// Collect the parameters accepted in scan requests. Entries without a name
    /// are skipped.
    ///
    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn get_possible_params(&self) -> Result<Vec<PossibleParam>, InstrumentClientError> {
        info!("Getting possible parameters for requesting scans");
        let payload = self
            .query(CommandId::GetPossibleParams, None, ResponseId::PossibleParams)
            .await?;
        let params: Vec<PossibleParam> = match payload {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(PossibleParam::from_value)
                .collect(),
            _ => Vec::new(),
        };
        debug!("{} possible scan parameters", params.len());
        lock(&self.possible_params).clone_from(&params);
        Ok(params)
    }

    /// # Errors
    /// [`InstrumentClientError::SubscriptionFailed`] unless acknowledged.
    pub async fn subscribe_to_scans(&self) -> Result<(), InstrumentClientError> {
        info!("Subscribing to scans");
        self.acknowledged(CommandId::SubscribeToScans, None, |details| {
            InstrumentClientError::SubscriptionFailed { details }
        })
        .await
    }

    /// # Errors
    /// [`InstrumentClientError::SubscriptionFailed`] unless acknowledged.
    pub async fn unsubscribe_from_scans(&self) -> Result<(), InstrumentClientError> {
        info!("Unsubscribing from scans");
        self.acknowledged(CommandId::UnsubscribeFromScans, None, |details| {
            InstrumentClientError::SubscriptionFailed { details }
        })
        .await
    }

    /// # Errors
    /// [`InstrumentClientError::AcquisitionConfigurationFailed`] unless acknowledged.
    pub async fn configure_acquisition(
        &self,
        settings: &AcquisitionSettings,
    ) -> Result<(), InstrumentClientError> {
        let config = settings.to_config_map();
        info!("Configuring the acquisition: {config}");
        self.acknowledged(CommandId::ConfigAcq, Some(&config), |details| {
            InstrumentClientError::AcquisitionConfigurationFailed { details }
        })
        .await
    }

    /// # Errors
    /// [`InstrumentClientError::AcquisitionStartFailed`] unless acknowledged.
    pub async fn start_acquisition(&self) -> Result<(), InstrumentClientError> {
        info!("Starting the acquisition");
        self.acknowledged(CommandId::StartAcq, None, |details| {
            InstrumentClientError::AcquisitionStartFailed { details }
        })
        .await?;
        self.acquisition_running.store(true, Ordering::Release);
        Ok(())
    }

    /// # Errors
    /// [`InstrumentClientError::AcquisitionStopFailed`] unless acknowledged.
    pub async fn stop_acquisition(&self) -> Result<(), InstrumentClientError> {
        info!("Stopping the acquisition");
        self.acknowledged(CommandId::StopAcq, None, |details| {
            InstrumentClientError::AcquisitionStopFailed { details }
        })
        .await?;
        self.acquisition_running.store(false, Ordering::Release);
        Ok(())
    }

    /// # Errors
    /// [`InstrumentClientError::ScanParameterUpdateFailed`] unless acknowledged.
    pub async fn update_default_scan_params(
        &self,
        params: &ScanParams,
    ) -> Result<(), InstrumentClientError> {
        info!("Updating default scan parameters to {params:?}");
        self.acknowledged(
            CommandId::UpdateDefScanParams,
            Some(&params_to_value(params)),
            |details| InstrumentClientError::ScanParameterUpdateFailed { details },
        )
        .await
    }

    /// Name(s) of the raw file the instrument is currently writing.
    ///
    /// # Errors
    /// [`InstrumentClientError::UnexpectedResponse`] or any transport failure.
    pub async fn request_raw_file_name(&self) -> Result<Vec<String>, InstrumentClientError> {
        info!("Requesting raw file name from the instrument");
        let payload = self
            .query(CommandId::GetAcqRawFileName, None, ResponseId::AcqRawFileName)
            .await?;
        Ok(payload_to_strings(payload.as_ref()))
    }

    /// Ask for the URL of the last raw file and download it. `Ok(None)` if the
    /// server answered the download with an error status.
    ///
    /// # Errors
    /// - [`InstrumentClientError::UnexpectedResponse`] if no URL is returned
    /// - [`InstrumentClientError::Download`] or [`InstrumentClientError::IOError`]
    ///   if the download fails
    pub async fn request_last_acquisition_file(
        &self,
    ) -> Result<Option<PathBuf>, InstrumentClientError> {
        info!("Requesting the raw file of the last acquisition");
        let payload = self
            .query(CommandId::GetLastAcqFile, None, ResponseId::LastAcqFile)
            .await?;
        let url = payload_to_string(payload.as_ref());
        download(&url, &self.download_dir).await
    }

    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn request_scan(&self, request: &ScanRequest) -> Result<(), InstrumentClientError> {
        let mut payload = params_to_value(&request.params);
        if let (Some(id), Value::Map(entries)) = (request.request_id, &mut payload) {
            entries.push((Value::from(REQUEST_ID_KEY), Value::from(id)));
        }
        trace!("requesting custom scan {payload}");
        self.fire(CommandId::ReqCustomScan, Some(&payload)).await
    }

    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn cancel_custom_scan(&self) -> Result<(), InstrumentClientError> {
        self.fire(CommandId::CancelCustomScan, None).await
    }

    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn request_repeating_scan(
        &self,
        params: &ScanParams,
    ) -> Result<(), InstrumentClientError> {
        self.fire(CommandId::SetRepeatingScan, Some(&params_to_value(params)))
            .await
    }

    /// Without parameters every repeating scan is cleared.
    ///
    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn cancel_repeating_scan(
        &self,
        params: &ScanParams,
    ) -> Result<(), InstrumentClientError> {
        let payload = (!params.is_empty()).then(|| params_to_value(params));
        self.fire(CommandId::ClearRepeatingScan, payload.as_ref()).await
    }

    /// Mock servers only: restrict which MS levels are transmitted. An inverted
    /// range is not sent.
    ///
    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn set_ms_scan_level(
        &self,
        range: ScanLevelRange,
    ) -> Result<(), InstrumentClientError> {
        if !range.is_valid() {
            warn!(
                "ignoring scan level range {}..{}: lowest level is above highest",
                range.min, range.max
            );
            return Ok(());
        }
        let payload = Value::Array(vec![Value::from(range.min), Value::from(range.max)]);
        self.fire(CommandId::SetMsScanLvl, Some(&payload)).await
    }

    /// Mock servers only.
    ///
    /// # Errors
    /// [`InstrumentClientError::Protocol`] if the command cannot be sent.
    pub async fn request_shut_down_server(&self) -> Result<(), InstrumentClientError> {
        info!("Requesting mock server shut down");
        self.fire(CommandId::ShutDownMockServer, None).await
    }

    /// Receive and dispatch messages until [`Self::stop_listening`] is called,
    /// an `ERROR_EVT` arrives or the connection is lost for good.
    ///
    /// A receive in progress is never abandoned, so a transport in the middle
    /// of reconnecting finishes its attempt. A stop request is seen once the
    /// current receive returns.
    #[instrument(skip(self))]
    pub async fn listen_for_messages(&self) {
        self.stop_requested.store(false, Ordering::Release);
        lock(&self.slot).closed = false;
        self.listening.store(true, Ordering::Release);
        info!("Listening for messages started");

        while !self.stop_requested.load(Ordering::Acquire) {
            match self.proto.receive_message().await {
                Ok((MessageId::Event(EventId::Error), _))
                    if self.stop_requested.load(Ordering::Acquire) =>
                {
                    debug!("transport closed after stop was requested");
                    break;
                }
                Ok((id, payload)) => {
                    if !self.dispatch(id, payload) {
                        break;
                    }
                }
                Err(ProtocolError::Parsing { source }) => {
                    error!("dropping undecodable message: {source}");
                }
                Err(e) => {
                    error!("receiving failed: {e}");
                    break;
                }
            }
        }

        self.listening.store(false, Ordering::Release);
        lock(&self.slot).closed = true;
        self.response_ready.notify_waiters();
        self.response_ready.notify_one();
        info!("Exited listening for messages loop");
    }

    /// Ask the listening loop to exit. Takes effect between two messages.
    pub fn stop_listening(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Route one received message. Returns `false` if listening should stop.
    pub fn dispatch(&self, id: MessageId, payload: Option<Value>) -> bool {
        match id {
            MessageId::Response(response) => {
                let previous = lock(&self.slot).value.replace((response, payload));
                if let Some((stale, _)) = previous {
                    warn!("{stale} was never taken, replaced by {response}");
                }
                self.response_ready.notify_one();
                true
            }
            MessageId::Event(EventId::Scan) => {
                self.handler
                    .handle_event(InstrumentEvent::Scan(Scan::new(payload.unwrap_or(Value::Nil))));
                true
            }
            MessageId::Event(EventId::FinishedAcq) => {
                info!("Finished acquisition event received");
                self.acquisition_running.store(false, Ordering::Release);
                self.handler.handle_event(InstrumentEvent::FinishedAcquisition);
                true
            }
            MessageId::Event(EventId::Error) => {
                let message = payload.as_ref().map(value_to_string);
                error!(
                    "error event from the server: {}",
                    message.as_deref().unwrap_or("<no details>")
                );
                self.handler.handle_event(InstrumentEvent::Error(message));
                false
            }
            MessageId::Command(command) => {
                error!("protocol violation: the server sent command {command}");
                true
            }
        }
    }

    /// Select `instrument` and collect its possible scan parameters. The
    /// listening loop must already be running.
    ///
    /// # Errors
    /// See [`Self::select_instrument`] and [`Self::get_possible_params`].
    pub async fn setup_instrument_connection(
        &self,
        instrument: i64,
    ) -> Result<Vec<PossibleParam>, InstrumentClientError> {
        self.select_instrument(instrument).await?;
        self.get_possible_params().await
    }

    /// Unsubscribe, stop listening and disconnect. Failures are logged and
    /// do not stop the remaining steps.
    pub async fn instrument_clean_up(&self) {
        if self.is_listening() {
            if let Err(e) = self.unsubscribe_from_scans().await {
                warn!("unsubscribing during clean up failed: {e}");
            }
        }
        info!("Stopping the listening loop");
        self.stop_listening();
        info!("Disconnecting from server");
        if let Err(e) = self.disconnect().await {
            debug!("disconnect during clean up: {e}");
        }
    }
}

impl<T: Transport + 'static> InstrumentClient<T> {
    /// Run [`Self::listen_for_messages`] on its own task.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.listen_for_messages().await })
    }
}
