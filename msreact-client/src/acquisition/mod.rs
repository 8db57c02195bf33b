//! The acquisition lifecycle and the context algorithms use to talk to the
//! instrument.

pub mod runner;
pub mod settings;
pub mod workflow;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    thread,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use crate::{
    acquisition::settings::AcquisitionSettings,
    command::{AcqMessage, AcqRequest, ScanLevelRange, ScanRequest},
    error::AcquisitionError,
    scan::{Scan, ScanParams},
    state_machine::{AcquisitionStatus, StatusInput},
    transfer_register::TransferRegister,
    POLL_INTERVAL,
};

/// What a lifecycle hook returns. Any error is fatal to the acquisition.
pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// One step of an algorithm.
///
/// `pre_acquisition` and `post_acquisition` run on the worker's main thread.
/// `intra_acquisition` runs on a dedicated thread while the main thread watches
/// for the end of the acquisition, so it must poll
/// [`AcquisitionContext::acquisition_status`] and return once the acquisition
/// is no longer [`AcquisitionStatus::Running`].
pub trait Acquisition: Send {
    /// The acquisition class name, as used in sequence files.
    fn name(&self) -> &str;

    /// Prepare the acquisition, typically by choosing a workflow through
    /// [`AcquisitionContext::update_settings`].
    ///
    /// # Errors
    /// Any error aborts the acquisition before the instrument is started.
    fn pre_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult;

    /// # Errors
    /// Any error ends the acquisition with [`AcquisitionStatus::EndedError`].
    fn intra_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult;

    /// # Errors
    /// Any error is reported as a failed acquisition.
    fn post_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult;
}

/// State shared between the worker's main thread and the intra-acquisition
/// thread, plus the two queues to the manager.
#[derive(Debug)]
pub struct AcquisitionContext {
    status: Mutex<AcquisitionStatus>,
    scan_tx: Sender<Scan>,
    scan_rx: Receiver<Scan>,
    inbound: Receiver<AcqMessage>,
    outbound: Sender<AcqRequest>,
    settings: Mutex<AcquisitionSettings>,
    config: Option<Map<String, Value>>,
    transfer_register: Mutex<TransferRegister>,
    raw_file_names: Mutex<Vec<String>>,
    downloaded_raw_file: Mutex<Option<PathBuf>>,
    aborted: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AcquisitionContext {
    #[must_use]
    pub fn new(
        inbound: Receiver<AcqMessage>,
        outbound: Sender<AcqRequest>,
        transfer_register: TransferRegister,
    ) -> Self {
        let (scan_tx, scan_rx) = unbounded();
        Self {
            status: Mutex::new(AcquisitionStatus::new()),
            scan_tx,
            scan_rx,
            inbound,
            outbound,
            settings: Mutex::new(AcquisitionSettings::default()),
            config: None,
            transfer_register: Mutex::new(transfer_register),
            raw_file_names: Mutex::new(Vec::new()),
            downloaded_raw_file: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_settings(self, settings: AcquisitionSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            ..self
        }
    }

    #[must_use]
    pub fn with_config(self, config: Option<Map<String, Value>>) -> Self {
        Self { config, ..self }
    }

    fn send(&self, request: AcqRequest) {
        let id = request.id();
        if self.outbound.send(request).is_err() {
            warn!("manager queue closed, dropping {id}");
        } else {
            trace!("queued {id}");
        }
    }

    /// Pop a received scan without blocking. Sleeps for [`POLL_INTERVAL`] and
    /// returns `None` when no scan is waiting, so callers can poll in a loop.
    pub fn fetch_received_scan(&self) -> Option<Scan> {
        self.scan_rx.try_recv().map_or_else(
            |_| {
                thread::sleep(POLL_INTERVAL);
                None
            },
            Some,
        )
    }

    /// Number of received scans not yet fetched.
    #[must_use]
    pub fn pending_scans(&self) -> usize {
        self.scan_rx.len()
    }

    /// Tell the manager that pre-acquisition is done and hand it the settings
    /// the instrument should be configured with.
    pub fn signal_ready_for_acquisition(&self) {
        self.send(AcqRequest::ReadyForAcquisitionStart(self.settings()));
    }

    pub fn request_custom_scan(&self, params: ScanParams, request_id: Option<u64>) {
        self.send(AcqRequest::RequestScan(ScanRequest { params, request_id }));
    }

    pub fn request_repeating_scan(&self, params: ScanParams) {
        self.send(AcqRequest::RequestRepeatingScan(params));
    }

    pub fn cancel_repeating_scan(&self, params: ScanParams) {
        self.send(AcqRequest::CancelRepeatingScan(params));
    }

    pub fn request_acquisition_stop(&self) {
        self.send(AcqRequest::RequestAcquisitionStop);
    }

    pub fn signal_error_to_runner(&self, message: impl Into<String>) {
        self.send(AcqRequest::Error(message.into()));
    }

    pub fn update_default_scan_params(&self, params: ScanParams) {
        self.send(AcqRequest::UpdateDefaultScanParams(params));
    }

    /// Only honoured by the mock server.
    pub fn set_scan_level(&self, range: ScanLevelRange) {
        self.send(AcqRequest::SetScanLevel(range));
    }

    pub fn subscribe_to_scans(&self) {
        self.send(AcqRequest::SubscribeToScans);
    }

    pub fn unsubscribe_from_scans(&self) {
        self.send(AcqRequest::UnsubscribeFromScans);
    }

    /// The answer arrives later through [`Self::raw_file_names`].
    pub fn request_raw_file_names(&self) {
        self.send(AcqRequest::RequestRawFileNames);
    }

    /// The download location arrives later through [`Self::downloaded_raw_file`].
    pub fn request_last_acquisition_file(&self) {
        self.send(AcqRequest::RequestLastAcquisitionFile);
    }

    #[must_use]
    pub fn acquisition_status(&self) -> AcquisitionStatus {
        *lock(&self.status)
    }

    /// Overwrite the status without checking the transition.
    pub fn update_acquisition_status(&self, status: AcquisitionStatus) {
        *lock(&self.status) = status;
    }

    /// Apply a lifecycle input to the status.
    ///
    /// # Errors
    /// [`AcquisitionError::StatusTransition`] if the input is not legal in the
    /// current status, which is then left unchanged.
    pub fn advance(&self, input: StatusInput) -> Result<AcquisitionStatus, AcquisitionError> {
        let mut status = lock(&self.status);
        let next = status.next_state(input)?;
        debug!("acquisition status {} -> {next}", *status);
        *status = next;
        drop(status);
        Ok(next)
    }

    #[must_use]
    pub fn settings(&self) -> AcquisitionSettings {
        lock(&self.settings).clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut AcquisitionSettings)) {
        f(&mut lock(&self.settings));
    }

    /// The per-algorithm configuration, if one was given.
    #[must_use]
    pub const fn config(&self) -> Option<&Map<String, Value>> {
        self.config.as_ref()
    }

    pub fn transfer_register(&self) -> MutexGuard<'_, TransferRegister> {
        lock(&self.transfer_register)
    }

    #[must_use]
    pub fn raw_file_names(&self) -> Vec<String> {
        lock(&self.raw_file_names).clone()
    }

    #[must_use]
    pub fn downloaded_raw_file(&self) -> Option<PathBuf> {
        lock(&self.downloaded_raw_file).clone()
    }

    /// Make [`Self::wait_for_end_or_error`] end the acquisition with an error.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Route inbound messages until the acquisition ends.
    ///
    /// Scans go to the received-scan queue and raw file notifications to their
    /// slots. `AcquisitionEnded` ends the acquisition normally; an `Error`, an
    /// abort or a closed inbound queue end it with an error. Always returns with
    /// an ended status.
    pub fn wait_for_end_or_error(&self) {
        loop {
            if self.is_aborted() {
                self.finish(StatusInput::ErrorReceived);
                return;
            }
            match self.inbound.recv_timeout(POLL_INTERVAL) {
                Ok(AcqMessage::Scan(scan)) => {
                    // the receiver lives in self, so this cannot fail
                    let _ = self.scan_tx.send(scan);
                }
                Ok(AcqMessage::AcquisitionEnded) => {
                    self.finish(StatusInput::AcquisitionEnded);
                    return;
                }
                Ok(AcqMessage::Error(reason)) => {
                    error!(
                        "acquisition error: {}",
                        reason.as_deref().unwrap_or("no details")
                    );
                    self.finish(StatusInput::ErrorReceived);
                    return;
                }
                Ok(AcqMessage::RawFileNames(names)) => {
                    debug!("raw file names: {names:?}");
                    *lock(&self.raw_file_names) = names;
                }
                Ok(AcqMessage::RawFileDownloadFinished(path)) => {
                    match &path {
                        Some(path) => debug!("raw file downloaded to {}", path.display()),
                        None => warn!("no raw file was downloaded for the last acquisition"),
                    }
                    *lock(&self.downloaded_raw_file) = path;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("manager queue closed while the acquisition was running");
                    self.finish(StatusInput::ErrorReceived);
                    return;
                }
            }
        }
    }

    fn finish(&self, input: StatusInput) {
        if let Err(e) = self.advance(input) {
            let forced = if input == StatusInput::AcquisitionEnded {
                AcquisitionStatus::EndedNormal
            } else {
                AcquisitionStatus::EndedError
            };
            warn!("{e}, forcing status to {forced}");
            self.update_acquisition_status(forced);
        }
    }
}
