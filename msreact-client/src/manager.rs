//! The algorithm manager: selects an algorithm, runs its acquisition steps one
//! after the other and relays traffic between the steps and the network side.
//!
//! Scans and control messages for the running step go through one shared
//! inbound queue. Requests of the step come back through one shared outbound
//! queue, drained by an async task that hands them to an
//! [`AcquisitionRequestHandler`]. Both queues are reused across steps.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    acquisition::runner::{StepSpec, DEFAULT_INTRA_JOIN_TIMEOUT},
    algorithm::{sequence::load_sequence, AlgorithmKind, AlgorithmRegistry, PlannedStep},
    command::{AcqMessage, AcqRequest},
    config::{validate_config_path, ClientConfig},
    error::{AlgorithmSelectionError, ManagerError},
    executor::{AcquisitionExecutor, StepJob},
    instruments::InstrumentModel,
    scan::Scan,
    transfer_register::{self, TransferRegister},
    POLL_INTERVAL,
};

/// Upper bound on acquisition workers alive at the same time. Steps run one at
/// a time, the headroom covers a worker that is still shutting down.
pub const MAX_WORKERS: usize = 3;

/// Executes the requests of the running acquisition, e.g. by sending commands
/// to the instrument server.
#[async_trait]
pub trait AcquisitionRequestHandler: Send + Sync {
    async fn handle_request(&self, request: AcqRequest);
}

/// The inbound and outbound queues of the manager.
#[derive(Debug, Clone)]
pub struct AcquisitionQueues {
    inbound_tx: Sender<AcqMessage>,
    inbound_rx: Receiver<AcqMessage>,
    outbound_tx: Sender<AcqRequest>,
    outbound_rx: Receiver<AcqRequest>,
}

impl Default for AcquisitionQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionQueues {
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }

    /// A handle that feeds the inbound queue.
    #[must_use]
    pub fn relay(&self) -> AcquisitionRelay {
        AcquisitionRelay {
            inbound: self.inbound_tx.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_inbound(&self) -> Vec<AcqMessage> {
        self.inbound_rx.try_iter().collect()
    }

    /// Drop everything left over from a previous step.
    fn flush_inbound(&self) -> usize {
        self.inbound_rx.try_iter().count()
    }
}

/// Puts instrument events and command results on the inbound queue of the
/// running acquisition. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AcquisitionRelay {
    inbound: Sender<AcqMessage>,
}

impl AcquisitionRelay {
    fn put(&self, message: AcqMessage) {
        // the manager owns a receiver for as long as it lives
        if self.inbound.send(message).is_err() {
            debug!("acquisition manager is gone, message dropped");
        }
    }

    /// The instrument finished the acquisition.
    pub fn acquisition_ended(&self) {
        self.put(AcqMessage::AcquisitionEnded);
    }

    pub fn deliver_scan(&self, scan: Scan) {
        self.put(AcqMessage::Scan(scan));
    }

    /// The server or another part of the client failed.
    pub fn instrument_error(&self, message: Option<String>) {
        self.put(AcqMessage::Error(message));
    }

    pub fn received_raw_file_names(&self, names: Vec<String>) {
        self.put(AcqMessage::RawFileNames(names));
    }

    pub fn acquisition_file_download_finished(&self, path: Option<PathBuf>) {
        self.put(AcqMessage::RawFileDownloadFinished(path));
    }
}

/// Run-wide settings of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub transfer_register: PathBuf,
    pub intra_join_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            transfer_register: PathBuf::from(transfer_register::DEFAULT_FILE_NAME),
            intra_join_timeout: DEFAULT_INTRA_JOIN_TIMEOUT,
        }
    }
}

impl From<&ClientConfig> for ManagerSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            transfer_register: config.transfer_register.clone(),
            intra_join_timeout: config.intra_join_timeout(),
        }
    }
}

/// Stops a run from another task: the running step is told that an error
/// occurred and no further step is started.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    relay: AcquisitionRelay,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.relay
            .instrument_error(Some("acquisition interrupted".to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectedAlgorithm {
    name: String,
    config_path: Option<PathBuf>,
    plan: Vec<PlannedStep>,
}

pub struct AlgorithmManager {
    registry: Arc<AlgorithmRegistry>,
    executor: Arc<dyn AcquisitionExecutor>,
    handler: Arc<dyn AcquisitionRequestHandler>,
    queues: AcquisitionQueues,
    settings: ManagerSettings,
    workers: Arc<Semaphore>,
    listening: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    selected: Option<SelectedAlgorithm>,
}

impl std::fmt::Debug for AlgorithmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmManager")
            .field("settings", &self.settings)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl AlgorithmManager {
    pub fn new(
        registry: Arc<AlgorithmRegistry>,
        executor: Arc<dyn AcquisitionExecutor>,
        handler: Arc<dyn AcquisitionRequestHandler>,
        queues: AcquisitionQueues,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            executor,
            handler,
            queues,
            settings,
            workers: Arc::new(Semaphore::new(MAX_WORKERS)),
            listening: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            selected: None,
        }
    }

    #[must_use]
    pub fn relay(&self) -> AcquisitionRelay {
        self.queues.relay()
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            relay: self.queues.relay(),
        }
    }

    /// Names of the registered algorithms of `kind`.
    #[must_use]
    pub fn algorithm_names(&self, kind: AlgorithmKind) -> Vec<&str> {
        self.registry.names(kind)
    }

    /// Name of the selected algorithm, if any.
    #[must_use]
    pub fn selected_algorithm(&self) -> Option<&str> {
        self.selected.as_ref().map(|s| s.name.as_str())
    }

    /// Select the algorithm to run. Failures are logged and give `false`.
    ///
    /// An invalid `config_path` falls back to the algorithm's default
    /// configuration. A `sequence` file replaces the declared step order.
    #[instrument(skip(self))]
    pub fn select_algorithm(
        &mut self,
        name: &str,
        config_path: Option<&Path>,
        instrument: &str,
        sequence: Option<&Path>,
    ) -> bool {
        info!("Selecting algorithm {name}");
        match self.try_select(name, config_path, instrument, sequence) {
            Ok(selected) => {
                debug!("selected {selected:?}");
                self.selected = Some(selected);
                true
            }
            Err(e) => {
                error!("{e}");
                self.selected = None;
                false
            }
        }
    }

    fn try_select(
        &self,
        name: &str,
        config_path: Option<&Path>,
        instrument: &str,
        sequence: Option<&Path>,
    ) -> Result<SelectedAlgorithm, AlgorithmSelectionError> {
        let algorithm =
            self.registry
                .find(name)
                .ok_or_else(|| AlgorithmSelectionError::UnknownAlgorithm {
                    name: name.to_string(),
                })?;

        let model = instrument.parse::<InstrumentModel>().ok();
        if let Some(step) = algorithm
            .steps
            .iter()
            .find(|s| !model.is_some_and(|m| s.supports(m)))
        {
            return Err(AlgorithmSelectionError::InstrumentMismatch {
                algorithm: algorithm.name.clone(),
                step: step.class_name.clone(),
                instrument: instrument.to_string(),
            });
        }

        let config_path = match config_path {
            Some(path) => match validate_config_path(path) {
                Ok(()) => Some(path.to_path_buf()),
                Err(e) => {
                    warn!("{e}, using the default configuration of {name}");
                    algorithm.default_config.clone()
                }
            },
            None => algorithm.default_config.clone(),
        };

        let plan = match sequence {
            Some(path) => load_sequence(algorithm, path)?,
            None => algorithm.default_plan(),
        };

        Ok(SelectedAlgorithm {
            name: algorithm.name.clone(),
            config_path,
            plan,
        })
    }

    /// Run every step of the selected algorithm in order. Returns `false` if no
    /// algorithm is selected or a step failed or ended with an error, in which
    /// case the remaining steps are skipped.
    ///
    /// Every request produced by the steps has been handed to the request
    /// handler when this returns.
    #[instrument(skip(self))]
    pub async fn run_algorithm(&self) -> bool {
        let Some(selected) = &self.selected else {
            error!("{}", ManagerError::NoAlgorithmSelected);
            return false;
        };

        self.listening.store(false, Ordering::Release);
        let drain = self.spawn_drain();

        let result = self.execute_algorithm(selected).await;
        match &result {
            Ok(()) => info!("Algorithm execution ended"),
            Err(e) => {
                error!("algorithm {} aborted: {e}", selected.name);
                TransferRegister::remove(&self.settings.transfer_register);
            }
        }

        self.listening.store(true, Ordering::Release);
        if let Err(e) = drain.await {
            error!("acquisition request relay failed: {e}");
        }
        result.is_ok()
    }

    async fn execute_algorithm(&self, selected: &SelectedAlgorithm) -> Result<(), ManagerError> {
        TransferRegister::create_default(&self.settings.transfer_register)?;

        for (number, planned) in (1..).zip(&selected.plan) {
            info!("Running acquisition sequence: {number}");
            let flushed = self.queues.flush_inbound();
            if flushed > 0 {
                debug!("dropped {flushed} stale inbound message(s)");
            }
            // checked after the flush so a stop request is never lost
            if self.stopped.load(Ordering::Acquire) {
                return Err(ManagerError::Interrupted);
            }

            let step = self
                .registry
                .get(&selected.name)?
                .step(planned.step_index)?;
            let job = StepJob {
                algorithm: selected.name.clone(),
                step_index: planned.step_index,
                class_name: step.class_name.clone(),
                spec: StepSpec {
                    config_path: selected.config_path.clone(),
                    transfer_register: self.settings.transfer_register.clone(),
                    raw_file_name: planned.raw_file_name.clone(),
                    sample_name: planned.sample_name.clone(),
                    intra_join_timeout: self.settings.intra_join_timeout,
                },
            };

            let permit = Arc::clone(&self.workers).acquire_owned().await?;
            let executor = Arc::clone(&self.executor);
            let inbound = self.queues.inbound_rx.clone();
            let outbound = self.queues.outbound_tx.clone();
            let report = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                executor.execute(&job, &inbound, &outbound)
            })
            .await??;

            if !report.ended_normally() {
                return Err(ManagerError::EndedWithError {
                    acquisition: report.acquisition,
                });
            }
            info!("{} ended normally", report.acquisition);
        }
        Ok(())
    }

    /// Forward outbound requests until the queue is empty and the run is over.
    /// Log records of worker processes are emitted here instead of forwarded.
    fn spawn_drain(&self) -> JoinHandle<()> {
        let outbound = self.queues.outbound_rx.clone();
        let handler = Arc::clone(&self.handler);
        let listening = Arc::clone(&self.listening);
        tokio::spawn(async move {
            debug!("acquisition request relay started");
            loop {
                match outbound.try_recv() {
                    Ok(AcqRequest::Log(record)) => record.emit(),
                    Ok(request) => {
                        debug!("relaying {}", request.id());
                        handler.handle_request(request).await;
                    }
                    Err(TryRecvError::Empty) => {
                        if listening.load(Ordering::Acquire) {
                            break;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            }
            debug!("acquisition request relay exited");
        })
    }
}
