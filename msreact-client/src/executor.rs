//! Where an acquisition step runs: on a thread of this process or in a child
//! worker process.

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, instrument, warn};

use crate::{
    acquisition::runner::{run_step, AcquisitionReport, StepSpec},
    algorithm::AlgorithmRegistry,
    command::{AcqMessage, AcqRequest},
    error::ManagerError,
    ipc::{read_frame, write_frame},
    state_machine::AcquisitionStatus,
    worker::{WorkerArgs, EXIT_ENDED_NORMAL, EXIT_ENDED_WITH_ERROR, WORKER_SUBCOMMAND},
    POLL_INTERVAL,
};

/// One step of the run order, ready to be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepJob {
    pub algorithm: String,
    pub step_index: usize,
    /// Acquisition class name of the step, for reporting.
    pub class_name: String,
    pub spec: StepSpec,
}

/// Runs one step to completion, blocking the calling thread.
///
/// `inbound` and `outbound` are the manager's queues. They outlive the step.
pub trait AcquisitionExecutor: Send + Sync {
    /// # Errors
    /// [`ManagerError`] if the step could not be run to completion.
    fn execute(
        &self,
        job: &StepJob,
        inbound: &Receiver<AcqMessage>,
        outbound: &Sender<AcqRequest>,
    ) -> Result<AcquisitionReport, ManagerError>;
}

/// Runs steps on the calling thread. No isolation: a hung `intra_acquisition`
/// thread outlives the step.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    registry: Arc<AlgorithmRegistry>,
}

impl ThreadExecutor {
    #[must_use]
    pub const fn new(registry: Arc<AlgorithmRegistry>) -> Self {
        Self { registry }
    }
}

impl AcquisitionExecutor for ThreadExecutor {
    #[instrument(skip_all, fields(acquisition = %job.class_name))]
    fn execute(
        &self,
        job: &StepJob,
        inbound: &Receiver<AcqMessage>,
        outbound: &Sender<AcqRequest>,
    ) -> Result<AcquisitionReport, ManagerError> {
        let step = self.registry.get(&job.algorithm)?.step(job.step_index)?;
        Ok(run_step(step, &job.spec, inbound.clone(), outbound.clone())?)
    }
}

/// Runs each step in a fresh child process executing the hidden worker
/// subcommand of `program`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    /// `args` come before the worker subcommand, e.g. global options.
    pub fn new<I>(program: PathBuf, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// An executor re-running the current executable.
    ///
    /// # Errors
    /// An IO error if the path of the current executable is unknown.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, Vec::<OsString>::new()))
    }
}

impl AcquisitionExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(acquisition = %job.class_name))]
    fn execute(
        &self,
        job: &StepJob,
        inbound: &Receiver<AcqMessage>,
        outbound: &Sender<AcqRequest>,
    ) -> Result<AcquisitionReport, ManagerError> {
        let worker_args = WorkerArgs {
            algorithm: job.algorithm.clone(),
            step_index: job.step_index,
            spec: job.spec.clone(),
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(WORKER_SUBCOMMAND)
            .args(worker_args.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!("started worker process {}", child.id());

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(io::Error::other("worker stdio is not piped").into());
        };

        let stop = Arc::new(AtomicBool::new(false));
        let to_worker = {
            let inbound = inbound.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("worker_stdin".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match inbound.recv_timeout(POLL_INTERVAL) {
                            Ok(message) => {
                                if let Err(e) = write_frame(&mut stdin, &message) {
                                    debug!("worker stopped reading: {e}");
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })?
        };
        let from_worker = {
            let outbound = outbound.clone();
            thread::Builder::new()
                .name("worker_stdout".to_string())
                .spawn(move || loop {
                    match read_frame::<_, AcqRequest>(&mut stdout) {
                        Ok(Some(request)) => {
                            if outbound.send(request).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("unreadable message from worker: {e}");
                            break;
                        }
                    }
                })?
        };

        let status = child.wait()?;
        stop.store(true, Ordering::Release);
        if from_worker.join().is_err() || to_worker.join().is_err() {
            warn!("a worker pipe thread panicked");
        }
        debug!("worker process exited with {status}");

        let acquisition = job.class_name.clone();
        match status.code() {
            Some(EXIT_ENDED_NORMAL) => Ok(AcquisitionReport {
                acquisition,
                status: AcquisitionStatus::EndedNormal,
            }),
            Some(EXIT_ENDED_WITH_ERROR) => Ok(AcquisitionReport {
                acquisition,
                status: AcquisitionStatus::EndedError,
            }),
            code => Err(ManagerError::WorkerFailed { acquisition, code }),
        }
    }
}
