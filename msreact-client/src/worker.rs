//! Entry point of an acquisition worker process.
//!
//! The parent writes [`AcqMessage`] frames to the worker's stdin and reads
//! [`AcqRequest`] frames from its stdout (see [`crate::ipc`]). Log events of the
//! worker travel the same way as [`AcqRequest::Log`]. The exit code tells the
//! parent how the acquisition ended.

use std::{
    ffi::OsString,
    io::{Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, instrument};

use crate::{
    acquisition::runner::{run_step, AcquisitionReport, StepSpec},
    algorithm::AlgorithmRegistry,
    command::{AcqMessage, AcqRequest},
    error::AcquisitionError,
    ipc::{read_frame, write_frame},
    log_forward::ForwardingLayer,
    POLL_INTERVAL,
};

/// Name of the hidden CLI subcommand that runs a worker.
pub const WORKER_SUBCOMMAND: &str = "acquisition-worker";

/// The acquisition ended normally.
pub const EXIT_ENDED_NORMAL: i32 = exitcode::OK;
/// The acquisition ran but ended with an error.
pub const EXIT_ENDED_WITH_ERROR: i32 = exitcode::UNAVAILABLE;
/// The acquisition could not be run to completion.
pub const EXIT_FAILURE: i32 = exitcode::SOFTWARE;

/// Argument names of the worker subcommand.
pub mod arg {
    pub const ALGORITHM: &str = "algorithm";
    pub const STEP: &str = "step";
    pub const CONFIG: &str = "config";
    pub const TRANSFER_REGISTER: &str = "transfer-register";
    pub const RAW_FILE_NAME: &str = "raw-file-name";
    pub const SAMPLE_NAME: &str = "sample-name";
    pub const INTRA_JOIN_TIMEOUT_MS: &str = "intra-join-timeout-ms";
}

/// Everything a worker needs to rebuild and run one acquisition step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub algorithm: String,
    pub step_index: usize,
    pub spec: StepSpec,
}

impl WorkerArgs {
    /// Command line arguments following [`WORKER_SUBCOMMAND`].
    #[must_use]
    pub fn to_args(&self) -> Vec<OsString> {
        let flag = |name: &str| OsString::from(format!("--{name}"));
        let mut args = vec![
            flag(arg::ALGORITHM),
            OsString::from(&self.algorithm),
            flag(arg::STEP),
            OsString::from(self.step_index.to_string()),
            flag(arg::TRANSFER_REGISTER),
            self.spec.transfer_register.clone().into_os_string(),
            flag(arg::INTRA_JOIN_TIMEOUT_MS),
            OsString::from(self.spec.intra_join_timeout.as_millis().to_string()),
        ];
        if let Some(config) = &self.spec.config_path {
            args.push(flag(arg::CONFIG));
            args.push(config.clone().into_os_string());
        }
        if let Some(raw) = &self.spec.raw_file_name {
            args.push(flag(arg::RAW_FILE_NAME));
            args.push(OsString::from(raw));
        }
        if let Some(sample) = &self.spec.sample_name {
            args.push(flag(arg::SAMPLE_NAME));
            args.push(OsString::from(sample));
        }
        args
    }

    /// Counterpart of [`Self::to_args`] for already parsed values.
    #[must_use]
    pub fn new(
        algorithm: String,
        step_index: usize,
        transfer_register: PathBuf,
        intra_join_timeout_ms: u64,
    ) -> Self {
        Self {
            algorithm,
            step_index,
            spec: StepSpec {
                config_path: None,
                transfer_register,
                raw_file_name: None,
                sample_name: None,
                intra_join_timeout: Duration::from_millis(intra_join_timeout_ms),
            },
        }
    }
}

/// Map how a step ended to the worker's exit code.
#[must_use]
pub fn exit_code(result: &Result<AcquisitionReport, AcquisitionError>) -> i32 {
    match result {
        Ok(report) if report.ended_normally() => EXIT_ENDED_NORMAL,
        Ok(_) => EXIT_ENDED_WITH_ERROR,
        Err(_) => EXIT_FAILURE,
    }
}

/// The outbound side of a worker: every request, including log records, is
/// queued here and written to the parent by a dedicated thread.
#[derive(Debug)]
pub struct Worker {
    outbound_tx: Sender<AcqRequest>,
    outbound_rx: Receiver<AcqRequest>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    #[must_use]
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = unbounded();
        Self {
            outbound_tx,
            outbound_rx,
        }
    }

    /// A layer to install as the worker's only log output.
    #[must_use]
    pub fn log_layer(&self) -> ForwardingLayer {
        ForwardingLayer::new(self.outbound_tx.clone())
    }

    /// Run the step and return the process exit code.
    #[instrument(skip_all, fields(algorithm = %args.algorithm, step = args.step_index))]
    pub fn run<R, W>(
        self,
        registry: &AlgorithmRegistry,
        args: &WorkerArgs,
        input: R,
        output: W,
    ) -> i32
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let writer = spawn_writer(self.outbound_rx, output, Arc::clone(&done));
        let (inbound_tx, inbound_rx) = unbounded();
        if let Err(e) = spawn_reader(input, inbound_tx) {
            error!("unable to start the worker reader: {e}");
            return EXIT_FAILURE;
        }

        let result = registry
            .get(&args.algorithm)
            .and_then(|algorithm| algorithm.step(args.step_index))
            .and_then(|step| run_step(step, &args.spec, inbound_rx, self.outbound_tx.clone()));
        match &result {
            Ok(report) => info!("{} finished: {}", report.acquisition, report.status),
            Err(e) => error!("acquisition failed: {e}"),
        }
        let code = exit_code(&result);

        drop(self.outbound_tx);
        done.store(true, Ordering::Release);
        match writer {
            Ok(writer) => {
                let _ = writer.join();
            }
            Err(e) => error!("unable to start the worker writer: {e}"),
        }
        code
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut input: R,
    inbound: Sender<AcqMessage>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("worker_reader".to_string())
        .spawn(move || loop {
            match read_frame::<_, AcqMessage>(&mut input) {
                Ok(Some(message)) => {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("unreadable message from the manager: {e}");
                    break;
                }
            }
        })
}

/// Must not log per message: its own log records land in the queue it drains.
fn spawn_writer<W: Write + Send + 'static>(
    outbound: Receiver<AcqRequest>,
    mut output: W,
    done: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("worker_writer".to_string())
        .spawn(move || loop {
            match outbound.recv_timeout(POLL_INTERVAL) {
                Ok(request) => {
                    if write_frame(&mut output, &request).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
}

#[cfg(test)]
mod unit {
    use std::{
        io::{Cursor, Write},
        sync::{Arc, Mutex},
    };

    use super::{Worker, WorkerArgs, EXIT_ENDED_NORMAL, EXIT_ENDED_WITH_ERROR, EXIT_FAILURE};
    use crate::{
        algorithm::{
            test_support::Idle, AcquisitionStep, AlgorithmDefinition, AlgorithmKind,
            AlgorithmRegistry,
        },
        command::{AcqMessage, AcqRequest},
        instruments::InstrumentModel,
        ipc::{read_frame, write_frame},
        transfer_register::TransferRegister,
    };

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("not poisoned").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn registry() -> AlgorithmRegistry {
        let mut registry = AlgorithmRegistry::new();
        registry.register(
            AlgorithmDefinition::new("idle", AlgorithmKind::Release).with_step(
                AcquisitionStep::new("Idle", &[InstrumentModel::Mock], || Box::new(Idle("Idle"))),
            ),
        );
        registry
    }

    fn run(args: &WorkerArgs, inbound: &[AcqMessage]) -> (i32, Vec<AcqRequest>) {
        let mut input = Vec::new();
        for m in inbound {
            write_frame(&mut input, m).expect("should write");
        }
        let output = SharedBuf::default();
        let code = Worker::new().run(&registry(), args, Cursor::new(input), output.clone());

        let bytes = output.0.lock().expect("not poisoned").clone();
        let mut reader = Cursor::new(bytes);
        let mut requests = Vec::new();
        while let Some(r) = read_frame(&mut reader).expect("valid frames") {
            requests.push(r);
        }
        (code, requests)
    }

    fn args(dir: &tempfile::TempDir, step: usize) -> WorkerArgs {
        let register = dir.path().join("register.json");
        TransferRegister::create_default(&register).expect("should create");
        WorkerArgs::new("idle".to_string(), step, register, 1000)
    }

    #[test]
    fn normal_end_exits_ok_and_reports_ready() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (code, requests) = run(&args(&dir, 0), &[AcqMessage::AcquisitionEnded]);
        assert_eq!(code, EXIT_ENDED_NORMAL);
        assert!(requests
            .iter()
            .any(|r| matches!(r, AcqRequest::ReadyForAcquisitionStart(_))));
    }

    #[test]
    fn error_end_has_its_own_exit_code() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (code, _) = run(&args(&dir, 0), &[AcqMessage::Error(None)]);
        assert_eq!(code, EXIT_ENDED_WITH_ERROR);
    }

    #[test]
    fn closed_stdin_ends_with_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (code, _) = run(&args(&dir, 0), &[]);
        assert_eq!(code, EXIT_ENDED_WITH_ERROR);
    }

    #[test]
    fn unknown_step_is_a_failure() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (code, requests) = run(&args(&dir, 3), &[AcqMessage::AcquisitionEnded]);
        assert_eq!(code, EXIT_FAILURE);
        assert!(requests.is_empty());
    }

    #[test]
    fn args_render_every_option() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let mut args = args(&dir, 1);
        args.spec.raw_file_name = Some("run_02".to_string());
        let rendered: Vec<String> = args
            .to_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered[0..4], ["--algorithm", "idle", "--step", "1"]);
        assert!(rendered.contains(&"--intra-join-timeout-ms".to_string()));
        assert!(rendered.ends_with(&["--raw-file-name".to_string(), "run_02".to_string()]));
        assert!(!rendered.contains(&"--config".to_string()));
    }
}
