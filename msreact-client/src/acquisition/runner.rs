//! Drives one acquisition through its lifecycle.
//!
//! The runner executes inside whatever hosts the acquisition, a worker process
//! or a blocking thread of the client, and only talks to the manager through
//! the context's queues.

use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, instrument, warn};

use crate::{
    acquisition::{Acquisition, AcquisitionContext, HookResult},
    algorithm::AcquisitionStep,
    command::{AcqMessage, AcqRequest, ScanLevelRange},
    config::load_algorithm_config,
    error::AcquisitionError,
    state_machine::{AcquisitionStatus, StatusInput},
    transfer_register::TransferRegister,
    POLL_INTERVAL,
};

pub const DEFAULT_INTRA_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// How long to wait for `intra_acquisition` to return once the acquisition
    /// has ended.
    pub intra_join_timeout: Duration,
    /// Sent before the ready signal when set.
    pub scan_level: Option<ScanLevelRange>,
    /// Sequence file overrides, applied after `pre_acquisition`.
    pub raw_file_name: Option<String>,
    pub sample_name: Option<String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            intra_join_timeout: DEFAULT_INTRA_JOIN_TIMEOUT,
            scan_level: None,
            raw_file_name: None,
            sample_name: None,
        }
    }
}

/// The outcome of an acquisition that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub acquisition: String,
    /// Either [`AcquisitionStatus::EndedNormal`] or [`AcquisitionStatus::EndedError`].
    pub status: AcquisitionStatus,
}

impl AcquisitionReport {
    #[must_use]
    pub fn ended_normally(&self) -> bool {
        self.status == AcquisitionStatus::EndedNormal
    }
}

fn run_hook(hook: &'static str, f: impl FnOnce() -> HookResult) -> Result<(), AcquisitionError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AcquisitionError::HookFailed {
            hook,
            details: e.to_string(),
        }),
        Err(_) => Err(AcquisitionError::HookPanicked { hook }),
    }
}

/// Wait for `handle` to finish, giving up after `timeout`. A thread that is
/// given up on is left detached.
fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> Result<T, AcquisitionError> {
    let started = Instant::now();
    while !handle.is_finished() {
        if started.elapsed() >= timeout {
            return Err(AcquisitionError::IntraAcquisitionTimeout { timeout });
        }
        thread::sleep(POLL_INTERVAL);
    }
    handle.join().map_err(|_| AcquisitionError::HookPanicked {
        hook: "intra_acquisition",
    })
}

/// Run `acquisition` from `Idle` to `PostAcquisition`.
///
/// 1. `pre_acquisition`, then the status becomes `Running`
/// 2. the scan level (if any) and the ready signal are sent, once
/// 3. `intra_acquisition` starts on its own thread
/// 4. this thread routes inbound messages until the acquisition ends
/// 5. the intra thread is joined with [`RunnerOptions::intra_join_timeout`]
/// 6. `post_acquisition` runs and the transfer register is saved
///
/// # Errors
/// - [`AcquisitionError::HookFailed`] or [`AcquisitionError::HookPanicked`] if
///   a hook fails
/// - [`AcquisitionError::IntraAcquisitionTimeout`] if the intra thread does
///   not return in time
/// - [`AcquisitionError::TransferRegister`] if the register cannot be saved
#[instrument(skip_all, fields(acquisition = acquisition.name()))]
pub fn run_acquisition(
    mut acquisition: Box<dyn Acquisition>,
    ctx: Arc<AcquisitionContext>,
    options: &RunnerOptions,
) -> Result<AcquisitionReport, AcquisitionError> {
    let name = acquisition.name().to_string();

    ctx.advance(StatusInput::ProcessStarted)?;
    info!("running pre acquisition");
    run_hook("pre_acquisition", || acquisition.pre_acquisition(&ctx))?;

    ctx.update_settings(|s| {
        if let Some(raw) = &options.raw_file_name {
            s.raw_file_name.clone_from(raw);
        }
        if let Some(sample) = &options.sample_name {
            s.sample_name.clone_from(sample);
        }
    });
    ctx.advance(StatusInput::PreAcquisitionDone)?;

    if let Some(range) = options.scan_level {
        ctx.set_scan_level(range);
    }
    info!("signal \"ready for acquisition\"");
    ctx.signal_ready_for_acquisition();

    info!("starting intra acquisition thread");
    let intra_ctx = Arc::clone(&ctx);
    let intra = thread::Builder::new()
        .name("intra_acquisition".to_string())
        .spawn(move || {
            let result = run_hook("intra_acquisition", || {
                acquisition.intra_acquisition(&intra_ctx)
            });
            if let Err(e) = &result {
                error!("{e}");
                intra_ctx.signal_error_to_runner(e.to_string());
                intra_ctx.abort();
            }
            (acquisition, result)
        })?;

    ctx.wait_for_end_or_error();
    let status = ctx.acquisition_status();
    info!("acquisition {status}, waiting for intra acquisition");

    let joined = join_with_timeout(intra, options.intra_join_timeout);
    if let Err(e) = &joined {
        warn!("abandoning intra acquisition thread: {e}");
    }
    let (mut acquisition, intra_result) = joined?;
    intra_result?;

    ctx.advance(StatusInput::PostAcquisitionStarted)?;
    info!("running post acquisition");
    run_hook("post_acquisition", || acquisition.post_acquisition(&ctx))?;
    ctx.transfer_register().save()?;

    Ok(AcquisitionReport {
        acquisition: name,
        status,
    })
}

/// Everything a host needs, besides the step itself, to run one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub config_path: Option<PathBuf>,
    pub transfer_register: PathBuf,
    pub raw_file_name: Option<String>,
    pub sample_name: Option<String>,
    pub intra_join_timeout: Duration,
}

/// Build the acquisition of `step` and run it against the given queues.
///
/// # Errors
/// - [`AcquisitionError::Config`] if the algorithm configuration cannot be loaded
/// - [`AcquisitionError::TransferRegister`] if the register cannot be loaded
/// - anything [`run_acquisition`] returns
pub fn run_step(
    step: &AcquisitionStep,
    spec: &StepSpec,
    inbound: Receiver<AcqMessage>,
    outbound: Sender<AcqRequest>,
) -> Result<AcquisitionReport, AcquisitionError> {
    let config = load_algorithm_config(spec.config_path.as_deref())?;
    let register = TransferRegister::load(&spec.transfer_register)?;
    let ctx = AcquisitionContext::new(inbound, outbound, register).with_config(config);
    let options = RunnerOptions {
        intra_join_timeout: spec.intra_join_timeout,
        scan_level: step.scan_level,
        raw_file_name: spec.raw_file_name.clone(),
        sample_name: spec.sample_name.clone(),
    };
    run_acquisition(step.instantiate(), Arc::new(ctx), &options)
}

#[cfg(test)]
mod unit {
    use std::{path::PathBuf, sync::Arc, thread, time::Duration};

    use assert_matches::assert_matches;
    use crossbeam_channel::{unbounded, Receiver, Sender};

    use super::{run_acquisition, RunnerOptions};
    use crate::{
        acquisition::{
            workflow::AcquisitionWorkflow, Acquisition, AcquisitionContext, HookResult,
        },
        command::{AcqMessage, AcqRequest, ScanLevelRange},
        error::AcquisitionError,
        state_machine::AcquisitionStatus,
        transfer_register::TransferRegister,
    };

    #[derive(Default)]
    struct Counting {
        scans: usize,
        status_at_intra_start: Option<AcquisitionStatus>,
        fail_intra: bool,
        hang_intra: bool,
    }

    impl Acquisition for Counting {
        fn name(&self) -> &str {
            "Counting"
        }

        fn pre_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
            ctx.update_settings(|s| s.workflow = AcquisitionWorkflow::Permanent);
            Ok(())
        }

        fn intra_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
            self.status_at_intra_start = Some(ctx.acquisition_status());
            if self.fail_intra {
                return Err("intra failed".into());
            }
            if self.hang_intra {
                thread::sleep(Duration::from_secs(5));
            }
            while ctx.acquisition_status() == AcquisitionStatus::Running
                || ctx.pending_scans() > 0
            {
                if ctx.fetch_received_scan().is_some() {
                    self.scans = self.scans.saturating_add(1);
                }
            }
            Ok(())
        }

        fn post_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
            ctx.transfer_register().set("scans", self.scans);
            Ok(())
        }
    }

    fn context(
        dir: &tempfile::TempDir,
    ) -> (Arc<AcquisitionContext>, Sender<AcqMessage>, Receiver<AcqRequest>, PathBuf) {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let path = dir.path().join("register.json");
        let register = TransferRegister::create_default(&path).expect("should create register");
        (
            Arc::new(AcquisitionContext::new(in_rx, out_tx, register)),
            in_tx,
            out_rx,
            path,
        )
    }

    #[test]
    fn full_lifecycle_persists_register() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (ctx, inbound, outbound, path) = context(&dir);
        for _ in 0..4 {
            inbound
                .send(AcqMessage::Scan(rmpv::Value::Nil.into()))
                .expect("queue open");
        }
        inbound.send(AcqMessage::AcquisitionEnded).expect("queue open");

        let options = RunnerOptions {
            scan_level: Some(ScanLevelRange::new(1, 2)),
            raw_file_name: Some("run_01".to_string()),
            ..RunnerOptions::default()
        };
        let report = run_acquisition(Box::<Counting>::default(), Arc::clone(&ctx), &options)
            .expect("should run");

        assert_eq!(report.status, AcquisitionStatus::EndedNormal);
        assert_eq!(ctx.acquisition_status(), AcquisitionStatus::PostAcquisition);
        let register = TransferRegister::load(&path).expect("should load");
        assert_eq!(register.get("scans"), Some(&serde_json::Value::from(4)));

        let sent: Vec<AcqRequest> = outbound.try_iter().collect();
        assert_eq!(sent[0], AcqRequest::SetScanLevel(ScanLevelRange::new(1, 2)));
        assert_matches!(
            &sent[1],
            AcqRequest::ReadyForAcquisitionStart(s)
                if s.workflow == AcquisitionWorkflow::Permanent && s.raw_file_name == "run_01"
        );
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn error_message_reports_ended_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (ctx, inbound, _outbound, _path) = context(&dir);
        inbound
            .send(AcqMessage::Error(Some("lost".to_string())))
            .expect("queue open");

        let report = run_acquisition(Box::<Counting>::default(), ctx, &RunnerOptions::default())
            .expect("should run");
        assert_eq!(report.status, AcquisitionStatus::EndedError);
        assert!(!report.ended_normally());
    }

    #[test]
    fn failing_intra_aborts_the_acquisition() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (ctx, _inbound, outbound, _path) = context(&dir);
        let acquisition = Box::new(Counting {
            fail_intra: true,
            ..Counting::default()
        });

        let result = run_acquisition(acquisition, Arc::clone(&ctx), &RunnerOptions::default());
        assert_matches!(
            result,
            Err(AcquisitionError::HookFailed {
                hook: "intra_acquisition",
                ..
            })
        );
        assert_eq!(ctx.acquisition_status(), AcquisitionStatus::EndedError);
        assert!(outbound
            .try_iter()
            .any(|r| matches!(r, AcqRequest::Error(m) if m.contains("intra failed"))));
    }

    #[test]
    fn hung_intra_is_abandoned_after_timeout() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (ctx, inbound, _outbound, _path) = context(&dir);
        inbound.send(AcqMessage::AcquisitionEnded).expect("queue open");
        let acquisition = Box::new(Counting {
            hang_intra: true,
            ..Counting::default()
        });
        let options = RunnerOptions {
            intra_join_timeout: Duration::from_millis(50),
            ..RunnerOptions::default()
        };

        assert_matches!(
            run_acquisition(acquisition, ctx, &options),
            Err(AcquisitionError::IntraAcquisitionTimeout { .. })
        );
    }

    struct Panicking;

    impl Acquisition for Panicking {
        fn name(&self) -> &str {
            "Panicking"
        }

        fn pre_acquisition(&mut self, _ctx: &AcquisitionContext) -> HookResult {
            panic!("bad algorithm");
        }

        fn intra_acquisition(&mut self, _ctx: &AcquisitionContext) -> HookResult {
            Ok(())
        }

        fn post_acquisition(&mut self, _ctx: &AcquisitionContext) -> HookResult {
            Ok(())
        }
    }

    #[test]
    fn panicking_hook_is_reported() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let (ctx, _inbound, outbound, _path) = context(&dir);
        assert_matches!(
            run_acquisition(Box::new(Panicking), ctx, &RunnerOptions::default()),
            Err(AcquisitionError::HookPanicked {
                hook: "pre_acquisition"
            })
        );
        // the instrument was never told to start
        assert_eq!(outbound.try_iter().count(), 0);
    }
}
