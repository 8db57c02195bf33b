//! `monitor`: listens to an acquisition started on the instrument and logs
//! every scan it sees.

use tracing::info;

use crate::{
    acquisition::{
        workflow::AcquisitionWorkflow, Acquisition, AcquisitionContext, HookResult,
    },
    algorithm::{AcquisitionStep, AlgorithmDefinition, AlgorithmKind},
    command::ScanLevelRange,
    instruments::InstrumentModel,
    state_machine::AcquisitionStatus,
};

pub const ALGORITHM_NAME: &str = "monitor";
pub const ACQUISITION_NAME: &str = "Monitor";
/// Transfer register key holding the number of scans seen.
pub const SCAN_COUNT_KEY: &str = "monitor_scan_count";

#[derive(Debug, Default)]
pub struct MonitorAcquisition {
    scans: u64,
}

impl MonitorAcquisition {
    #[must_use]
    pub const fn scans(&self) -> u64 {
        self.scans
    }
}

impl Acquisition for MonitorAcquisition {
    fn name(&self) -> &str {
        ACQUISITION_NAME
    }

    fn pre_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
        info!("Executing pre-acquisition steps");
        ctx.update_settings(|s| s.workflow = AcquisitionWorkflow::Listening);
        Ok(())
    }

    fn intra_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
        info!("Executing intra-acquisition steps");
        while ctx.acquisition_status() == AcquisitionStatus::Running || ctx.pending_scans() > 0 {
            let Some(scan) = ctx.fetch_received_scan() else {
                continue;
            };
            self.scans = self.scans.saturating_add(1);
            let number = scan
                .scan_number()
                .map_or_else(|| "?".to_string(), |n| n.to_string());
            let centroids = scan
                .centroid_count()
                .map_or_else(|| "?".to_string(), |n| n.to_string());
            info!("Received scan with scan number: {number} Centroid count: {centroids}");
        }
        info!("Finishing intra acquisition after {} scans", self.scans);
        Ok(())
    }

    fn post_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
        info!("Executing post-acquisition steps");
        ctx.transfer_register().set(SCAN_COUNT_KEY, self.scans);
        Ok(())
    }
}

#[must_use]
pub fn definition() -> AlgorithmDefinition {
    AlgorithmDefinition::new(ALGORITHM_NAME, AlgorithmKind::Release).with_step(
        AcquisitionStep::new(
            ACQUISITION_NAME,
            &[InstrumentModel::Mock, InstrumentModel::Tribrid],
            || Box::<MonitorAcquisition>::default(),
        )
        .with_scan_level(ScanLevelRange::new(1, 2)),
    )
}

#[cfg(test)]
mod unit {
    use std::sync::Arc;

    use crossbeam_channel::unbounded;
    use rmpv::Value;

    use super::{definition, MonitorAcquisition, SCAN_COUNT_KEY};
    use crate::{
        acquisition::{
            runner::{run_acquisition, RunnerOptions},
            workflow::AcquisitionWorkflow,
            AcquisitionContext,
        },
        command::{AcqMessage, AcqRequest},
        instruments::InstrumentModel,
        state_machine::AcquisitionStatus,
        transfer_register::TransferRegister,
    };

    fn scan(number: i64) -> AcqMessage {
        AcqMessage::Scan(
            Value::Map(vec![
                (Value::from("ScanNumber"), Value::from(number)),
                (Value::from("CentroidCount"), Value::from(100)),
            ])
            .into(),
        )
    }

    #[test]
    fn counts_every_scan_and_never_starts_the_instrument() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("register.json");
        let register = TransferRegister::create_default(&path).expect("should create");
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        for n in 1..=5 {
            in_tx.send(scan(n)).expect("queue open");
        }
        in_tx.send(AcqMessage::AcquisitionEnded).expect("queue open");

        let ctx = Arc::new(AcquisitionContext::new(in_rx, out_tx, register));
        let step = definition();
        let report = run_acquisition(
            step.steps[0].instantiate(),
            ctx,
            &RunnerOptions {
                scan_level: step.steps[0].scan_level,
                ..RunnerOptions::default()
            },
        )
        .expect("should run");

        assert_eq!(report.status, AcquisitionStatus::EndedNormal);
        let register = TransferRegister::load(&path).expect("should load");
        assert_eq!(register.get(SCAN_COUNT_KEY), Some(&serde_json::Value::from(5)));

        let ready = out_rx
            .try_iter()
            .find_map(|r| match r {
                AcqRequest::ReadyForAcquisitionStart(settings) => Some(settings),
                _ => None,
            })
            .expect("ready signal sent");
        assert_eq!(ready.workflow, AcquisitionWorkflow::Listening);
        assert!(!ready.workflow.is_acquisition_triggering());
    }

    #[test]
    fn runs_on_mock_and_tribrid_only() {
        let step = &definition().steps[0];
        assert!(step.supports(InstrumentModel::Mock));
        assert!(step.supports(InstrumentModel::Tribrid));
        assert!(!step.supports(InstrumentModel::Exploris));
        assert_eq!(MonitorAcquisition::default().scans(), 0);
    }
}
