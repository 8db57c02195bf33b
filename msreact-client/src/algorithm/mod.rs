//! Algorithm definitions and the registry they are looked up in.
//!
//! An algorithm is an ordered list of acquisition steps. Each step names the
//! acquisition class, the instruments it can run on and how to build it. The
//! worker process rebuilds the acquisition from the algorithm name and step
//! index, so nothing but those two identifiers crosses the process boundary.

pub mod sequence;

use std::{collections::BTreeMap, fmt::Display, path::PathBuf, sync::Arc};

use tracing::warn;

use crate::{
    acquisition::Acquisition,
    command::ScanLevelRange,
    error::AcquisitionError,
    instruments::InstrumentModel,
};

/// Builds a fresh acquisition for one run of a step.
pub type AcquisitionFactory = Arc<dyn Fn() -> Box<dyn Acquisition> + Send + Sync>;

#[derive(Clone)]
pub struct AcquisitionStep {
    pub class_name: String,
    pub instruments: Vec<InstrumentModel>,
    pub factory: AcquisitionFactory,
    /// MS orders the mock server should emit during this step.
    pub scan_level: Option<ScanLevelRange>,
}

impl std::fmt::Debug for AcquisitionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionStep")
            .field("class_name", &self.class_name)
            .field("instruments", &self.instruments)
            .field("scan_level", &self.scan_level)
            .finish_non_exhaustive()
    }
}

impl AcquisitionStep {
    pub fn new<F>(
        class_name: impl Into<String>,
        instruments: &[InstrumentModel],
        factory: F,
    ) -> Self
    where
        F: Fn() -> Box<dyn Acquisition> + Send + Sync + 'static,
    {
        Self {
            class_name: class_name.into(),
            instruments: instruments.to_vec(),
            factory: Arc::new(factory),
            scan_level: None,
        }
    }

    #[must_use]
    pub fn with_scan_level(mut self, range: ScanLevelRange) -> Self {
        self.scan_level = Some(range);
        self
    }

    #[must_use]
    pub fn supports(&self, instrument: InstrumentModel) -> bool {
        self.instruments.contains(&instrument)
    }

    #[must_use]
    pub fn instantiate(&self) -> Box<dyn Acquisition> {
        (self.factory)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    /// Listed under `run`.
    Release,
    /// Listed under `proto`.
    Prototype,
}

impl Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Prototype => write!(f, "prototype"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlgorithmDefinition {
    pub name: String,
    pub kind: AlgorithmKind,
    pub steps: Vec<AcquisitionStep>,
    /// Used when the user gives no configuration file.
    pub default_config: Option<PathBuf>,
}

impl AlgorithmDefinition {
    pub fn new(name: impl Into<String>, kind: AlgorithmKind) -> Self {
        Self {
            name: name.into(),
            kind,
            steps: Vec::new(),
            default_config: None,
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: AcquisitionStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn with_default_config(mut self, path: PathBuf) -> Self {
        self.default_config = Some(path);
        self
    }

    /// # Errors
    /// [`AcquisitionError::UnknownStep`] if `index` is out of range.
    pub fn step(&self, index: usize) -> Result<&AcquisitionStep, AcquisitionError> {
        self.steps
            .get(index)
            .ok_or_else(|| AcquisitionError::UnknownStep {
                algorithm: self.name.clone(),
                index,
            })
    }

    /// Index of the first step running the given acquisition class.
    #[must_use]
    pub fn find_step(&self, class_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.class_name == class_name)
    }

    /// Every step once, in declaration order, with no overrides.
    #[must_use]
    pub fn default_plan(&self) -> Vec<PlannedStep> {
        (0..self.steps.len()).map(PlannedStep::new).collect()
    }
}

/// One entry of the run order: which step to run and the sequence file
/// overrides for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step_index: usize,
    pub raw_file_name: Option<String>,
    pub sample_name: Option<String>,
}

impl PlannedStep {
    #[must_use]
    pub const fn new(step_index: usize) -> Self {
        Self {
            step_index,
            raw_file_name: None,
            sample_name: None,
        }
    }
}

/// All algorithms known to this build, by name.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmRegistry {
    algorithms: BTreeMap<String, AlgorithmDefinition>,
}

impl AlgorithmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an algorithm, replacing one with the same name.
    pub fn register(&mut self, algorithm: AlgorithmDefinition) {
        if let Some(previous) = self.algorithms.insert(algorithm.name.clone(), algorithm) {
            warn!("algorithm {} registered twice, keeping the last one", previous.name);
        }
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&AlgorithmDefinition> {
        self.algorithms.get(name)
    }

    /// # Errors
    /// [`AcquisitionError::UnknownAlgorithm`] if nothing is registered as `name`.
    pub fn get(&self, name: &str) -> Result<&AlgorithmDefinition, AcquisitionError> {
        self.find(name).ok_or_else(|| AcquisitionError::UnknownAlgorithm {
            name: name.to_string(),
        })
    }

    /// Names of the algorithms of the given kind, sorted.
    #[must_use]
    pub fn names(&self, kind: AlgorithmKind) -> Vec<&str> {
        self.algorithms
            .values()
            .filter(|a| a.kind == kind)
            .map(|a| a.name.as_str())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::acquisition::{Acquisition, AcquisitionContext, HookResult};

    /// Does nothing but wait for the acquisition to end.
    pub struct Idle(pub &'static str);

    impl Acquisition for Idle {
        fn name(&self) -> &str {
            self.0
        }

        fn pre_acquisition(&mut self, _ctx: &AcquisitionContext) -> HookResult {
            Ok(())
        }

        fn intra_acquisition(&mut self, ctx: &AcquisitionContext) -> HookResult {
            while ctx.acquisition_status() == crate::AcquisitionStatus::Running {
                std::thread::sleep(crate::POLL_INTERVAL);
            }
            Ok(())
        }

        fn post_acquisition(&mut self, _ctx: &AcquisitionContext) -> HookResult {
            Ok(())
        }
    }
}

#[cfg(test)]
mod unit {
    use super::{
        test_support::Idle, AcquisitionStep, AlgorithmDefinition, AlgorithmKind, AlgorithmRegistry,
    };
    use crate::instruments::InstrumentModel;

    fn two_step() -> AlgorithmDefinition {
        AlgorithmDefinition::new("two_step", AlgorithmKind::Release)
            .with_step(AcquisitionStep::new("First", &[InstrumentModel::Mock], || {
                Box::new(Idle("First"))
            }))
            .with_step(AcquisitionStep::new("Second", &[InstrumentModel::Mock], || {
                Box::new(Idle("Second"))
            }))
    }

    #[test]
    fn steps_are_found_by_class_and_index() {
        let algorithm = two_step();
        assert_eq!(algorithm.find_step("Second"), Some(1));
        assert_eq!(algorithm.find_step("Third"), None);
        assert!(algorithm.step(1).is_ok());
        assert!(algorithm.step(2).is_err());
        assert_eq!(algorithm.step(0).expect("exists").instantiate().name(), "First");
        let plan: Vec<usize> = algorithm.default_plan().iter().map(|p| p.step_index).collect();
        assert_eq!(plan, vec![0, 1]);
    }

    #[test]
    fn registry_lists_by_kind() {
        let mut registry = AlgorithmRegistry::new();
        registry.register(two_step());
        registry.register(AlgorithmDefinition::new("experimental", AlgorithmKind::Prototype));
        assert_eq!(registry.names(AlgorithmKind::Release), vec!["two_step"]);
        assert_eq!(registry.names(AlgorithmKind::Prototype), vec!["experimental"]);
        assert!(registry.find("missing").is_none());
        assert!(registry.get("two_step").is_ok());
    }
}
