//! Shared fixtures for preflight BDD scenarios.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use nodeprep::preflight::{Check, CheckError, CheckGroup};
use nodeprep::test_support::MemoryConfig;
use nodeprep::{ExecutionEngine, PreflightReport, RunMode};
use rstest::fixture;

/// How a scripted check behaves when probed, fixed, or cleaned up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Behaviour {
    Healthy,
    Fixable,
    IneffectiveFix,
    Unfixable,
    Cleanup { succeeds: bool },
}

#[derive(Debug)]
pub struct ScriptedCheck {
    pub id: String,
    pub behaviour: Behaviour,
    ready: Cell<bool>,
    pub probes: Cell<usize>,
    pub cleanups: Cell<usize>,
}

impl ScriptedCheck {
    fn new(id: &str, behaviour: Behaviour) -> Self {
        Self {
            id: id.to_owned(),
            behaviour,
            ready: Cell::new(behaviour == Behaviour::Healthy),
            probes: Cell::new(0),
            cleanups: Cell::new(0),
        }
    }

    fn probe(&self) -> Result<(), CheckError> {
        self.probes.set(self.probes.get() + 1);
        if self.ready.get() {
            Ok(())
        } else {
            Err(CheckError::precondition(format!("{} is not ready", self.id)))
        }
    }

    fn build(&self) -> Check<'_> {
        let description = format!("Checking {}", self.id);
        match self.behaviour {
            Behaviour::Cleanup { succeeds } => Check::cleanup_only(
                CheckGroup::Network,
                &self.id,
                format!("Removing {}", self.id),
                move || {
                    self.cleanups.set(self.cleanups.get() + 1);
                    if succeeds {
                        Ok(())
                    } else {
                        Err(CheckError::precondition(format!("{} could not be removed", self.id)))
                    }
                },
            ),
            Behaviour::Healthy | Behaviour::Fixable => {
                Check::new(CheckGroup::Services, &self.id, description, move || self.probe())
                    .with_fix(format!("Repairing {}", self.id), move || {
                        self.ready.set(true);
                        Ok(())
                    })
            }
            Behaviour::IneffectiveFix => {
                Check::new(CheckGroup::Services, &self.id, description, move || self.probe())
                    .with_fix(format!("Repairing {}", self.id), || Ok(()))
            }
            Behaviour::Unfixable => {
                Check::new(CheckGroup::Services, &self.id, description, move || self.probe())
                    .no_fix(format!("{} must be repaired by hand", self.id))
            }
        }
    }
}

/// State threaded through the steps of one scenario.
#[derive(Debug, Default)]
pub struct PreflightWorld {
    checks: RefCell<Vec<Rc<ScriptedCheck>>>,
    config: RefCell<MemoryConfig>,
    report: RefCell<Option<PreflightReport>>,
}

impl PreflightWorld {
    pub fn add_check(&self, id: &str, behaviour: Behaviour) {
        self.checks
            .borrow_mut()
            .push(Rc::new(ScriptedCheck::new(id, behaviour)));
    }

    pub fn enable_setting(&self, key: &str) {
        let config = self.config.take().with_bool(key, true);
        *self.config.borrow_mut() = config;
    }

    pub fn run(&self, mode: RunMode) {
        let scripted = self.checks.borrow().clone();
        let checks: Vec<Check<'_>> = scripted.iter().map(|check| check.build()).collect();
        let config = self.config.borrow();
        let report = ExecutionEngine::new(&*config).run(mode, &checks);
        *self.report.borrow_mut() = Some(report);
    }

    pub fn check(&self, id: &str) -> Rc<ScriptedCheck> {
        self.checks
            .borrow()
            .iter()
            .find(|check| check.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("scenario did not declare check {id}"))
    }

    pub fn with_report<T>(&self, read: impl FnOnce(&PreflightReport) -> T) -> T {
        let slot = self.report.borrow();
        let report = slot
            .as_ref()
            .unwrap_or_else(|| panic!("scenario did not run the engine"));
        read(report)
    }
}

#[fixture]
pub fn preflight_world() -> PreflightWorld {
    PreflightWorld::default()
}
