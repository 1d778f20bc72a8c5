mod cases;
mod ordering;
mod plans;
mod runs;
mod scenarios;
mod steps;

pub use cases::TestCaseRepository;
pub use plans::{CaseTree, PlanRepository, PlanTree, ScenarioTree};
pub use runs::{FailedIndexUpdate, RunRepository};
pub use scenarios::ScenarioRepository;
pub use steps::StepRepository;
