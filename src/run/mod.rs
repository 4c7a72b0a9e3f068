//! Durable run state: the per-run ledger, the step-transition protocol, and
//! the process-wide path handles.

pub mod registry;
pub mod state;
pub mod step;

pub use state::{RunState, RunStatus, STEP_NAMES, StepState, StepStatus};
