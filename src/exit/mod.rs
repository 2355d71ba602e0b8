// =============================================================================
// Exit Management Module
// =============================================================================
//
// Fixed take-profit / stop-loss barriers and the monitor that executes the
// exits they trigger.

pub mod barrier;
pub mod monitor;

pub use monitor::{ClosedExit, ExitError, ExitReport, PositionMonitor};
