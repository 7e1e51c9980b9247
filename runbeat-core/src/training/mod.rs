//! Interval training: the wall-clock phase machine and the scheduler that drives it.

mod interval;
mod scheduler;

pub use interval::{IntervalPhase, IntervalState, TrainingProtocol};
pub use scheduler::{IntervalTrainingScheduler, TrainingPlayback, TrainingStatus};
