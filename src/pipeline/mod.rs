pub mod diagnosis;
pub mod job;
pub mod scheduler;
pub mod state;

pub use diagnosis::diagnose;
pub use job::ValidationJob;
pub use scheduler::{Scheduler, VerdictStream};
pub use state::{JobState, RunSettings, RunStats};
