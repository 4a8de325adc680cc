pub mod commands;
pub mod progress;
pub mod report;
pub mod run;
pub mod validate;

pub use commands::{Cli, Commands};
