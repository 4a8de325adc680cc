pub mod applier;
pub mod diff;

pub use applier::{ApplyResult, PatchApplier};
