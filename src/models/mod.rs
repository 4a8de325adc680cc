pub mod vulnerability;
pub mod patch;
pub mod outcome;
pub mod verdict;

pub use vulnerability::*;
pub use patch::*;
pub use outcome::*;
pub use verdict::*;
