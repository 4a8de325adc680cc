pub mod parser;
pub mod schema;
pub mod security;
pub mod types;

pub use parser::{load_config, parse_config, validate_conflicts};
pub use types::*;
