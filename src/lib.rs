pub mod audit;
pub mod checks;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod models;
pub mod patching;
pub mod pipeline;
pub mod reporting;
pub mod sandbox;
pub mod store;
pub mod utils;
