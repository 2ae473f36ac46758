//! Scenario-driven load generation.
//!
//! A run is described by a [`cli::config::RunConfig`]: named weighted
//! behavior sets, scenarios that schedule virtual users over those sets,
//! and thresholds that turn the aggregated metrics into a pass/fail
//! verdict. The [`Engine`] executes the run on its own tokio runtime;
//! embedders register [`engine::probe::Probe`] implementations for the
//! actual protocol work.

pub mod cli;
pub mod engine;
pub mod stats;
pub mod utils;

pub use cli::config::RunConfig;
pub use engine::Engine;
pub use utils::parse_duration_str;
