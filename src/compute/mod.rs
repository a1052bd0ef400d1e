//! Compute module - Gene indexing, domain rules, simulation and NSGA-II search.

mod index;
mod rules;
mod scenario;
mod simulator;
mod store;

pub mod evolution;

pub use index::*;
pub use rules::*;
pub use scenario::{Evaluation, ScenarioModel, compute_economy};
pub use simulator::*;
pub use store::*;
