//! BMP Optimizer - Multi-objective spatial optimization of best management practices.
//!
//! This crate searches for watershed scenarios, assignments of best
//! management practices (BMPs) to spatial units, that trade off economic
//! cost against environmental effectiveness. Scenarios are evolved with
//! NSGA-II using variation operators that respect hillslope structure,
//! upstream/downstream relations and BMP compatibility, and each scenario is
//! scored by running an external watershed model.
//!
//! # Architecture
//!
//! The crate is split into two main modules:
//!
//! - `schema`: Configuration, spatial units, BMP catalog and result types
//! - `compute`: Gene indexing, domain rules, simulator adapter, scenario
//!   store and the NSGA-II engine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bmp_optimizer::{
//!     compute::{MemoryStore, ScenarioModel, SimulationResult, Simulator},
//!     compute::evolution::Nsga2Engine,
//!     schema::{OptimizerConfig, ScenarioId, UnitsInfo},
//! };
//!
//! struct Oracle;
//!
//! impl Simulator for Oracle {
//!     fn run(&self, _id: ScenarioId) -> SimulationResult {
//!         SimulationResult::ok([("SED".to_string(), 42.0)].into())
//!     }
//!     fn output_dir(&self, _id: ScenarioId) -> Option<std::path::PathBuf> {
//!         None
//!     }
//! }
//!
//! let config = OptimizerConfig::from_ini_file("nsga2.ini")?;
//! let units = UnitsInfo::load("units.json", config.bmps.unit_mode, &config.bmps.tag_names)?;
//! let model = ScenarioModel::new(&config, units, Arc::new(Oracle), Arc::new(MemoryStore::new()))?;
//! let result = Nsga2Engine::new(config.nsga2.clone(), model)?.run()?;
//!
//! for entry in &result.pareto_front {
//!     println!("cost {:.2}, effectiveness {:.4}", entry.cost, entry.effectiveness);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::evolution::{Nsga2Engine, OptimizeError};
pub use compute::{CommandSimulator, ScenarioModel};
pub use schema::{OptimizerConfig, UnitsInfo};
