//! NSGA-II scenario optimization with domain-rule variation operators.
//!
//! # Overview
//!
//! - **Operators** (`operators`): hillslope, subtree and two-point crossover;
//!   rule-aware and random mutation
//! - **NSGA-II** (`nsga2`): non-dominated sorting, crowding distance,
//!   environmental and tournament selection, hypervolume
//! - **Search** (`search`): the generational loop over a [`ScenarioModel`]
//! - **Archive** (`archive`): runtime log, Pareto snapshots and result file
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bmp_optimizer::compute::{CommandSimulator, JsonFileStore, ScenarioModel};
//! use bmp_optimizer::compute::evolution::{Nsga2Engine, RunArchive};
//! use bmp_optimizer::schema::{OptimizerConfig, UnitsInfo};
//!
//! let config = OptimizerConfig::from_ini_file("nsga2.ini")?;
//! let units = UnitsInfo::load(
//!     &config.paths.units_file,
//!     config.bmps.unit_mode,
//!     &config.bmps.tag_names,
//! )?;
//! let store = Arc::new(JsonFileStore::create(config.scenario_store_dir())?);
//! let simulator = Arc::new(CommandSimulator::from_config(&config));
//! let model = ScenarioModel::new(&config, units, simulator, store)?;
//!
//! let mut engine = Nsga2Engine::new(config.nsga2.clone(), model)?
//!     .with_archive(RunArchive::create(config.output_dir())?);
//! let result = engine.run_with_callback(|progress| {
//!     println!("Generation {}: {} on the front",
//!         progress.generation, progress.pareto_front.len());
//! })?;
//! println!("Hypervolume: {:.4}", result.stats.hypervolume);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`ScenarioModel`]: crate::compute::ScenarioModel

mod archive;
mod nsga2;
mod operators;
mod search;

pub use archive::{EvaluationRow, RunArchive, format_genes, load_pareto_population};
pub use nsga2::{
    Ranked, crowding_distance, fast_non_dominated_sort, hypervolume_2d, sel_nsga2,
    sel_tournament_dcd,
};
pub use operators::{
    GeneRng, crossover_rdm, crossover_slppos, crossover_updown, mutate_rdm, mutate_rule,
};
pub use search::{CrossoverOp, Individual, MutationOp, Nsga2Engine, OperatorSet, OptimizeError};
