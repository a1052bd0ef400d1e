//! BMP Optimizer CLI - Run an NSGA-II scenario optimization from an INI file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bmp_optimizer::{
    compute::evolution::{Nsga2Engine, RunArchive},
    compute::{CommandSimulator, JsonFileStore, ScenarioModel},
    schema::{OptimizationPhase, OptimizerConfig, UnitsInfo},
};

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} -ini <config.ini>");
    eprintln!();
    eprintln!("Optimize BMP scenarios with NSGA-II.");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  -ini, --ini  Path to the optimization configuration file");
    std::process::exit(1);
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("Error {context}: {err}");
    std::process::exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("bmp-optimizer", String::as_str);

    let ini_path = match args.get(1).map(String::as_str) {
        Some("-ini" | "--ini") => match args.get(2) {
            Some(path) => PathBuf::from(path),
            None => usage(program),
        },
        Some(path) if !path.starts_with('-') => PathBuf::from(path),
        _ => usage(program),
    };

    let config = OptimizerConfig::from_ini_file(&ini_path)
        .unwrap_or_else(|e| fail("loading configuration", e));

    let units = UnitsInfo::load(
        &config.paths.units_file,
        config.bmps.unit_mode,
        &config.bmps.tag_names,
    )
    .unwrap_or_else(|e| fail("loading spatial units", e));

    let store = JsonFileStore::create(config.scenario_store_dir())
        .unwrap_or_else(|e| fail("opening scenario store", e));
    let simulator = CommandSimulator::from_config(&config);

    println!("BMP Scenario Optimization");
    println!("=========================");
    println!(
        "Units: {} ({})",
        units.len(),
        config.bmps.unit_mode.as_str()
    );
    println!(
        "Method: {} (rules {})",
        config.bmps.method.as_str(),
        if config.bmps.uses_rules() { "on" } else { "off" }
    );
    println!("BMPs: {}", config.bmps.catalog.len());
    println!(
        "Population: {}, generations: {}",
        config.nsga2.population_size, config.nsga2.generations
    );
    println!("Simulator: {}", simulator.executable().display());
    println!();

    let model = ScenarioModel::new(&config, units, Arc::new(simulator), Arc::new(store))
        .unwrap_or_else(|e| fail("building scenario model", e));
    let archive =
        RunArchive::create(config.output_dir()).unwrap_or_else(|e| fail("creating output directory", e));
    let output_dir = archive.dir().to_path_buf();

    let mut engine = Nsga2Engine::new(config.nsga2.clone(), model)
        .unwrap_or_else(|e| fail("configuring NSGA-II", e))
        .with_archive(archive);

    let start = Instant::now();
    let mut reported = None;
    let result = engine
        .run_with_callback(|progress| {
            if progress.phase == OptimizationPhase::Initializing {
                println!("Evaluating initial population...");
                return;
            }
            if let Some(latest) = &progress.latest
                && reported != Some(latest.generation)
            {
                reported = Some(latest.generation);
                println!(
                    "  Generation {}/{}: {} evaluations, front {}, hypervolume {:.4}, {:.1}s",
                    latest.generation,
                    progress.total_generations,
                    latest.evaluations,
                    latest.front_size,
                    latest.hypervolume,
                    latest.elapsed_seconds
                );
            }
        })
        .unwrap_or_else(|e| fail("running optimization", e));

    println!();
    println!("Pareto front ({} scenarios):", result.pareto_front.len());
    for entry in &result.pareto_front {
        let id = entry
            .scenario_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "  {id}: cost {:.3}, effectiveness {:.4}",
            entry.cost, entry.effectiveness
        );
    }
    println!();
    println!(
        "Evaluations: {} ({} failed)",
        result.stats.total_evaluations, result.stats.failed_evaluations
    );
    println!("Hypervolume: {:.4}", result.stats.hypervolume);
    println!("Stop reason: {:?}", result.stats.stop_reason);
    println!(
        "Time: {:.2}s ({:.2} evaluations/s)",
        start.elapsed().as_secs_f32(),
        result.stats.evaluations_per_second
    );
    println!("Outputs: {}", output_dir.display());
}
