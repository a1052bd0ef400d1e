//! NSGA-II search over BMP scenarios.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::compute::scenario::{Evaluation, ScenarioModel};
use crate::compute::simulator::SimulationErrorKind;
use crate::compute::store::ScenarioHandle;
use crate::schema::{
    ConfigError, Fitness, GenerationRecord, Nsga2Config, ObjectiveStats, OptimizationPhase,
    OptimizationProgress, OptimizationResult, OptimizationStats, ParetoEntry, RuleMethod,
    ScenarioId, StopReason, UnitMode,
};

use super::archive::{EvaluationRow, RunArchive, load_pareto_population};
use super::nsga2::{hypervolume_2d, sel_nsga2, sel_tournament_dcd};
use super::operators::{
    GeneRng, crossover_rdm, crossover_slppos, crossover_updown, mutate_rdm, mutate_rule,
};

/// Errors that abort an optimization run.
#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Baseline simulation failed: {0}")]
    Baseline(SimulationErrorKind),
    #[error("Run archive I/O: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
}

/// A member of the population.
#[derive(Debug, Clone)]
pub struct Individual {
    /// BMP id per gene index.
    pub genes: Vec<u32>,
    /// `None` until evaluated, and again after variation changed the genes.
    pub fitness: Option<Fitness>,
    /// Scenario that produced `fitness`.
    pub scenario_id: Option<ScenarioId>,
    pub rank: usize,
    pub crowding: f64,
}

impl Individual {
    pub fn new(genes: Vec<u32>) -> Self {
        Self {
            genes,
            fitness: None,
            scenario_id: None,
            rank: usize::MAX,
            crowding: 0.0,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.fitness.is_some()
    }

    fn fitness_or_unevaluated(&self) -> Fitness {
        self.fitness.unwrap_or(Fitness::UNEVALUATED)
    }

    pub fn to_entry(&self) -> ParetoEntry {
        let fitness = self.fitness_or_unevaluated();
        ParetoEntry {
            scenario_id: self.scenario_id,
            cost: fitness.cost,
            effectiveness: fitness.effectiveness,
            rank: self.rank,
            gene_values: self.genes.clone(),
        }
    }
}

/// Crossover operator applied to parent pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossoverOp {
    /// Cut points on hillslope boundaries; the value is genes per hillslope.
    Hillslope(usize),
    /// Exchange of a unit and everything draining into it.
    Subtree,
    /// Arbitrary two-point crossover.
    TwoPoint,
}

/// Mutation operator applied to each offspring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Rule,
    Random,
}

/// Variation operators chosen from the unit type and configuration method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorSet {
    pub crossover: CrossoverOp,
    pub mutation: MutationOp,
}

impl OperatorSet {
    pub fn for_model(model: &ScenarioModel) -> Self {
        if !model.uses_rules() {
            return Self {
                crossover: CrossoverOp::TwoPoint,
                mutation: MutationOp::Random,
            };
        }
        let crossover = match (model.unit_mode(), model.method()) {
            (UnitMode::SlopePosition, _) => CrossoverOp::Hillslope(model.hillslope_genes()),
            (UnitMode::ConnectedField, RuleMethod::UpDown) => CrossoverOp::Subtree,
            _ => CrossoverOp::TwoPoint,
        };
        Self {
            crossover,
            mutation: MutationOp::Rule,
        }
    }
}

/// NSGA-II engine driving the scenario model.
pub struct Nsga2Engine {
    config: Nsga2Config,
    model: ScenarioModel,
    operators: OperatorSet,
    rng: GeneRng,
    pool: rayon::ThreadPool,
    population: Vec<Individual>,
    /// Store records and outputs of evaluated scenarios still referenced.
    live: HashMap<ScenarioId, ScenarioHandle>,
    archive: Option<RunArchive>,
    history: Vec<GenerationRecord>,
    generation: usize,
    evaluations: usize,
    failures: usize,
    phase: OptimizationPhase,
    started: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Nsga2Engine {
    /// Create an engine. Parameters are validated before anything is simulated.
    pub fn new(config: Nsga2Config, model: ScenarioModel) -> Result<Self, OptimizeError> {
        config.validate()?;

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(workers) = config.workers {
            builder = builder.num_threads(workers);
        }
        let pool = builder
            .build()
            .map_err(|e| OptimizeError::ThreadPool(e.to_string()))?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        log::info!("NSGA-II random seed: {seed}");
        let operators = OperatorSet::for_model(&model);
        log::debug!("Operators: {operators:?}");

        Ok(Self {
            config,
            model,
            operators,
            rng: GeneRng::new(seed),
            pool,
            population: Vec::new(),
            live: HashMap::new(),
            archive: None,
            history: Vec::new(),
            generation: 0,
            evaluations: 0,
            failures: 0,
            phase: OptimizationPhase::Initializing,
            started: Instant::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Write logs and Pareto snapshots to `archive`.
    pub fn with_archive(mut self, archive: RunArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn model(&self) -> &ScenarioModel {
        &self.model
    }

    pub fn operators(&self) -> OperatorSet {
        self.operators
    }

    pub fn population(&self) -> &[Individual] {
        &self.population
    }

    /// Build the initial, unevaluated population.
    ///
    /// Gene arrays from a previous run's Pareto snapshot are used first when
    /// configured; the remainder is drawn at random.
    pub fn initialize(&mut self) -> Result<(), OptimizeError> {
        self.population.clear();
        self.live.clear();
        self.generation = 0;
        let size = self.config.population_size;
        let genes = self.model.gene_count();

        if let Some(input) = &self.config.input_population {
            let seeds = load_pareto_population(&input.file, input.generation)?;
            let total = seeds.len();
            self.population.extend(
                seeds
                    .into_iter()
                    .filter(|g| g.len() == genes)
                    .take(size)
                    .map(Individual::new),
            );
            log::info!(
                "Seeded {} of {total} individuals from {}",
                self.population.len(),
                input.file.display()
            );
        }

        while self.population.len() < size {
            let genes = self.model.initialize(&mut self.rng);
            self.population.push(Individual::new(genes));
        }
        Ok(())
    }

    /// Evaluate every individual without fitness. Returns (evaluations, failures).
    fn evaluate(&mut self, individuals: &mut [Individual]) -> Result<(usize, usize), OptimizeError> {
        let pending: Vec<usize> = individuals
            .iter()
            .enumerate()
            .filter(|(_, ind)| !ind.is_evaluated())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Ok((0, 0));
        }

        let model = &self.model;
        let genes: Vec<&[u32]> = pending.iter().map(|&i| individuals[i].genes.as_slice()).collect();
        let results: Vec<Evaluation> = self
            .pool
            .install(|| genes.par_iter().map(|g| model.evaluate(g)).collect());

        let mut failures = 0;
        for (&i, result) in pending.iter().zip(results) {
            let ind = &mut individuals[i];
            ind.fitness = Some(result.fitness);
            ind.scenario_id = Some(result.id);
            if result.failed {
                failures += 1;
            }
            if let Some(handle) = result.handle {
                self.live.insert(result.id, handle);
            }
        }

        if let Some(archive) = &self.archive {
            let rows: Vec<EvaluationRow<'_>> = pending
                .iter()
                .map(|&i| EvaluationRow {
                    scenario_id: individuals[i].scenario_id.unwrap_or(ScenarioId(0)),
                    fitness: individuals[i].fitness_or_unevaluated(),
                    genes: &individuals[i].genes,
                })
                .collect();
            archive.log_evaluations(self.generation, &rows)?;
        }

        self.evaluations += pending.len();
        self.failures += failures;
        Ok((pending.len(), failures))
    }

    /// Evaluate `candidates`, keep the best `population_size` and record the generation.
    fn evaluate_and_select(&mut self, mut candidates: Vec<Individual>) -> Result<(), OptimizeError> {
        let eval_started = Instant::now();
        self.phase = OptimizationPhase::Evaluating;
        let (evaluations, failures) = self.evaluate(&mut candidates)?;
        if let Some(archive) = &self.archive {
            archive.log_timing(
                self.generation,
                evaluations,
                eval_started.elapsed().as_secs_f64(),
            )?;
        }

        self.phase = OptimizationPhase::Selecting;
        let size = self.config.population_size;
        let mut seen = HashSet::new();
        let unique: Vec<Individual> = candidates
            .iter()
            .filter(|ind| seen.insert(ind.genes.clone()))
            .cloned()
            .collect();
        if unique.len() >= size {
            candidates = unique;
        }

        let fitness: Vec<Fitness> = candidates
            .iter()
            .map(Individual::fitness_or_unevaluated)
            .collect();
        let chosen = sel_nsga2(&fitness, size);
        self.population = chosen
            .iter()
            .map(|r| {
                let mut ind = candidates[r.index].clone();
                ind.rank = r.rank;
                ind.crowding = r.crowding;
                ind
            })
            .collect();

        let keep: HashSet<ScenarioId> = self
            .population
            .iter()
            .filter_map(|ind| ind.scenario_id)
            .collect();
        self.live.retain(|id, _| keep.contains(id));

        self.record_generation(evaluations, failures)
    }

    fn record_generation(&mut self, evaluations: usize, failures: usize) -> Result<(), OptimizeError> {
        let costs: Vec<f64> = self
            .population
            .iter()
            .map(|i| i.fitness_or_unevaluated().cost)
            .collect();
        let effs: Vec<f64> = self
            .population
            .iter()
            .map(|i| i.fitness_or_unevaluated().effectiveness)
            .collect();
        let front = self.pareto_front();
        let front_fitness: Vec<Fitness> = front.iter().map(ParetoEntry::fitness).collect();

        let record = GenerationRecord {
            generation: self.generation,
            evaluations,
            failures,
            cost: ObjectiveStats::from_values(&costs),
            effectiveness: ObjectiveStats::from_values(&effs),
            hypervolume: hypervolume_2d(&front_fitness, self.model.worst_fitness()),
            front_size: front.len(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        };
        log::info!(
            "Generation {}: {} evaluations ({} failed), front {}, hypervolume {:.4}",
            record.generation,
            record.evaluations,
            record.failures,
            record.front_size,
            record.hypervolume
        );

        if let Some(archive) = &self.archive {
            archive.log_generation(&record, &front)?;
        }
        self.history.push(record);
        Ok(())
    }

    /// Crowded tournament, crossover and mutation. Offspring whose genes
    /// differ from the parent they were cloned from lose their fitness.
    fn vary(&mut self) -> Vec<Individual> {
        self.phase = OptimizationPhase::Varying;
        let Self {
            config,
            model,
            operators,
            rng,
            population,
            ..
        } = self;

        let fitness: Vec<Fitness> = population
            .iter()
            .map(Individual::fitness_or_unevaluated)
            .collect();
        let crowding: Vec<f64> = population.iter().map(|i| i.crowding).collect();
        let k = config.tournament_size(population.len());
        let parents = sel_tournament_dcd(rng, &fitness, &crowding, k);

        let mut offspring: Vec<Individual> =
            parents.iter().map(|&p| population[p].clone()).collect();
        let universe = model.catalog().universe();
        let ctx = model.rule_context();

        for pair in offspring.chunks_mut(2) {
            let [a, b] = pair else { continue };
            let (before_a, before_b) = (a.genes.clone(), b.genes.clone());

            if rng.chance(config.crossover_rate) {
                match operators.crossover {
                    CrossoverOp::Hillslope(n) => {
                        crossover_slppos(rng, &mut a.genes, &mut b.genes, n);
                    }
                    CrossoverOp::Subtree => {
                        crossover_updown(rng, &mut a.genes, &mut b.genes, model.index(), model.units());
                    }
                    CrossoverOp::TwoPoint => {
                        crossover_rdm(rng, &mut a.genes, &mut b.genes);
                    }
                }
            }

            for ind in [&mut *a, &mut *b] {
                match operators.mutation {
                    MutationOp::Rule => {
                        mutate_rule(rng, &mut ind.genes, config.max_mutate_perc, config.mutate_rate, &ctx);
                    }
                    MutationOp::Random => {
                        mutate_rdm(rng, &mut ind.genes, config.max_mutate_perc, config.mutate_rate, &universe);
                    }
                }
            }

            for (ind, before) in [(a, before_a), (b, before_b)] {
                if ind.genes != before {
                    ind.fitness = None;
                    ind.scenario_id = None;
                }
            }
        }
        offspring
    }

    /// Run one generation: variation, evaluation and environmental selection.
    pub fn step_generation(&mut self) -> Result<(), OptimizeError> {
        let offspring = self.vary();
        self.generation += 1;
        let mut candidates = std::mem::take(&mut self.population);
        candidates.extend(offspring);
        self.evaluate_and_select(candidates)
    }

    /// Current first front sorted by cost.
    pub fn pareto_front(&self) -> Vec<ParetoEntry> {
        let mut front: Vec<ParetoEntry> = self
            .population
            .iter()
            .filter(|i| i.rank == 0)
            .map(Individual::to_entry)
            .collect();
        front.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        front
    }

    /// Get current progress.
    pub fn progress(&self) -> OptimizationProgress {
        OptimizationProgress {
            generation: self.generation,
            total_generations: self.config.generations,
            evaluations_total: self.evaluations,
            latest: self.history.last().cloned(),
            pareto_front: self.pareto_front(),
            phase: self.phase,
        }
    }

    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }
        if self.generation >= self.config.generations {
            return Some(StopReason::MaxGenerations);
        }
        None
    }

    /// Run the optimization with progress callback.
    pub fn run_with_callback<F>(&mut self, mut callback: F) -> Result<OptimizationResult, OptimizeError>
    where
        F: FnMut(&OptimizationProgress),
    {
        self.started = Instant::now();
        self.phase = OptimizationPhase::Initializing;
        self.evaluations = 0;
        self.failures = 0;
        self.history.clear();

        if self.cancelled.load(Ordering::Relaxed) {
            self.phase = OptimizationPhase::Stopped;
            return Ok(self.finish(StopReason::Cancelled));
        }

        self.model.run_baseline().map_err(OptimizeError::Baseline)?;
        self.initialize()?;
        callback(&self.progress());

        let initial = std::mem::take(&mut self.population);
        self.evaluate_and_select(initial)?;
        callback(&self.progress());

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            self.step_generation()?;
            callback(&self.progress());
        };

        self.phase = match stop_reason {
            StopReason::Cancelled => OptimizationPhase::Stopped,
            StopReason::MaxGenerations => OptimizationPhase::Complete,
        };
        let result = self.finish(stop_reason);
        if let Some(archive) = &self.archive {
            let path = archive.write_result(&result)?;
            log::info!("Result written to {}", path.display());
        }
        callback(&self.progress());
        Ok(result)
    }

    /// Run the optimization (blocking).
    pub fn run(&mut self) -> Result<OptimizationResult, OptimizeError> {
        self.run_with_callback(|_| {})
    }

    /// Build the result and release scenario outputs outside the final front.
    fn finish(&mut self, stop_reason: StopReason) -> OptimizationResult {
        let pareto_front = self.pareto_front();
        if self.config.keep_pareto_outputs {
            for id in pareto_front.iter().filter_map(|e| e.scenario_id) {
                if let Some(handle) = self.live.remove(&id) {
                    handle.retain();
                }
            }
        }
        self.live.clear();

        let mut population: Vec<ParetoEntry> =
            self.population.iter().map(Individual::to_entry).collect();
        population.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.cost.total_cmp(&b.cost)));

        let elapsed = self.started.elapsed().as_secs_f64();
        let hypervolume = self.history.last().map_or(0.0, |r| r.hypervolume);
        OptimizationResult {
            pareto_front,
            population,
            history: self.history.clone(),
            stats: OptimizationStats {
                generations: self.generation,
                total_evaluations: self.evaluations,
                failed_evaluations: self.failures,
                hypervolume,
                elapsed_seconds: elapsed,
                evaluations_per_second: if elapsed > 0.0 {
                    self.evaluations as f64 / elapsed
                } else {
                    0.0
                },
                stop_reason,
            },
        }
    }
}
