//! Scenario model: gene arrays, economic cost and environmental effectiveness.

use std::sync::Arc;

use crate::schema::{
    BmpCatalog, ConfigError, EvaluationConfig, Fitness, NO_BMP, OptimizerConfig, RuleMethod,
    ScenarioId, ScenarioRecord, SpatialUnit, UnitMode, UnitsInfo,
};

use super::evolution::GeneRng;
use super::index::{GeneIndexMap, build_index};
use super::rules::{RuleContext, admissible_bmps};
use super::simulator::{SimulationErrorKind, Simulator};
use super::store::{ScenarioHandle, ScenarioIdGenerator, ScenarioStore};

/// Economic cost of a gene array: sum of the costs of configured genes.
///
/// `sites[g]` is the unit behind gene `g`. BMPs with area costs are charged
/// by that unit's area over `runtime_years`; genes without a known site or
/// area pay the flat unit cost. Ids missing from the catalog cost as much as
/// the dearest BMP on the same unit.
pub fn compute_economy(
    genes: &[u32],
    catalog: &BmpCatalog,
    sites: &[Option<&SpatialUnit>],
    runtime_years: f64,
) -> f64 {
    genes
        .iter()
        .enumerate()
        .filter(|&(_, &g)| g != NO_BMP)
        .map(|(i, &g)| catalog.cost_on(g, sites.get(i).copied().flatten(), runtime_years))
        .sum()
}

/// Outcome of evaluating one gene array.
#[derive(Debug)]
pub struct Evaluation {
    pub id: ScenarioId,
    pub fitness: Fitness,
    /// Ownership of the store record and outputs; `None` if nothing was stored.
    pub handle: Option<ScenarioHandle>,
    /// True when the sentinel fitness was assigned.
    pub failed: bool,
    pub error: Option<SimulationErrorKind>,
}

/// Everything needed to turn gene arrays into fitness values.
pub struct ScenarioModel {
    units: UnitsInfo,
    index: GeneIndexMap,
    catalog: BmpCatalog,
    mode: UnitMode,
    method: RuleMethod,
    rules: bool,
    hillslope_genes: usize,
    evaluation: EvaluationConfig,
    base_env: f64,
    worst: Fitness,
    simulator: Arc<dyn Simulator>,
    store: Arc<dyn ScenarioStore>,
    ids: ScenarioIdGenerator,
}

impl ScenarioModel {
    pub fn new(
        config: &OptimizerConfig,
        units: UnitsInfo,
        simulator: Arc<dyn Simulator>,
        store: Arc<dyn ScenarioStore>,
    ) -> Result<Self, ConfigError> {
        let index = build_index(&units, config.bmps.unit_mode)?;
        let catalog = config.bmps.catalog.clone();
        let runtime_years = config.evaluation.runtime_years;
        let worst_cost = config.evaluation.worst_cost.unwrap_or_else(|| {
            index
                .units_in_gene_order()
                .iter()
                .map(|&id| catalog.max_cost_on(units.get(id), runtime_years))
                .sum()
        });

        log::info!(
            "Scenario model: {} genes, {} BMPs, unit {}, method {}",
            index.len(),
            catalog.len(),
            config.bmps.unit_mode.as_str(),
            config.bmps.method.as_str()
        );

        Ok(Self {
            units,
            index,
            catalog,
            mode: config.bmps.unit_mode,
            method: config.bmps.method,
            rules: config.bmps.uses_rules(),
            hillslope_genes: config.bmps.hillslope_gene_count(),
            base_env: config.evaluation.base_env,
            worst: Fitness::new(worst_cost, config.evaluation.worst_env),
            evaluation: config.evaluation.clone(),
            simulator,
            store,
            ids: ScenarioIdGenerator::new(),
        })
    }

    /// Replace the scenario id generator.
    pub fn with_ids(mut self, ids: ScenarioIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn gene_count(&self) -> usize {
        self.index.len()
    }

    pub fn units(&self) -> &UnitsInfo {
        &self.units
    }

    pub fn index(&self) -> &GeneIndexMap {
        &self.index
    }

    pub fn catalog(&self) -> &BmpCatalog {
        &self.catalog
    }

    pub fn unit_mode(&self) -> UnitMode {
        self.mode
    }

    pub fn method(&self) -> RuleMethod {
        self.method
    }

    pub fn uses_rules(&self) -> bool {
        self.rules
    }

    /// Genes per hillslope chain in slope-position mode.
    pub fn hillslope_genes(&self) -> usize {
        self.hillslope_genes
    }

    pub fn rule_context(&self) -> RuleContext<'_> {
        RuleContext {
            units: &self.units,
            index: &self.index,
            catalog: &self.catalog,
            mode: self.mode,
            method: self.method,
        }
    }

    /// Fitness assigned to failed evaluations.
    pub fn worst_fitness(&self) -> Fitness {
        self.worst
    }

    pub fn base_env(&self) -> f64 {
        self.base_env
    }

    pub fn set_base_env(&mut self, base_env: f64) {
        self.base_env = base_env;
    }

    /// Random gene array.
    ///
    /// Each gene is drawn uniformly from the BMPs suitable for its unit plus
    /// [`NO_BMP`]. With rules enabled, genes are filled in gene order and each
    /// draw uses the admissible set against the genes placed so far.
    pub fn initialize(&self, rng: &mut GeneRng) -> Vec<u32> {
        let mut genes = vec![NO_BMP; self.index.len()];
        let ctx = self.rule_context();
        for (gene, &unit_id) in self.index.units_in_gene_order().iter().enumerate() {
            let options: Vec<u32> = if self.rules {
                admissible_bmps(unit_id, &genes, &ctx)
            } else {
                let mut suitable = self
                    .units
                    .get(unit_id)
                    .map(|u| self.catalog.suitable_bmps(u, self.mode))
                    .unwrap_or_default();
                suitable.insert(NO_BMP);
                suitable.into_iter().collect()
            };
            genes[gene] = rng.choose(&options).unwrap_or(NO_BMP);
        }
        genes
    }

    pub fn compute_economy(&self, genes: &[u32]) -> f64 {
        let sites: Vec<Option<&SpatialUnit>> = self
            .index
            .units_in_gene_order()
            .iter()
            .map(|&id| self.units.get(id))
            .collect();
        compute_economy(genes, &self.catalog, &sites, self.evaluation.runtime_years)
    }

    /// Relative reduction of the pollutant amount against the baseline.
    ///
    /// Without a baseline the raw amount is used. Relative values outside
    /// [0, 1] fall back to the sentinel effectiveness.
    pub fn effectiveness(&self, amount: f64) -> f64 {
        if self.base_env < 0.0 {
            return if amount.is_finite() {
                amount
            } else {
                self.worst.effectiveness
            };
        }
        let relative = (self.base_env - amount) / self.base_env;
        if (0.0..=1.0).contains(&relative) {
            relative
        } else {
            self.worst.effectiveness
        }
    }

    /// Store the scenario, run the simulator and compute both objectives.
    ///
    /// Any failure yields the sentinel fitness; errors are never raised.
    pub fn evaluate(&self, genes: &[u32]) -> Evaluation {
        let id = self.ids.next_id();
        let failure = |handle: Option<ScenarioHandle>, error: SimulationErrorKind| {
            log::warn!("Scenario {id} failed: {error}");
            Evaluation {
                id,
                fitness: self.worst,
                handle,
                failed: true,
                error: Some(error),
            }
        };

        let record = ScenarioRecord {
            id,
            gene_values: genes.to_vec(),
            assignments: self.index.assignments(genes),
        };
        if let Err(e) = self.store.put(&record) {
            return failure(None, SimulationErrorKind::Store(e.to_string()));
        }
        let handle = ScenarioHandle::new(id, Arc::clone(&self.store), self.simulator.output_dir(id));

        let result = self.simulator.run(id);
        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| SimulationErrorKind::MalformedOutput("no metrics".into()));
            return failure(Some(handle), error);
        }
        let Some(amount) = result.metric(&self.evaluation.variable) else {
            return failure(
                Some(handle),
                SimulationErrorKind::MalformedOutput(format!(
                    "metric {} missing",
                    self.evaluation.variable
                )),
            );
        };

        let fitness = Fitness::new(self.compute_economy(genes), self.effectiveness(amount));
        log::debug!(
            "Scenario {id}: cost {:.3}, effectiveness {:.4}",
            fitness.cost,
            fitness.effectiveness
        );
        Evaluation {
            id,
            fitness,
            handle: Some(handle),
            failed: false,
            error: None,
        }
    }

    /// Simulate the scenario without BMPs when no baseline amount is configured.
    ///
    /// Returns the baseline amount, which is also stored for later evaluations.
    pub fn run_baseline(&mut self) -> Result<f64, SimulationErrorKind> {
        if self.base_env >= 0.0 {
            return Ok(self.base_env);
        }
        let id = ScenarioId(0);
        let genes = vec![NO_BMP; self.index.len()];
        self.store
            .put(&ScenarioRecord {
                id,
                gene_values: genes,
                assignments: Default::default(),
            })
            .map_err(|e| SimulationErrorKind::Store(e.to_string()))?;
        let _handle = ScenarioHandle::new(id, Arc::clone(&self.store), self.simulator.output_dir(id));

        let result = self.simulator.run(id);
        if !result.success {
            return Err(result
                .error
                .unwrap_or_else(|| SimulationErrorKind::MalformedOutput("no metrics".into())));
        }
        let amount = result.metric(&self.evaluation.variable).ok_or_else(|| {
            SimulationErrorKind::MalformedOutput(format!(
                "metric {} missing",
                self.evaluation.variable
            ))
        })?;
        if amount <= 0.0 || !amount.is_finite() {
            return Err(SimulationErrorKind::MalformedOutput(format!(
                "baseline amount {amount} must be positive"
            )));
        }
        log::info!("Baseline {}: {amount}", self.evaluation.variable);
        self.base_env = amount;
        Ok(amount)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Simulators that never launch a process.

    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::compute::simulator::{SimulationErrorKind, SimulationResult, Simulator};
    use crate::compute::store::ScenarioStore;
    use crate::schema::{
        Bmp, BmpCatalog, BmpConfig, EvaluationConfig, ModelConfig, NO_BMP, Nsga2Config,
        OptimizerConfig, PathConfig, RuleMethod, ScenarioId, SpatialUnit, StoreConfig, UnitMode,
        UnitsInfo,
    };

    /// Slope-position configuration over three BMPs: 1 on summits, 2 on
    /// backslopes and valleys, 3 on valleys and incompatible with 2.
    pub fn optimizer_config(method: RuleMethod, base_env: f64) -> OptimizerConfig {
        let catalog = BmpCatalog::new([
            Bmp::new(1, 10.0).with_positions([1]),
            Bmp::new(2, 4.0).with_positions([4, 16]),
            Bmp::new(3, 6.0).with_positions([16]).with_incompatible([2]),
        ])
        .unwrap();
        OptimizerConfig {
            nsga2: Nsga2Config::default(),
            bmps: BmpConfig::new(UnitMode::SlopePosition, method, catalog),
            evaluation: EvaluationConfig {
                base_env,
                ..EvaluationConfig::default()
            },
            paths: PathConfig {
                model_dir: PathBuf::from("/tmp/model"),
                bin_dir: None,
                units_file: PathBuf::from("units.json"),
                field_raster: None,
                output_dir: None,
                scenario_store: None,
            },
            store: StoreConfig::default(),
            model: ModelConfig::default(),
        }
    }

    /// `count` chains of summit(1) -> backslope(4) -> valley(16).
    pub fn hillslopes(count: u32) -> UnitsInfo {
        let mut units = Vec::new();
        for h in 0..count {
            let base = h * 3 + 1;
            units.push(
                SpatialUnit::new(base)
                    .with_position_tag(1)
                    .with_downstream(base + 1),
            );
            units.push(
                SpatialUnit::new(base + 1)
                    .with_position_tag(4)
                    .with_downstream(base + 2),
            );
            units.push(SpatialUnit::new(base + 2).with_position_tag(16));
        }
        UnitsInfo::from_units(units.len(), units).unwrap()
    }

    /// Fails every run.
    pub struct FailingSimulator;

    impl Simulator for FailingSimulator {
        fn run(&self, _id: ScenarioId) -> SimulationResult {
            SimulationResult::failed(SimulationErrorKind::ExitStatus(Some(2)))
        }

        fn output_dir(&self, _id: ScenarioId) -> Option<PathBuf> {
            None
        }
    }

    /// Reads the stored genes and reports `base - reduction * configured genes`.
    pub struct LinearSimulator {
        pub store: Arc<dyn ScenarioStore>,
        pub base: f64,
        pub reduction: f64,
        /// Fail every scenario whose first gene equals this value.
        pub fail_on_first_gene: Option<u32>,
        pub calls: AtomicUsize,
    }

    impl LinearSimulator {
        pub fn new(store: Arc<dyn ScenarioStore>, base: f64, reduction: f64) -> Self {
            Self {
                store,
                base,
                reduction,
                fail_on_first_gene: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Simulator for LinearSimulator {
        fn run(&self, id: ScenarioId) -> SimulationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = match self.store.get(id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    return SimulationResult::failed(SimulationErrorKind::Store(format!(
                        "scenario {id} not stored"
                    )));
                }
                Err(e) => return SimulationResult::failed(SimulationErrorKind::Store(e.to_string())),
            };
            if self.fail_on_first_gene.is_some()
                && record.gene_values.first().copied() == self.fail_on_first_gene
            {
                return SimulationResult::failed(SimulationErrorKind::ExitStatus(Some(1)));
            }
            let configured = record
                .gene_values
                .iter()
                .filter(|&&g| g != NO_BMP)
                .count();
            let amount = self.base - self.reduction * configured as f64;
            SimulationResult::ok(HashMap::from([("SED".to_string(), amount)]))
        }

        fn output_dir(&self, _id: ScenarioId) -> Option<PathBuf> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{LinearSimulator, hillslopes, optimizer_config};
    use super::*;
    use crate::compute::store::MemoryStore;
    use crate::schema::{AreaCosts, Bmp};
    use proptest::prelude::*;

    fn model(method: RuleMethod, base_env: f64) -> (ScenarioModel, Arc<MemoryStore>, Arc<LinearSimulator>) {
        let store = Arc::new(MemoryStore::new());
        let sim = Arc::new(LinearSimulator::new(store.clone(), 100.0, 5.0));
        let model = ScenarioModel::new(
            &optimizer_config(method, base_env),
            hillslopes(2),
            sim.clone(),
            store.clone(),
        )
        .unwrap();
        (model, store, sim)
    }

    #[test]
    fn test_economy() {
        let (model, _, _) = model(RuleMethod::Suitability, 100.0);
        assert_eq!(model.compute_economy(&[0, 0, 0, 0, 0, 0]), 0.0);
        assert_eq!(model.compute_economy(&[1, 2, 3, 0, 2, 0]), 24.0);
        // Unknown id costs the dearest BMP.
        assert_eq!(model.compute_economy(&[9, 0, 0, 0, 0, 0]), 10.0);
    }

    #[test]
    fn test_economy_weighted_by_unit_area() {
        let catalog = BmpCatalog::new([
            Bmp::new(1, 10.0).with_positions([1]),
            Bmp::new(2, 4.0)
                .with_positions([4, 16])
                .with_area_costs(AreaCosts {
                    capex: 3.0,
                    opex: 1.0,
                    income: 0.5,
                }),
        ])
        .unwrap();
        let mut config = optimizer_config(RuleMethod::Suitability, 100.0);
        config.bmps.catalog = catalog;
        config.evaluation.runtime_years = 2.0;

        let units = UnitsInfo::from_units(
            3,
            [
                SpatialUnit::new(1)
                    .with_position_tag(1)
                    .with_downstream(2)
                    .with_area(5.0),
                SpatialUnit::new(2)
                    .with_position_tag(4)
                    .with_downstream(3)
                    .with_area(10.0),
                SpatialUnit::new(3).with_position_tag(16),
            ],
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let sim = Arc::new(LinearSimulator::new(store.clone(), 100.0, 5.0));
        let model = ScenarioModel::new(&config, units, sim, store).unwrap();

        // Summit BMP 1 has no area costs: flat 10.
        // Backslope: 10 * (3 + (1 - 0.5) * 2) = 40. Valley has no area: flat 4.
        assert_eq!(model.compute_economy(&[1, 2, 2]), 54.0);
        assert_eq!(model.compute_economy(&[0, 2, 0]), 40.0);
        // Dearest BMP per unit: 20 (area 5), 40 (area 10), 10 (flat).
        assert_eq!(model.worst_fitness().cost, 70.0);
    }

    #[test]
    fn test_worst_cost_defaults_to_dearest_everywhere() {
        let (model, _, _) = model(RuleMethod::Suitability, 100.0);
        assert_eq!(model.worst_fitness(), Fitness::new(60.0, 0.0));
    }

    #[test]
    fn test_effectiveness() {
        let (mut model, _, _) = model(RuleMethod::Suitability, 200.0);
        assert_eq!(model.effectiveness(150.0), 0.25);
        assert_eq!(model.effectiveness(250.0), 0.0);
        assert_eq!(model.effectiveness(f64::NAN), 0.0);
        model.set_base_env(-1.0);
        assert_eq!(model.effectiveness(150.0), 150.0);
    }

    #[test]
    fn test_evaluate_success_and_cleanup() {
        let (model, store, sim) = model(RuleMethod::Suitability, 100.0);
        let eval = model.evaluate(&[1, 2, 3, 0, 0, 0]);
        assert!(!eval.failed);
        assert_eq!(eval.fitness.cost, 20.0);
        assert!((eval.fitness.effectiveness - 0.15).abs() < 1e-12);
        assert_eq!(sim.calls(), 1);
        assert_eq!(store.len(), 1);
        let stored = store.get(eval.id).unwrap().unwrap();
        assert_eq!(stored.assignments[&1], vec![1]);

        drop(eval);
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_evaluation_gets_sentinel() {
        let store = Arc::new(MemoryStore::new());
        let mut sim = LinearSimulator::new(store.clone(), 100.0, 5.0);
        sim.fail_on_first_gene = Some(1);
        let model = ScenarioModel::new(
            &optimizer_config(RuleMethod::Suitability, 100.0),
            hillslopes(2),
            Arc::new(sim),
            store,
        )
        .unwrap();

        let eval = model.evaluate(&[1, 0, 0, 0, 0, 0]);
        assert!(eval.failed);
        assert_eq!(eval.fitness, model.worst_fitness());
        assert_eq!(eval.error, Some(SimulationErrorKind::ExitStatus(Some(1))));
    }

    #[test]
    fn test_baseline() {
        let (mut model, store, _) = model(RuleMethod::Suitability, -1.0);
        assert_eq!(model.run_baseline().unwrap(), 100.0);
        assert_eq!(model.base_env(), 100.0);
        assert!(store.is_empty());
        // A configured baseline is not re-simulated.
        assert_eq!(model.run_baseline().unwrap(), 100.0);
    }

    #[test]
    fn test_initialize_respects_rules() {
        let (model, _, _) = model(RuleMethod::Suitability, 100.0);
        let mut rng = GeneRng::new(3);
        for _ in 0..200 {
            let genes = model.initialize(&mut rng);
            assert_eq!(genes.len(), 6);
            for chain in genes.chunks(3) {
                assert!(matches!(chain[0], 0 | 1));
                assert!(matches!(chain[1], 0 | 2));
                assert!(matches!(chain[2], 0 | 2 | 3));
                if chain[1] == 2 {
                    assert_ne!(chain[2], 3);
                }
            }
        }
    }

    #[test]
    fn test_initialize_random_uses_suitability_only() {
        let (model, _, _) = model(RuleMethod::Random, 100.0);
        assert!(!model.uses_rules());
        let mut rng = GeneRng::new(8);
        let mut saw_conflict = false;
        for _ in 0..500 {
            let genes = model.initialize(&mut rng);
            saw_conflict |= genes.chunks(3).any(|c| c[1] == 2 && c[2] == 3);
        }
        assert!(saw_conflict);
    }

    proptest! {
        #[test]
        fn prop_economy_is_order_independent(
            mut genes in proptest::collection::vec(0u32..5, 0..50),
            seed in any::<u64>(),
        ) {
            let catalog = BmpCatalog::new([Bmp::new(1, 1.5), Bmp::new(2, 7.25), Bmp::new(3, 0.5)]).unwrap();
            let before = compute_economy(&genes, &catalog, &[], 0.0);
            GeneRng::new(seed).shuffle(&mut genes);
            let after = compute_economy(&genes, &catalog, &[], 0.0);
            prop_assert!((before - after).abs() < 1e-9);
            prop_assert!(before >= 0.0);
        }
    }
}
