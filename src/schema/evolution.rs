//! Progress, logbook and result types for NSGA-II scenario optimization.

use serde::{Deserialize, Serialize};

use super::{Fitness, ScenarioId};

// ============================================================================
// Progress & Results
// ============================================================================

/// One Pareto-front or population member as reported to callers and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParetoEntry {
    /// Scenario id of the evaluation that produced the fitness.
    pub scenario_id: Option<ScenarioId>,
    /// Economic cost.
    pub cost: f64,
    /// Environmental effectiveness.
    pub effectiveness: f64,
    /// Non-domination rank (0 is the first front).
    pub rank: usize,
    /// BMP id per gene index.
    pub gene_values: Vec<u32>,
}

impl ParetoEntry {
    pub fn fitness(&self) -> Fitness {
        Fitness::new(self.cost, self.effectiveness)
    }
}

/// Min/max/avg/std of one objective over a population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub std: f64,
}

impl ObjectiveStats {
    /// Population statistics; all zero for an empty slice.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let avg = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / n;
        Self {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg,
            std: variance.sqrt(),
        }
    }
}

/// Logbook row written after every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Generation number (0 is the initial population).
    pub generation: usize,
    /// Simulator evaluations dispatched in this generation.
    pub evaluations: usize,
    /// Evaluations that fell back to the sentinel fitness.
    pub failures: usize,
    pub cost: ObjectiveStats,
    pub effectiveness: ObjectiveStats,
    /// Hypervolume of the first front.
    pub hypervolume: f64,
    /// Size of the first front.
    pub front_size: usize,
    /// Seconds since the run started.
    pub elapsed_seconds: f64,
}

/// Current phase of the optimization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OptimizationPhase {
    /// Building the initial population.
    #[default]
    Initializing,
    /// Running the simulator on unevaluated scenarios.
    Evaluating,
    /// Non-dominated sorting and truncation.
    Selecting,
    /// Tournament, crossover and mutation.
    Varying,
    /// Run complete.
    Complete,
    /// Run stopped early.
    Stopped,
}

/// Snapshot passed to progress callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationProgress {
    /// Current generation number.
    pub generation: usize,
    /// Total generations planned.
    pub total_generations: usize,
    /// Evaluations dispatched so far.
    pub evaluations_total: usize,
    /// Latest logbook row.
    pub latest: Option<GenerationRecord>,
    /// Current first front.
    pub pareto_front: Vec<ParetoEntry>,
    pub phase: OptimizationPhase,
}

/// Final result of an optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// First front of the final population, sorted by cost.
    pub pareto_front: Vec<ParetoEntry>,
    /// Final population sorted by rank, then cost.
    pub population: Vec<ParetoEntry>,
    /// Logbook.
    pub history: Vec<GenerationRecord>,
    pub stats: OptimizationStats,
}

/// Statistics from the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationStats {
    /// Generations run after the initial one.
    pub generations: usize,
    /// Simulator evaluations performed.
    pub total_evaluations: usize,
    /// Evaluations that fell back to the sentinel fitness.
    pub failed_evaluations: usize,
    /// Final hypervolume.
    pub hypervolume: f64,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    /// Evaluations per second.
    pub evaluations_per_second: f64,
    /// Reason for stopping.
    pub stop_reason: StopReason,
}

/// Reason the run stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Generation budget exhausted.
    MaxGenerations,
    /// Cancelled through the cancel handle.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_stats() {
        let stats = ObjectiveStats::from_values(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.avg, 2.5);
        assert!((stats.std - 1.118_033_988).abs() < 1e-6);
    }

    #[test]
    fn test_objective_stats_empty() {
        assert_eq!(ObjectiveStats::from_values(&[]), ObjectiveStats::default());
    }

    #[test]
    fn test_result_serialization() {
        let result = OptimizationResult {
            pareto_front: vec![ParetoEntry {
                scenario_id: Some(ScenarioId(7)),
                cost: 12.0,
                effectiveness: 0.4,
                rank: 0,
                gene_values: vec![0, 1],
            }],
            population: Vec::new(),
            history: Vec::new(),
            stats: OptimizationStats {
                generations: 2,
                total_evaluations: 12,
                failed_evaluations: 0,
                hypervolume: 1.5,
                elapsed_seconds: 3.0,
                evaluations_per_second: 4.0,
                stop_reason: StopReason::MaxGenerations,
            },
        };

        let json = serde_json::to_string(&result).unwrap();
        let back: OptimizationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pareto_front[0].scenario_id, Some(ScenarioId(7)));
        assert_eq!(back.stats.stop_reason, StopReason::MaxGenerations);
    }
}
