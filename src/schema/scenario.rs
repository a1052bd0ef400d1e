//! Scenario identifiers, fitness values and store records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of one evaluated scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(pub u64);

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two-objective fitness: minimize `cost`, maximize `effectiveness`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fitness {
    pub cost: f64,
    pub effectiveness: f64,
}

impl Fitness {
    /// Placeholder ranking of individuals without fitness. Dominated by everything.
    pub const UNEVALUATED: Fitness = Fitness {
        cost: f64::INFINITY,
        effectiveness: f64::NEG_INFINITY,
    };

    pub fn new(cost: f64, effectiveness: f64) -> Self {
        Self {
            cost,
            effectiveness,
        }
    }

    /// Pareto dominance: no worse in both objectives and better in one.
    pub fn dominates(&self, other: &Fitness) -> bool {
        let no_worse = self.cost <= other.cost && self.effectiveness >= other.effectiveness;
        let better = self.cost < other.cost || self.effectiveness > other.effectiveness;
        no_worse && better
    }
}

/// Scenario document written to the scenario store and read by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: ScenarioId,
    /// BMP id per gene index.
    pub gene_values: Vec<u32>,
    /// Unit ids grouped by configured BMP id.
    pub assignments: BTreeMap<u32, Vec<u32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominance() {
        let cheap_good = Fitness::new(10.0, 0.5);
        let dear_good = Fitness::new(20.0, 0.5);
        let cheap_bad = Fitness::new(10.0, 0.1);

        assert!(cheap_good.dominates(&dear_good));
        assert!(cheap_good.dominates(&cheap_bad));
        assert!(!dear_good.dominates(&cheap_bad));
        assert!(!cheap_bad.dominates(&dear_good));
        assert!(!cheap_good.dominates(&cheap_good));
        assert!(cheap_bad.dominates(&Fitness::UNEVALUATED));
    }

    #[test]
    fn test_record_json_shape() {
        let record = ScenarioRecord {
            id: ScenarioId(123456789),
            gene_values: vec![0, 5, 5],
            assignments: BTreeMap::from([(5, vec![11, 12])]),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 123456789);
        assert_eq!(json["assignments"]["5"][1], 12);
    }
}
