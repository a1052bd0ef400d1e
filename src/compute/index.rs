//! Gene index construction: the bijection between spatial units and gene positions.

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::{ConfigError, NO_BMP, UnitMode, UnitsInfo};

/// Bijection between unit ids and contiguous gene indices `0..N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneIndexMap {
    unit_to_gene: BTreeMap<u32, usize>,
    gene_to_unit: Vec<u32>,
}

impl GeneIndexMap {
    fn push(&mut self, unit_id: u32) -> bool {
        if self.unit_to_gene.contains_key(&unit_id) {
            return false;
        }
        self.unit_to_gene.insert(unit_id, self.gene_to_unit.len());
        self.gene_to_unit.push(unit_id);
        true
    }

    pub fn gene_of(&self, unit_id: u32) -> Option<usize> {
        self.unit_to_gene.get(&unit_id).copied()
    }

    pub fn unit_of(&self, gene: usize) -> Option<u32> {
        self.gene_to_unit.get(gene).copied()
    }

    pub fn len(&self) -> usize {
        self.gene_to_unit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gene_to_unit.is_empty()
    }

    /// Unit ids ordered by gene index.
    pub fn units_in_gene_order(&self) -> &[u32] {
        &self.gene_to_unit
    }

    /// Gene value of `unit_id` in `individual`, [`NO_BMP`] when unknown.
    pub fn value_of(&self, individual: &[u32], unit_id: u32) -> u32 {
        self.gene_of(unit_id)
            .and_then(|g| individual.get(g).copied())
            .unwrap_or(NO_BMP)
    }

    /// Unit ids grouped by configured BMP.
    pub fn assignments(&self, individual: &[u32]) -> BTreeMap<u32, Vec<u32>> {
        let mut grouped: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (gene, &bmp) in individual.iter().enumerate() {
            if bmp == NO_BMP {
                continue;
            }
            if let Some(unit) = self.unit_of(gene) {
                grouped.entry(bmp).or_default().push(unit);
            }
        }
        grouped
    }
}

/// Build the gene index for `units`.
///
/// Slope-position units are walked from every top-of-hillslope unit down the
/// downstream pointers, so each hillslope occupies consecutive genes ordered
/// summit to valley. Other modes use ascending unit id order.
pub fn build_index(units: &UnitsInfo, mode: UnitMode) -> Result<GeneIndexMap, ConfigError> {
    let mut index = GeneIndexMap {
        unit_to_gene: BTreeMap::new(),
        gene_to_unit: Vec::with_capacity(units.len()),
    };

    match mode {
        UnitMode::SlopePosition => {
            for top in units.top_units() {
                let mut visited = BTreeSet::new();
                let mut current = Some(top);
                while let Some(id) = current {
                    if !visited.insert(id) || !index.push(id) {
                        break;
                    }
                    current = units.get(id).and_then(|u| u.downstream);
                }
            }
        }
        _ => {
            for unit in units.iter() {
                index.push(unit.id);
            }
        }
    }

    if index.len() != units.all_units {
        return Err(ConfigError::UnitCountMismatch {
            expected: units.all_units,
            found: index.len(),
        });
    }
    log::debug!("Built gene index for {} units ({:?})", index.len(), mode);
    Ok(index)
}
