//! Crossover and mutation operators over BMP gene arrays.
//!
//! Rule-aware operators keep hillslope chains and upstream/downstream
//! commitments intact; the random variants ignore domain knowledge and
//! serve as a baseline.

use std::collections::{BTreeSet, VecDeque};

use rand::prelude::*;

use crate::compute::index::GeneIndexMap;
use crate::compute::rules::{RuleContext, admissible_bmps};
use crate::schema::{NO_BMP, UnitsInfo};

/// Random number generator wrapper for gene operations.
pub struct GeneRng {
    rng: StdRng,
}

impl GeneRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create with random seed.
    pub fn random() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Uniform integer in `[low, high]`.
    pub fn int_inclusive(&mut self, low: usize, high: usize) -> usize {
        self.rng.gen_range(low..=high)
    }

    /// Uniform float in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    /// True with probability `p`.
    pub fn chance(&mut self, p: f64) -> bool {
        self.unit() < p
    }

    pub fn choose(&mut self, values: &[u32]) -> Option<u32> {
        values.choose(&mut self.rng).copied()
    }

    pub fn shuffle<T>(&mut self, values: &mut [T]) {
        values.shuffle(&mut self.rng);
    }
}

fn clamp_perc(perc: f64) -> f64 {
    perc.clamp(0.01, 0.5)
}

/// Draw the number of mutation attempts, `None` when the bound rounds to zero.
fn mutation_count(rng: &mut GeneRng, genes: usize, perc: f64) -> Option<usize> {
    let limit = (genes as f64 * clamp_perc(perc)) as usize;
    (limit >= 1).then(|| rng.int_inclusive(1, limit))
}

/// Pick a position in `0..len` that is not in `taken`.
fn fresh_point(rng: &mut GeneRng, len: usize, taken: &BTreeSet<usize>) -> Option<usize> {
    if taken.len() >= len {
        return None;
    }
    loop {
        let point = rng.int_inclusive(0, len - 1);
        if !taken.contains(&point) {
            return Some(point);
        }
    }
}

fn swap_region(ind1: &mut [u32], ind2: &mut [u32], start: usize, end: usize) {
    ind1[start..end].swap_with_slice(&mut ind2[start..end]);
}

// ============================================================================
// Crossover
// ============================================================================

/// Two-point crossover with cut points on hillslope boundaries.
///
/// `hillslope_genes` is the gene count of one hillslope chain. The swapped
/// region is never empty and never the whole array. Individuals with at most
/// two hillslopes are left untouched and `false` is returned.
pub fn crossover_slppos(
    rng: &mut GeneRng,
    ind1: &mut [u32],
    ind2: &mut [u32],
    hillslope_genes: usize,
) -> bool {
    let size = ind1.len().min(ind2.len());
    let n = hillslope_genes;
    if n == 0 || size <= 2 * n {
        return false;
    }

    let (start, end) = loop {
        let mut c1 = rng.int_inclusive(0, size - 1);
        let mut c2 = rng.int_inclusive(1, size);
        if c2 < c1 {
            std::mem::swap(&mut c1, &mut c2);
        }
        c1 = c1 / n * n;
        if c2 % n != 0 {
            c2 = n * (c2 / n + 1);
        }
        if c1 == c2 {
            c2 += n;
        }
        let c2 = c2.min(size);
        if !(c1 == 0 && c2 == size) {
            break (c1, c2);
        }
    };

    swap_region(ind1, ind2, start, end);
    log::debug!("Hillslope crossover swapped genes [{start}, {end})");
    true
}

/// Two-point crossover at arbitrary cut points.
///
/// The swapped region is never empty and never the whole array.
pub fn crossover_rdm(rng: &mut GeneRng, ind1: &mut [u32], ind2: &mut [u32]) -> bool {
    let size = ind1.len().min(ind2.len());
    if size < 2 {
        return false;
    }

    let (start, end) = loop {
        let mut c1 = rng.int_inclusive(0, size - 1);
        let mut c2 = rng.int_inclusive(1, size);
        if c2 < c1 {
            std::mem::swap(&mut c1, &mut c2);
        } else {
            c2 += 1;
        }
        let c2 = c2.min(size);
        if !(c1 == 0 && c2 == size) {
            break (c1, c2);
        }
    };

    swap_region(ind1, ind2, start, end);
    true
}

/// Subtree exchange for hydrologically connected fields.
///
/// A random gene is picked; if placing each parent's value into the other
/// would put two configured BMPs on a downstream link, the downstream genes
/// are tried in breadth-first order. The unit found and everything draining
/// into it are exchanged.
pub fn crossover_updown(
    rng: &mut GeneRng,
    ind1: &mut [u32],
    ind2: &mut [u32],
    index: &GeneIndexMap,
    units: &UnitsInfo,
) -> bool {
    let size = ind1.len().min(ind2.len()).min(index.len());
    if size == 0 {
        return false;
    }

    let valid = |gene: usize, value: u32, ind: &[u32]| -> bool {
        if value == NO_BMP {
            return true;
        }
        let downstream = index
            .unit_of(gene)
            .and_then(|id| units.get(id))
            .and_then(|u| u.downstream);
        downstream.is_none_or(|d| index.value_of(ind, d) == NO_BMP)
    };

    let mut queue = VecDeque::from([rng.int_inclusive(0, size - 1)]);
    let mut tried = BTreeSet::new();
    let mut point = None;
    while let Some(gene) = queue.pop_front() {
        if !tried.insert(gene) {
            continue;
        }
        if valid(gene, ind2[gene], ind1) && valid(gene, ind1[gene], ind2) {
            point = Some(gene);
            break;
        }
        let down_gene = index
            .unit_of(gene)
            .and_then(|id| units.get(id))
            .and_then(|u| u.downstream)
            .and_then(|d| index.gene_of(d));
        if let Some(next) = down_gene {
            queue.push_back(next);
        }
    }

    let Some(root) = point.and_then(|g| index.unit_of(g)) else {
        return false;
    };
    let genes: Vec<usize> = units
        .subtree(root)
        .into_iter()
        .filter_map(|id| index.gene_of(id))
        .filter(|&g| g < size)
        .collect();
    if genes.len() >= size {
        return false;
    }
    if genes.iter().all(|&g| ind1[g] == ind2[g]) {
        return false;
    }

    for &g in &genes {
        std::mem::swap(&mut ind1[g], &mut ind2[g]);
    }
    log::debug!(
        "Subtree crossover at unit {root} exchanged {} genes",
        genes.len()
    );
    true
}

// ============================================================================
// Mutation
// ============================================================================

/// Rule-aware mutation.
///
/// Draws up to `len * perc` attempts (`perc` clamped to [0.01, 0.5]); each
/// attempt happens with probability `indpb` and replaces a not yet mutated
/// gene with a value from its admissible set minus the old value. Empty sets
/// leave the gene unchanged. Returns the number of mutated genes.
pub fn mutate_rule(
    rng: &mut GeneRng,
    individual: &mut [u32],
    perc: f64,
    indpb: f64,
    ctx: &RuleContext<'_>,
) -> usize {
    let len = individual.len().min(ctx.index.len());
    let Some(attempts) = mutation_count(rng, len, perc) else {
        return 0;
    };

    let mut mutated = BTreeSet::new();
    for _ in 0..attempts {
        if rng.unit() >= indpb {
            continue;
        }
        let Some(point) = fresh_point(rng, len, &mutated) else {
            break;
        };
        let Some(unit_id) = ctx.index.unit_of(point) else {
            continue;
        };
        let old = individual[point];
        let options: Vec<u32> = admissible_bmps(unit_id, individual, ctx)
            .into_iter()
            .filter(|&b| b != old)
            .collect();
        if let Some(new) = rng.choose(&options) {
            individual[point] = new;
            mutated.insert(point);
            log::debug!("Mutated unit {unit_id}: {old} -> {new}");
        }
    }
    mutated.len()
}

/// Random mutation over the whole BMP universe.
///
/// Same two-stage sampling as [`mutate_rule`], drawing from
/// `universe + {0} - {old}`. Returns the number of mutated genes.
pub fn mutate_rdm(
    rng: &mut GeneRng,
    individual: &mut [u32],
    perc: f64,
    indpb: f64,
    universe: &[u32],
) -> usize {
    let len = individual.len();
    let Some(attempts) = mutation_count(rng, len, perc) else {
        return 0;
    };

    let targets: BTreeSet<u32> = universe
        .iter()
        .copied()
        .chain(std::iter::once(NO_BMP))
        .collect();

    let mut drawn = BTreeSet::new();
    let mut changed = 0;
    for _ in 0..attempts {
        if rng.unit() >= indpb {
            continue;
        }
        let Some(point) = fresh_point(rng, len, &drawn) else {
            break;
        };
        drawn.insert(point);
        let old = individual[point];
        let options: Vec<u32> = targets.iter().copied().filter(|&b| b != old).collect();
        if let Some(new) = rng.choose(&options) {
            individual[point] = new;
            changed += 1;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::index::build_index;
    use crate::schema::{Bmp, BmpCatalog, RuleMethod, SpatialUnit, UnitMode};
    use proptest::prelude::*;

    fn multiset(a: &[u32], b: &[u32]) -> Vec<u32> {
        let mut all: Vec<u32> = a.iter().chain(b).copied().collect();
        all.sort_unstable();
        all
    }

    /// Positions where the children differ from their respective parents.
    fn swapped_positions(p1: &[u32], c1: &[u32]) -> Vec<usize> {
        (0..p1.len()).filter(|&i| p1[i] != c1[i]).collect()
    }

    fn chains(count: u32) -> UnitsInfo {
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

    #[test]
    fn test_slppos_crossover_needs_three_hillslopes() {
        let mut rng = GeneRng::new(1);
        let mut a = vec![1; 6];
        let mut b = vec![2; 6];
        assert!(!crossover_slppos(&mut rng, &mut a, &mut b, 3));
        assert_eq!(a, vec![1; 6]);
    }

    #[test]
    fn test_slppos_crossover_swaps_whole_chains() {
        let mut rng = GeneRng::new(7);
        for _ in 0..200 {
            let mut a = vec![1; 12];
            let mut b = vec![2; 12];
            assert!(crossover_slppos(&mut rng, &mut a, &mut b, 3));
            let swapped = swapped_positions(&[1; 12], &a);
            assert!(!swapped.is_empty());
            assert!(swapped.len() < 12);
            assert_eq!(swapped.len() % 3, 0);
            assert_eq!(swapped[0] % 3, 0);
            // Region is contiguous.
            assert_eq!(swapped.last().unwrap() - swapped[0] + 1, swapped.len());
        }
    }

    #[test]
    fn test_rdm_crossover_never_clones() {
        let mut rng = GeneRng::new(3);
        for _ in 0..200 {
            let mut a = vec![1; 5];
            let mut b = vec![2; 5];
            assert!(crossover_rdm(&mut rng, &mut a, &mut b));
            let swapped = swapped_positions(&[1; 5], &a);
            assert!(!swapped.is_empty() && swapped.len() < 5);
        }
    }

    #[test]
    fn test_rdm_crossover_short_individual() {
        let mut rng = GeneRng::new(3);
        let mut a = vec![1];
        let mut b = vec![2];
        assert!(!crossover_rdm(&mut rng, &mut a, &mut b));
    }

    fn fields() -> (UnitsInfo, GeneIndexMap) {
        // 1 -> 3, 2 -> 3, 3 -> 5, 4 -> 5
        let units = UnitsInfo::from_units(
            5,
            [
                SpatialUnit::new(1).with_downstream(3),
                SpatialUnit::new(2).with_downstream(3),
                SpatialUnit::new(3).with_downstream(5),
                SpatialUnit::new(4).with_downstream(5),
                SpatialUnit::new(5),
            ],
        )
        .unwrap();
        let index = build_index(&units, UnitMode::ConnectedField).unwrap();
        (units, index)
    }

    #[test]
    fn test_updown_crossover_exchanges_subtrees() {
        let (units, index) = fields();
        let mut rng = GeneRng::new(11);
        let mut exchanged = 0;
        for _ in 0..100 {
            let p1 = vec![1, 0, 0, 2, 0];
            let p2 = vec![0, 3, 0, 0, 0];
            let (mut a, mut b) = (p1.clone(), p2.clone());
            if crossover_updown(&mut rng, &mut a, &mut b, &index, &units) {
                exchanged += 1;
                assert_eq!(multiset(&a, &b), multiset(&p1, &p2));
                let swapped = swapped_positions(&p1, &a);
                assert!(!swapped.is_empty() && swapped.len() < 5);
            } else {
                assert_eq!(a, p1);
                assert_eq!(b, p2);
            }
        }
        assert!(exchanged > 0);
    }

    #[test]
    fn test_updown_crossover_rejects_invalid_links() {
        let (units, index) = fields();
        let mut rng = GeneRng::new(5);
        // Both parents configure the outlet 5; any gene placed upstream of it conflicts,
        // and the outlet subtree covers every gene.
        for _ in 0..50 {
            let mut a = vec![1, 1, 1, 1, 4];
            let mut b = vec![2, 2, 2, 2, 4];
            assert!(!crossover_updown(&mut rng, &mut a, &mut b, &index, &units));
        }
    }

    #[test]
    fn test_mutate_rdm_changes_values() {
        let mut rng = GeneRng::new(9);
        let original = vec![1u32; 40];
        let mut ind = original.clone();
        let changed = mutate_rdm(&mut rng, &mut ind, 0.5, 1.0, &[1, 2, 3]);
        assert!(changed >= 1);
        assert!(changed <= 20);
        let diffs = swapped_positions(&original, &ind);
        assert_eq!(diffs.len(), changed);
    }

    #[test]
    fn test_mutation_noop_when_bound_rounds_to_zero() {
        let mut rng = GeneRng::new(9);
        let mut ind = vec![1u32; 10];
        // 10 * 0.05 = 0.5 -> no attempts
        assert_eq!(mutate_rdm(&mut rng, &mut ind, 0.05, 1.0, &[1, 2]), 0);
        assert_eq!(ind, vec![1; 10]);
    }

    #[test]
    fn test_mutate_rule_respects_constraints() {
        let units = UnitsInfo::from_units(
            3,
            [
                SpatialUnit::new(0).with_position_tag(1).with_downstream(1),
                SpatialUnit::new(1).with_position_tag(4).with_downstream(2),
                SpatialUnit::new(2).with_position_tag(16),
            ],
        )
        .unwrap();
        let index = build_index(&units, UnitMode::SlopePosition).unwrap();
        let catalog = BmpCatalog::new([
            Bmp::new(5, 1.0).with_positions([16]).with_incompatible([7]),
            Bmp::new(7, 1.0).with_positions([4]),
        ])
        .unwrap();
        let ctx = RuleContext {
            units: &units,
            index: &index,
            catalog: &catalog,
            mode: UnitMode::SlopePosition,
            method: RuleMethod::Suitability,
        };

        let mut rng = GeneRng::new(21);
        for _ in 0..300 {
            let mut ind = vec![0, 7, 0];
            mutate_rule(&mut rng, &mut ind, 0.5, 1.0, &ctx);
            if ind[1] == 7 {
                assert_ne!(ind[2], 5);
            }
            // Summit has nothing but NO_BMP available.
            assert_eq!(ind[0], 0);
        }
    }

    proptest! {
        #[test]
        fn prop_crossover_preserves_multiset(
            seed in any::<u64>(),
            (p1, p2) in (3usize..40).prop_flat_map(|n| (
                proptest::collection::vec(0u32..6, n),
                proptest::collection::vec(0u32..6, n),
            )),
        ) {
            let mut rng = GeneRng::new(seed);
            let (mut a, mut b) = (p1.clone(), p2.clone());
            crossover_rdm(&mut rng, &mut a, &mut b);
            prop_assert_eq!(multiset(&a, &b), multiset(&p1, &p2));
            for i in 0..p1.len() {
                let kept = a[i] == p1[i] && b[i] == p2[i];
                let swapped = a[i] == p2[i] && b[i] == p1[i];
                prop_assert!(kept || swapped);
            }
        }

        #[test]
        fn prop_slppos_region_is_multiple_of_chain(
            seed in any::<u64>(),
            hillslopes in 3usize..15,
            n in 1usize..5,
        ) {
            let size = hillslopes * n;
            let mut rng = GeneRng::new(seed);
            // Distinct parents so every swapped position is visible.
            let mut a: Vec<u32> = (0..size as u32).collect();
            let mut b: Vec<u32> = (0..size as u32).map(|v| v + 1000).collect();
            prop_assert!(crossover_slppos(&mut rng, &mut a, &mut b, n));
            let swapped: Vec<usize> = (0..size).filter(|&i| a[i] >= 1000).collect();
            prop_assert!(!swapped.is_empty());
            prop_assert!(swapped.len() < size);
            prop_assert_eq!(swapped.len() % n, 0);
            prop_assert_eq!(swapped[0] % n, 0);
        }

        #[test]
        fn prop_mutation_never_keeps_old_value(
            seed in any::<u64>(),
            ind in proptest::collection::vec(0u32..4, 2..60),
            perc in 0.0f64..1.0,
        ) {
            let mut rng = GeneRng::new(seed);
            let mut mutated = ind.clone();
            let changed = mutate_rdm(&mut rng, &mut mutated, perc, 1.0, &[1, 2, 3]);
            let diffs = (0..ind.len()).filter(|&i| ind[i] != mutated[i]).count();
            prop_assert_eq!(diffs, changed);
        }

        #[test]
        fn prop_rule_mutation_changes_every_counted_gene(
            seed in any::<u64>(),
            hillslopes in 1u32..10,
        ) {
            let units = chains(hillslopes);
            let index = build_index(&units, UnitMode::SlopePosition).unwrap();
            let catalog = BmpCatalog::new([
                Bmp::new(1, 1.0),
                Bmp::new(2, 1.0).with_positions([16]),
            ])
            .unwrap();
            let ctx = RuleContext {
                units: &units,
                index: &index,
                catalog: &catalog,
                mode: UnitMode::SlopePosition,
                method: RuleMethod::Suitability,
            };
            let mut rng = GeneRng::new(seed);
            let ind = vec![1u32; index.len()];
            let mut mutated = ind.clone();
            let changed = mutate_rule(&mut rng, &mut mutated, 0.5, 1.0, &ctx);
            let diffs = (0..ind.len()).filter(|&i| ind[i] != mutated[i]).count();
            prop_assert_eq!(diffs, changed);
        }
    }
}
