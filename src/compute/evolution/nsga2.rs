//! NSGA-II building blocks over two-objective fitness values.

use std::cmp::Ordering;

use crate::schema::Fitness;

use super::operators::GeneRng;

/// An individual that survived environmental selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ranked {
    /// Index into the fitness slice passed to [`sel_nsga2`].
    pub index: usize,
    /// Front number, 0 for the non-dominated front.
    pub rank: usize,
    pub crowding: f64,
}

/// Partition `fitness` into successive non-dominated fronts.
///
/// Every index appears in exactly one front.
pub fn fast_non_dominated_sort(fitness: &[Fitness]) -> Vec<Vec<usize>> {
    let n = fitness.len();
    let mut domination_count = vec![0usize; n];
    let mut dominated: Vec<Vec<usize>> = vec![Vec::new(); n];

    for i in 0..n {
        for j in (i + 1)..n {
            if fitness[i].dominates(&fitness[j]) {
                dominated[i].push(j);
                domination_count[j] += 1;
            } else if fitness[j].dominates(&fitness[i]) {
                dominated[j].push(i);
                domination_count[i] += 1;
            }
        }
    }

    let mut fronts = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| domination_count[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            for &j in &dominated[i] {
                domination_count[j] -= 1;
                if domination_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        fronts.push(current);
        current = next;
    }
    fronts
}

/// Crowding distance of each member of `front`, in `front` order.
///
/// Boundary points on either objective get infinite distance; interior gaps
/// are normalized by the objective range times the objective count.
pub fn crowding_distance(fitness: &[Fitness], front: &[usize]) -> Vec<f64> {
    const OBJECTIVES: usize = 2;
    let n = front.len();
    let mut distance = vec![0.0; n];
    if n == 0 {
        return distance;
    }

    let objective = |k: usize, i: usize| -> f64 {
        let f = fitness[front[i]];
        if k == 0 { f.cost } else { f.effectiveness }
    };

    for k in 0..OBJECTIVES {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            objective(k, a)
                .partial_cmp(&objective(k, b))
                .unwrap_or(Ordering::Equal)
        });
        let first = objective(k, order[0]);
        let last = objective(k, order[n - 1]);
        distance[order[0]] = f64::INFINITY;
        distance[order[n - 1]] = f64::INFINITY;
        if first == last {
            continue;
        }
        let norm = OBJECTIVES as f64 * (last - first);
        for w in order.windows(3) {
            let gap = objective(k, w[2]) - objective(k, w[0]);
            distance[w[1]] += gap / norm;
        }
    }
    distance
}

/// Elitist environmental selection of `k` individuals.
///
/// Whole fronts are taken in rank order; the front that does not fit is
/// truncated by descending crowding distance.
pub fn sel_nsga2(fitness: &[Fitness], k: usize) -> Vec<Ranked> {
    let mut chosen = Vec::with_capacity(k);
    for (rank, front) in fast_non_dominated_sort(fitness).into_iter().enumerate() {
        if chosen.len() >= k {
            break;
        }
        let crowding = crowding_distance(fitness, &front);
        let mut members: Vec<Ranked> = front
            .iter()
            .zip(crowding)
            .map(|(&index, crowding)| Ranked {
                index,
                rank,
                crowding,
            })
            .collect();

        let room = k - chosen.len();
        if members.len() > room {
            members.sort_by(|a, b| b.crowding.partial_cmp(&a.crowding).unwrap_or(Ordering::Equal));
            members.truncate(room);
        }
        chosen.extend(members);
    }
    chosen
}

/// Binary tournament on dominance, then crowding distance, then a coin flip.
fn tournament(rng: &mut GeneRng, a: usize, b: usize, fitness: &[Fitness], crowding: &[f64]) -> usize {
    if fitness[a].dominates(&fitness[b]) {
        return a;
    }
    if fitness[b].dominates(&fitness[a]) {
        return b;
    }
    if crowding[a] < crowding[b] {
        return b;
    }
    if crowding[a] > crowding[b] {
        return a;
    }
    if rng.unit() <= 0.5 { a } else { b }
}

/// Crowded tournament selection of `k` parents.
///
/// `fitness` and `crowding` are aligned. Two random permutations are walked
/// in groups of four, each group yielding two winners per permutation. `k`
/// is rounded down to a multiple of 4 and bounded by the candidate count.
pub fn sel_tournament_dcd(
    rng: &mut GeneRng,
    fitness: &[Fitness],
    crowding: &[f64],
    k: usize,
) -> Vec<usize> {
    let n = fitness.len().min(crowding.len());
    let k = k.min(n) / 4 * 4;

    let mut first: Vec<usize> = (0..n).collect();
    let mut second: Vec<usize> = (0..n).collect();
    rng.shuffle(&mut first);
    rng.shuffle(&mut second);

    let mut chosen = Vec::with_capacity(k);
    for i in (0..k).step_by(4) {
        for perm in [&first, &second] {
            chosen.push(tournament(rng, perm[i], perm[i + 1], fitness, crowding));
            chosen.push(tournament(rng, perm[i + 2], perm[i + 3], fitness, crowding));
        }
    }
    chosen
}

/// Area dominated by `front` and bounded by `reference`.
///
/// Cost is minimized and effectiveness maximized; only points strictly
/// better than the reference on both axes contribute.
pub fn hypervolume_2d(front: &[Fitness], reference: Fitness) -> f64 {
    let mut points: Vec<Fitness> = front
        .iter()
        .copied()
        .filter(|f| f.cost < reference.cost && f.effectiveness > reference.effectiveness)
        .collect();
    points.sort_by(|a, b| {
        a.cost
            .partial_cmp(&b.cost)
            .unwrap_or(Ordering::Equal)
            .then(b.effectiveness.partial_cmp(&a.effectiveness).unwrap_or(Ordering::Equal))
    });

    // Staircase: cost and effectiveness both increasing.
    let mut stairs: Vec<Fitness> = Vec::with_capacity(points.len());
    for p in points {
        if stairs.last().is_none_or(|s| p.effectiveness > s.effectiveness) {
            stairs.push(p);
        }
    }

    let mut volume = 0.0;
    for (i, p) in stairs.iter().enumerate() {
        let next_cost = stairs.get(i + 1).map_or(reference.cost, |q| q.cost);
        volume += (next_cost - p.cost) * (p.effectiveness - reference.effectiveness);
    }
    volume
}
