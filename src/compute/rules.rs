//! Domain rules: which BMPs a unit may take given its neighbours' current genes.

use std::collections::BTreeSet;

use crate::schema::{BmpCatalog, NO_BMP, RuleMethod, UnitMode, UnitsInfo};

use super::index::GeneIndexMap;

/// Everything the rule engine needs to look at besides the individual.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub units: &'a UnitsInfo,
    pub index: &'a GeneIndexMap,
    pub catalog: &'a BmpCatalog,
    pub mode: UnitMode,
    pub method: RuleMethod,
}

/// Admissible gene values for `unit_id` within `individual`.
///
/// Starts from the BMPs suitable for the unit's position tag (or landuse)
/// plus [`NO_BMP`], then drops every candidate that conflicts with a BMP
/// already placed on an upstream neighbour. `UpDown` and `SlopePosition`
/// methods refine the set further. The result is sorted and always
/// contains [`NO_BMP`].
pub fn admissible_bmps(unit_id: u32, individual: &[u32], ctx: &RuleContext<'_>) -> Vec<u32> {
    let Some(unit) = ctx.units.get(unit_id) else {
        return vec![NO_BMP];
    };
    let gene = |id: u32| ctx.index.value_of(individual, id);

    let mut candidates = ctx.catalog.suitable_bmps(unit, ctx.mode);
    for &up in &unit.upstream {
        let placed = gene(up);
        if placed != NO_BMP {
            candidates.retain(|&c| !ctx.catalog.conflicts(placed, c));
        }
    }

    match ctx.method {
        RuleMethod::UpDown => {
            if let Some(down) = unit.downstream {
                let down_configured = gene(down) != NO_BMP;
                let up_configured = unit.upstream.iter().any(|&u| gene(u) != NO_BMP);
                if down_configured || up_configured {
                    candidates.clear();
                }
            }
        }
        RuleMethod::SlopePosition => {
            let up = unit.upstream.first().map(|&u| gene(u));
            let down = unit.downstream.map(gene);
            let refined = grade_filter(&candidates, up, down, ctx.catalog);
            if !refined.is_empty() {
                candidates = refined;
            }
        }
        RuleMethod::Random | RuleMethod::Suitability => {}
    }

    candidates.insert(NO_BMP);
    candidates.into_iter().collect()
}

/// Keep BMPs whose effectiveness grade fits between the upslope and downslope BMPs.
///
/// `up`/`down` are `None` at the top/bottom of a hillslope.
fn grade_filter(
    candidates: &BTreeSet<u32>,
    up: Option<u32>,
    down: Option<u32>,
    catalog: &BmpCatalog,
) -> BTreeSet<u32> {
    let keep = |pred: &dyn Fn(u32) -> bool| {
        candidates
            .iter()
            .copied()
            .filter(|&id| pred(catalog.grade(id)))
            .collect()
    };
    match (up, down) {
        (None, Some(d)) if d != NO_BMP => {
            let down_grade = catalog.grade(d);
            keep(&|g| g <= down_grade)
        }
        (Some(u), None) if u != NO_BMP => {
            let up_grade = catalog.grade(u);
            keep(&|g| g >= up_grade)
        }
        (Some(u), Some(d)) => {
            let up_grade = catalog.grade(u);
            if d == NO_BMP {
                keep(&|g| g >= up_grade)
            } else {
                let down_grade = catalog.grade(d);
                keep(&|g| up_grade <= g && g <= down_grade)
            }
        }
        _ => BTreeSet::new(),
    }
}
