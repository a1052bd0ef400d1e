//! BMP definitions and the catalog that answers suitability and compatibility queries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{ConfigError, SpatialUnit, UnitMode};

/// Gene value meaning "no BMP configured".
pub const NO_BMP: u32 = 0;

fn default_grade() -> u32 {
    1
}

/// Per-area cost terms of a BMP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaCosts {
    /// One-off implementation cost per unit area.
    #[serde(default)]
    pub capex: f64,
    /// Yearly operation and maintenance cost per unit area.
    #[serde(default)]
    pub opex: f64,
    /// Yearly income per unit area.
    #[serde(default)]
    pub income: f64,
}

impl AreaCosts {
    /// Net cost over `runtime_years` on `area`.
    pub fn net(&self, area: f64, runtime_years: f64) -> f64 {
        area * (self.capex + (self.opex - self.income) * runtime_years)
    }
}

/// A Best Management Practice that can be placed on a spatial unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bmp {
    /// Identifier used as gene value (never 0).
    pub id: u32,
    /// Slope position tags where the BMP applies. Empty means everywhere.
    #[serde(default)]
    pub positions: BTreeSet<u32>,
    /// Landuse codes where the BMP applies. Empty means everywhere.
    #[serde(default)]
    pub landuses: BTreeSet<i64>,
    /// BMPs that may not sit on a connected upstream/downstream pair with this one.
    #[serde(default)]
    pub incompatible_with: BTreeSet<u32>,
    /// Cost of configuring the BMP on one unit.
    pub unit_cost: f64,
    /// Relative effectiveness, used by the slope-position grade rule.
    #[serde(default = "default_grade")]
    pub effectiveness_grade: u32,
    /// Area-based costing; units with a known area use it instead of `unit_cost`.
    #[serde(default)]
    pub area_costs: Option<AreaCosts>,
}

impl Bmp {
    /// Create a BMP applicable everywhere with the default grade.
    pub fn new(id: u32, unit_cost: f64) -> Self {
        Self {
            id,
            positions: BTreeSet::new(),
            landuses: BTreeSet::new(),
            incompatible_with: BTreeSet::new(),
            unit_cost,
            effectiveness_grade: default_grade(),
            area_costs: None,
        }
    }

    pub fn with_positions(mut self, positions: impl IntoIterator<Item = u32>) -> Self {
        self.positions = positions.into_iter().collect();
        self
    }

    pub fn with_landuses(mut self, landuses: impl IntoIterator<Item = i64>) -> Self {
        self.landuses = landuses.into_iter().collect();
        self
    }

    pub fn with_incompatible(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.incompatible_with = ids.into_iter().collect();
        self
    }

    pub fn with_grade(mut self, grade: u32) -> Self {
        self.effectiveness_grade = grade;
        self
    }

    pub fn with_area_costs(mut self, costs: AreaCosts) -> Self {
        self.area_costs = Some(costs);
        self
    }

    /// Cost of configuring the BMP on `unit`.
    ///
    /// With area costs and a unit area, the net cost over `runtime_years`
    /// is charged, and nothing when the unit's landuse is outside the BMP's
    /// landuses. Otherwise the flat `unit_cost` applies.
    pub fn cost_on(&self, unit: Option<&SpatialUnit>, runtime_years: f64) -> f64 {
        let area = unit.and_then(|u| u.area);
        match (self.area_costs, area) {
            (Some(costs), Some(area)) => {
                let landuse_matches = self.landuses.is_empty()
                    || unit
                        .and_then(|u| u.landuse)
                        .is_none_or(|lu| self.landuses.contains(&lu));
                if landuse_matches {
                    costs.net(area, runtime_years)
                } else {
                    0.0
                }
            }
            _ => self.unit_cost,
        }
    }

    /// Whether the BMP may be configured on `unit` under the given unit mode.
    pub fn applies_to(&self, unit: &SpatialUnit, mode: UnitMode) -> bool {
        match mode {
            UnitMode::SlopePosition => {
                self.positions.is_empty()
                    || unit
                        .position_tag
                        .is_some_and(|tag| self.positions.contains(&tag))
            }
            _ => {
                self.landuses.is_empty()
                    || unit
                        .landuse
                        .is_some_and(|lu| self.landuses.contains(&lu))
            }
        }
    }
}

/// BMP description as written in the `bmps_info` JSON option.
///
/// Upper-case aliases follow the SEIMS BMP table column names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BmpRecord {
    #[serde(default, alias = "SLPPOS")]
    pub positions: Option<Vec<u32>>,
    #[serde(default, alias = "LANDUSE")]
    pub landuses: Option<Vec<i64>>,
    #[serde(default, alias = "INCOMPATIBLE")]
    pub incompatible_with: Option<Vec<u32>>,
    #[serde(default, alias = "COST")]
    pub unit_cost: Option<f64>,
    #[serde(default, alias = "EFFECTIVENESS")]
    pub effectiveness: Option<u32>,
    #[serde(default, alias = "CAPEX")]
    pub capex: Option<f64>,
    #[serde(default, alias = "OPEX")]
    pub opex: Option<f64>,
    #[serde(default, alias = "INCOME")]
    pub income: Option<f64>,
}

impl BmpRecord {
    /// Area costs when any of the per-area terms is given.
    fn area_costs(&self) -> Option<AreaCosts> {
        if self.capex.is_none() && self.opex.is_none() && self.income.is_none() {
            return None;
        }
        Some(AreaCosts {
            capex: self.capex.unwrap_or(0.0),
            opex: self.opex.unwrap_or(0.0),
            income: self.income.unwrap_or(0.0),
        })
    }
}

/// The BMP universe of one optimization run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BmpCatalog {
    bmps: BTreeMap<u32, Bmp>,
}

impl BmpCatalog {
    /// Build a catalog, rejecting the reserved id and invalid costs.
    pub fn new(bmps: impl IntoIterator<Item = Bmp>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for bmp in bmps {
            if bmp.id == NO_BMP {
                return Err(ConfigError::ReservedBmpId);
            }
            if !bmp.unit_cost.is_finite() || bmp.unit_cost < 0.0 {
                return Err(ConfigError::InvalidValue {
                    section: "BMPs".into(),
                    key: format!("cost of BMP {}", bmp.id),
                    value: bmp.unit_cost.to_string(),
                });
            }
            if let Some(costs) = bmp.area_costs
                && [costs.capex, costs.opex, costs.income]
                    .iter()
                    .any(|v| !v.is_finite() || *v < 0.0)
            {
                return Err(ConfigError::InvalidValue {
                    section: "BMPs".into(),
                    key: format!("area costs of BMP {}", bmp.id),
                    value: format!("{costs:?}"),
                });
            }
            map.insert(bmp.id, bmp);
        }
        Ok(Self { bmps: map })
    }

    /// Merge the `bmp_areal_struct` id/cost lists with optional typed records.
    ///
    /// Costs from the lists take precedence over record costs.
    pub fn from_parts(
        ids: &[u32],
        costs: &[f64],
        records: &BTreeMap<u32, BmpRecord>,
    ) -> Result<Self, ConfigError> {
        if ids.len() != costs.len() {
            return Err(ConfigError::BmpCostMismatch {
                ids: ids.len(),
                costs: costs.len(),
            });
        }

        let mut listed_costs: BTreeMap<u32, f64> = BTreeMap::new();
        for (&id, &cost) in ids.iter().zip(costs) {
            listed_costs.insert(id, cost);
        }

        let all_ids: BTreeSet<u32> = listed_costs
            .keys()
            .chain(records.keys())
            .copied()
            .collect();

        let bmps = all_ids.into_iter().map(|id| {
            let record = records.get(&id).cloned().unwrap_or_default();
            let cost = listed_costs
                .get(&id)
                .copied()
                .or(record.unit_cost)
                .unwrap_or(0.0);
            let mut bmp = Bmp::new(id, cost);
            if let Some(positions) = record.positions.clone() {
                bmp = bmp.with_positions(positions);
            }
            if let Some(landuses) = record.landuses.clone() {
                bmp = bmp.with_landuses(landuses);
            }
            if let Some(incompatible) = record.incompatible_with.clone() {
                bmp = bmp.with_incompatible(incompatible);
            }
            if let Some(grade) = record.effectiveness {
                bmp = bmp.with_grade(grade);
            }
            if let Some(costs) = record.area_costs() {
                bmp = bmp.with_area_costs(costs);
            }
            bmp
        });

        Self::new(bmps)
    }

    pub fn get(&self, id: u32) -> Option<&Bmp> {
        self.bmps.get(&id)
    }

    pub fn len(&self) -> usize {
        self.bmps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bmps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bmp> {
        self.bmps.values()
    }

    /// All gene values a unit may take, including [`NO_BMP`].
    pub fn universe(&self) -> Vec<u32> {
        std::iter::once(NO_BMP)
            .chain(self.bmps.keys().copied())
            .collect()
    }

    pub fn unit_cost(&self, id: u32) -> Option<f64> {
        self.bmps.get(&id).map(|b| b.unit_cost)
    }

    /// Cost of gene value `id` on `unit`; unknown ids cost as much as the
    /// dearest BMP there.
    pub fn cost_on(&self, id: u32, unit: Option<&SpatialUnit>, runtime_years: f64) -> f64 {
        match self.bmps.get(&id) {
            Some(bmp) => bmp.cost_on(unit, runtime_years),
            None => self.max_cost_on(unit, runtime_years),
        }
    }

    /// Highest cost any BMP would incur on `unit`, at least 0.
    pub fn max_cost_on(&self, unit: Option<&SpatialUnit>, runtime_years: f64) -> f64 {
        self.bmps
            .values()
            .map(|b| b.cost_on(unit, runtime_years))
            .fold(0.0, f64::max)
    }

    /// Effectiveness grade of a gene value. [`NO_BMP`] and unknown ids grade 0.
    pub fn grade(&self, id: u32) -> u32 {
        self.bmps.get(&id).map_or(0, |b| b.effectiveness_grade)
    }

    /// Whether either BMP declares the other incompatible.
    pub fn conflicts(&self, a: u32, b: u32) -> bool {
        let declared = |x: u32, y: u32| {
            self.bmps
                .get(&x)
                .is_some_and(|bmp| bmp.incompatible_with.contains(&y))
        };
        declared(a, b) || declared(b, a)
    }

    /// BMPs applicable on `unit`, excluding [`NO_BMP`].
    pub fn suitable_bmps(&self, unit: &SpatialUnit, mode: UnitMode) -> BTreeSet<u32> {
        self.bmps
            .values()
            .filter(|b| b.applies_to(unit, mode))
            .map(|b| b.id)
            .collect()
    }
}
