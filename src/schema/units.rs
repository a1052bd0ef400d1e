//! Spatial unit records loaded from the preprocessing units metadata file.
//!
//! The metadata file is JSON shaped as
//! `{"overview": {"all_units": N}, "units": {...}, "<position_name>": {"<id>": {...}}}`.
//! Slope-position runs read the position-named sections, every other unit
//! mode reads `units`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ConfigError, PositionTag, UnitMode};

/// An atomic area a BMP can be assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialUnit {
    /// Unit identifier, unique within the watershed.
    pub id: u32,
    /// Slope position tag (e.g. summit=1, backslope=4, valley=16).
    #[serde(default)]
    pub position_tag: Option<u32>,
    /// Primary landuse code.
    #[serde(default)]
    pub landuse: Option<i64>,
    /// The single downstream neighbour, if any.
    #[serde(default)]
    pub downstream: Option<u32>,
    /// Units whose downstream pointer is this unit (derived on load).
    #[serde(default)]
    pub upstream: Vec<u32>,
    /// Unit area.
    #[serde(default)]
    pub area: Option<f64>,
}

impl SpatialUnit {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            position_tag: None,
            landuse: None,
            downstream: None,
            upstream: Vec::new(),
            area: None,
        }
    }

    pub fn with_position_tag(mut self, tag: u32) -> Self {
        self.position_tag = Some(tag);
        self
    }

    pub fn with_landuse(mut self, landuse: i64) -> Self {
        self.landuse = Some(landuse);
        self
    }

    pub fn with_downstream(mut self, downstream: u32) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn with_area(mut self, area: f64) -> Self {
        self.area = Some(area);
        self
    }
}

/// Validated set of spatial units for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsInfo {
    /// Unit count declared by the metadata overview.
    pub all_units: usize,
    units: BTreeMap<u32, SpatialUnit>,
}

// ============================================================================
// Raw metadata document
// ============================================================================

#[derive(Debug, Deserialize)]
struct UnitsDocument {
    overview: Overview,
    #[serde(default)]
    units: BTreeMap<String, RawUnit>,
    #[serde(flatten)]
    sections: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Overview {
    all_units: usize,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    #[serde(default)]
    downslope: Option<Neighbours>,
    #[serde(default)]
    primarylanduse: Option<i64>,
    #[serde(default)]
    area: Option<f64>,
}

/// `downslope` is a scalar for slope positions and a list for fields.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Neighbours {
    One(i64),
    Many(Vec<i64>),
}

impl Neighbours {
    /// First positive id. Values <= 0 mark the end of a chain.
    fn first_positive(&self) -> Option<u32> {
        let positive = |v: i64| (v > 0).then(|| u32::try_from(v).ok()).flatten();
        match self {
            Self::One(v) => positive(*v),
            Self::Many(vs) => vs.iter().copied().find_map(positive),
        }
    }
}

fn parse_unit_id(section: &str, key: &str) -> Result<u32, ConfigError> {
    key.trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidValue {
            section: section.to_string(),
            key: "unit id".into(),
            value: key.to_string(),
        })
}

fn raw_to_unit(id: u32, raw: &RawUnit) -> SpatialUnit {
    SpatialUnit {
        id,
        position_tag: None,
        landuse: raw.primarylanduse,
        downstream: raw.downslope.as_ref().and_then(Neighbours::first_positive),
        upstream: Vec::new(),
        area: raw.area,
    }
}

impl UnitsInfo {
    /// Validate units and derive upstream neighbours from downstream pointers.
    pub fn from_units(
        all_units: usize,
        units: impl IntoIterator<Item = SpatialUnit>,
    ) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for mut unit in units {
            unit.upstream.clear();
            let id = unit.id;
            if map.insert(id, unit).is_some() {
                return Err(ConfigError::DuplicateUnit(id));
            }
        }

        let links: Vec<(u32, u32)> = map
            .values()
            .filter_map(|u| u.downstream.map(|d| (u.id, d)))
            .collect();
        for (id, down) in links {
            if id == down {
                return Err(ConfigError::InvalidValue {
                    section: "units".into(),
                    key: format!("downslope of unit {id}"),
                    value: down.to_string(),
                });
            }
            match map.get_mut(&down) {
                Some(target) => target.upstream.push(id),
                None => {
                    return Err(ConfigError::UnknownDownstream {
                        unit: id,
                        downstream: down,
                    });
                }
            }
        }

        Ok(Self {
            all_units,
            units: map,
        })
    }

    /// Parse the units metadata JSON for the given unit mode.
    pub fn from_json_str(
        json: &str,
        mode: UnitMode,
        tags: &[PositionTag],
    ) -> Result<Self, ConfigError> {
        let doc: UnitsDocument =
            serde_json::from_str(json).map_err(|source| ConfigError::Json {
                context: "units metadata".into(),
                source,
            })?;

        let mut units = Vec::new();
        match mode {
            UnitMode::SlopePosition => {
                let mut seen = BTreeSet::new();
                for tag in tags {
                    let value = doc
                        .sections
                        .get(&tag.name)
                        .ok_or_else(|| ConfigError::MissingPositionSection(tag.name.clone()))?;
                    let section: BTreeMap<String, RawUnit> =
                        serde_json::from_value(value.clone()).map_err(|source| {
                            ConfigError::Json {
                                context: format!("units section '{}'", tag.name),
                                source,
                            }
                        })?;
                    for (key, raw) in &section {
                        let id = parse_unit_id(&tag.name, key)?;
                        if !seen.insert(id) {
                            return Err(ConfigError::DuplicateUnit(id));
                        }
                        let mut unit = raw_to_unit(id, raw);
                        unit.position_tag = Some(tag.tag);
                        units.push(unit);
                    }
                }
            }
            _ => {
                for (key, raw) in &doc.units {
                    units.push(raw_to_unit(parse_unit_id("units", key)?, raw));
                }
            }
        }

        Self::from_units(doc.overview.all_units, units)
    }

    /// Load the units metadata file.
    pub fn load<P: AsRef<Path>>(
        path: P,
        mode: UnitMode,
        tags: &[PositionTag],
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json, mode, tags)
    }

    pub fn get(&self, id: u32) -> Option<&SpatialUnit> {
        self.units.get(&id)
    }

    /// Units in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &SpatialUnit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units carrying the lowest position tag, i.e. the top of each hillslope.
    pub fn top_units(&self) -> Vec<u32> {
        let Some(top_tag) = self.units.values().filter_map(|u| u.position_tag).min() else {
            return Vec::new();
        };
        self.units
            .values()
            .filter(|u| u.position_tag == Some(top_tag))
            .map(|u| u.id)
            .collect()
    }

    /// `root` followed by every unit draining into it, breadth first.
    pub fn subtree(&self, root: u32) -> Vec<u32> {
        let mut visited = BTreeSet::from([root]);
        let mut order = vec![root];
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let Some(unit) = self.units.get(&id) else {
                continue;
            };
            for &up in &unit.upstream {
                if visited.insert(up) {
                    order.push(up);
                    queue.push_back(up);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<PositionTag> {
        vec![
            PositionTag::new(1, "summit"),
            PositionTag::new(4, "backslope"),
            PositionTag::new(16, "valley"),
        ]
    }

    const SLOPE_JSON: &str = r#"{
        "overview": {"all_units": 6, "hillslopes": 2},
        "summit": {"1": {"downslope": 2, "upslope": -1}, "4": {"downslope": 5}},
        "backslope": {"2": {"downslope": 3, "upslope": 1}, "5": {"downslope": 6}},
        "valley": {"3": {"downslope": -1}, "6": {"downslope": 0, "primarylanduse": 33}}
    }"#;

    #[test]
    fn test_load_slope_positions() {
        let info = UnitsInfo::from_json_str(SLOPE_JSON, UnitMode::SlopePosition, &tags()).unwrap();
        assert_eq!(info.len(), 6);
        assert_eq!(info.all_units, 6);

        let backslope = info.get(2).unwrap();
        assert_eq!(backslope.position_tag, Some(4));
        assert_eq!(backslope.downstream, Some(3));
        assert_eq!(backslope.upstream, vec![1]);

        let valley = info.get(6).unwrap();
        assert_eq!(valley.downstream, None);
        assert_eq!(valley.landuse, Some(33));
        assert_eq!(info.top_units(), vec![1, 4]);
    }

    #[test]
    fn test_missing_position_section() {
        let mut wrong = tags();
        wrong[2].name = "footslope".into();
        let err = UnitsInfo::from_json_str(SLOPE_JSON, UnitMode::SlopePosition, &wrong).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPositionSection(name) if name == "footslope"));
    }

    #[test]
    fn test_unit_in_two_positions_rejected() {
        let json = r#"{
            "overview": {"all_units": 2},
            "summit": {"1": {"downslope": 2}},
            "backslope": {"2": {"downslope": -1}},
            "valley": {"2": {"downslope": -1}}
        }"#;
        let err = UnitsInfo::from_json_str(json, UnitMode::SlopePosition, &tags()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateUnit(2)));
    }

    #[test]
    fn test_connected_fields_with_lists() {
        let json = r#"{
            "overview": {"all_units": 4},
            "units": {
                "1": {"downslope": [3], "primarylanduse": 33},
                "2": {"downslope": [3], "primarylanduse": 6},
                "3": {"downslope": [4]},
                "4": {"downslope": []}
            }
        }"#;
        let info = UnitsInfo::from_json_str(json, UnitMode::ConnectedField, &[]).unwrap();
        assert_eq!(info.get(3).unwrap().upstream, vec![1, 2]);
        assert_eq!(info.get(4).unwrap().downstream, None);
        assert_eq!(info.subtree(4), vec![4, 3, 1, 2]);
        assert_eq!(info.subtree(1), vec![1]);
    }

    #[test]
    fn test_unknown_downstream_rejected() {
        let units = [SpatialUnit::new(1).with_downstream(9)];
        let err = UnitsInfo::from_units(1, units).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownDownstream {
                unit: 1,
                downstream: 9
            }
        ));
    }

    #[test]
    fn test_non_numeric_unit_id() {
        let json = r#"{"overview": {"all_units": 1}, "units": {"abc": {}}}"#;
        assert!(UnitsInfo::from_json_str(json, UnitMode::Hru, &[]).is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = UnitsInfo::from_json_str("{\"units\": {}}", UnitMode::Hru, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }
}
