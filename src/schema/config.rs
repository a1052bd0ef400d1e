//! Configuration types for BMP scenario optimization, parsed from SEIMS INI files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use ini::{Ini, ParseOption};
use serde::{Deserialize, Serialize};

use super::{BmpCatalog, BmpRecord};

/// Spatial unit type that genes are assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitMode {
    /// Slope position units chained along hillslopes.
    SlopePosition,
    /// Hydrologically connected fields.
    ConnectedField,
    /// Generic hydrologic response units.
    Hru,
    /// HRUs with explicit spatial location.
    ExplicitHru,
}

impl UnitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlopePosition => "SLPPOS",
            Self::ConnectedField => "CONNFIELD",
            Self::Hru => "HRU",
            Self::ExplicitHru => "EXPLICITHRU",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SLPPOS" => Some(Self::SlopePosition),
            "CONNFIELD" => Some(Self::ConnectedField),
            "HRU" | "COMMON" => Some(Self::Hru),
            "EXPLICITHRU" => Some(Self::ExplicitHru),
            _ => None,
        }
    }
}

/// BMP configuration method that drives the domain rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleMethod {
    /// No domain knowledge.
    Random,
    /// Suitability and compatibility only.
    Suitability,
    /// At most one configured unit along each upstream/downstream link.
    UpDown,
    /// Effectiveness grades ordered along the hillslope.
    SlopePosition,
}

impl RuleMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "RDM",
            Self::Suitability => "SUIT",
            Self::UpDown => "UPDOWN",
            Self::SlopePosition => "SLPPOS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "RDM" | "RAND" | "RANDOM" => Some(Self::Random),
            "SUIT" => Some(Self::Suitability),
            "UPDOWN" => Some(Self::UpDown),
            "SLPPOS" => Some(Self::SlopePosition),
            _ => None,
        }
    }

    /// Whether the method can be used with the given unit mode.
    pub fn supports(&self, mode: UnitMode) -> bool {
        match self {
            Self::Random | Self::Suitability => true,
            Self::UpDown => matches!(mode, UnitMode::SlopePosition | UnitMode::ConnectedField),
            Self::SlopePosition => mode == UnitMode::SlopePosition,
        }
    }
}

/// A slope position tag and the units-file section that lists its units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionTag {
    pub tag: u32,
    pub name: String,
}

impl PositionTag {
    pub fn new(tag: u32, name: impl Into<String>) -> Self {
        Self {
            tag,
            name: name.into(),
        }
    }
}

fn default_tag_names() -> Vec<PositionTag> {
    vec![
        PositionTag::new(1, "summit"),
        PositionTag::new(4, "backslope"),
        PositionTag::new(16, "valley"),
    ]
}

// ============================================================================
// NSGA-II settings
// ============================================================================

/// Where to seed the initial population from a previous run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPopulation {
    /// Pareto snapshot file written by an earlier run. Relative INI values are joined to `MODEL_DIR`.
    pub file: PathBuf,
    /// Generation to take; the last one when `None`.
    pub generation: Option<usize>,
}

/// NSGA-II parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nsga2Config {
    /// Number of generations after the initial one.
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Population size, a positive multiple of 4.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Probability that a parent pair is crossed over.
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    /// Independent probability gating each mutation attempt.
    #[serde(default = "default_mutate_rate")]
    pub mutate_rate: f64,
    /// Fraction of the population selected as parents.
    #[serde(default = "default_select_rate")]
    pub select_rate: f64,
    /// Upper bound of mutated genes as a fraction of gene count.
    #[serde(default = "default_max_mutate_perc")]
    pub max_mutate_perc: f64,
    /// Concurrent simulator invocations.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default)]
    pub input_population: Option<InputPopulation>,
    /// Keep store records and outputs of the final Pareto front.
    #[serde(default)]
    pub keep_pareto_outputs: bool,
}

impl Default for Nsga2Config {
    fn default() -> Self {
        Self {
            generations: default_generations(),
            population_size: default_population_size(),
            crossover_rate: default_crossover_rate(),
            mutate_rate: default_mutate_rate(),
            select_rate: default_select_rate(),
            max_mutate_perc: default_max_mutate_perc(),
            workers: None,
            random_seed: None,
            input_population: None,
            keep_pareto_outputs: false,
        }
    }
}

fn default_generations() -> usize {
    1
}
fn default_population_size() -> usize {
    4
}
fn default_crossover_rate() -> f64 {
    0.8
}
fn default_mutate_rate() -> f64 {
    0.1
}
fn default_select_rate() -> f64 {
    1.0
}
fn default_max_mutate_perc() -> f64 {
    0.2
}

impl Nsga2Config {
    /// Validate NSGA-II parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 || self.population_size % 4 != 0 {
            return Err(ConfigError::PopulationNotMultipleOfFour(
                self.population_size,
            ));
        }
        for (name, value) in [
            ("CrossoverRate", self.crossover_rate),
            ("MutateRate", self.mutate_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::RateOutOfRange { name, value });
            }
        }
        if !(self.select_rate > 0.0) {
            return Err(ConfigError::RateOutOfRange {
                name: "SelectRate",
                value: self.select_rate,
            });
        }
        if !(self.max_mutate_perc >= 0.0) {
            return Err(ConfigError::RateOutOfRange {
                name: "MaxMutatePerc",
                value: self.max_mutate_perc,
            });
        }
        if self.workers == Some(0) {
            return Err(ConfigError::InvalidValue {
                section: "NSGA2".into(),
                key: "workers".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Parent count for crowded tournament selection.
    ///
    /// Rounded down to a multiple of 4 and bounded by the population.
    pub fn tournament_size(&self, available: usize) -> usize {
        let wanted = (self.population_size as f64 * self.select_rate) as usize;
        let k = wanted.min(available) / 4 * 4;
        k.max(4).min(available / 4 * 4)
    }
}

// ============================================================================
// BMP, evaluation, path and model settings
// ============================================================================

/// BMP universe and how it is configured on units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmpConfig {
    pub unit_mode: UnitMode,
    pub method: RuleMethod,
    /// `[SWITCH] BMPs_rule`; false forces random operators.
    pub rules_enabled: bool,
    /// Slope position tags from hillslope top to bottom.
    pub tag_names: Vec<PositionTag>,
    pub catalog: BmpCatalog,
}

impl BmpConfig {
    pub fn new(unit_mode: UnitMode, method: RuleMethod, catalog: BmpCatalog) -> Self {
        Self {
            unit_mode,
            method,
            rules_enabled: method != RuleMethod::Random,
            tag_names: default_tag_names(),
            catalog,
        }
    }

    /// Whether rule-aware operators are used.
    pub fn uses_rules(&self) -> bool {
        self.rules_enabled && self.method != RuleMethod::Random
    }

    /// Genes per hillslope chain in slope-position mode.
    pub fn hillslope_gene_count(&self) -> usize {
        self.tag_names.len()
    }
}

/// Inclusive time window used to sum simulated outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalWindow {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl EvalWindow {
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        self.start.is_none_or(|s| t >= s) && self.end.is_none_or(|e| t <= e)
    }
}

/// How the environmental objective is derived from simulator output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Output file read from the scenario output directory.
    pub env_file: String,
    /// Metric name reported by the simulator.
    pub variable: String,
    /// Baseline amount. Negative means "run the base scenario first".
    pub base_env: f64,
    /// Sentinel cost; defaults to every unit carrying the dearest BMP.
    pub worst_cost: Option<f64>,
    /// Sentinel effectiveness.
    pub worst_env: f64,
    pub window: EvalWindow,
    /// Subbasin block to read; the first block when `None`.
    pub subbasin: Option<i64>,
    /// Years of operation and income charged by area-based BMP costs.
    #[serde(default)]
    pub runtime_years: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            env_file: "SED_OL.txt".into(),
            variable: "SED".into(),
            base_env: -1.0,
            worst_cost: None,
            worst_env: 0.0,
            window: EvalWindow::default(),
            subbasin: None,
            runtime_years: 0.0,
        }
    }
}

/// `eval_info` JSON option.
#[derive(Debug, Deserialize)]
struct EvalInfo {
    #[serde(rename = "ENVEVAL")]
    env_eval: Option<String>,
    #[serde(rename = "BASE_ENV")]
    base_env: Option<f64>,
    #[serde(rename = "EVAL_VAR")]
    variable: Option<String>,
}

/// Filesystem locations. Relative paths other than `bin_dir` are already
/// joined to `model_dir` when parsed from INI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub model_dir: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub units_file: PathBuf,
    pub field_raster: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub scenario_store: Option<PathBuf>,
}

/// Scenario database settings, forwarded to the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 27017,
            db_name: "BMP_Scenario".into(),
        }
    }
}

/// Simulator invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub executable: String,
    pub threads: usize,
    /// Flow direction method index (D8, Dinf, MFD-md).
    pub fdir_method: usize,
    /// Layering method index (up-down, down-up).
    pub layering_method: usize,
    pub timeout_secs: u64,
    /// Extra attempts after a failed run.
    pub retries: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            executable: "seims_omp".into(),
            threads: 1,
            fdir_method: 0,
            layering_method: 1,
            timeout_secs: 3600,
            retries: 1,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete, immutable configuration of one optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub nsga2: Nsga2Config,
    pub bmps: BmpConfig,
    pub evaluation: EvaluationConfig,
    pub paths: PathConfig,
    pub store: StoreConfig,
    pub model: ModelConfig,
}

impl OptimizerConfig {
    /// Load and validate an INI configuration file.
    pub fn from_ini_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini_str(&text)
    }

    /// Parse and validate INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        // JSON values and Windows paths must reach the parsers verbatim.
        let options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini =
            Ini::load_from_str_opt(text, options).map_err(|e| ConfigError::Ini(e.to_string()))?;
        let src = IniSource { ini: &ini };

        let paths = parse_paths(&src)?;
        let nsga2 = parse_nsga2(&src, &paths.model_dir)?;
        let bmps = parse_bmps(&src)?;
        let evaluation = parse_evaluation(&src)?;
        let store = StoreConfig {
            host: src
                .get("MONGODB", "HOSTNAME")
                .map(str::to_string)
                .unwrap_or_else(|| StoreConfig::default().host),
            port: src.parsed("MONGODB", "PORT")?.unwrap_or(27017),
            db_name: src
                .get("MONGODB", "BMPScenarioDBName")
                .map(str::to_string)
                .unwrap_or_else(|| StoreConfig::default().db_name),
        };
        let defaults = ModelConfig::default();
        let model = ModelConfig {
            executable: src
                .get("SEIMS_Model", "executable")
                .map(str::to_string)
                .unwrap_or(defaults.executable),
            threads: src
                .parsed("SEIMS_Model", "threadsNum")?
                .unwrap_or(defaults.threads),
            fdir_method: src
                .parsed("SEIMS_Model", "fdirmtd")?
                .unwrap_or(defaults.fdir_method),
            layering_method: src
                .parsed("SEIMS_Model", "lyrmtd")?
                .unwrap_or(defaults.layering_method),
            timeout_secs: src
                .parsed("SEIMS_Model", "timeout_secs")?
                .unwrap_or(defaults.timeout_secs),
            retries: src
                .parsed("SEIMS_Model", "retries")?
                .unwrap_or(defaults.retries),
        };

        let config = Self {
            nsga2,
            bmps,
            evaluation,
            paths,
            store,
            model,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-section consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nsga2.validate()?;
        if !self.bmps.method.supports(self.bmps.unit_mode) {
            return Err(ConfigError::UnsupportedMethod {
                method: self.bmps.method.as_str(),
                unit: self.bmps.unit_mode.as_str(),
            });
        }
        if self.bmps.unit_mode == UnitMode::SlopePosition && self.bmps.tag_names.is_empty() {
            return Err(ConfigError::MissingOption {
                section: "BMPs".into(),
                key: "slppos_tagnames".into(),
            });
        }
        if !self.evaluation.runtime_years.is_finite() || self.evaluation.runtime_years < 0.0 {
            return Err(ConfigError::InvalidValue {
                section: "Scenario_Common".into(),
                key: "runtime_years".into(),
                value: self.evaluation.runtime_years.to_string(),
            });
        }
        if self.model.fdir_method > 2 || self.model.layering_method > 1 {
            return Err(ConfigError::InvalidValue {
                section: "SEIMS_Model".into(),
                key: "fdirmtd/lyrmtd".into(),
                value: format!("{}/{}", self.model.fdir_method, self.model.layering_method),
            });
        }
        Ok(())
    }

    /// Run output directory, `NSGA2_Gen_<g>_Pop_<p>` below the model directory by default.
    pub fn output_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.output_dir {
            return dir.clone();
        }
        self.paths
            .model_dir
            .join(format!(
                "SA_NSGA2_{}_{}",
                self.bmps.unit_mode.as_str(),
                self.bmps.method.as_str()
            ))
            .join(format!(
                "NSGA2_Gen_{}_Pop_{}",
                self.nsga2.generations, self.nsga2.population_size
            ))
    }

    /// Directory of the file-backed scenario store.
    pub fn scenario_store_dir(&self) -> PathBuf {
        self.paths
            .scenario_store
            .clone()
            .unwrap_or_else(|| self.paths.model_dir.join(&self.store.db_name))
    }
}

// ============================================================================
// INI parsing
// ============================================================================

/// Case-insensitive section/key lookup with fallback to the general section.
struct IniSource<'a> {
    ini: &'a Ini,
}

impl<'a> IniSource<'a> {
    fn get(&self, section: &str, key: &str) -> Option<&'a str> {
        let lookup = |props: &'a ini::Properties| {
            props
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.trim())
        };
        self.ini
            .iter()
            .filter(|(name, _)| name.is_some_and(|n| n.eq_ignore_ascii_case(section)))
            .find_map(|(_, props)| lookup(props))
            .or_else(|| lookup(self.ini.general_section()))
            .filter(|v| !v.is_empty())
    }

    fn get_any(&self, sections: &[&str], key: &str) -> Option<&'a str> {
        sections.iter().find_map(|s| self.get(s, key))
    }

    fn require(&self, section: &str, key: &str) -> Result<&'a str, ConfigError> {
        self.get(section, key)
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.into(),
                key: key.into(),
            })
    }

    fn parsed<T: FromStr>(&self, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(section, key)
            .map(|raw| parse_value(section, key, raw))
            .transpose()
    }

    fn parsed_any<T: FromStr>(
        &self,
        sections: &[&str],
        key: &str,
    ) -> Result<Option<T>, ConfigError> {
        for section in sections {
            if let Some(raw) = self.get(section, key) {
                return parse_value(section, key, raw).map(Some);
            }
        }
        Ok(None)
    }

    fn boolean(&self, sections: &[&str], key: &str) -> Result<Option<bool>, ConfigError> {
        for section in sections {
            if let Some(raw) = self.get(section, key) {
                return parse_bool(raw)
                    .map(Some)
                    .ok_or_else(|| invalid(section, key, raw));
            }
        }
        Ok(None)
    }

    fn json<T: serde::de::DeserializeOwned>(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Option<T>, ConfigError> {
        self.get(section, key)
            .map(|raw| {
                serde_json::from_str(raw).map_err(|source| ConfigError::Json {
                    context: format!("[{section}] {key}"),
                    source,
                })
            })
            .transpose()
    }
}

fn invalid(section: &str, key: &str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.into(),
        key: key.into(),
        value: raw.into(),
    }
}

fn parse_value<T: FromStr>(section: &str, key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(section, key, raw))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a numeric list such as `1, 2, 3`, `[1 2 3]` or `1;2;3`.
fn parse_list<T: FromStr>(section: &str, key: &str, raw: &str) -> Result<Vec<T>, ConfigError> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace() || "[]()".contains(c))
        .filter(|token| !token.is_empty())
        .map(|token| parse_value(section, key, token))
        .collect()
}

/// Accepts `YYYY-MM-DD HH:MM:SS` or a bare date.
fn parse_datetime(section: &str, key: &str, raw: &str) -> Result<NaiveDateTime, ConfigError> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| invalid(section, key, raw))
}

const NSGA2_SECTIONS: [&str; 2] = ["NSGA2", "NSGAII"];

/// Relative paths are taken relative to the model directory.
fn resolve_path(model_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        model_dir.join(path)
    }
}

fn parse_nsga2(src: &IniSource<'_>, model_dir: &Path) -> Result<Nsga2Config, ConfigError> {
    let defaults = Nsga2Config::default();
    let input_population = if src.boolean(&NSGA2_SECTIONS, "inputpopulation")?.unwrap_or(false) {
        let file = src
            .get_any(&NSGA2_SECTIONS, "paretofrontsfile")
            .ok_or_else(|| ConfigError::MissingOption {
                section: "NSGA2".into(),
                key: "paretofrontsfile".into(),
            })?;
        let generation: Option<i64> = src.parsed_any(&NSGA2_SECTIONS, "generationselected")?;
        Some(InputPopulation {
            file: resolve_path(model_dir, file),
            generation: generation.and_then(|g| usize::try_from(g).ok()),
        })
    } else {
        None
    };

    Ok(Nsga2Config {
        generations: src
            .parsed_any(&NSGA2_SECTIONS, "GenerationsNum")?
            .unwrap_or(defaults.generations),
        population_size: src
            .parsed_any(&NSGA2_SECTIONS, "PopulationSize")?
            .unwrap_or(defaults.population_size),
        crossover_rate: src
            .parsed_any(&NSGA2_SECTIONS, "CrossoverRate")?
            .unwrap_or(defaults.crossover_rate),
        mutate_rate: src
            .parsed_any(&NSGA2_SECTIONS, "MutateRate")?
            .unwrap_or(defaults.mutate_rate),
        select_rate: src
            .parsed_any(&NSGA2_SECTIONS, "SelectRate")?
            .unwrap_or(defaults.select_rate),
        max_mutate_perc: src
            .parsed_any(&NSGA2_SECTIONS, "MaxMutatePerc")?
            .unwrap_or(defaults.max_mutate_perc),
        workers: src.parsed_any(&NSGA2_SECTIONS, "workers")?,
        random_seed: src.parsed_any(&NSGA2_SECTIONS, "random_seed")?,
        input_population,
        keep_pareto_outputs: src
            .boolean(&NSGA2_SECTIONS, "keep_pareto_outputs")?
            .unwrap_or(false),
    })
}

fn parse_bmps(src: &IniSource<'_>) -> Result<BmpConfig, ConfigError> {
    let records: BTreeMap<String, BmpRecord> = src.json("BMPs", "bmps_info")?.unwrap_or_default();
    let mut records = records
        .into_iter()
        .map(|(key, record)| Ok((parse_value("BMPs", "bmps_info", &key)?, record)))
        .collect::<Result<BTreeMap<u32, BmpRecord>, ConfigError>>()?;

    let mut ids: Vec<u32> = src
        .get("BMPs", "bmp_areal_struct")
        .map(|raw| parse_list("BMPs", "bmp_areal_struct", raw))
        .transpose()?
        .unwrap_or_default();
    if ids.is_empty() && records.is_empty() {
        return Err(ConfigError::MissingOption {
            section: "BMPs".into(),
            key: "bmp_areal_struct".into(),
        });
    }
    let costs: Vec<f64> = match src.get("BMPs", "bmp_areal_struct_cost") {
        Some(raw) => parse_list("BMPs", "bmp_areal_struct_cost", raw)?,
        None if records.is_empty() => {
            return Err(ConfigError::MissingOption {
                section: "BMPs".into(),
                key: "bmp_areal_struct_cost".into(),
            });
        }
        // Without a cost list, listed ids take their costs from `bmps_info`.
        None => {
            for id in ids.drain(..) {
                records.entry(id).or_default();
            }
            Vec::new()
        }
    };
    let catalog = BmpCatalog::from_parts(&ids, &costs, &records)?;

    let unit_mode = match src.get("BMPs", "bmps_cfg_unit") {
        Some(raw) => {
            UnitMode::from_name(raw).ok_or_else(|| invalid("BMPs", "bmps_cfg_unit", raw))?
        }
        None => UnitMode::SlopePosition,
    };
    let rules_enabled = src.boolean(&["SWITCH"], "BMPs_rule")?.unwrap_or(true);
    let method = match src.get("BMPs", "bmps_cfg_method") {
        Some(raw) => {
            RuleMethod::from_name(raw).ok_or_else(|| invalid("BMPs", "bmps_cfg_method", raw))?
        }
        None if rules_enabled => RuleMethod::Suitability,
        None => RuleMethod::Random,
    };

    let tag_names = match src.json::<Vec<(u32, String)>>("BMPs", "slppos_tagnames")? {
        Some(pairs) => pairs
            .into_iter()
            .map(|(tag, name)| PositionTag::new(tag, name))
            .collect(),
        None => default_tag_names(),
    };

    Ok(BmpConfig {
        unit_mode,
        method,
        rules_enabled,
        tag_names,
        catalog,
    })
}

fn parse_evaluation(src: &IniSource<'_>) -> Result<EvaluationConfig, ConfigError> {
    let defaults = EvaluationConfig::default();
    let info: Option<EvalInfo> = src.json("BMPs", "eval_info")?;
    let (env_file, base_env, variable) = match info {
        Some(info) => (info.env_eval, info.base_env, info.variable),
        None => (None, None, None),
    };
    let env_file = env_file.unwrap_or(defaults.env_file);
    let variable = variable.unwrap_or_else(|| variable_from_file(&env_file));

    let window = EvalWindow {
        start: src
            .get("Scenario_Common", "eval_time_start")
            .map(|raw| parse_datetime("Scenario_Common", "eval_time_start", raw))
            .transpose()?,
        end: src
            .get("Scenario_Common", "eval_time_end")
            .map(|raw| parse_datetime("Scenario_Common", "eval_time_end", raw))
            .transpose()?,
    };

    Ok(EvaluationConfig {
        env_file,
        variable,
        base_env: base_env.unwrap_or(defaults.base_env),
        worst_cost: src.parsed("Scenario_Common", "worst_economy")?,
        worst_env: src
            .parsed("Scenario_Common", "worst_environment")?
            .unwrap_or(defaults.worst_env),
        window,
        subbasin: src.parsed("Scenario_Common", "eval_subbasin")?,
        runtime_years: src
            .parsed("Scenario_Common", "runtime_years")?
            .unwrap_or(defaults.runtime_years),
    })
}

/// `SED_OL.txt` reports metric `SED`.
fn variable_from_file(file: &str) -> String {
    let stem = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file);
    stem.split('_').next().unwrap_or(stem).to_string()
}

fn parse_paths(src: &IniSource<'_>) -> Result<PathConfig, ConfigError> {
    let model_dir = PathBuf::from(src.require("PATH", "MODEL_DIR")?);
    let resolve = |raw: &str| resolve_path(&model_dir, raw);
    Ok(PathConfig {
        bin_dir: src.get("PATH", "BIN_DIR").map(PathBuf::from),
        units_file: resolve(src.require("PATH", "units_file")?),
        field_raster: src.get("PATH", "fieldRaster").map(resolve),
        output_dir: src.get("PATH", "output_dir").map(resolve),
        scenario_store: src.get("PATH", "scenario_store").map(resolve),
        model_dir,
    })
}

/// Configuration errors. All of them are fatal before any simulation runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed INI file: {0}")]
    Ini(String),
    #[error("Missing required option [{section}] {key}")]
    MissingOption { section: String, key: String },
    #[error("Invalid value for [{section}] {key}: {value}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
    #[error("Malformed JSON in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Units metadata declares {expected} units but {found} were indexed")]
    UnitCountMismatch { expected: usize, found: usize },
    #[error("Unit {0} is listed more than once")]
    DuplicateUnit(u32),
    #[error("Unit {unit} drains into unknown unit {downstream}")]
    UnknownDownstream { unit: u32, downstream: u32 },
    #[error("Slope position section '{0}' not found in units metadata")]
    MissingPositionSection(String),
    #[error("BMP id list has {ids} entries but cost list has {costs}")]
    BmpCostMismatch { ids: usize, costs: usize },
    #[error("BMP id 0 is reserved for 'no BMP'")]
    ReservedBmpId,
    #[error("Population size {0} must be a positive multiple of 4")]
    PopulationNotMultipleOfFour(usize),
    #[error("{name} out of range: {value}")]
    RateOutOfRange { name: &'static str, value: f64 },
    #[error("BMP configuration method {method} is not supported on unit {unit}")]
    UnsupportedMethod {
        method: &'static str,
        unit: &'static str,
    },
}
