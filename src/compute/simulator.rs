//! Watershed model adapter: runs one scenario and reads its outlet output.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

use crate::schema::{EvalWindow, EvaluationConfig, ModelConfig, OptimizerConfig, ScenarioId};

/// Why a simulation produced no usable metrics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationErrorKind {
    #[error("Failed to launch simulator: {0}")]
    Spawn(String),
    #[error("Simulator exited with status {0:?}")]
    ExitStatus(Option<i32>),
    #[error("Simulator exceeded timeout of {0:?}")]
    Timeout(Duration),
    #[error("Expected output {0} was not produced")]
    MissingOutput(PathBuf),
    #[error("Malformed simulator output: {0}")]
    MalformedOutput(String),
    #[error("Scenario store failure: {0}")]
    Store(String),
}

/// Outcome of one simulator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    pub success: bool,
    /// Named outlet metrics, present on success.
    pub metrics: Option<HashMap<String, f64>>,
    pub error: Option<SimulationErrorKind>,
}

impl SimulationResult {
    pub fn ok(metrics: HashMap<String, f64>) -> Self {
        Self {
            success: true,
            metrics: Some(metrics),
            error: None,
        }
    }

    pub fn failed(error: SimulationErrorKind) -> Self {
        Self {
            success: false,
            metrics: None,
            error: Some(error),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.get(name).copied())
    }
}

/// Runs the watershed model for a stored scenario.
///
/// Implementations are called concurrently from evaluation workers.
pub trait Simulator: Send + Sync {
    /// Simulate scenario `id`, which is already in the scenario store.
    /// Id 0 is the baseline scenario without BMPs.
    fn run(&self, id: ScenarioId) -> SimulationResult;

    /// Directory holding the outputs of scenario `id`, if any.
    fn output_dir(&self, id: ScenarioId) -> Option<PathBuf>;
}

// ============================================================================
// External command
// ============================================================================

const FDIR_SUFFIXES: [&str; 3] = ["_D8", "_DINF", "_MFDMD"];
const LAYER_SUFFIXES: [&str; 2] = ["_UP_DOWN", "_DOWN_UP"];
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const OUTPUT_RECHECK_DELAY: Duration = Duration::from_millis(100);

/// Launches the model executable as a child process, one per scenario.
#[derive(Debug, Clone)]
pub struct CommandSimulator {
    executable: PathBuf,
    model_dir: PathBuf,
    model: ModelConfig,
    host: String,
    port: u16,
    evaluation: EvaluationConfig,
    timeout: Duration,
}

impl CommandSimulator {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        let executable = match &config.paths.bin_dir {
            Some(bin) => bin.join(&config.model.executable),
            None => PathBuf::from(&config.model.executable),
        };
        Self {
            executable,
            model_dir: config.paths.model_dir.clone(),
            model: config.model.clone(),
            host: config.store.host.clone(),
            port: config.store.port,
            evaluation: config.evaluation.clone(),
            timeout: config.model.timeout(),
        }
    }

    /// Override the program to launch.
    pub fn with_executable<P: Into<PathBuf>>(mut self, executable: P) -> Self {
        self.executable = executable.into();
        self
    }

    /// Override the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Command-line arguments for scenario `id`.
    pub fn command_args(&self, id: ScenarioId) -> Vec<String> {
        vec![
            "-wp".into(),
            self.model_dir.display().to_string(),
            "-thread".into(),
            self.model.threads.to_string(),
            "-fdir".into(),
            self.model.fdir_method.to_string(),
            "-lyr".into(),
            self.model.layering_method.to_string(),
            "-host".into(),
            self.host.clone(),
            "-port".into(),
            self.port.to_string(),
            "-sce".into(),
            id.to_string(),
        ]
    }

    /// Name of the output directory: `OUTPUT<fdir><layering>-<id>-`.
    pub fn output_name(&self, id: ScenarioId) -> String {
        let fdir = FDIR_SUFFIXES
            .get(self.model.fdir_method)
            .copied()
            .unwrap_or("");
        let lyr = LAYER_SUFFIXES
            .get(self.model.layering_method)
            .copied()
            .unwrap_or("");
        format!("OUTPUT{fdir}{lyr}-{id}-")
    }

    fn run_once(&self, id: ScenarioId) -> Result<HashMap<String, f64>, SimulationErrorKind> {
        let out_dir = self.model_dir.join(self.output_name(id));
        fs::create_dir_all(&out_dir)
            .map_err(|e| SimulationErrorKind::Spawn(format!("{}: {e}", out_dir.display())))?;
        let log = File::create(out_dir.join("run.log"))
            .map_err(|e| SimulationErrorKind::Spawn(e.to_string()))?;
        let log_err = log
            .try_clone()
            .map_err(|e| SimulationErrorKind::Spawn(e.to_string()))?;

        let mut child = Command::new(&self.executable)
            .args(self.command_args(id))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                SimulationErrorKind::Spawn(format!("{}: {e}", self.executable.display()))
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SimulationErrorKind::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SimulationErrorKind::Spawn(e.to_string())),
            }
        };
        if !status.success() {
            return Err(SimulationErrorKind::ExitStatus(status.code()));
        }

        let output = out_dir.join(&self.evaluation.env_file);
        if !output.exists() {
            thread::sleep(OUTPUT_RECHECK_DELAY);
            if !output.exists() {
                return Err(SimulationErrorKind::MissingOutput(output));
            }
        }

        let total =
            read_time_series_sum(&output, self.evaluation.subbasin, &self.evaluation.window)?;
        Ok(HashMap::from([(self.evaluation.variable.clone(), total)]))
    }
}

impl Simulator for CommandSimulator {
    fn run(&self, id: ScenarioId) -> SimulationResult {
        let attempts = self.model.retries + 1;
        let mut last_error = SimulationErrorKind::Spawn("no attempt made".into());
        for attempt in 1..=attempts {
            match self.run_once(id) {
                Ok(metrics) => return SimulationResult::ok(metrics),
                Err(e) => {
                    log::warn!("Scenario {id} attempt {attempt}/{attempts} failed: {e}");
                    last_error = e;
                }
            }
        }
        SimulationResult::failed(last_error)
    }

    fn output_dir(&self, id: ScenarioId) -> Option<PathBuf> {
        Some(self.model_dir.join(self.output_name(id)))
    }
}

// ============================================================================
// Output reading
// ============================================================================

/// Sum of the values of a simulator time-series file inside `window`.
///
/// Lines starting with `#` are comments. A two-token line whose second token
/// is an integer opens a subbasin block; `subbasin` selects the block, and the
/// first block is used when it is `None` or the file has no blocks. Data lines
/// are `YYYY-MM-DD HH:MM:SS value`; other lines are skipped.
pub fn read_time_series_sum(
    path: &Path,
    subbasin: Option<i64>,
    window: &EvalWindow,
) -> Result<f64, SimulationErrorKind> {
    let text = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SimulationErrorKind::MissingOutput(path.to_path_buf())
        } else {
            SimulationErrorKind::MalformedOutput(format!("{}: {e}", path.display()))
        }
    })?;

    // (sum, count) per block; `None` holds data lines before any header.
    let mut blocks: BTreeMap<Option<i64>, (f64, usize)> = BTreeMap::new();
    let mut order: Vec<Option<i64>> = Vec::new();
    let mut current: Option<i64> = None;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() == 2
            && let Ok(id) = tokens[1].parse::<i64>()
        {
            current = Some(id);
            continue;
        }
        if tokens.len() < 3 {
            continue;
        }
        let stamp = format!("{} {}", tokens[0], tokens[1]);
        let Ok(time) = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S") else {
            continue;
        };
        let value: f64 = tokens[2].parse().map_err(|_| {
            SimulationErrorKind::MalformedOutput(format!(
                "{}:{}: bad value '{}'",
                path.display(),
                lineno + 1,
                tokens[2]
            ))
        })?;

        let entry = blocks.entry(current).or_insert_with(|| {
            order.push(current);
            (0.0, 0)
        });
        if window.contains(time) {
            entry.0 += value;
            entry.1 += 1;
        }
    }

    let chosen = match subbasin {
        Some(id) if blocks.contains_key(&Some(id)) => Some(id),
        Some(id) if order.iter().any(Option::is_some) => {
            return Err(SimulationErrorKind::MalformedOutput(format!(
                "{}: no block for subbasin {id}",
                path.display()
            )));
        }
        _ => order.first().copied().flatten(),
    };

    match blocks.get(&chosen) {
        Some(&(sum, count)) if count > 0 => Ok(sum),
        _ => Err(SimulationErrorKind::MalformedOutput(format!(
            "{}: no values inside the evaluation window",
            path.display()
        ))),
    }
}
