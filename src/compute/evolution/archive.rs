//! Run archive: plain-text logs, Pareto snapshots and the final result.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::schema::{Fitness, GenerationRecord, OptimizationResult, ParetoEntry, ScenarioId};

const RUNTIME_LOG: &str = "runtime.log";
const PARETO_FILE: &str = "pareto_fronts.txt";
const HYPERVOLUME_FILE: &str = "hypervolume.txt";
const LOGBOOK_FILE: &str = "logbook.txt";
const RESULT_FILE: &str = "result.json";

const PARETO_HEADER: &str = "scenario\teconomy\tenvironment\tgene_values";

/// One evaluated scenario as written to the runtime log.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRow<'a> {
    pub scenario_id: ScenarioId,
    pub fitness: Fitness,
    pub genes: &'a [u32],
}

/// Output directory of one optimization run.
#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    /// Create the directory and start fresh log files.
    pub fn create<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::write(
            dir.join(RUNTIME_LOG),
            "# generation\tscenario\teconomy\tenvironment\tgene_values\n",
        )?;
        fs::write(dir.join(PARETO_FILE), "")?;
        fs::write(
            dir.join(HYPERVOLUME_FILE),
            "generation\tevaluations\thypervolume\n",
        )?;
        fs::write(
            dir.join(LOGBOOK_FILE),
            "gen\tevals\tfailed\tmin_cost\tmax_cost\tavg_cost\tstd_cost\t\
             min_env\tmax_env\tavg_env\tstd_env\thypervolume\tfront\telapsed\n",
        )?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pareto_path(&self) -> PathBuf {
        self.dir.join(PARETO_FILE)
    }

    fn append(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))
    }

    /// Append every scenario evaluated in `generation` to the runtime log.
    pub fn log_evaluations(&self, generation: usize, rows: &[EvaluationRow<'_>]) -> io::Result<()> {
        let mut out = String::new();
        for row in rows {
            out.push_str(&format!(
                "{generation}\t{}\t{}\t{}\t{}\n",
                row.scenario_id,
                row.fitness.cost,
                row.fitness.effectiveness,
                format_genes(row.genes)
            ));
        }
        self.append(RUNTIME_LOG)?.write_all(out.as_bytes())
    }

    /// Append a timing line to the runtime log.
    pub fn log_timing(&self, generation: usize, evaluations: usize, seconds: f64) -> io::Result<()> {
        writeln!(
            self.append(RUNTIME_LOG)?,
            "# generation {generation}: {evaluations} evaluations in {seconds:.3}s"
        )
    }

    /// Append the generation's Pareto front, hypervolume and logbook row.
    pub fn log_generation(&self, record: &GenerationRecord, front: &[ParetoEntry]) -> io::Result<()> {
        let mut block = format!("# Generation {}\n{PARETO_HEADER}\n", record.generation);
        for entry in front {
            let id = entry
                .scenario_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            block.push_str(&format!(
                "{id}\t{}\t{}\t{}\n",
                entry.cost,
                entry.effectiveness,
                format_genes(&entry.gene_values)
            ));
        }
        self.append(PARETO_FILE)?.write_all(block.as_bytes())?;

        writeln!(
            self.append(HYPERVOLUME_FILE)?,
            "{}\t{}\t{}",
            record.generation, record.evaluations, record.hypervolume
        )?;

        let (c, e) = (&record.cost, &record.effectiveness);
        writeln!(
            self.append(LOGBOOK_FILE)?,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.3}",
            record.generation,
            record.evaluations,
            record.failures,
            c.min,
            c.max,
            c.avg,
            c.std,
            e.min,
            e.max,
            e.avg,
            e.std,
            record.hypervolume,
            record.front_size,
            record.elapsed_seconds
        )
    }

    /// Write the final result as pretty JSON.
    pub fn write_result(&self, result: &OptimizationResult) -> io::Result<PathBuf> {
        let path = self.dir.join(RESULT_FILE);
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Gene values separated by single spaces.
pub fn format_genes(genes: &[u32]) -> String {
    genes
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Gene arrays of one generation of a Pareto snapshot file.
///
/// Takes the last generation in the file when `generation` is `None`.
pub fn load_pareto_population<P: AsRef<Path>>(
    path: P,
    generation: Option<usize>,
) -> io::Result<Vec<Vec<u32>>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);

    let mut blocks: Vec<(usize, Vec<Vec<u32>>)> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line == PARETO_HEADER {
            continue;
        }
        if let Some(rest) = line.strip_prefix("# Generation") {
            let g = rest
                .trim()
                .parse()
                .map_err(|_| invalid(format!("{}:{}: bad generation", path.display(), lineno + 1)))?;
            blocks.push((g, Vec::new()));
            continue;
        }
        let Some((_, genes)) = blocks.last_mut() else {
            return Err(invalid(format!(
                "{}:{}: data before first generation header",
                path.display(),
                lineno + 1
            )));
        };
        let field = line
            .split('\t')
            .nth(3)
            .ok_or_else(|| invalid(format!("{}:{}: missing genes", path.display(), lineno + 1)))?;
        let values = field
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| invalid(format!("{}:{}: bad gene value", path.display(), lineno + 1)))?;
        genes.push(values);
    }

    let chosen = match generation {
        Some(g) => blocks.into_iter().rev().find(|(bg, _)| *bg == g),
        None => blocks.pop(),
    };
    chosen.map(|(_, genes)| genes).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{}: generation not found", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectiveStats, OptimizationStats, StopReason};

    fn record(generation: usize) -> GenerationRecord {
        GenerationRecord {
            generation,
            evaluations: 8,
            failures: 1,
            cost: ObjectiveStats::from_values(&[1.0, 3.0]),
            effectiveness: ObjectiveStats::from_values(&[0.1, 0.3]),
            hypervolume: 2.5,
            front_size: 2,
            elapsed_seconds: 1.25,
        }
    }

    fn entry(id: u64, genes: Vec<u32>) -> ParetoEntry {
        ParetoEntry {
            scenario_id: Some(ScenarioId(id)),
            cost: 1.5,
            effectiveness: 0.25,
            rank: 0,
            gene_values: genes,
        }
    }

    #[test]
    fn test_pareto_snapshots_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = RunArchive::create(tmp.path().join("run")).unwrap();

        archive
            .log_generation(&record(0), &[entry(1, vec![0, 1, 2])])
            .unwrap();
        archive
            .log_generation(&record(1), &[entry(2, vec![3, 3, 0]), entry(3, vec![0, 0, 1])])
            .unwrap();

        let last = load_pareto_population(archive.pareto_path(), None).unwrap();
        assert_eq!(last, vec![vec![3, 3, 0], vec![0, 0, 1]]);
        let first = load_pareto_population(archive.pareto_path(), Some(0)).unwrap();
        assert_eq!(first, vec![vec![0, 1, 2]]);

        let missing = load_pareto_population(archive.pareto_path(), Some(7)).unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        let logbook = fs::read_to_string(archive.dir().join(LOGBOOK_FILE)).unwrap();
        assert_eq!(logbook.lines().count(), 3);
        let hv = fs::read_to_string(archive.dir().join(HYPERVOLUME_FILE)).unwrap();
        assert!(hv.lines().any(|l| l == "1\t8\t2.5"));
    }

    #[test]
    fn test_runtime_log() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = RunArchive::create(tmp.path()).unwrap();
        let genes = [1u32, 0, 2];
        archive
            .log_evaluations(
                3,
                &[EvaluationRow {
                    scenario_id: ScenarioId(42),
                    fitness: Fitness::new(12.0, 0.5),
                    genes: &genes,
                }],
            )
            .unwrap();
        archive.log_timing(3, 1, 0.5).unwrap();

        let log = fs::read_to_string(archive.dir().join(RUNTIME_LOG)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(
            lines,
            [
                "# generation\tscenario\teconomy\tenvironment\tgene_values",
                "3\t42\t12\t0.5\t1 0 2",
                "# generation 3: 1 evaluations in 0.500s",
            ]
        );
        // Only data rows are left once comment lines are skipped.
        assert_eq!(lines.iter().filter(|l| !l.starts_with('#')).count(), 1);
    }

    #[test]
    fn test_malformed_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.txt");
        fs::write(&path, "1\t2\t3\t1 2\n").unwrap();
        let err = load_pareto_population(&path, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        fs::write(&path, "# Generation 0\n1\t2\t3\t1 x\n").unwrap();
        assert!(load_pareto_population(&path, None).is_err());
    }

    #[test]
    fn test_write_result() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = RunArchive::create(tmp.path()).unwrap();
        let result = OptimizationResult {
            pareto_front: vec![entry(1, vec![1])],
            population: vec![entry(1, vec![1])],
            history: vec![record(0)],
            stats: OptimizationStats {
                generations: 0,
                total_evaluations: 8,
                failed_evaluations: 1,
                hypervolume: 2.5,
                elapsed_seconds: 1.0,
                evaluations_per_second: 8.0,
                stop_reason: StopReason::MaxGenerations,
            },
        };
        let path = archive.write_result(&result).unwrap();
        let back: OptimizationResult =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.pareto_front[0].gene_values, vec![1]);
    }
}
