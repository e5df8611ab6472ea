use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use std::{fs, path::Path, time::Instant};

use crate::cli::NetworkArgs;
use crate::data::matrix_reader::{ParseMeta, read_distance_matrix};
use crate::splits::asplit::ASplit;
use crate::weights::NNLSParams;
use crate::weights::nnls::{Progress, SolveReport};
use crate::{CircularSplitNetwork, StageTimings, compute_circular_network};

pub struct NetworkRunner {
    out_dir: String,
    args: NetworkArgs,
}

impl NetworkRunner {
    pub fn new(out_dir: String, args: NetworkArgs) -> Self {
        NetworkRunner { out_dir, args }
    }

    pub fn run(&self) -> Result<()> {
        self.run_with_progress(None)
    }

    pub fn run_with_progress(&self, progress: Option<&dyn Progress>) -> Result<()> {
        let t0 = Instant::now();

        // 1) Load distance matrix (+ labels + parse meta)
        let (distances, labels, parse_meta) =
            read_distance_matrix(&self.args.input).context("loading distance matrix")?;
        let n = distances.n();
        info!("Loaded distance matrix: {}x{}", n, n);

        // 2) Ordering, split weights, splits and fit
        let network = compute_circular_network(
            &distances,
            self.args.ordering,
            &self.args.nnls_params,
            progress,
        )?;

        // 3) Outputs
        let t_out = Instant::now();
        let splits_path = self
            .write_splits(&labels, &network.splits)
            .context("writing splits table")?;
        let out_sec = t_out.elapsed().as_secs_f64();
        info!("Wrote {} in {:.3}s", splits_path.display(), out_sec);

        // 4) Run log
        let run_log_path = Path::new(&self.out_dir).join("run_log.json");
        let total_sec = t0.elapsed().as_secs_f64();
        let stats = self.build_run_log(&parse_meta, &labels, network, out_sec, total_sec);
        fs::write(&run_log_path, serde_json::to_string_pretty(&stats)?)
            .with_context(|| format!("writing {}", run_log_path.display()))?;
        info!("Run log written: {}", run_log_path.display());

        info!("Done in {:.3}s total.", t0.elapsed().as_secs_f64());
        Ok(())
    }

    /* ───────────── I/O ───────────── */

    /// `<out_dir>/<prefix>.splits.tsv`: one row per split with its weight,
    /// the size of its smaller side and the labels on the arc side.
    fn write_splits(&self, labels: &[String], splits: &[ASplit]) -> Result<std::path::PathBuf> {
        fs::create_dir_all(&self.out_dir).with_context(|| format!("creating {}", self.out_dir))?;
        let path = Path::new(&self.out_dir).join(format!("{}.splits.tsv", self.args.output_prefix));
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        for (id, s) in splits.iter().enumerate() {
            wtr.serialize(SplitRow {
                split: id + 1,
                weight: s.weight(),
                size: s.size(),
                trivial: s.is_trivial(),
                taxa: side_labels(s, labels),
            })?;
        }
        wtr.flush()?;
        Ok(path)
    }

    /* ───────────── run_log helpers ───────────── */

    fn build_run_log(
        &self,
        parse: &ParseMeta,
        labels: &[String],
        network: CircularSplitNetwork,
        output_sec: f64,
        total_sec: f64,
    ) -> RunLog {
        let n = labels.len();
        let CircularSplitNetwork {
            cycle,
            splits,
            report,
            fit,
            timings,
            ..
        } = network;

        let (num_trivial, num_nontrivial, sum_weights) = splits
            .par_iter()
            .fold(
                || (0usize, 0usize, 0.0f64),
                |mut acc, s| {
                    if s.is_trivial() {
                        acc.0 += 1;
                    } else {
                        acc.1 += 1;
                    }
                    acc.2 += s.weight();
                    acc
                },
            )
            .reduce(|| (0, 0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

        RunLog {
            input: self.args.input.clone(),
            out_dir: self.out_dir.clone(),
            matrix: MatrixMeta {
                n,
                npairs: n * n.saturating_sub(1) / 2,
                delimiter: parse.delimiter.to_string(),
                has_header: parse.has_header,
                has_index: parse.has_index,
                symmetry_pairs_fixed: parse.symmetry_pairs_fixed,
            },
            ordering: self.args.ordering.as_str().to_string(),
            cycle: cycle[1..].iter().map(|&t| labels[t - 1].clone()).collect(),
            params: self.args.nnls_params.clone(),
            report,
            splits: SplitSummary {
                num_splits: splits.len(),
                num_trivial_splits: num_trivial,
                num_nontrivial_splits: num_nontrivial,
                sum_weights,
            },
            fit_percent: fit,
            timings: RunTimings {
                load_sec: parse.load_sec,
                stages: timings,
                output_sec,
                total_sec,
            },
            system: system_stats(),
        }
    }
}

/* ───────────── records ───────────── */

#[derive(Serialize)]
struct SplitRow {
    split: usize,
    weight: f64,
    size: usize,
    trivial: bool,
    taxa: String,
}

#[derive(Serialize)]
struct MatrixMeta {
    n: usize,
    npairs: usize,
    delimiter: String,
    has_header: bool,
    has_index: bool,
    symmetry_pairs_fixed: usize,
}

#[derive(Serialize)]
struct SplitSummary {
    num_splits: usize,
    num_trivial_splits: usize,
    num_nontrivial_splits: usize,
    sum_weights: f64,
}

#[derive(Serialize)]
struct RunTimings {
    load_sec: f64,
    #[serde(flatten)]
    stages: StageTimings,
    output_sec: f64,
    total_sec: f64,
}

#[derive(Serialize)]
struct SystemStats {
    os: String,
    arch: String,
    num_cpus: usize,
    rayon_threads: usize,
}

#[derive(Serialize)]
struct RunLog {
    input: String,
    out_dir: String,
    matrix: MatrixMeta,
    ordering: String,
    cycle: Vec<String>,
    params: NNLSParams,
    report: SolveReport,
    splits: SplitSummary,
    fit_percent: f64,
    timings: RunTimings,
    system: SystemStats,
}

fn system_stats() -> SystemStats {
    SystemStats {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        num_cpus: num_cpus::get(),
        rayon_threads: rayon::current_num_threads(),
    }
}

fn side_labels(split: &ASplit, labels: &[String]) -> String {
    split
        .side()
        .ones()
        .filter(|&t| t >= 1 && t <= labels.len())
        .map(|t| labels[t - 1].as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/* ───────────── tests ───────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::nnls::CancelFlag;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const SQUARE: &str = ",A,B,C,D\nA,0,2,4,4\nB,2,0,4,4\nC,4,4,0,2\nD,4,4,2,0\n";

    fn args_for(input: &Path) -> NetworkArgs {
        NetworkArgs {
            input: input.to_string_lossy().into_owned(),
            output_prefix: "square".into(),
            ..NetworkArgs::default()
        }
    }

    #[test]
    fn writes_splits_and_run_log() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("square.csv");
        fs::write(&input, SQUARE).unwrap();
        let out_dir = dir.path().join("out");

        NetworkRunner::new(out_dir.to_string_lossy().into_owned(), args_for(&input))
            .run()
            .unwrap();

        let table = fs::read_to_string(out_dir.join("square.splits.tsv")).unwrap();
        let mut lines = table.lines();
        assert_eq!(lines.next(), Some("split\tweight\tsize\ttrivial\ttaxa"));
        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows.iter().filter(|r| r.contains("\tfalse\t")).count(), 1);

        let log: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join("run_log.json")).unwrap())
                .unwrap();
        assert_eq!(log["matrix"]["n"], 4);
        assert_eq!(log["splits"]["num_splits"], 5);
        assert_eq!(log["ordering"], "agglomerative");
        assert_eq!(log["params"]["strategy"], "active-set");
        assert!(log["report"]["objective_trace"].is_array());
        assert!(log["fit_percent"].as_f64().unwrap() > 99.99);
        for stage in ["load_sec", "cycle_sec", "nnls_sec", "splits_sec", "fit_sec", "total_sec"] {
            assert!(log["timings"][stage].as_f64().unwrap() >= 0.0, "{stage}");
        }
    }

    #[test]
    fn run_log_matches_the_library_result() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("square.csv");
        fs::write(&input, SQUARE).unwrap();
        let out_dir = dir.path().join("out");
        let args = NetworkArgs {
            ordering: crate::ordering::OrderingMethod::Components,
            ..args_for(&input)
        };
        NetworkRunner::new(out_dir.to_string_lossy().into_owned(), args.clone())
            .run()
            .unwrap();

        let (distances, labels, _) = read_distance_matrix(&args.input).unwrap();
        let net =
            compute_circular_network(&distances, args.ordering, &args.nnls_params, None).unwrap();
        let log: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join("run_log.json")).unwrap())
                .unwrap();
        let cycle: Vec<String> = net.cycle[1..].iter().map(|&t| labels[t - 1].clone()).collect();
        assert_eq!(log["cycle"], serde_json::json!(cycle));
        assert_eq!(log["splits"]["num_splits"], net.nsplits());
        let objective = log["report"]["objective"].as_f64().unwrap();
        assert!((objective - net.report.objective).abs() <= 1e-12 * objective.abs().max(1.0));
    }

    #[test]
    fn cancelled_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("square.csv");
        fs::write(&input, SQUARE).unwrap();
        let out_dir = dir.path().join("out");
        let flag = CancelFlag::new();
        flag.cancel();

        let err = NetworkRunner::new(out_dir.to_string_lossy().into_owned(), args_for(&input))
            .run_with_progress(Some(&flag as &dyn Progress))
            .unwrap_err();
        assert!(crate::weights::nnls::is_cancelled(&err));
        assert!(!out_dir.join("run_log.json").exists());
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempdir().unwrap();
        let runner = NetworkRunner::new(
            dir.path().to_string_lossy().into_owned(),
            args_for(&dir.path().join("nope.csv")),
        );
        assert!(runner.run().is_err());
    }
}
