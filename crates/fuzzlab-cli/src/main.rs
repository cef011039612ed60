use anyhow::Context;
use clap::{Parser, Subcommand};
use fuzzlab_adapters::{resolve_tool, FsLogStore, StdProcessRunner};
use fuzzlab_app::{
    export::table_to_csv,
    report::{render_describe, render_markdown},
    Clock, CompareRequest, CompareUseCase, RunExperimentRequest, RunExperimentUseCase, SystemClock,
};
use fuzzlab_types::{CompareReceipt, Direction, Metric, PlanFile, TableReceipt, ToolInfo};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_ITERATIONS: u32 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_OUT_DIR: &str = "results";
const DEFAULT_OUTPUT_CAP_BYTES: usize = 1 << 20;

/// Metrics described when none are named explicitly.
const DEFAULT_DESCRIBE_METRICS: [Metric; 5] = [
    Metric::ExecutionTime,
    Metric::BugsFound,
    Metric::Coverage,
    Metric::CoverageEfficiency,
    Metric::BugsPerSecond,
];

/// Metrics compared when none are named explicitly.
const DEFAULT_COMPARE_METRICS: [Metric; 4] = [
    Metric::ExecutionTime,
    Metric::BugsFound,
    Metric::Coverage,
    Metric::CoverageEfficiency,
];

#[derive(Debug, Parser)]
#[command(
    name = "fuzzlab",
    version,
    about = "Run fuzzer-configuration experiments and compare them statistically"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute an experiment plan and emit a metrics table (JSON + CSV).
    Run {
        /// Experiment plan (TOML)
        #[arg(long)]
        plan: PathBuf,

        /// Override the plan's iterations per configuration
        #[arg(long)]
        iterations: Option<u32>,

        /// Override the plan's per-iteration timeout (e.g. "300s")
        #[arg(long)]
        timeout: Option<String>,

        /// Override the plan's output directory
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Working directory for the fuzzer
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Max bytes captured from stdout/stderr per execution
        #[arg(long, default_value_t = DEFAULT_OUTPUT_CAP_BYTES)]
        output_cap_bytes: usize,

        /// Pretty-print the JSON table
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Print descriptive statistics per configuration from a metrics table.
    Describe {
        /// Metrics table (JSON receipt from `run`)
        #[arg(long)]
        table: PathBuf,

        /// Metric to describe (repeatable; defaults to a standard set)
        #[arg(long = "metric", value_parser = parse_metric)]
        metrics: Vec<Metric>,
    },

    /// Compare two configurations and emit a comparison receipt (JSON).
    Compare {
        /// Metrics table (JSON receipt from `run`)
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        baseline: String,

        #[arg(long)]
        treatment: String,

        /// Metric to compare (repeatable; defaults to a standard set)
        #[arg(long = "metric", value_parser = parse_metric)]
        metrics: Vec<Metric>,

        /// Override per-metric direction, e.g. corpus_size=lower
        #[arg(long, value_parser = parse_key_val_string)]
        direction: Vec<(String, String)>,

        /// Output comparison receipt
        #[arg(long, default_value = "comparison.json")]
        out: PathBuf,

        /// Pretty-print JSON
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Render a Markdown report from a table and a comparison receipt.
    Report {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        compare: PathBuf,

        /// Output markdown path (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Export a metrics table as CSV.
    ExportCsv {
        #[arg(long)]
        table: PathBuf,

        /// Output CSV path (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    init_tracing();

    if let Err(err) = real_main() {
        eprintln!("{err:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn real_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Run {
            plan,
            iterations,
            timeout,
            out_dir,
            cwd,
            output_cap_bytes,
            pretty,
        } => {
            let plan_src = fs::read_to_string(&plan)
                .with_context(|| format!("read plan {}", plan.display()))?;
            let plan_file: PlanFile = toml::from_str(&plan_src)
                .with_context(|| format!("parse plan {}", plan.display()))?;

            if plan_file.tool.is_empty() {
                anyhow::bail!("plan must name a tool argv");
            }

            // Fail before any iteration if the binary is not reachable.
            let resolved = resolve_tool(&plan_file.tool[0])?;
            tracing::debug!(tool = %resolved.display(), "resolved fuzzer binary");

            let iterations = iterations
                .or(plan_file.defaults.iterations)
                .unwrap_or(DEFAULT_ITERATIONS);

            let timeout = match timeout.as_deref().or(plan_file.defaults.timeout.as_deref()) {
                Some(s) => parse_duration(s)?,
                None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            };

            let out_dir = out_dir
                .or_else(|| plan_file.defaults.out_dir.as_ref().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));

            let raw_dir = out_dir.join("raw_data");
            let processed_dir = out_dir.join("processed_data");
            let reports_dir = out_dir.join("reports");
            for dir in [&raw_dir, &processed_dir, &reports_dir] {
                fs::create_dir_all(dir)
                    .with_context(|| format!("create dir {}", dir.display()))?;
            }

            let use_case = RunExperimentUseCase::new(
                StdProcessRunner,
                FsLogStore::new(&raw_dir),
                SystemClock,
                tool_info(),
            );

            let outcome = use_case.execute(RunExperimentRequest {
                tool: plan_file.tool.clone(),
                target: plan_file.target.clone(),
                configs: plan_file.configs.clone(),
                iterations,
                timeout: Some(timeout),
                cwd,
                output_cap_bytes,
            })?;

            for reason in &outcome.reasons {
                tracing::warn!("{reason}");
            }

            let json_path = processed_dir.join("metrics.json");
            write_json(&json_path, &outcome.receipt, pretty)?;

            let csv_path = processed_dir.join("metrics.csv");
            atomic_write(&csv_path, table_to_csv(&outcome.receipt.table).as_bytes())?;

            println!("{}", json_path.display());
            Ok(())
        }

        Command::Describe { table, metrics } => {
            let receipt = read_table(&table)?;
            let metrics = if metrics.is_empty() {
                DEFAULT_DESCRIBE_METRICS.to_vec()
            } else {
                metrics
            };

            let summaries = fuzzlab_domain::describe(&receipt.table, &metrics);
            print!("{}", render_describe(&summaries));
            Ok(())
        }

        Command::Compare {
            table,
            baseline,
            treatment,
            metrics,
            direction,
            out,
            pretty,
        } => {
            let receipt = read_table(&table)?;
            let metrics = if metrics.is_empty() {
                DEFAULT_COMPARE_METRICS.to_vec()
            } else {
                metrics
            };

            let directions = build_directions(&metrics, direction)?;

            let compare = CompareUseCase::execute(CompareRequest {
                table: receipt.table,
                baseline_config: baseline,
                treatment_config: treatment,
                directions,
                tool: tool_info(),
            })?;

            write_json(&out, &compare, pretty)?;
            Ok(())
        }

        Command::Report {
            table,
            compare,
            out,
        } => {
            let receipt = read_table(&table)?;
            let compare_receipt: CompareReceipt = read_json(&compare)?;
            if compare_receipt.schema != fuzzlab_types::COMPARE_SCHEMA_V1 {
                anyhow::bail!(
                    "unsupported comparison schema {:?} (expected {:?})",
                    compare_receipt.schema,
                    fuzzlab_types::COMPARE_SCHEMA_V1
                );
            }

            let md = render_markdown(&receipt.table, &compare_receipt, &SystemClock.now_rfc3339());

            match out {
                Some(path) => {
                    fs::write(&path, md).with_context(|| format!("write {}", path.display()))?;
                }
                None => {
                    print!("{md}");
                }
            }
            Ok(())
        }

        Command::ExportCsv { table, out } => {
            let receipt = read_table(&table)?;
            let csv = table_to_csv(&receipt.table);

            match out {
                Some(path) => {
                    atomic_write(&path, csv.as_bytes())?;
                }
                None => {
                    print!("{csv}");
                }
            }
            Ok(())
        }
    }
}

fn tool_info() -> ToolInfo {
    ToolInfo {
        name: "fuzzlab".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let d = humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))?;
    Ok(d)
}

fn parse_metric(s: &str) -> Result<Metric, String> {
    Metric::from_name(s).ok_or_else(|| format!("unknown metric: {s}"))
}

fn parse_key_val_string(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| "expected KEY=VALUE".to_string())?;
    Ok((k.to_string(), v.to_string()))
}

fn build_directions(
    metrics: &[Metric],
    overrides: Vec<(String, String)>,
) -> anyhow::Result<BTreeMap<Metric, Direction>> {
    let mut by_name: BTreeMap<String, String> = overrides.into_iter().collect();

    let mut directions = BTreeMap::new();
    for &metric in metrics {
        let dir = match by_name.remove(metric.name()).as_deref() {
            Some("lower") => Direction::Lower,
            Some("higher") => Direction::Higher,
            Some(other) => anyhow::bail!(
                "invalid direction for {}: {other} (expected lower|higher)",
                metric.name()
            ),
            None => metric.default_direction(),
        };
        directions.insert(metric, dir);
    }

    if let Some(name) = by_name.into_keys().next() {
        anyhow::bail!("direction override for metric not being compared: {name}");
    }

    Ok(directions)
}

fn read_table(path: &Path) -> anyhow::Result<TableReceipt> {
    let src = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    fuzzlab_app::table_from_receipt_json(&src)
        .with_context(|| format!("load table {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let v =
        serde_json::from_slice(&bytes).with_context(|| format!("parse json {}", path.display()))?;
    Ok(v)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, pretty: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }

    let bytes = if pretty {
        serde_json::to_vec_pretty(value)?
    } else {
        serde_json::to_vec(value)?
    };

    atomic_write(path, &bytes)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = parent.to_path_buf();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4()));

    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("create temp {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write temp {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
