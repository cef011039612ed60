//! Application layer for fuzzlab.
//!
//! The app layer coordinates adapters, extraction, and domain statistics.
//! It does not parse CLI flags and it does not touch the filesystem except
//! through the injected [`LogStore`].

pub mod export;
pub mod report;

use anyhow::{bail, Context};
use fuzzlab_adapters::{CommandSpec, LogEntry, LogStore, ProcessRunner};
use fuzzlab_extract::build_record;
use fuzzlab_types::{
    CompareReceipt, Direction, HostInfo, Metric, MetricsRecord, MetricsTable, PlanConfig, RunMeta,
    TableReceipt, ToolInfo,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        use time::format_description::well_known::Rfc3339;
        time::OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RunExperimentRequest {
    /// argv prefix of the fuzzer under test, e.g. `["stack", "exec", "echidna", "--"]`.
    pub tool: Vec<String>,

    /// Target artifact appended to the argv, before `--config`.
    pub target: String,

    pub configs: Vec<PlanConfig>,
    pub iterations: u32,
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
    pub output_cap_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RunExperimentOutcome {
    pub receipt: TableReceipt,

    /// Human-readable notes on timeouts and skipped iterations.
    pub reasons: Vec<String>,
}

pub struct RunExperimentUseCase<R: ProcessRunner, L: LogStore, C: Clock> {
    runner: R,
    logs: L,
    clock: C,
    tool: ToolInfo,
}

impl<R: ProcessRunner, L: LogStore, C: Clock> RunExperimentUseCase<R, L, C> {
    pub fn new(runner: R, logs: L, clock: C, tool: ToolInfo) -> Self {
        Self {
            runner,
            logs,
            clock,
            tool,
        }
    }

    pub fn execute(&self, req: RunExperimentRequest) -> anyhow::Result<RunExperimentOutcome> {
        if req.configs.is_empty() {
            bail!("experiment plan names no configurations");
        }
        if req.iterations == 0 {
            bail!("iterations must be at least 1");
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = self.clock.now_rfc3339();

        let host = HostInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        };

        let mut table = MetricsTable::new();
        let mut reasons: Vec<String> = Vec::new();

        for config in &req.configs {
            for iteration in 1..=req.iterations {
                let spec = CommandSpec {
                    argv: command_argv(&req.tool, &req.target, &config.path),
                    cwd: req.cwd.clone(),
                    timeout: req.timeout,
                    output_cap_bytes: req.output_cap_bytes,
                };

                let run = match self.runner.run(&spec) {
                    Ok(run) => run,
                    Err(err) => {
                        // A failed launch is not an observation; record the
                        // reason and move on to the next iteration.
                        warn!(config = %config.name, iteration, %err, "execution failed, skipping");
                        reasons.push(format!(
                            "{} iteration {}: execution failed: {}",
                            config.name, iteration, err
                        ));
                        continue;
                    }
                };

                let stdout = String::from_utf8_lossy(&run.stdout).to_string();
                let stderr = String::from_utf8_lossy(&run.stderr).to_string();

                if run.timed_out {
                    // A killed run's output is neither parsed nor archived.
                    let ceiling = req
                        .timeout
                        .map(|d| d.as_secs_f64())
                        .unwrap_or_else(|| run.wall.as_secs_f64());
                    reasons.push(format!(
                        "{} iteration {}: timed out after {:.0}s",
                        config.name, iteration, ceiling
                    ));
                    table.push(MetricsRecord::from_timeout(&config.name, iteration, ceiling));
                    continue;
                }

                let record = build_record(
                    &config.name,
                    iteration,
                    run.wall.as_secs_f64(),
                    &stdout,
                    &stderr,
                );

                let entry = LogEntry {
                    stdout: &stdout,
                    stderr: &stderr,
                    exit_code: run.exit_code,
                    execution_time: record.execution_time,
                };
                if let Err(err) = self.logs.persist(&config.name, iteration, &entry) {
                    // The record is still valid; only the audit artifact is lost.
                    warn!(config = %config.name, iteration, %err, "failed to persist log");
                }

                table.push(record);
            }
        }

        let ended_at = self.clock.now_rfc3339();

        let receipt = TableReceipt {
            schema: fuzzlab_types::TABLE_SCHEMA_V1.to_string(),
            tool: self.tool.clone(),
            run: RunMeta {
                id: run_id,
                started_at,
                ended_at,
                host,
            },
            table,
        };

        Ok(RunExperimentOutcome { receipt, reasons })
    }
}

fn command_argv(tool: &[String], target: &str, config_path: &str) -> Vec<String> {
    let mut argv = tool.to_vec();
    argv.push(target.to_string());
    argv.push("--config".to_string());
    argv.push(config_path.to_string());
    argv
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub table: MetricsTable,
    pub baseline_config: String,
    pub treatment_config: String,
    pub directions: BTreeMap<Metric, Direction>,
    pub tool: ToolInfo,
}

pub struct CompareUseCase;

impl CompareUseCase {
    pub fn execute(req: CompareRequest) -> anyhow::Result<CompareReceipt> {
        let configs = req.table.configs();
        for name in [&req.baseline_config, &req.treatment_config] {
            if !configs.contains(&name.as_str()) {
                bail!(
                    "configuration {:?} has no records (available: {:?})",
                    name,
                    configs
                );
            }
        }

        let results = fuzzlab_domain::compare_configs(
            &req.table,
            &req.baseline_config,
            &req.treatment_config,
            &req.directions,
        );

        Ok(CompareReceipt {
            schema: fuzzlab_types::COMPARE_SCHEMA_V1.to_string(),
            tool: req.tool,
            baseline_config: req.baseline_config,
            treatment_config: req.treatment_config,
            directions: req.directions,
            results,
        })
    }
}

/// Parse a persisted table receipt, insisting on a schema we understand.
pub fn table_from_receipt_json(json: &str) -> anyhow::Result<TableReceipt> {
    let receipt: TableReceipt =
        serde_json::from_str(json).context("failed to parse table receipt JSON")?;
    if receipt.schema != fuzzlab_types::TABLE_SCHEMA_V1 {
        bail!(
            "unsupported table schema {:?} (expected {:?})",
            receipt.schema,
            fuzzlab_types::TABLE_SCHEMA_V1
        );
    }
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzlab_adapters::{AdapterError, RunResult};
    use std::cell::RefCell;
    use std::sync::Mutex;

    struct FixedClock;

    impl Clock for FixedClock {
        fn now_rfc3339(&self) -> String {
            "2026-01-01T00:00:00Z".to_string()
        }
    }

    /// Runner that replays scripted results in argv order.
    struct ScriptedRunner {
        script: RefCell<Vec<Result<RunResult, AdapterError>>>,
        seen_argv: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<Result<RunResult, AdapterError>>) -> Self {
            Self {
                script: RefCell::new(script),
                seen_argv: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
            self.seen_argv.borrow_mut().push(spec.argv.clone());
            self.script.borrow_mut().remove(0)
        }
    }

    #[derive(Default)]
    struct RecordingLogStore {
        persisted: Mutex<Vec<(String, u32)>>,
    }

    impl LogStore for RecordingLogStore {
        fn persist(
            &self,
            config: &str,
            iteration: u32,
            _entry: &LogEntry<'_>,
        ) -> anyhow::Result<PathBuf> {
            self.persisted
                .lock()
                .unwrap()
                .push((config.to_string(), iteration));
            Ok(PathBuf::from(format!("{config}_{iteration}.log")))
        }
    }

    impl LogStore for &RecordingLogStore {
        fn persist(
            &self,
            config: &str,
            iteration: u32,
            entry: &LogEntry<'_>,
        ) -> anyhow::Result<PathBuf> {
            <RecordingLogStore as LogStore>::persist(self, config, iteration, entry)
        }
    }

    fn ok_run(stdout: &str, secs: f64) -> Result<RunResult, AdapterError> {
        Ok(RunResult {
            wall: Duration::from_secs_f64(secs),
            exit_code: 0,
            timed_out: false,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    fn timed_out_run() -> Result<RunResult, AdapterError> {
        Ok(RunResult {
            wall: Duration::from_secs(300),
            exit_code: -1,
            timed_out: true,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    fn request(configs: Vec<PlanConfig>, iterations: u32) -> RunExperimentRequest {
        RunExperimentRequest {
            tool: vec!["echidna".to_string()],
            target: "contract.sol".to_string(),
            configs,
            iterations,
            timeout: Some(Duration::from_secs(300)),
            cwd: None,
            output_cap_bytes: 1 << 20,
        }
    }

    fn plan_config(name: &str) -> PlanConfig {
        PlanConfig {
            name: name.to_string(),
            path: format!("configs/{name}.yaml"),
        }
    }

    fn tool() -> ToolInfo {
        ToolInfo {
            name: "fuzzlab".to_string(),
            version: "0.3.0".to_string(),
        }
    }

    #[test]
    fn builds_argv_with_target_and_config_flag() {
        assert_eq!(
            command_argv(
                &["stack".into(), "exec".into(), "echidna".into(), "--".into()],
                "contract.sol",
                "configs/baseline.yaml"
            ),
            vec![
                "stack",
                "exec",
                "echidna",
                "--",
                "contract.sol",
                "--config",
                "configs/baseline.yaml"
            ]
        );
    }

    #[test]
    fn runs_every_config_iteration_and_extracts_records() {
        let runner = ScriptedRunner::new(vec![
            ok_run("x: failed!\nUnique instructions: 10\nTotal calls: 100\n", 10.0),
            ok_run("Unique instructions: 20\nTotal calls: 100\n", 10.0),
        ]);
        let logs = RecordingLogStore::default();
        let use_case = RunExperimentUseCase::new(runner, logs, FixedClock, tool());

        let outcome = use_case
            .execute(request(vec![plan_config("baseline")], 2))
            .unwrap();

        assert!(outcome.reasons.is_empty());
        let table = &outcome.receipt.table;
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[0].bugs_found, 1);
        assert_eq!(table.records()[0].iteration, 1);
        assert_eq!(table.records()[1].bugs_found, 0);
        assert_eq!(table.records()[1].iteration, 2);
        assert_eq!(outcome.receipt.schema, fuzzlab_types::TABLE_SCHEMA_V1);
        assert_eq!(outcome.receipt.run.started_at, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn timeout_yields_degenerate_record_and_reason() {
        let runner = ScriptedRunner::new(vec![timed_out_run()]);
        let logs = RecordingLogStore::default();
        let use_case = RunExperimentUseCase::new(runner, &logs, FixedClock, tool());

        let outcome = use_case
            .execute(request(vec![plan_config("baseline")], 1))
            .unwrap();

        let record = &outcome.receipt.table.records()[0];
        assert!(record.timed_out);
        assert_eq!(record.execution_time, 300.0);
        assert_eq!(record.bugs_found, 0);
        assert_eq!(record.bugs_per_second, None);
        assert_eq!(outcome.reasons.len(), 1);
        assert!(outcome.reasons[0].contains("timed out"));
        // No log artifact for a killed run.
        assert!(logs.persisted.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_launch_skips_iteration_but_keeps_the_rest() {
        let runner = ScriptedRunner::new(vec![
            Err(AdapterError::Other(anyhow::anyhow!("spawn failed"))),
            ok_run("Total calls: 5\n", 1.0),
        ]);
        let use_case =
            RunExperimentUseCase::new(runner, RecordingLogStore::default(), FixedClock, tool());

        let outcome = use_case
            .execute(request(vec![plan_config("baseline")], 2))
            .unwrap();

        assert_eq!(outcome.receipt.table.len(), 1);
        assert_eq!(outcome.receipt.table.records()[0].iteration, 2);
        assert_eq!(outcome.reasons.len(), 1);
        assert!(outcome.reasons[0].contains("execution failed"));
    }

    #[test]
    fn persists_one_log_per_completed_observation() {
        let runner = ScriptedRunner::new(vec![
            ok_run("", 1.0),
            timed_out_run(),
            ok_run("", 1.0),
            ok_run("", 1.0),
        ]);
        let logs = RecordingLogStore::default();
        let use_case = RunExperimentUseCase::new(runner, &logs, FixedClock, tool());

        let outcome = use_case
            .execute(request(
                vec![plan_config("baseline"), plan_config("treatment")],
                2,
            ))
            .unwrap();

        assert_eq!(outcome.receipt.table.len(), 4);
        assert_eq!(
            outcome.receipt.table.configs(),
            vec!["baseline", "treatment"]
        );
        // The timed-out iteration leaves no artifact.
        assert_eq!(
            *logs.persisted.lock().unwrap(),
            vec![
                ("baseline".to_string(), 1),
                ("treatment".to_string(), 1),
                ("treatment".to_string(), 2),
            ]
        );
    }

    #[test]
    fn empty_plan_is_rejected() {
        let runner = ScriptedRunner::new(vec![]);
        let use_case =
            RunExperimentUseCase::new(runner, RecordingLogStore::default(), FixedClock, tool());
        assert!(use_case.execute(request(vec![], 2)).is_err());
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let runner = ScriptedRunner::new(vec![]);
        let use_case =
            RunExperimentUseCase::new(runner, RecordingLogStore::default(), FixedClock, tool());
        assert!(use_case
            .execute(request(vec![plan_config("baseline")], 0))
            .is_err());
    }

    #[test]
    fn compare_rejects_unknown_config() {
        let mut table = MetricsTable::new();
        table.push(MetricsRecord::from_timeout("baseline", 1, 1.0));

        let req = CompareRequest {
            table,
            baseline_config: "baseline".to_string(),
            treatment_config: "missing".to_string(),
            directions: BTreeMap::new(),
            tool: tool(),
        };
        assert!(CompareUseCase::execute(req).is_err());
    }

    #[test]
    fn compare_produces_receipt_with_schema() {
        let mut table = MetricsTable::new();
        for i in 1..=3 {
            let mut r = MetricsRecord::from_timeout("baseline", i, 10.0 + i as f64);
            r.timed_out = false;
            table.push(r);
            let mut r = MetricsRecord::from_timeout("treatment", i, 5.0 + i as f64);
            r.timed_out = false;
            table.push(r);
        }

        let mut directions = BTreeMap::new();
        directions.insert(Metric::ExecutionTime, Direction::Lower);

        let receipt = CompareUseCase::execute(CompareRequest {
            table,
            baseline_config: "baseline".to_string(),
            treatment_config: "treatment".to_string(),
            directions,
            tool: tool(),
        })
        .unwrap();

        assert_eq!(receipt.schema, fuzzlab_types::COMPARE_SCHEMA_V1);
        let result = &receipt.results[&Metric::ExecutionTime];
        assert!(result.improvement_pct.is_some_and(|p| p > 0.0));
    }

    #[test]
    fn zero_baseline_mean_round_trips_through_json() {
        // A baseline that never found a bug is routine; the receipt it
        // produces must still be readable by the report stage.
        let mut table = MetricsTable::new();
        for i in 1..=3 {
            let mut b = MetricsRecord::from_timeout("baseline", i, 10.0);
            b.timed_out = false;
            table.push(b);
            let mut t = MetricsRecord::from_timeout("treatment", i, 10.0);
            t.timed_out = false;
            t.bugs_found = i as u64;
            table.push(t);
        }

        let mut directions = BTreeMap::new();
        directions.insert(Metric::BugsFound, Direction::Higher);

        let receipt = CompareUseCase::execute(CompareRequest {
            table,
            baseline_config: "baseline".to_string(),
            treatment_config: "treatment".to_string(),
            directions,
            tool: tool(),
        })
        .unwrap();

        let result = &receipt.results[&Metric::BugsFound];
        assert_eq!(result.baseline_mean, 0.0);
        assert_eq!(result.improvement_pct, None);

        let json = serde_json::to_string(&receipt).unwrap();
        assert!(!json.contains("improvement_pct"));
        let back: CompareReceipt = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results[&Metric::BugsFound].improvement_pct, None);
        assert_eq!(back, receipt);
    }

    #[test]
    fn table_receipt_json_rejects_foreign_schema() {
        let json = r#"{"schema":"somebody.else.v9","tool":{"name":"x","version":"0"},"run":{"id":"a","started_at":"t","ended_at":"t","host":{"os":"linux","arch":"x86_64"}},"records":[]}"#;
        assert!(table_from_receipt_json(json).is_err());
    }
}
