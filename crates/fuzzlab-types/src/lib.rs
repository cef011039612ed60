//! Shared types for fuzzlab.
//!
//! Design goal: versioned, explicit, boring.
//! These structs are the stable contract between the experiment runner, the
//! statistics layer, and the (external) plot/report consumers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TABLE_SCHEMA_V1: &str = "fuzzlab.table.v1";
pub const COMPARE_SCHEMA_V1: &str = "fuzzlab.compare.v1";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RunMeta {
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
    pub host: HostInfo,
}

/// One observation: a single (configuration, iteration) execution of the
/// fuzzer under test.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MetricsRecord {
    pub config: String,
    pub iteration: u32,

    /// Measured wall-clock duration in seconds. For a timed-out execution
    /// this is the configured ceiling, not the (unknown) true duration.
    pub execution_time: f64,

    #[serde(default)]
    pub timed_out: bool,

    /// Count of `failed!` markers in the captured output.
    pub bugs_found: u64,

    /// Unique instructions exercised (the fuzzer's coverage counter).
    pub coverage: u64,

    pub total_calls: u64,
    pub corpus_size: u64,

    /// Rates are absent when the execution time is zero, or when the
    /// execution timed out and its output was never parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bugs_per_second: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_per_second: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls_per_second: Option<f64>,

    /// coverage / total_calls; defined as 0 when total_calls is 0.
    pub coverage_efficiency: f64,
}

impl MetricsRecord {
    /// Degenerate but valid record for an execution that hit the wall-clock
    /// ceiling. Output of a killed run is not parsed, so all counts are zero
    /// and no rate is derivable.
    pub fn from_timeout(config: impl Into<String>, iteration: u32, ceiling_secs: f64) -> Self {
        Self {
            config: config.into(),
            iteration,
            execution_time: ceiling_secs,
            timed_out: true,
            bugs_found: 0,
            coverage: 0,
            total_calls: 0,
            corpus_size: 0,
            bugs_per_second: None,
            coverage_per_second: None,
            calls_per_second: None,
            coverage_efficiency: 0.0,
        }
    }

    /// Value of a metric for this record, or `None` when the metric is not
    /// defined for it (suppressed rates).
    pub fn metric_value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::ExecutionTime => Some(self.execution_time),
            Metric::BugsFound => Some(self.bugs_found as f64),
            Metric::Coverage => Some(self.coverage as f64),
            Metric::TotalCalls => Some(self.total_calls as f64),
            Metric::CorpusSize => Some(self.corpus_size as f64),
            Metric::BugsPerSecond => self.bugs_per_second,
            Metric::CoveragePerSecond => self.coverage_per_second,
            Metric::CallsPerSecond => self.calls_per_second,
            Metric::CoverageEfficiency => Some(self.coverage_efficiency),
        }
    }
}

/// Append-only collection of records in execution order.
///
/// Grouping by `config` drives all downstream statistics; row order only
/// matters for iteration-ordered consumers, which should call
/// [`MetricsTable::sort_by_config_iteration`] first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct MetricsTable {
    records: Vec<MetricsRecord>,
}

impl MetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: MetricsRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MetricsRecord] {
        &self.records
    }

    /// Configuration names in first-seen order.
    pub fn configs(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for r in &self.records {
            if !seen.contains(&r.config.as_str()) {
                seen.push(r.config.as_str());
            }
        }
        seen
    }

    /// Non-null values of `metric` over the rows of one configuration.
    pub fn values_for(&self, config: &str, metric: Metric) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.config == config)
            .filter_map(|r| r.metric_value(metric))
            .collect()
    }

    /// Stable sort by (config, iteration), for iteration-ordered consumers.
    pub fn sort_by_config_iteration(&mut self) {
        self.records
            .sort_by(|a, b| (a.config.as_str(), a.iteration).cmp(&(b.config.as_str(), b.iteration)));
    }
}

impl FromIterator<MetricsRecord> for MetricsTable {
    fn from_iter<I: IntoIterator<Item = MetricsRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Persisted envelope for one experiment run's table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TableReceipt {
    pub schema: String,
    pub tool: ToolInfo,
    pub run: RunMeta,

    #[serde(rename = "records")]
    pub table: MetricsTable,
}

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ExecutionTime,
    BugsFound,
    Coverage,
    TotalCalls,
    CorpusSize,
    BugsPerSecond,
    CoveragePerSecond,
    CallsPerSecond,
    CoverageEfficiency,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::ExecutionTime,
        Metric::BugsFound,
        Metric::Coverage,
        Metric::TotalCalls,
        Metric::CorpusSize,
        Metric::BugsPerSecond,
        Metric::CoveragePerSecond,
        Metric::CallsPerSecond,
        Metric::CoverageEfficiency,
    ];

    /// Direction policy is explicit per metric rather than inferred at
    /// comparison time. Execution time is the one metric where lower is
    /// better; every counter and rate improves upward.
    pub fn default_direction(self) -> Direction {
        match self {
            Metric::ExecutionTime => Direction::Lower,
            _ => Direction::Higher,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Metric::ExecutionTime => "execution_time",
            Metric::BugsFound => "bugs_found",
            Metric::Coverage => "coverage",
            Metric::TotalCalls => "total_calls",
            Metric::CorpusSize => "corpus_size",
            Metric::BugsPerSecond => "bugs_per_second",
            Metric::CoveragePerSecond => "coverage_per_second",
            Metric::CallsPerSecond => "calls_per_second",
            Metric::CoverageEfficiency => "coverage_efficiency",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        // `unique_instructions` is the fuzzer's own name for its coverage
        // counter; accept it as an alias.
        match s {
            "execution_time" => Some(Metric::ExecutionTime),
            "bugs_found" => Some(Metric::BugsFound),
            "coverage" | "unique_instructions" => Some(Metric::Coverage),
            "total_calls" => Some(Metric::TotalCalls),
            "corpus_size" => Some(Metric::CorpusSize),
            "bugs_per_second" => Some(Metric::BugsPerSecond),
            "coverage_per_second" => Some(Metric::CoveragePerSecond),
            "calls_per_second" => Some(Metric::CallsPerSecond),
            "coverage_efficiency" => Some(Metric::CoverageEfficiency),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Lower,
    Higher,
}

/// Descriptive summary of one metric within one configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EffectSize {
    Small,
    Medium,
    Large,
}

impl EffectSize {
    /// Cohen's conventions with strict thresholds: |d| > 0.8 is large,
    /// |d| > 0.5 is medium, anything else is small.
    pub fn from_d(d: f64) -> Self {
        let abs = d.abs();
        if abs > 0.8 {
            EffectSize::Large
        } else if abs > 0.5 {
            EffectSize::Medium
        } else {
            EffectSize::Small
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EffectSize::Small => "Small",
            EffectSize::Medium => "Medium",
            EffectSize::Large => "Large",
        }
    }
}

/// Outcome of comparing one metric between a baseline and a treatment
/// configuration.
///
/// `t_statistic` and `p_value` are `None` when the test is indeterminate
/// (zero variance in both groups); consumers must treat that as "not
/// significant / indeterminate", never as a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ComparisonResult {
    pub baseline_mean: f64,
    pub treatment_mean: f64,

    /// Signed percentage improvement, oriented by the metric's direction
    /// policy: positive always means the treatment did better. Absent when
    /// the baseline mean is 0 and the ratio is undefined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_pct: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_statistic: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,

    pub cohens_d: f64,
    pub significant: bool,
    pub effect_size: EffectSize,
}

/// Persisted envelope for a baseline-vs-treatment comparison.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CompareReceipt {
    pub schema: String,
    pub tool: ToolInfo,

    pub baseline_config: String,
    pub treatment_config: String,

    pub directions: BTreeMap<Metric, Direction>,
    pub results: BTreeMap<Metric, ComparisonResult>,
}

// ----------------------------
// Experiment plan file schema
// ----------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct PlanFile {
    /// argv prefix of the external fuzzer (no shell parsing).
    pub tool: Vec<String>,

    /// Target artifact handed to the fuzzer (e.g. a contract source file).
    pub target: String,

    #[serde(default)]
    pub defaults: PlanDefaults,

    #[serde(default, rename = "config")]
    pub configs: Vec<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct PlanDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,

    /// Duration string parseable by humantime, e.g. "300s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PlanConfig {
    pub name: String,

    /// Path to the fuzzer configuration file. Opaque to fuzzlab; only the
    /// path is passed through.
    pub path: String,
}
