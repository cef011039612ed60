//! Output scraping for fuzzlab.
//!
//! The fuzzer reports its counters as free text on stdout/stderr. Extraction
//! is a table of (pattern, field) rules with a default of 0 on non-match, so
//! new counters can be added without touching control flow. Extraction never
//! fails past this boundary: a malformed number logs a warning and leaves the
//! field at its default.

use fuzzlab_types::MetricsRecord;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

/// Literal marker the fuzzer prints once per falsified property.
const FAILURE_MARKER: &str = "failed!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CountField {
    Coverage,
    TotalCalls,
    CorpusSize,
}

impl CountField {
    fn name(self) -> &'static str {
        match self {
            CountField::Coverage => "coverage",
            CountField::TotalCalls => "total_calls",
            CountField::CorpusSize => "corpus_size",
        }
    }
}

struct CaptureRule {
    field: CountField,
    pattern: &'static str,
}

const RULES: &[CaptureRule] = &[
    CaptureRule {
        field: CountField::Coverage,
        pattern: r"Unique instructions: (\d+)",
    },
    CaptureRule {
        field: CountField::TotalCalls,
        pattern: r"Total calls: (\d+)",
    },
    CaptureRule {
        field: CountField::CorpusSize,
        pattern: r"Corpus size: (\d+)",
    },
];

static COMPILED_RULES: LazyLock<Vec<(CountField, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            let re = Regex::new(rule.pattern).expect("static capture pattern compiles");
            (rule.field, re)
        })
        .collect()
});

/// Raw counters scraped from one execution's combined output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawMetrics {
    pub bugs_found: u64,
    pub coverage: u64,
    pub total_calls: u64,
    pub corpus_size: u64,
}

/// Scrape raw counters out of captured output text.
///
/// Each rule is independent and tolerant of absence; a missing pattern yields
/// 0 for its field.
pub fn extract_raw(output: &str) -> RawMetrics {
    let mut raw = RawMetrics {
        bugs_found: output.matches(FAILURE_MARKER).count() as u64,
        ..RawMetrics::default()
    };

    for (field, re) in COMPILED_RULES.iter() {
        let value = match re.captures(output) {
            Some(caps) => match caps[1].parse::<u64>() {
                Ok(v) => v,
                Err(err) => {
                    warn!(field = field.name(), %err, "unparseable metric value, defaulting to 0");
                    0
                }
            },
            None => 0,
        };

        match field {
            CountField::Coverage => raw.coverage = value,
            CountField::TotalCalls => raw.total_calls = value,
            CountField::CorpusSize => raw.corpus_size = value,
        }
    }

    raw
}

/// Rate and efficiency figures derived from raw counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedMetrics {
    pub bugs_per_second: Option<f64>,
    pub coverage_per_second: Option<f64>,
    pub calls_per_second: Option<f64>,
    pub coverage_efficiency: f64,
}

/// Compute derived metrics. Rates are suppressed (not infinity, not an
/// error) when `execution_time` is not positive; efficiency is always
/// defined, 0 when there were no calls.
pub fn derive_metrics(raw: &RawMetrics, execution_time: f64) -> DerivedMetrics {
    let rates = execution_time > 0.0;
    DerivedMetrics {
        bugs_per_second: rates.then(|| raw.bugs_found as f64 / execution_time),
        coverage_per_second: rates.then(|| raw.coverage as f64 / execution_time),
        calls_per_second: rates.then(|| raw.total_calls as f64 / execution_time),
        coverage_efficiency: if raw.total_calls > 0 {
            raw.coverage as f64 / raw.total_calls as f64
        } else {
            0.0
        },
    }
}

/// Build a full record from one execution's captured streams.
///
/// stdout and stderr are scraped as one combined text, matching the order
/// they are persisted in the log artifact.
pub fn build_record(
    config: impl Into<String>,
    iteration: u32,
    execution_time: f64,
    stdout: &str,
    stderr: &str,
) -> MetricsRecord {
    let combined = format!("{stdout}{stderr}");
    let raw = extract_raw(&combined);
    let derived = derive_metrics(&raw, execution_time);

    MetricsRecord {
        config: config.into(),
        iteration,
        execution_time,
        timed_out: false,
        bugs_found: raw.bugs_found,
        coverage: raw.coverage,
        total_calls: raw.total_calls,
        corpus_size: raw.corpus_size,
        bugs_per_second: derived.bugs_per_second,
        coverage_per_second: derived.coverage_per_second,
        calls_per_second: derived.calls_per_second,
        coverage_efficiency: derived.coverage_efficiency,
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// bugs_found equals the number of embedded markers regardless of
        /// surrounding noise (as long as the noise does not form markers).
        #[test]
        fn bug_count_matches_marker_count(
            chunks in proptest::collection::vec("[a-zA-Z0-9 \n]{0,20}", 0..8)
        ) {
            let markers = chunks.len().saturating_sub(1) as u64;
            let text = chunks.join(FAILURE_MARKER);
            prop_assert_eq!(extract_raw(&text).bugs_found, markers);
        }

        /// Extraction recovers exactly the values it was shown.
        #[test]
        fn round_trips_printed_counters(
            coverage in 0u64..1_000_000,
            calls in 0u64..1_000_000,
            corpus in 0u64..100_000,
        ) {
            let text = format!(
                "Unique instructions: {coverage}\nTotal calls: {calls}\nCorpus size: {corpus}\n"
            );
            let raw = extract_raw(&text);
            prop_assert_eq!(raw.coverage, coverage);
            prop_assert_eq!(raw.total_calls, calls);
            prop_assert_eq!(raw.corpus_size, corpus);
        }

        /// Extraction never panics on arbitrary text and is idempotent.
        #[test]
        fn total_and_idempotent(text in "\\PC{0,200}") {
            let first = extract_raw(&text);
            let second = extract_raw(&text);
            prop_assert_eq!(first, second);
        }
    }
}
