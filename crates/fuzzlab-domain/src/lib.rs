//! Domain logic for fuzzlab.
//!
//! This crate is intentionally I/O-free: it does math and policy.
//! Descriptive summaries feed the report; Welch's t-test, Cohen's d, and the
//! directional improvement percentage feed the baseline-vs-treatment verdict.

use fuzzlab_types::{
    ComparisonResult, Direction, EffectSize, Metric, MetricsTable, Summary,
};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;

/// Two-sided significance level for the comparison verdict.
pub const ALPHA: f64 = 0.05;

#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("no samples to summarize")]
    NoSamples,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n - 1 denominator); 0 for fewer than two samples.
fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64
}

/// Linear-interpolation quantile over a sorted slice (the convention the
/// usual dataframe `describe` uses).
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = p * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let frac = pos - lo as f64;
    if lo + 1 >= n {
        sorted[n - 1]
    } else {
        sorted[lo] + frac * (sorted[lo + 1] - sorted[lo])
    }
}

/// Descriptive summary of a non-empty value set.
pub fn summarize(values: &[f64]) -> Result<Summary, DomainError> {
    if values.is_empty() {
        return Err(DomainError::NoSamples);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Ok(Summary {
        count: values.len(),
        mean: mean(values),
        std: sample_variance(values).sqrt(),
        min: sorted[0],
        q25: quantile_sorted(&sorted, 0.25),
        median: quantile_sorted(&sorted, 0.5),
        q75: quantile_sorted(&sorted, 0.75),
        max: sorted[sorted.len() - 1],
    })
}

/// Per-config descriptive summaries for the requested metrics, computed over
/// non-null values only. A (config, metric) pair with no values is omitted.
pub fn describe(
    table: &MetricsTable,
    metrics: &[Metric],
) -> BTreeMap<String, BTreeMap<Metric, Summary>> {
    let mut out: BTreeMap<String, BTreeMap<Metric, Summary>> = BTreeMap::new();

    for config in table.configs() {
        let mut per_metric = BTreeMap::new();
        for &metric in metrics {
            let values = table.values_for(config, metric);
            if let Ok(summary) = summarize(&values) {
                per_metric.insert(metric, summary);
            }
        }
        if !per_metric.is_empty() {
            out.insert(config.to_string(), per_metric);
        }
    }

    out
}

/// Welch's two-sample t-test (unequal variances), two-sided.
///
/// Returns `None` when the statistic is indeterminate: fewer than two
/// samples on either side, or zero variance in both groups. Callers must
/// surface that as "indeterminate", not as a verdict.
pub fn welch_t_test(baseline: &[f64], treatment: &[f64]) -> Option<(f64, f64)> {
    let n1 = baseline.len();
    let n2 = treatment.len();
    if n1 < 2 || n2 < 2 {
        return None;
    }

    let v1 = sample_variance(baseline);
    let v2 = sample_variance(treatment);
    let se1 = v1 / n1 as f64;
    let se2 = v2 / n2 as f64;
    let se = se1 + se2;
    if se <= 0.0 {
        return None;
    }

    let t = (mean(treatment) - mean(baseline)) / se.sqrt();

    // Welch-Satterthwaite degrees of freedom.
    let df = se.powi(2)
        / (se1.powi(2) / (n1 as f64 - 1.0) + se2.powi(2) / (n2 as f64 - 1.0));
    if !df.is_finite() || df <= 0.0 {
        return None;
    }

    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * dist.cdf(-t.abs());
    Some((t, p))
}

/// Cohen's d with pooled standard deviation. Defined as 0 when the pooled
/// standard deviation is 0 (identical constant groups) or undefined.
pub fn cohens_d(baseline: &[f64], treatment: &[f64]) -> f64 {
    let n1 = baseline.len() as f64;
    let n2 = treatment.len() as f64;
    if n1 + n2 < 3.0 {
        return 0.0;
    }

    let pooled_var = ((n1 - 1.0) * sample_variance(baseline)
        + (n2 - 1.0) * sample_variance(treatment))
        / (n1 + n2 - 2.0);
    let pooled_std = pooled_var.sqrt();

    if pooled_std > 0.0 {
        (mean(treatment) - mean(baseline)) / pooled_std
    } else {
        0.0
    }
}

/// Signed percentage improvement of the treatment over the baseline,
/// oriented so that positive always means "treatment did better".
///
/// `None` when the baseline mean is 0 (the ratio is undefined); absent, not
/// NaN, so the result stays serializable.
pub fn improvement_pct(
    baseline_mean: f64,
    treatment_mean: f64,
    direction: Direction,
) -> Option<f64> {
    if baseline_mean == 0.0 {
        return None;
    }
    Some(match direction {
        Direction::Lower => (baseline_mean - treatment_mean) / baseline_mean * 100.0,
        Direction::Higher => (treatment_mean - baseline_mean) / baseline_mean * 100.0,
    })
}

/// Conventional significance stars; indeterminate p-values get "ns".
pub fn significance_stars(p_value: Option<f64>) -> &'static str {
    match p_value {
        Some(p) if p < 0.001 => "***",
        Some(p) if p < 0.01 => "**",
        Some(p) if p < ALPHA => "*",
        _ => "ns",
    }
}

/// Compare a baseline configuration against a treatment configuration for
/// each requested metric, under an explicit per-metric direction policy.
///
/// A metric with an empty value set on either side is skipped (no result
/// emitted); other metrics are still computed.
pub fn compare_configs(
    table: &MetricsTable,
    baseline_config: &str,
    treatment_config: &str,
    directions: &BTreeMap<Metric, Direction>,
) -> BTreeMap<Metric, ComparisonResult> {
    let mut results = BTreeMap::new();

    for (&metric, &direction) in directions {
        let baseline = table.values_for(baseline_config, metric);
        let treatment = table.values_for(treatment_config, metric);
        if baseline.is_empty() || treatment.is_empty() {
            continue;
        }

        let baseline_mean = mean(&baseline);
        let treatment_mean = mean(&treatment);

        let test = welch_t_test(&baseline, &treatment);
        let (t_statistic, p_value) = match test {
            Some((t, p)) => (Some(t), Some(p)),
            None => (None, None),
        };

        let d = cohens_d(&baseline, &treatment);

        results.insert(
            metric,
            ComparisonResult {
                baseline_mean,
                treatment_mean,
                improvement_pct: improvement_pct(baseline_mean, treatment_mean, direction),
                t_statistic,
                p_value,
                cohens_d: d,
                significant: p_value.is_some_and(|p| p < ALPHA),
                effect_size: EffectSize::from_d(d),
            },
        );
    }

    results
}
