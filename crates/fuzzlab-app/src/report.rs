//! Markdown report rendering.
//!
//! The report is the human-facing end of the pipeline: per-configuration
//! descriptive statistics, the success-rate view, and the significance table
//! for the baseline-vs-treatment comparison.

use fuzzlab_domain::{significance_stars, summarize};
use fuzzlab_types::{CompareReceipt, Direction, Metric, MetricsTable, Summary};

/// Metrics shown in the per-configuration overview section.
const OVERVIEW_METRICS: [Metric; 3] = [Metric::ExecutionTime, Metric::BugsFound, Metric::Coverage];

/// Render the full experiment report.
///
/// `generated_at` is an RFC 3339 timestamp supplied by the caller's clock.
pub fn render_markdown(
    table: &MetricsTable,
    compare: &CompareReceipt,
    generated_at: &str,
) -> String {
    let mut out = String::new();

    out.push_str("# Fuzzing Configuration Comparison Report\n\n");
    out.push_str(&format!("Generated: {generated_at}\n\n"));

    out.push_str("## Dataset\n\n");
    out.push_str(&format!("Total observations: {}\n\n", table.len()));
    out.push_str("| configuration | iterations | timeouts | success rate |\n");
    out.push_str("|---|---:|---:|---:|\n");
    for config in table.configs() {
        let rows = table.records().iter().filter(|r| r.config == config);
        let n = rows.clone().count();
        let timeouts = rows.clone().filter(|r| r.timed_out).count();
        out.push_str(&format!(
            "| `{config}` | {n} | {timeouts} | {} |\n",
            format_pct(success_rate(table, config)),
        ));
    }
    out.push('\n');

    out.push_str("## Per-configuration results\n\n");
    for config in table.configs() {
        out.push_str(&format!("### `{config}`\n\n"));
        out.push_str("| metric | mean | std | min | max |\n");
        out.push_str("|---|---:|---:|---:|---:|\n");
        for metric in OVERVIEW_METRICS {
            let values = table.values_for(config, metric);
            match summarize(&values) {
                Ok(s) => out.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    metric.name(),
                    format_value(metric, s.mean),
                    format_value(metric, s.std),
                    format_value(metric, s.min),
                    format_value(metric, s.max),
                )),
                Err(_) => out.push_str(&format!("| {} | - | - | - | - |\n", metric.name())),
            }
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "## Statistical comparison: `{}` vs `{}`\n\n",
        compare.baseline_config, compare.treatment_config
    ));
    out.push_str(
        "Welch's t-test, two-sided, alpha 0.05. Positive improvement always means the \
         treatment did better for that metric's direction.\n\n",
    );
    out.push_str(
        "| metric | baseline mean | treatment mean | improvement | p-value | sig | Cohen's d | effect |\n",
    );
    out.push_str("|---|---:|---:|---:|---:|:---:|---:|---|\n");

    for (metric, result) in &compare.results {
        let direction = compare
            .directions
            .get(metric)
            .copied()
            .unwrap_or_else(|| metric.default_direction());
        out.push_str(&format!(
            "| {name} ({dir}) | {b} | {t} | {imp} | {p} | {stars} | {d:.3} | {effect} |\n",
            name = metric.name(),
            dir = direction_label(direction),
            b = format_value(*metric, result.baseline_mean),
            t = format_value(*metric, result.treatment_mean),
            imp = format_improvement(result.improvement_pct),
            p = format_p(result.p_value),
            stars = significance_stars(result.p_value),
            d = result.cohens_d,
            effect = result.effect_size.label(),
        ));
    }
    out.push('\n');

    let significant: Vec<&str> = compare
        .results
        .iter()
        .filter(|(_, r)| r.significant)
        .map(|(m, _)| m.name())
        .collect();
    if significant.is_empty() {
        out.push_str("No metric shows a statistically significant difference.\n");
    } else {
        out.push_str(&format!(
            "Significant differences (p < 0.05): {}.\n",
            significant.join(", ")
        ));
    }

    out
}

/// Plain-text descriptive table, one block per configuration.
pub fn render_describe(
    summaries: &std::collections::BTreeMap<String, std::collections::BTreeMap<Metric, Summary>>,
) -> String {
    let mut out = String::new();

    for (config, per_metric) in summaries {
        out.push_str(&format!("{config}\n"));
        out.push_str(&format!(
            "  {:<22} {:>5} {:>12} {:>12} {:>12} {:>12}\n",
            "metric", "n", "mean", "std", "median", "max"
        ));
        for (metric, s) in per_metric {
            out.push_str(&format!(
                "  {:<22} {:>5} {:>12.4} {:>12.4} {:>12.4} {:>12.4}\n",
                metric.name(),
                s.count,
                s.mean,
                s.std,
                s.median,
                s.max
            ));
        }
        out.push('\n');
    }

    out
}

/// Share of a configuration's iterations that found at least one bug.
pub fn success_rate(table: &MetricsTable, config: &str) -> f64 {
    let rows: Vec<_> = table
        .records()
        .iter()
        .filter(|r| r.config == config)
        .collect();
    if rows.is_empty() {
        return 0.0;
    }
    let hits = rows.iter().filter(|r| r.bugs_found > 0).count();
    hits as f64 / rows.len() as f64
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Lower => "lower is better",
        Direction::Higher => "higher is better",
    }
}

fn format_value(metric: Metric, v: f64) -> String {
    match metric {
        Metric::BugsFound | Metric::Coverage | Metric::TotalCalls | Metric::CorpusSize => {
            format!("{:.1}", v)
        }
        Metric::ExecutionTime => format!("{:.2}s", v),
        _ => format!("{:.4}", v),
    }
}

fn format_improvement(pct: Option<f64>) -> String {
    match pct {
        Some(pct) => {
            let sign = if pct > 0.0 { "+" } else { "" };
            format!("{sign}{pct:.2}%")
        }
        None => "n/a".to_string(),
    }
}

fn format_p(p: Option<f64>) -> String {
    match p {
        Some(p) if p < 0.0001 => "<0.0001".to_string(),
        Some(p) => format!("{:.4}", p),
        None => "indeterminate".to_string(),
    }
}

fn format_pct(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}
