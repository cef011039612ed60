//! CSV export of the metrics table.
//!
//! One row per (config, iteration) observation, suppressed rates as empty
//! cells. The column set is the stable contract for downstream spreadsheet
//! and plotting consumers.

use fuzzlab_types::MetricsTable;

pub const CSV_HEADER: &str = "config,iteration,execution_time,timed_out,bugs_found,coverage,total_calls,corpus_size,bugs_per_second,coverage_per_second,calls_per_second,coverage_efficiency";

/// Render the whole table as RFC 4180 CSV, header row included.
pub fn table_to_csv(table: &MetricsTable) -> String {
    let mut output = String::new();
    output.push_str(CSV_HEADER);
    output.push('\n');

    for record in table.records() {
        output.push_str(&csv_escape(&record.config));
        output.push(',');
        output.push_str(&record.iteration.to_string());
        output.push(',');
        output.push_str(&format!("{:.6}", record.execution_time));
        output.push(',');
        output.push_str(if record.timed_out { "true" } else { "false" });
        output.push(',');
        output.push_str(&record.bugs_found.to_string());
        output.push(',');
        output.push_str(&record.coverage.to_string());
        output.push(',');
        output.push_str(&record.total_calls.to_string());
        output.push(',');
        output.push_str(&record.corpus_size.to_string());
        output.push(',');
        output.push_str(&opt_cell(record.bugs_per_second));
        output.push(',');
        output.push_str(&opt_cell(record.coverage_per_second));
        output.push(',');
        output.push_str(&opt_cell(record.calls_per_second));
        output.push(',');
        output.push_str(&format!("{:.6}", record.coverage_efficiency));
        output.push('\n');
    }

    output
}

/// Absent rates export as empty cells, not as 0 or NaN.
fn opt_cell(v: Option<f64>) -> String {
    v.map_or(String::new(), |v| format!("{:.6}", v))
}

/// Escape a string for CSV per RFC 4180.
/// If the string contains comma, double quote, or newline, wrap in quotes and escape quotes.
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
