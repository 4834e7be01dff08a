use crate::domain::models::{JsonOut, Severity, ValidationReport};
use serde::Serialize;

/// Prints one result whose `ok` flag comes from the caller.
pub fn print_report<T: Serialize>(
    json: bool,
    ok: bool,
    data: T,
    summary: impl Fn(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&JsonOut { ok, data })?
        );
    } else {
        println!("{}", summary(&data));
    }
    Ok(())
}

/// One line per finding followed by a totals line.
pub fn render_findings(report: &ValidationReport) -> String {
    let mut lines: Vec<String> = report
        .findings
        .iter()
        .map(|f| {
            let severity = match f.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            format!("[{severity}] {} {}: {}", f.rule_id, f.path, f.message)
        })
        .collect();
    lines.push(format!(
        "{} error(s), {} warning(s)",
        report.error_count(),
        report.warning_count()
    ));
    lines.join("\n")
}
