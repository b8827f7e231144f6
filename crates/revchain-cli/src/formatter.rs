//! Output formatters for command results.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use revchain_core::migration::{
    HistoryEntry, MigrationPlan, RepairReport, RunReport, StatusReport,
};
use serde_json::json;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format a resolved plan, with rendered SQL per revision when given.
    fn format_plan(&self, plan: &MigrationPlan, sql: Option<&[Vec<String>]>) -> String;

    /// Format the outcome of an upgrade or downgrade.
    fn format_run(&self, report: &RunReport) -> String;

    /// Format migration status.
    fn format_status(&self, status: &StatusReport) -> String;

    /// Format the apply history.
    fn format_history(&self, history: &[HistoryEntry]) -> String;

    /// Format a list of revision ids under a heading.
    fn format_revisions(&self, heading: &str, revisions: &[String]) -> String;

    /// Format the outcome of a repair.
    fn format_repair(&self, report: &RepairReport) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_plan(&self, plan: &MigrationPlan, sql: Option<&[Vec<String>]>) -> String {
        if plan.is_empty() {
            return format!("Nothing to do: already at {} ({})", plan.target, plan.from);
        }

        let mut output = String::new();
        if let Some(sql) = sql {
            for (step, statements) in plan.steps.iter().zip(sql) {
                output.push_str(&format!("-- {} {}: {}\n", step.direction, step.revision, step.message));
                for statement in statements {
                    output.push_str(statement);
                    output.push_str(";\n");
                }
                output.push('\n');
            }
        } else {
            let mut table = Table::new();
            table.set_header(vec!["#", "Revision", "Phase", "Ops", "One-way", "Message"]);
            for (i, step) in plan.steps.iter().enumerate() {
                table.add_row(vec![
                    Cell::new(i + 1),
                    Cell::new(&step.revision),
                    Cell::new(step.phase.map(|p| p.to_string()).unwrap_or_default()),
                    Cell::new(step.operations),
                    Cell::new(step.one_way.as_deref().unwrap_or("")),
                    Cell::new(&step.message),
                ]);
            }
            output.push_str(&format!(
                "{} from {} to {}\n{}\n",
                plan.direction, plan.from, plan.target, table
            ));
        }

        for warning in &plan.warnings {
            output.push_str(&format!("warning: {}\n", warning));
        }
        output.trim_end().to_string()
    }

    fn format_run(&self, report: &RunReport) -> String {
        if report.is_noop() {
            return format!("Already at {} ({})", report.plan.target, report.state);
        }

        let mut table = Table::new();
        table.set_header(vec!["Revision", "Direction", "Applied", "Skipped", "Rows", "Time"]);
        for applied in &report.applied {
            table.add_row(vec![
                Cell::new(&applied.revision),
                Cell::new(applied.direction),
                Cell::new(applied.applied),
                Cell::new(applied.skipped),
                Cell::new(applied.rows),
                Cell::new(format_duration(applied.duration_micros)),
            ]);
        }

        let verb = if report.dry_run { "Would move" } else { "Moved" };
        format!(
            "{}\n{} from {} to {} ({} revision(s))",
            table,
            verb,
            report.plan.from,
            report.state,
            report.applied.len()
        )
    }

    fn format_status(&self, status: &StatusReport) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Current".to_string(), status.state.to_string()]);
        table.add_row(vec!["Heads".to_string(), status.heads.join(", ")]);
        table.add_row(vec!["Pending".to_string(), status.pending.len().to_string()]);
        table.add_row(vec![
            "Interrupted".to_string(),
            status
                .journal
                .as_ref()
                .map(|j| {
                    format!(
                        "{} {} ({}/{} steps)",
                        j.direction,
                        j.revision,
                        j.finished_steps(),
                        j.steps.len()
                    )
                })
                .unwrap_or_else(|| "no".to_string()),
        ]);
        table.add_row(vec![
            "Lock".to_string(),
            status
                .lock
                .as_ref()
                .map(|l| format!("{} (pid {}, since {})", l.owner, l.pid, format_timestamp(l.acquired_at)))
                .unwrap_or_else(|| "free".to_string()),
        ]);
        if !status.modified.is_empty() {
            table.add_row(vec!["Modified".to_string(), status.modified.join(", ")]);
        }

        let mut output = table.to_string();
        if !status.pending.is_empty() {
            output.push_str(&format!("\npending: {}", status.pending.join(", ")));
        }
        output
    }

    fn format_history(&self, history: &[HistoryEntry]) -> String {
        if history.is_empty() {
            return "No history".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Finished", "Revision", "Direction", "Ops", "Skipped", "Time"]);
        for entry in history {
            table.add_row(vec![
                Cell::new(format_timestamp(entry.finished_at)),
                Cell::new(&entry.revision),
                Cell::new(entry.direction),
                Cell::new(entry.operations),
                Cell::new(entry.skipped),
                Cell::new(format_duration(entry.duration_micros)),
            ]);
        }
        format!("{}\n{} entries", table, history.len())
    }

    fn format_revisions(&self, heading: &str, revisions: &[String]) -> String {
        let mut table = Table::new();
        table.set_header(vec![heading]);
        for revision in revisions {
            table.add_row(vec![revision]);
        }
        table.to_string()
    }

    fn format_repair(&self, report: &RepairReport) -> String {
        let mut output = match &report.resumed {
            Some(resumed) => format!(
                "Resumed {} of {}: {} applied, {} skipped",
                resumed.direction, resumed.revision, resumed.applied, resumed.skipped
            ),
            None => "No interrupted run".to_string(),
        };
        output.push_str(&format!("\nCurrent: {}", report.state));

        if report.dangling_foreign_keys.is_empty() {
            output.push_str("\nNo foreign key references a backup table");
        } else {
            let mut table = Table::new();
            table.set_header(vec!["Constraint", "Table", "References"]);
            for fk in &report.dangling_foreign_keys {
                table.add_row(vec![&fk.name, &fk.table, &fk.ref_table]);
            }
            output.push_str(&format!("\n{}", table));
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_plan(&self, plan: &MigrationPlan, sql: Option<&[Vec<String>]>) -> String {
        let steps: Vec<serde_json::Value> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mut value = json!({
                    "revision": step.revision,
                    "direction": step.direction.to_string(),
                    "message": step.message,
                    "phase": step.phase.map(|p| p.to_string()),
                    "refactor": step.refactor,
                    "operations": step.operations,
                    "one_way": step.one_way,
                });
                if let Some(statements) = sql.and_then(|s| s.get(i)) {
                    value["sql"] = json!(statements);
                }
                value
            })
            .collect();

        pretty(&json!({
            "direction": plan.direction.to_string(),
            "target": plan.target.to_string(),
            "from": plan.from.heads(),
            "steps": steps,
            "warnings": plan.warnings,
        }))
    }

    fn format_run(&self, report: &RunReport) -> String {
        let applied: Vec<serde_json::Value> = report
            .applied
            .iter()
            .map(|a| {
                json!({
                    "revision": a.revision,
                    "direction": a.direction.to_string(),
                    "operations": a.operations,
                    "applied": a.applied,
                    "skipped": a.skipped,
                    "rows": a.rows,
                    "duration_micros": a.duration_micros,
                })
            })
            .collect();

        pretty(&json!({
            "from": report.plan.from.heads(),
            "to": report.state.heads(),
            "dry_run": report.dry_run,
            "applied": applied,
            "warnings": report.plan.warnings,
        }))
    }

    fn format_status(&self, status: &StatusReport) -> String {
        pretty(&json!({
            "current": status.state.heads(),
            "heads": status.heads,
            "pending": status.pending,
            "interrupted": status.journal.as_ref().map(|j| json!({
                "revision": j.revision,
                "direction": j.direction.to_string(),
                "finished_steps": j.finished_steps(),
                "steps": j.steps.len(),
            })),
            "lock": status.lock.as_ref().map(|l| json!({
                "owner": l.owner,
                "pid": l.pid,
                "acquired_at": format_timestamp(l.acquired_at),
            })),
            "modified": status.modified,
        }))
    }

    fn format_history(&self, history: &[HistoryEntry]) -> String {
        let entries: Vec<serde_json::Value> = history
            .iter()
            .map(|e| {
                json!({
                    "revision": e.revision,
                    "direction": e.direction.to_string(),
                    "finished_at": format_timestamp(e.finished_at),
                    "duration_micros": e.duration_micros,
                    "operations": e.operations,
                    "skipped": e.skipped,
                })
            })
            .collect();
        pretty(&json!(entries))
    }

    fn format_revisions(&self, heading: &str, revisions: &[String]) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert(heading.to_lowercase(), json!(revisions));
        pretty(&serde_json::Value::Object(obj))
    }

    fn format_repair(&self, report: &RepairReport) -> String {
        pretty(&json!({
            "resumed": report.resumed.as_ref().map(|r| json!({
                "revision": r.revision,
                "direction": r.direction.to_string(),
                "applied": r.applied,
                "skipped": r.skipped,
            })),
            "current": report.state.heads(),
            "dangling_foreign_keys": report
                .dangling_foreign_keys
                .iter()
                .map(|fk| json!({
                    "name": fk.name,
                    "table": fk.table,
                    "references": fk.ref_table,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    fn format_message(&self, message: &str) -> String {
        json!({ "message": message }).to_string()
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

/// Format microseconds since the epoch as RFC 3339.
fn format_timestamp(micros: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| micros.to_string())
}

fn format_duration(micros: u64) -> String {
    if micros >= 1_000_000 {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    } else if micros >= 1_000 {
        format!("{:.1}ms", micros as f64 / 1_000.0)
    } else {
        format!("{}µs", micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(12), "12µs");
        assert_eq!(format_duration(2_500), "2.5ms");
        assert_eq!(format_duration(3_000_000), "3.00s");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_json_revisions() {
        let output = JsonFormatter.format_revisions("Heads", &["a".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["heads"], json!(["a"]));
    }
}
