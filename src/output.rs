//! Pretty console output for workflow execution, grounded directly on the
//! teacher's `output.rs`: the same `console::style` coloring and banner
//! shape, trimmed from its task-language-specific (stdout/stderr/exitCode)
//! formatting down to this engine's `taskRef`/`workflowRef` result shape.

use console::style;
use serde_json::Value;

use crate::scheduler::{TaskExecutionResult, TaskStatus, WorkflowExecutionResult, WorkflowStatus};

pub fn format_workflow_start(workflow_name: &str) {
    println!("\n{}", "=".repeat(80));
    println!("{} {} {}", style("\u{25B6}").cyan().bold(), style("Workflow:").bold(), style(workflow_name).cyan().bold());
    println!("{}", "-".repeat(80));
}

pub fn format_task_result(result: &TaskExecutionResult) {
    match result.status {
        TaskStatus::Completed => {
            let cache_note = if result.cache_hit { " (cache hit)" } else { "" };
            println!(
                "  {} {}{}",
                style("\u{2713}").green(),
                style(format!("'{}' completed in {}ms", result.task_id, result.duration_ms)).green(),
                style(cache_note).yellow(),
            );
        }
        TaskStatus::Skipped => {
            println!("  {} {}", style("\u{21B4}").yellow(), style(format!("'{}' skipped", result.task_id)).yellow());
        }
        TaskStatus::Failed => {
            println!("  {} {}", style("\u{2717}").red().bold(), style(format!("'{}' failed", result.task_id)).red().bold());
            if let Some(error) = &result.error {
                println!("    {} {}", style("Error:").red(), style(&error.message).red());
                println!("    {} {}", style("Suggestion:").dim(), style(&error.suggestion).dim());
            }
        }
    }
}

pub fn format_workflow_result(result: &WorkflowExecutionResult) {
    println!("{}", "-".repeat(80));
    match result.status {
        WorkflowStatus::Completed => println!("{}", style("Workflow completed").green().bold()),
        WorkflowStatus::Failed => println!("{}", style("Workflow failed").red().bold()),
        WorkflowStatus::Cancelled => println!("{}", style("Workflow cancelled").yellow().bold()),
    }
    println!(
        "  {} {} tasks, {} cache hits, {} retries, {}ms total",
        style("Cost:").dim(),
        result.cost.task_count,
        result.cost.cache_hits,
        result.cost.total_retries,
        result.cost.total_duration_ms,
    );
    if matches!(result.status, WorkflowStatus::Completed) {
        println!("{}", style("Output").bold());
        println!("{}", indent_json(&result.output, 2));
    }
    println!("{}", "=".repeat(80));
}

fn indent_json(value: &Value, indent: usize) -> String {
    let json_str = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    let indent_str = " ".repeat(indent);
    json_str.lines().map(|line| format!("{indent_str}{line}")).collect::<Vec<_>>().join("\n")
}
