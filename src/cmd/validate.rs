//! `flowgraph validate` — parse a manifest and build every workflow's
//! execution graph without running anything, reporting the parallel
//! grouping and any structural errors.
//!
//! Grounded on the teacher's `cmd/validate.rs` shape (parse, then report),
//! trimmed to this engine's graph-only validation — no schema/runtime
//! checks beyond what [`crate::graph::build_graph`] already performs.

use clap::Parser;
use console::style;
use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::workflow::{TaskSpec, WorkflowDefinition};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read manifest file '{}': {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse manifest YAML: {source}"))]
    Yaml { source: serde_yaml::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    tasks: HashMap<String, TaskSpec>,
    #[serde(default)]
    workflows: HashMap<String, WorkflowDefinition>,
}

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    pub manifest: PathBuf,

    #[arg(long)]
    pub verbose: bool,
}

pub async fn handle_validate(args: ValidateArgs) -> Result<()> {
    let contents = std::fs::read_to_string(&args.manifest).context(IoSnafu { path: args.manifest.clone() })?;
    let manifest: Manifest = serde_yaml::from_str(&contents).context(YamlSnafu)?;

    let mut any_invalid = false;
    for (name, workflow) in &manifest.workflows {
        match crate::graph::build_graph(workflow) {
            Ok((graph, _diagnostics)) => {
                println!("{} {}", style("\u{2713}").green(), style(name).bold());
                for (level, group) in graph.parallel_groups.iter().enumerate() {
                    println!("  level {level}: {}", group.join(", "));
                }
                for task in &workflow.tasks {
                    if let crate::workflow::TaskRefKind::Task(task_ref) = &task.target {
                        if !manifest.tasks.contains_key(task_ref) {
                            any_invalid = true;
                            println!("  {} task '{}' references unknown taskRef '{task_ref}'", style("\u{2717}").red(), task.id);
                        }
                    }
                }
            }
            Err(e) => {
                any_invalid = true;
                println!("{} {}: {e}", style("\u{2717}").red().bold(), style(name).bold());
            }
        }
    }

    if any_invalid {
        std::process::exit(1);
    }
    Ok(())
}
