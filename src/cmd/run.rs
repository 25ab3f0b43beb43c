//! `flowgraph run` — load a manifest (task catalog + workflow catalog) from
//! YAML and execute one workflow from it.
//!
//! Grounded on the teacher's `cmd/run.rs`: same `clap::Parser` args shape
//! and snafu error enum with `From` impls for the I/O/YAML boundary,
//! trimmed from its durable-engine/persistence/progress-bar plumbing down
//! to a single-shot `Engine::execute` call plus `output.rs` formatting.

use clap::Parser;
use serde::Deserialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::InMemoryCache;
use crate::config::EngineConfig;
use crate::executor::DefaultExecutor;
use crate::output;
use crate::scheduler::{Engine, ExecuteOptions};
use crate::workflow::{InMemoryCatalog, TaskSpec, WorkflowDefinition};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read manifest file '{}': {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse manifest YAML: {source}"))]
    Yaml { source: serde_yaml::Error },

    #[snafu(display("failed to parse input JSON: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("workflow '{name}' not found in manifest"))]
    UnknownWorkflow { name: String },

    #[snafu(display("workflow graph is invalid: {source}"))]
    Graph { source: crate::graph::Error },
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
pub struct RunArgs {
    /// Path to the manifest YAML file (`tasks:` and `workflows:` maps).
    pub manifest: PathBuf,

    /// Which workflow in the manifest to run.
    #[arg(long)]
    pub workflow: String,

    /// JSON-encoded workflow input.
    #[arg(long, default_value = "{}")]
    pub input: String,

    /// Resolve templates and dispatch nothing; report the would-be plan.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub verbose: bool,
}

pub async fn handle_run(args: RunArgs) -> Result<()> {
    let contents = std::fs::read_to_string(&args.manifest).context(IoSnafu { path: args.manifest.clone() })?;
    let manifest: Manifest = serde_yaml::from_str(&contents).context(YamlSnafu)?;
    let input: serde_json::Value = serde_json::from_str(&args.input).context(JsonSnafu)?;

    let workflow = manifest
        .workflows
        .get(&args.workflow)
        .cloned()
        .ok_or_else(|| Error::UnknownWorkflow { name: args.workflow.clone() })?;

    let catalog = InMemoryCatalog {
        tasks: manifest.tasks,
        workflows: manifest.workflows,
    };

    let config = EngineConfig::load().unwrap_or_default();
    let engine = Engine::new(Arc::new(DefaultExecutor::new()), Arc::new(InMemoryCache::new()), config.clone());

    let (_handle, mut options) = ExecuteOptions::new(config.max_subworkflow_depth);
    options.dry_run = args.dry_run;

    output::format_workflow_start(&workflow.name);
    let result = engine
        .execute(&workflow, &catalog, &catalog, input, options)
        .await
        .context(GraphSnafu)?;

    for task in &result.tasks {
        output::format_task_result(task);
    }
    output::format_workflow_result(&result);

    Ok(())
}
