//! The workflow data model: workflow definitions, task steps, task specs,
//! and the traits a host uses to resolve `taskRef`/`workflowRef` names.
//!
//! Deserialization of these types from YAML/JSON is the host's job (see
//! `cmd::run` for the CLI's use of `serde_yaml`); the engine itself only
//! ever consumes already-parsed values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::transform::TransformOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Http,
    Transform,
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSpec {
    pub input: String,
    pub pipeline: Vec<TransformOp>,
}

/// A reusable definition referenced by a task step's `taskRef`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub http: Option<HttpSpec>,
    #[serde(default)]
    pub transform: Option<TransformSpec>,
    /// Default timeout for this task spec, e.g. `"30s"`. See `config::parse_duration`.
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachSpec {
    pub items: String,
    pub item_var: String,
    #[serde(default = "default_index_var")]
    pub index_var: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_concurrency: usize,
}

fn default_index_var() -> String {
    "index".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

fn default_initial_delay() -> String {
    "100ms".to_string()
}
fn default_max_delay() -> String {
    "30s".to_string()
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_retry_count() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_retry_count: default_max_retry_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,
    #[serde(default)]
    pub stale_ttl: Option<String>,
    #[serde(default)]
    pub bypass_when: Option<String>,
    #[serde(default)]
    pub cache_only_success: Option<bool>,
    #[serde(default)]
    pub cacheable_methods: Vec<String>,
}

fn default_cache_ttl() -> String {
    "5m".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_sampling_duration")]
    pub sampling_duration: String,
    #[serde(default = "default_break_duration")]
    pub break_duration: String,
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_sampling_duration() -> String {
    "60s".to_string()
}
fn default_break_duration() -> String {
    "30s".to_string()
}
fn default_half_open_requests() -> u32 {
    3
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            sampling_duration: default_sampling_duration(),
            break_duration: default_break_duration(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

/// Either a `taskRef` or a `workflowRef` — never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskRefKind {
    #[serde(rename = "taskRef")]
    Task(String),
    #[serde(rename = "workflowRef")]
    Workflow(String),
}

/// A node in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    #[serde(flatten)]
    pub target: TaskRefKind,
    #[serde(default)]
    pub input: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub switch: Option<SwitchSpec>,
    #[serde(default)]
    pub for_each: Option<ForEachSpec>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(rename = "match")]
    pub match_: String,
    pub task_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSpec {
    pub value: String,
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub input: Vec<InputParam>,
    pub tasks: Vec<TaskStep>,
    #[serde(default)]
    pub output: HashMap<String, String>,
}

/// External collaborator: resolves `taskRef` names to reusable task specs.
/// The core only ever performs lookups against this trait.
pub trait TaskCatalog: Send + Sync {
    fn get_task_spec(&self, task_ref: &str) -> Option<TaskSpec>;
}

/// External collaborator: resolves `workflowRef` strings (`name`,
/// `name@version`, `namespace/name`, `namespace/name@version`) to a
/// workflow definition, for C8.
pub trait WorkflowCatalog: Send + Sync {
    fn get_workflow(&self, reference: &str) -> Option<WorkflowDefinition>;
}

/// A simple in-memory catalog, the kind the CLI builds from a YAML file
/// containing sibling `tasks:`/`workflows:` maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    pub tasks: HashMap<String, TaskSpec>,
    pub workflows: HashMap<String, WorkflowDefinition>,
}

impl TaskCatalog for InMemoryCatalog {
    fn get_task_spec(&self, task_ref: &str) -> Option<TaskSpec> {
        self.tasks.get(task_ref).cloned()
    }
}

impl WorkflowCatalog for InMemoryCatalog {
    fn get_workflow(&self, reference: &str) -> Option<WorkflowDefinition> {
        self.workflows.get(reference).cloned()
    }
}
