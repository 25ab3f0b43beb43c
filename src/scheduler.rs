//! C7 — the scheduler: the centerpiece dynamic-readiness concurrent
//! executor. Replaces the teacher's `durableengine.rs::run_instance` single
//! linear walk with a loop that, each round, runs every currently-ready
//! task concurrently via `futures::future::join_all`, applies their
//! outputs to a shared context, and recomputes readiness — so a task
//! becomes eligible the moment its dependencies are satisfied rather than
//! waiting for a whole fixed level to finish.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::cache::{self, CacheEntry, CacheProvider};
use crate::circuit_breaker::CircuitBreaker;
use crate::condition;
use crate::context::{TaskOutputEntry, TemplateContext};
use crate::errors::{ErrorInfo, ErrorKind};
use crate::executor::Executor;
use crate::graph::{self, ExecutionGraph};
use crate::retry;
use crate::subworkflow::{self, CallStack};
use crate::template;
use crate::workflow::{TaskCatalog, TaskRefKind, TaskSpec, TaskStep, WorkflowCatalog, WorkflowDefinition};
use crate::{cancellation, config, foreach};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub retry_count: u32,
    pub cache_hit: bool,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluated_expression: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationCost {
    pub total_duration_ms: i64,
    pub task_count: usize,
    pub cache_hits: usize,
    pub total_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecutionResult {
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub output: serde_json::Value,
    pub tasks: Vec<TaskExecutionResult>,
    pub cost: OrchestrationCost,
}

/// Per-call execution parameters, threaded through sub-workflow recursion.
pub struct ExecuteOptions {
    pub cancellation: cancellation::CancellationToken,
    pub dry_run: bool,
    pub call_stack: CallStack,
}

impl ExecuteOptions {
    #[must_use]
    pub fn new(max_subworkflow_depth: u32) -> (cancellation::CancellationHandle, Self) {
        let (handle, token) = cancellation::pair();
        (
            handle,
            Self {
                cancellation: token,
                dry_run: false,
                call_stack: CallStack::new(max_subworkflow_depth),
            },
        )
    }
}

/// The orchestration engine: a pluggable [`Executor`] plus the cache and
/// circuit-breaker state every task execution shares.
pub struct Engine<E: Executor> {
    executor: Arc<E>,
    cache: Arc<dyn CacheProvider>,
    config: config::EngineConfig,
    circuit_breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl<E: Executor + 'static> Engine<E> {
    #[must_use]
    pub fn new(executor: Arc<E>, cache: Arc<dyn CacheProvider>, config: config::EngineConfig) -> Self {
        Self {
            executor,
            cache,
            config,
            circuit_breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Step override, else task spec default, else the engine-wide default
    /// (spec.md §4.4/§7).
    fn resolve_timeout(&self, step_timeout: Option<&str>, spec_timeout: Option<&str>) -> Duration {
        step_timeout
            .or(spec_timeout)
            .and_then(|s| config::parse_duration(s).ok())
            .or_else(|| config::parse_duration(&self.config.default_task_timeout).ok())
            .unwrap_or(Duration::from_secs(30))
    }

    async fn circuit_breaker_for(&self, task_id: &str, spec: &crate::workflow::CircuitBreakerSpec) -> Arc<CircuitBreaker> {
        let mut breakers = self.circuit_breakers.lock().await;
        breakers
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(spec.clone())))
            .clone()
    }

    /// Execute a workflow definition to completion.
    ///
    /// # Errors
    /// Returns [`graph::Error`] if the workflow's task graph fails to
    /// validate (duplicate ids, unknown dependencies, cycles). Individual
    /// task failures are never propagated as an `Err` here — they are
    /// captured per-task in the returned [`WorkflowExecutionResult`].
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        task_catalog: &dyn TaskCatalog,
        workflow_catalog: &dyn WorkflowCatalog,
        input: serde_json::Value,
        options: ExecuteOptions,
    ) -> graph::Result<WorkflowExecutionResult> {
        let started_at = chrono::Utc::now();
        let (exec_graph, _diagnostics) = graph::build_graph(workflow)?;

        // Seed the call stack with this workflow's own name on entry, so a
        // cycle detected several `workflowRef` hops down reports the full
        // path starting from the workflow the caller actually ran (§8.6).
        // Recursive calls from `run_subworkflow` already carry a non-empty
        // stack, so this only fires once, at the true entry point.
        let call_stack = if options.call_stack.depth() == 0 {
            options.call_stack.push(&workflow.name).unwrap_or_else(|_| options.call_stack.clone())
        } else {
            options.call_stack.clone()
        };

        let mut ctx = TemplateContext::new(input);
        let mut done: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, TaskExecutionResult> = HashMap::new();
        let mut pending: HashSet<String> = exec_graph.task_ids().into_iter().collect();

        while !pending.is_empty() {
            if options.cancellation.is_cancelled() {
                break;
            }

            let ready = self.ready_tasks(&exec_graph, &pending, &done);
            if ready.is_empty() {
                // Every remaining task depends on one still pending, which
                // `build_graph`'s acyclicity check rules out; stop instead
                // of spinning forever if it ever happens.
                break;
            }

            let ctx_ref = &ctx;
            let futures = ready.iter().filter_map(|task_id| {
                workflow.tasks.iter().find(|t| t.id == *task_id).map(|step| {
                    self.run_task(step, ctx_ref, task_catalog, workflow_catalog, options.dry_run, &call_stack)
                })
            });
            let round_results = join_all(futures).await;

            for result in round_results {
                pending.remove(&result.task_id);
                done.insert(result.task_id.clone());
                ctx.set_task_output(
                    result.task_id.clone(),
                    TaskOutputEntry {
                        output: result.output.clone().unwrap_or(serde_json::Value::Null),
                        completed: matches!(result.status, TaskStatus::Completed),
                    },
                );
                results.insert(result.task_id.clone(), result);
            }
        }

        let mut ordered: Vec<TaskExecutionResult> = workflow.tasks.iter().filter_map(|t| results.remove(&t.id)).collect();
        let any_failed = ordered.iter().any(|r| matches!(r.status, TaskStatus::Failed));
        let status = if options.cancellation.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if any_failed || ordered.len() < workflow.tasks.len() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let output = if status == WorkflowStatus::Completed {
            template::resolve_mapping(&workflow.output, &ctx)
                .map(serde_json::Value::Object)
                .unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };

        let cost = OrchestrationCost {
            total_duration_ms: (chrono::Utc::now() - started_at).num_milliseconds(),
            task_count: ordered.len(),
            cache_hits: ordered.iter().filter(|r| r.cache_hit).count(),
            total_retries: ordered.iter().map(|r| r.retry_count).sum(),
        };

        ordered.sort_by_key(|r| workflow.tasks.iter().position(|t| t.id == r.task_id).unwrap_or(0));

        Ok(WorkflowExecutionResult {
            workflow_name: workflow.name.clone(),
            status,
            output,
            tasks: ordered,
            cost,
        })
    }

    /// Tasks whose every dependency has reached a terminal state
    /// (completed, skipped, or failed). A failed/skipped dependency is not
    /// transitively propagated — downstream tasks still run, and fail only
    /// if they actually reference the missing output (the template
    /// engine's `TaskNotCompleted` error surfaces that case).
    fn ready_tasks(&self, graph: &ExecutionGraph, pending: &HashSet<String>, done: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<String> = pending
            .iter()
            .filter(|id| graph.dependencies_of(id).iter().all(|dep| done.contains(dep)))
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    async fn run_task(
        &self,
        step: &TaskStep,
        ctx: &TemplateContext,
        task_catalog: &dyn TaskCatalog,
        workflow_catalog: &dyn WorkflowCatalog,
        dry_run: bool,
        call_stack: &CallStack,
    ) -> TaskExecutionResult {
        let started_at = chrono::Utc::now();

        if let Some(condition_expr) = &step.condition {
            match condition::evaluate_condition(condition_expr, ctx) {
                Ok(outcome) if !outcome.should_execute => {
                    return skipped(&step.id, started_at, Some(outcome.evaluated_expression));
                }
                Ok(_) => {}
                Err(e) => return failed(&step.id, started_at, ErrorInfo::new(ErrorKind::TemplateResolution, e.to_string(), started_at), 0),
            }
        }

        let mut effective_target = match &step.target {
            TaskRefKind::Task(r) => Some(r.clone()),
            TaskRefKind::Workflow(_) => None,
        };

        if let Some(switch) = &step.switch {
            let cases: Vec<(String, String)> = switch.cases.iter().map(|c| (c.match_.clone(), c.task_ref.clone())).collect();
            match condition::evaluate_switch(&switch.value, &cases, switch.default.as_deref(), ctx) {
                Ok(Some(outcome)) => effective_target = Some(outcome.task_ref),
                Ok(None) => return skipped(&step.id, started_at, None),
                Err(e) => return failed(&step.id, started_at, ErrorInfo::new(ErrorKind::TemplateResolution, e.to_string(), started_at), 0),
            }
        }

        // `forEach` steps resolve `step.input` once per item, against a child
        // context carrying that item's `forEach` frame (run_for_each), not
        // against the parent `ctx` here — a bare `{{forEach.item...}}`
        // reference would fail to resolve at this scope.
        if let Some(task_ref) = &effective_target {
            if let Some(spec) = task_catalog.get_task_spec(task_ref) {
                if let Some(for_each_spec) = &step.for_each {
                    if dry_run {
                        return completed(&step.id, started_at, serde_json::Value::Null, 0, false);
                    }
                    return self.run_for_each(step, for_each_spec, &spec, ctx, started_at).await;
                }
            }
        }

        let resolved_input = match template::resolve_mapping(&step.input, ctx) {
            Ok(map) => serde_json::Value::Object(map),
            Err(e) => return failed(&step.id, started_at, ErrorInfo::new(ErrorKind::TemplateResolution, e.to_string(), started_at), 0),
        };

        if dry_run {
            return completed(&step.id, started_at, resolved_input, 0, false);
        }

        if let TaskRefKind::Workflow(workflow_ref) = &step.target {
            return self
                .run_subworkflow(&step.id, workflow_ref, resolved_input, task_catalog, workflow_catalog, dry_run, call_stack, started_at)
                .await;
        }

        let Some(task_ref) = effective_target else {
            return skipped(&step.id, started_at, None);
        };
        let Some(spec) = task_catalog.get_task_spec(&task_ref) else {
            return failed(
                &step.id,
                started_at,
                ErrorInfo::new(ErrorKind::ConfigurationError, format!("unknown taskRef '{task_ref}'"), started_at),
                0,
            );
        };

        match self.execute_with_fault_tolerance(step, &spec, resolved_input.clone(), ctx).await {
            Ok((output, retries, cache_hit)) => completed(&step.id, started_at, output, retries, cache_hit),
            Err((error, retries)) => {
                if let Some(fallback_ref) = &step.fallback {
                    if let Some(fallback_spec) = task_catalog.get_task_spec(fallback_ref) {
                        let timeout = self.resolve_timeout(step.timeout.as_deref(), fallback_spec.timeout.as_deref());
                        if let Ok(output) = self.executor.exec(&fallback_spec, &resolved_input, timeout).await {
                            return completed(&step.id, started_at, output, retries, false);
                        }
                    }
                }
                failed(&step.id, started_at, error, retries)
            }
        }
    }

    /// Runs `step`'s fault-tolerant body (§4.5) once per element of the
    /// resolved `forEach` collection, under the spec's concurrency bound.
    /// Per spec.md §4.6.4, an individual item failure never fails the
    /// enclosing task — it is folded into `failureCount` instead, and the
    /// task still completes.
    async fn run_for_each(
        &self,
        step: &TaskStep,
        for_each_spec: &crate::workflow::ForEachSpec,
        spec: &TaskSpec,
        ctx: &TemplateContext,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> TaskExecutionResult {
        let items = match template::resolve(&for_each_spec.items, ctx) {
            Ok(v) => v.as_array().cloned().unwrap_or_default(),
            Err(e) => return failed(&step.id, started_at, ErrorInfo::new(ErrorKind::TemplateResolution, e.to_string(), started_at), 0),
        };
        let item_count = items.len();

        let results = foreach::run::<serde_json::Value, ErrorInfo, _, _>(
            for_each_spec,
            &items,
            ctx,
            self.config.default_for_each_concurrency,
            |child_ctx, _index| async move {
                let resolved_input = template::resolve_mapping(&step.input, &child_ctx)
                    .map(serde_json::Value::Object)
                    .map_err(|e| ErrorInfo::new(ErrorKind::TemplateResolution, e.to_string(), started_at))?;
                self.execute_with_fault_tolerance(step, spec, resolved_input, &child_ctx)
                    .await
                    .map(|(output, _, _)| output)
                    .map_err(|(error, _)| error)
            },
        )
        .await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut success_count: u32 = 0;
        let mut failure_count: u32 = 0;
        for result in results {
            match result {
                Ok(output) => {
                    success_count += 1;
                    outputs.push(output);
                }
                Err(_) => {
                    failure_count += 1;
                    outputs.push(serde_json::Value::Null);
                }
            }
        }

        let output = serde_json::json!({
            "outputs": outputs,
            "itemCount": item_count,
            "successCount": success_count,
            "failureCount": failure_count,
        });
        completed(&step.id, started_at, output, 0, false)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_subworkflow(
        &self,
        task_id: &str,
        workflow_ref: &str,
        input: serde_json::Value,
        task_catalog: &dyn TaskCatalog,
        workflow_catalog: &dyn WorkflowCatalog,
        dry_run: bool,
        call_stack: &CallStack,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> TaskExecutionResult {
        let Ok(parsed) = subworkflow::parse_reference(workflow_ref) else {
            return failed(task_id, started_at, ErrorInfo::new(ErrorKind::ConfigurationError, format!("invalid workflowRef '{workflow_ref}'"), started_at), 0);
        };
        let Some(child_workflow) = workflow_catalog.get_workflow(&parsed.catalog_key()) else {
            return failed(task_id, started_at, ErrorInfo::new(ErrorKind::ConfigurationError, format!("unknown workflowRef '{workflow_ref}'"), started_at), 0);
        };
        let next_stack = match call_stack.push(&parsed.catalog_key()) {
            Ok(s) => s,
            Err(subworkflow::Error::DepthExceeded { .. }) => {
                return failed(task_id, started_at, ErrorInfo::new(ErrorKind::DepthExceeded, "sub-workflow depth exceeded".to_string(), started_at), 0)
            }
            Err(subworkflow::Error::WorkflowCycle { path }) => {
                return failed(task_id, started_at, ErrorInfo::new(ErrorKind::WorkflowCycle, format!("cycle: {}", path.join(" -> ")), started_at), 0)
            }
            Err(e) => return failed(task_id, started_at, ErrorInfo::new(ErrorKind::ConfigurationError, e.to_string(), started_at), 0),
        };

        let (_handle, token) = cancellation::pair();
        let sub_options = ExecuteOptions {
            cancellation: token,
            dry_run,
            call_stack: next_stack,
        };

        let fut = Box::pin(self.execute(&child_workflow, task_catalog, workflow_catalog, input, sub_options));
        match fut.await {
            Ok(result) if matches!(result.status, WorkflowStatus::Completed) => completed(task_id, started_at, result.output, 0, false),
            Ok(result) => {
                let inner_error = result
                    .tasks
                    .iter()
                    .find_map(|t| t.error.clone())
                    .unwrap_or_else(|| ErrorInfo::new(ErrorKind::UnknownError, format!("sub-workflow '{workflow_ref}' failed"), started_at));
                failed(task_id, started_at, inner_error, 0)
            }
            Err(e) => failed(task_id, started_at, ErrorInfo::new(ErrorKind::ConfigurationError, e.to_string(), started_at), 0),
        }
    }

    /// Cache -> CircuitBreaker -> Retry -> Executor, per spec.md §4.5.
    ///
    /// Honors a task's own `cache`/`circuitBreaker`/`retry` overrides when
    /// present, falling back to engine defaults otherwise.
    async fn execute_with_fault_tolerance(
        &self,
        step: &TaskStep,
        spec: &TaskSpec,
        input: serde_json::Value,
        ctx: &TemplateContext,
    ) -> std::result::Result<(serde_json::Value, u32, bool), (ErrorInfo, u32)> {
        let started_at = chrono::Utc::now();
        let cache_spec = step.cache.as_ref();

        let bypass_when_truthy = match cache_spec.and_then(|c| c.bypass_when.as_deref()) {
            Some(expr) => condition::evaluate_condition(expr, ctx).map(|o| o.should_execute).unwrap_or(false),
            None => false,
        };
        let bypass_cache = bypass_when_truthy || !method_is_cacheable(cache_spec, spec);

        let cache_key = match cache_spec.and_then(|c| c.key.as_deref()) {
            Some(key_template) => match template::resolve(key_template, ctx) {
                Ok(v) => v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                Err(_) => cache::compute_cache_key(&step.id, &input),
            },
            None => cache::compute_cache_key(&step.id, &input),
        };

        let ttl = cache_spec
            .map(|c| config::parse_duration(&c.ttl).unwrap_or(std::time::Duration::from_secs(300)))
            .unwrap_or(std::time::Duration::from_secs(300));
        let stale_ttl = cache_spec.and_then(|c| c.stale_ttl.as_deref()).and_then(|s| config::parse_duration(s).ok());
        let timeout = self.resolve_timeout(step.timeout.as_deref(), spec.timeout.as_deref());

        if !bypass_cache {
            if let Ok(Some(entry)) = self.cache.get(&cache_key).await {
                let now = chrono::Utc::now();
                if entry.is_fresh(now) {
                    return Ok((entry.output, 0, true));
                }
                if entry.is_stale_but_servable(now) {
                    self.spawn_stale_refresh(step.id.clone(), spec.clone(), input.clone(), timeout, cache_key, ttl, stale_ttl);
                    return Ok((entry.output, 0, true));
                }
            }
        }

        let breaker = self.circuit_breaker_for(&step.id, &step.circuit_breaker.clone().unwrap_or_default()).await;
        if breaker.before_call().await.is_err() {
            return Err((ErrorInfo::new(ErrorKind::CircuitOpen, "circuit breaker is open".to_string(), started_at), 0));
        }

        let retry_policy = step.retry.clone().unwrap_or_default();
        let executor = Arc::clone(&self.executor);
        let spec = spec.clone();
        let (result, retries) = retry::run_with_retry(
            &retry_policy,
            |e: &crate::executor::Error| e.kind(),
            || {
                let executor = Arc::clone(&executor);
                let spec = spec.clone();
                let input = input.clone();
                async move { executor.exec(&spec, &input, timeout).await }
            },
        )
        .await;

        let cache_only_success = cache_spec.and_then(|c| c.cache_only_success).unwrap_or(true);

        match result {
            Ok(output) => {
                breaker.record_success().await;
                if !bypass_cache {
                    let _ = self
                        .cache
                        .set(CacheEntry {
                            key: cache_key,
                            output: output.clone(),
                            cached_at: chrono::Utc::now(),
                            ttl,
                            stale_ttl,
                        })
                        .await;
                }
                Ok((output, retries, false))
            }
            Err(e) => {
                breaker.record_failure().await;
                if !bypass_cache && !cache_only_success {
                    let _ = self
                        .cache
                        .set(CacheEntry {
                            key: cache_key,
                            output: serde_json::Value::Null,
                            cached_at: chrono::Utc::now(),
                            ttl,
                            stale_ttl,
                        })
                        .await;
                }
                Err((ErrorInfo::new(e.kind(), e.to_string(), started_at).with_retry_attempts(retries), retries))
            }
        }
    }

    /// Fire a best-effort background re-execution for a stale-but-servable
    /// cache hit and replace the entry on success (spec.md §4.5). Doesn't
    /// go through the circuit breaker or retry policy — it's an
    /// opportunistic refresh, not a blocking call on the task's behalf.
    fn spawn_stale_refresh(
        &self,
        step_id: String,
        spec: TaskSpec,
        input: serde_json::Value,
        timeout: Duration,
        cache_key: String,
        ttl: Duration,
        stale_ttl: Option<Duration>,
    ) {
        let executor = Arc::clone(&self.executor);
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            match executor.exec(&spec, &input, timeout).await {
                Ok(output) => {
                    let _ = cache
                        .set(CacheEntry {
                            key: cache_key,
                            output,
                            cached_at: chrono::Utc::now(),
                            ttl,
                            stale_ttl,
                        })
                        .await;
                }
                Err(e) => tracing::debug!("background cache refresh for '{step_id}' failed: {e}"),
            }
        });
    }
}

/// Method gate for the cache layer (spec.md §4.5): non-HTTP task kinds have
/// no method concept and are always eligible. HTTP tasks are gated by the
/// step's `cacheableMethods`, defaulting to GET-only when unset.
fn method_is_cacheable(cache_spec: Option<&crate::workflow::CacheSpec>, spec: &TaskSpec) -> bool {
    let Some(http) = &spec.http else {
        return true;
    };
    match cache_spec.map(|c| c.cacheable_methods.as_slice()).filter(|m| !m.is_empty()) {
        Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(&http.method)),
        None => http.method.eq_ignore_ascii_case("get"),
    }
}

fn skipped(task_id: &str, started_at: chrono::DateTime<chrono::Utc>, evaluated_expression: Option<String>) -> TaskExecutionResult {
    TaskExecutionResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Skipped,
        output: None,
        error: None,
        retry_count: 0,
        cache_hit: false,
        duration_ms: (chrono::Utc::now() - started_at).num_milliseconds(),
        evaluated_expression,
    }
}

fn completed(task_id: &str, started_at: chrono::DateTime<chrono::Utc>, output: serde_json::Value, retry_count: u32, cache_hit: bool) -> TaskExecutionResult {
    TaskExecutionResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Completed,
        output: Some(output),
        error: None,
        retry_count,
        cache_hit,
        duration_ms: (chrono::Utc::now() - started_at).num_milliseconds(),
        evaluated_expression: None,
    }
}

fn failed(task_id: &str, started_at: chrono::DateTime<chrono::Utc>, error: ErrorInfo, retry_count: u32) -> TaskExecutionResult {
    TaskExecutionResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Failed,
        output: None,
        error: Some(error),
        retry_count,
        cache_hit: false,
        duration_ms: (chrono::Utc::now() - started_at).num_milliseconds(),
        evaluated_expression: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::workflow::{HttpSpec, InMemoryCatalog, TaskKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubExecutor {
        calls: AtomicU32,
        flaky_calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn exec(&self, spec: &TaskSpec, input: &serde_json::Value, _timeout: std::time::Duration) -> crate::executor::Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match spec.name.as_str() {
                "double" => {
                    let n = input.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
                    Ok(serde_json::json!({ "doubled": n * 2 }))
                }
                "fail" => Err(crate::executor::Error::Http {
                    url: "http://x".to_string(),
                    reason: "boom".to_string(),
                }),
                "flaky" => {
                    let attempt = self.flaky_calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(crate::executor::Error::Http {
                            url: "http://x".to_string(),
                            reason: "transient".to_string(),
                        })
                    } else {
                        Ok(serde_json::json!({ "recovered": true }))
                    }
                }
                "fallback" => Ok(serde_json::json!({ "from_fallback": true })),
                "maybe_fail" => {
                    let n = input.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
                    if n < 0 {
                        Err(crate::executor::Error::Http {
                            url: "http://x".to_string(),
                            reason: "negative input".to_string(),
                        })
                    } else {
                        Ok(serde_json::json!({ "doubled": n * 2 }))
                    }
                }
                _ => Ok(serde_json::Value::Null),
            }
        }
    }

    fn engine() -> Engine<StubExecutor> {
        Engine::new(
            Arc::new(StubExecutor {
                calls: AtomicU32::new(0),
                flaky_calls: AtomicU32::new(0),
            }),
            Arc::new(InMemoryCache::new()),
            config::EngineConfig::default(),
        )
    }

    fn task_step(id: &str, task_ref: &str, depends_on: &[&str], input: &[(&str, &str)]) -> TaskStep {
        TaskStep {
            id: id.to_string(),
            target: TaskRefKind::Task(task_ref.to_string()),
            input: input.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            condition: None,
            switch: None,
            for_each: None,
            retry: None,
            cache: None,
            circuit_breaker: None,
            fallback: None,
            timeout: None,
        }
    }

    fn spec(name: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            kind: TaskKind::Http,
            http: Some(HttpSpec {
                method: "get".to_string(),
                url: "http://x".to_string(),
                headers: HashMap::new(),
                body: None,
            }),
            transform: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn linear_chain_propagates_output() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![
                task_step("a", "double", &[], &[("n", "{{input.n}}")]),
                task_step("b", "double", &["a"], &[("n", "{{tasks.a.output.doubled}}")]),
            ],
            output: HashMap::from([("result".to_string(), "{{tasks.b.output.doubled}}".to_string())]),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::json!({"n": 3}), options).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output, serde_json::json!({"result": 12}));
    }

    #[tokio::test]
    async fn parallel_fan_out_then_join() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![
                task_step("a", "double", &[], &[("n", "1")]),
                task_step("b", "double", &[], &[("n", "2")]),
                task_step("c", "double", &["a", "b"], &[("n", "{{tasks.a.output.doubled}}")]),
            ],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.tasks.len(), 3);
    }

    #[tokio::test]
    async fn condition_false_skips_task() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let mut step = task_step("a", "double", &[], &[("n", "1")]);
        step.condition = Some("{{input.enabled}} == true".to_string());

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![step],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::json!({"enabled": false}), options).await.unwrap();
        assert_eq!(result.tasks.first().unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn failed_task_fails_the_workflow() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("fail".to_string(), spec("fail"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![task_step("a", "fail", &[], &[])],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.tasks.first().unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn cache_hit_on_second_identical_call() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![task_step("a", "double", &[], &[("n", "5")])],
            output: HashMap::new(),
        };

        let (_h, options1) = ExecuteOptions::new(10);
        let first = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options1).await.unwrap();
        assert!(!first.tasks.first().unwrap().cache_hit);

        let (_h, options2) = ExecuteOptions::new(10);
        let second = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options2).await.unwrap();
        assert!(second.tasks.first().unwrap().cache_hit);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("flaky".to_string(), spec("flaky"));

        let mut step = task_step("a", "flaky", &[], &[]);
        step.retry = Some(crate::workflow::RetryPolicy {
            initial_delay: "1ms".to_string(),
            max_delay: "5ms".to_string(),
            multiplier: 2.0,
            max_retry_count: 5,
        });

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![step],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options).await.unwrap();
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.output, Some(serde_json::json!({"recovered": true})));
    }

    #[tokio::test]
    async fn fallback_runs_when_primary_task_fails() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("fail".to_string(), spec("fail"));
        catalog.tasks.insert("fallback".to_string(), spec("fallback"));

        let mut step = task_step("a", "fail", &[], &[]);
        step.retry = Some(crate::workflow::RetryPolicy {
            initial_delay: "1ms".to_string(),
            max_delay: "2ms".to_string(),
            multiplier: 2.0,
            max_retry_count: 0,
        });
        step.fallback = Some("fallback".to_string());

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![step],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options).await.unwrap();
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output, Some(serde_json::json!({"from_fallback": true})));
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_and_short_circuits() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("fail".to_string(), spec("fail"));

        let mut step = task_step("a", "fail", &[], &[]);
        step.retry = Some(crate::workflow::RetryPolicy {
            initial_delay: "1ms".to_string(),
            max_delay: "2ms".to_string(),
            multiplier: 1.0,
            max_retry_count: 0,
        });
        step.circuit_breaker = Some(crate::workflow::CircuitBreakerSpec {
            failure_threshold: 1,
            sampling_duration: "60s".to_string(),
            break_duration: "60s".to_string(),
            half_open_requests: 1,
        });

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![step.clone()],
            output: HashMap::new(),
        };

        let (_h, options1) = ExecuteOptions::new(10);
        let first = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options1).await.unwrap();
        assert_eq!(first.tasks.first().unwrap().status, TaskStatus::Failed);

        let (_h, options2) = ExecuteOptions::new(10);
        let second = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options2).await.unwrap();
        let second_task = second.tasks.first().unwrap();
        assert_eq!(second_task.status, TaskStatus::Failed);
        assert_eq!(second_task.error.as_ref().unwrap().kind, ErrorKind::CircuitOpen);
    }

    fn for_each_step(id: &str, task_ref: &str, items_expr: &str) -> TaskStep {
        let mut step = task_step(id, task_ref, &[], &[("n", "{{forEach.item.n}}")]);
        step.for_each = Some(crate::workflow::ForEachSpec {
            items: items_expr.to_string(),
            item_var: "item".to_string(),
            index_var: "index".to_string(),
            parallel: true,
            max_concurrency: 0,
        });
        step
    }

    #[tokio::test]
    async fn for_each_over_empty_array_succeeds_with_zero_counts() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![for_each_step("a", "double", "{{input.items}}")],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::json!({"items": []}), options).await.unwrap();
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.output,
            Some(serde_json::json!({"outputs": [], "itemCount": 0, "successCount": 0, "failureCount": 0}))
        );
    }

    #[tokio::test]
    async fn for_each_resolves_per_item_input_against_child_context() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![for_each_step("a", "double", "{{input.items}}")],
            output: HashMap::new(),
        };

        let items = serde_json::json!({"items": [{"n": 1}, {"n": 2}, {"n": 3}]});
        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, items, options).await.unwrap();
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.output,
            Some(serde_json::json!({
                "outputs": [{"doubled": 2}, {"doubled": 4}, {"doubled": 6}],
                "itemCount": 3,
                "successCount": 3,
                "failureCount": 0,
            }))
        );
    }

    #[tokio::test]
    async fn for_each_item_failure_does_not_fail_the_task() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("maybe_fail".to_string(), spec("maybe_fail"));

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![for_each_step("a", "maybe_fail", "{{input.items}}")],
            output: HashMap::new(),
        };

        let items = serde_json::json!({"items": [{"n": 1}, {"n": -1}, {"n": 2}]});
        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, items, options).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.output,
            Some(serde_json::json!({
                "outputs": [{"doubled": 2}, serde_json::Value::Null, {"doubled": 4}],
                "itemCount": 3,
                "successCount": 2,
                "failureCount": 1,
            }))
        );
    }

    #[tokio::test]
    async fn stale_cache_entry_is_served_and_refreshed_in_background() {
        let shared_cache = Arc::new(InMemoryCache::new());
        let engine = Engine::new(
            Arc::new(StubExecutor {
                calls: AtomicU32::new(0),
                flaky_calls: AtomicU32::new(0),
            }),
            Arc::clone(&shared_cache) as Arc<dyn crate::cache::CacheProvider>,
            config::EngineConfig::default(),
        );
        let mut catalog = InMemoryCatalog::default();
        catalog.tasks.insert("double".to_string(), spec("double"));

        let mut step = task_step("a", "double", &[], &[("n", "5")]);
        step.cache = Some(crate::workflow::CacheSpec {
            key: None,
            ttl: "10ms".to_string(),
            stale_ttl: Some("60s".to_string()),
            bypass_when: None,
            cache_only_success: None,
            cacheable_methods: Vec::new(),
        });

        let cache_key = crate::cache::compute_cache_key("a", &serde_json::json!({"n": "5"}));
        shared_cache
            .set(crate::cache::CacheEntry {
                key: cache_key,
                output: serde_json::json!({"doubled": 999}),
                cached_at: chrono::Utc::now() - chrono::Duration::milliseconds(50),
                ttl: Duration::from_millis(10),
                stale_ttl: Some(Duration::from_secs(60)),
            })
            .await
            .unwrap();

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![step],
            output: HashMap::new(),
        };

        let (_h, options) = ExecuteOptions::new(10);
        let result = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options).await.unwrap();
        let task = result.tasks.first().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.cache_hit);
        assert_eq!(task.output, Some(serde_json::json!({"doubled": 999})));
    }

    #[tokio::test]
    async fn non_get_http_method_bypasses_cache_by_default() {
        let engine = engine();
        let mut catalog = InMemoryCatalog::default();
        let mut post_spec = spec("double");
        post_spec.http.as_mut().unwrap().method = "post".to_string();
        catalog.tasks.insert("double".to_string(), post_spec);

        let wf = WorkflowDefinition {
            name: "wf".to_string(),
            namespace: None,
            version: None,
            input: Vec::new(),
            tasks: vec![task_step("a", "double", &[], &[("n", "5")])],
            output: HashMap::new(),
        };

        let (_h, options1) = ExecuteOptions::new(10);
        let first = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options1).await.unwrap();
        assert!(!first.tasks.first().unwrap().cache_hit);

        let (_h, options2) = ExecuteOptions::new(10);
        let second = engine.execute(&wf, &catalog, &catalog, serde_json::Value::Null, options2).await.unwrap();
        assert!(!second.tasks.first().unwrap().cache_hit);
    }
}
