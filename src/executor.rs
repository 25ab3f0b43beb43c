//! C4 — task execution: dispatches a resolved [`TaskSpec`] to its kind's
//! handler and returns the task's raw output.
//!
//! Grounded on the teacher's `executor.rs`/`providers/executors/rest.rs`:
//! same `async_trait` `Executor` seam and the same endpoint/method/body
//! request-building shape, trimmed to this spec's single `http` task kind
//! (no multi-provider dispatch table for python/node/openapi) plus the
//! `transform` and `inline` kinds this spec adds.

use async_trait::async_trait;
use snafu::prelude::*;
use std::time::Duration;

use crate::errors::ErrorKind;
use crate::transform;
use crate::workflow::{HttpSpec, TaskKind, TaskSpec, TransformSpec};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("http request to {url} failed: {reason}"))]
    Http { url: String, reason: String },

    #[snafu(display("http request to {url} timed out after {timeout:?}"))]
    HttpTimeout { url: String, timeout: Duration },

    #[snafu(display("http request to {url} returned status {status}"))]
    HttpStatus { url: String, status: u16 },

    #[snafu(display("transform pipeline failed: {source}"))]
    Transform { source: transform::Error },

    #[snafu(display("failed to resolve transform input: {source}"))]
    TransformInput { source: crate::template::Error },

    #[snafu(display("task spec '{name}' is missing its '{kind:?}' configuration"))]
    MissingConfig { name: String, kind: TaskKind },
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Http { .. } => ErrorKind::NetworkError,
            Error::HttpTimeout { .. } => ErrorKind::Timeout,
            Error::HttpStatus { status, .. } => ErrorKind::from_http_status(*status),
            Error::Transform { .. } | Error::TransformInput { .. } | Error::MissingConfig { .. } => {
                ErrorKind::ConfigurationError
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pluggable seam for executing a single resolved task. The engine only
/// ever depends on this trait; `DefaultExecutor` is the concrete default.
///
/// `timeout` is the caller's already-resolved value (task step override,
/// else task spec default, else the engine-wide default) — this trait
/// never reads config itself.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec(&self, spec: &TaskSpec, input: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value>;
}

pub struct DefaultExecutor {
    client: reqwest::Client,
}

impl DefaultExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for DefaultExecutor {
    async fn exec(&self, spec: &TaskSpec, input: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        match spec.kind {
            TaskKind::Http => {
                let http = spec.http.as_ref().ok_or_else(|| Error::MissingConfig {
                    name: spec.name.clone(),
                    kind: TaskKind::Http,
                })?;
                exec_http(&self.client, http, input, timeout).await
            }
            TaskKind::Transform => {
                let t = spec.transform.as_ref().ok_or_else(|| Error::MissingConfig {
                    name: spec.name.clone(),
                    kind: TaskKind::Transform,
                })?;
                exec_transform(t, input)
            }
            TaskKind::Inline => Ok(input.clone()),
        }
    }
}

async fn exec_http(client: &reqwest::Client, http: &HttpSpec, input: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
    let method = match http.method.to_lowercase().as_str() {
        "post" => reqwest::Method::POST,
        "put" => reqwest::Method::PUT,
        "delete" => reqwest::Method::DELETE,
        "patch" => reqwest::Method::PATCH,
        _ => reqwest::Method::GET,
    };

    let mut builder = client.request(method.clone(), &http.url).timeout(timeout);

    for (key, value) in &http.headers {
        builder = builder.header(key, value);
    }

    if matches!(method, reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH) {
        builder = builder.json(input);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::HttpTimeout { url: http.url.clone(), timeout }
        } else {
            Error::Http { url: http.url.clone(), reason: e.to_string() }
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            url: http.url.clone(),
            status: status.as_u16(),
        });
    }

    let body_text = response.text().await.map_err(|e| {
        if e.is_timeout() {
            Error::HttpTimeout { url: http.url.clone(), timeout }
        } else {
            Error::Http { url: http.url.clone(), reason: e.to_string() }
        }
    })?;

    Ok(serde_json::from_str(&body_text).unwrap_or(serde_json::Value::String(body_text)))
}

fn exec_transform(spec: &TransformSpec, input: &serde_json::Value) -> Result<serde_json::Value> {
    let ctx = crate::context::TemplateContext::new(input.clone());
    let resolved_input =
        crate::template::resolve(&spec.input, &ctx).map_err(|source| Error::TransformInput { source })?;
    transform::apply_pipeline(&resolved_input, &spec.pipeline).map_err(|source| Error::Transform { source })
}
