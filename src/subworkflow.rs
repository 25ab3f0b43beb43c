//! C8 — sub-workflow reference resolution and call-stack bookkeeping.
//!
//! `workflowRef` parsing and recursive-depth bookkeeping have no direct
//! analog in the teacher's URL/file-based `durableengine/catalog.rs`, but
//! the recursive-invocation shape — a nested `run_instance` call wrapped
//! in `Box::pin` to keep the future's size finite — is the same pattern
//! `scheduler.rs` follows when dispatching a `workflowRef` task, and this
//! module supplies that call's depth/cycle guard.

use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid workflow reference '{reference}'"))]
    InvalidReference { reference: String },

    #[snafu(display("sub-workflow call stack depth {depth} exceeds configured maximum {max_depth}"))]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[snafu(display("workflow cycle detected: {}", path.join(" -> ")))]
    WorkflowCycle { path: Vec<String> },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed `workflowRef`: `name`, `name@version`, `namespace/name`, or
/// `namespace/name@version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRef {
    pub namespace: Option<String>,
    pub name: String,
    pub version: Option<String>,
}

impl WorkflowRef {
    /// The catalog lookup key, as `InMemoryCatalog` stores it: `name`, or
    /// `namespace/name`, with an optional `@version` suffix preserved.
    #[must_use]
    pub fn catalog_key(&self) -> String {
        let base = match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        };
        match &self.version {
            Some(v) => format!("{base}@{v}"),
            None => base,
        }
    }
}

/// # Errors
/// Returns [`Error::InvalidReference`] for an empty name or namespace
/// segment.
pub fn parse_reference(reference: &str) -> Result<WorkflowRef> {
    let (path_part, version) = match reference.split_once('@') {
        Some((path, version)) => (path, Some(version.to_string())),
        None => (reference, None),
    };

    let (namespace, name) = match path_part.split_once('/') {
        Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
        None => (None, path_part.to_string()),
    };

    if name.is_empty() || namespace.as_deref() == Some("") {
        return Err(Error::InvalidReference {
            reference: reference.to_string(),
        });
    }

    Ok(WorkflowRef { namespace, name, version })
}

/// The active sub-workflow invocation chain, for depth and cycle checks.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: Vec<String>,
    max_depth: u32,
}

impl CallStack {
    #[must_use]
    pub fn new(max_depth: u32) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Push a new frame onto the call stack, checking depth and cycle
    /// invariants first.
    ///
    /// # Errors
    /// Returns [`Error::DepthExceeded`] or [`Error::WorkflowCycle`].
    pub fn push(&self, catalog_key: &str) -> Result<Self> {
        let depth = self.frames.len() as u32 + 1;
        if depth > self.max_depth {
            return Err(Error::DepthExceeded {
                depth,
                max_depth: self.max_depth,
            });
        }
        if self.frames.iter().any(|f| f == catalog_key) {
            let mut path = self.frames.clone();
            path.push(catalog_key.to_string());
            return Err(Error::WorkflowCycle { path });
        }
        let mut next = self.clone();
        next.frames.push(catalog_key.to_string());
        Ok(next)
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.frames.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_forms() {
        assert_eq!(
            parse_reference("checkout").unwrap(),
            WorkflowRef {
                namespace: None,
                name: "checkout".to_string(),
                version: None
            }
        );
        assert_eq!(
            parse_reference("checkout@2").unwrap(),
            WorkflowRef {
                namespace: None,
                name: "checkout".to_string(),
                version: Some("2".to_string())
            }
        );
        assert_eq!(
            parse_reference("orders/checkout").unwrap(),
            WorkflowRef {
                namespace: Some("orders".to_string()),
                name: "checkout".to_string(),
                version: None
            }
        );
        assert_eq!(
            parse_reference("orders/checkout@2").unwrap(),
            WorkflowRef {
                namespace: Some("orders".to_string()),
                name: "checkout".to_string(),
                version: Some("2".to_string())
            }
        );
    }

    #[test]
    fn depth_exceeded_is_rejected() {
        let stack = CallStack::new(1);
        let next = stack.push("a").unwrap();
        assert!(next.push("b").is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let stack = CallStack::new(5).push("a").unwrap().push("b").unwrap();
        let err = stack.push("a").unwrap_err();
        assert!(matches!(err, Error::WorkflowCycle { .. }));
    }
}
