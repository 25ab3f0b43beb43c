//! The template context: the value environment a template or condition
//! resolves against. Built fresh (a cheap snapshot) by the scheduler each
//! time a task's inputs need resolving — see spec.md §5's ordering
//! guarantee that a write to `tasks` happens-before any read by a
//! dependent task.

use serde_json::Value;
use std::collections::HashMap;

/// One entry in the `tasks` map: a task's produced output, and whether it
/// has actually completed (vs. merely being known to the graph).
#[derive(Debug, Clone)]
pub struct TaskOutputEntry {
    pub output: Value,
    pub completed: bool,
}

/// The active `forEach` loop frame, if the current task resolution is
/// happening inside a forEach iteration.
#[derive(Debug, Clone)]
pub struct ForEachFrame {
    pub item_var: String,
    pub index_var: String,
    pub current_item: Value,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct TemplateContext {
    input: Value,
    tasks: HashMap<String, TaskOutputEntry>,
    for_each_stack: Vec<ForEachFrame>,
}

impl TemplateContext {
    #[must_use]
    pub fn new(input: Value) -> Self {
        Self {
            input,
            tasks: HashMap::new(),
            for_each_stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    #[must_use]
    pub fn task_output(&self, task_id: &str) -> Option<&TaskOutputEntry> {
        self.tasks.get(task_id)
    }

    pub fn set_task_output(&mut self, task_id: impl Into<String>, entry: TaskOutputEntry) {
        self.tasks.insert(task_id.into(), entry);
    }

    #[must_use]
    pub fn tasks(&self) -> &HashMap<String, TaskOutputEntry> {
        &self.tasks
    }

    #[must_use]
    pub fn for_each(&self) -> Option<&ForEachFrame> {
        self.for_each_stack.last()
    }

    pub fn push_for_each_frame(&mut self, frame: ForEachFrame) {
        self.for_each_stack.push(frame);
    }

    pub fn pop_for_each_frame(&mut self) {
        self.for_each_stack.pop();
    }

    /// Build a child context for a forEach iteration, sharing `input` and
    /// the already-completed `tasks` map, with a new active frame.
    #[must_use]
    pub fn with_for_each_frame(&self, frame: ForEachFrame) -> Self {
        let mut child = self.clone();
        child.push_for_each_frame(frame);
        child
    }
}
