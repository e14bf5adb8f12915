//! Per-instance mutable state derived from a compiled [`kro_graph::Graph`].
//!
//! A fresh `Runtime` is built for every reconcile: it carries the observed
//! parent object and, progressively as the reconciler GETs each child, the
//! observed child objects, and resolves expressions against whatever has
//! been observed so far. No state is shared across reconciles, so no locking
//! is needed here.

use std::collections::BTreeMap;
use std::sync::Arc;

use kro_expr::{Environment, Segment};
use kro_graph::{FieldDescriptor, Graph, Resource};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown resource id {0:?}")]
    UnknownResource(String),
    #[error(transparent)]
    Eval(#[from] kro_expr::ExprError),
}

/// Per-resource reconciliation state, tracked across the successive passes
/// of one reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Pending,
    InProgress,
    Skipped,
    Created,
    WaitingForReadiness,
    Synced,
    Updating,
    PendingDeletion,
    Deleting,
    Deleted,
    Error(String),
}

/// Aggregate instance state, derived from the set of per-resource states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    InProgress,
    Active,
    Deleting,
    Failed,
    Error,
}

pub struct Runtime {
    graph: Arc<Graph>,
    observed_parent: Value,
    observed: BTreeMap<String, Value>,
    states: BTreeMap<String, ResourceState>,
}

impl Runtime {
    /// Builds a fresh runtime bound to `graph`, with every resource
    /// initialized to [`ResourceState::Pending`].
    pub fn new(graph: Arc<Graph>, observed_parent: Value) -> Self {
        let states = graph
            .topological_order
            .iter()
            .map(|id| (id.clone(), ResourceState::Pending))
            .collect();
        Self { graph, observed_parent, observed: BTreeMap::new(), states }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn state(&self, id: &str) -> Option<&ResourceState> {
        self.states.get(id)
    }

    pub fn set_state(&mut self, id: &str, state: ResourceState) {
        self.states.insert(id.to_string(), state);
    }

    /// Records the observed object for `id`, letting downstream expressions
    /// that reference it resolve on the next call.
    pub fn set_observed(&mut self, id: &str, value: Value) {
        self.observed.insert(id.to_string(), value);
    }

    pub fn observed(&self, id: &str) -> Option<&Value> {
        self.observed.get(id)
    }

    /// Builds the evaluation environment for this pass: `schema` bound to
    /// the observed parent, plus every resource id observed so far.
    pub fn environment(&self) -> Environment {
        let mut env = Environment::new();
        env.bind("schema", self.observed_parent.clone());
        for (id, value) in &self.observed {
            env.bind(id.clone(), value.clone());
        }
        env
    }

    fn dependencies_observed<'a>(&self, ids: impl Iterator<Item = &'a String>) -> bool {
        ids.into_iter().all(|id| id == "schema" || self.observed.contains_key(id))
    }

    /// Whether `includeWhen` permits creating this resource. Per design,
    /// an evaluation error (e.g. a dependency not yet observed) is treated
    /// as "not included" for this pass, not surfaced as a hard failure.
    pub fn evaluate_include_when(&self, id: &str) -> bool {
        let Some(resource) = self.graph.resource(id) else { return false };
        if resource.include_when.is_empty() {
            return true;
        }
        let env = self.environment();
        resource
            .include_when
            .iter()
            .all(|expr| matches!(expr.eval(&env), Ok(Value::Bool(true))))
    }

    /// Whether every `readyWhen` expression for this resource currently
    /// evaluates true. An evaluation error is treated as "not ready".
    pub fn evaluate_ready_when(&self, id: &str) -> bool {
        let Some(resource) = self.graph.resource(id) else { return false };
        if resource.ready_when.is_empty() {
            return true;
        }
        let env = self.environment();
        resource
            .ready_when
            .iter()
            .all(|expr| matches!(expr.eval(&env), Ok(Value::Bool(true))))
    }

    /// Resolves the fully-rendered desired object for `id`, or `None` if any
    /// of its dependencies haven't been observed yet this reconcile (the
    /// caller should requeue rather than treat this as an error).
    pub fn resolve_desired(&self, id: &str) -> Result<Option<Value>, RuntimeError> {
        let resource = self
            .graph
            .resource(id)
            .ok_or_else(|| RuntimeError::UnknownResource(id.to_string()))?;
        if !self.dependencies_observed(resource.dependencies.iter()) {
            return Ok(None);
        }
        let env = self.environment();
        let mut desired = resource.template.clone();
        for field in &resource.fields {
            let value = resolve_field(field, &env)?;
            desired = set_at_path(desired, &field.path, value);
        }
        Ok(Some(desired))
    }

    /// Resolves the user-declared `status.*` expressions, or `None` if a
    /// referenced resource hasn't been observed yet.
    pub fn resolve_status(&self) -> Result<Option<Value>, RuntimeError> {
        if !self.dependencies_observed(self.graph.status_dependencies.iter()) {
            return Ok(None);
        }
        let env = self.environment();
        let mut status = self.graph.status_template.clone();
        for field in &self.graph.status_fields {
            let value = resolve_field(field, &env)?;
            status = set_at_path(status, strip_status_prefix(&field.path), value);
        }
        Ok(Some(status))
    }

    /// `Active` iff every resource is `Synced` or `Skipped`; `Failed` if any
    /// resource is `Error`; otherwise `InProgress`.
    pub fn aggregate_state(&self) -> InstanceState {
        let mut any_error = false;
        let mut all_terminal = true;
        for state in self.states.values() {
            match state {
                ResourceState::Error(_) => any_error = true,
                ResourceState::Synced | ResourceState::Skipped => {}
                _ => all_terminal = false,
            }
        }
        if any_error {
            InstanceState::Failed
        } else if all_terminal {
            InstanceState::Active
        } else {
            InstanceState::InProgress
        }
    }
}

fn strip_status_prefix(path: &str) -> &str {
    path.strip_prefix("status.").or_else(|| path.strip_prefix("status")).unwrap_or(path)
}

fn resolve_field(field: &FieldDescriptor, env: &Environment) -> Result<Value, RuntimeError> {
    if field.standalone {
        let compiled = field.compiled.first().expect("standalone field has exactly one expression");
        return Ok(compiled.eval(env)?);
    }
    let mut compiled_iter = field.compiled.iter();
    let mut out = String::new();
    for segment in &field.segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Expression(_) => {
                let compiled = compiled_iter.next().expect("one compiled expr per expression segment");
                out.push_str(&value_to_scalar_string(&compiled.eval(env)?));
            }
        }
    }
    Ok(Value::String(out))
}

fn value_to_scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

enum PathToken {
    Key(String),
    Index(usize),
}

fn tokenize_path(path: &str) -> Vec<PathToken> {
    let mut tokens = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                tokens.push(PathToken::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(end) = rest.find(']') {
                if let Ok(idx) = rest[1..end].parse::<usize>() {
                    tokens.push(PathToken::Index(idx));
                }
                rest = &rest[end + 1..];
            }
        } else if !rest.is_empty() {
            tokens.push(PathToken::Key(rest.to_string()));
        }
    }
    tokens
}

fn set_at_path(mut root: Value, path: &str, value: Value) -> Value {
    let tokens = tokenize_path(path);
    set_recursive(&mut root, &tokens, value);
    root
}

fn set_recursive(current: &mut Value, tokens: &[PathToken], value: Value) {
    let Some((head, tail)) = tokens.split_first() else {
        *current = value;
        return;
    };
    match head {
        PathToken::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            let entry = current
                .as_object_mut()
                .expect("just coerced to object")
                .entry(key.clone())
                .or_insert(Value::Null);
            set_recursive(entry, tail, value);
        }
        PathToken::Index(idx) => {
            if !current.is_array() {
                *current = Value::Array(Default::default());
            }
            let arr = current.as_array_mut().expect("just coerced to array");
            while arr.len() <= *idx {
                arr.push(Value::Null);
            }
            set_recursive(&mut arr[*idx], tail, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kro_expr::cel::CelEngine;
    use kro_expr::ExpressionEngine;
    use kro_graph::{GraphBuilder, RgdInput, ResourceTemplate};
    use serde_json::json;

    fn build_graph(resources: Vec<ResourceTemplate>, status_template: Value) -> Arc<Graph> {
        let engine = CelEngine::new();
        let builder = GraphBuilder::new(&engine);
        let input = RgdInput {
            group: "kro.run".into(),
            version: "v1alpha1".into(),
            kind: "Foo".into(),
            spec_schema: json!({"name": "string"}),
            status_schema: json!({}),
            resources,
            status_template,
        };
        Arc::new(builder.build(&input).unwrap())
    }

    #[test]
    fn resolve_desired_is_none_until_dependency_observed() {
        let graph = build_graph(
            vec![
                ResourceTemplate {
                    id: "a".into(),
                    template: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                    ready_when: vec![],
                    include_when: vec![],
                },
                ResourceTemplate {
                    id: "b".into(),
                    template: json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"ref": "${a.status.id}"}}),
                    ready_when: vec![],
                    include_when: vec![],
                },
            ],
            json!({}),
        );
        let runtime = Runtime::new(graph, json!({"spec": {"name": "bar"}}));
        assert_eq!(runtime.resolve_desired("b").unwrap(), None);
    }

    #[test]
    fn resolve_desired_fills_in_template_once_dependency_observed() {
        let graph = build_graph(
            vec![
                ResourceTemplate {
                    id: "a".into(),
                    template: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                    ready_when: vec![],
                    include_when: vec![],
                },
                ResourceTemplate {
                    id: "b".into(),
                    template: json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"ref": "${a.status.id}"}}),
                    ready_when: vec![],
                    include_when: vec![],
                },
            ],
            json!({}),
        );
        let mut runtime = Runtime::new(graph, json!({"spec": {"name": "bar"}}));
        runtime.set_observed("a", json!({"status": {"id": "xyz"}}));
        let desired = runtime.resolve_desired("b").unwrap().unwrap();
        assert_eq!(desired["data"]["ref"], json!("xyz"));
    }

    #[test]
    fn standalone_expression_resolves_to_the_raw_value_type() {
        let graph = build_graph(
            vec![ResourceTemplate {
                id: "c1".into(),
                template: json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${schema.spec.name}"},
                }),
                ready_when: vec![],
                include_when: vec![],
            }],
            json!({}),
        );
        let runtime = Runtime::new(graph, json!({"spec": {"name": "bar"}}));
        let desired = runtime.resolve_desired("c1").unwrap().unwrap();
        assert_eq!(desired["metadata"]["name"], json!("bar"));
    }

    #[test]
    fn aggregate_state_is_active_only_when_all_synced_or_skipped() {
        let graph = build_graph(
            vec![
                ResourceTemplate { id: "a".into(), template: json!({"apiVersion": "v1", "kind": "ConfigMap"}), ready_when: vec![], include_when: vec![] },
                ResourceTemplate { id: "b".into(), template: json!({"apiVersion": "v1", "kind": "ConfigMap"}), ready_when: vec![], include_when: vec![] },
            ],
            json!({}),
        );
        let mut runtime = Runtime::new(graph, json!({}));
        assert_eq!(runtime.aggregate_state(), InstanceState::InProgress);
        runtime.set_state("a", ResourceState::Synced);
        runtime.set_state("b", ResourceState::Skipped);
        assert_eq!(runtime.aggregate_state(), InstanceState::Active);
        runtime.set_state("b", ResourceState::Error("boom".into()));
        assert_eq!(runtime.aggregate_state(), InstanceState::Failed);
    }

    #[test]
    fn include_when_false_marks_resource_excluded() {
        let graph = build_graph(
            vec![ResourceTemplate {
                id: "a".into(),
                template: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                ready_when: vec![],
                include_when: vec!["schema.spec.enabled".to_string()],
            }],
            json!({}),
        );
        let runtime = Runtime::new(graph, json!({"spec": {"name": "bar", "enabled": false}}));
        assert!(!runtime.evaluate_include_when("a"));
    }

    #[test]
    fn status_template_resolves_once_dependency_observed() {
        let graph = build_graph(
            vec![ResourceTemplate {
                id: "a".into(),
                template: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                ready_when: vec![],
                include_when: vec![],
            }],
            json!({"url": "${a.status.url}"}),
        );
        let mut runtime = Runtime::new(graph, json!({}));
        assert_eq!(runtime.resolve_status().unwrap(), None);
        runtime.set_observed("a", json!({"status": {"url": "http://x"}}));
        let status = runtime.resolve_status().unwrap().unwrap();
        assert_eq!(status["url"], json!("http://x"));
    }
}
