//! Walks a resource graph definition's parent schema and child templates,
//! locates expressions, infers dependencies between children, type-checks
//! referenced fields, and assembles the compiled, immutable [`Graph`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceValidation,
    JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kro_expr::{CompiledExpr, ExpressionEngine, Segment};
use serde_json::Value;
use thiserror::Error;

/// Group/version/resource identifying a kind on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// Group/version/kind, used for the parent and for pre-plural child lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn to_gvr(&self) -> Gvr {
        Gvr {
            group: self.group.clone(),
            version: self.version.clone(),
            resource: pluralize(&self.kind.to_lowercase()),
        }
    }
}

/// Label keys the instance reconciler stamps onto every managed child (`spec.md` §6). A
/// resource template that declares one of these itself under `metadata.labels` collides with
/// the reconciler's own labeler and is rejected at graph-build time rather than silently
/// overwritten at reconcile time.
const RESERVED_LABEL_KEYS: &[&str] = &[
    "kro.run/owned",
    "kro.run/kro-version",
    "kro.run/resource-graph-definition-id",
    "kro.run/resource-graph-definition-name",
    "kro.run/instance-id",
    "kro.run/instance-name",
    "kro.run/instance-namespace",
];

fn pluralize(lower_kind: &str) -> String {
    if lower_kind.ends_with('s') || lower_kind.ends_with("sh") || lower_kind.ends_with("ch") {
        format!("{lower_kind}es")
    } else if let Some(stem) = lower_kind.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower_kind}s")
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("schema: {0}")]
    Schema(#[from] kro_schema::SchemaError),
    #[error("resource {id:?}: failed to compile expression {expr:?}: {message}")]
    Compile { id: String, expr: String, message: String },
    #[error("resource {id:?}: field {path:?} references unknown identifier {ident:?}")]
    UnknownReference { id: String, path: String, ident: String },
    #[error("resource {id:?}: field {path:?} expected {expected} but expression yields a complex value in a concatenated field")]
    TypeMismatch { id: String, path: String, expected: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("duplicate resource id {0:?}")]
    DuplicateId(String),
    #[error("label key {0:?} is produced by more than one labeler")]
    DuplicateLabelKey(String),
}

/// One `${ ... }` occurrence found while walking a template, plus the
/// context needed to re-evaluate it once sibling state is observed.
pub struct FieldDescriptor {
    pub path: String,
    pub segments: Vec<Segment>,
    pub standalone: bool,
    pub compiled: Vec<Arc<dyn CompiledExpr>>,
}

impl std::fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("path", &self.path)
            .field("segments", &self.segments)
            .field("standalone", &self.standalone)
            .finish()
    }
}

/// An immutable description of one resource in the graph: a child, or (via
/// [`Graph::parent`]) the instance kind itself.
pub struct Resource {
    pub id: String,
    pub gvk: Gvk,
    pub gvr: Gvr,
    pub namespaced: bool,
    pub template: Value,
    pub fields: Vec<FieldDescriptor>,
    pub dependencies: BTreeSet<String>,
    pub ready_when: Vec<Arc<dyn CompiledExpr>>,
    pub include_when: Vec<Arc<dyn CompiledExpr>>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("gvk", &self.gvk)
            .field("namespaced", &self.namespaced)
            .field("dependencies", &self.dependencies)
            .field("fields", &self.fields)
            .finish()
    }
}

/// The compiled, immutable output of [`GraphBuilder::build`]. Replaced whole
/// whenever the owning resource graph definition changes; never mutated.
pub struct Graph {
    pub parent_gvk: Gvk,
    pub parent_schema: JSONSchemaProps,
    pub parent_emulated: Value,
    pub derived_crd: CustomResourceDefinition,
    pub resources: BTreeMap<String, Resource>,
    pub topological_order: Vec<String>,
    pub status_template: Value,
    pub status_fields: Vec<FieldDescriptor>,
    pub status_dependencies: BTreeSet<String>,
}

impl Graph {
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }
}

/// One child declaration as authored in a resource graph definition.
#[derive(Debug, Clone)]
pub struct ResourceTemplate {
    pub id: String,
    pub template: Value,
    pub ready_when: Vec<String>,
    pub include_when: Vec<String>,
}

/// The subset of a resource graph definition's fields the builder needs.
/// Kept independent of the `api` crate's CRD type so this crate can be
/// tested without a `kube`/CRD dependency.
#[derive(Debug, Clone)]
pub struct RgdInput {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub spec_schema: Value,
    pub status_schema: Value,
    pub resources: Vec<ResourceTemplate>,
    /// Expression-bearing object merged into the instance's `status` once
    /// its dependencies are observed (e.g. `{"url": "${c1.status.url}"}`).
    /// Not part of the shorthand type schema: this is evaluated per
    /// reconcile, the way child templates are.
    pub status_template: Value,
}

pub struct GraphBuilder<'a> {
    engine: &'a dyn ExpressionEngine,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(engine: &'a dyn ExpressionEngine) -> Self {
        Self { engine }
    }

    pub fn build(&self, input: &RgdInput) -> Result<Graph, GraphError> {
        // Step 1+2: parent schema + emulated object.
        let compiled_spec = kro_schema::compile(&input.spec_schema)?;
        let compiled_status = kro_schema::compile_status(&input.status_schema)?;
        let parent_emulated = serde_json::json!({
            "spec": compiled_spec.emulated,
            "status": compiled_status.emulated,
        });
        let mut parent_properties = BTreeMap::new();
        parent_properties.insert("spec".to_string(), compiled_spec.schema.clone());
        parent_properties.insert("status".to_string(), compiled_status.schema.clone());
        let parent_schema = JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(parent_properties),
            ..Default::default()
        };

        let parent_gvk = Gvk {
            group: input.group.clone(),
            version: input.version.clone(),
            kind: input.kind.clone(),
        };

        // Known ids, used to distinguish a dynamic dependency from an
        // actually-unknown reference while walking expressions.
        let mut known_ids = BTreeSet::new();
        for r in &input.resources {
            if !known_ids.insert(r.id.clone()) {
                return Err(GraphError::DuplicateId(r.id.clone()));
            }
        }

        // Step 3-5: walk each child template, collect field descriptors and
        // dependencies.
        let mut resources = BTreeMap::new();
        for tmpl in &input.resources {
            let resource = self.build_resource(tmpl, &known_ids)?;
            for field in &resource.fields {
                check_concatenated_field_is_scalar(&resource.id, field, &parent_emulated)?;
            }
            resources.insert(resource.id.clone(), resource);
        }

        // Step 6: assemble + sort the DAG.
        let mut dag = kro_dag::Dag::new();
        for id in resources.keys() {
            dag.add_node(id.clone()).map_err(|_| GraphError::DuplicateId(id.clone()))?;
        }
        for (id, resource) in &resources {
            for dep in &resource.dependencies {
                dag.add_edge(id, dep).expect("dependency already validated against known ids");
            }
        }
        let topological_order = dag.topological_sort().map_err(|e| match e {
            kro_dag::DagError::CycleDetected(cycle) => GraphError::Cycle(cycle),
            other => GraphError::Cycle(vec![other.to_string()]),
        })?;

        let derived_crd = derive_crd(&parent_gvk, &parent_schema);

        let mut status_fields = Vec::new();
        let mut status_dependencies = BTreeSet::new();
        walk_template(
            "status",
            "status",
            &input.status_template,
            self.engine,
            &known_ids,
            &mut status_fields,
            &mut status_dependencies,
        )?;

        // Step 7: type-check status fields against the compiled status schema. Only fields
        // whose expressions reference nothing but `schema` can be checked before any child
        // exists to observe; other resources have no emulated placeholder to evaluate against.
        for field in &status_fields {
            check_status_field_type(&compiled_status.schema, field, &parent_emulated)?;
        }

        Ok(Graph {
            parent_gvk,
            parent_schema,
            parent_emulated,
            derived_crd,
            resources,
            topological_order,
            status_template: input.status_template.clone(),
            status_fields,
            status_dependencies,
        })
    }

    fn build_resource(
        &self,
        tmpl: &ResourceTemplate,
        known_ids: &BTreeSet<String>,
    ) -> Result<Resource, GraphError> {
        let gvk = gvk_of_template(&tmpl.id, &tmpl.template)?;
        let gvr = gvk.to_gvr();
        // Children default to namespaced; cluster-scoped child kinds are not
        // distinguished from the template alone in this version.
        let namespaced = true;

        check_reserved_label_keys(&tmpl.template)?;

        let mut fields = Vec::new();
        let mut dependencies = BTreeSet::new();
        walk_template(&tmpl.id, "", &tmpl.template, self.engine, known_ids, &mut fields, &mut dependencies)?;

        let ready_when = tmpl
            .ready_when
            .iter()
            .map(|expr| {
                self.compile_and_track(&tmpl.id, expr, known_ids, &mut dependencies)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let include_when = tmpl
            .include_when
            .iter()
            .map(|expr| {
                self.compile_and_track(&tmpl.id, expr, known_ids, &mut dependencies)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Resource {
            id: tmpl.id.clone(),
            gvk,
            gvr,
            namespaced,
            template: tmpl.template.clone(),
            fields,
            dependencies,
            ready_when,
            include_when,
        })
    }

    fn compile_and_track(
        &self,
        id: &str,
        expr: &str,
        known_ids: &BTreeSet<String>,
        dependencies: &mut BTreeSet<String>,
    ) -> Result<Arc<dyn CompiledExpr>, GraphError> {
        let compiled = self.engine.compile(expr).map_err(|e| GraphError::Compile {
            id: id.to_string(),
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        record_dependencies(id, expr, compiled.references(), known_ids, dependencies)?;
        Ok(compiled)
    }
}

fn record_dependencies(
    id: &str,
    expr: &str,
    references: &[String],
    known_ids: &BTreeSet<String>,
    dependencies: &mut BTreeSet<String>,
) -> Result<(), GraphError> {
    for root in references {
        if root == "schema" {
            continue; // static reference to the parent; no edge.
        }
        if root == id {
            // Self-reference: not meaningful as a dependency edge.
            continue;
        }
        if !known_ids.contains(root) {
            return Err(GraphError::UnknownReference {
                id: id.to_string(),
                path: expr.to_string(),
                ident: root.clone(),
            });
        }
        dependencies.insert(root.clone());
    }
    Ok(())
}

/// Rejects a template that declares one of the reconciler's reserved label keys under
/// `metadata.labels`, per `spec.md` §6 ("duplicate keys across labelers are a build-time
/// error").
fn check_reserved_label_keys(template: &Value) -> Result<(), GraphError> {
    let Some(declared) = template.pointer("/metadata/labels").and_then(Value::as_object) else {
        return Ok(());
    };
    for key in declared.keys() {
        if RESERVED_LABEL_KEYS.contains(&key.as_str()) {
            return Err(GraphError::DuplicateLabelKey(key.clone()));
        }
    }
    Ok(())
}

fn walk_template(
    id: &str,
    path: &str,
    value: &Value,
    engine: &dyn ExpressionEngine,
    known_ids: &BTreeSet<String>,
    fields: &mut Vec<FieldDescriptor>,
    dependencies: &mut BTreeSet<String>,
) -> Result<(), GraphError> {
    match value {
        Value::String(s) => {
            let segments = kro_expr::scan(s);
            if !kro_expr::has_expression(&segments) {
                return Ok(());
            }
            let standalone = matches!(kro_expr::classify(&segments), kro_expr::FieldShape::Standalone);
            let mut compiled = Vec::new();
            for segment in &segments {
                if let Segment::Expression(expr) = segment {
                    let program = engine.compile(expr).map_err(|e| GraphError::Compile {
                        id: id.to_string(),
                        expr: expr.clone(),
                        message: e.to_string(),
                    })?;
                    record_dependencies(id, expr, program.references(), known_ids, dependencies)?;
                    compiled.push(program);
                }
            }
            fields.push(FieldDescriptor {
                path: path.to_string(),
                segments,
                standalone,
                compiled,
            });
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let child_path = format!("{path}[{i}]");
                walk_template(id, &child_path, item, engine, known_ids, fields, dependencies)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, v) in map {
                let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                walk_template(id, &child_path, v, engine, known_ids, fields, dependencies)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Looks up the OpenAPI type at a dot-separated path under `schema`. Returns `None` (meaning
/// "cannot check") once the path crosses an array index, since `FieldDescriptor::path` encodes
/// array elements as `[i]` and per-element schema identity isn't tracked here.
fn schema_type_at<'a>(schema: &'a JSONSchemaProps, path: &str) -> Option<&'a str> {
    let mut current = schema;
    for token in path.split('.') {
        if token.is_empty() {
            continue;
        }
        if token.contains('[') {
            return None;
        }
        current = current.properties.as_ref()?.get(token)?;
    }
    current.type_.as_deref()
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Rejects a concatenated resource-template field whose expression evaluates, against the
/// emulated parent alone, to a complex (array/object) value. Resource templates have no
/// declared OpenAPI schema to check a *standalone* field's result against — children are
/// arbitrary cluster kinds (`ConfigMap`, `Deployment`, ...) whose field types this builder has
/// no schema for and is not responsible for knowing (`spec.md` §1 marks the cluster API
/// out-of-scope) — but concatenation always produces a string, so embedding a complex value in
/// one is a schema-independent bug regardless of what the target field's real type is. This is
/// the resource-template half of the step-7 invariant; [`check_status_field_type`] covers the
/// status half, which does have a declared schema to check standalone fields against too.
fn check_concatenated_field_is_scalar(
    id: &str,
    field: &FieldDescriptor,
    parent_emulated: &Value,
) -> Result<(), GraphError> {
    if field.standalone {
        return Ok(());
    }
    for compiled in &field.compiled {
        if compiled.references().is_empty() || !compiled.references().iter().all(|r| r == "schema") {
            continue;
        }
        let mut env = kro_expr::Environment::new();
        env.bind("schema", parent_emulated.clone());
        let Ok(value) = compiled.eval(&env) else { continue };
        if matches!(value, Value::Array(_) | Value::Object(_)) {
            return Err(GraphError::TypeMismatch {
                id: id.to_string(),
                path: field.path.clone(),
                expected: "string".to_string(),
            });
        }
    }
    Ok(())
}

fn check_status_field_type(
    status_schema: &JSONSchemaProps,
    field: &FieldDescriptor,
    parent_emulated: &Value,
) -> Result<(), GraphError> {
    let relative = field.path.strip_prefix("status").unwrap_or(&field.path);
    let relative = relative.strip_prefix('.').unwrap_or(relative);
    let Some(expected) = schema_type_at(status_schema, relative) else {
        return Ok(());
    };

    if !field.standalone {
        // A concatenated field's result is always a string; any non-string target is a
        // mismatch regardless of what the embedded expressions evaluate to.
        if expected != "string" {
            return Err(GraphError::TypeMismatch {
                id: "status".to_string(),
                path: field.path.clone(),
                expected: expected.to_string(),
            });
        }
        return Ok(());
    }

    let Some(compiled) = field.compiled.first() else { return Ok(()) };
    if compiled.references().is_empty() || !compiled.references().iter().all(|r| r == "schema") {
        return Ok(());
    }
    let mut env = kro_expr::Environment::new();
    env.bind("schema", parent_emulated.clone());
    let Ok(value) = compiled.eval(&env) else { return Ok(()) };
    let actual = json_type_name(&value);
    let compatible = actual == expected
        || actual == "null"
        || (expected == "number" && actual == "integer");
    if !compatible {
        return Err(GraphError::TypeMismatch {
            id: "status".to_string(),
            path: field.path.clone(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

fn gvk_of_template(id: &str, template: &Value) -> Result<Gvk, GraphError> {
    let api_version = template
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Compile {
            id: id.to_string(),
            expr: "apiVersion".to_string(),
            message: "template is missing apiVersion".to_string(),
        })?;
    let kind = template
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Compile {
            id: id.to_string(),
            expr: "kind".to_string(),
            message: "template is missing kind".to_string(),
        })?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(Gvk { group, version, kind: kind.to_string() })
}

fn derive_crd(gvk: &Gvk, schema: &JSONSchemaProps) -> CustomResourceDefinition {
    let plural = pluralize(&gvk.kind.to_lowercase());
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{plural}.{}", gvk.group)),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: gvk.group.clone(),
            names: CustomResourceDefinitionNames {
                plural: plural.clone(),
                singular: Some(gvk.kind.to_lowercase()),
                kind: gvk.kind.clone(),
                list_kind: Some(format!("{}List", gvk.kind)),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: gvk.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation { open_apiv3_schema: Some(schema.clone()) }),
                subresources: Some(k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceSubresources {
                    status: Some(k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceSubresourceStatus {}),
                    ..Default::default()
                }),
                additional_printer_columns: default_printer_columns(),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

fn default_printer_columns() -> Option<Vec<CustomResourceColumnDefinition>> {
    Some(vec![CustomResourceColumnDefinition {
        name: "State".to_string(),
        type_: "string".to_string(),
        json_path: ".status.state".to_string(),
        ..Default::default()
    }])
}
