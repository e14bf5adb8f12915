//! Compiles the shorthand type grammar users write in a `ResourceGraphDefinition`'s
//! `schema.spec`/`schema.status` blocks into an OpenAPI v3 schema plus a synthetic
//! "emulated" value tree used for compile-time type checking of expressions.
//!
//! Shorthand grammar: a field is either a nested object (map of field name to
//! shorthand), or a string `<type>[ | marker=value ...]` where `<type>` is one
//! of `string`, `integer`, `boolean`, `float`, `[]<type>`, `map[string]<type>`.
//! Recognized markers: `default=<value>`, `required=true|false`,
//! `description="..."`, `enum=a,b,c`.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("field {path:?}: empty shorthand string")]
    EmptyType { path: String },
    #[error("field {path:?}: unknown type {ty:?}")]
    UnknownType { path: String, ty: String },
    #[error("field {path:?}: malformed marker {marker:?}")]
    MalformedMarker { path: String, marker: String },
    #[error("field {path:?}: shorthand must be a string or an object, got {kind}")]
    InvalidShape { path: String, kind: &'static str },
}

/// Result of compiling one shorthand block: the OpenAPI schema for it, and a
/// synthetic value tree with one representative leaf per declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub schema: JSONSchemaProps,
    pub emulated: Value,
}

/// Compiles a `schema.spec`-shaped shorthand object (a plain map of field name
/// to shorthand, with no top-level `state`/`conditions` augmentation).
pub fn compile(shorthand: &Value) -> Result<Compiled, SchemaError> {
    compile_field("", shorthand)
}

/// Compiles a `schema.status`-shaped shorthand object, appending the
/// universal `state` (string) and `conditions` (array of condition objects)
/// fields when the user hasn't already declared them.
pub fn compile_status(shorthand: &Value) -> Result<Compiled, SchemaError> {
    let mut obj = match shorthand {
        Value::Object(m) => m.clone(),
        other => {
            return Err(SchemaError::InvalidShape {
                path: "status".into(),
                kind: kind_name(other),
            });
        }
    };
    obj.entry("state".to_string()).or_insert_with(|| Value::String("string".into()));
    obj.entry("conditions".to_string())
        .or_insert_with(|| Value::String("[]condition".into()));
    compile_field("", &Value::Object(obj))
}

fn compile_field(path: &str, shorthand: &Value) -> Result<Compiled, SchemaError> {
    match shorthand {
        Value::Object(map) => compile_object(path, map),
        Value::String(s) => compile_type_string(path, s),
        other => Err(SchemaError::InvalidShape {
            path: path.to_string(),
            kind: kind_name(other),
        }),
    }
}

fn compile_object(path: &str, map: &Map<String, Value>) -> Result<Compiled, SchemaError> {
    let mut properties = BTreeMap::new();
    let mut emulated = Map::new();
    let mut required = Vec::new();

    for (key, value) in map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        let compiled = compile_field(&child_path, value)?;
        if compiled.schema.nullable != Some(true) {
            // `nullable` doubles here as "explicitly marked not-required";
            // everything else defaults to required, matching the donor
            // CRDs' preference for strict schemas over permissive ones.
            required.push(key.clone());
        }
        properties.insert(key.clone(), compiled.schema);
        emulated.insert(key.clone(), compiled.emulated);
    }

    let schema = JSONSchemaProps {
        type_: Some("object".to_string()),
        properties: Some(properties),
        required: if required.is_empty() { None } else { Some(required) },
        ..Default::default()
    };
    Ok(Compiled {
        schema,
        emulated: Value::Object(emulated),
    })
}

struct Markers {
    default: Option<Value>,
    required: Option<bool>,
    description: Option<String>,
    enum_values: Option<Vec<String>>,
}

fn compile_type_string(path: &str, raw: &str) -> Result<Compiled, SchemaError> {
    let mut parts = raw.split('|');
    let ty = parts.next().unwrap_or("").trim();
    if ty.is_empty() {
        return Err(SchemaError::EmptyType { path: path.to_string() });
    }
    let markers = parse_markers(path, parts)?;

    let (schema, emulated) = base_schema_for(path, ty, &markers)?;
    let mut schema = schema;
    if let Some(desc) = &markers.description {
        schema.description = Some(desc.clone());
    }
    if let Some(values) = &markers.enum_values {
        schema.enum_ = Some(values.iter().cloned().map(Value::String).collect());
    }
    if markers.required == Some(false) {
        schema.nullable = Some(true);
    }
    let emulated = markers.default.clone().unwrap_or(emulated);
    Ok(Compiled { schema, emulated })
}

fn parse_markers<'a>(
    path: &str,
    rest: impl Iterator<Item = &'a str>,
) -> Result<Markers, SchemaError> {
    let mut markers = Markers {
        default: None,
        required: None,
        description: None,
        enum_values: None,
    };
    for raw in rest {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (key, value) = raw.split_once('=').ok_or_else(|| SchemaError::MalformedMarker {
            path: path.to_string(),
            marker: raw.to_string(),
        })?;
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "default" => markers.default = Some(Value::String(value.to_string())),
            "required" => {
                markers.required = Some(value.parse().map_err(|_| SchemaError::MalformedMarker {
                    path: path.to_string(),
                    marker: raw.to_string(),
                })?)
            }
            "description" => markers.description = Some(value.to_string()),
            "enum" => markers.enum_values = Some(value.split(',').map(str::to_string).collect()),
            _ => {
                return Err(SchemaError::MalformedMarker {
                    path: path.to_string(),
                    marker: raw.to_string(),
                });
            }
        }
    }
    Ok(markers)
}

fn base_schema_for(
    path: &str,
    ty: &str,
    markers: &Markers,
) -> Result<(JSONSchemaProps, Value), SchemaError> {
    if ty == "condition" {
        return Ok((condition_schema(), condition_emulated()));
    }
    if let Some(inner) = ty.strip_prefix("[]") {
        let (item_schema, item_emulated) = base_schema_for(path, inner, &Markers {
            default: None,
            required: None,
            description: None,
            enum_values: None,
        })?;
        let schema = JSONSchemaProps {
            type_: Some("array".to_string()),
            items: Some(k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaPropsOrArray::Schema(Box::new(item_schema))),
            ..Default::default()
        };
        return Ok((schema, Value::Array(vec![item_emulated])));
    }
    if let Some(inner) = ty.strip_prefix("map[string]") {
        let (item_schema, item_emulated) = base_schema_for(path, inner, &Markers {
            default: None,
            required: None,
            description: None,
            enum_values: None,
        })?;
        let schema = JSONSchemaProps {
            type_: Some("object".to_string()),
            additional_properties: Some(
                k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaPropsOrBool::Schema(
                    Box::new(item_schema),
                ),
            ),
            ..Default::default()
        };
        let mut map = Map::new();
        map.insert("example".to_string(), item_emulated);
        return Ok((schema, Value::Object(map)));
    }
    match ty {
        "string" => Ok((
            JSONSchemaProps { type_: Some("string".into()), ..Default::default() },
            Value::String(String::new()),
        )),
        "integer" => Ok((
            JSONSchemaProps { type_: Some("integer".into()), ..Default::default() },
            Value::from(0i64),
        )),
        "boolean" => Ok((
            JSONSchemaProps { type_: Some("boolean".into()), ..Default::default() },
            Value::Bool(false),
        )),
        "float" => Ok((
            JSONSchemaProps { type_: Some("number".into()), ..Default::default() },
            Value::from(0.0f64),
        )),
        other => Err(SchemaError::UnknownType {
            path: path.to_string(),
            ty: other.to_string(),
        }),
    }
}

/// Schema for one entry of `status.conditions`, mirroring the standard
/// Kubernetes condition shape: `type`, `status`, `reason`, `message`,
/// `lastTransitionTime`, `observedGeneration`.
fn condition_schema() -> JSONSchemaProps {
    let string_prop = || JSONSchemaProps { type_: Some("string".into()), ..Default::default() };
    let mut properties = BTreeMap::new();
    properties.insert("type".to_string(), string_prop());
    properties.insert("status".to_string(), string_prop());
    properties.insert("reason".to_string(), string_prop());
    properties.insert("message".to_string(), string_prop());
    properties.insert("lastTransitionTime".to_string(), string_prop());
    properties.insert(
        "observedGeneration".to_string(),
        JSONSchemaProps { type_: Some("integer".into()), format: Some("int64".into()), ..Default::default() },
    );
    JSONSchemaProps {
        type_: Some("object".to_string()),
        required: Some(vec!["type".to_string(), "status".to_string()]),
        properties: Some(properties),
        ..Default::default()
    }
}

fn condition_emulated() -> Value {
    serde_json::json!({
        "type": "",
        "status": "Unknown",
        "reason": "",
        "message": "",
        "lastTransitionTime": "",
        "observedGeneration": 0,
    })
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiles_flat_scalar_fields() {
        let shorthand = json!({"name": "string", "replicas": "integer | default=1"});
        let compiled = compile(&shorthand).unwrap();
        assert_eq!(compiled.schema.type_.as_deref(), Some("object"));
        let props = compiled.schema.properties.unwrap();
        assert_eq!(props["name"].type_.as_deref(), Some("string"));
        assert_eq!(props["replicas"].type_.as_deref(), Some("integer"));
        assert_eq!(compiled.emulated["replicas"], json!("1"));
    }

    #[test]
    fn array_and_map_types_nest_correctly() {
        let shorthand = json!({"tags": "[]string", "labels": "map[string]string"});
        let compiled = compile(&shorthand).unwrap();
        let props = compiled.schema.properties.unwrap();
        assert_eq!(props["tags"].type_.as_deref(), Some("array"));
        assert_eq!(props["labels"].type_.as_deref(), Some("object"));
    }

    #[test]
    fn nested_object_shorthand_recurses() {
        let shorthand = json!({"spec": {"name": "string"}});
        let compiled = compile(&shorthand).unwrap();
        let props = compiled.schema.properties.unwrap();
        assert_eq!(props["spec"].type_.as_deref(), Some("object"));
    }

    #[test]
    fn status_is_augmented_with_state_and_conditions() {
        let shorthand = json!({"id": "string"});
        let compiled = compile_status(&shorthand).unwrap();
        let props = compiled.schema.properties.unwrap();
        assert!(props.contains_key("state"));
        assert!(props.contains_key("conditions"));
        assert_eq!(props["conditions"].type_.as_deref(), Some("array"));
    }

    #[test]
    fn status_augmentation_does_not_override_explicit_fields() {
        let shorthand = json!({"state": "string | enum=Ready,Failed"});
        let compiled = compile_status(&shorthand).unwrap();
        let props = compiled.schema.properties.unwrap();
        assert!(props["state"].enum_.is_some());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let shorthand = json!({"x": "frobnicator"});
        let err = compile(&shorthand).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType { .. }));
    }

    #[test]
    fn required_false_marks_field_nullable_and_excludes_from_required_list() {
        let shorthand = json!({"x": "string | required=false", "y": "string"});
        let compiled = compile(&shorthand).unwrap();
        let required = compiled.schema.required.unwrap();
        assert!(!required.contains(&"x".to_string()));
        assert!(required.contains(&"y".to_string()));
    }

    #[test]
    fn compiling_same_shorthand_twice_is_deterministic() {
        let shorthand = json!({"b": "string", "a": "integer"});
        let first = compile(&shorthand).unwrap();
        let second = compile(&shorthand).unwrap();
        assert_eq!(first, second);
    }
}
