//! CEL-backed implementation of the [`ExpressionEngine`] boundary.
//!
//! CEL is the language upstream KRO embeds for resource-graph expressions,
//! and it's already the language behind `x_kube(validation = ...)` admission
//! rules elsewhere in this workspace, so using it here keeps one expression
//! family across the codebase rather than introducing a second.

use std::sync::Arc;

use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::Value as JsonValue;

use crate::{CompiledExpr, Environment, ExprError, ExpressionEngine};

pub struct CelEngine;

impl CelEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine for CelEngine {
    fn compile(&self, expr: &str) -> Result<Arc<dyn CompiledExpr>, ExprError> {
        let program = Program::compile(expr).map_err(|e| ExprError::Compile {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        let references = program
            .references()
            .variables()
            .into_iter()
            .map(|v| v.to_string())
            .collect();
        Ok(Arc::new(CelExpr {
            source: expr.to_string(),
            program,
            references,
        }))
    }
}

struct CelExpr {
    source: String,
    program: Program,
    references: Vec<String>,
}

impl CompiledExpr for CelExpr {
    fn references(&self) -> &[String] {
        &self.references
    }

    fn eval(&self, env: &Environment) -> Result<JsonValue, ExprError> {
        let mut ctx = Context::default();
        for root in &self.references {
            let value = env.get(root).ok_or_else(|| ExprError::UnboundIdentifier {
                expr: self.source.clone(),
                ident: root.clone(),
            })?;
            ctx.add_variable_from_value(root.as_str(), json_to_cel(value));
        }
        let result = self.program.execute(&ctx).map_err(|e| ExprError::Eval {
            expr: self.source.clone(),
            message: e.to_string(),
        })?;
        Ok(cel_to_json(result))
    }
}

fn json_to_cel(value: &JsonValue) -> CelValue {
    match value {
        JsonValue::Null => CelValue::Null,
        JsonValue::Bool(b) => CelValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CelValue::Int(i)
            } else {
                CelValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => CelValue::String(Arc::new(s.clone())),
        JsonValue::Array(items) => CelValue::List(Arc::new(items.iter().map(json_to_cel).collect())),
        JsonValue::Object(map) => {
            let mut out = std::collections::HashMap::new();
            for (k, v) in map {
                out.insert(k.clone().into(), json_to_cel(v));
            }
            CelValue::Map(out.into())
        }
    }
}

fn cel_to_json(value: CelValue) -> JsonValue {
    match value {
        CelValue::Null => JsonValue::Null,
        CelValue::Bool(b) => JsonValue::Bool(b),
        CelValue::Int(i) => JsonValue::from(i),
        CelValue::UInt(u) => JsonValue::from(u),
        CelValue::Float(f) => serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        CelValue::String(s) => JsonValue::String((*s).clone()),
        CelValue::Bytes(b) => JsonValue::String(String::from_utf8_lossy(&b).to_string()),
        CelValue::List(items) => JsonValue::Array(items.iter().cloned().map(cel_to_json).collect()),
        CelValue::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map.map.iter() {
                obj.insert(k.to_string(), cel_to_json(v.clone()));
            }
            JsonValue::Object(obj)
        }
        _ => JsonValue::Null,
    }
}
