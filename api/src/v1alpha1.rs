//! Module `v1alpha1` implements the v1alpha1 `ResourceGraphDefinition` CRD.
use std::collections::BTreeMap;

use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ResourceGraphDefinitionSpec is the user-authored declaration of a parent
/// kind plus the child resources an instance of that kind expands to.
#[derive(
    KubeSchema, Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize, Validate,
)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    namespaced,
    status = "ResourceGraphDefinitionStatus",
    shortname = "rgd",
    category = "kro",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Schema describes the parent kind this definition derives: its GVK
    /// plus the shorthand spec/status shapes the Schema Compiler expands.
    #[validate(nested)]
    pub schema: RgdSchema,
    /// Resources is the ordered list of child declarations. Order here is
    /// authoring convenience only; actual creation order is the derived
    /// topological order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDeclaration>,
    /// DefaultServiceAccounts maps a namespace (or the `*` wildcard) to a
    /// service account name the instance reconciler should impersonate when
    /// acting on children in that namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service_accounts: Option<BTreeMap<String, String>>,
}

/// RgdSchema names the parent kind and carries its shorthand spec/status
/// shapes, opaque here because their grammar is only meaningful to the
/// schema compiler.
#[derive(Clone, Default, Debug, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct RgdSchema {
    /// Group for the derived parent kind. Defaults to this CRD's own group
    /// (`kro.run`) when left unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// ApiVersion for the derived parent kind, e.g. `v1alpha1`.
    pub api_version: String,
    /// Kind for the derived parent kind, e.g. `WebApp`.
    pub kind: String,
    /// Spec is the shorthand type schema for the parent's `spec`.
    #[schemars(schema_with = "schema::any")]
    pub spec: Value,
    /// Status is the shorthand type schema for the parent's `status`,
    /// before the universal `state`/`conditions` augmentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::any")]
    pub status: Option<Value>,
}

/// ResourceDeclaration is one child resource inside the graph.
#[derive(Clone, Default, Debug, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDeclaration {
    /// Id uniquely identifies this resource within the graph; referenced by
    /// other resources' expressions as `<id>.status...`/`<id>.spec...`.
    pub id: String,
    /// Template is the child object body, with `${ ... }` expressions
    /// embedded at any field.
    #[schemars(schema_with = "schema::any")]
    pub template: Value,
    /// ReadyWhen is a list of boolean expressions; the resource is
    /// considered ready only once all of them evaluate true.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready_when: Vec<String>,
    /// IncludeWhen is a list of boolean expressions evaluated before
    /// creation; if any evaluates false, the resource is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_when: Vec<String>,
}

/// ResourceGraphDefinitionStatus reports the result of compiling the graph.
#[derive(Clone, Default, Debug, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// State is `Active` once the graph compiled, the CRD is established,
    /// and the DMC is serving it; `Inactive` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// TopologicalOrder is the resource id order the instance reconciler
    /// processes children in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topological_order: Vec<String>,
    /// Resources reports, per declared id, the ids it depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    /// Conditions: `GraphVerified`, `CustomResourceDefinitionSynced`,
    /// `ReconcilerReady`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
}

/// ResourceStatus reports one resource id's resolved dependency set.
#[derive(Clone, Default, Debug, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
}

/// DependencyRef names one resource id another resource depends on.
#[derive(Clone, Default, Debug, Deserialize, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    pub id: String,
}

mod schema {
    use k8s_openapi::apimachinery::pkg::apis::meta;
    use schemars::{Schema, generate::SchemaGenerator};
    use serde_json::json;

    /// An open-ended schema for fields whose grammar (shorthand types,
    /// expression templates) is only meaningful to the schema compiler and
    /// graph builder, not to OpenAPI validation at admission time.
    pub fn any(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<serde_json::Value>();
        schema
            .ensure_object()
            .entry("x-kubernetes-preserve-unknown-fields")
            .or_insert_with(|| json!(true));
        schema
    }

    pub fn conditions(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<Vec<meta::v1::Condition>>();

        schema
            .ensure_object()
            .entry("x-kubernetes-list-type")
            .or_insert_with(|| json!("map"));
        schema
            .ensure_object()
            .entry("x-kubernetes-list-map-keys")
            .or_insert_with(|| json!(["type"]));
        schema
            .ensure_object()
            .insert("items".into(), condition(generator).into());

        schema
    }

    pub fn condition(generator: &mut SchemaGenerator) -> Schema {
        let mut schema = generator.subschema_for::<meta::v1::Condition>();

        schema.ensure_object().entry("required").or_insert_with(|| {
            json!(["type", "status", "lastTransitionTime", "reason", "message"])
        });

        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{CustomResourceExt, Resource};

    #[test]
    fn crd_name_and_kind_are_well_formed() {
        assert_eq!(ResourceGraphDefinition::crd_name(), "resourcegraphdefinitions.kro.run");
        assert_eq!(ResourceGraphDefinition::kind(&()), "ResourceGraphDefinition");
    }

    #[test]
    fn default_spec_has_no_resources() {
        let spec = ResourceGraphDefinitionSpec::default();
        assert!(spec.resources.is_empty());
    }
}
