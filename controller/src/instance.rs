//! Instance reconciles one observed object of a `ResourceGraphDefinition`-derived kind: it builds
//! a fresh [`Runtime`] from the compiled [`Graph`], walks the dependency order creating, updating
//! and waiting on child resources, and mirrors aggregate/per-child state back onto the instance's
//! status. Registered with the [`crate::dmc::Dmc`] as a [`Handler`] bound to one compiled graph.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kro_graph::{Graph, Resource as ChildResource};
use kro_runtime::{InstanceState, ResourceState, Runtime};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, Patch};
use serde_json::{Value, json};
use tracing::{error, instrument, warn};

use crate::{
    CREATE_PARAMS, Context, DEFAULT_REQUEUE, Error, FINALIZER, KRO_VERSION, PATCH_PARAMS, Result,
    dmc::{Handler, HandlerOutcome, ObjectIdentifiers},
    impersonate, labels,
    prelude::condition,
};

/// Binding carries everything an instance handler needs about one compiled RGD: the graph
/// itself, identity for the labels stamped onto every child, and the per-namespace service
/// account mapping used for impersonation.
pub struct Binding {
    /// Graph is the compiled dependency graph for this RGD's generation.
    pub graph: Arc<Graph>,
    /// ApiResource describes the emulated parent kind served by the DMC.
    pub api_resource: ApiResource,
    /// RgdName is the owning ResourceGraphDefinition's name, stamped as a label on children.
    pub rgd_name: String,
    /// RgdUid is the owning ResourceGraphDefinition's uid, stamped as a label on children.
    pub rgd_uid: String,
    /// DefaultServiceAccounts maps an instance namespace (or `"*"`) to the service account used
    /// to impersonate when reconciling resources in that namespace.
    pub default_service_accounts: BTreeMap<String, String>,
}

/// Handler builds the [`Handler`] closure the DMC invokes for every observed event on this
/// binding's parent GVR.
pub fn handler(ctx: Arc<Context>, binding: Arc<Binding>) -> Handler {
    Arc::new(move |ids: ObjectIdentifiers| {
        let ctx = ctx.clone();
        let binding = binding.clone();
        Box::pin(async move { reconcile(ctx, binding, ids).await })
            as BoxFuture<'static, Result<HandlerOutcome>>
    })
}

#[instrument(skip(ctx, binding), fields(trace_id, gvr = ?ids.gvr, key = %ids.namespaced_key))]
async fn reconcile(
    ctx: Arc<Context>,
    binding: Arc<Binding>,
    ids: ObjectIdentifiers,
) -> Result<HandlerOutcome> {
    let trace_id = crate::telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
    }
    ctx.metrics.reconcile.runs.increment(1);

    let (namespace, name) = split_key(&ids.namespaced_key);
    let api = namespaced_api(&ctx.client, &binding.api_resource, namespace);

    let Some(instance) = api.get_opt(name).await? else {
        return Ok(HandlerOutcome::Done);
    };

    let observed_parent = serde_json::to_value(&instance)?;
    let mut runtime = Runtime::new(binding.graph.clone(), observed_parent);

    let flow = if instance.metadata.deletion_timestamp.is_some() {
        deletion_flow(&ctx, &binding, &api, &instance, &mut runtime).await
    } else {
        reconciliation_flow(&ctx, &binding, &api, &instance, &mut runtime).await
    };

    let outcome = match flow {
        Ok(outcome) => outcome,
        Err(err) => {
            ctx.metrics.reconcile.failures.increment(1);
            error!(error = %err, "instance reconcile failed");
            HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE)
        }
    };

    if let Err(err) = write_status(&binding, &api, &instance, &runtime).await {
        error!(error = %err, "failed to write instance status");
    }

    Ok(outcome)
}

fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

fn namespaced_api(
    client: &kube::Client,
    ar: &ApiResource,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
        None => Api::all_with(client.clone(), ar),
    }
}

fn api_resource_for(resource: &ChildResource) -> ApiResource {
    let api_version = if resource.gvr.group.is_empty() {
        resource.gvr.version.clone()
    } else {
        format!("{}/{}", resource.gvr.group, resource.gvr.version)
    };
    ApiResource {
        group: resource.gvr.group.clone(),
        version: resource.gvr.version.clone(),
        api_version,
        kind: resource.gvk.kind.clone(),
        plural: resource.gvr.resource.clone(),
    }
}

fn dynamic_api_for(
    client: &kube::Client,
    resource: &ChildResource,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    let ar = api_resource_for(resource);
    match namespace {
        Some(ns) if resource.namespaced => Api::namespaced_with(client.clone(), ns, &ar),
        _ => Api::all_with(client.clone(), &ar),
    }
}

fn resolve_child_namespace(desired: &Value, parent_namespace: Option<&str>) -> String {
    desired
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| parent_namespace.map(String::from))
        .unwrap_or_else(|| "default".to_string())
}

async fn client_for(
    ctx: &Context,
    mapping: &BTreeMap<String, String>,
    namespace: Option<&str>,
) -> Result<kube::Client> {
    let service_account = namespace
        .and_then(|ns| mapping.get(ns))
        .or_else(|| mapping.get("*"));
    let Some(service_account) = service_account else {
        return Ok(ctx.client.clone());
    };
    let ns = namespace.unwrap_or("default");
    let principal = impersonate::principal(ns, service_account).map_err(|e| {
        ctx.metrics.dmc.record_impersonation_error(&e);
        Error::Impersonation(e)
    })?;
    impersonate::build(&ctx.base_config, &principal).map_err(|e| {
        ctx.metrics.dmc.record_impersonation_error(&e);
        Error::Impersonation(e)
    })
}

fn apply_child_labels(
    desired: &mut Value,
    binding: &Binding,
    instance: &DynamicObject,
) {
    if !desired["metadata"]["labels"].is_object() {
        desired["metadata"]["labels"] = json!({});
    }
    let map = desired["metadata"]["labels"]
        .as_object_mut()
        .expect("just ensured object");
    map.insert(labels::OWNED.to_string(), json!("true"));
    map.insert(labels::KRO_VERSION.to_string(), json!(KRO_VERSION));
    map.insert(
        labels::RESOURCE_GRAPH_DEFINITION_ID.to_string(),
        json!(binding.rgd_uid),
    );
    map.insert(
        labels::RESOURCE_GRAPH_DEFINITION_NAME.to_string(),
        json!(binding.rgd_name),
    );
    map.insert(
        labels::INSTANCE_ID.to_string(),
        json!(instance.metadata.uid.clone().unwrap_or_default()),
    );
    map.insert(
        labels::INSTANCE_NAME.to_string(),
        json!(instance.metadata.name.clone().unwrap_or_default()),
    );
    if let Some(ns) = &instance.metadata.namespace {
        map.insert(labels::INSTANCE_NAMESPACE.to_string(), json!(ns));
    }
}

fn carry_server_managed_fields(desired: &mut Value, observed: &Value) {
    if let Some(rv) = observed.pointer("/metadata/resourceVersion") {
        desired["metadata"]["resourceVersion"] = rv.clone();
    }
    if let Some(f) = observed.pointer("/metadata/finalizers") {
        desired["metadata"]["finalizers"] = f.clone();
    }
}

async fn ensure_finalizer_and_labels(
    binding: &Binding,
    api: &Api<DynamicObject>,
    instance: &DynamicObject,
) -> Result<()> {
    let name = instance
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingName("instance"))?;

    let mut finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
    let have_finalizer = finalizers.iter().any(|f| f == FINALIZER);
    if !have_finalizer {
        finalizers.push(FINALIZER.to_string());
    }

    let mut instance_labels: BTreeMap<String, String> = instance
        .metadata
        .labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    instance_labels.insert(labels::KRO_VERSION.to_string(), KRO_VERSION.to_string());
    instance_labels.insert(
        labels::RESOURCE_GRAPH_DEFINITION_ID.to_string(),
        binding.rgd_uid.clone(),
    );
    instance_labels.insert(
        labels::RESOURCE_GRAPH_DEFINITION_NAME.to_string(),
        binding.rgd_name.clone(),
    );

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "labels": instance_labels,
        }
    });
    api.patch(&name, &PATCH_PARAMS, &Patch::Merge(patch)).await?;
    Ok(())
}

/// Reconciliation_flow implements `spec.md` §4.5.1: ensure the finalizer, then walk the
/// topological order creating, reading and (when drifted) updating each child in turn, stopping
/// at the first id that isn't fully synced this pass.
async fn reconciliation_flow(
    ctx: &Context,
    binding: &Binding,
    api: &Api<DynamicObject>,
    instance: &DynamicObject,
    runtime: &mut Runtime,
) -> Result<HandlerOutcome> {
    ensure_finalizer_and_labels(binding, api, instance).await?;

    let parent_namespace = instance.metadata.namespace.clone();
    let mut outcome = HandlerOutcome::Done;

    for id in binding.graph.topological_order.clone() {
        if !runtime.evaluate_include_when(&id) {
            runtime.set_state(&id, ResourceState::Skipped);
            continue;
        }

        let Some(desired) = runtime.resolve_desired(&id)? else {
            runtime.set_state(&id, ResourceState::InProgress);
            outcome = HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE);
            break;
        };

        let resource = binding
            .graph
            .resource(&id)
            .expect("id from topological order exists in the graph");
        let child_namespace = resource
            .namespaced
            .then(|| resolve_child_namespace(&desired, parent_namespace.as_deref()));
        let client = client_for(
            ctx,
            &binding.default_service_accounts,
            child_namespace.as_deref(),
        )
        .await?;
        let child_api = dynamic_api_for(&client, resource, child_namespace.as_deref());

        let Some(child_name) = desired
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(String::from)
        else {
            return Err(Error::MissingName("child resource"));
        };

        match child_api.get_opt(&child_name).await? {
            None => {
                let mut desired = desired;
                apply_child_labels(&mut desired, binding, instance);
                if resource.namespaced && child_namespace.as_deref() == parent_namespace.as_deref()
                {
                    set_owner_reference(&mut desired, instance);
                }
                let obj: DynamicObject = serde_json::from_value(desired)?;
                child_api.create(&CREATE_PARAMS, &obj).await?;
                runtime.set_state(&id, ResourceState::Created);
                outcome = HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE);
                break;
            }
            Some(observed) => {
                let observed_value = serde_json::to_value(&observed)?;
                runtime.set_observed(&id, observed_value.clone());

                if !runtime.evaluate_ready_when(&id) {
                    runtime.set_state(&id, ResourceState::WaitingForReadiness);
                    outcome = HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE);
                    break;
                }

                // Re-resolve now that this id's own observed value is bound, in case a later
                // field in this same template references it (rare, but cheap to support).
                let Some(desired) = runtime.resolve_desired(&id)? else {
                    runtime.set_state(&id, ResourceState::InProgress);
                    outcome = HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE);
                    break;
                };

                let cleaned_observed = kro_delta::clean_metadata(observed_value.clone());
                let diffs = kro_delta::compare(&desired, &cleaned_observed);
                if diffs.is_empty() {
                    runtime.set_state(&id, ResourceState::Synced);
                    continue;
                }

                let mut desired = desired;
                apply_child_labels(&mut desired, binding, instance);
                carry_server_managed_fields(&mut desired, &observed_value);
                let obj: DynamicObject = serde_json::from_value(desired)?;
                child_api.replace(&child_name, &CREATE_PARAMS, &obj).await?;
                runtime.set_state(&id, ResourceState::Updating);
                outcome = HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE);
                break;
            }
        }
    }

    Ok(outcome)
}

fn set_owner_reference(desired: &mut Value, instance: &DynamicObject) {
    let Some(types) = &instance.types else { return };
    let Some(name) = &instance.metadata.name else {
        return;
    };
    let Some(uid) = &instance.metadata.uid else {
        return;
    };
    let owner = json!({
        "apiVersion": types.api_version,
        "kind": types.kind,
        "name": name,
        "uid": uid,
        "controller": true,
        "blockOwnerDeletion": true,
    });
    if !desired["metadata"]["ownerReferences"].is_array() {
        desired["metadata"]["ownerReferences"] = json!([]);
    }
    desired["metadata"]["ownerReferences"]
        .as_array_mut()
        .expect("just ensured array")
        .push(owner);
}

/// Deletion_flow implements `spec.md` §4.5.2: observe every child once, then delete in reverse
/// topological order, never issuing a delete for an id whose dependents aren't fully gone yet.
async fn deletion_flow(
    ctx: &Context,
    binding: &Binding,
    api: &Api<DynamicObject>,
    instance: &DynamicObject,
    runtime: &mut Runtime,
) -> Result<HandlerOutcome> {
    let parent_namespace = instance.metadata.namespace.clone();

    for id in binding.graph.topological_order.clone() {
        if matches!(runtime.state(&id), Some(ResourceState::Skipped)) {
            continue;
        }
        let Some(desired) = runtime.resolve_desired(&id)? else {
            runtime.set_state(&id, ResourceState::Deleted);
            continue;
        };
        let resource = binding
            .graph
            .resource(&id)
            .expect("id from topological order exists in the graph");
        let child_namespace = resource
            .namespaced
            .then(|| resolve_child_namespace(&desired, parent_namespace.as_deref()));
        let client = client_for(
            ctx,
            &binding.default_service_accounts,
            child_namespace.as_deref(),
        )
        .await?;
        let child_api = dynamic_api_for(&client, resource, child_namespace.as_deref());
        let Some(child_name) = desired.pointer("/metadata/name").and_then(Value::as_str) else {
            runtime.set_state(&id, ResourceState::Deleted);
            continue;
        };
        match child_api.get_opt(child_name).await? {
            None => runtime.set_state(&id, ResourceState::Deleted),
            Some(observed) => {
                runtime.set_observed(&id, serde_json::to_value(&observed)?);
                runtime.set_state(&id, ResourceState::PendingDeletion);
            }
        }
    }

    for id in binding.graph.topological_order.clone().into_iter().rev() {
        match runtime.state(&id) {
            Some(ResourceState::Deleted) | Some(ResourceState::Skipped) => continue,
            Some(ResourceState::PendingDeletion) => {}
            // Haven't reached this far back yet this pass, or it's waiting on a dependent
            // that's still mid-delete: stop here rather than racing ahead of the order.
            _ => break,
        }

        let resource = binding
            .graph
            .resource(&id)
            .expect("id from topological order exists in the graph");
        let Some(desired) = runtime.resolve_desired(&id)? else {
            break;
        };
        let child_namespace = resource
            .namespaced
            .then(|| resolve_child_namespace(&desired, parent_namespace.as_deref()));
        let client = client_for(
            ctx,
            &binding.default_service_accounts,
            child_namespace.as_deref(),
        )
        .await?;
        let child_api = dynamic_api_for(&client, resource, child_namespace.as_deref());
        let Some(child_name) = desired.pointer("/metadata/name").and_then(Value::as_str) else {
            break;
        };

        match child_api.delete(child_name, &DeleteParams::default()).await {
            Ok(_) => {
                runtime.set_state(&id, ResourceState::Deleting);
                break;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                runtime.set_state(&id, ResourceState::Deleted);
            }
            Err(e) => return Err(Error::Kube(e)),
        }
    }

    let all_done = binding.graph.topological_order.iter().all(|id| {
        matches!(
            runtime.state(id),
            Some(ResourceState::Deleted) | Some(ResourceState::Skipped)
        )
    });

    if all_done {
        remove_finalizer(api, instance).await?;
        return Ok(HandlerOutcome::Done);
    }

    Ok(HandlerOutcome::RequeueNeededAfter(DEFAULT_REQUEUE))
}

async fn remove_finalizer(api: &Api<DynamicObject>, instance: &DynamicObject) -> Result<()> {
    let name = instance
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingName("instance"))?;
    let mut finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
    finalizers.retain(|f| f != FINALIZER);
    if finalizers.len() == instance.metadata.finalizers.as_ref().map_or(0, Vec::len) {
        return Ok(());
    }
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&name, &PATCH_PARAMS, &Patch::Merge(patch)).await?;
    Ok(())
}

fn resource_condition_fields(state: &ResourceState) -> (&'static str, &'static str, String) {
    match state {
        ResourceState::Synced => ("True", "Synced", "resource is in sync".to_string()),
        ResourceState::Skipped => ("True", "Skipped", "excluded by includeWhen".to_string()),
        ResourceState::Error(message) => ("False", "Error", message.clone()),
        ResourceState::Pending => ("False", "Pending", "not yet processed this pass".to_string()),
        ResourceState::InProgress => {
            ("False", "InProgress", "waiting on a dependency".to_string())
        }
        ResourceState::Created => (
            "False",
            "Created",
            "just created, waiting for readiness".to_string(),
        ),
        ResourceState::WaitingForReadiness => (
            "False",
            "WaitingForReadiness",
            "readyWhen not yet satisfied".to_string(),
        ),
        ResourceState::Updating => (
            "False",
            "Updating",
            "drift detected, update applied".to_string(),
        ),
        ResourceState::PendingDeletion => (
            "False",
            "PendingDeletion",
            "awaiting deletion".to_string(),
        ),
        ResourceState::Deleting => ("False", "Deleting", "delete issued".to_string()),
        ResourceState::Deleted => ("True", "Deleted", "resource removed".to_string()),
    }
}

/// Write_status implements `spec.md` §4.5 step 5: regardless of outcome, patch the instance's
/// status with the aggregate state, an `InstanceSynced` condition, a `ResourceSynced.<id>`
/// condition per graph resource, and whatever `status` fields the runtime could resolve.
async fn write_status(
    binding: &Binding,
    api: &Api<DynamicObject>,
    instance: &DynamicObject,
    runtime: &Runtime,
) -> Result<()> {
    let name = instance
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingName("instance"))?;
    let generation = instance.metadata.generation;
    let now = Time(chrono::Utc::now());

    let aggregate = runtime.aggregate_state();
    let (state_str, synced) = match aggregate {
        InstanceState::Active => ("ACTIVE", true),
        InstanceState::Failed | InstanceState::Error => ("FAILED", false),
        InstanceState::InProgress | InstanceState::Deleting => ("IN_PROGRESS", false),
    };

    let mut conditions = vec![Condition {
        type_: condition("InstanceSynced"),
        status: if synced { "True" } else { "False" }.to_string(),
        reason: if synced {
            "Synced".to_string()
        } else {
            "NotSynced".to_string()
        },
        message: format!("{aggregate:?}"),
        observed_generation: generation,
        last_transition_time: now.clone(),
    }];

    for id in &binding.graph.topological_order {
        let Some(state) = runtime.state(id) else {
            continue;
        };
        let (status, reason, message) = resource_condition_fields(state);
        conditions.push(Condition {
            type_: condition(format!("ResourceSynced.{id}")),
            status: status.to_string(),
            reason: reason.to_string(),
            message,
            observed_generation: generation,
            last_transition_time: now.clone(),
        });
    }

    let mut status = runtime.resolve_status()?.unwrap_or_else(|| json!({}));
    if !status.is_object() {
        warn!(id = "status", "status template resolved to a non-object value, discarding it");
        status = json!({});
    }
    status["state"] = json!(state_str);
    status["conditions"] = serde_json::to_value(&conditions)?;

    let patch = json!({ "status": status });
    api.patch_status(&name, &PATCH_PARAMS, &Patch::Merge(patch))
        .await?;
    Ok(())
}
