//! Rgd reconciles a `ResourceGraphDefinition`: it compiles the declared schema and resources into
//! a [`kro_graph::Graph`], applies the derived parent CRD, and registers an Instance Reconciler
//! handler with the Dynamic Multiplexing Controller for the emulated parent kind.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kro_expr::cel::CelEngine;
use kro_graph::{Graph, GraphBuilder, GraphError, Gvk, RgdInput};
use kube::{
    ResourceExt,
    api::{Api, ApiResource, Patch, entry::{CommitError, Entry}},
    runtime::{
        controller::{Action, Controller, Error as CtrlErr},
        finalizer::{Event as Finalizer, finalizer},
        wait::{await_condition, conditions},
        watcher,
    },
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use api::v1alpha1::{
    DependencyRef, ResourceDeclaration, ResourceGraphDefinition, ResourceGraphDefinitionSpec,
    ResourceGraphDefinitionStatus, ResourceStatus,
};

use crate::{
    CREATE_PARAMS, Context, Error, FINALIZER, PATCH_PARAMS, Result, instance, prelude::condition,
};

/// ControllerFuture is the boxed future the process runs to drive the RGD controller to
/// completion (or until cancelled).
pub type ControllerFuture = BoxFuture<'static, Result<()>>;

/// Controller builds the `ResourceGraphDefinition` controller loop.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> ControllerFuture {
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    let cfg = watcher::Config::default();

    async move {
        let ctl = Controller::new(api, cfg).graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting resource graph definition controller");
        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    }
                }
                futures::future::ready(())
            })
            .await;
        debug!("resource graph definition controller finished");
        Ok(())
    }
    .boxed()
}

fn error_policy(
    _rgd: Arc<ResourceGraphDefinition>,
    err: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(error = %err, "resource graph definition reconcile error");
    Action::requeue(Duration::from_secs(5))
}

#[instrument(skip(rgd, ctx), fields(
    trace_id,
    name = rgd.name_any(),
    generation = rgd.metadata.generation,
))]
async fn reconcile(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
    }
    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, rgd, |event| async {
        match event {
            Finalizer::Apply(rgd) => reconcile_one(rgd, ctx.clone()).await,
            Finalizer::Cleanup(rgd) => cleanup_one(rgd, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn parent_gvk(spec: &ResourceGraphDefinitionSpec) -> Gvk {
    Gvk {
        group: spec
            .schema
            .group
            .clone()
            .unwrap_or_else(|| "kro.run".to_string()),
        version: spec.schema.api_version.clone(),
        kind: spec.schema.kind.clone(),
    }
}

fn build_input(spec: &ResourceGraphDefinitionSpec) -> RgdInput {
    let gvk = parent_gvk(spec);
    let status_schema = spec.schema.status.clone().unwrap_or_else(|| json!({}));
    RgdInput {
        group: gvk.group,
        version: gvk.version,
        kind: gvk.kind,
        spec_schema: spec.schema.spec.clone(),
        // The shorthand `status` shape doubles as the status template: its `${...}`
        // expressions are evaluated the same way a resource template's are.
        status_template: status_schema.clone(),
        status_schema,
        resources: spec.resources.iter().map(declaration_to_template).collect(),
    }
}

fn declaration_to_template(decl: &ResourceDeclaration) -> kro_graph::ResourceTemplate {
    kro_graph::ResourceTemplate {
        id: decl.id.clone(),
        template: decl.template.clone(),
        ready_when: decl.ready_when.clone(),
        include_when: decl.include_when.clone(),
    }
}

fn parent_api_resource(graph: &Graph) -> ApiResource {
    let gvr = graph.parent_gvk.to_gvr();
    let api_version = if gvr.group.is_empty() {
        gvr.version.clone()
    } else {
        format!("{}/{}", gvr.group, gvr.version)
    };
    ApiResource {
        group: gvr.group,
        version: gvr.version,
        api_version,
        kind: graph.parent_gvk.kind.clone(),
        plural: gvr.resource,
    }
}

fn make_condition(
    rgd: &ResourceGraphDefinition,
    ty: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    Condition {
        type_: condition(ty),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation: rgd.metadata.generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

#[instrument(skip(ctx, rgd))]
async fn reconcile_one(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let input = build_input(&rgd.spec);

    let graph = match GraphBuilder::new(&CelEngine::new()).build(&input) {
        Ok(graph) => graph,
        Err(err) => {
            write_status(
                &ctx,
                &rgd,
                "Inactive",
                vec![
                    make_condition(&rgd, "GraphVerified", false, reason_for(&err), err.to_string()),
                    make_condition(&rgd, "CustomResourceDefinitionSynced", false, "GraphNotVerified", "waiting on a valid graph"),
                    make_condition(&rgd, "ReconcilerReady", false, "GraphNotVerified", "waiting on a valid graph"),
                ],
                None,
            )
            .await?;
            return Ok(Action::await_change());
        }
    };
    let graph = Arc::new(graph);
    let graph_verified = make_condition(&rgd, "GraphVerified", true, "Verified", "graph compiled");

    if let Err(err) = ensure_crd(&ctx, &graph).await {
        write_status(
            &ctx,
            &rgd,
            "Inactive",
            vec![
                graph_verified,
                make_condition(&rgd, "CustomResourceDefinitionSynced", false, "CrdSyncFailed", err.to_string()),
                make_condition(&rgd, "ReconcilerReady", false, "CrdNotSynced", "waiting on the CRD"),
            ],
            Some(&graph),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }
    let crd_synced = make_condition(&rgd, "CustomResourceDefinitionSynced", true, "Synced", "CRD established");

    let binding = Arc::new(instance::Binding {
        graph: graph.clone(),
        api_resource: parent_api_resource(&graph),
        rgd_name: rgd.name_any(),
        rgd_uid: rgd.uid().unwrap_or_default(),
        default_service_accounts: rgd.spec.default_service_accounts.clone().unwrap_or_default(),
    });
    let gvr = graph.parent_gvk.to_gvr();
    let handler = instance::handler(ctx.clone(), binding);
    if let Err(err) = ctx
        .dmc
        .start_serving_gvk(gvr, &graph.parent_gvk.kind, handler)
        .await
    {
        write_status(
            &ctx,
            &rgd,
            "Inactive",
            vec![
                graph_verified,
                crd_synced,
                make_condition(&rgd, "ReconcilerReady", false, "RegistrationFailed", err.to_string()),
            ],
            Some(&graph),
        )
        .await?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    write_status(
        &ctx,
        &rgd,
        "Active",
        vec![
            graph_verified,
            crd_synced,
            make_condition(&rgd, "ReconcilerReady", true, "Ready", "serving instances"),
        ],
        Some(&graph),
    )
    .await?;

    Ok(Action::await_change())
}

fn reason_for(err: &GraphError) -> &'static str {
    match err {
        GraphError::Schema(_) => "SchemaInvalid",
        GraphError::Compile { .. } => "ExpressionCompileFailed",
        GraphError::UnknownReference { .. } => "UnknownReference",
        GraphError::TypeMismatch { .. } => "TypeMismatch",
        GraphError::Cycle(_) => "DependencyCycle",
        GraphError::DuplicateId(_) => "DuplicateId",
        GraphError::DuplicateLabelKey(_) => "DuplicateLabelKey",
    }
}

async fn ensure_crd(ctx: &Context, graph: &Graph) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    let name = graph.derived_crd.name_any();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let entry = api.entry(&name).await?;
        let entry = match entry {
            Entry::Occupied(e) => e.and_modify(|existing| {
                existing.spec = graph.derived_crd.spec.clone();
            }),
            Entry::Vacant(e) => e.insert(graph.derived_crd.clone()),
        };
        match entry.commit(&CREATE_PARAMS).await {
            Ok(()) => break,
            Err(CommitError::Validate(reason)) if attempt < 3 => {
                warn!(reason = %reason, attempt, "crd commit validation failed, retrying");
                continue;
            }
            Err(err) => return Err(Error::Commit(err)),
        }
    }

    let establish = await_condition(api, &name, conditions::is_crd_established());
    match tokio::time::timeout(Duration::from_secs(30), establish).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Other(anyhow::anyhow!(
            "waiting for CRD {name} to establish: {err}"
        ))),
        Err(_) => Err(Error::Other(anyhow::anyhow!(
            "timed out waiting for CRD {name} to become established"
        ))),
    }
}

async fn write_status(
    ctx: &Context,
    rgd: &ResourceGraphDefinition,
    state: &str,
    conditions: Vec<Condition>,
    graph: Option<&Graph>,
) -> Result<()> {
    let name = rgd.name_any();
    let (topological_order, resources) = match graph {
        Some(graph) => (
            graph.topological_order.clone(),
            graph
                .topological_order
                .iter()
                .map(|id| {
                    let resource = graph.resource(id).expect("id from topological order exists");
                    ResourceStatus {
                        id: id.clone(),
                        dependencies: resource
                            .dependencies
                            .iter()
                            .cloned()
                            .map(|id| DependencyRef { id })
                            .collect(),
                    }
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let status = ResourceGraphDefinitionStatus {
        state: Some(state.to_string()),
        topological_order,
        resources,
        conditions,
    };

    let api: Api<ResourceGraphDefinition> = Api::all(ctx.client.clone());
    let patch = json!({ "status": status });

    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        attempt += 1;
        // Fresh GET per attempt: a concurrent writer (another replica, `kubectl edit status`)
        // may have moved the object's resourceVersion since we last observed it.
        api.get(&name).await?;
        match api.patch_status(&name, &PATCH_PARAMS, &Patch::Merge(&patch)).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < MAX_ATTEMPTS => {
                warn!(reason = %e, attempt, "status patch conflict, retrying");
            }
            Err(err) => return Err(Error::Kube(err)),
        }
    }
}

#[instrument(skip(ctx, rgd))]
async fn cleanup_one(rgd: Arc<ResourceGraphDefinition>, ctx: Arc<Context>) -> Result<Action> {
    let gvk = parent_gvk(&rgd.spec);
    let gvr = gvk.to_gvr();

    if let Err(err) = ctx.dmc.stop_serving_gvk(&gvr).await {
        warn!(error = %err, "failed to stop serving gvr during cleanup");
    }

    if ctx.allow_crd_deletion {
        let crd_name = format!("{}.{}", gvr.resource, gvr.group);
        let api: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
        match api.delete(&crd_name, &Default::default()).await {
            Ok(_) => info!(crd = crd_name, "deleted derived CRD"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(err) => return Err(Error::Kube(err)),
        }
    } else {
        debug!("allow_crd_deletion is false, leaving the derived CRD in place");
    }

    Ok(Action::await_change())
}
