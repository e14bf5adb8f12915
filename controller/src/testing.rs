//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::{collections::BTreeMap, sync::Arc};

use assert_json_diff::assert_json_include;
use http::{Request, Response, StatusCode};
use kube::{
    api::ApiResource,
    client::{Body, Client},
};
use kro_expr::cel::CelEngine;
use kro_graph::{Graph, GraphBuilder, RgdInput, ResourceTemplate};
use serde_json::{Value, json};
use tower_test::mock::SendResponse;

use super::*;
use crate::{
    dmc::{Dmc, ObjectIdentifiers, RateLimiterConfig},
    instance::{self, Binding},
    metrics::Metrics,
};

pub use test_log::test;

impl Context {
    /// Builds a [`Context`] backed by a mock apiserver instead of a real cluster, for exercising
    /// the instance reconciler in isolation.
    pub fn instance_tests() -> (Arc<Self>, InstanceServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let metrics = Metrics::default();
        let dmc = Arc::new(Dmc::new(
            mock_client.clone(),
            1,
            RateLimiterConfig::default(),
            metrics.dmc.clone(),
        ));
        let ctx = Self {
            client: mock_client,
            base_config: kube::Config::new("https://127.0.0.1:6443".parse().unwrap()),
            dmc,
            metrics,
            default_resync_seconds: 600,
            allow_crd_deletion: false,
        };
        (Arc::new(ctx), InstanceServerVerifier::new(handle))
    }
}

/// Fixtures builds the compiled graphs, bindings and JSON objects the instance reconciler tests
/// run against, using the same `GraphBuilder`/`RgdInput` shape `kro_graph` and `kro_runtime`
/// exercise in their own unit tests.
pub mod fixtures {
    use super::*;

    /// A `WebApp` instance with a single `ConfigMap` child named after `spec.name`.
    pub fn graph_single_configmap() -> Arc<Graph> {
        let engine = CelEngine::new();
        let builder = GraphBuilder::new(&engine);
        let input = RgdInput {
            group: "kro.run".into(),
            version: "v1alpha1".into(),
            kind: "WebApp".into(),
            spec_schema: json!({"name": "string"}),
            status_schema: json!({}),
            resources: vec![ResourceTemplate {
                id: "cm".into(),
                template: json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "${schema.spec.name}"},
                    "data": {"greeting": "hello"},
                }),
                ready_when: vec![],
                include_when: vec![],
            }],
            status_template: json!({}),
        };
        Arc::new(builder.build(&input).unwrap())
    }

    pub fn parent_api_resource(graph: &Graph) -> ApiResource {
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

    pub fn child_api_resource(graph: &Graph, id: &str) -> ApiResource {
        let resource = graph.resource(id).expect("resource id exists in graph");
        let gvr = &resource.gvr;
        let api_version = if gvr.group.is_empty() {
            gvr.version.clone()
        } else {
            format!("{}/{}", gvr.group, gvr.version)
        };
        ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version,
            kind: resource.gvk.kind.clone(),
            plural: gvr.resource.clone(),
        }
    }

    pub fn binding(graph: Arc<Graph>) -> Binding {
        let api_resource = parent_api_resource(&graph);
        Binding {
            graph,
            api_resource,
            rgd_name: "webapps".into(),
            rgd_uid: "rgd-uid".into(),
            default_service_accounts: BTreeMap::new(),
        }
    }

    pub fn instance(name: &str, spec: Value) -> Value {
        json!({
            "apiVersion": "kro.run/v1alpha1",
            "kind": "WebApp",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": "instance-uid",
                "generation": 1,
            },
            "spec": spec,
        })
    }

    pub fn config_map(name: &str, data: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": data,
        })
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct InstanceServerVerifier {
    handle: ApiServerHandle,
}

impl InstanceServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self { handle }
    }

    #[inline]
    fn next_request(
        &mut self,
    ) -> impl Future<Output = Option<(Request<Body>, SendResponse<Response<Body>>)>> {
        self.handle.next_request()
    }

    fn url_prefix(ar: &ApiResource) -> String {
        if ar.group.is_empty() {
            format!("/api/{}", ar.version)
        } else {
            format!("/apis/{}/{}", ar.group, ar.version)
        }
    }

    /// Handles a GET for `name`, responding with `found` or a 404.
    pub async fn handle_get(mut self, ar: &ApiResource, ns: &str, name: &str, found: Option<&Value>) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::GET, "unexpected method");
        let expected = format!("{}/namespaces/{ns}/{}/{name}", Self::url_prefix(ar), ar.plural);
        assert_eq!(uri, expected, "unexpected path");

        let response = match found {
            Some(v) => Response::builder()
                .body(Body::from(serde_json::to_vec(v).unwrap()))
                .unwrap(),
            None => not_found(ar, name),
        };
        send.send_response(response);

        Ok(self)
    }

    /// Handles a merge PATCH to `name`, asserting the patch body includes `expected_patch`.
    pub async fn handle_patch(
        mut self,
        ar: &ApiResource,
        ns: &str,
        name: &str,
        expected_patch: Value,
        respond_with: &Value,
    ) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let expected = format!(
            "{}/namespaces/{ns}/{}/{name}?&fieldManager={}&fieldValidation=Strict",
            Self::url_prefix(ar),
            ar.plural,
            crate::CONTROLLER_NAME,
        );
        assert_eq!(uri, expected, "unexpected path");

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let body: Value = serde_json::from_slice(&req_body).expect("patch body is json");
        assert_json_include!(actual: body, expected: expected_patch);

        let response = serde_json::to_vec(respond_with).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    /// Handles a merge PATCH against `name`'s `/status` subresource.
    pub async fn handle_patch_status(
        mut self,
        ar: &ApiResource,
        ns: &str,
        name: &str,
        respond_with: &Value,
    ) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        let expected = format!(
            "{}/namespaces/{ns}/{}/{name}/status?&fieldManager={}&fieldValidation=Strict",
            Self::url_prefix(ar),
            ar.plural,
            crate::CONTROLLER_NAME,
        );
        assert_eq!(uri, expected, "unexpected path");
        let _ = request.into_body().collect_bytes().await.unwrap();

        let response = serde_json::to_vec(respond_with).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    /// Handles a POST create, echoing the request body back as the apiserver would.
    pub async fn handle_create(mut self, ar: &ApiResource, ns: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::POST, "unexpected method");
        let expected = format!(
            "{}/namespaces/{ns}/{}?&fieldManager={}",
            Self::url_prefix(ar),
            ar.plural,
            crate::CONTROLLER_NAME,
        );
        assert_eq!(uri, expected, "unexpected path");

        let req_body = request.into_body().collect_bytes().await.unwrap();
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        Ok(self)
    }

    /// Handles a PUT replace, echoing the request body back as the apiserver would.
    pub async fn handle_replace(mut self, ar: &ApiResource, ns: &str, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PUT, "unexpected method");
        let expected = format!(
            "{}/namespaces/{ns}/{}/{name}?&fieldManager={}",
            Self::url_prefix(ar),
            ar.plural,
            crate::CONTROLLER_NAME,
        );
        assert_eq!(uri, expected, "unexpected path");

        let req_body = request.into_body().collect_bytes().await.unwrap();
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());

        Ok(self)
    }

    /// Handles a DELETE for `name`, responding with a `Status` success object.
    pub async fn handle_delete(mut self, ar: &ApiResource, ns: &str, name: &str) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::DELETE, "unexpected method");
        let expected = format!("{}/namespaces/{ns}/{}/{name}", Self::url_prefix(ar), ar.plural);
        assert_eq!(uri, expected, "unexpected path");

        let status = json!({"kind": "Status", "apiVersion": "v1", "status": "Success"});
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&status).unwrap()))
                .unwrap(),
        );

        Ok(self)
    }
}

fn not_found(ar: &ApiResource, name: &str) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {"group": ar.group, "kind": ar.kind, "name": name},
    });
    let response = serde_json::to_vec(&err).unwrap();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(response))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmc::HandlerOutcome;

    fn finalizer_patch() -> Value {
        json!({"metadata": {"finalizers": [crate::FINALIZER]}})
    }

    #[test_log::test(tokio::test)]
    async fn unknown_instance_is_a_no_op() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::Done));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", None)
            .await
            .expect("scenario completed without errors");

        timeout_after_1s(mock).await;
    }

    #[test_log::test(tokio::test)]
    async fn creates_missing_child_then_requeues() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let child_ar = fixtures::child_api_resource(&graph, "cm");
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph.clone()));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);
        let parent = fixtures::instance("demo", json!({"name": "demo"}));

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::RequeueNeededAfter(_)));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", Some(&parent))
            .await
            .expect("get parent")
            .handle_patch(&parent_ar, "default", "demo", finalizer_patch(), &parent)
            .await
            .expect("patch finalizer")
            .handle_get(&child_ar, "default", "demo", None)
            .await
            .expect("get child")
            .handle_create(&child_ar, "default")
            .await
            .expect("create child")
            .handle_patch_status(&parent_ar, "default", "demo", &parent)
            .await
            .expect("patch status");

        timeout_after_1s(mock).await;
    }

    #[test_log::test(tokio::test)]
    async fn drifted_child_is_replaced() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let child_ar = fixtures::child_api_resource(&graph, "cm");
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph.clone()));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);
        let mut parent = fixtures::instance("demo", json!({"name": "demo"}));
        parent["metadata"]["finalizers"] = json!([crate::FINALIZER]);
        let observed_child = fixtures::config_map("demo", json!({"greeting": "stale"}));

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::RequeueNeededAfter(_)));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", Some(&parent))
            .await
            .expect("get parent")
            .handle_patch(&parent_ar, "default", "demo", finalizer_patch(), &parent)
            .await
            .expect("patch finalizer")
            .handle_get(&child_ar, "default", "demo", Some(&observed_child))
            .await
            .expect("get child")
            .handle_replace(&child_ar, "default", "demo")
            .await
            .expect("replace child")
            .handle_patch_status(&parent_ar, "default", "demo", &parent)
            .await
            .expect("patch status");

        timeout_after_1s(mock).await;
    }

    #[test_log::test(tokio::test)]
    async fn synced_child_needs_no_further_calls() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let child_ar = fixtures::child_api_resource(&graph, "cm");
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph.clone()));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);
        let mut parent = fixtures::instance("demo", json!({"name": "demo"}));
        parent["metadata"]["finalizers"] = json!([crate::FINALIZER]);
        let observed_child = fixtures::config_map("demo", json!({"greeting": "hello"}));

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::Done));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", Some(&parent))
            .await
            .expect("get parent")
            .handle_patch(&parent_ar, "default", "demo", finalizer_patch(), &parent)
            .await
            .expect("patch finalizer")
            .handle_get(&child_ar, "default", "demo", Some(&observed_child))
            .await
            .expect("get child")
            .handle_patch_status(&parent_ar, "default", "demo", &parent)
            .await
            .expect("patch status");

        timeout_after_1s(mock).await;
    }

    #[test_log::test(tokio::test)]
    async fn deletion_in_progress_deletes_remaining_child() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let child_ar = fixtures::child_api_resource(&graph, "cm");
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph.clone()));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);
        let mut parent = fixtures::instance("demo", json!({"name": "demo"}));
        parent["metadata"]["finalizers"] = json!([crate::FINALIZER]);
        parent["metadata"]["deletionTimestamp"] = json!("2026-07-30T00:00:00Z");
        let observed_child = fixtures::config_map("demo", json!({"greeting": "hello"}));

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::RequeueNeededAfter(_)));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", Some(&parent))
            .await
            .expect("get parent")
            .handle_get(&child_ar, "default", "demo", Some(&observed_child))
            .await
            .expect("observe child")
            .handle_delete(&child_ar, "default", "demo")
            .await
            .expect("delete child")
            .handle_patch_status(&parent_ar, "default", "demo", &parent)
            .await
            .expect("patch status");

        timeout_after_1s(mock).await;
    }

    #[test_log::test(tokio::test)]
    async fn deletion_completes_once_every_child_is_gone() {
        let graph = fixtures::graph_single_configmap();
        let parent_ar = fixtures::parent_api_resource(&graph);
        let child_ar = fixtures::child_api_resource(&graph, "cm");
        let parent_gvr = graph.parent_gvk.to_gvr();
        let binding = Arc::new(fixtures::binding(graph.clone()));
        let (ctx, verifier) = Context::instance_tests();
        let handler = instance::handler(ctx, binding);
        let ids = ObjectIdentifiers::new(Some("default"), "demo", parent_gvr);
        let mut parent = fixtures::instance("demo", json!({"name": "demo"}));
        parent["metadata"]["finalizers"] = json!([crate::FINALIZER]);
        parent["metadata"]["deletionTimestamp"] = json!("2026-07-30T00:00:00Z");

        let mock = tokio::spawn(async move {
            let outcome = handler(ids).await.expect("handler succeeds");
            assert!(matches!(outcome, HandlerOutcome::Done));
        });

        verifier
            .handle_get(&parent_ar, "default", "demo", Some(&parent))
            .await
            .expect("get parent")
            .handle_get(&child_ar, "default", "demo", None)
            .await
            .expect("observe child already gone")
            .handle_patch(&parent_ar, "default", "demo", json!({"metadata": {"finalizers": []}}), &parent)
            .await
            .expect("remove finalizer")
            .handle_patch_status(&parent_ar, "default", "demo", &parent)
            .await
            .expect("patch status");

        timeout_after_1s(mock).await;
    }
}
