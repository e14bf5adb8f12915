#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements the common plumbing shared by the Dynamic Multiplexing Controller, the
//! Instance Reconciler, and the ResourceGraphDefinition Reconciler: error types, the per-process
//! [`Context`], label/condition helpers, and metrics.

use std::env;
use std::sync::LazyLock;

use kube::runtime::events;

/// Prelude is the common types pulled in by the reconciler modules.
pub(crate) mod prelude {
    pub use std::sync::Arc;

    pub use futures::prelude::*;
    pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
    pub use kube::{
        Resource, ResourceExt,
        api::{Api, Patch, PatchParams, PostParams},
        runtime::{controller::Action, watcher},
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::labels::{self, condition};
    pub use super::{CONTROLLER_NAME, CREATE_PARAMS, FINALIZER, PATCH_PARAMS};
    pub use super::{Context, Error, Result};
}

pub mod dmc;
pub mod impersonate;
pub mod instance;
pub mod metrics;
pub mod rgd;
pub mod telemetry;

#[cfg(test)]
pub mod testing;

/// Error is the union of everything that can go wrong while running the controllers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Commit indicates there was an error in a "create-or-get then modify" process.
    #[error("commit error: {0}")]
    Commit(#[from] kube::api::entry::CommitError),
    /// Finalizer indicates the finalizer helper itself failed, as opposed to the reconcile
    /// function it wraps.
    #[error("finalizer error: {0}")]
    Finalizer(Box<kube::runtime::finalizer::Error<Error>>),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Json indicates a JSON serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Yaml indicates a YAML serialization failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// JsonPatch indicates a JSON patch failed.
    #[error("json patch error: {0}")]
    JsonPatch(#[from] json_patch::PatchError),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// MissingName indicates a name was needed and not provided.
    #[error("missing name for kubernetes object: {0}")]
    MissingName(&'static str),
    /// BadName indicates a disallowed name for a kubernetes object.
    #[error("bad name for kubernetes object: {0}")]
    BadName(String),
    /// Schema indicates the shorthand type grammar failed to compile.
    #[error("schema error: {0}")]
    Schema(#[from] kro_schema::SchemaError),
    /// Graph indicates the graph builder rejected a ResourceGraphDefinition.
    #[error("graph error: {0}")]
    Graph(#[from] kro_graph::GraphError),
    /// Runtime indicates the per-instance runtime failed to resolve an expression.
    #[error("runtime error: {0}")]
    Runtime(#[from] kro_runtime::RuntimeError),
    /// Expr indicates the expression engine rejected or failed to evaluate an expression.
    #[error("expression error: {0}")]
    Expr(#[from] kro_expr::ExprError),
    /// UnknownGvr indicates the DMC was asked to stop serving a GVR it never started.
    #[error("unknown GVR: {0:?}")]
    UnknownGvr(kro_graph::Gvr),
    /// Impersonation indicates building or using a per-namespace impersonated client failed.
    #[error("impersonation error: {0}")]
    Impersonation(#[from] ImpersonationError),
    /// Other is a catch-all error, used for conditions with no other variant.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// ImpersonationError classifies why building or using a per-namespace impersonated client
/// failed, so each kind can drive its own counter per `spec.md` §7.
#[derive(thiserror::Error, Debug)]
pub enum ImpersonationError {
    /// ConfigCreate indicates the base client config could not be adapted for impersonation.
    #[error("building impersonated config: {0}")]
    ConfigCreate(String),
    /// InvalidSa indicates the configured service account name is not usable as a principal.
    #[error("invalid service account name {0:?}")]
    InvalidSa(String),
    /// ClientCreate indicates the impersonated `kube::Client` itself failed to build.
    #[error("building impersonated client: {0}")]
    ClientCreate(#[from] kube::Error),
    /// Permissions indicates a call made with the impersonated client was forbidden.
    #[error("impersonated client forbidden: {0}")]
    Permissions(String),
}

impl ImpersonationError {
    /// Name is the metric label used for this error kind, matching `spec.md` §7's
    /// `config_create`/`invalid_sa`/`client_create`/`permissions` counters.
    pub fn name(&self) -> &'static str {
        match self {
            ImpersonationError::ConfigCreate(_) => "config_create",
            ImpersonationError::InvalidSa(_) => "invalid_sa",
            ImpersonationError::ClientCreate(_) => "client_create",
            ImpersonationError::Permissions(_) => "permissions",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::Finalizer(Box::new(e))
    }
}

/// Result typedef for controllers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is shared, read-mostly state handed to every reconciler and to the DMC.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of the Context.
    pub client: kube::Client,
    /// BaseConfig is the resolved client config `client` was built from, kept around so a
    /// per-namespace impersonated client can be derived from it on demand.
    pub base_config: kube::Config,
    /// Dmc is the shared Dynamic Multiplexing Controller every RGD registers its handler with.
    pub dmc: std::sync::Arc<dmc::Dmc>,
    /// Metrics are the process-wide counters reconcilers report into.
    pub metrics: metrics::Metrics,
    /// DefaultResyncSeconds is the periodic full-resync interval used when a
    /// ResourceGraphDefinition doesn't configure a different one.
    pub default_resync_seconds: u64,
    /// AllowCrdDeletion gates whether the RGD Reconciler deletes the derived CRD when its
    /// owning ResourceGraphDefinition is deleted.
    pub allow_crd_deletion: bool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

/// KRO_VERSION is stamped onto every managed child via the `kro.run/kro-version` label.
pub const KRO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// DEFAULT_REQUEUE is the delay used whenever a reconcile needs to be retried without having
/// hit an error (waiting on a dependency, waiting for readiness, waiting for a deletion to
/// finish elsewhere).
pub const DEFAULT_REQUEUE: std::time::Duration = std::time::Duration::from_secs(10);

static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// CREATE_PARAMS is the default set of create parameters used across reconcilers.
pub static CREATE_PARAMS: LazyLock<kube::api::PostParams> = LazyLock::new(|| kube::api::PostParams {
    dry_run: false,
    field_manager: Some(String::from(CONTROLLER_NAME)),
});
/// PATCH_PARAMS is the default set of apply-patch parameters used across reconcilers.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a human-readable identity,
/// e.g. as a field manager or an event reporter.
pub const CONTROLLER_NAME: &str = "kro-controller";

/// FINALIZER is placed on every Instance this controller has started reconciling, so that
/// deletion can run the topologically-reversed cleanup pass before the Instance is removed.
pub const FINALIZER: &str = "kro.run/finalizer";

/// Labels names the well-known labels this controller stamps onto owned children and onto
/// instances, plus the helpers for building condition type strings.
pub mod labels {
    /// Owned marks every child resource created by this controller.
    pub const OWNED: &str = "kro.run/owned";
    /// KroVersion records the controller version that last reconciled a resource.
    pub const KRO_VERSION: &str = "kro.run/kro-version";
    /// ResourceGraphDefinitionId records the id of the RGD an instance was created from.
    pub const RESOURCE_GRAPH_DEFINITION_ID: &str = "kro.run/resource-graph-definition-id";
    /// ResourceGraphDefinitionName records the name of the RGD an instance was created from.
    pub const RESOURCE_GRAPH_DEFINITION_NAME: &str = "kro.run/resource-graph-definition-name";
    /// InstanceId records the uid of the owning instance on a child resource.
    pub const INSTANCE_ID: &str = "kro.run/instance-id";
    /// InstanceName records the name of the owning instance on a child resource.
    pub const INSTANCE_NAME: &str = "kro.run/instance-name";
    /// InstanceNamespace records the namespace of the owning instance on a child resource.
    pub const INSTANCE_NAMESPACE: &str = "kro.run/instance-namespace";

    /// Condition builds a condition `type` in the `kro.run` namespace, preserving case (unlike
    /// a label key, condition types are conventionally PascalCase).
    pub fn condition<S: AsRef<str>>(name: S) -> String {
        format!("kro.run/{}", name.as_ref())
    }
}
