//! Impersonate builds a per-namespace [`kube::Client`] that acts as a configured service
//! account instead of the controller's own identity, by layering an `Impersonate-User` header
//! onto every outgoing request.
//!
//! This mirrors the documented pattern for customizing [`kube::Client`] construction: a
//! [`ConfigExt`]-derived [`tower::ServiceBuilder`] stack passed to [`kube::Client::new`], with one
//! extra layer inserted for the impersonation header.

use http::{HeaderValue, Request, Response, header::HeaderName};
use hyper_util::{client::legacy::Client as HyperClient, rt::TokioExecutor};
use kube::client::{Body, ConfigExt};
use tower::{Layer, Service, ServiceBuilder};

use crate::ImpersonationError;

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");

/// Principal builds the Kubernetes impersonation principal for a service account name in a
/// namespace, e.g. `system:serviceaccount:payments:deployer`.
pub fn principal(namespace: &str, service_account: &str) -> Result<String, ImpersonationError> {
    if service_account.is_empty() || service_account.contains(':') || service_account.contains('/') {
        return Err(ImpersonationError::InvalidSa(service_account.to_string()));
    }
    Ok(format!("system:serviceaccount:{namespace}:{service_account}"))
}

/// Build constructs a [`kube::Client`] that impersonates `principal` for every request, reusing
/// `base`'s server address, TLS material and ambient authentication.
pub fn build(base: &kube::Config, principal: &str) -> Result<kube::Client, ImpersonationError> {
    let https = base
        .openssl_https_connector()
        .map_err(|e| ImpersonationError::ConfigCreate(e.to_string()))?;
    let auth_layer = base
        .auth_layer()
        .map_err(|e| ImpersonationError::ConfigCreate(e.to_string()))?;
    let connector = HyperClient::builder(TokioExecutor::new()).build(https);
    let service = ServiceBuilder::new()
        .layer(base.base_uri_layer())
        .option_layer(auth_layer)
        .layer(ImpersonateLayer::new(principal))
        .service(connector);
    Ok(kube::Client::new(service, base.default_namespace.clone()))
}

/// ImpersonateLayer sets the `Impersonate-User` header to a fixed principal on every request it
/// wraps.
#[derive(Clone)]
struct ImpersonateLayer {
    value: HeaderValue,
}

impl ImpersonateLayer {
    fn new(principal: &str) -> Self {
        Self {
            value: HeaderValue::from_str(principal).unwrap_or_else(|_| HeaderValue::from_static("")),
        }
    }
}

impl<S> Layer<S> for ImpersonateLayer {
    type Service = ImpersonateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ImpersonateService { inner, value: self.value.clone() }
    }
}

#[derive(Clone)]
struct ImpersonateService<S> {
    inner: S,
    value: HeaderValue,
}

impl<S> Service<Request<Body>> for ImpersonateService<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        req.headers_mut().insert(IMPERSONATE_USER, self.value.clone());
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_builds_expected_string() {
        assert_eq!(
            principal("payments", "deployer").unwrap(),
            "system:serviceaccount:payments:deployer"
        );
    }

    #[test]
    fn principal_rejects_names_with_separators() {
        assert!(principal("payments", "a:b").is_err());
        assert!(principal("payments", "a/b").is_err());
        assert!(principal("payments", "").is_err());
    }
}
