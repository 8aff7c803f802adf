//! Tower middleware wiring for the payment gate.
//!
//! [`PaymentGateLayer`] wraps a route with a [`PayGate`]: requests without
//! valid payment evidence receive a 402 challenge, requests whose evidence
//! just verified get the inner response plus token echo headers. Axum handles
//! routing; each gated route carries its own layer instance.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::body::Body;
use http::{HeaderValue, Request, Response, StatusCode};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use rentvault::grant::AccessGrant;

use crate::constants::{
    PAYMENT_REFERENCE_HEADER, PAYMENT_TOKEN_EXPIRY_HEADER, PAYMENT_TOKEN_HEADER,
    PAYMENT_TOKEN_RESPONSE_HEADER, PAYMENT_TXID_HEADER,
};
use crate::gate::{GateOutcome, PayGate, PaymentChallenge, PaymentHeaders};

/// Tower [`Layer`] enforcing payment on the wrapped route.
#[derive(Clone, Debug)]
pub struct PaymentGateLayer {
    gate: Arc<PayGate>,
    /// Resource id override; defaults to the request path.
    resource: Option<String>,
}

impl PaymentGateLayer {
    /// Creates a layer over the given gate. The resource id defaults to the
    /// request path.
    #[must_use]
    pub fn new(gate: Arc<PayGate>) -> Self {
        Self {
            gate,
            resource: None,
        }
    }

    /// Pins the resource id instead of deriving it from the request path.
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

impl<S> Layer<S> for PaymentGateLayer
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = PaymentGateService;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            gate: Arc::clone(&self.gate),
            resource: self.resource.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Tower [`Service`] produced by [`PaymentGateLayer`].
#[derive(Clone)]
#[allow(missing_debug_implementations)] // BoxCloneSyncService does not implement Debug
pub struct PaymentGateService {
    gate: Arc<PayGate>,
    resource: Option<String>,
    inner: BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>,
}

impl Service<Request<Body>> for PaymentGateService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        let resource = self.resource.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let resource = resource.unwrap_or_else(|| req.uri().path().to_owned());
            let headers = extract_headers(&req);

            match gate.evaluate(&resource, &headers).await {
                Ok(GateOutcome::Allow { minted }) => {
                    let mut response = inner.call(req).await?;
                    if let Some(grant) = minted {
                        echo_token(&mut response, &grant);
                    }
                    Ok(response)
                }
                Ok(GateOutcome::Challenge(challenge)) => Ok(challenge_response(&challenge)),
                Ok(GateOutcome::Pending {
                    transaction_id,
                    reference,
                }) => Ok(pending_response(&transaction_id, &reference)),
                Err(e) => {
                    tracing::error!(resource = %resource, error = %e, "payment gate failure");
                    Ok(json_response(
                        e.status(),
                        &serde_json::json!({ "error": e.to_string() }),
                    ))
                }
            }
        })
    }
}

fn extract_headers(req: &Request<Body>) -> PaymentHeaders {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    PaymentHeaders {
        token: header(PAYMENT_TOKEN_HEADER),
        transaction_id: header(PAYMENT_TXID_HEADER),
        reference: header(PAYMENT_REFERENCE_HEADER),
    }
}

/// Adds `Payment-Token` / `Payment-Token-Expiry` echo headers for a freshly
/// minted grant. Token bytes are base64url, always a valid header value.
fn echo_token(response: &mut Response<Body>, grant: &AccessGrant) {
    if let Ok(value) = HeaderValue::from_str(&grant.token) {
        response
            .headers_mut()
            .insert(PAYMENT_TOKEN_RESPONSE_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&grant.expires_at.as_secs().to_string()) {
        response
            .headers_mut()
            .insert(PAYMENT_TOKEN_EXPIRY_HEADER, value);
    }
    response.headers_mut().insert(
        http::header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("payment-token, payment-token-expiry"),
    );
}

fn challenge_response(challenge: &PaymentChallenge) -> Response<Body> {
    let body = serde_json::to_string(challenge).unwrap_or_default();
    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("valid 402 response")
}

/// 402 for an unconfirmed transaction. No new reference is minted; the client
/// retries with the same headers once the transaction confirms.
fn pending_response(transaction_id: &str, reference: &str) -> Response<Body> {
    json_response(
        StatusCode::PAYMENT_REQUIRED,
        &serde_json::json!({
            "error": "transaction not yet confirmed",
            "transaction_id": transaction_id,
            "reference": reference,
            "retry": true,
        }),
    )
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid static response")
}
