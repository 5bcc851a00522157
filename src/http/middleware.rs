//! Tower middleware enforcing one rule per request.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{
        header::RETRY_AFTER,
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::SecondsFormat;
use futures::future::BoxFuture;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{instrument, trace, warn};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{millis_to_datetime, Decision, RateLimiterBackend};

/// Maps a request to the identifier it is limited under. `None` skips limiting.
pub type IdentifierFn = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Layer applying a [`RateLimitService`] to every request.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiterBackend>,
    rule: Arc<str>,
    identify: IdentifierFn,
}

impl RateLimitLayer {
    /// Limit requests under `rule_name`, identifying callers with `identifier_fn`.
    pub fn new<F>(
        limiter: Arc<dyn RateLimiterBackend>,
        rule_name: impl Into<String>,
        identifier_fn: F,
    ) -> Result<Self>
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        let rule: String = rule_name.into();
        if rule.is_empty() {
            return Err(GatekeeperError::Validation(
                "middleware rule name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            limiter,
            rule: rule.into(),
            identify: Arc::new(identifier_fn),
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            rule: self.rule.clone(),
            identify: self.identify.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<dyn RateLimiterBackend>,
    rule: Arc<str>,
    identify: IdentifierFn,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The clone may not be ready; keep the one that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        let rule = self.rule.clone();
        let identifier = (self.identify)(&request);

        Box::pin(async move {
            let Some(identifier) = identifier else {
                trace!(rule = %rule, "No identifier, skipping rate limit");
                return inner.call(request).await;
            };

            match admit(limiter.as_ref(), &rule, &identifier).await {
                Some(decision) if !decision.allowed => {
                    Ok(rejection(&decision, limiter.now_millis()))
                }
                Some(decision) => {
                    let mut response = inner.call(request).await?;
                    set_limit_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                None => inner.call(request).await,
            }
        })
    }
}

/// Consume one token. `None` means the limiter failed and the request goes through.
#[instrument(skip(limiter), level = "debug")]
async fn admit(limiter: &dyn RateLimiterBackend, rule: &str, identifier: &str) -> Option<Decision> {
    match limiter.consume_token(identifier, rule, 1).await {
        Ok(decision) => {
            if let Some(error) = &decision.error {
                warn!(error = %error, "Rate limiter degraded, request allowed");
            }
            Some(decision)
        }
        Err(e) => {
            warn!(error = %e, "Rate limiter error, request allowed");
            None
        }
    }
}

fn set_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    let reset = decision.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(RESET_HEADER, value);
    }
}

fn rejection(decision: &Decision, now_ms: u64) -> Response {
    let retry_after = decision.retry_after(millis_to_datetime(now_ms)).as_secs();
    let message = if decision.blocked {
        "Too many attempts, temporarily blocked"
    } else {
        "Rate limit exceeded"
    };

    // The body carries the absolute reset time, the header the delay in seconds
    let body = json!({
        "error": message,
        "retryAfter": decision.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "blocked": decision.blocked,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Identify callers by the value of header `name`.
pub fn by_header(name: &'static str) -> impl Fn(&Request) -> Option<String> + Clone + Send + Sync {
    move |request: &Request| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Identify callers by client IP: first `X-Forwarded-For` hop, then the peer address.
pub fn by_client_ip(request: &Request<Body>) -> Option<String> {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());

    if let Some(hop) = forwarded {
        return Some(hop.to_string());
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Identify callers by header `name`, falling back to [`by_client_ip`].
pub fn by_header_or_client_ip(
    name: &'static str,
) -> impl Fn(&Request) -> Option<String> + Clone + Send + Sync {
    let header = by_header(name);
    move |request: &Request| header(request).or_else(|| by_client_ip(request))
}
