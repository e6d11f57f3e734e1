use super::service::RateLimiterService;
use super::types::{EndpointType, RateLimitResult};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Client identity used for counting: first forwarded address, then the
/// peer address, then a shared anonymous bucket
pub fn client_identity(request: &Request) -> String {
    let headers = request.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Add rate limit headers to a response
pub fn add_rate_limit_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(result.reset_after));
}

/// Axum middleware enforcing the resolved limit for the request's endpoint
/// class
///
/// Failed responses (4xx/5xx) are reported back so endpoints that skip
/// successful requests count them.
pub async fn rate_limit_middleware(
    State(service): State<Arc<RateLimiterService>>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint_type = EndpointType::classify_path(request.uri().path());
    let identity = client_identity(&request);

    let decision = service.check(&identity, endpoint_type).await;
    if !decision.result.allowed {
        let result = decision.result.clone();
        let mut response = decision.into_error().into_response();
        add_rate_limit_headers(response.headers_mut(), &result);
        return response;
    }

    let mut response = next.run(request).await;

    let status = response.status();
    let success = !(status.is_client_error() || status.is_server_error());
    if decision.limit.skip_successful_requests {
        service.record_outcome(&identity, endpoint_type, success).await;
    }

    add_rate_limit_headers(response.headers_mut(), &decision.result);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_identity_prefers_forwarded_for() {
        let request = axum::http::Request::builder()
            .uri("/api/orders")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "10.0.0.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_identity(&request), "203.0.113.7");
    }

    #[test]
    fn test_identity_uses_connect_info() {
        let mut request = axum::http::Request::builder()
            .uri("/api/orders")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 20], 5000))));
        assert_eq!(client_identity(&request), "192.168.1.20");
    }

    #[test]
    fn test_identity_defaults_to_anonymous() {
        let request = axum::http::Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_identity(&request), "anonymous");
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, &RateLimitResult::denied(100, 30));

        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "30");
    }
}
