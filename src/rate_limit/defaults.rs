//! Compiled-in rate limits
//!
//! Used when neither the cache nor the repository has a record, so traffic is
//! never unprotected. Development is the most permissive table and
//! production the most restrictive.

use super::types::{EndpointType, Environment, ResolutionSource, ResolvedRateLimit};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;

/// (window, development, staging, production, message) per endpoint class
const fn row(endpoint: EndpointType) -> (u64, u32, u32, u32, &'static str) {
    match endpoint {
        EndpointType::Auth => (
            15 * MINUTE_MS,
            100,
            20,
            5,
            "Too many authentication attempts, please try again later.",
        ),
        EndpointType::Api => (
            MINUTE_MS,
            1_000,
            300,
            100,
            "Too many requests, please try again later.",
        ),
        EndpointType::Trading => (
            MINUTE_MS,
            500,
            100,
            30,
            "Too many trading requests, please slow down.",
        ),
        EndpointType::Notifications => (
            MINUTE_MS,
            300,
            100,
            50,
            "Too many notification requests, please try again later.",
        ),
        EndpointType::Payments => (
            60 * MINUTE_MS,
            100,
            30,
            10,
            "Too many payment requests, please try again later.",
        ),
        EndpointType::Admin => (
            MINUTE_MS,
            500,
            100,
            50,
            "Too many admin requests, please try again later.",
        ),
        EndpointType::Global => (
            15 * MINUTE_MS,
            10_000,
            2_000,
            1_000,
            "Too many requests from this client, please try again later.",
        ),
    }
}

fn build(environment: Environment, endpoint: EndpointType, source: ResolutionSource) -> ResolvedRateLimit {
    let (window_ms, development, staging, production, message) = row(endpoint);
    let max = match environment {
        Environment::Development => development,
        Environment::Staging => staging,
        // Global has no table of its own; use the strictest one
        Environment::Production | Environment::Global => production,
    };

    ResolvedRateLimit {
        window_ms,
        max,
        message: message.to_string(),
        // Login abuse is counted on failures only
        skip_successful_requests: endpoint == EndpointType::Auth,
        source,
    }
}

/// Static limit for an environment and endpoint class
pub fn static_limit(environment: Environment, endpoint: EndpointType) -> ResolvedRateLimit {
    build(environment, endpoint, ResolutionSource::Static)
}

/// Limit used when resolution itself fails
pub fn fallback_limit(endpoint: EndpointType) -> ResolvedRateLimit {
    build(Environment::Development, endpoint, ResolutionSource::Fallback)
}
