//! Environment detection
//!
//! Detection walks an ordered list of pure predicates over one
//! [`EnvSnapshot`]. Explicit signals come first; heuristics only run when
//! nothing explicit is set, and `development` is the terminal default.

use super::types::Environment;
use tracing::debug;

pub const ENVIRONMENT_VAR: &str = "ENVIRONMENT";
pub const APP_ENV_VAR: &str = "APP_ENV";
pub const PORT_VAR: &str = "PORT";
pub const CORS_ORIGIN_VAR: &str = "CORS_ORIGIN";

/// Process signals consulted by detection, captured once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    /// Explicit environment name
    pub environment: Option<String>,
    /// Application runtime mode (the `NODE_ENV` of this stack)
    pub app_env: Option<String>,
    /// Listening port
    pub port: Option<u16>,
    /// Allowed CORS origin(s)
    pub cors_origin: Option<String>,
}

impl EnvSnapshot {
    /// Capture the current process environment. `listen_port` is used when
    /// `PORT` is not set.
    pub fn from_process(listen_port: Option<u16>) -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            environment: read(ENVIRONMENT_VAR),
            app_env: read(APP_ENV_VAR),
            port: read(PORT_VAR)
                .and_then(|p| p.parse().ok())
                .or(listen_port),
            cors_origin: read(CORS_ORIGIN_VAR),
        }
    }
}

/// A single detection rule
pub type Detector = fn(&EnvSnapshot) -> Option<Environment>;

/// Detection rules in priority order
pub const DETECTORS: [(&str, Detector); 4] = [
    ("explicit", from_explicit),
    ("app_env", from_app_env),
    ("port", from_port),
    ("cors_origin", from_cors_origin),
];

fn parse_runtime(value: Option<&str>) -> Option<Environment> {
    value
        .and_then(|v| v.parse::<Environment>().ok())
        .filter(|env| *env != Environment::Global)
}

pub fn from_explicit(snapshot: &EnvSnapshot) -> Option<Environment> {
    parse_runtime(snapshot.environment.as_deref())
}

pub fn from_app_env(snapshot: &EnvSnapshot) -> Option<Environment> {
    parse_runtime(snapshot.app_env.as_deref())
}

pub fn from_port(snapshot: &EnvSnapshot) -> Option<Environment> {
    match snapshot.port? {
        80 | 443 => Some(Environment::Production),
        4000 | 8443 => Some(Environment::Staging),
        3000 | 3001 | 5173 | 8000 => Some(Environment::Development),
        _ => None,
    }
}

pub fn from_cors_origin(snapshot: &EnvSnapshot) -> Option<Environment> {
    let origin = snapshot.cors_origin.as_deref()?.to_ascii_lowercase();

    if origin.contains("localhost") || origin.contains("127.0.0.1") {
        Some(Environment::Development)
    } else if origin.contains("staging") || origin.contains("stage.") {
        Some(Environment::Staging)
    } else if origin.starts_with("https://") {
        Some(Environment::Production)
    } else {
        None
    }
}

/// Run the detectors in order; the first match wins
pub fn detect_environment(snapshot: &EnvSnapshot) -> Environment {
    for (name, detector) in DETECTORS {
        if let Some(env) = detector(snapshot) {
            debug!(detector = name, environment = %env, "Detected environment");
            return env;
        }
    }

    debug!("No environment signal, defaulting to development");
    Environment::Development
}
