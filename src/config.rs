// src/config.rs

use std::{env, str::FromStr, time::Duration};

use dotenvy::dotenv;

/// Normalized grades are expressed out of 20.
pub const GRADE_SCALE: f64 = 20.0;

/// Coefficient used when an assessment is created without one.
pub const DEFAULT_COEFFICIENT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiration: u64,
    pub rust_log: String,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub server_port: u16,

    /// A staged answer batch is flushed once it has been idle this long.
    pub autosave_debounce: Duration,
    /// Upper bound on how long a batch may sit in memory while still being edited.
    pub autosave_max_delay: Duration,
    pub autosave_tick: Duration,

    /// Number of non-fatal violations tolerated before an attempt is terminated.
    pub violation_tolerance: u32,
    /// Late window after the deadline during which a submission still counts as on time.
    pub submission_grace: chrono::Duration,
    pub expiry_sweep_interval: Duration,

    /// Variables that were set but could not be parsed, reported once logging is up.
    pub ignored_vars: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let mut ignored = Vec::new();

        Self {
            database_url,
            jwt_secret,
            jwt_expiration: env_or("JWT_EXPIRATION", 86_400, &mut ignored),
            rust_log,
            admin_username: env::var("ADMIN_USERNAME").ok(),
            admin_password: env::var("ADMIN_PASSWORD").ok(),
            server_port: env_or("SERVER_PORT", 3000, &mut ignored),
            autosave_debounce: Duration::from_millis(env_or("AUTOSAVE_DEBOUNCE_MS", 2_000, &mut ignored)),
            autosave_max_delay: Duration::from_millis(env_or(
                "AUTOSAVE_MAX_DELAY_MS",
                10_000,
                &mut ignored,
            )),
            autosave_tick: Duration::from_millis(env_or("AUTOSAVE_TICK_MS", 500, &mut ignored)),
            violation_tolerance: env_or("VIOLATION_TOLERANCE", 0, &mut ignored),
            submission_grace: chrono::Duration::seconds(env_or(
                "SUBMISSION_GRACE_SECS",
                30,
                &mut ignored,
            )),
            expiry_sweep_interval: Duration::from_secs(env_or("EXPIRY_SWEEP_SECS", 15, &mut ignored)),
            ignored_vars: ignored,
        }
    }

    /// Configuration for tests and tools that build the router without a real environment.
    pub fn for_tests(database_url: &str, jwt_secret: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            jwt_secret: jwt_secret.to_string(),
            jwt_expiration: 600,
            rust_log: "error".to_string(),
            admin_username: None,
            admin_password: None,
            server_port: 0,
            autosave_debounce: Duration::from_millis(200),
            autosave_max_delay: Duration::from_secs(1),
            autosave_tick: Duration::from_millis(100),
            violation_tolerance: 0,
            submission_grace: chrono::Duration::seconds(30),
            expiry_sweep_interval: Duration::from_secs(1),
            ignored_vars: Vec::new(),
        }
    }
}

/// Reads an optional variable, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T, ignored: &mut Vec<String>) -> T {
    parse_or(key, env::var(key).ok(), default, ignored)
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T, ignored: &mut Vec<String>) -> T {
    match raw {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            ignored.push(format!("{}={:?}", key, raw));
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_values_fall_back_and_are_recorded() {
        let mut ignored = Vec::new();

        let port: u64 = parse_or("SERVER_PORT", Some("8080".to_string()), 3000, &mut ignored);
        assert_eq!(port, 8080);
        let unset: u64 = parse_or("AUTOSAVE_TICK_MS", None, 500, &mut ignored);
        assert_eq!(unset, 500);
        assert!(ignored.is_empty());

        let grace: u64 = parse_or("SUBMISSION_GRACE_SECS", Some("soon".to_string()), 30, &mut ignored);
        assert_eq!(grace, 30);
        assert_eq!(ignored, vec!["SUBMISSION_GRACE_SECS=\"soon\"".to_string()]);
    }
}
