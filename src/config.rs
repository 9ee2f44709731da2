//! Configuration types.
//!
//! Everything is read from `CARE_BOOKING_*` environment variables with
//! defaults suitable for local development.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Booking flow behaviour.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Only list providers that have at least one open slot ahead.
    pub only_available_providers: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            only_available_providers: true,
        }
    }
}

/// Session registry limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are abandoned and dropped.
    pub idle_timeout: Duration,
    /// How often the idle sweep runs.
    pub sweep_interval: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60), // 30 minutes
            sweep_interval: Duration::from_secs(60),
            max_sessions: 10_000,
        }
    }
}

/// Which directory backend to talk to.
#[derive(Debug, Clone)]
pub enum DirectoryConfig {
    /// Hosted database-as-a-service over HTTP.
    Rest {
        base_url: String,
        api_key: SecretString,
        timeout: Duration,
    },
    /// Local libSQL file.
    Local {
        db_path: PathBuf,
        /// Load the demo catalog on startup.
        seed_demo: bool,
    },
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub directory: DirectoryConfig,
    pub flow: FlowConfig,
    pub session: SessionConfig,
}

impl ServiceConfig {
    /// Build config from environment variables.
    ///
    /// `CARE_BOOKING_DIRECTORY_URL` selects the REST backend (and then
    /// requires `CARE_BOOKING_DIRECTORY_KEY`); otherwise a local libSQL file
    /// at `CARE_BOOKING_DB_PATH` is used.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr =
            std::env::var("CARE_BOOKING_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let directory = match std::env::var("CARE_BOOKING_DIRECTORY_URL") {
            Ok(base_url) => {
                let api_key = std::env::var("CARE_BOOKING_DIRECTORY_KEY").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "CARE_BOOKING_DIRECTORY_KEY".to_string(),
                        hint: "Required when CARE_BOOKING_DIRECTORY_URL is set.".to_string(),
                    }
                })?;
                let timeout_secs = parse_env("CARE_BOOKING_DIRECTORY_TIMEOUT_SECS", 10u64)?;
                DirectoryConfig::Rest {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    api_key: SecretString::from(api_key),
                    timeout: Duration::from_secs(timeout_secs),
                }
            }
            Err(_) => DirectoryConfig::Local {
                db_path: std::env::var("CARE_BOOKING_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data/care-booking.db")),
                seed_demo: parse_env("CARE_BOOKING_SEED_DEMO", false)?,
            },
        };

        let flow = FlowConfig {
            only_available_providers: parse_env("CARE_BOOKING_ONLY_AVAILABLE_PROVIDERS", true)?,
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            idle_timeout: Duration::from_secs(parse_env(
                "CARE_BOOKING_SESSION_IDLE_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_env(
                "CARE_BOOKING_SESSION_SWEEP_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            max_sessions: parse_env("CARE_BOOKING_MAX_SESSIONS", defaults.max_sessions)?,
        };
        if session.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CARE_BOOKING_MAX_SESSIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            directory,
            flow,
            session,
        })
    }
}

/// Parse an optional environment variable, falling back to `default` when
/// unset. A set but unparseable value is an error rather than a silent
/// default.
fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}
