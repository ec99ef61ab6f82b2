//! Environment-derived configuration.
//!
//! Read once at boot; any problem here aborts startup rather than
//! limping along with a half-configured oracle.

use std::env;
use thiserror::Error;

use crate::scheduler::HORIZON_DAYS_DEFAULT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the encrypted secret file.
    pub key_secret_file_name: String,
    /// Password the secret file is encrypted with.
    pub key_secret_pwd: String,
    /// Directory holding `ora.db`.
    pub db_dir: String,
    /// How far ahead the scheduler maintains pre-committed events.
    pub horizon_days: u32,
    /// Enables the schema endpoint and the outcome-preview endpoint.
    pub demo_mode: bool,
    pub bind_addr: String,
}

pub fn flag_is_set(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "on" | "ON")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let key_secret_file_name =
            env::var("KEY_SECRET_FILE_NAME").unwrap_or_else(|_| "secret.sec".to_string());
        let key_secret_pwd =
            env::var("KEY_SECRET_PWD").map_err(|_| ConfigError::MissingVar("KEY_SECRET_PWD"))?;
        let db_dir = env::var("DB_DIR").unwrap_or_else(|_| ".".to_string());

        let horizon_days = match env::var("HORIZON_DAYS") {
            Err(_) => HORIZON_DAYS_DEFAULT,
            Ok(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|d| *d > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: "HORIZON_DAYS",
                    value: raw,
                })?,
        };

        let demo_mode = env::var("DEMO_MODE")
            .map(|v| flag_is_set(&v))
            .unwrap_or(false);
        let bind_addr =
            env::var("ORACLE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        Ok(Self {
            key_secret_file_name,
            key_secret_pwd,
            db_dir,
            horizon_days,
            demo_mode,
            bind_addr,
        })
    }
}
