use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::coordinator::FulfillmentSettings;
use crate::engine::HoldPolicy;
use crate::limits::DEFAULT_WEBHOOK_PAYLOAD_LIMIT;
use crate::payment::WebhookSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive was configured as zero.
    ZeroDuration(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroDuration(var) => write!(f, "{var} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process configuration, read from `HOLDFAST_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub initial_hold_secs: u64,
    pub hold_extension_secs: u64,
    pub fulfillment_lease_secs: u64,
    pub webhook_secret: String,
    pub webhook_payload_limit: usize,
    pub signature_tolerance_secs: i64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "holdfast".into(),
            max_connections: 256,
            compact_threshold: 1000,
            initial_hold_secs: 60,
            hold_extension_secs: 30,
            fulfillment_lease_secs: 120,
            webhook_secret: String::new(),
            webhook_payload_limit: DEFAULT_WEBHOOK_PAYLOAD_LIMIT,
            signature_tolerance_secs: 300,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> T {
    match lookup(var) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("{var}={raw:?} is not valid, using default");
                default
            }
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Config::default();
        let config = Config {
            port: parsed(&lookup, "HOLDFAST_PORT", d.port),
            bind: lookup("HOLDFAST_BIND").unwrap_or(d.bind),
            data_dir: lookup("HOLDFAST_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            password: lookup("HOLDFAST_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "HOLDFAST_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "HOLDFAST_COMPACT_THRESHOLD", d.compact_threshold),
            initial_hold_secs: parsed(&lookup, "HOLDFAST_HOLD_SECONDS", d.initial_hold_secs),
            hold_extension_secs: parsed(
                &lookup,
                "HOLDFAST_HOLD_EXTENSION_SECONDS",
                d.hold_extension_secs,
            ),
            fulfillment_lease_secs: parsed(
                &lookup,
                "HOLDFAST_FULFILLMENT_LEASE_SECONDS",
                d.fulfillment_lease_secs,
            ),
            webhook_secret: lookup("HOLDFAST_WEBHOOK_SECRET").unwrap_or(d.webhook_secret),
            webhook_payload_limit: parsed(
                &lookup,
                "HOLDFAST_WEBHOOK_PAYLOAD_LIMIT",
                d.webhook_payload_limit,
            ),
            signature_tolerance_secs: parsed(
                &lookup,
                "HOLDFAST_SIGNATURE_TOLERANCE_SECONDS",
                d.signature_tolerance_secs,
            ),
            tls_cert: lookup("HOLDFAST_TLS_CERT"),
            tls_key: lookup("HOLDFAST_TLS_KEY"),
            metrics_port: lookup("HOLDFAST_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        };

        if config.initial_hold_secs == 0 {
            return Err(ConfigError::ZeroDuration("HOLDFAST_HOLD_SECONDS"));
        }
        if config.hold_extension_secs == 0 {
            return Err(ConfigError::ZeroDuration("HOLDFAST_HOLD_EXTENSION_SECONDS"));
        }
        if config.fulfillment_lease_secs == 0 {
            return Err(ConfigError::ZeroDuration("HOLDFAST_FULFILLMENT_LEASE_SECONDS"));
        }
        if config.webhook_secret.is_empty() {
            warn!("HOLDFAST_WEBHOOK_SECRET is not set; every webhook will fail verification");
        }
        Ok(config)
    }

    pub fn hold_policy(&self) -> HoldPolicy {
        HoldPolicy {
            initial_hold_ms: self.initial_hold_secs as i64 * 1000,
            extension_ms: self.hold_extension_secs as i64 * 1000,
            claim_lease_ms: self.fulfillment_lease_secs as i64 * 1000,
        }
    }

    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            secret: self.webhook_secret.clone(),
            payload_limit: self.webhook_payload_limit,
            tolerance_secs: self.signature_tolerance_secs,
        }
    }

    pub fn fulfillment_settings(&self) -> FulfillmentSettings {
        FulfillmentSettings::default()
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("holdfast.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
