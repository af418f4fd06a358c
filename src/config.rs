//! Configuration parsing for fhirhook.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::backend::FhirVersion;
use crate::observability::tracing::LogFormat;
use crate::payload::PayloadType;
use crate::service::registry::{RegistryConfig, DEFAULT_REASON};
use crate::service::DecodeFailurePolicy;

/// fhirhook: shares FHIR rest-hook subscriptions between local consumers.
#[derive(Parser, Debug, Clone)]
#[command(name = "fhirhook")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "FHIRHOOK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port the webhook listens on
    #[arg(short, long, env = "FHIRHOOK_PORT", default_value_t = 8090)]
    pub port: u16,

    /// Path prefix of the webhook routes
    #[arg(long, env = "FHIRHOOK_WEBHOOK_PATH", default_value = "/fhir-callback")]
    pub webhook_path: String,

    /// Public URL of the webhook as seen by the FHIR server (disabled if unset)
    #[arg(long, env = "FHIRHOOK_CALLBACK_URL")]
    pub callback_url: Option<String>,

    /// Base URL of the FHIR server
    #[arg(long, env = "FHIRHOOK_FHIR_BASE_URL")]
    pub fhir_base_url: Option<String>,

    /// FHIR version spoken by the server
    #[arg(long, env = "FHIRHOOK_FHIR_VERSION", value_enum, default_value_t = FhirVersion::R4)]
    pub fhir_version: FhirVersion,

    /// Reason recorded on every remote subscription
    #[arg(long, env = "FHIRHOOK_SUBSCRIPTION_REASON", default_value = DEFAULT_REASON)]
    pub subscription_reason: String,

    /// Timeout for FHIR server requests in milliseconds
    #[arg(long, env = "FHIRHOOK_BACKEND_TIMEOUT_MS", default_value_t = 10_000)]
    pub backend_timeout_ms: u64,

    /// Delete tagged subscriptions left by a previous run at startup
    #[arg(long, env = "FHIRHOOK_PURGE_ON_START", default_value_t = true, action = ArgAction::Set)]
    pub purge_on_start: bool,

    /// Handling of notification bodies that cannot be decoded
    #[arg(long, env = "FHIRHOOK_DECODE_FAILURE_POLICY", value_enum, default_value_t = DecodeFailurePolicy::Drop)]
    pub decode_failure_policy: DecodeFailurePolicy,

    /// Buffered events per stream listener
    #[arg(long, env = "FHIRHOOK_NOTIFY_CHANNEL_SIZE", default_value_t = 1024)]
    pub notify_channel_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FHIRHOOK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "FHIRHOOK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics
    #[arg(long, env = "FHIRHOOK_METRICS_ENABLED")]
    pub metrics_enabled: bool,

    /// Port of the metrics server
    #[arg(long, env = "FHIRHOOK_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Criteria to watch and log (repeatable)
    #[arg(long = "watch")]
    pub watch: Vec<String>,

    /// Payload type requested for watched criteria
    #[arg(long, value_enum, default_value_t = PayloadType::Json)]
    pub watch_payload: PayloadType,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Settings for the subscription registry.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new(self.callback_url.clone()).with_reason(self.subscription_reason.clone())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Create a configuration for tests using the given callback URL.
    pub fn test_config(callback_url: Option<&str>) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0, // Random port
            callback_url: callback_url.map(str::to_string),
            log_level: "debug".into(),
            notify_channel_size: 16,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
            webhook_path: "/fhir-callback".into(),
            callback_url: None,
            fhir_base_url: None,
            fhir_version: FhirVersion::R4,
            subscription_reason: DEFAULT_REASON.into(),
            backend_timeout_ms: 10_000,
            purge_on_start: true,
            decode_failure_policy: DecodeFailurePolicy::Drop,
            notify_channel_size: 1024,
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_port: 9090,
            watch: Vec::new(),
            watch_payload: PayloadType::Json,
        }
    }
}
