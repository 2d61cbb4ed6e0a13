//! Application configuration.
//!
//! Every setting has a safe default and can be overridden through the
//! environment (a `.env` file is honoured by `main`). Unparsable values are
//! ignored with a warning rather than aborting startup; semantic problems
//! are caught by [`AppConfig::validate`].

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use crate::api::{ApiServerConfig, JwtConfig};
use crate::collaborators::WebhookConfig;
use crate::fanout::FanoutConfig;
use crate::health::{ClassifierConfig, HealthMonitorConfig};
use crate::reconnection::ReconnectionConfig;
use crate::relay::{IngestConfig, TranscoderConfig};
use crate::resilience::CircuitBreakerConfig;
use crate::status::StatusCacheConfig;
use crate::{Error, Result};

/// Default directory for rolling log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// The full set of runtime settings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppConfig {
    pub server: ApiServerConfig,
    pub reconnection: ReconnectionConfig,
    pub classifier: ClassifierConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub status_cache: StatusCacheConfig,
    pub fanout: FanoutConfig,
    pub health: HealthMonitorConfig,
    pub transcoder: TranscoderConfig,
    pub ingest: IngestConfig,
    #[serde(skip)]
    pub jwt: Option<JwtConfig>,
    #[serde(skip)]
    pub webhook: Option<WebhookConfig>,
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Read settings from the process environment.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(&lookup);
        let mut config = Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            ..Self::default()
        };

        if let Some(address) = env.string("API_BIND_ADDRESS") {
            config.server.bind_address = address;
        }
        env.parse("API_PORT", &mut config.server.port);

        let reconnection = &mut config.reconnection;
        env.parse("RECONNECTION_ENABLED", &mut reconnection.enabled);
        env.parse("RECONNECTION_MAX_ATTEMPTS", &mut reconnection.max_attempts);
        env.parse("RECONNECTION_BASE_DELAY_MS", &mut reconnection.base_delay_ms);
        env.parse("RECONNECTION_MAX_DELAY_MS", &mut reconnection.max_delay_ms);

        env.parse("CLASSIFIER_ENABLED", &mut config.classifier.enabled);
        env.parse(
            "CLASSIFIER_LOW_BITRATE_KBPS",
            &mut config.classifier.low_bitrate_threshold_kbps,
        );

        let breaker = &mut config.circuit_breaker;
        env.parse("CIRCUIT_FAILURE_THRESHOLD", &mut breaker.failure_threshold);
        env.parse("CIRCUIT_TIMEOUT_MS", &mut breaker.timeout_ms);
        env.parse("CIRCUIT_HALF_OPEN_SUCCESSES", &mut breaker.half_open_success_threshold);

        env.parse("STATUS_CACHE_TTL_MS", &mut config.status_cache.ttl_ms);
        env.parse("STATUS_FETCH_TIMEOUT_MS", &mut config.status_cache.fetch_timeout_ms);

        env.parse("FANOUT_INTERVAL_MS", &mut config.fanout.interval_ms);
        env.parse("FANOUT_SEND_TIMEOUT_MS", &mut config.fanout.send_timeout_ms);

        env.parse("HEALTH_CHECK_INTERVAL_MS", &mut config.health.interval_ms);
        env.parse("HEALTH_STARTUP_GRACE_MS", &mut config.health.startup_grace_ms);
        env.parse("HEALTH_RELEASE_AFTER_MS", &mut config.health.release_after_ms);

        if let Some(path) = env.string("FFMPEG_PATH") {
            config.transcoder.ffmpeg_path = path;
        }
        if let Some(name) = env.string("STREAM_NAME") {
            config.transcoder.stream_name = name;
        }
        if let Some(description) = env.string("STREAM_DESCRIPTION") {
            config.transcoder.stream_description = description;
        }
        if let Some(bitrate) = env.string("TRANSCODER_AUDIO_BITRATE") {
            config.transcoder.audio_bitrate = bitrate;
        }

        let ingest = &mut config.ingest;
        if let Some(host) = env.string("ICECAST_HOST") {
            ingest.host = host;
        }
        env.parse("ICECAST_PORT", &mut ingest.port);
        if let Some(mount) = env.string("ICECAST_MOUNT") {
            ingest.mount = mount;
        }
        if let Some(user) = env.string("ICECAST_SOURCE_USER") {
            ingest.source_user = user;
        }
        if let Some(password) = env.string("ICECAST_SOURCE_PASSWORD") {
            ingest.source_password = password;
        }
        ingest.status_url = env.string("ICECAST_STATUS_URL");

        config.jwt = env.string("JWT_SECRET").map(|secret| JwtConfig {
            secret,
            issuer: env.string("JWT_ISSUER"),
            audience: env.string("JWT_AUDIENCE"),
        });

        config.webhook = env.string("NOTIFY_WEBHOOK_URL").map(|url| WebhookConfig {
            url,
            bearer_token: env.string("NOTIFY_WEBHOOK_TOKEN"),
            ..WebhookConfig::default()
        });

        if let Some(dir) = env.string("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        config
    }

    /// Reject settings that would make the core misbehave.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnection;
        if r.base_delay_ms == 0 {
            return Err(Error::config("RECONNECTION_BASE_DELAY_MS must be greater than 0"));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(Error::config(
                "RECONNECTION_MAX_DELAY_MS must not be less than RECONNECTION_BASE_DELAY_MS",
            ));
        }
        if r.max_attempts == 0 {
            return Err(Error::config("RECONNECTION_MAX_ATTEMPTS must be greater than 0"));
        }

        let b = &self.circuit_breaker;
        if b.failure_threshold == 0 || b.half_open_success_threshold == 0 {
            return Err(Error::config("Circuit breaker thresholds must be greater than 0"));
        }
        if b.timeout_ms == 0 {
            return Err(Error::config("CIRCUIT_TIMEOUT_MS must be greater than 0"));
        }

        if self.status_cache.ttl_ms == 0 || self.status_cache.fetch_timeout_ms == 0 {
            return Err(Error::config("Status cache TTL and fetch timeout must be greater than 0"));
        }
        if self.fanout.interval_ms == 0 {
            return Err(Error::config("FANOUT_INTERVAL_MS must be greater than 0"));
        }
        if self.health.interval_ms == 0 {
            return Err(Error::config("HEALTH_CHECK_INTERVAL_MS must be greater than 0"));
        }
        if self.ingest.port == 0 {
            return Err(Error::config("ICECAST_PORT must be greater than 0"));
        }
        if self.transcoder.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("FFMPEG_PATH must not be empty"));
        }

        Ok(())
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = self.string(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparsable configuration value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(|_| None);

        assert_eq!(config.server.port, 12556);
        assert!(config.reconnection.enabled);
        assert_eq!(config.reconnection.max_attempts, 5);
        assert_eq!(config.reconnection.base_delay_ms, 1_000);
        assert_eq!(config.reconnection.max_delay_ms, 30_000);
        assert_eq!(config.classifier.low_bitrate_threshold_kbps, 32);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.timeout_ms, 60_000);
        assert_eq!(config.circuit_breaker.half_open_success_threshold, 2);
        assert_eq!(config.status_cache.ttl_ms, 10_000);
        assert_eq!(config.fanout.interval_ms, 5_000);
        assert_eq!(config.ingest.status_url(), "http://localhost:8000/status-json.xsl");
        assert!(config.jwt.is_none());
        assert!(config.webhook.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("RECONNECTION_MAX_ATTEMPTS", "8"),
            ("RECONNECTION_ENABLED", "false"),
            ("ICECAST_HOST", "radio.internal"),
            ("ICECAST_PORT", "8010"),
            ("JWT_SECRET", "top-secret"),
            ("FANOUT_INTERVAL_MS", " 2500 "),
        ]));

        assert_eq!(config.reconnection.max_attempts, 8);
        assert!(!config.reconnection.enabled);
        assert_eq!(config.ingest.status_url(), "http://radio.internal:8010/status-json.xsl");
        assert_eq!(config.jwt.unwrap().secret, "top-secret");
        assert_eq!(config.fanout.interval_ms, 2_500);
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("API_PORT", "not-a-port"),
            ("CIRCUIT_TIMEOUT_MS", "-5"),
            ("JWT_SECRET", "   "),
        ]));
        assert_eq!(config.server.port, 12556);
        assert_eq!(config.circuit_breaker.timeout_ms, 60_000);
        assert!(config.jwt.is_none());
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = AppConfig::from_lookup(lookup(&[
            ("RECONNECTION_BASE_DELAY_MS", "5000"),
            ("RECONNECTION_MAX_DELAY_MS", "1000"),
        ]));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = AppConfig::from_lookup(lookup(&[("FANOUT_INTERVAL_MS", "0")]));
        assert!(config.validate().is_err());
    }
}
