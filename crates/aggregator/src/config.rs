// Aggregator configuration.
//
// Everything is read from environment variables with defaults matching the
// hosted queue/REST setup. Only the API key is mandatory.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::engine::DEFAULT_VERIFY_DELAY;
use crate::error::ConfigError;
use crate::ingest::MalformedPolicy;
use crate::publish::DEFAULT_PUBLISH_INTERVAL;

const DEFAULT_REST_HOST: &str = "rest.ably.io";
const DEFAULT_NAMESPACE: &str = "^presence:.*";
const DEFAULT_PRESENCE_QUEUE: &str = "presence-queue";
const DEFAULT_OCCUPANCY_QUEUE: &str = "occupancy-queue";
const DEFAULT_PUBLISH_PREFIX: &str = "presencebatch";
const DEFAULT_QUEUE_ENDPOINT: &str = "eu-west-1-a-queue.ably.io:5671/shared";
const DEFAULT_QUEUE_PREFETCH: u16 = 64;

/// Where queue deliveries come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueSource {
    /// The hosted AMQP queues.
    #[default]
    Amqp,
    /// NDJSON frames on standard input.
    Stdin,
}

impl FromStr for QueueSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amqp" | "amqps" => Ok(Self::Amqp),
            "stdin" => Ok(Self::Stdin),
            other => Err(format!("unknown queue source: {other}")),
        }
    }
}

/// API key in `name:secret` form, where `name` is `appId.keyId`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    name: String,
    secret: String,
}

impl ApiKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let (name, secret) = raw.split_once(':')?;
        if name.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self { name: name.to_string(), secret: secret.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Application id: the part of the key name before the first `.`.
    pub fn app_id(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey").field("name", &self.name).field("secret", &"<redacted>").finish()
    }
}

/// Channel namespace filter applied to enumerated channels.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    pattern: Regex,
}

impl NamespaceFilter {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self { pattern: Regex::new(pattern)? })
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.pattern.is_match(channel)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub api_key: ApiKey,
    /// Base URL for snapshot, enumeration and publish requests.
    pub rest_base_url: Url,
    pub namespace: NamespaceFilter,
    pub presence_queue: String,
    pub occupancy_queue: String,
    pub queue_source: QueueSource,
    /// Broker `host:port/vhost`, or a full `amqp(s)://` URI.
    pub queue_endpoint: String,
    pub queue_prefetch: u16,
    /// Build initial state from a full snapshot before consuming events.
    pub fetch_initial_state: bool,
    pub verify_delay: Duration,
    /// `None` disables aggregate publication.
    pub publish_interval: Option<Duration>,
    pub publish_prefix: String,
    /// Log aggregates instead of publishing them.
    pub publish_dry_run: bool,
    pub malformed_policy: MalformedPolicy,
    /// Listener for `/healthz`, `/metrics` and `/control`.
    pub metrics_addr: Option<SocketAddr>,
    /// Log filter directive (e.g. `info`, `presence_aggregator=debug`).
    pub log_filter: String,
}

impl AggregatorConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `ABLY_API_KEY` | *(required)* |
    /// | `ABLY_ENVIRONMENT` | *(none)* |
    /// | `ABLY_REST_HOST` | `rest.ably.io` or `{environment}-rest.ably.io` |
    /// | `NAMESPACE_REGEX` | `^presence:.*` |
    /// | `PRESENCE_QUEUE_NAME` | `presence-queue` |
    /// | `OCCUPANCY_QUEUE_NAME` | `occupancy-queue` |
    /// | `QUEUE_ENDPOINT` | `eu-west-1-a-queue.ably.io:5671/shared` |
    /// | `PRESENCE_QUEUE_SOURCE` | `amqp` (`stdin` reads NDJSON frames) |
    /// | `PRESENCE_QUEUE_PREFETCH` | `64` |
    /// | `FETCH_INITIAL_PRESENCE_STATE` | `false` |
    /// | `PRESENCE_VERIFY_DELAY_MS` | `5000` |
    /// | `PRESENCE_PUBLISH_INTERVAL_MS` | `3000` (`0` disables) |
    /// | `PRESENCE_PUBLISH_PREFIX` | `presencebatch` |
    /// | `PRESENCE_PUBLISH_DRY_RUN` | `false` |
    /// | `PRESENCE_MALFORMED_POLICY` | `drop` |
    /// | `PRESENCE_METRICS_ADDR` | *(none)* |
    /// | `PRESENCE_LOG_FILTER` | `info` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let raw_key = env("ABLY_API_KEY").map_err(|_| ConfigError::Missing("ABLY_API_KEY"))?;
        let api_key = ApiKey::parse(&raw_key).ok_or(ConfigError::Invalid {
            key: "ABLY_API_KEY",
            value: "<expected name:secret>".into(),
        })?;

        let environment = env("ABLY_ENVIRONMENT").ok().filter(|v| !v.is_empty());
        let rest_host = env("ABLY_REST_HOST").unwrap_or_else(|_| match &environment {
            Some(environment) => format!("{environment}-{DEFAULT_REST_HOST}"),
            None => DEFAULT_REST_HOST.to_string(),
        });
        let rest_base_url = parse_base_url(&rest_host)?;

        let namespace = NamespaceFilter::new(
            &env("NAMESPACE_REGEX").unwrap_or_else(|_| DEFAULT_NAMESPACE.into()),
        )?;

        let presence_queue =
            env("PRESENCE_QUEUE_NAME").unwrap_or_else(|_| DEFAULT_PRESENCE_QUEUE.into());
        let occupancy_queue =
            env("OCCUPANCY_QUEUE_NAME").unwrap_or_else(|_| DEFAULT_OCCUPANCY_QUEUE.into());

        let queue_source = match env("PRESENCE_QUEUE_SOURCE") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "PRESENCE_QUEUE_SOURCE",
                value,
            })?,
            Err(_) => QueueSource::default(),
        };
        let queue_endpoint =
            env("QUEUE_ENDPOINT").unwrap_or_else(|_| DEFAULT_QUEUE_ENDPOINT.into());
        let queue_prefetch = match env("PRESENCE_QUEUE_PREFETCH") {
            Ok(value) => match value.trim().parse::<u16>() {
                Ok(prefetch) if prefetch > 0 => prefetch,
                _ => return Err(ConfigError::Invalid { key: "PRESENCE_QUEUE_PREFETCH", value }),
            },
            Err(_) => DEFAULT_QUEUE_PREFETCH,
        };

        let fetch_initial_state =
            env("FETCH_INITIAL_PRESENCE_STATE").map(|v| parse_flag(&v)).unwrap_or(false);

        let verify_delay = parse_millis(&env, "PRESENCE_VERIFY_DELAY_MS")?
            .unwrap_or(DEFAULT_VERIFY_DELAY);

        let publish_interval = parse_millis(&env, "PRESENCE_PUBLISH_INTERVAL_MS")?
            .unwrap_or(DEFAULT_PUBLISH_INTERVAL);
        let publish_interval = (!publish_interval.is_zero()).then_some(publish_interval);

        let publish_prefix =
            env("PRESENCE_PUBLISH_PREFIX").unwrap_or_else(|_| DEFAULT_PUBLISH_PREFIX.into());

        let publish_dry_run =
            env("PRESENCE_PUBLISH_DRY_RUN").map(|v| parse_flag(&v)).unwrap_or(false);

        let malformed_policy = match env("PRESENCE_MALFORMED_POLICY") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "PRESENCE_MALFORMED_POLICY",
                value,
            })?,
            Err(_) => MalformedPolicy::default(),
        };

        let metrics_addr = match env("PRESENCE_METRICS_ADDR") {
            Ok(value) => Some(value.parse().map_err(|_| ConfigError::Invalid {
                key: "PRESENCE_METRICS_ADDR",
                value,
            })?),
            Err(_) => None,
        };

        let log_filter = env("PRESENCE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Ok(Self {
            api_key,
            rest_base_url,
            namespace,
            presence_queue,
            occupancy_queue,
            queue_source,
            queue_endpoint,
            queue_prefetch,
            fetch_initial_state,
            verify_delay,
            publish_interval,
            publish_prefix,
            publish_dry_run,
            malformed_policy,
            metrics_addr,
            log_filter,
        })
    }
}

fn parse_base_url(host: &str) -> Result<Url, ConfigError> {
    let candidate =
        if host.contains("://") { host.to_string() } else { format!("https://{host}/") };
    Url::parse(&candidate)
        .map_err(|_| ConfigError::Invalid { key: "ABLY_REST_HOST", value: host.to_string() })
}

/// Optional millisecond duration; present but unparseable is an error.
fn parse_millis<F>(env: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "app123.key456:s3cr3t";

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
        }
    }

    fn with_key(extra: &[(&'static str, &'static str)]) -> AggregatorConfig {
        let mut m = HashMap::from([("ABLY_API_KEY", KEY)]);
        m.extend(extra.iter().copied());
        AggregatorConfig::from_env_fn(env_from_map(m)).expect("config should parse")
    }

    #[test]
    fn defaults_when_only_key_is_set() {
        let cfg = with_key(&[]);
        assert_eq!(cfg.api_key.name(), "app123.key456");
        assert_eq!(cfg.api_key.app_id(), "app123");
        assert_eq!(cfg.rest_base_url.as_str(), "https://rest.ably.io/");
        assert_eq!(cfg.namespace.as_str(), "^presence:.*");
        assert_eq!(cfg.presence_queue, "presence-queue");
        assert_eq!(cfg.occupancy_queue, "occupancy-queue");
        assert_eq!(cfg.queue_source, QueueSource::Amqp);
        assert_eq!(cfg.queue_endpoint, "eu-west-1-a-queue.ably.io:5671/shared");
        assert_eq!(cfg.queue_prefetch, 64);
        assert!(!cfg.fetch_initial_state);
        assert_eq!(cfg.verify_delay, Duration::from_secs(5));
        assert_eq!(cfg.publish_interval, Some(Duration::from_secs(3)));
        assert_eq!(cfg.publish_prefix, "presencebatch");
        assert!(!cfg.publish_dry_run);
        assert_eq!(cfg.malformed_policy, MalformedPolicy::DropAndAck);
        assert!(cfg.metrics_addr.is_none());
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = AggregatorConfig::from_env_fn(env_from_map(HashMap::new())).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ABLY_API_KEY")));
    }

    #[test]
    fn key_without_secret_is_invalid() {
        let m = HashMap::from([("ABLY_API_KEY", "app.key")]);
        let err = AggregatorConfig::from_env_fn(env_from_map(m)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ABLY_API_KEY", .. }));
    }

    #[test]
    fn environment_prefixes_rest_host() {
        let cfg = with_key(&[("ABLY_ENVIRONMENT", "sandbox")]);
        assert_eq!(cfg.rest_base_url.as_str(), "https://sandbox-rest.ably.io/");
    }

    #[test]
    fn explicit_rest_host_accepts_full_url() {
        let cfg = with_key(&[("ABLY_REST_HOST", "http://127.0.0.1:9000")]);
        assert_eq!(cfg.rest_base_url.as_str(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn invalid_namespace_is_an_error() {
        let mut m = HashMap::from([("ABLY_API_KEY", KEY)]);
        m.insert("NAMESPACE_REGEX", "([unclosed");
        let err = AggregatorConfig::from_env_fn(env_from_map(m)).unwrap_err();
        assert!(matches!(err, ConfigError::Namespace(_)));
    }

    #[test]
    fn initial_fetch_flag_parses_truthy_values() {
        assert!(with_key(&[("FETCH_INITIAL_PRESENCE_STATE", "true")]).fetch_initial_state);
        assert!(with_key(&[("FETCH_INITIAL_PRESENCE_STATE", "1")]).fetch_initial_state);
        assert!(!with_key(&[("FETCH_INITIAL_PRESENCE_STATE", "no")]).fetch_initial_state);
    }

    #[test]
    fn timing_overrides() {
        let cfg = with_key(&[
            ("PRESENCE_VERIFY_DELAY_MS", "250"),
            ("PRESENCE_PUBLISH_INTERVAL_MS", "0"),
            ("PRESENCE_PUBLISH_DRY_RUN", "yes"),
        ]);
        assert_eq!(cfg.verify_delay, Duration::from_millis(250));
        assert!(cfg.publish_interval.is_none());
        assert!(cfg.publish_dry_run);
    }

    #[test]
    fn unparseable_durations_are_errors() {
        for key in ["PRESENCE_VERIFY_DELAY_MS", "PRESENCE_PUBLISH_INTERVAL_MS"] {
            let m = HashMap::from([("ABLY_API_KEY", KEY), (key, "soon")]);
            let err = AggregatorConfig::from_env_fn(env_from_map(m)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, ref value } if k == key && value == "soon"),
                "{key} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn invalid_metrics_addr_is_an_error() {
        let m = HashMap::from([("ABLY_API_KEY", KEY), ("PRESENCE_METRICS_ADDR", "nowhere")]);
        let err = AggregatorConfig::from_env_fn(env_from_map(m)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PRESENCE_METRICS_ADDR", .. }));
    }

    #[test]
    fn malformed_policy_override() {
        let cfg = with_key(&[("PRESENCE_MALFORMED_POLICY", "reject")]);
        assert_eq!(cfg.malformed_policy, MalformedPolicy::Reject);

        let mut m = HashMap::from([("ABLY_API_KEY", KEY)]);
        m.insert("PRESENCE_MALFORMED_POLICY", "shrug");
        assert!(AggregatorConfig::from_env_fn(env_from_map(m)).is_err());
    }

    #[test]
    fn queue_transport_overrides() {
        let cfg = with_key(&[
            ("PRESENCE_QUEUE_SOURCE", "stdin"),
            ("QUEUE_ENDPOINT", "us-east-1-a-queue.ably.io:5671/shared"),
            ("PRESENCE_QUEUE_PREFETCH", "8"),
        ]);
        assert_eq!(cfg.queue_source, QueueSource::Stdin);
        assert_eq!(cfg.queue_endpoint, "us-east-1-a-queue.ably.io:5671/shared");
        assert_eq!(cfg.queue_prefetch, 8);

        for (key, value) in [("PRESENCE_QUEUE_SOURCE", "kafka"), ("PRESENCE_QUEUE_PREFETCH", "0")] {
            let m = HashMap::from([("ABLY_API_KEY", KEY), (key, value)]);
            let err = AggregatorConfig::from_env_fn(env_from_map(m)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: k, .. } if k == key));
        }
    }

    #[test]
    fn metrics_addr_parses() {
        let cfg = with_key(&[("PRESENCE_METRICS_ADDR", "127.0.0.1:9464")]);
        assert_eq!(cfg.metrics_addr.unwrap().port(), 9464);
    }

    #[test]
    fn namespace_filter_matches() {
        let filter = NamespaceFilter::new(DEFAULT_NAMESPACE).unwrap();
        assert!(filter.matches("presence:lobby"));
        assert!(!filter.matches("chat:lobby"));
    }

    #[test]
    fn api_key_debug_redacts_secret() {
        let key = ApiKey::parse(KEY).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("app123.key456"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
