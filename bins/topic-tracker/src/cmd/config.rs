use clap::Args;
use serde::Deserialize;

use sink_elasticsearch::ElasticsearchConfig;
use source_mqtt::MqttConfig;
use tracker_engine::{IngestConfig, PartialFailurePolicy};

use super::error::TrackerError;

const MATCH_ALL: &str = "#";

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub ingest: IngestSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub url: Option<String>,
    pub vpn_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub topic_subscriptions: Option<Vec<String>>,
    pub connect_retries: Option<i32>,
    pub reconnect_retries: Option<i32>,
    pub reconnect_wait_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_limit: Option<u32>,
    pub subscribe_timeout_ms: Option<u64>,
    pub ssl_validate_certificate: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSection {
    pub node: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index_name: Option<String>,
    pub tls_verify: Option<bool>,
    pub max_retries: Option<u32>,
    pub request_timeout_ms: Option<u64>,
    pub shards: Option<u32>,
    pub replicas: Option<u32>,
    pub refresh_interval: Option<String>,
    pub ilm_policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSection {
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub partial_failure: Option<PartialFailurePolicy>,
    pub shutdown_attempts: Option<u32>,
    pub shutdown_retry_delay_ms: Option<u64>,
    pub buffer_warn_threshold: Option<usize>,
}

pub fn load_config(path: &str) -> Result<Config, TrackerError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| TrackerError::Config(format!("cannot read config {path}: {e}")))?;
    toml::from_str(&content).map_err(|e| TrackerError::Config(format!("bad config {path}: {e}")))
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug, Default)]
pub struct TrackerArgs {
    /// Path to an optional TOML config file
    #[arg(long, env = "TRACKER_CONFIG")]
    pub config: Option<String>,

    /// Broker URL, mqtt://host:1883 or mqtts://host:8883
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: Option<String>,

    /// Namespace (message VPN) stamped on every record
    #[arg(long, env = "BROKER_VPN_NAME")]
    pub broker_vpn_name: Option<String>,

    #[arg(long, env = "BROKER_USERNAME")]
    pub broker_username: Option<String>,

    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,

    #[arg(long, env = "BROKER_CLIENT_ID")]
    pub broker_client_id: Option<String>,

    /// Comma-separated topic filters [default: #]
    #[arg(long, env = "BROKER_TOPIC_SUBSCRIPTIONS", value_delimiter = ',')]
    pub broker_topic_subscriptions: Option<Vec<String>>,

    /// Failed attempts before the first connection is given up (-1 = forever)
    #[arg(long, env = "BROKER_CONNECT_RETRIES", allow_negative_numbers = true)]
    pub broker_connect_retries: Option<i32>,

    /// Failed attempts after a drop before giving up (-1 = forever)
    #[arg(long, env = "BROKER_RECONNECT_RETRIES", allow_negative_numbers = true)]
    pub broker_reconnect_retries: Option<i32>,

    #[arg(long, env = "BROKER_RECONNECT_WAIT_MS")]
    pub broker_reconnect_wait_ms: Option<u64>,

    #[arg(long, env = "BROKER_KEEPALIVE_INTERVAL_MS")]
    pub broker_keepalive_interval_ms: Option<u64>,

    #[arg(long, env = "BROKER_KEEPALIVE_LIMIT")]
    pub broker_keepalive_limit: Option<u32>,

    #[arg(long, env = "BROKER_SUBSCRIBE_TIMEOUT_MS")]
    pub broker_subscribe_timeout_ms: Option<u64>,

    #[arg(long, env = "BROKER_SSL_VALIDATE_CERTIFICATE")]
    pub broker_ssl_validate_certificate: Option<bool>,

    /// Elasticsearch URL
    #[arg(long, env = "ELASTICSEARCH_NODE")]
    pub elasticsearch_node: Option<String>,

    #[arg(long, env = "ELASTICSEARCH_USERNAME")]
    pub elasticsearch_username: Option<String>,

    #[arg(long, env = "ELASTICSEARCH_PASSWORD", hide_env_values = true)]
    pub elasticsearch_password: Option<String>,

    #[arg(long, env = "ELASTICSEARCH_INDEX_NAME")]
    pub elasticsearch_index_name: Option<String>,

    /// Verify the node's TLS certificate [default: true]. Only an explicit
    /// false accepts self-signed certificates.
    #[arg(long, env = "ELASTICSEARCH_TLS_VERIFY")]
    pub elasticsearch_tls_verify: Option<bool>,

    /// Flush once this many records are buffered
    #[arg(long, env = "ELASTICSEARCH_BATCH_SIZE")]
    pub elasticsearch_batch_size: Option<usize>,

    #[arg(long, env = "ELASTICSEARCH_FLUSH_INTERVAL_MS")]
    pub elasticsearch_flush_interval_ms: Option<u64>,

    #[arg(long, env = "ELASTICSEARCH_MAX_RETRIES")]
    pub elasticsearch_max_retries: Option<u32>,

    #[arg(long, env = "ELASTICSEARCH_REQUEST_TIMEOUT_MS")]
    pub elasticsearch_request_timeout_ms: Option<u64>,

    #[arg(long, env = "ELASTICSEARCH_SHARDS")]
    pub elasticsearch_shards: Option<u32>,

    #[arg(long, env = "ELASTICSEARCH_REPLICAS")]
    pub elasticsearch_replicas: Option<u32>,

    #[arg(long, env = "ELASTICSEARCH_REFRESH_INTERVAL")]
    pub elasticsearch_refresh_interval: Option<String>,

    #[arg(long, env = "ELASTICSEARCH_ILM_POLICY")]
    pub elasticsearch_ilm_policy: Option<String>,

    /// retry-all or retry-rejected
    #[arg(long, env = "TRACKER_PARTIAL_FAILURE")]
    pub partial_failure: Option<PartialFailurePolicy>,

    /// Final flush attempts before buffered records are reported lost
    #[arg(long, env = "TRACKER_SHUTDOWN_ATTEMPTS")]
    pub shutdown_attempts: Option<u32>,

    /// Buffer size of the first growth warning
    #[arg(long, env = "TRACKER_BUFFER_WARN")]
    pub buffer_warn: Option<usize>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective (merged config)
// ═══════════════════════════════════════════════════════════════

/// Final configuration. Precedence: built-in defaults < config file < env/CLI.
#[derive(Debug)]
pub struct Effective {
    pub broker: MqttConfig,
    pub sink: ElasticsearchConfig,
    pub ingest: IngestConfig,
}

impl Effective {
    pub fn new(args: &TrackerArgs) -> Result<Self, TrackerError> {
        let cfg = match &args.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };
        Ok(Self::merge(args, cfg))
    }

    pub fn merge(args: &TrackerArgs, cfg: Config) -> Self {
        let Config { broker: b, sink: s, ingest: i } = cfg;
        let a = args.clone();

        let broker_defaults = MqttConfig::default();
        let broker = MqttConfig {
            url: a.broker_url.or(b.url).unwrap_or(broker_defaults.url),
            namespace: a.broker_vpn_name.or(b.vpn_name).unwrap_or(broker_defaults.namespace),
            username: non_empty(a.broker_username.or(b.username)),
            password: non_empty(a.broker_password.or(b.password)),
            client_id: non_empty(a.broker_client_id.or(b.client_id)),
            connect_retries: a.broker_connect_retries.or(b.connect_retries).unwrap_or(broker_defaults.connect_retries),
            reconnect_retries: a
                .broker_reconnect_retries
                .or(b.reconnect_retries)
                .unwrap_or(broker_defaults.reconnect_retries),
            reconnect_wait_ms: a
                .broker_reconnect_wait_ms
                .or(b.reconnect_wait_ms)
                .unwrap_or(broker_defaults.reconnect_wait_ms),
            keepalive_interval_ms: a
                .broker_keepalive_interval_ms
                .or(b.keepalive_interval_ms)
                .unwrap_or(broker_defaults.keepalive_interval_ms),
            keepalive_limit: a.broker_keepalive_limit.or(b.keepalive_limit).unwrap_or(broker_defaults.keepalive_limit),
            subscribe_timeout_ms: a
                .broker_subscribe_timeout_ms
                .or(b.subscribe_timeout_ms)
                .unwrap_or(broker_defaults.subscribe_timeout_ms),
            tls_verify: a
                .broker_ssl_validate_certificate
                .or(b.ssl_validate_certificate)
                .unwrap_or(broker_defaults.tls_verify),
            clean_session: broker_defaults.clean_session,
        };

        let sink_defaults = ElasticsearchConfig::default();
        let sink = ElasticsearchConfig {
            node: a.elasticsearch_node.or(s.node).unwrap_or(sink_defaults.node),
            username: non_empty(a.elasticsearch_username.or(s.username)),
            password: non_empty(a.elasticsearch_password.or(s.password)),
            index: a.elasticsearch_index_name.or(s.index_name).unwrap_or(sink_defaults.index),
            tls_verify: a.elasticsearch_tls_verify.or(s.tls_verify).unwrap_or(sink_defaults.tls_verify),
            max_retries: a.elasticsearch_max_retries.or(s.max_retries).unwrap_or(sink_defaults.max_retries),
            request_timeout_ms: a
                .elasticsearch_request_timeout_ms
                .or(s.request_timeout_ms)
                .unwrap_or(sink_defaults.request_timeout_ms),
            shards: a.elasticsearch_shards.or(s.shards).unwrap_or(sink_defaults.shards),
            replicas: a.elasticsearch_replicas.or(s.replicas).unwrap_or(sink_defaults.replicas),
            refresh_interval: a
                .elasticsearch_refresh_interval
                .or(s.refresh_interval)
                .unwrap_or(sink_defaults.refresh_interval),
            ilm_policy: non_empty(a.elasticsearch_ilm_policy.or(s.ilm_policy)),
        };

        let ingest_defaults = IngestConfig::default();
        let subscriptions: Vec<String> = a
            .broker_topic_subscriptions
            .or(b.topic_subscriptions)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.trim().to_owned())
            .filter(|p| !p.is_empty())
            .collect();
        let ingest = IngestConfig {
            subscriptions: if subscriptions.is_empty() {
                vec![MATCH_ALL.to_owned()]
            } else {
                subscriptions
            },
            batch_size: a.elasticsearch_batch_size.or(i.batch_size).unwrap_or(ingest_defaults.batch_size),
            flush_interval_ms: a
                .elasticsearch_flush_interval_ms
                .or(i.flush_interval_ms)
                .unwrap_or(ingest_defaults.flush_interval_ms),
            partial_failure: a.partial_failure.or(i.partial_failure).unwrap_or(ingest_defaults.partial_failure),
            shutdown_attempts: a
                .shutdown_attempts
                .or(i.shutdown_attempts)
                .unwrap_or(ingest_defaults.shutdown_attempts),
            shutdown_retry_delay_ms: i
                .shutdown_retry_delay_ms
                .unwrap_or(ingest_defaults.shutdown_retry_delay_ms),
            buffer_warn_threshold: a
                .buffer_warn
                .or(i.buffer_warn_threshold)
                .unwrap_or(ingest_defaults.buffer_warn_threshold),
        };

        Self { broker, sink, ingest }
    }
}

/// Empty env values (`FOO=`) mean unset.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
