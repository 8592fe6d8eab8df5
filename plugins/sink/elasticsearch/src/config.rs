use std::time::Duration;

use serde::Deserialize;
use tracker_api::SinkError;

// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ElasticsearchConfig {
    /// Base URL, `http://host:9200` or `https://...`.
    #[serde(default = "default_node")]
    pub node: String,
    /// Basic auth is sent only when set.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_index")]
    pub index: String,
    /// When false, invalid server certificates are accepted.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// Resends after the first attempt on transport errors and 429/502/503/504.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
    /// Attached as `index.lifecycle.name` when the index is created.
    #[serde(default)]
    pub ilm_policy: Option<String>,
}

fn default_node() -> String {
    "http://localhost:9200".into()
}
fn default_index() -> String {
    "solace-topic-metrics".into()
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_shards() -> u32 {
    1
}
fn default_refresh_interval() -> String {
    "5s".into()
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            username: None,
            password: None,
            index: default_index(),
            tls_verify: true,
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            shards: default_shards(),
            replicas: 0,
            refresh_interval: default_refresh_interval(),
            ilm_policy: None,
        }
    }
}

impl ElasticsearchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if !(self.node.starts_with("http://") || self.node.starts_with("https://")) {
            return Err(SinkError::config(format!(
                "node '{}' must start with http:// or https://",
                self.node
            )));
        }
        validate_index_name(&self.index)?;
        if self.shards == 0 {
            return Err(SinkError::config("shards must be at least 1"));
        }
        if self.request_timeout_ms == 0 {
            return Err(SinkError::config("request_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Elasticsearch index naming rules.
fn validate_index_name(name: &str) -> Result<(), SinkError> {
    const FORBIDDEN: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

    let invalid = |why: &str| Err(SinkError::config(format!("index name '{name}' {why}")));
    if name.is_empty() {
        return invalid("is empty");
    }
    if name == "." || name == ".." {
        return invalid("is reserved");
    }
    if name.starts_with(['-', '_', '+']) {
        return invalid("must not start with '-', '_' or '+'");
    }
    if name.chars().any(|c| c.is_uppercase()) {
        return invalid("must be lowercase");
    }
    if name.contains(FORBIDDEN) {
        return invalid("contains a forbidden character");
    }
    if name.len() > 255 {
        return invalid("is longer than 255 bytes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = ElasticsearchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.index, "solace-topic-metrics");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_node_and_index() {
        let cfg = ElasticsearchConfig {
            node: "localhost:9200".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        for index in ["", "Topics", "_hidden", "a/b", "with space"] {
            let cfg = ElasticsearchConfig {
                index: index.into(),
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "{index:?} accepted");
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ElasticsearchConfig =
            serde_json::from_str(r#"{"node":"https://es:9200","ilm_policy":"30d"}"#).unwrap();
        assert_eq!(cfg.node, "https://es:9200");
        assert_eq!(cfg.ilm_policy.as_deref(), Some("30d"));
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.tls_verify);
    }
}
