use std::time::Duration;

use serde::Deserialize;
use tracker_api::SourceError;

const MQTT_PORT: u16 = 1883;
const MQTTS_PORT: u16 = 8883;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Tenant / VPN name stamped on every observation.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Generated from the process id when unset.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Failed attempts tolerated before the first connection. -1 = unlimited.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: i32,
    /// Failed attempts tolerated after a connection drops. -1 = unlimited.
    #[serde(default = "default_reconnect_retries")]
    pub reconnect_retries: i32,
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Missed keep-alives before the session is considered dead. The MQTT
    /// broker enforces 1.5 intervals on its own; the value is only reported.
    #[serde(default = "default_keepalive_limit")]
    pub keepalive_limit: u32,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

fn default_url() -> String {
    "mqtt://localhost:1883".into()
}
fn default_namespace() -> String {
    "default".into()
}
fn default_connect_retries() -> i32 {
    3
}
fn default_reconnect_retries() -> i32 {
    -1
}
fn default_reconnect_wait_ms() -> u64 {
    3_000
}
fn default_keepalive_interval_ms() -> u64 {
    3_000
}
fn default_keepalive_limit() -> u32 {
    10
}
fn default_subscribe_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            username: None,
            password: None,
            client_id: None,
            connect_retries: default_connect_retries(),
            reconnect_retries: default_reconnect_retries(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_limit: default_keepalive_limit(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            tls_verify: true,
            clean_session: true,
        }
    }
}

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl MqttConfig {
    pub fn broker(&self) -> Result<BrokerAddr, SourceError> {
        parse_broker_url(&self.url)
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("topic-tracker-{}", std::process::id()))
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    /// MQTT keep-alive has whole-second resolution.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_ms.div_ceil(1_000).max(1))
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        self.broker()?;
        if self.connect_retries < -1 || self.reconnect_retries < -1 {
            return Err(SourceError::Config("retry counts must be -1 (unlimited) or >= 0".into()));
        }
        if self.subscribe_timeout_ms == 0 {
            return Err(SourceError::Config("subscribe_timeout_ms must be positive".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(SourceError::Config("password given without username".into()));
        }
        Ok(())
    }
}

/// `mqtt://` and `tcp://` are plain, `mqtts://` and `ssl://` use TLS.
pub fn parse_broker_url(url: &str) -> Result<BrokerAddr, SourceError> {
    let bad = |why: &str| SourceError::Config(format!("broker url '{url}': {why}"));

    let (scheme, rest) = url.split_once("://").ok_or_else(|| bad("missing scheme"))?;
    let (tls, default_port) = match scheme.to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => (false, MQTT_PORT),
        "mqtts" | "ssl" => (true, MQTTS_PORT),
        other => return Err(bad(&format!("unsupported scheme '{other}'"))),
    };

    let authority = rest.trim_end_matches('/');
    if authority.contains('/') {
        return Err(bad("paths are not supported"));
    }

    let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
        let (host, tail) = v6.split_once(']').ok_or_else(|| bad("unterminated IPv6 literal"))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(bad("garbage after IPv6 literal")),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(bad("missing host"));
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| bad("invalid port"))?,
        None => default_port,
    };

    Ok(BrokerAddr {
        host: host.to_owned(),
        port,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_default_ports() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local").unwrap(),
            BrokerAddr { host: "broker.local".into(), port: 1883, tls: false }
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.local:18883/").unwrap(),
            BrokerAddr { host: "broker.local".into(), port: 18883, tls: true }
        );
        assert_eq!(parse_broker_url("ssl://[::1]").unwrap().port, 8883);
        assert_eq!(parse_broker_url("tcp://[::1]:1999").unwrap().host, "::1");
    }

    #[test]
    fn rejects_unusable_urls() {
        for url in ["broker:1883", "ws://broker:8008", "mqtt://:1883", "mqtt://h:port", "mqtt://h/x"] {
            assert!(parse_broker_url(url).is_err(), "{url} accepted");
        }
    }

    #[test]
    fn keep_alive_rounds_up_to_seconds() {
        let mut cfg = MqttConfig::default();
        assert_eq!(cfg.keep_alive(), Duration::from_secs(3));
        cfg.keepalive_interval_ms = 200;
        assert_eq!(cfg.keep_alive(), Duration::from_secs(1));
        cfg.keepalive_interval_ms = 2_500;
        assert_eq!(cfg.keep_alive(), Duration::from_secs(3));
    }

    #[test]
    fn validate_checks_retry_counts_and_credentials() {
        MqttConfig::default().validate().unwrap();

        let cfg = MqttConfig { reconnect_retries: -2, ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = MqttConfig { password: Some("x".into()), ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg: MqttConfig = serde_json::from_str(r#"{"url":"mqtts://b","client_id":"me"}"#).unwrap();
        assert_eq!(cfg.client_id(), "me");
        assert_eq!(cfg.reconnect_retries, -1);
    }
}
