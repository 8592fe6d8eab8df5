use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One observed message, reduced to where it went and when.
///
/// Payload and headers never reach this type. Duplicates are expected: the
/// same topic is observed once per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicObservation {
    pub topic: String,
    #[serde(rename = "@timestamp", serialize_with = "rfc3339_millis")]
    pub observed_at: DateTime<Utc>,
    pub namespace: String,
}

impl TopicObservation {
    pub fn new(topic: impl Into<String>, observed_at: DateTime<Utc>, namespace: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            observed_at,
            namespace: namespace.into(),
        }
    }

    /// Observation stamped with the current wall clock.
    pub fn now(topic: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(topic, Utc::now(), namespace)
    }
}

fn rfc3339_millis<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_flat_document() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let obs = TopicObservation::new("orders/eu/created", ts, "default");

        let doc = serde_json::to_value(&obs).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({
                "topic": "orders/eu/created",
                "@timestamp": "2024-03-01T12:30:05.000Z",
                "namespace": "default",
            })
        );
    }

    #[test]
    fn reads_back_documents_written_by_the_sink() {
        let raw = r#"{"topic":"a/b","@timestamp":"2024-03-01T12:30:05.250Z","namespace":"vpn1"}"#;
        let obs: TopicObservation = serde_json::from_str(raw).unwrap();
        assert_eq!(obs.topic, "a/b");
        assert_eq!(obs.namespace, "vpn1");
        assert_eq!(obs.observed_at.timestamp_subsec_millis(), 250);
    }
}
