use serde::Deserialize;
use serde_json::{Value, json};

use tracker_api::TopicObservation;

use crate::config::ElasticsearchConfig;

/// Item errors logged per failed bulk request.
pub(crate) const ERROR_SAMPLE: usize = 5;

/// Settings and mappings sent when the index is created.
pub(crate) fn index_definition(config: &ElasticsearchConfig) -> Value {
    let mut settings = json!({
        "number_of_shards": config.shards,
        "number_of_replicas": config.replicas,
        "refresh_interval": config.refresh_interval,
    });
    if let Some(policy) = &config.ilm_policy {
        settings["index.lifecycle.name"] = json!(policy);
    }

    json!({
        "settings": settings,
        "mappings": {
            "properties": {
                "topic": {
                    "type": "keyword",
                    "fields": {
                        "text": { "type": "text", "analyzer": "standard" }
                    }
                },
                "@timestamp": {
                    "type": "date",
                    "format": "strict_date_optional_time"
                },
                "namespace": { "type": "keyword" }
            }
        }
    })
}

/// NDJSON body for `POST /_bulk`: an action line and a document line per
/// record, newline-terminated.
pub(crate) fn bulk_body(index: &str, batch: &[TopicObservation]) -> Result<String, serde_json::Error> {
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
    let mut body = String::with_capacity(batch.len() * (action.len() + 96));
    for record in batch {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkItem {
    #[serde(alias = "create")]
    pub index: Option<ItemResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ItemResult {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Per-item result of a bulk request that reported `errors: true`.
#[derive(Debug, PartialEq)]
pub(crate) struct BulkOutcome {
    pub accepted: usize,
    pub rejected: Vec<usize>,
    /// First few item errors, rendered for the log.
    pub samples: Vec<String>,
}

impl BulkResponse {
    /// Positions are batch indexes. Items missing from the response count
    /// as rejected.
    pub fn outcome(&self, batch_len: usize) -> BulkOutcome {
        let mut rejected = Vec::new();
        let mut samples = Vec::new();

        for pos in 0..batch_len {
            let failed = match self.items.get(pos).and_then(|item| item.index.as_ref()) {
                Some(result) => result.error.is_some() || !(200..300).contains(&result.status),
                None => true,
            };
            if !failed {
                continue;
            }
            rejected.push(pos);
            if samples.len() < ERROR_SAMPLE {
                samples.push(describe(pos, self.items.get(pos)));
            }
        }

        BulkOutcome {
            accepted: batch_len - rejected.len(),
            rejected,
            samples,
        }
    }
}

fn describe(pos: usize, item: Option<&BulkItem>) -> String {
    let Some(result) = item.and_then(|i| i.index.as_ref()) else {
        return format!("#{pos}: missing from response");
    };
    match &result.error {
        Some(Value::Object(err)) => {
            let kind = err.get("type").and_then(Value::as_str).unwrap_or("unknown");
            let reason = err.get("reason").and_then(Value::as_str).unwrap_or("");
            format!("#{pos}: [{}] {kind}: {reason}", result.status)
        }
        Some(other) => format!("#{pos}: [{}] {other}", result.status),
        None => format!("#{pos}: status {}", result.status),
    }
}
