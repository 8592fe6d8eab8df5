mod bulk;
mod config;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::{Method, StatusCode};

use tracker_api::{SinkError, SinkWriter, TopicObservation, WriteFailure, WriteReport};

use crate::bulk::{BulkResponse, bulk_body, index_definition};
pub use crate::config::ElasticsearchConfig;

const RETRY_PAUSE: Duration = Duration::from_millis(500);
const BODY_PREVIEW: usize = 512;

/// Elasticsearch sink over the REST API.
///
/// One index, one flat document per observation: `topic`, `@timestamp`,
/// `namespace`. The index is created on `init` if it does not exist.
pub struct ElasticsearchSink {
    http: reqwest::Client,
    base_url: String,
    config: ElasticsearchConfig,
}

struct Body {
    content_type: &'static str,
    payload: String,
}

impl ElasticsearchSink {
    pub fn new(config: ElasticsearchConfig) -> Result<Self, SinkError> {
        config.validate()?;
        if !config.tls_verify {
            tracing::warn!(node = %config.node, "TLS certificate verification disabled");
        }
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.tls_verify)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SinkError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.node.trim_end_matches('/').to_owned(),
            config,
        })
    }

    pub fn index(&self) -> &str {
        &self.config.index
    }

    /// Send one request, resending on transport errors and overload
    /// statuses up to `max_retries` times.
    async fn request(&self, method: Method, path: &str, body: Option<Body>) -> Result<(StatusCode, String), SinkError> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0u32;
        loop {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(user) = &self.config.username {
                req = req.basic_auth(user, self.config.password.as_ref());
            }
            if let Some(body) = &body {
                req = req
                    .header(reqwest::header::CONTENT_TYPE, body.content_type)
                    .body(body.payload.clone());
            }

            let error = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !is_retryable(status) || attempt >= self.config.max_retries {
                        let text = resp
                            .text()
                            .await
                            .map_err(|e| SinkError::io(format!("{method} {path}: read body: {e}")))?;
                        return Ok((status, text));
                    }
                    format!("status {status}")
                }
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(SinkError::io(format!("{method} {path}: {e}")));
                }
                Err(e) => e.to_string(),
            };

            attempt += 1;
            tracing::warn!(
                method = %method,
                path,
                attempt,
                max_retries = self.config.max_retries,
                error = %error,
                "elasticsearch request failed, retrying"
            );
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let (status, text) = self.request(Method::GET, "/", None).await?;
        if !status.is_success() {
            return Err(SinkError::remote(format!("ping returned {status}: {}", preview(&text))));
        }
        tracing::info!(node = %self.base_url, "connected to elasticsearch");
        Ok(())
    }

    async fn ensure_index(&self) -> Result<(), SinkError> {
        let path = format!("/{}", self.config.index);
        let (status, _) = self.request(Method::HEAD, &path, None).await?;
        match status {
            s if s.is_success() => {
                tracing::info!(index = %self.config.index, "index already exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            other => {
                return Err(SinkError::remote(format!("index lookup returned {other}"))
                    .with_context(&self.config.index));
            }
        }

        let definition = serde_json::to_string(&index_definition(&self.config))?;
        let body = Body {
            content_type: "application/json",
            payload: definition,
        };
        let (status, text) = self.request(Method::PUT, &path, Some(body)).await?;
        if status.is_success() {
            tracing::info!(index = %self.config.index, "created index");
            Ok(())
        } else if status == StatusCode::BAD_REQUEST && text.contains("resource_already_exists_exception") {
            tracing::info!(index = %self.config.index, "index created concurrently, reusing it");
            Ok(())
        } else {
            Err(SinkError::remote(format!("create returned {status}: {}", preview(&text)))
                .with_context(&self.config.index))
        }
    }

    async fn bulk(&self, batch: &[TopicObservation]) -> Result<WriteReport, WriteFailure> {
        if batch.is_empty() {
            return Ok(WriteReport { written: 0 });
        }

        let payload = bulk_body(&self.config.index, batch)
            .map_err(|e| WriteFailure::total(format!("encode bulk body: {e}")))?;
        let body = Body {
            content_type: "application/x-ndjson",
            payload,
        };
        let (status, text) = self
            .request(Method::POST, "/_bulk?refresh=false", Some(body))
            .await
            .map_err(|e| WriteFailure::total(e.to_string()))?;

        if !status.is_success() {
            return Err(WriteFailure::total(format!("bulk returned {status}: {}", preview(&text))));
        }

        let response: BulkResponse = serde_json::from_str(&text)
            .map_err(|e| WriteFailure::total(format!("unreadable bulk response: {e}")))?;
        if !response.errors {
            return Ok(WriteReport { written: batch.len() });
        }

        let outcome = response.outcome(batch.len());
        tracing::error!(
            index = %self.config.index,
            failed = outcome.rejected.len(),
            accepted = outcome.accepted,
            "bulk indexing errors"
        );
        for sample in &outcome.samples {
            tracing::error!(index = %self.config.index, item = %sample, "bulk item rejected");
        }

        Err(WriteFailure::partial(
            format!("{} of {} documents rejected", outcome.rejected.len(), batch.len()),
            outcome.accepted,
            outcome.rejected,
        ))
    }
}

impl SinkWriter for ElasticsearchSink {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async {
            self.ping().await?;
            self.ensure_index().await
        })
    }

    fn write<'a>(
        &'a self,
        batch: &'a [TopicObservation],
    ) -> Pin<Box<dyn Future<Output = Result<WriteReport, WriteFailure>> + Send + 'a>> {
        Box::pin(self.bulk(batch))
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + '_>> {
        Box::pin(async {
            tracing::info!(node = %self.base_url, "elasticsearch client closed");
            Ok(())
        })
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(BODY_PREVIEW) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
