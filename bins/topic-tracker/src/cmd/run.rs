use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sink_elasticsearch::ElasticsearchSink;
use source_mqtt::MqttSource;
use tracker_engine::{Coordinator, IngestReport};

use super::config::Effective;
use super::error::TrackerError;

/// Wire the MQTT source and the Elasticsearch sink to a coordinator and run
/// it until SIGINT/SIGTERM.
pub async fn run(eff: Effective) -> Result<IngestReport, TrackerError> {
    tracing::info!(
        broker = %eff.broker.url,
        namespace = %eff.broker.namespace,
        subscriptions = ?eff.ingest.subscriptions,
        node = %eff.sink.node,
        index = %eff.sink.index,
        "starting topic-tracker"
    );

    let source = Arc::new(MqttSource::new(eff.broker)?);
    let sink = Arc::new(ElasticsearchSink::new(eff.sink)?);
    let coordinator = Coordinator::new(eff.ingest, source, sink)?;

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(watch_signals(shutdown.clone()));

    let result = coordinator.run(shutdown).await;
    signals.abort();
    Ok(result?)
}

/// First SIGINT/SIGTERM starts a graceful drain, a second one exits at once.
async fn watch_signals(shutdown: CancellationToken) {
    wait_for_signal().await;
    tracing::info!("shutting down, draining buffer (signal again to force exit)");
    shutdown.cancel();

    wait_for_signal().await;
    tracing::warn!("forced exit, buffered records are lost");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = term.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
