use std::sync::Arc;
use std::sync::atomic::Ordering;

use rumqttc::{Event, EventLoop, Outgoing, Packet, SubAck, SubscribeReasonCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tracker_api::{LifecycleSignal, SourceError, TopicObservation};

use crate::Shared;
use crate::config::MqttConfig;

/// True once `failures` consecutive failed attempts exceed `budget`
/// (-1 = unlimited).
pub(crate) fn retries_exhausted(budget: i32, failures: u32) -> bool {
    u32::try_from(budget).is_ok_and(|budget| failures > budget)
}

/// Owns the event loop: connects, reconnects, and turns incoming packets
/// into lifecycle signals and observations. Returns when the token is
/// cancelled, after a requested disconnect, or once retries run out.
pub(crate) async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    config: MqttConfig,
    lifecycle: mpsc::UnboundedSender<LifecycleSignal>,
    observations: mpsc::UnboundedSender<TopicObservation>,
    token: CancellationToken,
) {
    let mut ever_connected = false;
    let mut failures = 0u32;

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                failures = 0;
                ever_connected = true;
                shared.connected.store(true, Ordering::SeqCst);
                tracing::info!(session_present = ack.session_present, "mqtt session established");
                let _ = lifecycle.send(LifecycleSignal::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if shared.connected.load(Ordering::SeqCst) {
                    let _ = observations.send(TopicObservation::now(publish.topic, config.namespace.clone()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if !shared.subscriptions().assign(pkid) {
                    tracing::debug!(pkid, "SUBSCRIBE from an abandoned request, ignored");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => on_suback(&shared, &lifecycle, ack),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                let was_connected = shared.connected.swap(false, Ordering::SeqCst);
                fail_pending(&shared, &lifecycle, &reason);

                if shared.stopping.load(Ordering::SeqCst) {
                    break;
                }
                if was_connected {
                    tracing::warn!(error = %reason, "mqtt connection lost");
                    let _ = lifecycle.send(LifecycleSignal::Disconnected { reason: reason.clone() });
                }

                failures += 1;
                let budget = if ever_connected {
                    config.reconnect_retries
                } else {
                    config.connect_retries
                };
                if retries_exhausted(budget, failures) {
                    tracing::error!(error = %reason, failures, "mqtt retries exhausted");
                    let _ = lifecycle.send(LifecycleSignal::ConnectFailed { reason });
                    break;
                }

                tracing::warn!(error = %reason, attempt = failures, "mqtt connect attempt failed");
                let _ = lifecycle.send(LifecycleSignal::Reconnecting { attempt: failures });
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(config.reconnect_wait()) => {}
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    fail_pending(&shared, &lifecycle, "event loop stopped");
    tracing::debug!("mqtt driver finished");
}

fn on_suback(shared: &Shared, lifecycle: &mpsc::UnboundedSender<LifecycleSignal>, ack: SubAck) {
    let Some(pending) = shared.subscriptions().take(ack.pkid) else {
        tracing::debug!(pkid = ack.pkid, "SUBACK for an abandoned request");
        return;
    };

    let granted = ack
        .return_codes
        .iter()
        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
    let (signal, result) = if granted {
        (LifecycleSignal::SubscriptionAck { pattern: pending.pattern.clone() }, Ok(()))
    } else {
        let reason = "broker refused the subscription".to_owned();
        (
            LifecycleSignal::SubscriptionError {
                pattern: pending.pattern.clone(),
                reason: reason.clone(),
            },
            Err(SourceError::Subscribe {
                pattern: pending.pattern,
                reason,
            }),
        )
    };
    let _ = lifecycle.send(signal);
    let _ = pending.reply.send(result);
}

fn fail_pending(shared: &Shared, lifecycle: &mpsc::UnboundedSender<LifecycleSignal>, reason: &str) {
    if shared.subscriptions().is_empty() {
        return;
    }
    let pending = shared.subscriptions().drain();
    for p in pending {
        let _ = lifecycle.send(LifecycleSignal::SubscriptionError {
            pattern: p.pattern.clone(),
            reason: reason.to_owned(),
        });
        let _ = p.reply.send(Err(SourceError::Subscribe {
            pattern: p.pattern,
            reason: reason.to_owned(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget() {
        assert!(!retries_exhausted(3, 3));
        assert!(retries_exhausted(3, 4));
        assert!(retries_exhausted(0, 1));
        assert!(!retries_exhausted(-1, u32::MAX));
    }
}
