//! In-process stand-in for the privileged/display process boundary.
//!
//! The coordinator side owns a [`RelaySender`]; the display side owns a
//! [`RelayEndpoint`]. Links cross on the `deep-link-auth` channel as the
//! still-encoded `data` string, and the display side answers with readiness
//! and per-delivery acknowledgements.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const DEEP_LINK_CHANNEL: &str = "deep-link-auth";
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    DeepLinkAuth { delivery_id: u64, raw_data: String },
}

impl RelayMessage {
    #[must_use]
    pub fn channel(&self) -> &'static str {
        match self {
            Self::DeepLinkAuth { .. } => DEEP_LINK_CHANNEL,
        }
    }

    #[must_use]
    pub fn delivery_id(&self) -> u64 {
        match self {
            Self::DeepLinkAuth { delivery_id, .. } => *delivery_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSignal {
    ListenerReady,
    Ack { delivery_id: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay_listener_detached")]
    ListenerDetached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnacknowledgedDelivery {
    pub delivery_id: u64,
    pub raw_data: String,
}

#[derive(Debug)]
struct InFlight {
    raw_data: String,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct RelaySender {
    messages: mpsc::UnboundedSender<RelayMessage>,
    next_delivery_id: u64,
    in_flight: BTreeMap<u64, InFlight>,
    ack_timeout: Duration,
}

/// Display-side half: receives relay messages and reports back.
#[derive(Debug)]
pub struct RelayEndpoint {
    messages: mpsc::UnboundedReceiver<RelayMessage>,
    signals: mpsc::UnboundedSender<UiSignal>,
}

/// Builds a connected relay. The third element is the coordinator's view of
/// display-side signals.
#[must_use]
pub fn relay_channel(
    ack_timeout: Duration,
) -> (
    RelaySender,
    RelayEndpoint,
    mpsc::UnboundedReceiver<UiSignal>,
) {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    (
        RelaySender {
            messages: message_tx,
            next_delivery_id: 1,
            in_flight: BTreeMap::new(),
            ack_timeout,
        },
        RelayEndpoint {
            messages: message_rx,
            signals: signal_tx,
        },
        signal_rx,
    )
}

impl RelaySender {
    pub fn send(&mut self, raw_data: &str) -> Result<u64, RelayError> {
        let delivery_id = self.next_delivery_id;
        self.messages
            .send(RelayMessage::DeepLinkAuth {
                delivery_id,
                raw_data: raw_data.to_string(),
            })
            .map_err(|_| RelayError::ListenerDetached)?;
        self.next_delivery_id += 1;
        self.in_flight.insert(
            delivery_id,
            InFlight {
                raw_data: raw_data.to_string(),
                sent_at: Instant::now(),
            },
        );
        tracing::debug!(channel = DEEP_LINK_CHANNEL, delivery_id, "relayed deep link");
        Ok(delivery_id)
    }

    /// Clears `delivery_id` and returns the payload it carried.
    pub fn acknowledge(&mut self, delivery_id: u64) -> Option<String> {
        self.in_flight
            .remove(&delivery_id)
            .map(|entry| entry.raw_data)
    }

    /// Removes and returns deliveries that went unacknowledged for longer
    /// than the ack timeout.
    pub fn take_unacknowledged(&mut self, now: Instant) -> Vec<UnacknowledgedDelivery> {
        let expired = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= self.ack_timeout)
            .map(|(delivery_id, _)| *delivery_id)
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .filter_map(|delivery_id| {
                self.in_flight
                    .remove(&delivery_id)
                    .map(|entry| UnacknowledgedDelivery {
                        delivery_id,
                        raw_data: entry.raw_data,
                    })
            })
            .collect()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }
}

impl RelayEndpoint {
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        self.messages.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<RelayMessage> {
        self.messages.try_recv().ok()
    }

    pub fn signal_ready(&self) {
        if self.signals.send(UiSignal::ListenerReady).is_err() {
            tracing::debug!("relay coordinator gone before readiness signal");
        }
    }

    pub fn acknowledge(&self, delivery_id: u64) {
        if self.signals.send(UiSignal::Ack { delivery_id }).is_err() {
            tracing::debug!(delivery_id, "relay coordinator gone before ack");
        }
    }

    /// Moves the endpoint onto its own task that acknowledges each message
    /// the moment it crosses the relay, then queues it for the consumer.
    /// Acks never wait on how long the consumer takes per message.
    pub fn spawn_intake(mut self) -> mpsc::UnboundedReceiver<RelayMessage> {
        let (queued_tx, queued_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = self.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        self.acknowledge(message.delivery_id());
                        if queued_tx.send(message).is_err() {
                            break;
                        }
                    }
                    () = queued_tx.closed() => break,
                }
            }
            tracing::debug!(channel = DEEP_LINK_CHANNEL, "relay intake stopped");
        });
        queued_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_ids_increase_and_acks_clear_in_flight() {
        let (mut sender, mut endpoint, mut signals) =
            relay_channel(Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS));

        let first = sender.send("%7B%7D").expect("send first");
        let second = sender.send("%7B%22a%22%3A1%7D").expect("send second");
        assert!(second > first);
        assert_eq!(sender.in_flight_count(), 2);

        let message = endpoint.recv().await.expect("message");
        assert_eq!(message.channel(), DEEP_LINK_CHANNEL);
        assert_eq!(
            message,
            RelayMessage::DeepLinkAuth {
                delivery_id: first,
                raw_data: "%7B%7D".to_string(),
            }
        );

        endpoint.signal_ready();
        endpoint.acknowledge(first);
        assert_eq!(signals.recv().await, Some(UiSignal::ListenerReady));
        assert_eq!(
            signals.recv().await,
            Some(UiSignal::Ack { delivery_id: first })
        );
        assert_eq!(sender.acknowledge(first), Some("%7B%7D".to_string()));
        assert_eq!(sender.acknowledge(first), None);
        assert_eq!(sender.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn intake_acknowledges_before_consumer_reads() {
        let (mut sender, endpoint, mut signals) =
            relay_channel(Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS));
        let mut queued = endpoint.spawn_intake();

        let first = sender.send("%7B%7D").expect("send first");
        let second = sender.send("%7B%22a%22%3A1%7D").expect("send second");

        assert_eq!(signals.recv().await, Some(UiSignal::Ack { delivery_id: first }));
        assert_eq!(signals.recv().await, Some(UiSignal::Ack { delivery_id: second }));
        assert!(sender.acknowledge(first).is_some());
        assert!(sender.acknowledge(second).is_some());
        assert_eq!(sender.in_flight_count(), 0);

        let message = queued.recv().await.expect("queued first");
        assert_eq!(message.delivery_id(), first);
        let message = queued.recv().await.expect("queued second");
        assert_eq!(message.delivery_id(), second);

        drop(sender);
        assert_eq!(queued.recv().await, None);
    }

    #[tokio::test]
    async fn send_without_listener_is_observable() {
        let (mut sender, endpoint, _signals) = relay_channel(Duration::from_millis(10));
        drop(endpoint);
        assert_eq!(sender.send("%7B%7D"), Err(RelayError::ListenerDetached));
        assert_eq!(sender.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_deliveries_expire_after_timeout() {
        let (mut sender, _endpoint, _signals) = relay_channel(Duration::from_millis(2_000));
        let delivery_id = sender.send("payload").expect("send");

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(sender.take_unacknowledged(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(
            sender.take_unacknowledged(Instant::now()),
            vec![UnacknowledgedDelivery {
                delivery_id,
                raw_data: "payload".to_string(),
            }]
        );
        assert!(sender.take_unacknowledged(Instant::now()).is_empty());
    }
}
