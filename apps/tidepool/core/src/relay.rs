use std::time::Duration;

use futures_util::future::join_all;
use metrics::counter;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::ChannelMessage;
use crate::registry::{ConnectionId, SessionRegistry};

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest a single recipient may hold up delivery before it counts as
    /// failed and is evicted.
    pub delivery_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    pub bytes: usize,
    /// Recipients this call removed from the registry.
    pub evicted: Vec<ConnectionId>,
}

/// Fans messages out to every other connection of one registry.
#[derive(Clone)]
pub struct MessageRelay {
    registry: SessionRegistry,
    config: RelayConfig,
}

impl MessageRelay {
    pub fn new(registry: SessionRegistry, config: RelayConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Deliver `message` to every registered connection except `sender`.
    ///
    /// The content is never inspected. Recipients are served concurrently
    /// from a snapshot of the registry; a failed or timed out recipient is
    /// unregistered and does not affect the others. Calls from one sender are
    /// expected to be sequential, which keeps per-recipient order intact.
    pub async fn relay(&self, sender: ConnectionId, message: ChannelMessage) -> RelayOutcome {
        let recipients = self.registry.peers_except(sender);
        let bytes = message.len();
        let timeout = self.config.delivery_timeout;

        let deliveries = recipients.iter().map(|peer| {
            let message = message.clone();
            async move { (peer.id(), peer.deliver(message, timeout).await) }
        });
        let results = join_all(deliveries).await;

        let mut outcome = RelayOutcome::default();
        for (recipient, result) in results {
            match result {
                Ok(()) => {
                    outcome.delivered += 1;
                    outcome.bytes += bytes;
                }
                Err(err) => self.evict(sender, recipient, err, &mut outcome),
            }
        }

        if outcome.delivered > 0 {
            counter!("tidepool_messages_relayed_total", outcome.delivered as u64);
            counter!("tidepool_bytes_relayed_total", outcome.bytes as u64);
        }
        debug!(
            sender = %sender,
            delivered = outcome.delivered,
            evicted = outcome.evicted.len(),
            "relayed message"
        );
        outcome
    }

    fn evict(
        &self,
        sender: ConnectionId,
        recipient: ConnectionId,
        err: TransportError,
        outcome: &mut RelayOutcome,
    ) {
        let reason = match err {
            TransportError::Closed => "closed",
            TransportError::TimedOut(_) => "timeout",
            TransportError::Broken(_) => "broken",
        };
        counter!("tidepool_delivery_failures_total", 1, "reason" => reason);

        // Another relay may have evicted the same recipient concurrently.
        if self.registry.unregister(recipient) {
            warn!(
                sender = %sender,
                recipient = %recipient,
                error = %err,
                "delivery failed; dropping recipient"
            );
            outcome.evicted.push(recipient);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn text(value: &str) -> ChannelMessage {
        ChannelMessage::Text(value.to_string())
    }

    fn connect_n(registry: &SessionRegistry, n: usize) -> Vec<Registration> {
        (0..n).map(|_| registry.connect()).collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn delivers_to_every_peer_but_the_sender() {
        for n in 1..=6 {
            let registry = SessionRegistry::default();
            let relay = MessageRelay::new(registry.clone(), RelayConfig::default());
            let mut connections = connect_n(&registry, n);

            for sender_index in 0..n {
                let sender = connections[sender_index].handle.id();
                let outcome = relay.relay(sender, text("hello")).await;
                assert_eq!(outcome.delivered, n - 1);
                assert!(outcome.evicted.is_empty());

                for (index, connection) in connections.iter_mut().enumerate() {
                    if index == sender_index {
                        assert_eq!(connection.receiver.try_recv(), Err(TryRecvError::Empty));
                    } else {
                        assert_eq!(connection.receiver.try_recv(), Ok(text("hello")));
                        assert_eq!(connection.receiver.try_recv(), Err(TryRecvError::Empty));
                    }
                }
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn broken_recipient_is_evicted_once_and_others_still_receive() {
        let registry = SessionRegistry::default();
        let relay = MessageRelay::new(registry.clone(), RelayConfig::default());
        let first = registry.connect();
        let second = registry.connect();
        let mut third = registry.connect();
        let broken = first.handle.id();
        drop(first.receiver);

        let outcome = relay.relay(second.handle.id(), text("ping")).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.evicted, vec![broken]);
        assert_eq!(third.receiver.recv().await, Some(text("ping")));
        assert!(!registry.contains(broken));

        let outcome = relay.relay(second.handle.id(), text("again")).await;
        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.delivered, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_recipient_times_out_without_blocking_others() {
        let registry = SessionRegistry::new(1);
        let relay = MessageRelay::new(
            registry.clone(),
            RelayConfig {
                delivery_timeout: Duration::from_millis(50),
            },
        );
        let sender = registry.connect();
        let stalled = registry.connect();
        let mut live = registry.connect();

        relay.relay(sender.handle.id(), text("one")).await;
        assert_eq!(live.receiver.recv().await, Some(text("one")));

        // `stalled` never drains, so its single-slot buffer is still full.
        let outcome = relay.relay(sender.handle.id(), text("two")).await;
        assert_eq!(outcome.evicted, vec![stalled.handle.id()]);
        assert_eq!(live.receiver.recv().await, Some(text("two")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn preserves_sender_order_per_recipient() {
        let registry = SessionRegistry::default();
        let relay = MessageRelay::new(registry.clone(), RelayConfig::default());
        let sender = registry.connect();
        let mut recipient = registry.connect();

        for i in 0..20 {
            relay.relay(sender.handle.id(), text(&i.to_string())).await;
        }
        for i in 0..20 {
            assert_eq!(recipient.receiver.recv().await, Some(text(&i.to_string())));
        }
    }
}
