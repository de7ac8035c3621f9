//! MQTT protocol processor
//!
//! The state machine driving every connection through the MQTT
//! handshakes. One instance fronts the whole broker; handlers take a
//! channel handle plus a decoded packet, and all outbound packets go
//! through handles obtained from the connection registry. The processor
//! itself is stateless beyond its injected stores, so any number of
//! transport tasks may call into it concurrently.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::interceptor::BrokerInterceptor;
use crate::protocol::{Packet, Publish, QoS, ReturnCode, Will};
use crate::registry::ConnectionRegistry;
use crate::security::{DynAuthenticator, DynAuthorizator};
use crate::store::{MessageStore, SessionStore, StoreError, StoredMessage};
use crate::topic::SubscriptionIndex;

/// Errors a packet handler can surface. Every variant terminates the
/// connection; `ConnectionRefused` has already written its CONNACK.
#[derive(Debug)]
pub enum ProcessorError {
    /// Malformed or out-of-sequence packet; close without reply
    ProtocolViolation(&'static str),
    /// CONNECT refused with the given return code
    ConnectionRefused(ReturnCode),
    /// Storage failure
    Store(StoreError),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::ConnectionRefused(code) => write!(f, "connection refused: {:?}", code),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<StoreError> for ProcessorError {
    fn from(e: StoreError) -> Self {
        ProcessorError::Store(e)
    }
}

/// Outcome of a successful CONNECT, handed to the transport so it can
/// install the keep-alive timer
#[derive(Debug, Clone)]
pub struct ConnectedSession {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    /// Keep-alive in seconds; the idle timeout is 1.5x this, 0 disables
    pub keep_alive: u16,
}

/// The protocol state machine and message router
pub struct ProtocolProcessor {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) subscriptions: Arc<SubscriptionIndex>,
    pub(crate) messages: Arc<dyn MessageStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    /// client id -> will testament, as given on CONNECT
    pub(crate) wills: DashMap<Arc<str>, Will>,
    pub(crate) interceptor: Arc<BrokerInterceptor>,
    pub(crate) authenticator: DynAuthenticator,
    pub(crate) authorizator: DynAuthorizator,
    pub(crate) allow_anonymous: bool,
}

impl ProtocolProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        subscriptions: Arc<SubscriptionIndex>,
        messages: Arc<dyn MessageStore>,
        sessions: Arc<dyn SessionStore>,
        interceptor: Arc<BrokerInterceptor>,
        authenticator: DynAuthenticator,
        authorizator: DynAuthorizator,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            messages,
            sessions,
            wills: DashMap::new(),
            interceptor,
            authenticator,
            authorizator,
            allow_anonymous,
        }
    }

    /// A session whose client reconnected elsewhere may still be marked
    /// inactive; flip it back whenever its client id is live.
    pub(crate) fn verify_to_activate(&self, client_id: &str) {
        if self.registry.contains(client_id) {
            if let Some(session) = self.sessions.session_for_client(client_id) {
                session.write().activate();
            }
        }
    }

    /// Fan a stored message out to every matching subscriber.
    ///
    /// QoS > 0 payloads are stored (guid assigned) before the fan-out so
    /// offline subscribers can reference them. Per subscriber the
    /// effective QoS is min(publish QoS, requested QoS); inactive
    /// non-clean sessions queue the guid, inactive clean sessions drop.
    pub(crate) fn route_to_subscribers(&self, msg: &mut StoredMessage) {
        if msg.qos != QoS::AtMostOnce && msg.guid.is_none() {
            self.messages.store_publish_for_future(msg);
        }

        // Dedup by client id, keeping the highest requested QoS, so a
        // subscriber with several matching filters gets one copy
        let mut per_client: ahash::AHashMap<Arc<str>, QoS> = ahash::AHashMap::new();
        for sub in self.subscriptions.matches(&msg.topic) {
            let entry = per_client.entry(sub.client_id).or_insert(QoS::AtMostOnce);
            if sub.qos > *entry {
                *entry = sub.qos;
            }
        }

        for (subscriber, requested) in per_client {
            let effective = msg.qos.min(requested);
            let Some(session) = self.sessions.session_for_client(&subscriber) else {
                warn!(client_id = %subscriber, "subscription without session, skipping");
                continue;
            };
            self.verify_to_activate(&subscriber);
            let (active, clean) = {
                let s = session.read();
                (s.is_active(), s.is_clean_session())
            };

            if effective == QoS::AtMostOnce {
                if active {
                    self.direct_send(&subscriber, msg.topic.clone(), effective, msg, false, None);
                }
                continue;
            }

            let Some(guid) = msg.guid else { continue };
            if !active {
                if !clean {
                    session.write().enqueue_to_deliver(guid);
                }
                // Offline clean-session peers get no delivery guarantee
                continue;
            }

            let packet_id = {
                let mut s = session.write();
                match s.next_packet_id() {
                    Some(id) => {
                        s.in_flight_ack_waiting(guid, id);
                        Some(id)
                    }
                    None => {
                        // Id space exhausted: hold the message until
                        // handshakes free a slot
                        s.enqueue_to_deliver(guid);
                        None
                    }
                }
            };
            if let Some(packet_id) = packet_id {
                self.direct_send(
                    &subscriber,
                    msg.topic.clone(),
                    effective,
                    msg,
                    false,
                    Some(packet_id),
                );
            }
        }
    }

    /// Write a PUBLISH to one client's channel. A client that vanished
    /// during fan-out is logged and skipped.
    pub(crate) fn direct_send(
        &self,
        client_id: &str,
        topic: Arc<str>,
        qos: QoS,
        msg: &StoredMessage,
        retained: bool,
        packet_id: Option<u16>,
    ) {
        let Some(descriptor) = self.registry.get(client_id) else {
            warn!(client_id, topic = %topic, "client vanished during fan-out, skipping");
            return;
        };

        let publish = Publish {
            dup: false,
            qos,
            retain: retained,
            topic,
            packet_id,
            payload: msg.payload.clone(),
        };
        if !descriptor.channel.send(Packet::Publish(publish)) {
            debug!(client_id, "outbound queue rejected publish");
        }
    }

    /// Apply the retain rules of a publish: retain with an empty payload
    /// deletes the retained entry, retain on QoS 0 deletes without
    /// storing, otherwise the stored guid becomes the topic's retained
    /// message.
    pub(crate) fn apply_retain_policy(&self, msg: &StoredMessage) {
        if !msg.retained {
            return;
        }
        if msg.qos == QoS::AtMostOnce || msg.payload.is_empty() {
            self.messages.clean_retained(&msg.topic);
            return;
        }
        if let Some(guid) = msg.guid {
            self.messages.store_retained(msg.topic.clone(), guid);
        }
    }

    /// Release the router's pin on a stored message, if it was stored
    pub(crate) fn release_routing_pin(&self, msg: &StoredMessage) {
        if let Some(guid) = msg.guid {
            self.messages.drop_reference(guid);
        }
    }

    /// Publish on behalf of the hosting application: no authorization,
    /// no acknowledgement handshake, no interceptor notification.
    pub async fn internal_publish(&self, publish: Publish) {
        let mut msg = StoredMessage::from_publish(Arc::from("BROKER_SELF"), &publish);
        debug!(topic = %msg.topic, qos = ?msg.qos, "internal publish");
        self.route_to_subscribers(&mut msg);
        self.apply_retain_policy(&msg);
        self.release_routing_pin(&msg);
    }

    /// Force-close a client's connection. The channel is marked stolen
    /// so the connection-lost path neither publishes the will nor
    /// touches the delivery queue.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        let Some(descriptor) = self.registry.get(client_id) else {
            return false;
        };
        if let Some(session) = self.sessions.session_for_client(client_id) {
            session.write().disconnect();
        }
        descriptor.channel.mark_session_stolen();
        descriptor.channel.close();
        debug!(client_id, "connection forced to close");
        true
    }
}
