//! Broker event interception
//!
//! Observers register an [`InterceptHandler`] and receive immutable
//! event objects for the observable broker transitions. Notifications
//! are fire-and-forget: the fan-out spawns the handler futures on the
//! runtime so an observer can never block the processor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::QoS;

/// A client completed CONNECT
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    pub keep_alive: u16,
}

/// A client sent a graceful DISCONNECT
#[derive(Debug, Clone)]
pub struct DisconnectedEvent {
    pub client_id: Arc<str>,
}

/// A connection dropped without DISCONNECT
#[derive(Debug, Clone)]
pub struct ConnectionLostEvent {
    pub client_id: Arc<str>,
}

/// A message was accepted for routing
#[derive(Debug, Clone)]
pub struct TopicPublishedEvent {
    pub client_id: Arc<str>,
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
    pub retain: bool,
}

/// A subscription was added
#[derive(Debug, Clone)]
pub struct TopicSubscribedEvent {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
    pub qos: QoS,
}

/// A subscription was removed
#[derive(Debug, Clone)]
pub struct TopicUnsubscribedEvent {
    pub client_id: Arc<str>,
    pub filter: String,
}

/// A subscriber acknowledged a QoS 1 delivery
#[derive(Debug, Clone)]
pub struct PubackEvent {
    pub client_id: Arc<str>,
    pub packet_id: u16,
}

/// Observer of broker events. All methods default to no-ops so
/// implementations override only what they watch.
#[async_trait]
pub trait InterceptHandler: Send + Sync {
    async fn on_connected(&self, _event: &ConnectedEvent) {}

    async fn on_disconnected(&self, _event: &DisconnectedEvent) {}

    async fn on_connection_lost(&self, _event: &ConnectionLostEvent) {}

    async fn on_topic_published(&self, _event: &TopicPublishedEvent) {}

    async fn on_topic_subscribed(&self, _event: &TopicSubscribedEvent) {}

    async fn on_topic_unsubscribed(&self, _event: &TopicUnsubscribedEvent) {}

    async fn on_puback(&self, _event: &PubackEvent) {}
}

/// Fans broker events out to the registered handlers
#[derive(Default)]
pub struct BrokerInterceptor {
    handlers: Vec<Arc<dyn InterceptHandler>>,
}

macro_rules! notify {
    ($name:ident, $method:ident, $event:ty) => {
        pub fn $name(&self, event: $event) {
            for handler in &self.handlers {
                let handler = handler.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    handler.$method(&event).await;
                });
            }
        }
    };
}

impl BrokerInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn InterceptHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn add_handler(&mut self, handler: Arc<dyn InterceptHandler>) {
        self.handlers.push(handler);
    }

    notify!(notify_client_connected, on_connected, ConnectedEvent);
    notify!(notify_client_disconnected, on_disconnected, DisconnectedEvent);
    notify!(notify_connection_lost, on_connection_lost, ConnectionLostEvent);
    notify!(notify_topic_published, on_topic_published, TopicPublishedEvent);
    notify!(notify_topic_subscribed, on_topic_subscribed, TopicSubscribedEvent);
    notify!(
        notify_topic_unsubscribed,
        on_topic_unsubscribed,
        TopicUnsubscribedEvent
    );
    notify!(notify_puback, on_puback, PubackEvent);
}
