//! Broker assembly and accept loop
//!
//! Wires the stores, registry, subscription index, security providers
//! and interceptor into one [`ProtocolProcessor`] and runs the TCP
//! accept loop, spawning a transport task per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::interceptor::BrokerInterceptor;
use crate::processor::ProtocolProcessor;
use crate::protocol::{Publish, QoS};
use crate::registry::ConnectionRegistry;
use crate::security::{AcceptAllAuthenticator, DynAuthenticator, DynAuthorizator, PermitAllAuthorizator};
use crate::store::{MemoryStore, PersistentStore, StoreError};
use crate::topic::SubscriptionIndex;
use crate::transport::{Connection, TransportConfig};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// Outbound queue depth per connection
    pub outbound_queue: usize,
    /// How long a fresh socket may wait before its CONNECT
    pub connect_timeout: Duration,
    /// Accept clients that present no credentials
    pub allow_anonymous: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().expect("valid default bind"),
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            outbound_queue: 1024,
            connect_timeout: Duration::from_secs(30),
            allow_anonymous: true,
        }
    }
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    processor: Arc<ProtocolProcessor>,
    store: Arc<dyn PersistentStore>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Broker with in-memory stores that accepts everything
    pub fn new(config: BrokerConfig) -> Result<Self, StoreError> {
        Self::with_providers(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAllAuthenticator),
            Arc::new(PermitAllAuthorizator),
            Arc::new(BrokerInterceptor::new()),
        )
    }

    /// Broker with explicit store, security providers and interceptors
    pub fn with_providers(
        config: BrokerConfig,
        store: Arc<dyn PersistentStore>,
        authenticator: DynAuthenticator,
        authorizator: DynAuthorizator,
        interceptor: Arc<BrokerInterceptor>,
    ) -> Result<Self, StoreError> {
        store.init_store()?;
        let messages = store.messages_store();
        let sessions = store.sessions_store(messages.clone());

        let processor = Arc::new(ProtocolProcessor::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(SubscriptionIndex::new()),
            messages,
            sessions,
            interceptor,
            authenticator,
            authorizator,
            config.allow_anonymous,
        ));

        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            processor,
            store,
            shutdown,
        })
    }

    /// Run the accept loop until shutdown
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT listening on {}", self.config.bind_addr);

        let transport = TransportConfig {
            max_packet_size: self.config.max_packet_size,
            outbound_queue: self.config.outbound_queue,
            connect_timeout: self.config.connect_timeout,
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("new connection from {}", addr);
                            let connection = Connection::new(
                                stream,
                                addr,
                                self.processor.clone(),
                                &transport,
                            );
                            tokio::spawn(async move {
                                if let Err(e) = connection.run().await {
                                    debug!("connection from {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("broker shutting down");
                    self.store.close();
                    return Ok(());
                }
            }
        }
    }

    /// Signal the accept loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// The processor, for embedding APIs and tests
    pub fn processor(&self) -> &Arc<ProtocolProcessor> {
        &self.processor
    }

    /// Publish a message on behalf of the hosting application
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        self.processor
            .internal_publish(Publish {
                dup: false,
                qos,
                retain,
                topic: topic.into(),
                packet_id: None,
                payload,
            })
            .await;
    }
}
