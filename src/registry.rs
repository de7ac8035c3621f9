//! Connection registry and channel handles
//!
//! Live connections are tracked by client id. A [`ChannelHandle`] is the
//! non-blocking outbound side of one connection: packets are enqueued on
//! an mpsc queue the transport drains, so processor handlers never block
//! on socket writes. Handles carry identity so `remove_if_matches` can
//! tell a stale connection-lost apart from the connection that replaced
//! it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::protocol::Packet;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ChannelShared {
    id: u64,
    tx: mpsc::Sender<Packet>,
    closed: AtomicBool,
    close_notify: Notify,
    /// Set when a newer CONNECT for the same client id evicted this
    /// connection; suppresses will publication on the lost-connection
    /// path
    session_stolen: AtomicBool,
}

/// Cloneable handle for writing packets to one connection
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Create a handle and the receiver its transport drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            shared: Arc::new(ChannelShared {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                tx,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                session_stolen: AtomicBool::new(false),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Enqueue a packet without blocking. Returns false if the queue is
    /// full or the channel is closed; the packet is dropped either way.
    pub fn send(&self, packet: Packet) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.shared.tx.try_send(packet) {
            Ok(()) => true,
            Err(e) => {
                debug!(channel = self.shared.id, "outbound send failed: {}", e);
                false
            }
        }
    }

    /// Mark the channel closed; the transport observes this and tears
    /// the socket down.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel has been closed
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn mark_session_stolen(&self) {
        self.shared.session_stolen.store(true, Ordering::Release);
    }

    pub fn is_session_stolen(&self) -> bool {
        self.shared.session_stolen.load(Ordering::Acquire)
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for ChannelHandle {}

/// One live connection: channel plus the CONNECT parameters the broker
/// needs after the handshake
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub client_id: Arc<str>,
    pub channel: ChannelHandle,
    pub clean_session: bool,
    /// Keep-alive in seconds; 0 disables the idle timeout
    pub keep_alive: u16,
    /// Username presented on CONNECT, kept for authorization checks
    pub username: Option<String>,
}

/// Live mapping client id -> connection descriptor
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Arc<str>, ConnectionDescriptor>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, returning the one it evicted, if any
    pub fn put(&self, descriptor: ConnectionDescriptor) -> Option<ConnectionDescriptor> {
        self.connections
            .insert(descriptor.client_id.clone(), descriptor)
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionDescriptor> {
        self.connections.get(client_id).map(|d| d.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn remove(&self, client_id: &str) -> Option<ConnectionDescriptor> {
        self.connections.remove(client_id).map(|(_, d)| d)
    }

    /// Remove the entry only if it still refers to the given channel.
    /// A late connection-lost for an already-replaced descriptor must
    /// not evict the new session.
    pub fn remove_if_matches(&self, client_id: &str, channel: &ChannelHandle) -> bool {
        self.connections
            .remove_if(client_id, |_, d| d.channel == *channel)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(client: &str) -> (ConnectionDescriptor, mpsc::Receiver<Packet>) {
        let (channel, rx) = ChannelHandle::new(8);
        (
            ConnectionDescriptor {
                client_id: client.into(),
                channel,
                clean_session: true,
                keep_alive: 60,
                username: None,
            },
            rx,
        )
    }

    #[test]
    fn put_evicts_previous_descriptor() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = descriptor("c");
        let (second, _rx2) = descriptor("c");

        assert!(registry.put(first.clone()).is_none());
        let evicted = registry.put(second.clone()).unwrap();
        assert_eq!(evicted.channel, first.channel);
        assert_eq!(registry.get("c").unwrap().channel, second.channel);
    }

    #[test]
    fn remove_if_matches_ignores_stale_channel() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = descriptor("c");
        let (second, _rx2) = descriptor("c");

        registry.put(first.clone());
        registry.put(second.clone());

        // The stale connection's lost-event must not evict the new one
        assert!(!registry.remove_if_matches("c", &first.channel));
        assert!(registry.contains("c"));
        assert!(registry.remove_if_matches("c", &second.channel));
        assert!(registry.is_empty());
    }

    #[test]
    fn closed_channel_rejects_sends() {
        let (channel, mut rx) = ChannelHandle::new(2);
        assert!(channel.send(Packet::PingResp));
        channel.close();
        assert!(!channel.send(Packet::PingResp));
        assert_eq!(rx.try_recv().unwrap(), Packet::PingResp);
        assert!(rx.try_recv().is_err());
    }
}
