//! Message and session storage
//!
//! The broker core only depends on the contracts in this module; the
//! in-memory implementation lives in [`memory`]. A durable backend must
//! recover non-clean sessions, their enqueued guids, retained messages
//! and QoS 2 second-phase state across restarts; clean sessions must
//! not be recovered.

mod memory;
mod session;

pub use memory::{MemoryMessageStore, MemorySessionStore, MemoryStore};
pub use session::ClientSession;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::protocol::{Publish, QoS, Will};

/// Opaque content identifier for a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(Uuid);

impl Guid {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message held for QoS 1/2 delivery or as a retained message.
/// Payload bytes are immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Assigned by the message store; `None` until stored
    pub guid: Option<Guid>,
    /// Client id of the publisher
    pub client_id: Arc<str>,
    pub topic: Arc<str>,
    pub qos: QoS,
    pub payload: Bytes,
    pub retained: bool,
    /// Packet id the publisher used, if any
    pub packet_id: Option<u16>,
}

impl StoredMessage {
    /// Build from an inbound PUBLISH
    pub fn from_publish(client_id: Arc<str>, publish: &Publish) -> Self {
        Self {
            guid: None,
            client_id,
            topic: publish.topic.clone(),
            qos: publish.qos,
            payload: publish.payload.clone(),
            retained: publish.retain,
            packet_id: publish.packet_id,
        }
    }

    /// Build from a will message
    pub fn from_will(client_id: Arc<str>, will: &Will) -> Self {
        Self {
            guid: None,
            client_id,
            topic: Arc::from(will.topic.as_str()),
            qos: will.qos,
            payload: will.payload.clone(),
            retained: will.retain,
            packet_id: None,
        }
    }
}

/// Storage failure, surfaced to the caller; the connection is closed.
#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Content-addressed storage for payloads pending QoS 1/2 delivery,
/// plus the retained-message map.
///
/// Message lifetime is reference counted: sessions hold a reference for
/// every enqueued, in-flight, second-phase and inbound entry, the
/// retained map holds one per mapping, and the router holds a transient
/// pin from store time until fan-out completes. An entry is removed
/// when its count reaches zero.
pub trait MessageStore: Send + Sync {
    /// Persist a message and assign its guid. The initial reference is
    /// the caller's pin; drop it when done handing the guid out.
    fn store_publish_for_future(&self, msg: &mut StoredMessage) -> Guid;

    /// Fetch a stored message by guid
    fn retrieve(&self, guid: Guid) -> Option<StoredMessage>;

    /// Map a topic to its retained message, replacing any previous one
    fn store_retained(&self, topic: Arc<str>, guid: Guid);

    /// Drop the retained message for a topic, if any
    fn clean_retained(&self, topic: &str);

    /// Retained messages whose topic satisfies the predicate; used by
    /// SUBSCRIBE to replay retained state to a new subscriber
    fn search_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<StoredMessage>;

    /// Take an additional reference on a stored message
    fn add_reference(&self, guid: Guid);

    /// Release a reference; the entry is removed at zero
    fn drop_reference(&self, guid: Guid);
}

/// Per-client persistent session state
pub trait SessionStore: Send + Sync {
    /// Look up the session for a client id
    fn session_for_client(&self, client_id: &str) -> Option<Arc<RwLock<ClientSession>>>;

    /// Create (or replace) the session for a client id
    fn create_new_session(
        &self,
        client_id: Arc<str>,
        clean_session: bool,
    ) -> Arc<RwLock<ClientSession>>;

    /// Drop a session entirely (clean-session teardown)
    fn remove(&self, client_id: &str);

    /// Allocate the next packet id on a client's session
    fn next_packet_id(&self, client_id: &str) -> Option<u16>;
}

/// Factory for the pluggable storage pair
pub trait PersistentStore: Send + Sync {
    fn init_store(&self) -> Result<(), StoreError>;

    fn close(&self);

    fn messages_store(&self) -> Arc<dyn MessageStore>;

    fn sessions_store(&self, messages: Arc<dyn MessageStore>) -> Arc<dyn SessionStore>;
}
