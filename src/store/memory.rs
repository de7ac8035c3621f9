//! In-memory storage backend
//!
//! The reference implementation of the store contracts. All maps are
//! concurrent; mutations are visible to the calling thread before the
//! method returns.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::warn;

use super::{
    ClientSession, Guid, MessageStore, PersistentStore, SessionStore, StoreError, StoredMessage,
};

struct StoredEntry {
    message: StoredMessage,
    references: usize,
}

/// In-memory, reference-counted message store
#[derive(Default)]
pub struct MemoryMessageStore {
    entries: DashMap<Guid, StoredEntry>,
    /// topic -> guid of the latest retained message
    retained: DashMap<Arc<str>, Guid>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

impl MessageStore for MemoryMessageStore {
    fn store_publish_for_future(&self, msg: &mut StoredMessage) -> Guid {
        let guid = Guid::new();
        msg.guid = Some(guid);
        self.entries.insert(
            guid,
            StoredEntry {
                message: msg.clone(),
                references: 1,
            },
        );
        guid
    }

    fn retrieve(&self, guid: Guid) -> Option<StoredMessage> {
        self.entries.get(&guid).map(|e| e.message.clone())
    }

    fn store_retained(&self, topic: Arc<str>, guid: Guid) {
        self.add_reference(guid);
        if let Some(previous) = self.retained.insert(topic, guid) {
            self.drop_reference(previous);
        }
    }

    fn clean_retained(&self, topic: &str) {
        if let Some((_, guid)) = self.retained.remove(topic) {
            self.drop_reference(guid);
        }
    }

    fn search_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<StoredMessage> {
        self.retained
            .iter()
            .filter(|entry| predicate(entry.key()))
            .filter_map(|entry| self.retrieve(*entry.value()))
            .collect()
    }

    fn add_reference(&self, guid: Guid) {
        if let Some(mut entry) = self.entries.get_mut(&guid) {
            entry.references += 1;
        } else {
            warn!(%guid, "reference to unknown stored message");
        }
    }

    fn drop_reference(&self, guid: Guid) {
        let gone = match self.entries.get_mut(&guid) {
            Some(mut entry) => {
                entry.references = entry.references.saturating_sub(1);
                entry.references == 0
            }
            None => false,
        };
        if gone {
            self.entries.remove_if(&guid, |_, e| e.references == 0);
        }
    }
}

/// In-memory session store
pub struct MemorySessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<ClientSession>>>,
    messages: Arc<dyn MessageStore>,
}

impl MemorySessionStore {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            messages,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn session_for_client(&self, client_id: &str) -> Option<Arc<RwLock<ClientSession>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    fn create_new_session(
        &self,
        client_id: Arc<str>,
        clean_session: bool,
    ) -> Arc<RwLock<ClientSession>> {
        let session = Arc::new(RwLock::new(ClientSession::new(
            client_id.clone(),
            clean_session,
            self.messages.clone(),
        )));
        self.sessions.insert(client_id, session.clone());
        session
    }

    fn remove(&self, client_id: &str) {
        if let Some((_, session)) = self.sessions.remove(client_id) {
            session.write().purge();
        }
    }

    fn next_packet_id(&self, client_id: &str) -> Option<u16> {
        let session = self.session_for_client(client_id)?;
        let id = session.write().next_packet_id();
        id
    }
}

/// Factory wiring the in-memory pair together
#[derive(Default)]
pub struct MemoryStore {
    messages: Arc<MemoryMessageStore>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn init_store(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) {}

    fn messages_store(&self) -> Arc<dyn MessageStore> {
        self.messages.clone()
    }

    fn sessions_store(&self, messages: Arc<dyn MessageStore>) -> Arc<dyn SessionStore> {
        Arc::new(MemorySessionStore::new(messages))
    }
}
