//! Client session state
//!
//! One `ClientSession` per client id, shared behind `Arc<RwLock<..>>`.
//! All mutations serialize on the session lock. Packet ids in the
//! in-flight and second-phase maps are disjoint by construction: an id
//! lives in exactly one of them at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use super::{Guid, MessageStore, StoredMessage};

pub struct ClientSession {
    pub client_id: Arc<str>,
    clean_session: bool,
    active: bool,
    /// Messages queued for delivery while the client is offline (FIFO)
    enqueued: VecDeque<Guid>,
    /// Outbound QoS 1/2 messages awaiting PUBACK or PUBREC
    in_flight: AHashMap<u16, Guid>,
    /// Outbound QoS 2 messages past PUBREC, awaiting PUBCOMP
    second_phase: AHashMap<u16, Guid>,
    /// Inbound QoS 2 publishes held until PUBREL
    inbound: AHashMap<u16, Guid>,
    /// Filters this client is subscribed to
    subscriptions: AHashSet<Arc<str>>,
    next_packet_id: u16,
    messages: Arc<dyn MessageStore>,
}

impl ClientSession {
    pub fn new(client_id: Arc<str>, clean_session: bool, messages: Arc<dyn MessageStore>) -> Self {
        Self {
            client_id,
            clean_session,
            active: false,
            enqueued: VecDeque::new(),
            in_flight: AHashMap::with_capacity(16),
            second_phase: AHashMap::with_capacity(8),
            inbound: AHashMap::with_capacity(8),
            subscriptions: AHashSet::with_capacity(8),
            next_packet_id: 0,
            messages,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Graceful or abnormal connection teardown
    pub fn disconnect(&mut self) {
        self.active = false;
    }

    pub fn is_clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_clean_session(&mut self, clean: bool) {
        self.clean_session = clean;
    }

    /// Purge all session state: subscriptions, offline queue, in-flight
    /// and handshake maps. Every held message reference is released.
    pub fn purge(&mut self) {
        for guid in self.enqueued.drain(..) {
            self.messages.drop_reference(guid);
        }
        for (_, guid) in self.in_flight.drain() {
            self.messages.drop_reference(guid);
        }
        for (_, guid) in self.second_phase.drain() {
            self.messages.drop_reference(guid);
        }
        for (_, guid) in self.inbound.drain() {
            self.messages.drop_reference(guid);
        }
        self.subscriptions.clear();
    }

    /// Allocate the next packet id: monotonic modulo 2^16, skipping 0
    /// and any id currently in flight or in the second phase. Returns
    /// `None` when every id is taken; the caller must queue instead of
    /// sending.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        if self.in_flight.len() + self.second_phase.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }
            let id = self.next_packet_id;
            if !self.in_flight.contains_key(&id) && !self.second_phase.contains_key(&id) {
                return Some(id);
            }
        }
    }

    /// Append to the offline delivery queue
    pub fn enqueue_to_deliver(&mut self, guid: Guid) {
        self.messages.add_reference(guid);
        self.enqueued.push_back(guid);
    }

    /// Ordered view of the offline queue, used at reconnect
    pub fn stored_messages(&self) -> Vec<StoredMessage> {
        self.enqueued
            .iter()
            .filter_map(|&guid| self.messages.retrieve(guid))
            .collect()
    }

    /// Remove one enqueued entry after replaying it
    pub fn remove_enqueued(&mut self, guid: Guid) {
        if let Some(pos) = self.enqueued.iter().position(|&g| g == guid) {
            self.enqueued.remove(pos);
            self.messages.drop_reference(guid);
        }
    }

    /// Record an outbound QoS 1/2 send awaiting its first ack
    pub fn in_flight_ack_waiting(&mut self, guid: Guid, packet_id: u16) {
        self.messages.add_reference(guid);
        if let Some(old) = self.in_flight.insert(packet_id, guid) {
            self.messages.drop_reference(old);
        }
    }

    /// PUBACK (or QoS 1 completion): drop the in-flight entry
    pub fn in_flight_acknowledged(&mut self, packet_id: u16) -> Option<Guid> {
        let guid = self.in_flight.remove(&packet_id)?;
        self.messages.drop_reference(guid);
        Some(guid)
    }

    /// PUBREC: move the in-flight entry (and its message reference)
    /// into the second phase
    pub fn second_phase_ack_waiting(&mut self, packet_id: u16) -> bool {
        match self.in_flight.remove(&packet_id) {
            Some(guid) => {
                self.second_phase.insert(packet_id, guid);
                true
            }
            None => false,
        }
    }

    /// PUBCOMP: the QoS 2 handshake for this id is complete
    pub fn second_phase_acknowledged(&mut self, packet_id: u16) -> Option<Guid> {
        let guid = self.second_phase.remove(&packet_id)?;
        self.messages.drop_reference(guid);
        Some(guid)
    }

    /// Hold an inbound QoS 2 publish until its PUBREL arrives
    pub fn store_inbound_publish(&mut self, packet_id: u16, guid: Guid) {
        self.messages.add_reference(guid);
        if let Some(old) = self.inbound.insert(packet_id, guid) {
            self.messages.drop_reference(old);
        }
    }

    /// The publish a PUBREL refers to
    pub fn stored_message(&self, packet_id: u16) -> Option<StoredMessage> {
        let guid = self.inbound.get(&packet_id)?;
        self.messages.retrieve(*guid)
    }

    /// Drop the inbound entry once the PUBREL has been routed
    pub fn inbound_delivered(&mut self, packet_id: u16) {
        if let Some(guid) = self.inbound.remove(&packet_id) {
            self.messages.drop_reference(guid);
        }
    }

    pub fn subscribe_to(&mut self, filter: Arc<str>) {
        self.subscriptions.insert(filter);
    }

    pub fn unsubscribe_from(&mut self, filter: &str) {
        self.subscriptions.remove(filter);
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Arc<str>> {
        self.subscriptions.iter()
    }

    pub fn enqueued_len(&self) -> usize {
        self.enqueued.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn second_phase_len(&self) -> usize {
        self.second_phase.len()
    }
}
