//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use tracing::{debug, trace};

use super::{ProcessorError, ProtocolProcessor};
use crate::interceptor::{TopicSubscribedEvent, TopicUnsubscribedEvent};
use crate::protocol::{Packet, QoS, SubAck, SubAckCode, Subscribe, UnsubAck, Unsubscribe};
use crate::registry::ChannelHandle;
use crate::topic::{topic_matches_filter, validate_topic_filter};

impl ProtocolProcessor {
    /// Handle a SUBSCRIBE packet.
    ///
    /// Each filter is validated (an invalid filter is a protocol
    /// violation and closes the channel), checked against the
    /// authorizator (denial yields the failure code), added to the index
    /// and the session, and retained messages matching it are replayed.
    /// The SUBACK carries one granted code per filter.
    pub async fn process_subscribe(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
        subscribe: Subscribe,
    ) -> Result<(), ProcessorError> {
        let Some(session) = self.sessions.session_for_client(client_id) else {
            return Err(ProcessorError::ProtocolViolation("subscribe without session"));
        };
        self.verify_to_activate(client_id);

        let username = self
            .registry
            .get(client_id)
            .and_then(|d| d.username.clone());

        let mut codes = Vec::with_capacity(subscribe.topics.len());
        for topic in &subscribe.topics {
            if validate_topic_filter(&topic.filter).is_err() {
                return Err(ProcessorError::ProtocolViolation("invalid topic filter"));
            }

            let allowed = self
                .authorizator
                .can_read(&topic.filter, username.as_deref(), client_id)
                .await;
            if !allowed {
                debug!(client_id = %client_id, filter = %topic.filter, "subscribe denied");
                codes.push(SubAckCode::Failure);
                continue;
            }

            trace!(client_id = %client_id, filter = %topic.filter, qos = ?topic.qos, "SUBSCRIBE");
            let filter: Arc<str> = Arc::from(topic.filter.as_str());
            self.subscriptions
                .add(client_id.clone(), filter.clone(), topic.qos);
            session.write().subscribe_to(filter.clone());

            self.replay_retained(client_id, &topic.filter, topic.qos);

            self.interceptor
                .notify_topic_subscribed(TopicSubscribedEvent {
                    client_id: client_id.clone(),
                    filter,
                    qos: topic.qos,
                });
            codes.push(SubAckCode::Granted(topic.qos));
        }

        channel.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            codes,
        }));
        Ok(())
    }

    /// Deliver every retained message matching a fresh subscription,
    /// retain flag set, with a fresh packet id iff the effective QoS is
    /// above zero.
    fn replay_retained(&self, client_id: &Arc<str>, filter: &str, granted: QoS) {
        let retained = self
            .messages
            .search_matching(&|topic| topic_matches_filter(topic, filter));
        if retained.is_empty() {
            return;
        }

        let Some(session) = self.sessions.session_for_client(client_id) else {
            return;
        };

        debug!(client_id = %client_id, filter, count = retained.len(), "replaying retained");
        for msg in retained {
            let effective = msg.qos.min(granted);
            let packet_id = if effective == QoS::AtMostOnce {
                None
            } else {
                let Some(guid) = msg.guid else { continue };
                let mut s = session.write();
                match s.next_packet_id() {
                    Some(id) => {
                        s.in_flight_ack_waiting(guid, id);
                        Some(id)
                    }
                    None => continue,
                }
            };
            self.direct_send(client_id, msg.topic.clone(), effective, &msg, true, packet_id);
        }
    }

    /// Handle an UNSUBSCRIBE packet. Removing a filter the client never
    /// subscribed to is not an error.
    pub async fn process_unsubscribe(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ProcessorError> {
        let session = self.sessions.session_for_client(client_id);
        self.verify_to_activate(client_id);

        for filter in &unsubscribe.filters {
            if validate_topic_filter(filter).is_err() {
                return Err(ProcessorError::ProtocolViolation("invalid topic filter"));
            }

            trace!(client_id = %client_id, filter = %filter, "UNSUBSCRIBE");
            self.subscriptions.remove(filter, client_id);
            if let Some(session) = &session {
                session.write().unsubscribe_from(filter);
            }
            self.interceptor
                .notify_topic_unsubscribed(TopicUnsubscribedEvent {
                    client_id: client_id.clone(),
                    filter: filter.clone(),
                });
        }

        channel.send(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }));
        Ok(())
    }
}
