//! PUBLISH handling

use std::sync::Arc;

use tracing::{debug, trace};

use super::{ProcessorError, ProtocolProcessor};
use crate::interceptor::TopicPublishedEvent;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::registry::ChannelHandle;
use crate::store::StoredMessage;
use crate::topic::validate_topic_name;

impl ProtocolProcessor {
    /// Handle a PUBLISH from a client.
    ///
    /// QoS 0 routes immediately with no ack. QoS 1 acks with PUBACK and
    /// routes. QoS 2 acks with PUBREC and parks the message in the
    /// publisher's session; routing happens when the PUBREL arrives.
    pub async fn process_publish(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
        publish: Publish,
    ) -> Result<(), ProcessorError> {
        if validate_topic_name(&publish.topic).is_err() {
            return Err(ProcessorError::ProtocolViolation("invalid publish topic"));
        }
        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => {
                return Err(ProcessorError::ProtocolViolation(
                    "QoS > 0 publish without packet id",
                ))
            }
        };

        trace!(client_id = %client_id, topic = %publish.topic, qos = ?publish.qos, "PUBLISH");

        let username = self
            .registry
            .get(client_id)
            .and_then(|d| d.username.clone());
        let allowed = self
            .authorizator
            .can_write(&publish.topic, username.as_deref(), client_id, publish.qos)
            .await;

        if !allowed {
            // Policy violations are acked per QoS and silently dropped
            debug!(client_id = %client_id, topic = %publish.topic, "publish denied, dropping");
            match (publish.qos, packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => {
                    channel.send(Packet::PubAck(PubAck { packet_id }));
                }
                (QoS::ExactlyOnce, Some(packet_id)) => {
                    channel.send(Packet::PubRec(PubRec { packet_id }));
                }
                _ => {}
            }
            return Ok(());
        }

        match (publish.qos, packet_id) {
            (QoS::AtMostOnce, _) => {
                let mut msg = StoredMessage::from_publish(client_id.clone(), &publish);
                self.route_to_subscribers(&mut msg);
                self.apply_retain_policy(&msg);
                self.release_routing_pin(&msg);
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                channel.send(Packet::PubAck(PubAck { packet_id }));

                let mut msg = StoredMessage::from_publish(client_id.clone(), &publish);
                self.route_to_subscribers(&mut msg);
                self.apply_retain_policy(&msg);
                self.release_routing_pin(&msg);
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                channel.send(Packet::PubRec(PubRec { packet_id }));

                // Stored now, routed on PUBREL
                let Some(session) = self.sessions.session_for_client(client_id) else {
                    return Err(ProcessorError::ProtocolViolation("publish without session"));
                };
                let mut msg = StoredMessage::from_publish(client_id.clone(), &publish);
                let guid = self.messages.store_publish_for_future(&mut msg);
                session.write().store_inbound_publish(packet_id, guid);
                self.release_routing_pin(&msg);
            }
            (_, None) => unreachable!("packet id checked above"),
        }

        self.interceptor.notify_topic_published(TopicPublishedEvent {
            client_id: client_id.clone(),
            topic: publish.topic.clone(),
            qos: publish.qos,
            payload: publish.payload.clone(),
            retain: publish.retain,
        });

        Ok(())
    }
}
