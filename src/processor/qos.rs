//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;

use tracing::{debug, trace};

use super::{ProcessorError, ProtocolProcessor};
use crate::interceptor::PubackEvent;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::registry::ChannelHandle;

impl ProtocolProcessor {
    /// PUBACK from a subscriber completes a QoS 1 delivery
    pub async fn process_puback(
        &self,
        client_id: &Arc<str>,
        puback: PubAck,
    ) -> Result<(), ProcessorError> {
        trace!(client_id = %client_id, packet_id = puback.packet_id, "PUBACK");
        if let Some(session) = self.sessions.session_for_client(client_id) {
            self.verify_to_activate(client_id);
            session.write().in_flight_acknowledged(puback.packet_id);
        }
        self.interceptor.notify_puback(PubackEvent {
            client_id: client_id.clone(),
            packet_id: puback.packet_id,
        });
        Ok(())
    }

    /// PUBREC from a subscriber: the outbound QoS 2 message moves to the
    /// second phase and we answer with PUBREL
    pub async fn process_pubrec(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
        pubrec: PubRec,
    ) -> Result<(), ProcessorError> {
        trace!(client_id = %client_id, packet_id = pubrec.packet_id, "PUBREC");
        if let Some(session) = self.sessions.session_for_client(client_id) {
            self.verify_to_activate(client_id);
            if !session.write().second_phase_ack_waiting(pubrec.packet_id) {
                debug!(
                    client_id = %client_id,
                    packet_id = pubrec.packet_id,
                    "PUBREC for unknown packet id"
                );
            }
        }
        channel.send(Packet::PubRel(PubRel {
            packet_id: pubrec.packet_id,
        }));
        Ok(())
    }

    /// PUBREL from a publisher: second phase of an inbound QoS 2
    /// publish. The parked message is routed to subscribers now, the
    /// retain policy applied, and the handshake answered with PUBCOMP.
    pub async fn process_pubrel(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
        pubrel: PubRel,
    ) -> Result<(), ProcessorError> {
        trace!(client_id = %client_id, packet_id = pubrel.packet_id, "PUBREL");

        if let Some(session) = self.sessions.session_for_client(client_id) {
            self.verify_to_activate(client_id);
            let stored = session.read().stored_message(pubrel.packet_id);
            if let Some(mut msg) = stored {
                self.route_to_subscribers(&mut msg);
                self.apply_retain_policy(&msg);
                session.write().inbound_delivered(pubrel.packet_id);
            } else {
                debug!(
                    client_id = %client_id,
                    packet_id = pubrel.packet_id,
                    "PUBREL without stored publish"
                );
            }
        }

        channel.send(Packet::PubComp(PubComp {
            packet_id: pubrel.packet_id,
        }));
        Ok(())
    }

    /// PUBCOMP from a subscriber closes the QoS 2 handshake
    pub async fn process_pubcomp(
        &self,
        client_id: &Arc<str>,
        pubcomp: PubComp,
    ) -> Result<(), ProcessorError> {
        trace!(client_id = %client_id, packet_id = pubcomp.packet_id, "PUBCOMP");
        if let Some(session) = self.sessions.session_for_client(client_id) {
            self.verify_to_activate(client_id);
            session.write().second_phase_acknowledged(pubcomp.packet_id);
        }
        Ok(())
    }
}
