//! Disconnect, connection loss, and will publication

use std::sync::Arc;

use tracing::{debug, info};

use super::{ProcessorError, ProtocolProcessor};
use crate::interceptor::{ConnectionLostEvent, DisconnectedEvent};
use crate::protocol::{QoS, Will};
use crate::registry::ChannelHandle;
use crate::store::StoredMessage;

impl ProtocolProcessor {
    /// Graceful DISCONNECT: the will is deleted, never published.
    pub async fn process_disconnect(
        &self,
        channel: &ChannelHandle,
        client_id: &Arc<str>,
    ) -> Result<(), ProcessorError> {
        info!(client_id = %client_id, "DISCONNECT");

        if let Some(session) = self.sessions.session_for_client(client_id) {
            session.write().disconnect();
            let clean = session.read().is_clean_session();
            if clean {
                self.drop_session_state(client_id);
            }
        }

        self.registry.remove(client_id);
        self.wills.remove(client_id.as_ref());
        channel.close();

        self.interceptor
            .notify_client_disconnected(DisconnectedEvent {
                client_id: client_id.clone(),
            });
        Ok(())
    }

    /// Abnormal connection loss. When the session was stolen by a newer
    /// CONNECT for the same client id, both the will and any session
    /// handling are suppressed: the new connection owns them now.
    pub async fn process_connection_lost(&self, client_id: &Arc<str>, channel: &ChannelHandle) {
        let session_stolen = channel.is_session_stolen();
        debug!(client_id = %client_id, session_stolen, "connection lost");

        self.interceptor
            .notify_connection_lost(ConnectionLostEvent {
                client_id: client_id.clone(),
            });

        // A late loss event for an already-replaced descriptor must not
        // evict the new connection
        self.registry.remove_if_matches(client_id, channel);

        if session_stolen {
            return;
        }

        if let Some((_, will)) = self.wills.remove(client_id.as_ref()) {
            self.forward_publish_will(client_id, will);
        }

        if let Some(session) = self.sessions.session_for_client(client_id) {
            let clean = session.read().is_clean_session();
            if clean {
                self.drop_session_state(client_id);
            } else {
                session.write().deactivate();
            }
        }
    }

    /// Publish the will testament as a normal routed message
    fn forward_publish_will(&self, client_id: &Arc<str>, will: Will) {
        info!(client_id = %client_id, topic = %will.topic, "publishing will");
        let mut msg = StoredMessage::from_will(client_id.clone(), &will);
        if msg.qos != QoS::AtMostOnce {
            msg.packet_id = self.sessions.next_packet_id(client_id);
        }
        self.route_to_subscribers(&mut msg);
        self.release_routing_pin(&msg);
    }

    /// Tear down everything a clean session leaves behind
    fn drop_session_state(&self, client_id: &Arc<str>) {
        self.subscriptions.remove_client(client_id);
        self.sessions.remove(client_id);
    }
}
