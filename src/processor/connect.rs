//! CONNECT handling and session replay

use std::sync::Arc;

use tracing::{debug, info};

use super::{ConnectedSession, ProcessorError, ProtocolProcessor};
use crate::interceptor::ConnectedEvent;
use crate::protocol::{ConnAck, Connect, Packet, QoS, ReturnCode};
use crate::registry::{ChannelHandle, ConnectionDescriptor};

impl ProtocolProcessor {
    /// Handle a CONNECT packet. On success the caller installs the
    /// keep-alive timer from the returned parameters; on error the
    /// refusal CONNACK (if any) has been written and the channel closed.
    pub async fn process_connect(
        &self,
        channel: &ChannelHandle,
        connect: Connect,
    ) -> Result<ConnectedSession, ProcessorError> {
        debug!(client_id = %connect.client_id, "CONNECT");

        if connect.client_id.is_empty() {
            return Err(self.refuse(channel, ReturnCode::IdentifierRejected));
        }

        let username = match &connect.username {
            Some(username) => {
                let code = self
                    .authenticator
                    .check_valid(username, connect.password.as_ref())
                    .await;
                if code != ReturnCode::Accepted {
                    return Err(self.refuse(channel, code));
                }
                Some(username.clone())
            }
            None if !self.allow_anonymous => {
                return Err(self.refuse(channel, ReturnCode::BadUsernameOrPassword));
            }
            None => None,
        };

        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());

        // Register the descriptor; a duplicate client id evicts the
        // prior connection, which is closed asynchronously through the
        // connection-lost path with session_stolen set.
        let descriptor = ConnectionDescriptor {
            client_id: client_id.clone(),
            channel: channel.clone(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
            username,
        };
        if let Some(previous) = self.registry.put(descriptor) {
            info!(client_id = %client_id, "duplicate client id, evicting previous connection");
            previous.channel.mark_session_stolen();
            previous.channel.close();
        }

        if let Some(will) = connect.will.clone() {
            self.wills.insert(client_id.clone(), will);
        }

        let existing = self.sessions.session_for_client(&client_id);
        let session_present = !connect.clean_session && existing.is_some();
        let session = match existing {
            Some(session) => {
                session.write().set_clean_session(connect.clean_session);
                session
            }
            None => {
                info!(client_id = %client_id, "creating session");
                self.sessions
                    .create_new_session(client_id.clone(), connect.clean_session)
            }
        };

        if connect.clean_session {
            session.write().purge();
            self.subscriptions.remove_client(&client_id);
        }
        session.write().activate();

        channel.send(Packet::ConnAck(ConnAck::accepted(session_present)));
        self.interceptor.notify_client_connected(ConnectedEvent {
            client_id: client_id.clone(),
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
        });

        info!(
            client_id = %client_id,
            clean_session = connect.clean_session,
            session_present,
            "client connected"
        );

        if !connect.clean_session {
            self.republish_stored_in_session(&client_id);
        }

        Ok(ConnectedSession {
            client_id,
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
        })
    }

    fn refuse(&self, channel: &ChannelHandle, code: ReturnCode) -> ProcessorError {
        channel.send(Packet::ConnAck(ConnAck::refused(code)));
        channel.close();
        ProcessorError::ConnectionRefused(code)
    }

    /// Replay messages queued while the client was offline, in FIFO
    /// order, before any further live traffic.
    fn republish_stored_in_session(&self, client_id: &Arc<str>) {
        let Some(session) = self.sessions.session_for_client(client_id) else {
            return;
        };
        let stored = session.read().stored_messages();
        if stored.is_empty() {
            return;
        }

        debug!(client_id = %client_id, count = stored.len(), "replaying stored messages");
        for msg in stored {
            let Some(guid) = msg.guid else { continue };
            let packet_id = if msg.qos == QoS::AtMostOnce {
                None
            } else {
                let mut s = session.write();
                match s.next_packet_id() {
                    Some(id) => {
                        s.in_flight_ack_waiting(guid, id);
                        Some(id)
                    }
                    // Out of ids: leave the rest queued
                    None => break,
                }
            };
            self.direct_send(client_id, msg.topic.clone(), msg.qos, &msg, false, packet_id);
            session.write().remove_enqueued(guid);
        }
    }
}
