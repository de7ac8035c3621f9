use std::sync::Arc;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::interceptor::BrokerInterceptor;
use crate::protocol::{
    ConnAck, Connect, PubAck, PubComp, PubRec, PubRel, SubAckCode, Subscribe, SubscribeTopic,
    Unsubscribe, Will,
};
use crate::registry::ChannelHandle;
use crate::security::{AcceptAllAuthenticator, PermitAllAuthorizator, TopicPolicyAuthorizator};
use crate::store::{MemoryStore, PersistentStore};

fn build_processor(authorizator: DynAuthorizator) -> ProtocolProcessor {
    let store = MemoryStore::new();
    let messages = store.messages_store();
    let sessions = store.sessions_store(messages.clone());
    ProtocolProcessor::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(SubscriptionIndex::new()),
        messages,
        sessions,
        Arc::new(BrokerInterceptor::new()),
        Arc::new(AcceptAllAuthenticator),
        authorizator,
        true,
    )
}

fn processor() -> ProtocolProcessor {
    build_processor(Arc::new(PermitAllAuthorizator))
}

type Client = (Arc<str>, ChannelHandle, mpsc::Receiver<Packet>);

async fn connect_client(
    processor: &ProtocolProcessor,
    client_id: &str,
    clean_session: bool,
) -> Client {
    let (channel, mut rx) = ChannelHandle::new(64);
    let connected = processor
        .process_connect(
            &channel,
            Connect {
                client_id: client_id.to_string(),
                clean_session,
                ..Connect::default()
            },
        )
        .await
        .expect("connect accepted");
    // First packet is always the CONNACK
    match rx.try_recv().expect("CONNACK") {
        Packet::ConnAck(_) => {}
        other => panic!("expected CONNACK, got {:?}", other),
    }
    (connected.client_id, channel, rx)
}

async fn connect_expecting(
    processor: &ProtocolProcessor,
    connect: Connect,
) -> (ConnAck, Result<ConnectedSession, ProcessorError>) {
    let (channel, mut rx) = ChannelHandle::new(64);
    let result = processor.process_connect(&channel, connect).await;
    match rx.try_recv().expect("CONNACK") {
        Packet::ConnAck(ack) => (ack, result),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

async fn subscribe(
    processor: &ProtocolProcessor,
    client: &mut Client,
    filter: &str,
    qos: QoS,
) -> Vec<SubAckCode> {
    processor
        .process_subscribe(
            &client.1,
            &client.0,
            Subscribe {
                packet_id: 10,
                topics: vec![SubscribeTopic {
                    filter: filter.to_string(),
                    qos,
                }],
            },
        )
        .await
        .expect("subscribe");
    loop {
        match client.2.try_recv().expect("SUBACK") {
            Packet::SubAck(ack) => return ack.codes,
            // retained replay may precede the SUBACK
            Packet::Publish(_) => continue,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }
}

fn publish_packet(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Publish {
    Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id,
        payload: Bytes::from_static(payload),
    }
}

fn expect_publish(rx: &mut mpsc::Receiver<Packet>) -> Publish {
    match rx.try_recv().expect("expected a packet") {
        Packet::Publish(p) => p,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[tokio::test]
async fn qos0_fanout_reaches_only_matching_subscribers() {
    let processor = processor();
    let mut a = connect_client(&processor, "a", true).await;
    let mut b = connect_client(&processor, "b", true).await;
    let mut c = connect_client(&processor, "c", true).await;

    subscribe(&processor, &mut b, "sport/+", QoS::AtMostOnce).await;

    processor
        .process_publish(
            &a.1,
            &a.0,
            publish_packet("sport/tennis", b"x", QoS::AtMostOnce, None),
        )
        .await
        .unwrap();

    let delivered = expect_publish(&mut b.2);
    assert_eq!(delivered.topic.as_ref(), "sport/tennis");
    assert_eq!(&delivered.payload[..], b"x");
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert!(delivered.packet_id.is_none());

    assert!(c.2.try_recv().is_err());
    assert!(a.2.try_recv().is_err());
}

#[tokio::test]
async fn qos_downgrade_to_subscriber_request() {
    let processor = processor();
    let mut publisher = connect_client(&processor, "pub", true).await;
    let mut subscriber = connect_client(&processor, "sub", true).await;

    subscribe(&processor, &mut subscriber, "alert", QoS::AtMostOnce).await;

    // QoS 2 publish: PUBREC immediately, routing at PUBREL
    processor
        .process_publish(
            &publisher.1,
            &publisher.0,
            publish_packet("alert", b"boom", QoS::ExactlyOnce, Some(7)),
        )
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubRec(PubRec { packet_id: 7 })
    );
    assert!(subscriber.2.try_recv().is_err(), "no routing before PUBREL");

    processor
        .process_pubrel(&publisher.1, &publisher.0, PubRel { packet_id: 7 })
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubComp(PubComp { packet_id: 7 })
    );

    // Effective QoS is min(2, 0): delivered once, no handshake state
    let delivered = expect_publish(&mut subscriber.2);
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert!(delivered.packet_id.is_none());
    assert!(subscriber.2.try_recv().is_err());
}

#[tokio::test]
async fn qos2_handshake_routes_at_pubrel() {
    let processor = processor();
    let mut publisher = connect_client(&processor, "pub", true).await;
    let mut subscriber = connect_client(&processor, "sub", true).await;

    subscribe(&processor, &mut subscriber, "alert", QoS::ExactlyOnce).await;

    processor
        .process_publish(
            &publisher.1,
            &publisher.0,
            publish_packet("alert", b"boom", QoS::ExactlyOnce, Some(7)),
        )
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubRec(PubRec { packet_id: 7 })
    );

    processor
        .process_pubrel(&publisher.1, &publisher.0, PubRel { packet_id: 7 })
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubComp(PubComp { packet_id: 7 })
    );

    // Outbound QoS 2 leg toward the subscriber
    let delivered = expect_publish(&mut subscriber.2);
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    let packet_id = delivered.packet_id.expect("packet id for QoS 2");

    processor
        .process_pubrec(&subscriber.1, &subscriber.0, PubRec { packet_id })
        .await
        .unwrap();
    assert_eq!(
        subscriber.2.try_recv().unwrap(),
        Packet::PubRel(PubRel { packet_id })
    );

    let session = processor.sessions.session_for_client(&subscriber.0).unwrap();
    assert_eq!(session.read().second_phase_len(), 1);

    processor
        .process_pubcomp(&subscriber.0, PubComp { packet_id })
        .await
        .unwrap();
    assert_eq!(session.read().second_phase_len(), 0);
    assert_eq!(session.read().in_flight_len(), 0);
}

#[tokio::test]
async fn retained_message_replayed_on_subscribe() {
    let processor = processor();
    let mut publisher = connect_client(&processor, "pub", true).await;

    let mut retained = publish_packet("news", b"hello", QoS::AtLeastOnce, Some(3));
    retained.retain = true;
    processor
        .process_publish(&publisher.1, &publisher.0, retained)
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubAck(PubAck { packet_id: 3 })
    );

    let mut subscriber = connect_client(&processor, "sub", true).await;
    processor
        .process_subscribe(
            &subscriber.1,
            &subscriber.0,
            Subscribe {
                packet_id: 10,
                topics: vec![SubscribeTopic {
                    filter: "news".into(),
                    qos: QoS::AtLeastOnce,
                }],
            },
        )
        .await
        .unwrap();

    // Retained replay precedes the SUBACK
    let delivered = expect_publish(&mut subscriber.2);
    assert!(delivered.retain);
    assert_eq!(&delivered.payload[..], b"hello");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    let packet_id = delivered.packet_id.expect("fresh packet id");
    assert_ne!(packet_id, 0);

    match subscriber.2.try_recv().unwrap() {
        Packet::SubAck(ack) => {
            assert_eq!(ack.codes, vec![SubAckCode::Granted(QoS::AtLeastOnce)])
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }

    // PUBACK clears the in-flight entry
    processor
        .process_puback(&subscriber.0, PubAck { packet_id })
        .await
        .unwrap();
    let session = processor.sessions.session_for_client(&subscriber.0).unwrap();
    assert_eq!(session.read().in_flight_len(), 0);
}

#[tokio::test]
async fn empty_retained_payload_clears_entry() {
    let processor = processor();
    let mut publisher = connect_client(&processor, "pub", true).await;

    let mut retained = publish_packet("news", b"hello", QoS::AtLeastOnce, Some(1));
    retained.retain = true;
    processor
        .process_publish(&publisher.1, &publisher.0, retained)
        .await
        .unwrap();
    publisher.2.try_recv().unwrap();

    let mut clear = publish_packet("news", b"", QoS::AtLeastOnce, Some(2));
    clear.retain = true;
    processor
        .process_publish(&publisher.1, &publisher.0, clear)
        .await
        .unwrap();
    publisher.2.try_recv().unwrap();

    let mut subscriber = connect_client(&processor, "sub", true).await;
    let codes = subscribe(&processor, &mut subscriber, "news", QoS::AtLeastOnce).await;
    assert_eq!(codes, vec![SubAckCode::Granted(QoS::AtLeastOnce)]);
    assert!(subscriber.2.try_recv().is_err(), "no retained replay");
}

#[tokio::test]
async fn offline_queue_replays_in_fifo_order() {
    let processor = processor();
    let mut publisher = connect_client(&processor, "pub", true).await;

    {
        let mut b = connect_client(&processor, "b", false).await;
        subscribe(&processor, &mut b, "chat", QoS::AtLeastOnce).await;
        processor.process_connection_lost(&b.0, &b.1).await;
    }

    for (payload, packet_id) in [(b"m1" as &[u8], 1u16), (b"m2", 2), (b"m3", 3)] {
        processor
            .process_publish(
                &publisher.1,
                &publisher.0,
                Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                    topic: "chat".into(),
                    packet_id: Some(packet_id),
                    payload: Bytes::copy_from_slice(payload),
                },
            )
            .await
            .unwrap();
        publisher.2.try_recv().unwrap();
    }

    let (channel, mut rx) = ChannelHandle::new(64);
    processor
        .process_connect(
            &channel,
            Connect {
                client_id: "b".into(),
                clean_session: false,
                ..Connect::default()
            },
        )
        .await
        .unwrap();
    match rx.try_recv().unwrap() {
        Packet::ConnAck(ack) => assert!(ack.session_present),
        other => panic!("expected CONNACK, got {:?}", other),
    }

    let mut payloads = Vec::new();
    let mut ids = Vec::new();
    while let Ok(packet) = rx.try_recv() {
        if let Packet::Publish(p) = packet {
            payloads.push(p.payload.to_vec());
            ids.push(p.packet_id.expect("fresh packet id"));
        }
    }
    assert_eq!(payloads, vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
    assert_eq!(ids.len(), 3);
    ids.dedup();
    assert_eq!(ids.len(), 3, "packet ids must be distinct");

    // The queue is empty afterwards
    let session = processor.sessions.session_for_client("b").unwrap();
    assert_eq!(session.read().enqueued_len(), 0);
}

#[tokio::test]
async fn clean_session_reconnect_purges_state() {
    let processor = processor();

    {
        let mut a = connect_client(&processor, "a", false).await;
        subscribe(&processor, &mut a, "x", QoS::AtLeastOnce).await;
        processor.process_disconnect(&a.1, &a.0).await.unwrap();
    }

    // Reconnect with clean_session=true discards the stored session
    let (connack, result) = connect_expecting(
        &processor,
        Connect {
            client_id: "a".into(),
            clean_session: true,
            ..Connect::default()
        },
    )
    .await;
    assert!(result.is_ok());
    assert!(!connack.session_present);

    // The old subscription is gone: publishes to x do not reach a
    let mut publisher = connect_client(&processor, "pub", true).await;
    processor
        .process_publish(
            &publisher.1,
            &publisher.0,
            publish_packet("x", b"data", QoS::AtLeastOnce, Some(1)),
        )
        .await
        .unwrap();
    publisher.2.try_recv().unwrap();

    let session = processor.sessions.session_for_client("a").unwrap();
    assert_eq!(session.read().enqueued_len(), 0);
    assert_eq!(session.read().in_flight_len(), 0);
}

#[tokio::test]
async fn will_published_on_loss_not_on_disconnect() {
    let processor = processor();

    let connect_with_will = |client_id: &str| Connect {
        client_id: client_id.to_string(),
        clean_session: true,
        will: Some(Will {
            topic: "obit".into(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        }),
        ..Connect::default()
    };

    let mut watcher = connect_client(&processor, "watcher", true).await;
    subscribe(&processor, &mut watcher, "obit", QoS::AtMostOnce).await;

    // Case a: abnormal loss publishes the will
    let (channel, mut rx) = ChannelHandle::new(64);
    let connected = processor
        .process_connect(&channel, connect_with_will("a"))
        .await
        .unwrap();
    rx.try_recv().unwrap();
    processor
        .process_connection_lost(&connected.client_id, &channel)
        .await;

    let delivered = expect_publish(&mut watcher.2);
    assert_eq!(delivered.topic.as_ref(), "obit");
    assert_eq!(&delivered.payload[..], b"gone");

    // The will fires once; a second loss event has nothing to publish
    processor
        .process_connection_lost(&connected.client_id, &channel)
        .await;
    assert!(watcher.2.try_recv().is_err());

    // Case b: graceful DISCONNECT deletes the will silently
    let (channel, mut rx) = ChannelHandle::new(64);
    let connected = processor
        .process_connect(&channel, connect_with_will("b"))
        .await
        .unwrap();
    rx.try_recv().unwrap();
    processor
        .process_disconnect(&channel, &connected.client_id)
        .await
        .unwrap();
    processor
        .process_connection_lost(&connected.client_id, &channel)
        .await;

    assert!(watcher.2.try_recv().is_err());
}

#[tokio::test]
async fn session_takeover_suppresses_will_and_closes_old_channel() {
    let processor = processor();

    let mut watcher = connect_client(&processor, "watcher", true).await;
    subscribe(&processor, &mut watcher, "obit", QoS::AtMostOnce).await;

    let connect_with_will = Connect {
        client_id: "dup".into(),
        clean_session: true,
        will: Some(Will {
            topic: "obit".into(),
            payload: Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        }),
        ..Connect::default()
    };

    let (first_channel, mut first_rx) = ChannelHandle::new(64);
    processor
        .process_connect(&first_channel, connect_with_will.clone())
        .await
        .unwrap();
    first_rx.try_recv().unwrap();

    // Second CONNECT with the same client id takes over
    let (second_channel, mut second_rx) = ChannelHandle::new(64);
    processor
        .process_connect(&second_channel, connect_with_will)
        .await
        .unwrap();
    second_rx.try_recv().unwrap();

    assert!(first_channel.is_closed());
    assert!(first_channel.is_session_stolen());

    // The transport of the evicted connection reports the loss; the
    // stolen flag suppresses the will
    processor
        .process_connection_lost(&Arc::from("dup"), &first_channel)
        .await;
    assert!(watcher.2.try_recv().is_err());

    // The registry still points at the new connection
    assert_eq!(
        processor.registry.get("dup").unwrap().channel,
        second_channel
    );
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let processor = processor();
    let mut client = connect_client(&processor, "c", true).await;

    processor
        .process_unsubscribe(
            &client.1,
            &client.0,
            Unsubscribe {
                packet_id: 9,
                filters: vec!["never/subscribed".into()],
            },
        )
        .await
        .unwrap();

    assert_eq!(
        client.2.try_recv().unwrap(),
        Packet::UnsubAck(crate::protocol::UnsubAck { packet_id: 9 })
    );
}

#[tokio::test]
async fn denied_publish_is_acked_and_dropped() {
    let processor = build_processor(Arc::new(TopicPolicyAuthorizator::new(
        Some("allowed".into()),
        None,
    )));
    let mut publisher = connect_client(&processor, "pub", true).await;
    let mut subscriber = connect_client(&processor, "sub", true).await;

    let codes = subscribe(&processor, &mut subscriber, "allowed", QoS::AtLeastOnce).await;
    assert_eq!(codes, vec![SubAckCode::Granted(QoS::AtLeastOnce)]);

    // Denied filter gets the failure code
    let codes = subscribe(&processor, &mut subscriber, "forbidden", QoS::AtLeastOnce).await;
    assert_eq!(codes, vec![SubAckCode::Failure]);

    // Denied publish: PUBACK still sent, nothing routed
    processor
        .process_publish(
            &publisher.1,
            &publisher.0,
            publish_packet("forbidden", b"x", QoS::AtLeastOnce, Some(5)),
        )
        .await
        .unwrap();
    assert_eq!(
        publisher.2.try_recv().unwrap(),
        Packet::PubAck(PubAck { packet_id: 5 })
    );
    assert!(subscriber.2.try_recv().is_err());
}

#[tokio::test]
async fn empty_client_id_is_rejected() {
    let processor = processor();
    let (connack, result) = connect_expecting(
        &processor,
        Connect {
            client_id: String::new(),
            ..Connect::default()
        },
    )
    .await;
    assert_eq!(connack.return_code, ReturnCode::IdentifierRejected);
    assert!(matches!(
        result,
        Err(ProcessorError::ConnectionRefused(
            ReturnCode::IdentifierRejected
        ))
    ));
}

#[tokio::test]
async fn anonymous_rejected_when_disallowed() {
    let store = MemoryStore::new();
    let messages = store.messages_store();
    let sessions = store.sessions_store(messages.clone());
    let processor = ProtocolProcessor::new(
        Arc::new(ConnectionRegistry::new()),
        Arc::new(SubscriptionIndex::new()),
        messages,
        sessions,
        Arc::new(BrokerInterceptor::new()),
        Arc::new(AcceptAllAuthenticator),
        Arc::new(PermitAllAuthorizator),
        false,
    );

    let (connack, result) = connect_expecting(
        &processor,
        Connect {
            client_id: "anon".into(),
            ..Connect::default()
        },
    )
    .await;
    assert_eq!(connack.return_code, ReturnCode::BadUsernameOrPassword);
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_subscribe_filter_is_a_protocol_violation() {
    let processor = processor();
    let client = connect_client(&processor, "c", true).await;

    let result = processor
        .process_subscribe(
            &client.1,
            &client.0,
            Subscribe {
                packet_id: 2,
                topics: vec![SubscribeTopic {
                    filter: "bad/#/filter".into(),
                    qos: QoS::AtMostOnce,
                }],
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(ProcessorError::ProtocolViolation(_))
    ));
}
