//! Packet encoding

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{Connect, EncodeError, Packet, Publish, QoS};

/// MQTT packet encoder
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet into `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(connect) => encode_connect(connect, buf),
            Packet::ConnAck(connack) => {
                buf.put_u8(0x20);
                buf.put_u8(2);
                buf.put_u8(connack.session_present as u8);
                buf.put_u8(connack.return_code as u8);
                Ok(())
            }
            Packet::Publish(publish) => encode_publish(publish, buf),
            Packet::PubAck(p) => encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => encode_ack(0x50, p.packet_id, buf),
            // PUBREL carries the QoS 1 flag bits [MQTT-3.6.1-1]
            Packet::PubRel(p) => encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(subscribe) => {
                let mut body = BytesMut::new();
                body.put_u16(subscribe.packet_id);
                for topic in &subscribe.topics {
                    write_string(&mut body, &topic.filter)?;
                    body.put_u8(topic.qos as u8);
                }
                finish(0x82, &body, buf)
            }
            Packet::SubAck(suback) => {
                let mut body = BytesMut::new();
                body.put_u16(suback.packet_id);
                for code in &suback.codes {
                    body.put_u8(code.to_byte());
                }
                finish(0x90, &body, buf)
            }
            Packet::Unsubscribe(unsubscribe) => {
                let mut body = BytesMut::new();
                body.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    write_string(&mut body, filter)?;
                }
                finish(0xA2, &body, buf)
            }
            Packet::UnsubAck(unsuback) => encode_ack(0xB0, unsuback.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0);
                Ok(())
            }
        }
    }
}

fn finish(first_byte: u8, body: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    write_variable_int(buf, body.len() as u32)?;
    buf.put_slice(body);
    Ok(())
}

fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(2);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_connect(connect: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut body = BytesMut::new();
    write_string(&mut body, connect.protocol_version.protocol_name())?;
    body.put_u8(connect.protocol_version as u8);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(&mut body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        write_string(&mut body, &will.topic)?;
        write_binary(&mut body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = &connect.password {
        write_binary(&mut body, password)?;
    }

    finish(0x10, &body, buf)
}

fn encode_publish(publish: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut first = 0x30u8;
    if publish.dup {
        first |= 0x08;
    }
    first |= (publish.qos as u8) << 1;
    if publish.retain {
        first |= 0x01;
    }

    let mut body = BytesMut::new();
    write_string(&mut body, &publish.topic)?;
    if publish.qos != QoS::AtMostOnce {
        let packet_id = publish.packet_id.ok_or(EncodeError::MissingPacketId)?;
        body.put_u16(packet_id);
    }
    body.put_slice(&publish.payload);

    finish(first, &body, buf)
}
