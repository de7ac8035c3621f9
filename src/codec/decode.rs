//! Packet decoding
//!
//! Streaming decoder: `decode` inspects the buffer and returns a parsed
//! packet plus the number of bytes it consumed, or `None` when the
//! buffer does not yet hold a complete packet.

use std::sync::Arc;

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    Connect, DecodeError, Packet, PacketType, ProtocolVersion, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, Subscribe, SubscribeTopic, Unsubscribe, Will,
};

/// MQTT packet decoder
#[derive(Debug)]
pub struct Decoder {
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    /// Try to decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed, `Ok(Some((packet,
    /// consumed)))` on success.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let first = buf[0];
        let packet_type = PacketType::from_u8(first >> 4)
            .ok_or(DecodeError::InvalidPacketType(first >> 4))?;
        let flags = first & 0x0F;

        let (remaining_len, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(v) => v,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let remaining_len = remaining_len as usize;
        let total = 1 + len_bytes + remaining_len;

        if total > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total];
        let packet = match packet_type {
            PacketType::Connect => decode_connect(flags, body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => {
                expect_flags(flags, 0)?;
                Packet::PubAck(PubAck {
                    packet_id: read_u16(body)?,
                })
            }
            PacketType::PubRec => {
                expect_flags(flags, 0)?;
                Packet::PubRec(PubRec {
                    packet_id: read_u16(body)?,
                })
            }
            PacketType::PubRel => {
                expect_flags(flags, 0x02)?;
                Packet::PubRel(PubRel {
                    packet_id: read_u16(body)?,
                })
            }
            PacketType::PubComp => {
                expect_flags(flags, 0)?;
                Packet::PubComp(PubComp {
                    packet_id: read_u16(body)?,
                })
            }
            PacketType::Subscribe => {
                expect_flags(flags, 0x02)?;
                decode_subscribe(body)?
            }
            PacketType::Unsubscribe => {
                expect_flags(flags, 0x02)?;
                decode_unsubscribe(body)?
            }
            PacketType::PingReq => {
                expect_flags(flags, 0)?;
                Packet::PingReq
            }
            PacketType::Disconnect => {
                expect_flags(flags, 0)?;
                Packet::Disconnect
            }
            // Server-to-client packets; a server never receives these but
            // the decoder is shared with the test client.
            PacketType::ConnAck => decode_connack(body)?,
            PacketType::SubAck => decode_suback(body)?,
            PacketType::UnsubAck => Packet::UnsubAck(crate::protocol::UnsubAck {
                packet_id: read_u16(body)?,
            }),
            PacketType::PingResp => Packet::PingResp,
        };

        Ok(Some((packet, total)))
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;

    let mut pos = 0;
    let (name, n) = read_string(body)?;
    pos += n;
    if pos >= body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let level = body[pos];
    pos += 1;

    let protocol_version =
        ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
    if name != protocol_version.protocol_name() {
        return Err(DecodeError::InvalidProtocolName);
    }

    if pos + 3 > body.len() {
        return Err(DecodeError::InsufficientData);
    }
    let connect_flags = body[pos];
    pos += 1;
    if connect_flags & 0x01 != 0 {
        // Reserved bit must be zero [MQTT-3.1.2-3]
        return Err(DecodeError::MalformedPacket("reserved connect flag set"));
    }
    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let clean_session = connect_flags & 0x02 != 0;
    let will_flag = connect_flags & 0x04 != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = connect_flags & 0x20 != 0;
    let password_flag = connect_flags & 0x40 != 0;
    let user_flag = connect_flags & 0x80 != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(DecodeError::MalformedPacket("will flags without will"));
    }

    let (client_id, n) = read_string(&body[pos..])?;
    let client_id = client_id.to_string();
    pos += n;

    let will = if will_flag {
        let qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
        let (topic, n) = read_string(&body[pos..])?;
        let topic = topic.to_string();
        pos += n;
        let (payload, n) = read_binary(&body[pos..])?;
        let payload = Bytes::copy_from_slice(payload);
        pos += n;
        Some(Will {
            topic,
            payload,
            qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if user_flag {
        let (u, n) = read_string(&body[pos..])?;
        pos += n;
        Some(u.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (p, n) = read_binary(&body[pos..])?;
        pos += n;
        Some(Bytes::copy_from_slice(p))
    } else {
        None
    };

    let _ = pos;

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    let mut pos = 0;
    let (topic, n) = read_string(body)?;
    let topic: Arc<str> = Arc::from(topic);
    pos += n;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        pos += 2;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("zero packet id"));
        }
        Some(id)
    } else {
        None
    };

    let payload = Bytes::copy_from_slice(&body[pos..]);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut topics = Vec::new();

    while pos < body.len() {
        let (filter, n) = read_string(&body[pos..])?;
        let filter = filter.to_string();
        pos += n;
        if pos >= body.len() {
            return Err(DecodeError::InsufficientData);
        }
        let qos_byte = body[pos];
        pos += 1;
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        topics.push(SubscribeTopic { filter, qos });
    }

    if topics.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without topics"));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, n) = read_string(&body[pos..])?;
        filters.push(filter.to_string());
        pos += n;
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without topics"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

fn decode_connack(body: &[u8]) -> Result<Packet, DecodeError> {
    if body.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    let session_present = body[0] & 0x01 != 0;
    let return_code = crate::protocol::ReturnCode::from_u8(body[1])
        .ok_or(DecodeError::InvalidReturnCode(body[1]))?;
    Ok(Packet::ConnAck(crate::protocol::ConnAck {
        session_present,
        return_code,
    }))
}

fn decode_suback(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let codes = body[2..]
        .iter()
        .map(|&b| {
            crate::protocol::SubAckCode::from_byte(b)
                .ok_or(DecodeError::MalformedPacket("invalid SUBACK code"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Packet::SubAck(crate::protocol::SubAck { packet_id, codes }))
}
