//! TCP transport
//!
//! One `Connection` per socket. The task waits for the CONNECT, hands
//! every decoded packet to the processor, drains the outbound queue onto
//! the socket, and enforces the keep-alive idle timeout (1.5x the
//! client's keep-alive; 0 disables). The channel is closed on every
//! terminal path, and abnormal exits report connection-lost so wills
//! fire and non-clean sessions deactivate.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info};

use crate::codec::{Decoder, Encoder};
use crate::processor::{ConnectedSession, ProcessorError, ProtocolProcessor};
use crate::protocol::{ConnAck, DecodeError, EncodeError, Packet, ReturnCode};
use crate::registry::ChannelHandle;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Processor(ProcessorError),
    /// No CONNECT within the accept window, or keep-alive expired
    Timeout,
    /// The processor closed the channel
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Encode(e) => write!(f, "encode error: {}", e),
            ConnectionError::Processor(e) => write!(f, "processor error: {}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Encode(e)
    }
}

impl From<ProcessorError> for ConnectionError {
    fn from(e: ProcessorError) -> Self {
        ConnectionError::Processor(e)
    }
}

enum PacketOutcome {
    Continue,
    /// Graceful DISCONNECT: exit without a connection-lost event
    Disconnected,
}

/// Transport settings the broker passes down per connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_packet_size: usize,
    pub outbound_queue: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            outbound_queue: 1024,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Handler for a single client socket
pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    processor: Arc<ProtocolProcessor>,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    channel: ChannelHandle,
    outbound: mpsc::Receiver<Packet>,
    connect_timeout: Duration,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        processor: Arc<ProtocolProcessor>,
        config: &TransportConfig,
    ) -> Self {
        let (channel, outbound) = ChannelHandle::new(config.outbound_queue);
        Self {
            stream,
            addr,
            processor,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            channel,
            outbound,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Drive the connection until it terminates
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connected = match timeout(self.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(addr = %self.addr, "no CONNECT within accept window");
                return Err(ConnectionError::Timeout);
            }
        };

        let result = self.run_connected(&connected).await;
        self.channel.close();
        result
    }

    /// Wait for the first packet, which must be a CONNECT
    async fn read_connect(&mut self) -> Result<ConnectedSession, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((Packet::Connect(connect), consumed))) => {
                    self.read_buf.advance(consumed);
                    let result = self.processor.process_connect(&self.channel, *connect).await;
                    // The CONNACK (acceptance or refusal) sits in the
                    // outbound queue either way
                    self.flush_outbound().await?;
                    return result.map_err(ConnectionError::from);
                }
                Ok(Some(_)) => {
                    debug!(addr = %self.addr, "first packet was not CONNECT");
                    return Err(ConnectionError::Processor(
                        ProcessorError::ProtocolViolation("first packet must be CONNECT"),
                    ));
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(v)) => {
                    // Reply before closing so the client learns why
                    self.write_packet(&Packet::ConnAck(ConnAck::refused(
                        ReturnCode::UnacceptableProtocolVersion,
                    )))
                    .await?;
                    return Err(DecodeError::InvalidProtocolVersion(v).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    async fn run_connected(
        &mut self,
        connected: &ConnectedSession,
    ) -> Result<(), ConnectionError> {
        let client_id = connected.client_id.clone();
        let keep_alive = if connected.keep_alive > 0 {
            Some(Duration::from_millis(u64::from(connected.keep_alive) * 1500))
        } else {
            None
        };
        debug!(client_id = %client_id, keep_alive = ?keep_alive, "connection established");

        // With keep-alive disabled, park the deadline far in the future
        let idle = keep_alive.unwrap_or(Duration::from_secs(86_400 * 365));
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!(client_id = %client_id, "socket closed by peer");
                            self.processor.process_connection_lost(&client_id, &self.channel).await;
                            return Ok(());
                        }
                        Ok(_) => {
                            deadline = Instant::now() + idle;
                            match self.drain_packets(&client_id).await {
                                Ok(PacketOutcome::Continue) => {}
                                Ok(PacketOutcome::Disconnected) => return Ok(()),
                                Err(e) => {
                                    debug!(client_id = %client_id, "terminating connection: {}", e);
                                    self.processor
                                        .process_connection_lost(&client_id, &self.channel)
                                        .await;
                                    return Err(e);
                                }
                            }
                        }
                        Err(e) => {
                            self.processor.process_connection_lost(&client_id, &self.channel).await;
                            return Err(e.into());
                        }
                    }
                }

                maybe = self.outbound.recv() => {
                    match maybe {
                        Some(packet) => {
                            self.write_packet(&packet).await?;
                            // Batch whatever else is already queued
                            self.flush_outbound().await?;
                        }
                        None => return Err(ConnectionError::Closed),
                    }
                }

                _ = self.channel.closed() => {
                    // Evicted by a newer CONNECT or force-closed
                    debug!(client_id = %client_id, "channel closed by processor");
                    self.flush_outbound().await?;
                    self.processor.process_connection_lost(&client_id, &self.channel).await;
                    return Err(ConnectionError::Closed);
                }

                _ = sleep_until(deadline) => {
                    info!(client_id = %client_id, "keep-alive expired, dropping connection");
                    self.processor.process_connection_lost(&client_id, &self.channel).await;
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Decode and dispatch every complete packet in the read buffer
    async fn drain_packets(
        &mut self,
        client_id: &Arc<str>,
    ) -> Result<PacketOutcome, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            match self.handle_packet(client_id, packet).await? {
                PacketOutcome::Continue => {}
                PacketOutcome::Disconnected => return Ok(PacketOutcome::Disconnected),
            }
            self.flush_outbound().await?;
        }
        Ok(PacketOutcome::Continue)
    }

    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        packet: Packet,
    ) -> Result<PacketOutcome, ConnectionError> {
        let processor = self.processor.clone();
        match packet {
            Packet::Connect(_) => {
                return Err(ConnectionError::Processor(
                    ProcessorError::ProtocolViolation("duplicate CONNECT"),
                ));
            }
            Packet::Publish(publish) => {
                processor
                    .process_publish(&self.channel, client_id, publish)
                    .await?
            }
            Packet::PubAck(puback) => processor.process_puback(client_id, puback).await?,
            Packet::PubRec(pubrec) => {
                processor
                    .process_pubrec(&self.channel, client_id, pubrec)
                    .await?
            }
            Packet::PubRel(pubrel) => {
                processor
                    .process_pubrel(&self.channel, client_id, pubrel)
                    .await?
            }
            Packet::PubComp(pubcomp) => processor.process_pubcomp(client_id, pubcomp).await?,
            Packet::Subscribe(subscribe) => {
                processor
                    .process_subscribe(&self.channel, client_id, subscribe)
                    .await?
            }
            Packet::Unsubscribe(unsubscribe) => {
                processor
                    .process_unsubscribe(&self.channel, client_id, unsubscribe)
                    .await?
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?;
            }
            Packet::Disconnect => {
                processor.process_disconnect(&self.channel, client_id).await?;
                return Ok(PacketOutcome::Disconnected);
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ConnectionError::Processor(
                    ProcessorError::ProtocolViolation("server-only packet from client"),
                ));
            }
        }
        Ok(PacketOutcome::Continue)
    }

    /// Write everything currently sitting in the outbound queue
    async fn flush_outbound(&mut self) -> Result<(), ConnectionError> {
        while let Ok(packet) = self.outbound.try_recv() {
            self.write_packet(&packet).await?;
        }
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
