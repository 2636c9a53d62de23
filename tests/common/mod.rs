// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
#![allow(dead_code)]

use bytes::Bytes;
use bytestring::ByteString;
use futures::{SinkExt, StreamExt};
use mqtt_broker_lite::auth_impl::{AllowAll, Auth};
use mqtt_broker_lite::broker::{Broker, BrokerConfig};
use mqtt_broker_lite::connection::handle_connection;
use mqtt_broker_lite::session::PacketId;
use rmqtt_codec::types::{Protocol, Publish};
use rmqtt_codec::v3::{Codec, Connect, ConnectAck, ConnectAckReason, Packet, QoS, SubscribeReturnCode};
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);
pub const SILENCE: Duration = Duration::from_millis(200);

/// Broker served on an ephemeral localhost port for the lifetime of the value.
pub struct BrokerServer {
    pub broker: Broker,
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl BrokerServer {
    pub async fn start() -> Self {
        Self::start_with(Arc::new(AllowAll), BrokerConfig::default()).await
    }

    pub async fn start_with(auth: Arc<dyn Auth>, config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local address");
        let broker = Broker::new(config);

        let broker_for_task = broker.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(
                    broker_for_task.clone(),
                    auth.clone(),
                    stream,
                    peer,
                ));
            }
        });

        BrokerServer {
            broker,
            addr,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn client(&self) -> Client {
        let stream = TcpStream::connect(self.addr)
            .await
            .expect("Failed to connect to broker");
        Client {
            framed: Framed::new(stream, Codec::default()),
        }
    }

    /// Opens a connection and completes an accepted CONNECT.
    pub async fn connect(&self, client_id: &str, clean_session: bool) -> (Client, ConnectAck) {
        let mut client = self.client().await;
        let ack = client
            .connect_with(Connect {
                client_id: ByteString::from(client_id),
                clean_session,
                keep_alive: 60,
                ..Connect::default()
            })
            .await;
        assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted);
        (client, ack)
    }

    /// Waits until `client_id` is registered with the broker.
    pub async fn wait_registered(&self, client_id: &str, registered: bool) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.broker.is_registered(client_id).await != registered {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for registration change");
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

pub fn connect_packet(client_id: &str, clean_session: bool) -> Connect {
    Connect {
        protocol: Protocol::default(),
        client_id: ByteString::from(client_id),
        clean_session,
        keep_alive: 60,
        ..Connect::default()
    }
}

pub fn pid(v: u16) -> PacketId {
    NonZeroU16::new(v).expect("packet id must not be zero")
}

pub fn publish(topic: &str, payload: &'static str, qos: QoS, packet_id: Option<u16>) -> Publish {
    Publish {
        dup: false,
        retain: false,
        qos,
        topic: ByteString::from(topic),
        packet_id: packet_id.map(pid),
        payload: Bytes::from_static(payload.as_bytes()),
        properties: None,
        delay_interval: None,
        create_time: None,
    }
}

/// Test MQTT client speaking raw packets.
pub struct Client {
    framed: Framed<TcpStream, Codec>,
}

impl Client {
    pub async fn send(&mut self, packet: impl Into<Packet>) {
        self.framed
            .send(packet.into())
            .await
            .expect("Failed to send packet");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .get_mut()
            .write_all(bytes)
            .await
            .expect("Failed to write raw bytes");
    }

    /// Next packet, panicking on timeout or close.
    pub async fn recv(&mut self) -> Packet {
        match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok((packet, _)))) => packet,
            Ok(Some(Err(e))) => panic!("Failed to decode packet: {e}"),
            Ok(None) => panic!("Connection closed while waiting for a packet"),
            Err(_) => panic!("Timed out waiting for a packet"),
        }
    }

    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => *publish,
            other => panic!("Expected PUBLISH, got {other:?}"),
        }
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Ok(Some(packet)) = tokio::time::timeout(SILENCE, self.framed.next()).await {
            panic!("Expected no packet, got {packet:?}");
        }
    }

    /// Asserts the broker closes the connection, ignoring packets sent before.
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.framed.next().await {
                    None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "Expected the broker to close the connection");
    }

    pub async fn connect_with(&mut self, connect: Connect) -> ConnectAck {
        self.send(connect).await;
        match self.recv().await {
            Packet::ConnectAck(ack) => ack,
            other => panic!("Expected CONNACK, got {other:?}"),
        }
    }

    pub async fn subscribe(
        &mut self,
        packet_id: u16,
        filters: &[(&str, QoS)],
    ) -> Vec<SubscribeReturnCode> {
        self.send(Packet::Subscribe {
            packet_id: pid(packet_id),
            topic_filters: filters
                .iter()
                .map(|(filter, qos)| (ByteString::from(*filter), *qos))
                .collect(),
        })
        .await;
        match self.recv().await {
            Packet::SubscribeAck {
                packet_id: ack_id,
                status,
            } => {
                assert_eq!(ack_id, pid(packet_id));
                status
            }
            other => panic!("Expected SUBACK, got {other:?}"),
        }
    }

    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
        let _ = self.framed.get_mut().shutdown().await;
    }

    /// Drops the TCP connection without DISCONNECT.
    pub async fn abort(mut self) {
        let _ = self.framed.get_mut().shutdown().await;
    }
}
