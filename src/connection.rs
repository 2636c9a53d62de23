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
//! Drives one client connection: a read loop decoding packets and a writer
//! task that is the only place writing to the transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rmqtt_codec::v3::{Codec, ConnectAckReason, Packet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info, trace};

use crate::auth_impl::Auth;
use crate::broker::{Broker, BrokerConfig};
use crate::session::{Session, SessionChannels, SessionError};

/// Serves one accepted transport until it closes.
///
/// On any close other than DISCONNECT the session's will is delivered. The
/// session is always deregistered before this returns.
pub async fn handle_connection<T>(broker: Broker, auth: Arc<dyn Auth>, transport: T, peer: SocketAddr)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let config = broker.config().clone();
    let mut frames = FramedRead::new(read_half, Codec::new(config.max_packet_size));
    let sink = FramedWrite::new(write_half, Codec::default());

    let (session, channels) = Session::new(broker.clone(), auth);
    let mut shutdown = channels.shutdown.clone();
    let writer = tokio::spawn(writer_task(session.clone(), sink, channels));

    trace!("connection from {peer} accepted, waiting for CONNECT");
    let result = read_loop(&session, &mut frames, &mut shutdown, &config).await;

    match &result {
        Ok(()) => info!("client '{}' ({peer}) disconnected", session.client_id()),
        Err(SessionError::TakenOver) => {
            info!("client '{}' ({peer}) taken over", session.client_id())
        }
        Err(SessionError::Io(e)) => {
            info!("connection of '{}' ({peer}) lost: {e}", session.client_id())
        }
        Err(e) => error!("closing connection of '{}' ({peer}): {e}", session.client_id()),
    }

    if result.is_err() {
        if let Some(will) = session.take_will().await {
            trace!("delivering will of '{}' on '{}'", session.client_id(), will.topic);
            broker.deliver(will).await;
        }
    }
    session.mark_disconnected().await;
    broker.remove_client(&session).await;
    session.close();

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("writer of {peer} stopped: {e}"),
        Err(e) => error!("writer of {peer} failed: {e}"),
    }
}

async fn read_loop<R>(
    session: &Arc<Session>,
    frames: &mut FramedRead<R, Codec>,
    shutdown: &mut watch::Receiver<bool>,
    config: &BrokerConfig,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut handlers: JoinSet<Result<(), SessionError>> = JoinSet::new();
    let handler_limit = config.handler_concurrency.max(1);
    // completion of the last handler spawned in each lane
    let mut tails: [Option<oneshot::Receiver<()>>; Lane::COUNT] = Default::default();
    let mut deadline = Some(Instant::now() + config.connect_timeout);
    let mut keep_alive: Option<Duration> = None;
    let mut connected = false;

    loop {
        let timeout_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
        tokio::select! {
            biased;
            _ = wait_closed(shutdown) => return Err(SessionError::TakenOver),
            Some(joined) = handlers.join_next() => joined??,
            _ = sleep_until(timeout_at), if deadline.is_some() => {
                return Err(if connected {
                    SessionError::KeepAliveTimeout
                } else {
                    SessionError::ConnectTimeout
                });
            }
            frame = frames.next() => {
                let packet = match frame {
                    Some(Ok((packet, _))) => packet,
                    Some(Err(e)) if !connected => return Err(session.connect_decode_failed(e)),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                };
                if let Some(interval) = keep_alive {
                    deadline = Some(Instant::now() + interval);
                }

                match packet {
                    Packet::Connect(_) => {
                        if connected {
                            return Err(SessionError::Protocol("second CONNECT".to_string()));
                        }
                        session.handle_packet(packet).await?;
                        connected = true;
                        // MQTT 3.1.1 allows one and a half keepalive periods
                        keep_alive = match session.keep_alive() {
                            0 => None,
                            secs => Some(Duration::from_millis(u64::from(secs) * 1500)),
                        };
                        deadline = keep_alive.map(|interval| Instant::now() + interval);
                    }
                    Packet::PingRequest => session.handle_packet(packet).await?,
                    Packet::Disconnect => {
                        session.handle_packet(packet).await?;
                        while let Some(joined) = handlers.join_next().await {
                            joined??;
                        }
                        return Ok(());
                    }
                    packet => {
                        if !connected {
                            return Err(SessionError::Protocol(format!(
                                "expected CONNECT, received {packet:?}"
                            )));
                        }
                        while handlers.len() >= handler_limit {
                            if let Some(joined) = handlers.join_next().await {
                                joined??;
                            }
                        }
                        let tail = &mut tails[Lane::of(&packet) as usize];
                        let previous = tail.take();
                        let (done_tx, done_rx) = oneshot::channel();
                        *tail = Some(done_rx);
                        let session = session.clone();
                        handlers.spawn(async move {
                            if let Some(previous) = previous {
                                // an error from the predecessor ends the read loop
                                let _ = previous.await;
                            }
                            let result = session.handle_packet(packet).await;
                            let _ = done_tx.send(());
                            result
                        });
                    }
                }
            }
        }
    }
}

/// Handlers in one lane run in arrival order, one at a time. Lanes run
/// concurrently with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// PUBLISH, PUBREL, SUBSCRIBE and UNSUBSCRIBE
    Inbound,
    /// PUBACK, PUBREC and PUBCOMP for messages sent to the client
    Outbound,
}

impl Lane {
    const COUNT: usize = 2;

    fn of(packet: &Packet) -> Self {
        match packet {
            Packet::PublishAck { .. }
            | Packet::PublishReceived { .. }
            | Packet::PublishComplete { .. } => Lane::Outbound,
            _ => Lane::Inbound,
        }
    }
}

/// Completes once the session is closed.
async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    // an error means the sender is gone, which closes the session as well
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn writer_task<W>(
    session: Arc<Session>,
    mut sink: FramedWrite<W, Codec>,
    channels: SessionChannels,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let SessionChannels {
        mut control,
        mut shutdown,
    } = channels;
    // routed messages wait until the CONNACK is out
    let mut accepted = false;

    loop {
        tokio::select! {
            biased;
            packet = control.recv() => {
                let Some(packet) = packet else { break };
                if let Packet::ConnectAck(ack) = &packet {
                    accepted = ack.return_code == ConnectAckReason::ConnectionAccepted;
                }
                sink.send(packet).await?;
            }
            _ = wait_closed(&mut shutdown) => break,
            (queue, msg) = session.next_delivery(), if accepted => {
                let Some(msg) = msg else { break };
                // may wait for a free packet id
                let Some(packet) = session.prepare_publish(msg).await else { break };
                // in flight now, a takeover can move the rest of the queue
                drop(queue);
                sink.send(packet).await?;
            }
        }
    }

    // acknowledgments queued before the close, e.g. a rejecting CONNACK
    while let Ok(packet) = control.try_recv() {
        sink.send(packet).await?;
    }
    sink.flush().await?;
    sink.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU16;

    #[test]
    fn test_lanes() {
        let id = NonZeroU16::new(1).unwrap();
        assert_eq!(Lane::of(&Packet::PublishRelease { packet_id: id }), Lane::Inbound);
        assert_eq!(
            Lane::of(&Packet::Unsubscribe {
                packet_id: id,
                topic_filters: Vec::new(),
            }),
            Lane::Inbound
        );
        assert_eq!(Lane::of(&Packet::PublishAck { packet_id: id }), Lane::Outbound);
        assert_eq!(Lane::of(&Packet::PublishReceived { packet_id: id }), Lane::Outbound);
        assert_eq!(Lane::of(&Packet::PublishComplete { packet_id: id }), Lane::Outbound);
    }
}
