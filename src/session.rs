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
//! Per-connection MQTT session.
//!
//! A [`Session`] owns everything the broker knows about one client: its
//! identity and rights, the subscription table, the QoS 1/2 in-flight maps and
//! the sending ends of the channels drained by the connection's writer task.
//! Packet handlers never write to the socket themselves; they queue packets on
//! the control channel, so all writes go through one writer.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::num::NonZeroU16;
use std::sync::{Arc, OnceLock};

use rmqtt_codec::error::{DecodeError, EncodeError};
use rmqtt_codec::types::{Publish, MQTT_LEVEL_311};
use rmqtt_codec::v3::{Connect, ConnectAck, ConnectAckReason, Packet, QoS, SubscribeReturnCode};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::auth_impl::{is_authorized, Auth};
use crate::broker::Broker;
use crate::message::Message;
use crate::topic::{self, TopicMatches};

pub type PacketId = NonZeroU16;

/// Reason a connection is closed. Only fatal conditions end up here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("client identifier rejected")]
    IdentifierRejected,
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    #[error("invalid will topic '{0}'")]
    InvalidWillTopic(String),
    #[error("publish to '{0}' not authorized")]
    PublishNotAuthorized(String),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("keepalive timeout")]
    KeepAliveTimeout,
    #[error("no CONNECT received in time")]
    ConnectTimeout,
    #[error("session taken over by a new connection")]
    TakenOver,
    #[error("packet handler failed: {0}")]
    Handler(#[from] tokio::task::JoinError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Connected,
    Disconnected,
}

/// Fixed once CONNECT is accepted.
#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub username: String,
    /// authorization pattern, a topic filter
    pub rights: String,
    pub clean_session: bool,
    pub keep_alive: u16,
}

#[derive(Debug, Clone)]
struct OutboundEntry {
    message: Message,
    /// PUBREC received, waiting for PUBCOMP
    released: bool,
    seq: u64,
}

#[derive(Debug)]
struct SessionState {
    phase: Phase,
    will: Option<Message>,
    subscriptions: HashMap<String, QoS>,
    /// QoS 2 messages received, waiting for PUBREL
    inbound: HashMap<PacketId, Message>,
    /// QoS 1/2 messages sent, waiting for acknowledgment
    outbound: BTreeMap<PacketId, OutboundEntry>,
    next_packet_id: u16,
    next_seq: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Connecting,
            will: None,
            subscriptions: HashMap::new(),
            inbound: HashMap::new(),
            outbound: BTreeMap::new(),
            next_packet_id: 0,
            next_seq: 0,
        }
    }

    /// Next identifier after the last one issued that is not outstanding.
    fn allocate_packet_id(&mut self) -> Option<PacketId> {
        if self.outbound.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if let Some(id) = NonZeroU16::new(self.next_packet_id) {
                if !self.outbound.contains_key(&id) {
                    return Some(id);
                }
            }
        }
    }
}

/// Receiving ends handed to the connection's writer task.
#[derive(Debug)]
pub struct SessionChannels {
    /// acknowledgments and other packets produced by handlers
    pub control: mpsc::UnboundedReceiver<Packet>,
    /// becomes true when the session must be torn down
    pub shutdown: watch::Receiver<bool>,
}

pub struct Session {
    broker: Broker,
    auth: Arc<dyn Auth>,
    identity: OnceLock<Identity>,
    state: Mutex<SessionState>,
    packet_id_freed: Notify,
    control: mpsc::UnboundedSender<Packet>,
    deliveries: mpsc::Sender<Message>,
    /// Messages routed to this session, not yet assigned a packet id. Kept
    /// here rather than in the writer so a takeover can move what is queued.
    pending: Mutex<mpsc::Receiver<Message>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity.get())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(broker: Broker, auth: Arc<dyn Auth>) -> (Arc<Self>, SessionChannels) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) =
            mpsc::channel(broker.config().delivery_queue_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Self {
            broker,
            auth,
            identity: OnceLock::new(),
            state: Mutex::new(SessionState::new()),
            packet_id_freed: Notify::new(),
            control: control_tx,
            deliveries: deliveries_tx,
            pending: Mutex::new(deliveries_rx),
            shutdown: shutdown_tx,
        });
        let channels = SessionChannels {
            control: control_rx,
            shutdown: shutdown_rx,
        };
        (session, channels)
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Empty until CONNECT is accepted.
    pub fn client_id(&self) -> &str {
        self.identity
            .get()
            .map(|identity| identity.client_id.as_str())
            .unwrap_or_default()
    }

    pub fn keep_alive(&self) -> u16 {
        self.identity
            .get()
            .map(|identity| identity.keep_alive)
            .unwrap_or_default()
    }

    pub fn clean_session(&self) -> bool {
        self.identity
            .get()
            .map(|identity| identity.clean_session)
            .unwrap_or(true)
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Subscription table, sorted by filter.
    pub async fn subscriptions(&self) -> Vec<(String, QoS)> {
        let state = self.state.lock().await;
        let mut subscriptions: Vec<_> = state
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        subscriptions.sort();
        subscriptions
    }

    /// Number of (inbound, outbound) in-flight messages.
    pub async fn inflight(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.inbound.len(), state.outbound.len())
    }

    /// Signals the connection tasks to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Removes the will, if any, so it is delivered at most once.
    pub async fn take_will(&self) -> Option<Message> {
        self.state.lock().await.will.take()
    }

    fn send(&self, packet: Packet) {
        if self.control.send(packet).is_err() {
            trace!("writer for '{}' is gone, packet dropped", self.client_id());
        }
    }

    /// Queues a message for the writer task. A full queue drops the message.
    pub(crate) fn enqueue(&self, msg: Message) {
        match self.deliveries.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    "delivery queue of '{}' is full, dropping message on '{}'",
                    self.client_id(),
                    msg.topic
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("delivery queue of '{}' is closed", self.client_id());
            }
        }
    }

    /// Enqueues a copy of `msg` for every subscription the topic satisfies,
    /// with the subscription's QoS and retain cleared.
    pub(crate) async fn route(&self, msg: &Message, matches: &TopicMatches<'_>) {
        let state = self.state.lock().await;
        for (filter, qos) in &state.subscriptions {
            if matches.contains(filter) {
                self.enqueue(msg.repackage(*qos, false));
            }
        }
    }

    /// Moves subscriptions, in-flight state and queued deliveries of a
    /// displaced session here. `previous` must already be closed.
    pub(crate) async fn inherit_from(&self, previous: &Session) {
        // a writer still holding the queue finishes recording its message
        // in flight first, so it is inherited below
        let mut queued = previous.pending.lock().await;
        let (subscriptions, inbound, outbound, next_packet_id, next_seq) = {
            let mut old = previous.state.lock().await;
            (
                std::mem::take(&mut old.subscriptions),
                std::mem::take(&mut old.inbound),
                std::mem::take(&mut old.outbound),
                old.next_packet_id,
                old.next_seq,
            )
        };
        debug!(
            "'{}' inherits {} subscriptions, {} inbound and {} outbound in-flight messages",
            self.client_id(),
            subscriptions.len(),
            inbound.len(),
            outbound.len()
        );
        {
            let mut state = self.state.lock().await;
            state.subscriptions = subscriptions;
            state.inbound = inbound;
            state.outbound = outbound;
            state.next_packet_id = next_packet_id;
            state.next_seq = next_seq;
        }

        queued.close();
        let mut moved = 0;
        while let Ok(msg) = queued.try_recv() {
            self.enqueue(msg);
            moved += 1;
        }
        if moved > 0 {
            debug!("moved {moved} queued deliveries to '{}'", self.client_id());
        }
    }

    /// Waits for the next routed message. The queue stays locked while the
    /// guard is held; the writer keeps it until the message is in flight.
    pub(crate) async fn next_delivery(
        &self,
    ) -> (MutexGuard<'_, mpsc::Receiver<Message>>, Option<Message>) {
        let mut queue = self.pending.lock().await;
        let msg = queue.recv().await;
        (queue, msg)
    }

    /// Dispatches one decoded packet from the client.
    pub async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<(), SessionError> {
        if let Packet::Connect(connect) = packet {
            return self.handle_connect(*connect).await;
        }
        if self.phase().await != Phase::Connected {
            return Err(SessionError::Protocol(format!(
                "{packet:?} received outside of a connected session"
            )));
        }
        match packet {
            Packet::Publish(publish) => self.handle_publish(*publish).await,
            Packet::PublishAck { packet_id } => {
                self.handle_puback(packet_id).await;
                Ok(())
            }
            Packet::PublishReceived { packet_id } => {
                self.handle_pubrec(packet_id).await;
                Ok(())
            }
            Packet::PublishRelease { packet_id } => {
                self.handle_pubrel(packet_id).await;
                Ok(())
            }
            Packet::PublishComplete { packet_id } => {
                self.handle_pubcomp(packet_id).await;
                Ok(())
            }
            Packet::Subscribe {
                packet_id,
                topic_filters,
            } => {
                if topic_filters.is_empty() {
                    return Err(SessionError::Protocol("SUBSCRIBE without filters".to_string()));
                }
                let topic_filters = topic_filters
                    .into_iter()
                    .map(|(filter, qos)| (filter.to_string(), qos))
                    .collect();
                self.handle_subscribe(packet_id, topic_filters).await;
                Ok(())
            }
            Packet::Unsubscribe {
                packet_id,
                topic_filters,
            } => {
                if topic_filters.is_empty() {
                    return Err(SessionError::Protocol(
                        "UNSUBSCRIBE without filters".to_string(),
                    ));
                }
                let topic_filters = topic_filters.iter().map(|f| f.to_string()).collect();
                self.handle_unsubscribe(packet_id, topic_filters).await;
                Ok(())
            }
            Packet::PingRequest => {
                self.send(Packet::PingResponse);
                Ok(())
            }
            Packet::Disconnect => {
                self.handle_disconnect().await;
                Ok(())
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected packet from client: {other:?}"
            ))),
        }
    }

    fn reject(&self, return_code: ConnectAckReason, err: SessionError) -> SessionError {
        error!("CONNECT rejected: {}", return_code.reason());
        self.send(Packet::ConnectAck(ConnectAck {
            session_present: false,
            return_code,
        }));
        err
    }

    /// Maps a frame that failed to decode before CONNECT was accepted. The
    /// failures MQTT answers with a CONNACK get one; the rest close silently.
    pub fn connect_decode_failed(&self, err: DecodeError) -> SessionError {
        match err {
            DecodeError::InvalidProtocol | DecodeError::UnsupportedProtocolLevel => self.reject(
                ConnectAckReason::UnacceptableProtocolVersion,
                SessionError::UnsupportedProtocol,
            ),
            DecodeError::InvalidClientId => self.reject(
                ConnectAckReason::IdentifierRejected,
                SessionError::IdentifierRejected,
            ),
            other => other.into(),
        }
    }

    pub async fn handle_connect(self: &Arc<Self>, connect: Connect) -> Result<(), SessionError> {
        if self.phase().await != Phase::Connecting {
            return Err(SessionError::Protocol("second CONNECT".to_string()));
        }
        if connect.protocol.level() != MQTT_LEVEL_311 {
            return Err(self.reject(
                ConnectAckReason::UnacceptableProtocolVersion,
                SessionError::UnsupportedProtocol,
            ));
        }
        if let Some(will) = &connect.last_will {
            if !topic::is_valid_topic_name(&will.topic) {
                error!("CONNECT with invalid will topic '{}'", will.topic);
                return Err(SessionError::InvalidWillTopic(will.topic.to_string()));
            }
        }

        let username = connect
            .username
            .map(|username| username.to_string())
            .unwrap_or_default();
        let password = connect.password.unwrap_or_default();
        if !self.auth.authenticate(&username, &password) {
            error!("Authentication failed for user '{username}'");
            return Err(self.reject(
                ConnectAckReason::BadUserNameOrPassword,
                SessionError::NotAuthenticated,
            ));
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Err(self.reject(
                    ConnectAckReason::IdentifierRejected,
                    SessionError::IdentifierRejected,
                ));
            }
            format!("auto-{}", uuid::Uuid::new_v4().simple())
        } else {
            connect.client_id.to_string()
        };

        let rights = self.auth.rights(&username);
        let will = connect.last_will.map(Message::from).filter(|will| {
            let allowed = is_authorized(&rights, &will.topic);
            if !allowed {
                warn!("will of '{client_id}' on '{}' not authorized, dropped", will.topic);
            }
            allowed
        });

        let identity = Identity {
            client_id: client_id.clone(),
            username,
            rights,
            clean_session: connect.clean_session,
            keep_alive: connect.keep_alive,
        };
        if self.identity.set(identity).is_err() {
            return Err(SessionError::Protocol("second CONNECT".to_string()));
        }
        {
            let mut state = self.state.lock().await;
            state.phase = Phase::Connected;
            state.will = will;
        }

        let displaced = self.broker.add_client(self.clone()).await;
        let session_present = displaced.is_some() && !connect.clean_session;

        info!(
            "client '{client_id}' connected, clean_session={}, keep_alive={}, session_present={session_present}",
            connect.clean_session, connect.keep_alive
        );
        // the writer takes no routed message until the resent ones are queued
        let _deliveries = self.pending.lock().await;
        let resend = self.inflight_packets().await;
        self.send(Packet::ConnectAck(ConnectAck {
            session_present,
            return_code: ConnectAckReason::ConnectionAccepted,
        }));
        if !resend.is_empty() {
            debug!("resending {} in-flight packets to '{client_id}'", resend.len());
        }
        for packet in resend {
            self.send(packet);
        }
        Ok(())
    }

    /// Unacknowledged outbound messages in the order they were sent.
    async fn inflight_packets(&self) -> Vec<Packet> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state.outbound.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(packet_id, entry)| {
                if entry.released {
                    Packet::PublishRelease {
                        packet_id: *packet_id,
                    }
                } else {
                    Packet::Publish(Box::new(entry.message.to_publish(Some(*packet_id), true)))
                }
            })
            .collect()
    }

    pub async fn handle_publish(&self, publish: Publish) -> Result<(), SessionError> {
        if !topic::is_valid_topic_name(&publish.topic) {
            return Err(SessionError::Protocol(format!(
                "invalid topic name '{}'",
                publish.topic
            )));
        }
        let rights = self
            .identity
            .get()
            .map(|identity| identity.rights.as_str())
            .unwrap_or_default();
        if !is_authorized(rights, &publish.topic) {
            error!(
                "'{}' is not authorized to publish to '{}'",
                self.client_id(),
                publish.topic
            );
            return Err(SessionError::PublishNotAuthorized(publish.topic.to_string()));
        }

        trace!("PUBLISH from '{}': {publish:?}", self.client_id());
        let packet_id = publish.packet_id;
        let msg = Message::from(publish);
        match (msg.qos, packet_id) {
            (QoS::AtMostOnce, _) => self.broker.deliver(msg).await,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.broker.deliver(msg).await;
                self.send(Packet::PublishAck { packet_id });
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // a duplicate keeps the first copy, it is delivered once on PUBREL
                self.state
                    .lock()
                    .await
                    .inbound
                    .entry(packet_id)
                    .or_insert(msg);
                self.send(Packet::PublishReceived { packet_id });
            }
            (_, None) => {
                return Err(SessionError::Protocol(
                    "QoS > 0 PUBLISH without packet id".to_string(),
                ))
            }
        }
        Ok(())
    }

    pub async fn handle_pubrel(&self, packet_id: PacketId) {
        let msg = self.state.lock().await.inbound.remove(&packet_id);
        match msg {
            Some(msg) => self.broker.deliver(msg).await,
            None => warn!(
                "PUBREL for unknown packet id {packet_id} from '{}'",
                self.client_id()
            ),
        }
        self.send(Packet::PublishComplete { packet_id });
    }

    pub async fn handle_puback(&self, packet_id: PacketId) {
        let removed = {
            let mut state = self.state.lock().await;
            let acked = state
                .outbound
                .get(&packet_id)
                .is_some_and(|entry| entry.message.qos == QoS::AtLeastOnce);
            if acked {
                state.outbound.remove(&packet_id)
            } else {
                None
            }
        };
        if removed.is_some() {
            self.packet_id_freed.notify_one();
        } else {
            trace!("PUBACK for unknown packet id {packet_id}");
        }
    }

    pub async fn handle_pubrec(&self, packet_id: PacketId) {
        {
            let mut state = self.state.lock().await;
            match state.outbound.get_mut(&packet_id) {
                Some(entry) if entry.message.qos == QoS::ExactlyOnce => entry.released = true,
                _ => warn!(
                    "PUBREC for unknown packet id {packet_id} from '{}'",
                    self.client_id()
                ),
            }
        }
        self.send(Packet::PublishRelease { packet_id });
    }

    pub async fn handle_pubcomp(&self, packet_id: PacketId) {
        let removed = self.state.lock().await.outbound.remove(&packet_id);
        if removed.is_some() {
            self.packet_id_freed.notify_one();
        } else {
            trace!("PUBCOMP for unknown packet id {packet_id}");
        }
    }

    pub async fn handle_subscribe(&self, packet_id: PacketId, topic_filters: Vec<(String, QoS)>) {
        let rights = self
            .identity
            .get()
            .map(|identity| identity.rights.clone())
            .unwrap_or_default();

        let mut status = Vec::with_capacity(topic_filters.len());
        let mut granted = Vec::new();
        for (filter, qos) in topic_filters {
            if !topic::is_valid_filter(&filter) {
                warn!("invalid topic filter '{filter}' from '{}'", self.client_id());
                status.push(SubscribeReturnCode::Failure);
            } else if !is_authorized(&rights, &filter) {
                warn!(
                    "'{}' is not authorized to subscribe to '{filter}'",
                    self.client_id()
                );
                status.push(SubscribeReturnCode::Failure);
            } else {
                status.push(SubscribeReturnCode::Success(qos));
                granted.push((filter, qos));
            }
        }

        {
            let mut state = self.state.lock().await;
            for (filter, qos) in &granted {
                trace!("'{}' subscribed to '{filter}' qos={qos:?}", self.client_id());
                state.subscriptions.insert(filter.clone(), *qos);
            }
        }
        self.send(Packet::SubscribeAck { packet_id, status });

        for (filter, qos) in granted {
            for retained in self.broker.retained_matching(&filter).await {
                self.enqueue(retained.repackage(qos, true));
            }
        }
    }

    pub async fn handle_unsubscribe(&self, packet_id: PacketId, topic_filters: Vec<String>) {
        {
            let mut state = self.state.lock().await;
            for filter in &topic_filters {
                if state.subscriptions.remove(filter).is_some() {
                    trace!("'{}' unsubscribed from '{filter}'", self.client_id());
                }
            }
        }
        self.send(Packet::UnsubscribeAck { packet_id });
    }

    /// Graceful close: the will is discarded.
    pub async fn handle_disconnect(&self) {
        let mut state = self.state.lock().await;
        state.will = None;
        state.phase = Phase::Disconnected;
        trace!("DISCONNECT from '{}'", self.client_id());
    }

    pub(crate) async fn mark_disconnected(&self) {
        self.state.lock().await.phase = Phase::Disconnected;
    }

    /// Builds the PUBLISH for a routed message. For QoS 1/2 a packet id is
    /// allocated and the message recorded as in flight before it is returned.
    /// Waits for an acknowledgment if every packet id is outstanding; returns
    /// None if the session closes meanwhile.
    pub async fn prepare_publish(&self, msg: Message) -> Option<Packet> {
        if msg.qos == QoS::AtMostOnce {
            return Some(Packet::Publish(Box::new(msg.to_publish(None, false))));
        }
        let mut shutdown = self.shutdown.subscribe();
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(packet_id) = state.allocate_packet_id() {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let publish = msg.to_publish(Some(packet_id), false);
                    state.outbound.insert(
                        packet_id,
                        OutboundEntry {
                            message: msg,
                            released: false,
                            seq,
                        },
                    );
                    return Some(Packet::Publish(Box::new(publish)));
                }
            }
            if self.is_closed() {
                return None;
            }
            warn!(
                "all packet ids of '{}' are in flight, waiting for an acknowledgment",
                self.client_id()
            );
            tokio::select! {
                _ = self.packet_id_freed.notified() => {}
                _ = shutdown.wait_for(|closed| *closed) => return None,
            }
        }
    }
}
