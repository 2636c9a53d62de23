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
//! Process-wide client registry and retained store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, trace};

use crate::message::Message;
use crate::session::Session;
use crate::topic;

mod deliver_impl;

/// Broker tunables
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of each session's delivery queue. Overflow drops the newest message.
    pub delivery_queue_size: usize,
    /// Capacity of the queue in front of the delivery sequencer
    pub sequencer_queue_size: usize,
    /// Packet handlers running concurrently per connection
    pub handler_concurrency: usize,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
    /// Maximum inbound packet size, 0 is unlimited
    pub max_packet_size: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivery_queue_size: 1000,
            sequencer_queue_size: 1000,
            handler_concurrency: 1,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    /// client id -> live session
    pub(crate) clients: HashMap<String, Arc<Session>>,
    /// topic -> last retained message
    pub(crate) retained: HashMap<String, Message>,
}

struct BrokerInner {
    registry: Arc<RwLock<Registry>>,
    deliver_tx: mpsc::Sender<Message>,
    config: BrokerConfig,
}

/// Shared handle to the broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Creates the broker and spawns its delivery sequencer, so it must be
    /// called from within a tokio runtime. The sequencer stops once every
    /// handle is dropped.
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (deliver_tx, deliver_rx) = mpsc::channel(config.sequencer_queue_size.max(1));

        let registry_for_task = registry.clone();
        tokio::spawn(async move {
            deliver_impl::sequencer_task(registry_for_task, deliver_rx).await;
        });

        Self {
            inner: Arc::new(BrokerInner {
                registry,
                deliver_tx,
                config,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Registers `session` under its client id.
    ///
    /// If another session holds the id it is closed and returned. When the new
    /// session does not ask for a clean session it inherits the displaced
    /// one's subscriptions, in-flight messages and queued deliveries.
    pub async fn add_client(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let client_id = session.client_id().to_string();
        let mut registry = self.inner.registry.write().await;
        let previous = registry.clients.insert(client_id.clone(), session.clone());
        match &previous {
            Some(previous) => {
                debug!("closing previous connection of '{client_id}'");
                // stops the old writer before its state moves
                previous.close();
                if session.clean_session() {
                    debug!("session takeover for '{client_id}', clean session");
                } else {
                    debug!("session takeover for '{client_id}', inheriting state");
                    session.inherit_from(previous).await;
                }
            }
            None => trace!("registered '{client_id}'"),
        }
        previous
    }

    /// Deregisters `session` if it is still the one registered under its id.
    /// Returns true if it was removed.
    pub async fn remove_client(&self, session: &Arc<Session>) -> bool {
        let client_id = session.client_id();
        let mut registry = self.inner.registry.write().await;
        match registry.clients.get(client_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                registry.clients.remove(client_id);
                trace!("deregistered '{client_id}'");
                true
            }
            _ => false,
        }
    }

    /// Hands a published message to the sequencer. Messages are routed in the
    /// order they are submitted.
    pub async fn deliver(&self, msg: Message) {
        if self.inner.deliver_tx.send(msg).await.is_err() {
            error!("delivery sequencer is gone, message dropped");
        }
    }

    /// Retained messages whose topic matches `filter`.
    pub async fn retained_matching(&self, filter: &str) -> Vec<Message> {
        let registry = self.inner.registry.read().await;
        registry
            .retained
            .iter()
            .filter(|(topic, _)| topic::matches(filter, topic))
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub async fn retained(&self, topic: &str) -> Option<Message> {
        self.inner.registry.read().await.retained.get(topic).cloned()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.registry.read().await.clients.len()
    }

    pub async fn is_registered(&self, client_id: &str) -> bool {
        self.inner
            .registry
            .read()
            .await
            .clients
            .contains_key(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_impl::AllowAll;
    use bytestring::ByteString;
    use rmqtt_codec::v3::{Connect, Packet, QoS};
    use std::num::NonZeroU16;
    use tokio::time::{sleep, timeout};

    async fn subscriber(
        broker: &Broker,
        client_id: &str,
        filters: &[(&str, QoS)],
    ) -> (Arc<Session>, crate::session::SessionChannels) {
        let (session, mut channels) = Session::new(broker.clone(), Arc::new(AllowAll));
        session
            .handle_packet(
                Connect {
                    client_id: ByteString::from(client_id),
                    clean_session: true,
                    ..Connect::default()
                }
                .into(),
            )
            .await
            .unwrap();
        session
            .handle_subscribe(
                NonZeroU16::new(1).unwrap(),
                filters
                    .iter()
                    .map(|(f, q)| (f.to_string(), *q))
                    .collect(),
            )
            .await;
        // CONNACK, SUBACK
        channels.control.recv().await.unwrap();
        assert!(matches!(
            channels.control.recv().await.unwrap(),
            Packet::SubscribeAck { .. }
        ));
        (session, channels)
    }

    async fn next(session: &Session) -> Message {
        let (_queue, msg) = timeout(Duration::from_secs(1), session.next_delivery())
            .await
            .expect("timed out");
        msg.expect("closed")
    }

    async fn nothing_queued(session: &Session) -> bool {
        timeout(Duration::from_millis(50), session.next_delivery())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_retained_upsert_and_delete() {
        let broker = Broker::new(BrokerConfig::default());
        broker.deliver(Message::new("a/b", "v1", QoS::AtLeastOnce, true)).await;
        broker.deliver(Message::new("a/b", "v2", QoS::AtLeastOnce, true)).await;
        broker.deliver(Message::new("a/c", "x", QoS::AtMostOnce, true)).await;
        // not retained, must not touch the store
        broker.deliver(Message::new("a/c", "y", QoS::AtMostOnce, false)).await;

        // the sequencer processes in order, so wait for a marker
        broker.deliver(Message::new("marker", "m", QoS::AtMostOnce, true)).await;
        timeout(Duration::from_secs(1), async {
            while broker.retained("marker").await.is_none() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(broker.retained("a/b").await.unwrap().payload, "v2");
        assert_eq!(broker.retained("a/c").await.unwrap().payload, "x");
        assert_eq!(broker.retained_matching("a/+").await.len(), 2);

        broker.deliver(Message::new("a/b", "", QoS::AtMostOnce, true)).await;
        broker.deliver(Message::new("marker", "", QoS::AtMostOnce, true)).await;
        timeout(Duration::from_secs(1), async {
            while broker.retained("marker").await.is_some() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(broker.retained("a/b").await.is_none());
        assert_eq!(broker.retained_matching("a/#").await.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_retags_per_subscription() {
        let broker = Broker::new(BrokerConfig::default());
        let (s1, _c1) = subscriber(&broker, "s1", &[("a/+", QoS::AtMostOnce)]).await;
        let (s2, _c2) = subscriber(&broker, "s2", &[("a/b", QoS::ExactlyOnce)]).await;
        let (s3, _c3) = subscriber(&broker, "s3", &[("other", QoS::ExactlyOnce)]).await;

        broker.deliver(Message::new("a/b", "p", QoS::AtLeastOnce, true)).await;

        let m1 = next(&s1).await;
        assert_eq!(m1.qos, QoS::AtMostOnce);
        assert!(!m1.retain);
        let m2 = next(&s2).await;
        assert_eq!(m2.qos, QoS::ExactlyOnce);
        assert!(!m2.retain);

        assert!(nothing_queued(&s3).await);
        // the stored copy keeps its flags
        assert!(broker.retained("a/b").await.unwrap().retain);
    }

    #[tokio::test]
    async fn test_deliver_preserves_order() {
        let broker = Broker::new(BrokerConfig::default());
        let (s, _channels) = subscriber(&broker, "s", &[("t", QoS::AtLeastOnce)]).await;
        for i in 0..100 {
            broker
                .deliver(Message::new("t", format!("{i}"), QoS::AtMostOnce, false))
                .await;
        }
        for i in 0..100 {
            assert_eq!(next(&s).await.payload, format!("{i}"));
        }
    }

    #[tokio::test]
    async fn test_system_topics_are_isolated() {
        let broker = Broker::new(BrokerConfig::default());
        let (all, _channels) = subscriber(&broker, "all", &[("#", QoS::AtMostOnce)]).await;

        broker.deliver(Message::new("$SYS/uptime", "1", QoS::AtMostOnce, false)).await;
        broker.deliver(Message::new("plain", "2", QoS::AtMostOnce, false)).await;
        assert_eq!(next(&all).await.topic, "plain");
        assert!(nothing_queued(&all).await);
    }

    #[tokio::test]
    async fn test_remove_client_checks_identity() {
        let broker = Broker::new(BrokerConfig::default());
        let (first, _c1) = subscriber(&broker, "x", &[("a", QoS::AtMostOnce)]).await;
        let (second, _c2) = subscriber(&broker, "x", &[("b", QoS::AtMostOnce)]).await;
        assert!(first.is_closed());
        assert!(!broker.remove_client(&first).await);
        assert!(broker.is_registered("x").await);
        assert!(broker.remove_client(&second).await);
        assert_eq!(broker.client_count().await, 0);
    }
}
