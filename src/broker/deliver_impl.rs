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
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use super::Registry;
use crate::message::Message;
use crate::topic::TopicMatches;

/// Single consumer of every delivered message. Running the retained update and
/// the fan-out for one message before looking at the next keeps each
/// subscriber's queue in submission order.
pub(super) async fn sequencer_task(
    registry: Arc<RwLock<Registry>>,
    mut deliver_rx: mpsc::Receiver<Message>,
) {
    trace!("Delivery sequencer started");

    while let Some(msg) = deliver_rx.recv().await {
        if msg.retain {
            update_retained(&registry, &msg).await;
        }

        let matches = TopicMatches::new(&msg.topic);
        let guard = registry.read().await;
        for session in guard.clients.values() {
            session.route(&msg, &matches).await;
        }
    }

    trace!("Delivery sequencer finished");
}

async fn update_retained(registry: &RwLock<Registry>, msg: &Message) {
    let mut registry = registry.write().await;
    if msg.payload.is_empty() {
        if registry.retained.remove(&msg.topic).is_some() {
            debug!("retained message on '{}' deleted", msg.topic);
        }
    } else {
        debug!("retained message on '{}' stored", msg.topic);
        registry.retained.insert(msg.topic.clone(), msg.clone());
    }
}
