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
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use rmqtt_codec::types::Publish;
use rmqtt_codec::v3::{LastWill, QoS};

/// An application message as routed by the broker.
///
/// Never mutated once built. Routing to a subscriber produces a re-tagged copy
/// through [`Message::repackage`]; the payload is reference counted, so copies
/// are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            dup: false,
        }
    }

    /// Copy with the subscriber's QoS and the given retain flag. `dup` is
    /// cleared, a fresh delivery is never a duplicate.
    pub fn repackage(&self, qos: QoS, retain: bool) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos,
            retain,
            dup: false,
        }
    }

    pub fn to_publish(&self, packet_id: Option<NonZeroU16>, dup: bool) -> Publish {
        Publish {
            dup,
            retain: self.retain,
            qos: self.qos,
            topic: ByteString::from(self.topic.as_str()),
            packet_id,
            payload: self.payload.clone(),
            properties: None,
            delay_interval: None,
            create_time: None,
        }
    }
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        Self {
            topic: p.topic.to_string(),
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
            dup: p.dup,
        }
    }
}

impl From<LastWill> for Message {
    fn from(will: LastWill) -> Self {
        Self::new(will.topic.to_string(), will.message, will.qos, will.retain)
    }
}
