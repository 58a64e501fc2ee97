// This file is part of CATENA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// CATENA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// CATENA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with CATENA. If not, see <https://www.gnu.org/licenses/>.

//! Publish/subscribe protocol for blockchain events.
//!
//! Events are propagated using the channel that the subscriber has provided
//! with the `Subscribe` message. A closed receiving side is interpreted as
//! an implicit unsubscribe and evicted lazily on the next publish.

use super::{message::BlockResponseSender, Message};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

bitflags::bitflags! {
    /// Blockchain event kinds.
    pub struct Event: u16 {
        /// Peer-produced transaction arrived.
        const TRANSACTION_RECEIVE = 1 << 0;
        /// Locally created transaction entered the pool.
        const TRANSACTION_CREATE = 1 << 1;
        /// Peer-produced block arrived.
        const BLOCK_RECEIVE = 1 << 2;
        /// Local delegate produced a block.
        const BLOCK_GENERATE = 1 << 3;
        /// Startup replay completed.
        const BLOCKCHAIN_READY = 1 << 4;
        /// A block joined the chain tip.
        const NEW_BLOCKS = 1 << 5;
        /// A block was applied to account state.
        const APPLY_BLOCK = 1 << 6;
        /// A block was rolled back.
        const UNDO_BLOCK = 1 << 7;
        /// The receive path detected a height gap; sync wanted.
        const EMIT_SYNC_BLOCKS = 1 << 8;
    }
}

const EVENTS_NUM: usize = 9;

impl Serialize for Event {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u16(self.bits)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EventVisitor;

        impl<'de> serde::de::Visitor<'de> for EventVisitor {
            type Value = u16;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("u16")
            }

            fn visit_u16<R>(self, value: u16) -> std::result::Result<u16, R> {
                Ok(value)
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<u16, E>
            where
                E: SerdeError,
            {
                u16::try_from(value).map_err(|_| SerdeError::custom("invalid bits"))
            }
        }

        let bits = deserializer.deserialize_u16(EventVisitor)?;
        let event = Event::from_bits(bits).ok_or_else(|| SerdeError::custom("invalid bits"))?;
        Ok(event)
    }
}

/// Blockchain events subscribers.
#[derive(Default)]
pub(crate) struct PubSub {
    events_sub: HashMap<Event, HashMap<String, BlockResponseSender>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    /// Check if the `event` kind has subscribers.
    pub fn has_subscribers(&self, event: Event) -> bool {
        match self.events_sub.get(&event) {
            Some(subs) => !subs.is_empty(),
            None => false,
        }
    }

    /// Subscribe to blockchain events. The `events` parameter is a bitflag,
    /// multiple kinds can be OR-ed together. Events are received from the
    /// receiver end of `chan`.
    pub fn subscribe(&mut self, id: String, events: Event, chan: BlockResponseSender) {
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' subscribed to '{:?}' event", id, event);
                self.events_sub
                    .entry(event)
                    .or_default()
                    .insert(id.clone(), chan.clone());
            }
        }
    }

    /// Unsubscribe from blockchain events.
    pub fn unsubscribe(&mut self, id: String, events: Event) {
        for i in 0..EVENTS_NUM {
            if let Some(event) = Event::from_bits((1 << i) & events.bits) {
                if event.is_empty() {
                    continue;
                }
                debug!("[sub] '{}' unsubscribed from '{:?}' event", id, event);
                if let Some(event_subs) = self.events_sub.get_mut(&event) {
                    event_subs.remove(&id);
                    if event_subs.is_empty() {
                        self.events_sub.remove(&event);
                    }
                }
            }
        }
    }

    /// Publish a blockchain event to its subscribers.
    pub fn publish(&mut self, event: Event, msg: Message) {
        if let Some(event_subs) = self.events_sub.get_mut(&event) {
            let mut closed_chans = vec![];
            for (id, chan) in event_subs.iter() {
                if chan.is_closed() {
                    closed_chans.push(id.clone());
                    continue;
                }
                let id_clone = id.clone();
                let chan_clone = chan.clone();
                let msg_clone = msg.clone();
                async_std::task::spawn(async move {
                    debug!("[sub] '{}' notified about '{:?}' event", id_clone, event);
                    if chan_clone.send(msg_clone).await.is_err() {
                        debug!("[sub] error publishing to '{}', closing channel", id_clone);
                        chan_clone.close();
                    }
                });
            }
            closed_chans.iter().for_each(|id| {
                debug!("[sub] detected closed channel for '{}', removing it", id);
                event_subs.remove(id);
            });
            if event_subs.is_empty() {
                self.events_sub.remove(&event);
            }
        }
    }
}
