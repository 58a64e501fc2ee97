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

//! Peer synchronization surface.
//!
//! The peer-discovery and catch-up loop lives outside the core; the
//! consensus pipeline only needs the hooks below. The default implementation
//! turns every hook into a published event the external sync loop reacts to.

use super::message::Message;
use super::pubsub::{Event, PubSub};
use crate::base::schema::{Block, Transaction};
use crate::base::Mutex;
use crate::crypto::Hash;
use std::sync::Arc;

/// Broadcast and catch-up hooks consumed by the block executor.
pub trait SyncHooks: Send + Sync {
    /// Relay a freshly applied block to peers.
    fn relay_block(&self, block: &Block);

    /// Relay a staged transaction to peers.
    fn relay_transaction(&self, tx: &Transaction);

    /// Ask the sync loop to fetch blocks above the given height.
    fn emit_sync(&self, height: u64);

    /// Open a common-block negotiation for the given candidate identifiers.
    /// The negotiation itself runs on the transport sequence.
    fn request_common_block(&self, candidates: &[Hash]);
}

/// Event-bus backed hooks: every request becomes a published event.
pub struct EventSync {
    pubsub: Arc<Mutex<PubSub>>,
}

impl EventSync {
    pub fn new(pubsub: Arc<Mutex<PubSub>>) -> Self {
        EventSync { pubsub }
    }
}

impl SyncHooks for EventSync {
    fn relay_block(&self, block: &Block) {
        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::NEW_BLOCKS) {
            pubsub.publish(
                Event::NEW_BLOCKS,
                Message::NewBlocks {
                    block: block.clone(),
                },
            );
        }
    }

    fn relay_transaction(&self, tx: &Transaction) {
        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::TRANSACTION_CREATE) {
            pubsub.publish(
                Event::TRANSACTION_CREATE,
                Message::TransactionCreate { tx: tx.clone() },
            );
        }
    }

    fn emit_sync(&self, height: u64) {
        debug!("sync requested above height {}", height);
        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::EMIT_SYNC_BLOCKS) {
            pubsub.publish(Event::EMIT_SYNC_BLOCKS, Message::EmitSyncBlocks { height });
        }
    }

    fn request_common_block(&self, candidates: &[Hash]) {
        // The external loop drives the negotiation; the core only announces
        // the candidate set it would accept.
        debug!("common block negotiation over {} candidates", candidates.len());
    }
}
