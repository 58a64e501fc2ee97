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

//! Blockchain worker: the consensus sequence.
//!
//! One task owns block processing, mempool mutation and account state. All
//! incoming messages are handled inline, one at a time; a slot-period timer
//! drives forging for the local delegate. Only the durable repository calls
//! suspend the sequence.

use super::dispatcher::Dispatcher;
use super::executor::Executor;
use super::message::{BlockRequestReceiver, BlockResponseSender, Message};
use super::pool::Mempool;
use super::pubsub::PubSub;
use super::rounds::RoundService;
use super::slots::Slots;
use super::storage::BlockStorage;
use super::synchronizer::EventSync;
use super::ChainConfig;
use crate::base::schema::Transaction;
use crate::base::{Mutex, RwLock};
use crate::blockchain::accounts::AccountRepository;
use crate::crypto::KeyPair;
use crate::db::BlockRepo;
use crate::Result;
use async_std::task::{self, Context, Poll};
use futures::future::FutureExt;
use futures::{future, prelude::*};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of blocks loaded per durable batch during startup replay.
const REPLAY_BATCH: u64 = 100;

pub struct BlockWorker<R: BlockRepo> {
    config: Arc<ChainConfig>,
    slots: Slots,
    /// Consensus core.
    executor: Executor<R>,
    /// Message handlers running on this sequence.
    dispatcher: Dispatcher,
    /// Blockchain requests receiver.
    rx_chan: BlockRequestReceiver,
    /// Forging key, present on delegate nodes.
    keypair: Option<Arc<KeyPair>>,
    storage: Arc<RwLock<BlockStorage>>,
    rounds: Arc<RwLock<RoundService>>,
    syncing: Arc<AtomicBool>,
    is_cleaning: Arc<AtomicBool>,
}

impl<R: BlockRepo> BlockWorker<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ChainConfig>,
        registry: Arc<RwLock<AccountRepository>>,
        repo: Arc<RwLock<R>>,
        pubsub: Arc<Mutex<PubSub>>,
        keypair: Option<Arc<KeyPair>>,
        rx_chan: BlockRequestReceiver,
        syncing: Arc<AtomicBool>,
        is_cleaning: Arc<AtomicBool>,
    ) -> Self {
        let slots = Slots::new(config.epoch_time, config.slot_interval);
        let mempool = Arc::new(RwLock::new(Mempool::new(registry.clone(), config.clone())));
        let storage = Arc::new(RwLock::new(BlockStorage::new(config.max_blocks_in_memory)));
        let rounds = Arc::new(RwLock::new(RoundService::new()));
        let sync = Arc::new(EventSync::new(pubsub.clone()));

        let executor = Executor::new(
            config.clone(),
            registry.clone(),
            mempool.clone(),
            storage.clone(),
            rounds.clone(),
            repo,
            pubsub.clone(),
            sync.clone(),
            keypair.as_ref().map(|keypair| keypair.public_key()),
            syncing.clone(),
            is_cleaning.clone(),
        );
        let dispatcher = Dispatcher::new(registry, mempool, pubsub, sync);

        BlockWorker {
            config,
            slots,
            executor,
            dispatcher,
            rx_chan,
            keypair,
            storage,
            rounds,
            syncing,
            is_cleaning,
        }
    }

    /// Apply the genesis block and replay the durable store. Called once
    /// before the worker loop starts.
    pub fn bootstrap(&mut self, genesis_transactions: Vec<Transaction>) -> Result<u64> {
        self.executor
            .apply_genesis_block(genesis_transactions)
            .into_result()?;
        self.executor.replay_blocks(REPLAY_BATCH)
    }

    /// Forge when the current slot belongs to the local delegate and no
    /// block occupies it yet.
    fn try_forge(&mut self) {
        let keypair = match self.keypair.as_ref() {
            Some(keypair) => keypair.clone(),
            None => return,
        };
        if self.syncing.load(Ordering::Relaxed) || self.rounds.read().ticking() {
            return;
        }
        let last = match self.storage.read().get_last().cloned() {
            Some(last) => last,
            None => return,
        };

        let current_slot = self.slots.get_slot_number(None);
        let last_slot = self.slots.get_slot_number(Some(last.created_at as i64));
        if current_slot <= last_slot {
            return;
        }

        self.ensure_round(current_slot, last.height + 1);

        let owned = {
            let rounds = self.rounds.read();
            rounds.current().map_or(false, |round| {
                round
                    .slots
                    .get(&keypair.public_key())
                    .map_or(false, |slot| slot.slot == current_slot && !slot.is_forged)
            })
        };
        if !owned {
            return;
        }

        let timestamp = self.slots.get_slot_time(current_slot) as i32;
        let res = self.executor.generate_block(timestamp, &keypair);
        if !res.success() {
            warn!("block generation failed: {}", res.errors.join("; "));
        }
    }

    /// Keep a round schedule in force for the given slot, closing the
    /// previous round when it ran out.
    fn ensure_round(&self, current_slot: u64, next_height: u64) {
        let expired = self
            .rounds
            .read()
            .current()
            .and_then(|round| round.last_slot())
            .map_or(false, |last| current_slot > last);
        if expired {
            self.executor.finish_round();
        }
        let time = self.slots.get_slot_time(current_slot) as i32;
        self.executor.ensure_round(time, next_height);
    }

    /// Handle one request inline. Subscription management keeps the response
    /// channel; everything else goes through the dispatcher or the executor.
    fn handle_message(&mut self, req: Message, res_chan: &BlockResponseSender) {
        match req {
            Message::Subscribe { id, events } => {
                self.dispatcher.subscribe(id, events, res_chan.clone());
            }
            Message::Unsubscribe { id, events } => {
                self.dispatcher.unsubscribe(id, events);
            }
            Message::BlockReceive { block } => {
                let res = self.executor.receive_block(block);
                if !res.success() {
                    debug!("block rejected: {}", res.errors.join("; "));
                }
            }
            req => {
                if let Some(res) = self.dispatcher.message_handler(req) {
                    let res_chan = res_chan.clone();
                    task::spawn(async move {
                        if res_chan.send(res).await.is_err() {
                            warn!("blockchain response send error");
                        }
                    });
                }
            }
        }
    }

    /// Blockchain worker asynchronous task.
    /// This can be stopped by submitting a `Stop` message to its input channel.
    pub async fn run(&mut self) {
        let forge_period = self.config.slot_interval.max(1) as u64;
        let mut forge_sleep = Box::pin(task::sleep(Duration::from_secs(forge_period)));

        let future = future::poll_fn(move |cx: &mut Context<'_>| -> Poll<()> {
            while forge_sleep.poll_unpin(cx).is_ready() {
                self.try_forge();
                forge_sleep = Box::pin(task::sleep(Duration::from_secs(forge_period)));
            }

            loop {
                match self.rx_chan.poll_next_unpin(cx) {
                    Poll::Ready(Some((Message::Stop, _))) => {
                        self.is_cleaning.store(true, Ordering::Relaxed);
                        return Poll::Ready(());
                    }
                    Poll::Ready(Some((req, res_chan))) => self.handle_message(req, &res_chan),
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => break,
                }
            }
            Poll::Pending
        });

        future.await
    }

    /// Blockchain worker synchronous task.
    /// This can be stopped by submitting a `Stop` message to its input channel.
    pub fn run_sync(&mut self) {
        task::block_on(self.run());
    }
}
