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

//! Consensus core: block creation, verification, application, undo, the
//! receive decision tree and fork handling.
//!
//! Every method here runs on the consensus sequence, one at a time. The
//! durable repository calls are the only suspension points. Failure recovery
//! happens in exactly two places: a failed unconfirmed apply inside
//! `check_transactions_and_apply_unconfirmed` rolls back LIFO, and a failed
//! confirmed apply after a successful durable save reverses the unconfirmed
//! applies and requeues the block transactions. A durable-save failure does
//! NOT roll back unconfirmed applies; the original node behaves this way and
//! the behavior is kept (see DESIGN.md).

use super::accounts::AccountRepository;
use super::dispatch;
use super::message::Message;
use super::pool::Mempool;
use super::pubsub::{Event, PubSub};
use super::rounds::RoundService;
use super::slots::Slots;
use super::storage::BlockStorage;
use super::synchronizer::SyncHooks;
use super::ChainConfig;
use crate::base::schema::{Block, Transaction, TransactionStatus, TransactionType};
use crate::base::{Mutex, RwLock};
use crate::crypto::{Hash, Hasher, KeyPair, PublicKey};
use crate::db::BlockRepo;
use crate::{Error, ErrorKind, ResponseEntity, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-cause fork counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForkStats {
    /// Consecutive-height block with a different parent.
    pub cause_one: u64,
    /// Same height and parent as the tip, different id.
    pub cause_five: u64,
}

/// QA hooks: selected blocks may skip verification, and the slot ownership
/// check can be disabled. Inert by default.
#[derive(Default)]
pub struct FailInjection {
    skip_verify_ids: HashSet<Hash>,
    disable_slot_check: bool,
}

impl FailInjection {
    pub fn skip_verify(&self, id: &Hash) -> bool {
        self.skip_verify_ids.contains(id)
    }

    pub fn add_skip_verify(&mut self, id: Hash) {
        self.skip_verify_ids.insert(id);
    }

    pub fn slot_check_disabled(&self) -> bool {
        self.disable_slot_check
    }

    pub fn set_slot_check_disabled(&mut self, disabled: bool) {
        self.disable_slot_check = disabled;
    }
}

/// Receive decision tree outcome.
enum Disposition {
    AlreadyProcessed,
    Lower,
    Next,
    ForkOne,
    Gap,
    ForkFive,
}

/// Streaming digest plus amount/fee accumulation over ordered transactions.
fn payload_digest(transactions: &[Transaction]) -> (Hash, u64, u64) {
    let mut hasher = Hasher::new();
    let mut amount = 0u64;
    let mut fee = 0u64;
    for tx in transactions {
        fee += tx.fee;
        if tx.tx_type == TransactionType::Send {
            amount += tx.asset_amount();
        }
        hasher.update(&tx.to_bytes(false, false));
    }
    (hasher.finalize(), amount, fee)
}

/// Block executor context data.
pub(crate) struct Executor<R: BlockRepo> {
    config: Arc<ChainConfig>,
    slots: Slots,
    registry: Arc<RwLock<AccountRepository>>,
    mempool: Arc<RwLock<Mempool>>,
    storage: Arc<RwLock<BlockStorage>>,
    rounds: Arc<RwLock<RoundService>>,
    repo: Arc<RwLock<R>>,
    pubsub: Arc<Mutex<PubSub>>,
    sync: Arc<dyn SyncHooks>,
    /// Public key of the local forging delegate, when this node forges.
    local_generator: Option<PublicKey>,
    syncing: Arc<AtomicBool>,
    is_cleaning: Arc<AtomicBool>,
    pub fail_injection: FailInjection,
    fork_stats: ForkStats,
}

impl<R: BlockRepo> Executor<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ChainConfig>,
        registry: Arc<RwLock<AccountRepository>>,
        mempool: Arc<RwLock<Mempool>>,
        storage: Arc<RwLock<BlockStorage>>,
        rounds: Arc<RwLock<RoundService>>,
        repo: Arc<RwLock<R>>,
        pubsub: Arc<Mutex<PubSub>>,
        sync: Arc<dyn SyncHooks>,
        local_generator: Option<PublicKey>,
        syncing: Arc<AtomicBool>,
        is_cleaning: Arc<AtomicBool>,
    ) -> Self {
        let slots = Slots::new(config.epoch_time, config.slot_interval);
        Executor {
            config,
            slots,
            registry,
            mempool,
            storage,
            rounds,
            repo,
            pubsub,
            sync,
            local_generator,
            syncing,
            is_cleaning,
            fail_injection: FailInjection::default(),
            fork_stats: ForkStats::default(),
        }
    }

    pub fn fork_stats(&self) -> ForkStats {
        self.fork_stats
    }

    /// Ordered active delegate list: username order, bounded by the
    /// configured active set size.
    fn active_delegates(&self) -> Vec<PublicKey> {
        let mut delegates = self.registry.read().delegates();
        delegates.sort_by(|a, b| a.username.cmp(&b.username));
        delegates.truncate(self.config.active_delegates as usize);
        delegates.into_iter().map(|d| d.public_key).collect()
    }

    /// Delegate forge counter, moved both ways so apply and undo stay
    /// symmetric.
    fn bump_forged_blocks(&self, generator: &PublicKey, delta: i32) {
        let mut registry = self.registry.write();
        if let Some(account) = registry.get_mut_by_address(generator.to_address()) {
            if let Some(delegate) = account.delegate.as_mut() {
                if delta >= 0 {
                    delegate.forged_blocks += delta as u32;
                } else {
                    delegate.forged_blocks =
                        delegate.forged_blocks.saturating_sub((-delta) as u32);
                }
            }
        }
    }

    /// Close the round in force: every slot that went unforged counts as a
    /// missed block for its delegate. The schedule is dropped so the next
    /// caller regenerates it.
    pub(crate) fn finish_round(&self) {
        let expired = match self.rounds.read().current() {
            Some(round) => round.clone(),
            None => return,
        };
        {
            let mut registry = self.registry.write();
            for (public_key, slot) in &expired.slots {
                if slot.is_forged {
                    continue;
                }
                if let Some(account) = registry.get_mut_by_address(public_key.to_address()) {
                    if let Some(delegate) = account.delegate.as_mut() {
                        delegate.missed_blocks += 1;
                    }
                }
            }
        }
        self.rounds.write().forget_current();
    }

    /// Generate the round schedule in force at `created_at` when none exists.
    pub(crate) fn ensure_round(&self, created_at: i32, height: u64) {
        if self.rounds.read().current().is_some() {
            return;
        }
        let delegates = self.active_delegates();
        if delegates.is_empty() {
            return;
        }
        let active = delegates.len() as u64;
        let first_slot = self
            .slots
            .get_first_slot_number_in_round(Some(created_at as i64), active);
        let number = self.slots.calc_round(height, active);
        let round = self
            .rounds
            .read()
            .generate(first_slot, height, number, &delegates);
        self.rounds.write().set_current(round);
    }

    /// Build a new block on top of `previous` from already sorted-or-not
    /// transactions; payload hash, amounts, signature and id are filled by
    /// [`Self::add_payload_hash`].
    pub fn create(
        &self,
        mut transactions: Vec<Transaction>,
        timestamp: i32,
        previous: &Block,
        keypair: &KeyPair,
    ) -> Result<Block> {
        transactions.sort_by(dispatch::transaction_sort);
        let mut block = Block {
            id: Hash::default(),
            version: self.config.block_version,
            height: previous.height + 1,
            previous_block_id: Some(previous.id),
            created_at: timestamp,
            transaction_count: transactions.len() as u32,
            amount: 0,
            fee: 0,
            payload_hash: Hash::default(),
            generator_public_key: keypair.public_key(),
            signature: Vec::new(),
            transactions,
        };
        self.add_payload_hash(&mut block, keypair)?;
        Ok(block)
    }

    /// Accumulate fees, SEND amounts and the streaming payload digest, then
    /// sign the block and derive its identifier. Idempotent: re-running on
    /// the same block recomputes the same values unless a fee was rewritten
    /// in between.
    pub fn add_payload_hash(&self, block: &mut Block, keypair: &KeyPair) -> Result<()> {
        let (payload_hash, amount, fee) = payload_digest(&block.transactions);
        block.payload_hash = payload_hash;
        block.amount = amount;
        block.fee = fee;
        block.transaction_count = block.transactions.len() as u32;
        block.signature = keypair.sign(block.signing_hash().as_bytes())?;
        block.id = block.compute_id();
        let id = block.id;
        for tx in block.transactions.iter_mut() {
            tx.block_id = Some(id);
        }
        Ok(())
    }

    /// Structural block verification. Collects every failure instead of
    /// short-circuiting; the result comes back reversed, most recent check
    /// first.
    pub fn verify_block(&self, block: &Block, verify: bool) -> Vec<Error> {
        let mut errors: Vec<Error> = Vec::new();

        if verify
            && !block
                .generator_public_key
                .verify(block.signing_hash().as_bytes(), &block.signature)
        {
            errors.push(Error::new_ext(
                ErrorKind::InvalidSignature,
                "Failed to verify block signature",
            ));
        }

        if block.height != 1 && block.previous_block_id.is_none() {
            errors.push(Error::new_ext(
                ErrorKind::MalformedData,
                "Invalid previous block",
            ));
        }

        if block.version != self.config.block_version {
            errors.push(Error::new_ext(
                ErrorKind::MalformedData,
                "Invalid block version",
            ));
        }

        if verify && block.id != block.compute_id() {
            errors.push(Error::new_ext(ErrorKind::MalformedData, "Invalid block id"));
        }

        self.verify_payload(block, &mut errors);

        let last = self.storage.read().get_last().cloned();
        if let Some(last) = last {
            let block_slot = self.slots.get_slot_number(Some(block.created_at as i64));
            let last_slot = self.slots.get_slot_number(Some(last.created_at as i64));
            let current_slot = self.slots.get_slot_number(None);
            let window_end = current_slot + self.config.active_delegates - 1;
            if block_slot <= last_slot || block_slot > window_end {
                errors.push(Error::new_ext(
                    ErrorKind::SlotMismatch,
                    format!(
                        "blockSlot {} is out of window ({}, {}]",
                        block_slot, last_slot, window_end
                    ),
                ));
            }
        }

        errors.reverse();
        errors
    }

    /// Payload re-derivation: digest, amount, fee, duplicate transaction
    /// ids and declared count.
    fn verify_payload(&self, block: &Block, errors: &mut Vec<Error>) {
        if block.transactions.len() > self.config.max_transactions_per_block {
            errors.push(Error::new_ext(
                ErrorKind::MalformedData,
                "Transactions length is too high",
            ));
        }
        if block.transaction_count as usize != block.transactions.len() {
            errors.push(Error::new_ext(
                ErrorKind::MalformedData,
                "Included transactions do not match block transactions count",
            ));
        }
        let mut seen = HashSet::new();
        for tx in &block.transactions {
            if !seen.insert(tx.id) {
                errors.push(Error::new_ext(
                    ErrorKind::MalformedData,
                    format!("Encountered duplicate transaction: {}", tx.id),
                ));
            }
        }
        let (payload_hash, amount, fee) = payload_digest(&block.transactions);
        if payload_hash != block.payload_hash {
            errors.push(Error::new_ext(
                ErrorKind::PayloadMismatch,
                "Invalid payload hash",
            ));
        }
        if amount != block.amount {
            errors.push(Error::new_ext(
                ErrorKind::PayloadMismatch,
                "Invalid total amount",
            ));
        }
        if fee != block.fee {
            errors.push(Error::new_ext(ErrorKind::PayloadMismatch, "Invalid total fee"));
        }
    }

    /// Receipt-level verification for fork candidates: structure and payload
    /// only, no local-chain checks. Reversed like [`Self::verify_block`].
    fn verify_receipt(&self, block: &Block) -> Vec<Error> {
        let mut errors: Vec<Error> = Vec::new();
        if !block
            .generator_public_key
            .verify(block.signing_hash().as_bytes(), &block.signature)
        {
            errors.push(Error::new_ext(
                ErrorKind::InvalidSignature,
                "Failed to verify block signature",
            ));
        }
        if block.id != block.compute_id() {
            errors.push(Error::new_ext(ErrorKind::MalformedData, "Invalid block id"));
        }
        self.verify_payload(block, &mut errors);
        errors.reverse();
        errors
    }

    /// Slot ownership: the block slot must be the one assigned to its
    /// generator in the current round.
    pub fn verify_block_slot(&self, block: &Block) -> Result<()> {
        if block.height <= 1 || self.fail_injection.slot_check_disabled() {
            return Ok(());
        }
        let block_slot = self.slots.get_slot_number(Some(block.created_at as i64));
        let rounds = self.rounds.read();
        let generator_slot = rounds
            .current()
            .and_then(|round| round.generator_slot(&block.generator_public_key))
            .ok_or_else(|| {
                Error::new_ext(
                    ErrorKind::SlotMismatch,
                    "GeneratorPublicKey does not exist in current round",
                )
            })?;
        if block_slot != generator_slot {
            return Err(Error::new_ext(
                ErrorKind::SlotMismatch,
                format!(
                    "blockSlot {} not equal with generatorSlot {}",
                    block_slot, generator_slot
                ),
            ));
        }
        Ok(())
    }

    /// Per-transaction admission for the block being processed. Applies
    /// unconfirmed effects in block order; on any failure the already
    /// applied transactions are rolled back in strict LIFO order.
    pub fn check_transactions_and_apply_unconfirmed(
        &self,
        block: &mut Block,
        verify: bool,
    ) -> Result<()> {
        let mut applied = 0usize;
        let mut failure: Option<Error> = None;

        for i in 0..block.transactions.len() {
            let sender = self
                .registry
                .write()
                .resolve_sender(block.transactions[i].sender_public_key)
                .clone();

            if verify {
                let tx = &block.transactions[i];
                let res = dispatch::verify(tx, &sender, &self.config).and_then(|_| {
                    let registry = self.registry.read();
                    dispatch::verify_unconfirmed(tx, &sender, &registry, &self.config)
                });
                if let Err(err) = res {
                    failure = Some(err);
                    break;
                }
            } else if block.transactions[i].tx_type == TransactionType::Vote {
                // Vote fees are stake-dependent: recompute from the sender
                // state in force at application time.
                let fee = dispatch::calculate_fee(&block.transactions[i], &sender, &self.config);
                block.transactions[i].fee = fee;
            }

            if let Err(err) =
                dispatch::apply_unconfirmed(&block.transactions[i], &mut self.registry.write())
            {
                failure = Some(err);
                break;
            }
            applied += 1;
        }

        match failure {
            None => Ok(()),
            Some(err) => {
                for tx in block.transactions[..applied].iter().rev() {
                    if let Err(undo_err) =
                        dispatch::undo_unconfirmed(tx, &mut self.registry.write())
                    {
                        error!(
                            "unconfirmed rollback failed for {}: {}",
                            tx.id,
                            undo_err.to_string_full()
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Persist and apply the block.
    ///
    /// A durable-save failure propagates without touching the unconfirmed
    /// applies. A confirmed-apply failure after a successful save reverses
    /// the unconfirmed applies over the whole block and pushes its
    /// transactions back through the queue.
    pub fn apply_block(
        &self,
        block: &mut Block,
        broadcast: bool,
        keypair: Option<&KeyPair>,
    ) -> Result<()> {
        if let Some(keypair) = keypair {
            self.add_payload_hash(block, keypair)?;
        }

        self.repo.write().batch_save(block)?;

        let id = block.id;
        for tx in block.transactions.iter_mut() {
            tx.block_id = Some(id);
            tx.status = TransactionStatus::Confirmed;
        }
        self.storage.write().push(block.clone());

        for i in 0..block.transactions.len() {
            if let Err(err) = dispatch::apply(&block.transactions[i], &mut self.registry.write()) {
                error!(
                    "confirmed apply failed for {}: {}",
                    block.transactions[i].id,
                    err.to_string_full()
                );
                self.storage.write().pop_last();
                for tx in block.transactions.iter().rev() {
                    if let Err(undo_err) =
                        dispatch::undo_unconfirmed(tx, &mut self.registry.write())
                    {
                        error!(
                            "unconfirmed rollback failed for {}: {}",
                            tx.id,
                            undo_err.to_string_full()
                        );
                    }
                }
                let mut mempool = self.mempool.write();
                for tx in block.transactions.iter() {
                    mempool.queue_push(tx.clone());
                }
                return Err(err);
            }
        }

        if block.height >= self.config.min_round_block_height {
            self.rounds.write().mark_forged(&block.generator_public_key);
            self.bump_forged_blocks(&block.generator_public_key, 1);
        }

        if broadcast && !self.syncing.load(Ordering::Relaxed) {
            let mut pubsub = self.pubsub.lock();
            if pubsub.has_subscribers(Event::APPLY_BLOCK) {
                pubsub.publish(
                    Event::APPLY_BLOCK,
                    Message::ApplyBlock {
                        block: block.clone(),
                    },
                );
            }
            drop(pubsub);
            self.sync.relay_block(block);
        }
        Ok(())
    }

    /// Straight-line processing pipeline: verification, duplicate check,
    /// unconfirmed admission, application.
    pub fn process(
        &self,
        block: &mut Block,
        broadcast: bool,
        keypair: Option<&KeyPair>,
        verify: bool,
    ) -> ResponseEntity<()> {
        if verify {
            let errors = self.verify_block(block, true);
            if !errors.is_empty() {
                return ResponseEntity::fail(
                    errors.iter().map(|err| err.to_string_full()).collect(),
                );
            }
            if let Err(err) = self.verify_block_slot(block) {
                return ResponseEntity::fail_one(err.to_string_full());
            }
        }

        if self.storage.read().has(&block.id) {
            return ResponseEntity::fail_one(format!("Block {} already processed", block.id));
        }

        if let Err(err) = self.check_transactions_and_apply_unconfirmed(block, verify) {
            return ResponseEntity::fail_one(err.to_string_full());
        }

        if let Err(err) = self.apply_block(block, broadcast, keypair) {
            return ResponseEntity::fail_one(err.to_string_full());
        }

        ResponseEntity::ok(())
    }

    /// Classify a received block against the local tip.
    fn validate_received(&self, received: &Block, last: &Block) -> Disposition {
        if received.id == last.id {
            Disposition::AlreadyProcessed
        } else if received.height < last.height {
            Disposition::Lower
        } else if received.height == last.height + 1 {
            if received.previous_block_id == Some(last.id) {
                Disposition::Next
            } else {
                Disposition::ForkOne
            }
        } else if received.height > last.height {
            Disposition::Gap
        } else {
            Disposition::ForkFive
        }
    }

    /// Entry point for peer-produced blocks.
    pub fn receive_block(&mut self, block: Block) -> ResponseEntity<()> {
        if self.syncing.load(Ordering::Relaxed) || self.rounds.read().ticking() {
            debug!("dropping received block {}: node is busy syncing", block.id);
            return ResponseEntity::fail_one("Node is syncing");
        }

        let last = match self.storage.read().get_last().cloned() {
            Some(last) => last,
            None => return ResponseEntity::fail_one("Blockchain is not ready"),
        };
        debug!(
            "Received block {} at height {} (local height {})",
            block.id, block.height, last.height
        );

        match self.validate_received(&block, &last) {
            Disposition::AlreadyProcessed => {
                ResponseEntity::fail_one(format!("Block {} already processed", block.id))
            }
            Disposition::Lower => {
                ResponseEntity::fail_one("Block height is less than last block")
            }
            Disposition::Gap => {
                self.sync.emit_sync(last.height);
                ResponseEntity::fail_one("Block height is beyond the chain tip")
            }
            Disposition::Next => self.do_receive(block),
            Disposition::ForkOne => self.receive_fork_one(block, last),
            Disposition::ForkFive => self.receive_fork_five(block, last),
        }
    }

    /// Accept path: clear sender-entangled mempool entries, make sure a
    /// round schedule exists, process, then reconcile the mempool with the
    /// outcome.
    fn do_receive(&self, block: Block) -> ResponseEntity<()> {
        let removed = self.mempool.write().batch_remove(&block.transactions);
        self.ensure_round(block.created_at, block.height);

        let verify = !self.fail_injection.skip_verify(&block.id);
        let mut block = block;
        let res = self.process(&mut block, true, None, verify);

        let mut mempool = self.mempool.write();
        if res.success() {
            let included: HashSet<Hash> = block.transactions.iter().map(|tx| tx.id).collect();
            let leftovers: Vec<Transaction> = removed
                .into_iter()
                .filter(|tx| !included.contains(&tx.id))
                .collect();
            mempool.return_to_queue_conflicted(leftovers);
        } else {
            for tx in removed {
                if let Err(err) = mempool.push(tx, false) {
                    warn!("mempool restore failed: {}", err.to_string_full());
                }
            }
        }
        res
    }

    /// Fork cause 1: consecutive height, unknown parent. The strictly older
    /// candidate wins; when it does, the local tip and its parent are
    /// deleted and the sync loop takes over.
    fn receive_fork_one(&mut self, received: Block, last: Block) -> ResponseEntity<()> {
        self.fork_stats.cause_one += 1;
        warn!(
            "Fork cause 1: block {} at height {} does not extend local tip {}",
            received.id, received.height, last.id
        );

        let received_loses = received.created_at > last.created_at
            || (received.created_at == last.created_at && received.id > last.id);
        if received_loses {
            return ResponseEntity::fail_one("Received block does not win the fork");
        }

        let errors = self.verify_receipt(&received);
        if !errors.is_empty() {
            return ResponseEntity::fail(errors.iter().map(|err| err.to_string_full()).collect());
        }

        for _ in 0..2 {
            let res = self.delete_last_block();
            if !res.success() {
                return ResponseEntity::fail(res.errors);
            }
        }

        let height = self
            .storage
            .read()
            .get_last()
            .map(|block| block.height)
            .unwrap_or_default();
        self.sync.emit_sync(height);
        ResponseEntity::ok(())
    }

    /// Fork cause 5: same height and parent as the tip, different id. The
    /// older block wins, ties break on the lower id. The evicted tip is held
    /// aside and restored when the candidate fails processing.
    fn receive_fork_five(&mut self, received: Block, last: Block) -> ResponseEntity<()> {
        self.fork_stats.cause_five += 1;

        if received.generator_public_key == last.generator_public_key {
            warn!(
                "Delegate {} forged multiple blocks at height {}",
                received.generator_public_key, received.height
            );
        }
        if received.previous_block_id != last.previous_block_id {
            return ResponseEntity::fail_one("Fork blocks have different parents");
        }
        if self.local_generator == Some(last.generator_public_key) {
            return ResponseEntity::fail_one("Last block was forged here, keeping it");
        }

        let received_wins = received.created_at < last.created_at
            || (received.created_at == last.created_at && received.id < last.id);
        if !received_wins {
            return ResponseEntity::fail_one("Last block stands");
        }

        let errors = self.verify_receipt(&received);
        if !errors.is_empty() {
            return ResponseEntity::fail(errors.iter().map(|err| err.to_string_full()).collect());
        }

        let tmp_block = last;
        let res = self.delete_last_block();
        if !res.success() {
            return ResponseEntity::fail(res.errors);
        }

        let res = self.do_receive(received);
        if !res.success() {
            warn!("fork resolution failed, restoring the previous tip");
            let restore = self.do_receive(tmp_block);
            if !restore.success() {
                error!("tip restore failed: {}", restore.errors.join("; "));
            }
            return res;
        }
        ResponseEntity::ok(())
    }

    /// Produce a block from the pool in the local delegate's slot.
    pub fn generate_block(&self, timestamp: i32, keypair: &KeyPair) -> ResponseEntity<()> {
        let transactions = self
            .mempool
            .write()
            .pop_sorted_unconfirmed_transactions(self.config.max_transactions_per_block);

        let previous = match self.storage.read().get_last().cloned() {
            Some(block) => block,
            None => {
                self.mempool.write().return_to_queue_conflicted(transactions);
                return ResponseEntity::fail_one("Blockchain is not ready");
            }
        };

        let mut block = match self.create(transactions.clone(), timestamp, &previous, keypair) {
            Ok(block) => block,
            Err(err) => {
                self.mempool.write().return_to_queue_conflicted(transactions);
                return ResponseEntity::fail_one(err.to_string_full());
            }
        };
        self.ensure_round(timestamp, block.height);

        let res = self.process(&mut block, true, Some(keypair), false);
        if res.success() {
            debug!("Generated block {} at height {}", block.id, block.height);
            let mut pubsub = self.pubsub.lock();
            if pubsub.has_subscribers(Event::BLOCK_GENERATE) {
                pubsub.publish(
                    Event::BLOCK_GENERATE,
                    Message::BlockGenerate {
                        block: block.clone(),
                    },
                );
            }
        } else {
            // Popped transactions go back through the conflict-aware path.
            self.mempool.write().return_to_queue_conflicted(transactions);
        }
        res
    }

    /// Roll the chain tip back by one block.
    pub fn delete_last_block(&self) -> ResponseEntity<Block> {
        let last = match self.storage.read().get_last().cloned() {
            Some(block) => block,
            None => return ResponseEntity::fail_one("Blockchain is empty"),
        };
        if last.height <= 1 {
            return ResponseEntity::fail_one("Cannot delete genesis block");
        }

        if let Err(err) = self.repo.write().delete_by_id(&last.id) {
            return ResponseEntity::fail_one(err.to_string_full());
        }

        let slot = self.slots.get_slot_number(Some(last.created_at as i64));
        {
            let mut rounds = self.rounds.write();
            rounds.restore_to_slot(slot);
            rounds.unset_forged(&last.generator_public_key);
        }
        if last.height >= self.config.min_round_block_height {
            self.bump_forged_blocks(&last.generator_public_key, -1);
        }

        self.storage.write().pop_last();

        for tx in last.transactions.iter().rev() {
            if let Err(err) = dispatch::undo(tx, &mut self.registry.write()) {
                error!("undo failed for {}: {}", tx.id, err.to_string_full());
                return ResponseEntity::fail_one(err.to_string_full());
            }
            if let Err(err) = dispatch::undo_unconfirmed(tx, &mut self.registry.write()) {
                error!(
                    "undo unconfirmed failed for {}: {}",
                    tx.id,
                    err.to_string_full()
                );
                return ResponseEntity::fail_one(err.to_string_full());
            }
        }

        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::UNDO_BLOCK) {
            pubsub.publish(Event::UNDO_BLOCK, Message::UndoBlock { block: last });
        }
        drop(pubsub);

        match self.storage.read().get_last().cloned() {
            Some(block) => ResponseEntity::ok(block),
            None => ResponseEntity::fail_one("Blockchain is empty"),
        }
    }

    /// Build and apply the genesis block from its transaction set.
    ///
    /// Genesis senders are endowed upfront with exactly the value their
    /// transactions move: the unsigned ledger cannot carry the negative
    /// balance the original chain parked on its genesis account.
    pub fn apply_genesis_block(&self, mut transactions: Vec<Transaction>) -> ResponseEntity<()> {
        {
            let mut registry = self.registry.write();
            for tx in &transactions {
                let debit = tx.asset_amount() + tx.fee;
                let account = registry.resolve_sender(tx.sender_public_key);
                account.balance += debit;
                account.unconfirmed_balance += debit;
            }
        }

        transactions.sort_by(dispatch::transaction_sort);
        let (payload_hash, amount, fee) = payload_digest(&transactions);
        let mut block = Block {
            id: Hash::default(),
            version: self.config.block_version,
            height: 1,
            previous_block_id: None,
            created_at: 0,
            transaction_count: transactions.len() as u32,
            amount,
            fee,
            payload_hash,
            generator_public_key: PublicKey::default(),
            signature: Vec::new(),
            transactions,
        };
        block.id = block.compute_id();

        self.process(&mut block, false, None, false)
    }

    /// Replay the durable store on top of the current tip. Consults the
    /// cleaning flag between blocks; emits `BLOCKCHAIN_READY` once the tail
    /// is reached.
    pub fn replay_blocks(&self, batch: u64) -> Result<u64> {
        let mut applied = 0u64;
        let mut offset = self
            .storage
            .read()
            .get_last()
            .map(|block| block.height)
            .unwrap_or_default();

        'outer: loop {
            let blocks = self.repo.read().load_blocks_offset(batch, offset)?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                if self.is_cleaning.load(Ordering::Relaxed) {
                    debug!("replay interrupted: node is shutting down");
                    break 'outer;
                }
                let mut block = block;
                let height = block.height;
                let res = self.process(&mut block, false, None, false);
                if !res.success() {
                    return Err(Error::new_ext(
                        ErrorKind::StateConflict,
                        format!("replay failed at height {}: {}", height, res.errors.join("; ")),
                    ));
                }
                offset += 1;
                applied += 1;
            }
        }

        let mut pubsub = self.pubsub.lock();
        if pubsub.has_subscribers(Event::BLOCKCHAIN_READY) {
            pubsub.publish(Event::BLOCKCHAIN_READY, Message::BlockchainReady);
        }
        Ok(applied)
    }
}
