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

//! Two-tier transaction staging: a FIFO queue for newly received
//! transactions and the unconfirmed pool that feeds block generation.
//!
//! Queue entries have passed nothing yet; the queue worker validates each
//! one and promotes it. Every pool entry has had `apply_unconfirmed` run, so
//! `unconfirmed_balance` always reflects the whole pool and `remove` restores
//! it bit-exact.
//!
//! The pool keeps two secondary indices with stable insertion order: by
//! sender, and by recipient. The recipient side captures the direct SEND
//! recipient plus every airdrop sponsor of STAKE and reward/unstake VOTE
//! transactions.

use crate::base::schema::{Address, Transaction, TransactionStatus, TransactionType};
use crate::base::RwLock;
use crate::blockchain::accounts::AccountRepository;
use crate::blockchain::{dispatch, ChainConfig};
use crate::crypto::Hash;
use crate::{Error, ErrorKind, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// FIFO staging for transactions awaiting pool admission.
#[derive(Default)]
struct TransactionQueue {
    fifo: VecDeque<Transaction>,
    ids: HashSet<Hash>,
}

impl TransactionQueue {
    fn push(&mut self, mut tx: Transaction) -> bool {
        if !self.ids.insert(tx.id) {
            return false;
        }
        tx.status = TransactionStatus::Queued;
        self.fifo.push_back(tx);
        true
    }

    fn pop(&mut self) -> Option<Transaction> {
        self.fifo.pop_front().map(|tx| {
            self.ids.remove(&tx.id);
            tx
        })
    }

    fn contains(&self, id: &Hash) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.fifo.len()
    }
}

/// Unconfirmed transactions staged for inclusion, plus the admission queue.
pub struct Mempool {
    /// Admission queue, drained by the queue worker.
    queue: TransactionQueue,
    /// Unconfirmed set.
    pool: HashMap<Hash, Transaction>,
    /// Sender address to staged ids, insertion ordered.
    by_sender: HashMap<Address, Vec<Hash>>,
    /// Recipient/sponsor address to staged ids, insertion ordered.
    by_recipient: HashMap<Address, Vec<Hash>>,
    /// Shared account state, mutated through the unconfirmed appliers.
    registry: Arc<RwLock<AccountRepository>>,
    config: Arc<ChainConfig>,
}

impl Mempool {
    pub fn new(registry: Arc<RwLock<AccountRepository>>, config: Arc<ChainConfig>) -> Self {
        Mempool {
            queue: TransactionQueue::default(),
            pool: HashMap::new(),
            by_sender: HashMap::new(),
            by_recipient: HashMap::new(),
            registry,
            config,
        }
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.pool.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stage a freshly received or created transaction for admission.
    /// Duplicates against both tiers are dropped.
    pub fn queue_push(&mut self, tx: Transaction) -> bool {
        if self.pool.contains_key(&tx.id) || self.queue.contains(&tx.id) {
            debug!("queue: dropping duplicate transaction {}", tx.id);
            return false;
        }
        self.queue.push(tx)
    }

    /// Drain the admission queue: validate structure, skip duplicates,
    /// resolve the sender (creating a stub account if unknown), verify
    /// against unconfirmed state and promote into the pool. Failures are
    /// logged and the transaction dropped. Returns the promoted
    /// transactions, for relay.
    pub fn process_queue(&mut self) -> Vec<Transaction> {
        let mut promoted = Vec::new();
        while let Some(tx) = self.queue.pop() {
            if self.pool.contains_key(&tx.id) {
                debug!("queue: duplicate transaction {} already pooled", tx.id);
                continue;
            }
            let sender = self
                .registry
                .write()
                .resolve_sender(tx.sender_public_key)
                .clone();
            let admitted = {
                let registry = self.registry.read();
                dispatch::verify(&tx, &sender, &self.config).and_then(|_| {
                    dispatch::verify_unconfirmed(&tx, &sender, &registry, &self.config)
                })
            };
            match admitted {
                Ok(()) => {
                    if let Err(err) = self.push(tx.clone(), false) {
                        warn!("queue: pool admission failed: {}", err.to_string_full());
                        continue;
                    }
                    promoted.push(tx);
                }
                Err(err) => {
                    warn!(
                        "queue: dropping transaction {}: {}",
                        tx.id,
                        err.to_string_full()
                    );
                }
            }
        }
        promoted
    }

    /// Insert into the pool, index it and apply its unconfirmed effects.
    /// Returns true when the caller asked for relay and the insert happened.
    pub fn push(&mut self, mut tx: Transaction, broadcast: bool) -> Result<bool> {
        if self.pool.contains_key(&tx.id) {
            return Err(Error::new(ErrorKind::DuplicatedUnconfirmedTx));
        }
        tx.status = TransactionStatus::PutInPool;

        dispatch::apply_unconfirmed(&tx, &mut self.registry.write())?;

        self.by_sender.entry(tx.sender_address).or_default().push(tx.id);
        for address in Self::recipient_addresses(&tx) {
            self.by_recipient.entry(address).or_default().push(tx.id);
        }
        tx.status = TransactionStatus::UnconfirmApplied;
        self.pool.insert(tx.id, tx);
        Ok(broadcast)
    }

    /// Remove one transaction, undoing its unconfirmed effects and dropping
    /// every index entry.
    pub fn remove(&mut self, id: &Hash) -> Result<Option<Transaction>> {
        let tx = match self.pool.remove(id) {
            Some(tx) => tx,
            None => return Ok(None),
        };
        dispatch::undo_unconfirmed(&tx, &mut self.registry.write())?;
        Self::deindex(&mut self.by_sender, tx.sender_address, id);
        for address in Self::recipient_addresses(&tx) {
            Self::deindex(&mut self.by_recipient, address, id);
        }
        Ok(Some(tx))
    }

    /// Remove every staged transaction sent by `address`, scanning the
    /// sender list in reverse so undo ordering mirrors apply ordering.
    pub fn remove_by_sender_address(&mut self, address: Address) -> Vec<Transaction> {
        let ids = self.by_sender.get(&address).cloned().unwrap_or_default();
        let mut removed = Vec::new();
        for id in ids.iter().rev() {
            match self.remove(id) {
                Ok(Some(tx)) => removed.push(tx),
                Ok(None) => {}
                Err(err) => error!("mempool: remove failed: {}", err.to_string_full()),
            }
        }
        removed
    }

    /// Clear every pool entry entangled with the senders of the given
    /// transactions, through both the sender and the recipient index. This
    /// over-approximates the conflict set when a block is received.
    pub fn batch_remove(&mut self, txs: &[Transaction]) -> Vec<Transaction> {
        let mut removed = Vec::new();
        for tx in txs {
            removed.extend(self.remove_by_sender_address(tx.sender_address));
            let ids = self
                .by_recipient
                .get(&tx.sender_address)
                .cloned()
                .unwrap_or_default();
            for id in ids.iter().rev() {
                match self.remove(id) {
                    Ok(Some(tx)) => removed.push(tx),
                    Ok(None) => {}
                    Err(err) => error!("mempool: remove failed: {}", err.to_string_full()),
                }
            }
        }
        removed
    }

    /// Pop up to `limit` transactions in canonical sort order, only those
    /// whose multisig quorum is satisfied. Removal happens in reverse sorted
    /// order (newest first) so the undo sequencing preserves the
    /// reversibility invariant.
    pub fn pop_sorted_unconfirmed_transactions(&mut self, limit: usize) -> Vec<Transaction> {
        let mut staged: Vec<Transaction> = {
            let registry = self.registry.read();
            self.pool
                .values()
                .filter(|tx| {
                    registry
                        .get_by_address(tx.sender_address)
                        .map_or(true, |sender| dispatch::ready(tx, sender))
                })
                .cloned()
                .collect()
        };
        staged.sort_by(dispatch::transaction_sort);
        staged.truncate(limit);

        for tx in staged.iter().rev() {
            if let Err(err) = self.remove(&tx.id) {
                error!("mempool: pop remove failed: {}", err.to_string_full());
            }
        }
        for tx in staged.iter_mut() {
            tx.status = TransactionStatus::PopForBlock;
        }
        staged
    }

    /// Conflict heuristic guarding concurrent staging for one sender:
    /// a SIGNATURE transaction conflicts with any staged dependent, a second
    /// REGISTER for the same sender always conflicts, and any transaction
    /// that would not sort after the staged dependents is order-ambiguous
    /// under concurrent arrival.
    pub fn is_potential_conflict(&self, tx: &Transaction) -> bool {
        let dependent_ids = self
            .by_sender
            .get(&tx.sender_address)
            .cloned()
            .unwrap_or_default();
        let dependents: Vec<&Transaction> = dependent_ids
            .iter()
            .filter_map(|id| self.pool.get(id))
            .collect();

        if tx.tx_type == TransactionType::Signature && !dependents.is_empty() {
            return true;
        }
        if tx.tx_type == TransactionType::Register
            && dependents
                .iter()
                .any(|dep| dep.tx_type == TransactionType::Register)
        {
            return true;
        }

        let mut ordered: Vec<&Transaction> = dependents;
        ordered.push(tx);
        ordered.sort_by(|a, b| dispatch::transaction_sort(a, b));
        ordered.last().map(|last| last.id) != Some(tx.id)
    }

    /// Re-stage transactions that fell out of a failed generation attempt:
    /// conflicting ones go back through the queue, the rest straight into
    /// the pool.
    pub fn return_to_queue_conflicted(&mut self, txs: Vec<Transaction>) {
        for tx in txs {
            if self.is_potential_conflict(&tx) {
                self.queue_push(tx);
            } else if let Err(err) = self.push(tx, false) {
                warn!("mempool: re-push failed: {}", err.to_string_full());
            }
        }
    }

    fn recipient_addresses(tx: &Transaction) -> Vec<Address> {
        let mut addresses = tx.sponsor_addresses();
        if let Some(recipient) = tx.recipient_address() {
            addresses.push(recipient);
        }
        addresses
    }

    fn deindex(index: &mut HashMap<Address, Vec<Hash>>, address: Address, id: &Hash) {
        if let Some(ids) = index.get_mut(&address) {
            ids.retain(|entry| entry != id);
            if ids.is_empty() {
                index.remove(&address);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::{
        create_test_delegate_tx, create_test_send_tx, create_test_signature_tx,
    };
    use crate::base::schema::{AirdropReward, Asset};
    use crate::blockchain::service::tests::create_test_config;
    use crate::crypto::sign::tests::{test_keypair, test_public_key};

    pub fn create_test_mempool(funded: &[(u8, u64)]) -> Mempool {
        let mut registry = AccountRepository::new();
        for &(index, balance) in funded {
            let account = registry.add(test_public_key(index));
            account.balance = balance;
            account.unconfirmed_balance = balance;
        }
        Mempool::new(
            Arc::new(RwLock::new(registry)),
            Arc::new(create_test_config()),
        )
    }

    fn unconfirmed_balance(mempool: &Mempool, index: u8) -> u64 {
        mempool
            .registry
            .read()
            .get_by_public_key(&test_public_key(index))
            .unwrap()
            .unconfirmed_balance
    }

    #[test]
    fn push_then_remove_restores_unconfirmed_balance() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let tx = create_test_send_tx(0, 1, 5000);

        mempool.push(tx.clone(), false).unwrap();
        assert_eq!(unconfirmed_balance(&mempool, 0), 100_000 - 5000 - tx.fee);

        mempool.remove(&tx.id).unwrap();
        assert_eq!(unconfirmed_balance(&mempool, 0), 100_000);
        assert!(mempool.is_empty());
        assert!(mempool.by_sender.is_empty());
        assert!(mempool.by_recipient.is_empty());
    }

    #[test]
    fn push_rejects_duplicate() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let tx = create_test_send_tx(0, 1, 5000);

        mempool.push(tx.clone(), false).unwrap();
        let err = mempool.push(tx, false).unwrap_err();

        assert_eq!(err.kind, ErrorKind::DuplicatedUnconfirmedTx);
    }

    #[test]
    fn push_indexes_sponsors_as_recipients() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let sponsor = test_public_key(7).to_address();
        let keypair = test_keypair(0);
        let mut sponsors = std::collections::BTreeMap::new();
        sponsors.insert(sponsor, 25);
        let mut tx = Transaction::unsigned(
            keypair.public_key(),
            4,
            1,
            Asset::Stake {
                amount: 1000,
                start_time: 4,
                airdrop_reward: AirdropReward { sponsors },
            },
        );
        tx.fee = 1000 * create_test_config().fees.stake / 10_000;
        tx.finalize(&keypair, None).unwrap();

        mempool.push(tx.clone(), false).unwrap();

        assert_eq!(mempool.by_recipient.get(&sponsor).unwrap(), &vec![tx.id]);
    }

    #[test]
    fn queue_worker_promotes_valid_and_drops_invalid() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let good = create_test_send_tx(0, 1, 5000);
        let mut bad = create_test_send_tx(0, 1, 2000);
        bad.signature[0] ^= 0xFF;
        bad.id = bad.compute_id();

        assert!(mempool.queue_push(good.clone()));
        assert!(mempool.queue_push(bad));
        let promoted = mempool.process_queue();

        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, good.id);
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.queue_len(), 0);
    }

    #[test]
    fn queue_rejects_duplicates_across_tiers() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let tx = create_test_send_tx(0, 1, 5000);

        mempool.push(tx.clone(), false).unwrap();

        assert!(!mempool.queue_push(tx));
    }

    #[test]
    fn queue_worker_creates_stub_sender() {
        // Sender 5 is unknown to the registry; admission fails on balance but
        // the stub account must exist afterwards.
        let mut mempool = create_test_mempool(&[]);
        let tx = create_test_send_tx(5, 1, 1000);

        mempool.queue_push(tx.clone());
        let promoted = mempool.process_queue();

        assert!(promoted.is_empty());
        assert!(mempool
            .registry
            .read()
            .get_by_public_key(&tx.sender_public_key)
            .is_some());
    }

    #[test]
    fn pop_sorted_returns_ascending_order() {
        let mut mempool = create_test_mempool(&[(0, 100_000), (2, 100_000)]);
        let send_a = create_test_send_tx(0, 1, 5000);
        let send_b = create_test_send_tx(2, 1, 3000);
        let keypair = test_keypair(0);
        let mut late = Transaction::unsigned(
            keypair.public_key(),
            50,
            10,
            Asset::Send {
                recipient_address: test_public_key(3).to_address(),
                amount: 1000,
            },
        );
        late.finalize(&keypair, None).unwrap();

        mempool.push(send_a, false).unwrap();
        mempool.push(send_b, false).unwrap();
        mempool.push(late.clone(), false).unwrap();

        let popped = mempool.pop_sorted_unconfirmed_transactions(10);

        assert_eq!(popped.len(), 3);
        for pair in popped.windows(2) {
            assert_ne!(
                dispatch::transaction_sort(&pair[0], &pair[1]),
                std::cmp::Ordering::Greater
            );
        }
        assert_eq!(popped.last().unwrap().id, late.id);
        assert!(mempool.is_empty());
        // Every unconfirmed apply was undone by the pop removal.
        assert_eq!(unconfirmed_balance(&mempool, 0), 100_000);
        assert_eq!(unconfirmed_balance(&mempool, 2), 100_000);
    }

    #[test]
    fn pop_sorted_respects_limit() {
        let mut mempool = create_test_mempool(&[(0, 100_000), (2, 100_000), (3, 100_000)]);
        mempool.push(create_test_send_tx(0, 1, 5000), false).unwrap();
        mempool.push(create_test_send_tx(2, 1, 3000), false).unwrap();
        mempool.push(create_test_send_tx(3, 1, 4000), false).unwrap();

        let popped = mempool.pop_sorted_unconfirmed_transactions(2);

        assert_eq!(popped.len(), 2);
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn batch_remove_clears_sender_entangled_entries() {
        let mut mempool = create_test_mempool(&[(0, 100_000), (2, 100_000)]);
        // Account 0 sends to account 1; account 2 sends to account 0.
        let from_zero = create_test_send_tx(0, 1, 5000);
        let to_zero = create_test_send_tx(2, 0, 3000);
        mempool.push(from_zero.clone(), false).unwrap();
        mempool.push(to_zero.clone(), false).unwrap();

        // A block transaction from sender 0 entangles both entries.
        let incoming = create_test_send_tx(0, 4, 700);
        let removed = mempool.batch_remove(std::slice::from_ref(&incoming));

        let removed_ids: Vec<Hash> = removed.iter().map(|tx| tx.id).collect();
        assert!(removed_ids.contains(&from_zero.id));
        assert!(removed_ids.contains(&to_zero.id));
        assert!(mempool.is_empty());
        assert_eq!(unconfirmed_balance(&mempool, 0), 100_000);
        assert_eq!(unconfirmed_balance(&mempool, 2), 100_000);
    }

    #[test]
    fn signature_conflicts_with_staged_dependent() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let send = create_test_send_tx(0, 1, 5000);
        mempool.push(send, false).unwrap();

        let signature = create_test_signature_tx(0);

        assert!(mempool.is_potential_conflict(&signature));
    }

    #[test]
    fn queue_admits_one_register_per_username() {
        let mut mempool = create_test_mempool(&[(0, 100_000), (2, 100_000)]);
        let first = create_test_delegate_tx(0, "validator_one");
        let second = create_test_delegate_tx(2, "validator_one");

        assert!(mempool.queue_push(first.clone()));
        assert!(mempool.queue_push(second));
        let promoted = mempool.process_queue();

        // The staged registration reserves the name; the rival is dropped.
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, first.id);
        assert_eq!(mempool.len(), 1);
    }

    #[test]
    fn second_register_conflicts() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let keypair = test_keypair(0);
        let make_register = |created_at: i32| {
            let mut tx = Transaction::unsigned(
                keypair.public_key(),
                created_at,
                0,
                Asset::Register { referral: 0 },
            );
            tx.finalize(&keypair, None).unwrap();
            tx
        };
        mempool.push(make_register(1), false).unwrap();

        assert!(mempool.is_potential_conflict(&make_register(2)));
    }

    #[test]
    fn older_transaction_is_order_ambiguous() {
        let mut mempool = create_test_mempool(&[(0, 100_000)]);
        let mut staged = create_test_send_tx(0, 1, 5000);
        staged.created_at = 100;
        let keypair = test_keypair(0);
        staged.signature.clear();
        staged.finalize(&keypair, None).unwrap();
        mempool.push(staged, false).unwrap();

        // An arriving transaction older than a staged dependent would not
        // sort last.
        let mut older = create_test_send_tx(0, 1, 700);
        older.created_at = 50;
        older.signature.clear();
        older.finalize(&keypair, None).unwrap();

        assert!(mempool.is_potential_conflict(&older));
    }

    #[test]
    fn independent_transaction_is_not_a_conflict() {
        let mut mempool = create_test_mempool(&[(0, 100_000), (2, 100_000)]);
        mempool.push(create_test_send_tx(0, 1, 5000), false).unwrap();

        let other_sender = create_test_send_tx(2, 1, 700);

        assert!(!mempool.is_potential_conflict(&other_sender));
    }
}
