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

//! Per-type transaction logic.
//!
//! Each transaction type owns a handler implementing the capability set:
//! verification against structure and against unconfirmed state, the
//! reversible unconfirmed apply pair and the confirmed apply pair, and the
//! fee rule. The free functions at the top are the entry points used by the
//! pool and the block executor; they run the shared checks and then dispatch
//! through the type table.
//!
//! `apply_unconfirmed`/`undo_unconfirmed` touch the unconfirmed mirrors
//! (`unconfirmed_balance` plus the pending-username set); `apply`/`undo`
//! move confirmed balances and the secondary state (second keys, delegate
//! records, votes, stake orders). Every undo is the exact inverse of its
//! apply.

use crate::base::schema::{
    Account, Asset, Delegate, Stake, Transaction, TransactionType, VoteKind,
};
use crate::blockchain::accounts::AccountRepository;
use crate::blockchain::ChainConfig;
use crate::crypto::PublicKey;
use crate::{Error, ErrorKind, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Stable ordering for block inclusion: type tag ascending, then creation
/// time, then identifier.
pub fn transaction_sort(a: &Transaction, b: &Transaction) -> Ordering {
    a.tx_type
        .as_u8()
        .cmp(&b.tx_type.as_u8())
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Multisig quorum check. Vacuously true for plain senders.
pub fn ready(tx: &Transaction, sender: &Account) -> bool {
    sender.multisignatures.is_empty() || tx.signatures.len() >= sender.multimin as usize
}

/// Structural and signature verification (stateless besides the sender's
/// second key).
pub fn verify(tx: &Transaction, sender: &Account, config: &ChainConfig) -> Result<()> {
    if tx.tx_type != tx.asset.transaction_type() {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            "transaction type does not match asset",
        ));
    }
    if tx.sender_address != tx.sender_public_key.to_address() {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            "sender address does not derive from public key",
        ));
    }
    if tx.id != tx.compute_id() {
        return Err(Error::new_ext(
            ErrorKind::MalformedData,
            "transaction id mismatch",
        ));
    }
    if !tx
        .sender_public_key
        .verify(&tx.to_bytes(true, true), &tx.signature)
    {
        return Err(Error::new(ErrorKind::InvalidSignature));
    }
    if let Some(second_public_key) = sender.second_public_key {
        match tx.second_signature {
            Some(ref sig) if second_public_key.verify(&tx.to_bytes(false, true), sig) => {}
            _ => {
                return Err(Error::new_ext(
                    ErrorKind::InvalidSignature,
                    "second signature required",
                ))
            }
        }
    }
    handler(tx.tx_type).verify(tx, sender, config)
}

/// Verification against current unconfirmed state: fee adequacy, balance
/// sufficiency, per-type uniqueness and conflicts.
pub fn verify_unconfirmed(
    tx: &Transaction,
    sender: &Account,
    repo: &AccountRepository,
    config: &ChainConfig,
) -> Result<()> {
    let expected_fee = calculate_fee(tx, sender, config);
    if tx.fee != expected_fee {
        return Err(Error::new_ext(
            ErrorKind::TransactionVerify,
            format!("fee {} not equal with expected fee {}", tx.fee, expected_fee),
        ));
    }
    let debit = total_debit(tx);
    if sender.unconfirmed_balance < debit {
        return Err(Error::new_ext(
            ErrorKind::TransactionVerify,
            format!(
                "insufficient unconfirmed balance: {} < {}",
                sender.unconfirmed_balance, debit
            ),
        ));
    }
    handler(tx.tx_type).verify_unconfirmed(tx, sender, repo)
}

/// Tentatively debit the sender's unconfirmed balance and apply the
/// type-specific unconfirmed effects.
pub fn apply_unconfirmed(tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
    let debit = total_debit(tx);
    let sender = repo.resolve_sender(tx.sender_public_key);
    sender.unconfirmed_balance = sender
        .unconfirmed_balance
        .checked_sub(debit)
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "unconfirmed underflow"))?;
    handler(tx.tx_type).apply_unconfirmed(tx, repo)
}

/// Exact inverse of [`apply_unconfirmed`].
pub fn undo_unconfirmed(tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
    handler(tx.tx_type).undo_unconfirmed(tx, repo)?;
    let debit = total_debit(tx);
    let sender = repo.resolve_sender(tx.sender_public_key);
    sender.unconfirmed_balance = sender
        .unconfirmed_balance
        .checked_add(debit)
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "unconfirmed overflow"))?;
    Ok(())
}

/// Confirmed state mutation.
pub fn apply(tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
    let debit = total_debit(tx);
    let sender = repo.resolve_sender(tx.sender_public_key);
    sender.balance = sender
        .balance
        .checked_sub(debit)
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "balance underflow"))?;
    handler(tx.tx_type).apply(tx, repo)
}

/// Exact inverse of [`apply`].
pub fn undo(tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
    handler(tx.tx_type).undo(tx, repo)?;
    let debit = total_debit(tx);
    let sender = repo.resolve_sender(tx.sender_public_key);
    sender.balance = sender
        .balance
        .checked_add(debit)
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "balance overflow"))?;
    Ok(())
}

/// Fee rule for the transaction given the sender's current state. SEND and
/// STAKE pay a rate on the moved amount, VOTE a rate on the sender's active
/// stake, the remaining types a flat fee.
pub fn calculate_fee(tx: &Transaction, sender: &Account, config: &ChainConfig) -> u64 {
    let fees = &config.fees;
    match &tx.asset {
        Asset::Send { amount, .. } => amount * fees.send / 10_000,
        Asset::Stake { amount, .. } => amount * fees.stake / 10_000,
        Asset::Vote { .. } => sender.active_stake() * fees.vote / 10_000,
        Asset::Register { .. } => fees.register,
        Asset::Signature { .. } => fees.signature,
        Asset::Delegate { .. } => fees.delegate,
    }
}

/// Everything leaving the sender account: moved value plus fee.
fn total_debit(tx: &Transaction) -> u64 {
    tx.asset_amount() + tx.fee
}

/// Capability set implemented once per transaction type.
trait TxHandler: Send + Sync {
    fn verify(&self, _tx: &Transaction, _sender: &Account, _config: &ChainConfig) -> Result<()> {
        Ok(())
    }

    fn verify_unconfirmed(
        &self,
        _tx: &Transaction,
        _sender: &Account,
        _repo: &AccountRepository,
    ) -> Result<()> {
        Ok(())
    }

    /// Type-specific unconfirmed effects beyond the shared sender debit.
    fn apply_unconfirmed(&self, _tx: &Transaction, _repo: &mut AccountRepository) -> Result<()> {
        Ok(())
    }

    fn undo_unconfirmed(&self, _tx: &Transaction, _repo: &mut AccountRepository) -> Result<()> {
        Ok(())
    }

    /// Type-specific confirmed effects. The shared sender debit has already
    /// been taken by the driver.
    fn apply(&self, _tx: &Transaction, _repo: &mut AccountRepository) -> Result<()> {
        Ok(())
    }

    fn undo(&self, _tx: &Transaction, _repo: &mut AccountRepository) -> Result<()> {
        Ok(())
    }
}

fn handler(tx_type: TransactionType) -> &'static dyn TxHandler {
    match tx_type {
        TransactionType::Register => &RegisterHandler,
        TransactionType::Send => &SendHandler,
        TransactionType::Signature => &SignatureHandler,
        TransactionType::Delegate => &DelegateHandler,
        TransactionType::Stake => &StakeHandler,
        TransactionType::Vote => &VoteHandler,
    }
}

struct RegisterHandler;

impl TxHandler for RegisterHandler {}

struct SendHandler;

impl TxHandler for SendHandler {
    fn verify(&self, tx: &Transaction, _sender: &Account, _config: &ChainConfig) -> Result<()> {
        match tx.asset {
            Asset::Send { amount, .. } if amount == 0 => Err(Error::new_ext(
                ErrorKind::TransactionVerify,
                "zero send amount",
            )),
            _ => Ok(()),
        }
    }

    fn apply(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Send {
            recipient_address,
            amount,
        } = tx.asset
        {
            let recipient = repo.resolve_address(recipient_address);
            recipient.balance += amount;
            recipient.unconfirmed_balance += amount;
        }
        Ok(())
    }

    fn undo(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Send {
            recipient_address,
            amount,
        } = tx.asset
        {
            let recipient = repo.resolve_address(recipient_address);
            recipient.balance = recipient.balance.checked_sub(amount).ok_or_else(|| {
                Error::new_ext(ErrorKind::TransactionVerify, "recipient underflow")
            })?;
            recipient.unconfirmed_balance =
                recipient.unconfirmed_balance.checked_sub(amount).ok_or_else(|| {
                    Error::new_ext(ErrorKind::TransactionVerify, "recipient underflow")
                })?;
        }
        Ok(())
    }
}

struct SignatureHandler;

impl TxHandler for SignatureHandler {
    fn verify_unconfirmed(
        &self,
        _tx: &Transaction,
        sender: &Account,
        _repo: &AccountRepository,
    ) -> Result<()> {
        if sender.second_public_key.is_some() {
            return Err(Error::new_ext(
                ErrorKind::TransactionVerify,
                "second public key already set",
            ));
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Signature { second_public_key } = tx.asset {
            let sender = repo.resolve_sender(tx.sender_public_key);
            sender.second_public_key = Some(second_public_key);
        }
        Ok(())
    }

    fn undo(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        let sender = repo.resolve_sender(tx.sender_public_key);
        sender.second_public_key = None;
        Ok(())
    }
}

struct DelegateHandler;

impl TxHandler for DelegateHandler {
    fn verify(&self, tx: &Transaction, _sender: &Account, config: &ChainConfig) -> Result<()> {
        if let Asset::Delegate { ref username } = tx.asset {
            check_username(username, config.max_username_length)?;
        }
        Ok(())
    }

    fn verify_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
        repo: &AccountRepository,
    ) -> Result<()> {
        if sender.delegate.is_some() {
            return Err(Error::new_ext(
                ErrorKind::TransactionVerify,
                "account is already a delegate",
            ));
        }
        if let Asset::Delegate { ref username } = tx.asset {
            // Both mirrors guard uniqueness: registered delegates and the
            // registrations still pending in the pool.
            if repo.username_taken(username) || repo.username_reserved(username) {
                return Err(Error::new_ext(
                    ErrorKind::TransactionVerify,
                    format!("username {} already taken", username),
                ));
            }
        }
        Ok(())
    }

    fn apply_unconfirmed(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Delegate { ref username } = tx.asset {
            repo.reserve_username(username.clone());
        }
        Ok(())
    }

    fn undo_unconfirmed(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Delegate { ref username } = tx.asset {
            repo.release_username(username);
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Delegate { ref username } = tx.asset {
            let delegate = Delegate::new(username.clone(), tx.sender_public_key);
            repo.attach_delegate(tx.sender_address, Some(delegate));
        }
        Ok(())
    }

    fn undo(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        repo.attach_delegate(tx.sender_address, None);
        Ok(())
    }
}

struct StakeHandler;

impl TxHandler for StakeHandler {
    fn verify(&self, tx: &Transaction, _sender: &Account, _config: &ChainConfig) -> Result<()> {
        match tx.asset {
            Asset::Stake { amount, .. } if amount == 0 => Err(Error::new_ext(
                ErrorKind::TransactionVerify,
                "zero stake amount",
            )),
            _ => Ok(()),
        }
    }

    fn apply(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Stake {
            amount,
            start_time,
            ref airdrop_reward,
        } = tx.asset
        {
            let sender = repo.resolve_sender(tx.sender_public_key);
            sender.stakes.push(Stake {
                created_at: start_time,
                amount,
                vote_count: 0,
                active: true,
            });
            credit_sponsors(repo, &airdrop_reward.sponsors, false)?;
        }
        Ok(())
    }

    fn undo(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Stake {
            amount,
            start_time,
            ref airdrop_reward,
        } = tx.asset
        {
            credit_sponsors(repo, &airdrop_reward.sponsors, true)?;
            let sender = repo.resolve_sender(tx.sender_public_key);
            let pos = sender
                .stakes
                .iter()
                .rposition(|stake| stake.created_at == start_time && stake.amount == amount)
                .ok_or_else(|| {
                    Error::new_ext(ErrorKind::TransactionVerify, "stake order not found")
                })?;
            sender.stakes.remove(pos);
        }
        Ok(())
    }
}

struct VoteHandler;

impl TxHandler for VoteHandler {
    fn verify_unconfirmed(
        &self,
        tx: &Transaction,
        sender: &Account,
        repo: &AccountRepository,
    ) -> Result<()> {
        if let Asset::Vote { ref votes, .. } = tx.asset {
            for vote in votes {
                let is_delegate = repo
                    .get_by_public_key(&vote.delegate)
                    .map_or(false, |account| account.delegate.is_some());
                if !is_delegate {
                    return Err(Error::new_ext(
                        ErrorKind::TransactionVerify,
                        "vote target is not a delegate",
                    ));
                }
                let already_voted = sender.votes.contains(&vote.delegate);
                match vote.kind {
                    VoteKind::Up if already_voted => {
                        return Err(Error::new_ext(
                            ErrorKind::TransactionVerify,
                            "delegate already voted",
                        ))
                    }
                    VoteKind::Down if !already_voted => {
                        return Err(Error::new_ext(
                            ErrorKind::TransactionVerify,
                            "delegate not voted",
                        ))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn apply(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Vote {
            ref votes,
            ref airdrop_reward,
            ..
        } = tx.asset
        {
            for vote in votes {
                let sender = repo.resolve_sender(tx.sender_public_key);
                match vote.kind {
                    VoteKind::Up => sender.votes.push(vote.delegate),
                    VoteKind::Down => sender.votes.retain(|pk| pk != &vote.delegate),
                }
                // Kept sorted so apply/undo pairs restore the list bit-exact.
                sender.votes.sort_unstable();
                bump_vote_count(repo, &vote.delegate, vote.kind)?;
            }
            credit_sponsors(repo, &airdrop_reward.sponsors, false)?;
        }
        Ok(())
    }

    fn undo(&self, tx: &Transaction, repo: &mut AccountRepository) -> Result<()> {
        if let Asset::Vote {
            ref votes,
            ref airdrop_reward,
            ..
        } = tx.asset
        {
            credit_sponsors(repo, &airdrop_reward.sponsors, true)?;
            for vote in votes.iter().rev() {
                let inverse = match vote.kind {
                    VoteKind::Up => VoteKind::Down,
                    VoteKind::Down => VoteKind::Up,
                };
                let sender = repo.resolve_sender(tx.sender_public_key);
                match inverse {
                    VoteKind::Up => sender.votes.push(vote.delegate),
                    VoteKind::Down => sender.votes.retain(|pk| pk != &vote.delegate),
                }
                sender.votes.sort_unstable();
                bump_vote_count(repo, &vote.delegate, inverse)?;
            }
        }
        Ok(())
    }
}

fn bump_vote_count(
    repo: &mut AccountRepository,
    delegate_key: &PublicKey,
    kind: VoteKind,
) -> Result<()> {
    let address = delegate_key.to_address();
    let account = repo
        .get_mut_by_address(address)
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "delegate account missing"))?;
    let delegate = account
        .delegate
        .as_mut()
        .ok_or_else(|| Error::new_ext(ErrorKind::TransactionVerify, "delegate record missing"))?;
    match kind {
        VoteKind::Up => {
            delegate.confirmed_vote_count += 1;
            delegate.votes += 1;
        }
        VoteKind::Down => {
            delegate.confirmed_vote_count =
                delegate.confirmed_vote_count.checked_sub(1).ok_or_else(|| {
                    Error::new_ext(ErrorKind::TransactionVerify, "vote count underflow")
                })?;
            delegate.votes -= 1;
        }
    }
    Ok(())
}

/// Credit (or, on undo, reclaim) the airdrop reward of every sponsor.
fn credit_sponsors(
    repo: &mut AccountRepository,
    sponsors: &BTreeMap<u64, u64>,
    reverse: bool,
) -> Result<()> {
    for (&address, &amount) in sponsors {
        let account = repo.resolve_address(address);
        if reverse {
            account.balance = account.balance.checked_sub(amount).ok_or_else(|| {
                Error::new_ext(ErrorKind::TransactionVerify, "sponsor underflow")
            })?;
            account.unconfirmed_balance =
                account.unconfirmed_balance.checked_sub(amount).ok_or_else(|| {
                    Error::new_ext(ErrorKind::TransactionVerify, "sponsor underflow")
                })?;
        } else {
            account.balance += amount;
            account.unconfirmed_balance += amount;
        }
    }
    Ok(())
}

/// Username rules: lowercase alphanumerics plus `!@$&_.`, bounded length,
/// not purely numeric.
fn check_username(username: &str, max_length: usize) -> Result<()> {
    if username.is_empty() || username.len() > max_length {
        return Err(Error::new_ext(
            ErrorKind::TransactionVerify,
            "username length out of range",
        ));
    }
    let valid = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "!@$&_.".contains(c));
    if !valid {
        return Err(Error::new_ext(
            ErrorKind::TransactionVerify,
            "username contains forbidden characters",
        ));
    }
    if username.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::new_ext(
            ErrorKind::TransactionVerify,
            "username cannot be purely numeric",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::{
        create_test_delegate_tx, create_test_send_tx, create_test_signature_tx,
    };
    use crate::base::schema::{AirdropReward, VoteItem};
    use crate::blockchain::service::tests::create_test_config;
    use crate::crypto::sign::tests::{test_keypair, test_public_key};

    fn funded_repo(accounts: &[(u8, u64)]) -> AccountRepository {
        let mut repo = AccountRepository::new();
        for &(index, balance) in accounts {
            let account = repo.add(test_public_key(index));
            account.balance = balance;
            account.unconfirmed_balance = balance;
        }
        repo
    }

    #[test]
    fn sort_orders_by_type_then_time_then_id() {
        let send = create_test_send_tx(0, 1, 1000);
        let signature = create_test_signature_tx(0);
        let mut late_send = create_test_send_tx(2, 1, 1000);
        late_send.created_at = send.created_at + 10;

        let mut txs = vec![signature.clone(), late_send.clone(), send.clone()];
        txs.sort_by(transaction_sort);

        assert_eq!(txs[0].id, send.id);
        assert_eq!(txs[1].id, late_send.id);
        assert_eq!(txs[2].id, signature.id);
    }

    #[test]
    fn sort_breaks_time_ties_by_id() {
        let a = create_test_send_tx(0, 1, 1000);
        let b = create_test_send_tx(2, 1, 1000);

        let mut txs = vec![a.clone(), b.clone()];
        txs.sort_by(transaction_sort);

        assert!(txs[0].id <= txs[1].id);
    }

    #[test]
    fn verify_accepts_valid_send() {
        let config = create_test_config();
        let repo = funded_repo(&[(0, 100_000)]);
        let tx = create_test_send_tx(0, 1, 5000);
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        assert!(verify(&tx, sender, &config).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let config = create_test_config();
        let repo = funded_repo(&[(0, 100_000)]);
        let mut tx = create_test_send_tx(0, 1, 5000);
        tx.signature[0] ^= 0xFF;
        tx.id = tx.compute_id();
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        let err = verify(&tx, sender, &config).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn verify_rejects_id_mismatch() {
        let config = create_test_config();
        let repo = funded_repo(&[(0, 100_000)]);
        let mut tx = create_test_send_tx(0, 1, 5000);
        tx.created_at += 1;
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        let err = verify(&tx, sender, &config).unwrap_err();

        assert_eq!(err.kind, ErrorKind::MalformedData);
    }

    #[test]
    fn verify_requires_second_signature() {
        let config = create_test_config();
        let mut repo = funded_repo(&[(0, 100_000)]);
        repo.resolve_sender(test_public_key(0)).second_public_key =
            Some(test_public_key(9));
        let tx = create_test_send_tx(0, 1, 5000);
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        let err = verify(&tx, sender, &config).unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidSignature);
    }

    #[test]
    fn verify_unconfirmed_rejects_poor_sender() {
        let config = create_test_config();
        let repo = funded_repo(&[(0, 100)]);
        let tx = create_test_send_tx(0, 1, 5000);
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        let err = verify_unconfirmed(&tx, sender, &repo, &config).unwrap_err();

        assert_eq!(err.kind, ErrorKind::TransactionVerify);
    }

    #[test]
    fn verify_unconfirmed_rejects_wrong_fee() {
        let config = create_test_config();
        let repo = funded_repo(&[(0, 100_000)]);
        let mut tx = create_test_send_tx(0, 1, 5000);
        tx.fee += 1;
        let sender = repo.get_by_public_key(&tx.sender_public_key).unwrap();

        let err = verify_unconfirmed(&tx, sender, &repo, &config).unwrap_err();

        assert_eq!(err.kind, ErrorKind::TransactionVerify);
    }

    #[test]
    fn unconfirmed_apply_undo_round_trip() {
        let mut repo = funded_repo(&[(0, 100_000)]);
        let tx = create_test_send_tx(0, 1, 5000);
        let before = repo.get_by_address(tx.sender_address).unwrap().clone();

        apply_unconfirmed(&tx, &mut repo).unwrap();
        assert_eq!(
            repo.get_by_address(tx.sender_address).unwrap().unconfirmed_balance,
            100_000 - 5000 - tx.fee
        );

        undo_unconfirmed(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(tx.sender_address).unwrap(), &before);
    }

    #[test]
    fn send_apply_undo_round_trip() {
        let mut repo = funded_repo(&[(0, 100_000), (1, 0)]);
        let tx = create_test_send_tx(0, 1, 5000);
        let sender_before = repo.get_by_address(tx.sender_address).unwrap().clone();
        let recipient_addr = tx.recipient_address().unwrap();

        apply(&tx, &mut repo).unwrap();
        let recipient = repo.get_by_address(recipient_addr).unwrap();
        assert_eq!(recipient.balance, 5000);
        assert_eq!(recipient.unconfirmed_balance, 5000);

        undo(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(tx.sender_address).unwrap(), &sender_before);
        assert_eq!(repo.get_by_address(recipient_addr).unwrap().balance, 0);
    }

    #[test]
    fn signature_apply_sets_second_key() {
        let mut repo = funded_repo(&[(0, 100_000)]);
        let tx = create_test_signature_tx(0);

        apply(&tx, &mut repo).unwrap();
        assert!(repo
            .get_by_address(tx.sender_address)
            .unwrap()
            .second_public_key
            .is_some());

        undo(&tx, &mut repo).unwrap();
        assert!(repo
            .get_by_address(tx.sender_address)
            .unwrap()
            .second_public_key
            .is_none());
    }

    #[test]
    fn delegate_register_undo_keeps_usernames_unique() {
        let config = create_test_config();
        let mut repo = funded_repo(&[(0, 100_000), (1, 100_000)]);
        let tx = create_test_delegate_tx(0, "validator_one");

        apply(&tx, &mut repo).unwrap();
        assert!(repo.username_taken("validator_one"));

        // A second registration for the same name must fail verification.
        let other = create_test_delegate_tx(1, "validator_one");
        let sender = repo.get_by_public_key(&other.sender_public_key).unwrap();
        assert!(verify_unconfirmed(&other, sender, &repo, &config).is_err());

        undo(&tx, &mut repo).unwrap();
        assert!(!repo.username_taken("validator_one"));
    }

    #[test]
    fn pending_username_blocks_second_register() {
        let config = create_test_config();
        let mut repo = funded_repo(&[(0, 100_000), (1, 100_000)]);
        let first = create_test_delegate_tx(0, "validator_one");
        let second = create_test_delegate_tx(1, "validator_one");

        // First registration is only staged, confirmed state is untouched.
        apply_unconfirmed(&first, &mut repo).unwrap();
        assert!(!repo.username_taken("validator_one"));

        let sender = repo.get_by_public_key(&second.sender_public_key).unwrap();
        let err = verify_unconfirmed(&second, sender, &repo, &config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransactionVerify);

        // Dropping the staged registration frees the name again.
        undo_unconfirmed(&first, &mut repo).unwrap();
        let sender = repo.get_by_public_key(&second.sender_public_key).unwrap();
        assert!(verify_unconfirmed(&second, sender, &repo, &config).is_ok());
    }

    #[test]
    fn vote_apply_undo_round_trip() {
        let config = create_test_config();
        let mut repo = funded_repo(&[(0, 100_000), (1, 100_000)]);
        // Make account 1 a delegate.
        let register = create_test_delegate_tx(1, "validator_one");
        apply(&register, &mut repo).unwrap();

        let keypair = test_keypair(0);
        let mut tx = Transaction::unsigned(
            keypair.public_key(),
            8,
            0,
            Asset::Vote {
                votes: vec![VoteItem {
                    kind: VoteKind::Up,
                    delegate: test_public_key(1),
                }],
                reward: 0,
                unstake: 0,
                airdrop_reward: AirdropReward::default(),
            },
        );
        tx.fee = calculate_fee(&tx, repo.get_by_address(tx.sender_address).unwrap(), &config);
        tx.finalize(&keypair, None).unwrap();

        let sender_before = repo.get_by_address(tx.sender_address).unwrap().clone();
        let delegate_before = repo.get_by_public_key(&test_public_key(1)).unwrap().clone();

        apply(&tx, &mut repo).unwrap();
        let sender = repo.get_by_address(tx.sender_address).unwrap();
        assert!(sender.votes.contains(&test_public_key(1)));
        let delegate = repo.get_by_public_key(&test_public_key(1)).unwrap();
        assert_eq!(delegate.delegate.as_ref().unwrap().confirmed_vote_count, 1);

        undo(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(tx.sender_address).unwrap(), &sender_before);
        assert_eq!(
            repo.get_by_public_key(&test_public_key(1)).unwrap(),
            &delegate_before
        );
    }

    #[test]
    fn stake_apply_undo_round_trip() {
        let mut repo = funded_repo(&[(0, 100_000)]);
        let keypair = test_keypair(0);
        let mut tx = Transaction::unsigned(
            keypair.public_key(),
            9,
            1,
            Asset::Stake {
                amount: 10_000,
                start_time: 9,
                airdrop_reward: AirdropReward::default(),
            },
        );
        tx.fee = 10_000 * create_test_config().fees.stake / 10_000;
        tx.finalize(&keypair, None).unwrap();
        let before = repo.get_by_address(tx.sender_address).unwrap().clone();

        apply(&tx, &mut repo).unwrap();
        let sender = repo.get_by_address(tx.sender_address).unwrap();
        assert_eq!(sender.active_stake(), 10_000);
        assert_eq!(sender.balance, 100_000 - 10_000 - tx.fee);

        undo(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(tx.sender_address).unwrap(), &before);
    }

    #[test]
    fn stake_apply_credits_sponsors() {
        let mut repo = funded_repo(&[(0, 100_000)]);
        let sponsor_addr = test_public_key(7).to_address();
        let mut sponsors = std::collections::BTreeMap::new();
        sponsors.insert(sponsor_addr, 50);
        let keypair = test_keypair(0);
        let mut tx = Transaction::unsigned(
            keypair.public_key(),
            9,
            1,
            Asset::Stake {
                amount: 10_000,
                start_time: 9,
                airdrop_reward: AirdropReward { sponsors },
            },
        );
        tx.fee = 1;
        tx.finalize(&keypair, None).unwrap();

        apply(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(sponsor_addr).unwrap().balance, 50);

        undo(&tx, &mut repo).unwrap();
        assert_eq!(repo.get_by_address(sponsor_addr).unwrap().balance, 0);
    }

    #[test]
    fn username_rules() {
        assert!(check_username("validator_one", 20).is_ok());
        assert!(check_username("a!@$&_.9", 20).is_ok());
        assert!(check_username("", 20).is_err());
        assert!(check_username("UPPER", 20).is_err());
        assert!(check_username("123456", 20).is_err());
        assert!(check_username("way_too_long_username_xxx", 20).is_err());
    }

    #[test]
    fn multisig_ready() {
        let mut repo = funded_repo(&[(0, 1000)]);
        let tx = create_test_send_tx(0, 1, 100);
        let sender = repo.get_by_address(tx.sender_address).unwrap();
        assert!(ready(&tx, sender));

        let sender = repo.get_mut_by_address(tx.sender_address).unwrap();
        sender.multisignatures = vec![test_public_key(5), test_public_key(6)];
        sender.multimin = 2;
        assert!(!ready(&tx, repo.get_by_address(tx.sender_address).unwrap()));
    }
}
