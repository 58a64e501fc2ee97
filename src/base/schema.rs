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

//! Chain entities: blocks, transactions, accounts, delegates and rounds.
//!
//! Identifiers and signatures are computed over hand-encoded canonical bytes
//! (`Block::to_bytes`, `Transaction::to_bytes`), never over the serde
//! representation. The fixed portion is little-endian; addresses travel as
//! 8 bytes big-endian; hex-decoded fields are appended verbatim.

use crate::{
    crypto::{Hash, KeyPair, PublicKey},
    Result,
};
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashMap};

/// Account address: first 8 bytes (big-endian) of the public key digest.
pub type Address = u64;

/// Transaction type tags. The numeric value drives the canonical sort order
/// inside a block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionType {
    #[serde(rename = "register")]
    Register = 0,
    #[serde(rename = "send")]
    Send = 10,
    #[serde(rename = "signature")]
    Signature = 20,
    #[serde(rename = "delegate")]
    Delegate = 30,
    #[serde(rename = "stake")]
    Stake = 40,
    #[serde(rename = "vote")]
    Vote = 60,
}

impl TransactionType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Transaction lifecycle tag.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "validated")]
    Validated,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "put_in_pool")]
    PutInPool,
    #[serde(rename = "unconfirm_applied")]
    UnconfirmApplied,
    #[serde(rename = "pop_for_block")]
    PopForBlock,
    #[serde(rename = "confirmed")]
    Confirmed,
}

/// Sponsor rewards derived from a stake-related transaction.
/// The computation itself is external; the core only carries and indexes the
/// resulting sponsor addresses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AirdropReward {
    /// Sponsor address to reward amount.
    pub sponsors: BTreeMap<Address, u64>,
}

/// Vote direction for a single delegate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteKind {
    #[serde(rename = "+")]
    Up,
    #[serde(rename = "-")]
    Down,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VoteItem {
    pub kind: VoteKind,
    pub delegate: PublicKey,
}

/// Type-discriminated transaction payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Asset {
    #[serde(rename = "register")]
    Register {
        /// Referral address, zero when the chain has no referrer for the sender.
        referral: Address,
    },
    #[serde(rename = "send")]
    Send {
        recipient_address: Address,
        amount: u64,
    },
    #[serde(rename = "signature")]
    Signature { second_public_key: PublicKey },
    #[serde(rename = "delegate")]
    Delegate { username: String },
    #[serde(rename = "stake")]
    Stake {
        amount: u64,
        start_time: i32,
        airdrop_reward: AirdropReward,
    },
    #[serde(rename = "vote")]
    Vote {
        votes: Vec<VoteItem>,
        /// Reward drawn while voting; non-zero marks a reward vote.
        reward: u64,
        /// Amount leaving stake; non-zero marks an unstake vote.
        unstake: u64,
        airdrop_reward: AirdropReward,
    },
}

impl Asset {
    pub fn transaction_type(&self) -> TransactionType {
        match self {
            Asset::Register { .. } => TransactionType::Register,
            Asset::Send { .. } => TransactionType::Send,
            Asset::Signature { .. } => TransactionType::Signature,
            Asset::Delegate { .. } => TransactionType::Delegate,
            Asset::Stake { .. } => TransactionType::Stake,
            Asset::Vote { .. } => TransactionType::Vote,
        }
    }

    /// Asset-specific canonical bytes, appended after the common prefix.
    fn write_bytes(&self, buf: &mut Vec<u8>) {
        match self {
            Asset::Register { referral } => {
                buf.extend_from_slice(&referral.to_be_bytes());
            }
            // Recipient and amount already live in the common prefix.
            Asset::Send { .. } => {}
            Asset::Signature { second_public_key } => {
                buf.extend_from_slice(second_public_key.as_bytes());
            }
            Asset::Delegate { username } => {
                buf.extend_from_slice(username.as_bytes());
            }
            Asset::Stake { start_time, .. } => {
                buf.extend_from_slice(&start_time.to_le_bytes());
            }
            Asset::Vote { votes, .. } => {
                for vote in votes {
                    let tag: u8 = match vote.kind {
                        VoteKind::Up => b'+',
                        VoteKind::Down => b'-',
                    };
                    buf.push(tag);
                    buf.extend_from_slice(vote.delegate.as_bytes());
                }
            }
        }
    }
}

/// A single transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Digest of the canonical bytes, signature included.
    pub id: Hash,
    pub tx_type: TransactionType,
    /// Slot-relative seconds since the epoch anchor.
    pub created_at: i32,
    pub sender_public_key: PublicKey,
    pub sender_address: Address,
    pub fee: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Present when the sender account carries a second public key.
    pub second_signature: Option<ByteBuf>,
    /// Multisig co-signatures, empty for plain senders.
    pub signatures: Vec<ByteBuf>,
    pub asset: Asset,
    /// Set on block inclusion.
    pub block_id: Option<Hash>,
    pub status: TransactionStatus,
}

impl Transaction {
    /// Build an unsigned transaction for the given payload.
    pub fn unsigned(sender_public_key: PublicKey, created_at: i32, fee: u64, asset: Asset) -> Self {
        Transaction {
            id: Hash::default(),
            tx_type: asset.transaction_type(),
            created_at,
            sender_public_key,
            sender_address: sender_public_key.to_address(),
            fee,
            signature: Vec::new(),
            second_signature: None,
            signatures: Vec::new(),
            asset,
            block_id: None,
            status: TransactionStatus::Created,
        }
    }

    /// Direct value recipient, when the type has one.
    pub fn recipient_address(&self) -> Option<Address> {
        match &self.asset {
            Asset::Send {
                recipient_address, ..
            } => Some(*recipient_address),
            _ => None,
        }
    }

    /// Value moved by the transaction: the SEND or STAKE amount.
    pub fn asset_amount(&self) -> u64 {
        match &self.asset {
            Asset::Send { amount, .. } => *amount,
            Asset::Stake { amount, .. } => *amount,
            _ => 0,
        }
    }

    /// Airdrop sponsor addresses carried by the asset.
    pub fn sponsor_addresses(&self) -> Vec<Address> {
        match &self.asset {
            Asset::Stake { airdrop_reward, .. } => airdrop_reward.sponsors.keys().copied().collect(),
            Asset::Vote {
                reward,
                unstake,
                airdrop_reward,
                ..
            } if *reward > 0 || *unstake > 0 => {
                airdrop_reward.sponsors.keys().copied().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Canonical byte encoding.
    ///
    /// Layout: type u8, createdAt i32 LE, senderPublicKey 32B,
    /// recipientAddress 8B BE (zero when absent), amount u64 LE, asset bytes,
    /// then signature and second signature unless skipped.
    pub fn to_bytes(&self, skip_signature: bool, skip_second_signature: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.push(self.tx_type.as_u8());
        buf.extend_from_slice(&self.created_at.to_le_bytes());
        buf.extend_from_slice(self.sender_public_key.as_bytes());
        buf.extend_from_slice(&self.recipient_address().unwrap_or(0).to_be_bytes());
        buf.extend_from_slice(&self.asset_amount().to_le_bytes());
        self.asset.write_bytes(&mut buf);
        if !skip_signature {
            buf.extend_from_slice(&self.signature);
        }
        if !skip_second_signature {
            if let Some(ref second) = self.second_signature {
                buf.extend_from_slice(second);
            }
        }
        buf
    }

    /// Digest of the full canonical bytes.
    pub fn compute_id(&self) -> Hash {
        Hash::from_data(&self.to_bytes(false, false))
    }

    /// Sign with the sender key (and optionally the second key), then derive
    /// the identifier.
    pub fn finalize(&mut self, keypair: &KeyPair, second: Option<&KeyPair>) -> Result<()> {
        self.signature = keypair.sign(&self.to_bytes(true, true))?;
        if let Some(second) = second {
            let sig = second.sign(&self.to_bytes(false, true))?;
            self.second_signature = Some(ByteBuf::from(sig));
        }
        self.id = self.compute_id();
        self.status = TransactionStatus::Validated;
        Ok(())
    }
}

/// Block structure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    /// Digest of the canonical bytes, signature included.
    pub id: Hash,
    pub version: u32,
    /// Strictly monotonic from 1 (genesis).
    pub height: u64,
    /// `None` only for the genesis block.
    pub previous_block_id: Option<Hash>,
    /// Slot-relative seconds since the epoch anchor.
    pub created_at: i32,
    pub transaction_count: u32,
    /// Sum of SEND asset amounts.
    pub amount: u64,
    /// Sum of transaction fees.
    pub fee: u64,
    /// Streaming digest over the ordered transaction bytes.
    pub payload_hash: Hash,
    pub generator_public_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Canonical byte encoding.
    ///
    /// Layout (little-endian fixed portion, then appended fields):
    /// version u32, createdAt i32, transactionCount u32, amount u64, fee u64,
    /// previousBlockId (empty when null), payloadHash 32B,
    /// generatorPublicKey 32B, signature 64B (omitted for the signing hash).
    pub fn to_bytes(&self, skip_signature: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.created_at.to_le_bytes());
        buf.extend_from_slice(&self.transaction_count.to_le_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(&self.fee.to_le_bytes());
        if let Some(ref prev) = self.previous_block_id {
            buf.extend_from_slice(prev.as_bytes());
        }
        buf.extend_from_slice(self.payload_hash.as_bytes());
        buf.extend_from_slice(self.generator_public_key.as_bytes());
        if !skip_signature {
            buf.extend_from_slice(&self.signature);
        }
        buf
    }

    /// Digest over the signing bytes (signature excluded).
    pub fn signing_hash(&self) -> Hash {
        Hash::from_data(&self.to_bytes(true))
    }

    /// Digest of the full canonical bytes.
    pub fn compute_id(&self) -> Hash {
        Hash::from_data(&self.to_bytes(false))
    }
}

/// Stake order held by an account. Vote fees depend on the active orders.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Stake {
    pub created_at: i32,
    pub amount: u64,
    pub vote_count: u32,
    pub active: bool,
}

/// Delegate record attached to an account that registered a username.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Delegate {
    /// Lowercase, 1-20 chars, `[a-z0-9!@$&_.]+`, not purely numeric.
    pub username: String,
    pub public_key: PublicKey,
    pub missed_blocks: u32,
    pub forged_blocks: u32,
    pub votes: i64,
    pub confirmed_vote_count: u64,
    pub approval: f64,
}

impl Delegate {
    pub fn new(username: String, public_key: PublicKey) -> Self {
        Delegate {
            username,
            public_key,
            missed_blocks: 0,
            forged_blocks: 0,
            votes: 0,
            confirmed_vote_count: 0,
            approval: 0.0,
        }
    }
}

/// Account state. `balance` is the confirmed value; `unconfirmed_balance`
/// mirrors it through the pending pool applies and is restored bit-exact by
/// the undo path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Account {
    pub address: Address,
    /// May be learned lazily from a first outbound transaction.
    pub public_key: Option<PublicKey>,
    pub second_public_key: Option<PublicKey>,
    pub balance: u64,
    pub unconfirmed_balance: u64,
    pub votes: Vec<PublicKey>,
    pub stakes: Vec<Stake>,
    pub delegate: Option<Delegate>,
    pub multisignatures: Vec<PublicKey>,
    pub multimin: u32,
}

impl Account {
    pub fn new(address: Address, public_key: Option<PublicKey>) -> Self {
        Account {
            address,
            public_key,
            second_public_key: None,
            balance: 0,
            unconfirmed_balance: 0,
            votes: Vec::new(),
            stakes: Vec::new(),
            delegate: None,
            multisignatures: Vec::new(),
            multimin: 0,
        }
    }

    /// Total amount sitting in active stake orders.
    pub fn active_stake(&self) -> u64 {
        self.stakes
            .iter()
            .filter(|stake| stake.active)
            .map(|stake| stake.amount)
            .sum()
    }
}

/// Per-delegate slot assignment within a round.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSlot {
    /// Absolute slot number.
    pub slot: u64,
    pub is_forged: bool,
}

/// A forging round: one slot per active delegate, assigned by a deterministic
/// shuffle so every honest node derives the identical schedule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Round {
    pub slots: HashMap<PublicKey, RoundSlot>,
    pub start_height: u64,
}

impl Round {
    /// Slot assigned to the given generator, if it belongs to the round.
    pub fn generator_slot(&self, public_key: &PublicKey) -> Option<u64> {
        self.slots.get(public_key).map(|slot| slot.slot)
    }

    /// First absolute slot number of the round.
    pub fn first_slot(&self) -> Option<u64> {
        self.slots.values().map(|slot| slot.slot).min()
    }

    /// Last absolute slot number of the round.
    pub fn last_slot(&self) -> Option<u64> {
        self.slots.values().map(|slot| slot.slot).max()
    }
}
