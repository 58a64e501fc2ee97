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

//! Messages exchanged with the blockchain service.
//!
//! Message elements defined as "packed" are structures serialized in
//! MessagePack format.

use super::pubsub::Event;
use crate::{
    base::schema::{Block, Delegate, Transaction},
    channel,
    crypto::Hash,
    Error, ResponseEntity,
};

/// `GET_DELEGATES` request parameters. `limit` is required by the schema;
/// the validation error surfaces through the response envelope.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Default)]
pub struct GetDelegatesParams {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub username: Option<String>,
    /// `[field, "ASC"|"DESC"]` pairs.
    pub sort: Option<Vec<(String, String)>>,
}

/// `GET_DELEGATES` response payload.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DelegatePage {
    pub delegates: Vec<Delegate>,
    /// Total matching delegates, before paging.
    pub count: usize,
}

/// Message types enumeration.
///
/// Enum variants are internally tagged as strings.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Exception response used for the full set of messages.
    #[serde(rename = "0")]
    Exception(Error),
    /// Subscribe to a set of blockchain events.
    #[serde(rename = "1")]
    Subscribe {
        /// Subscriber identifier.
        id: String,
        /// Events set (bitflags).
        events: Event,
    },
    /// Unsubscribe from a set of blockchain events.
    #[serde(rename = "2")]
    Unsubscribe {
        /// Subscriber identifier.
        id: String,
        /// Events set (bitflags).
        events: Event,
    },
    /// Locally created transaction entering the node.
    #[serde(rename = "3")]
    TransactionCreate { tx: Transaction },
    /// Peer-relayed transaction entering the node.
    #[serde(rename = "4")]
    TransactionReceive { tx: Transaction },
    /// Transaction staging confirmation.
    #[serde(rename = "5")]
    TransactionResponse { hash: Hash },
    /// Peer-produced block entering the receive decision tree.
    #[serde(rename = "6")]
    BlockReceive { block: Block },
    /// Block produced by the local delegate.
    #[serde(rename = "7")]
    BlockGenerate { block: Block },
    /// Delegate listing request.
    #[serde(rename = "8")]
    GetDelegatesRequest { params: GetDelegatesParams },
    /// Delegate listing response.
    #[serde(rename = "9")]
    GetDelegatesResponse(ResponseEntity<DelegatePage>),
    /// A block joined the chain tip.
    #[serde(rename = "10")]
    NewBlocks { block: Block },
    /// A block was applied to account state.
    #[serde(rename = "11")]
    ApplyBlock { block: Block },
    /// A block was rolled back.
    #[serde(rename = "12")]
    UndoBlock { block: Block },
    /// The receive path found a height gap; the sync loop should fetch from
    /// peers starting at the local height.
    #[serde(rename = "13")]
    EmitSyncBlocks { height: u64 },
    /// Startup replay completed.
    #[serde(rename = "14")]
    BlockchainReady,
    /// Stop blockchain service.
    #[serde(rename = "254")]
    Stop,
    /// Packed message serialized using MessagePack.
    #[serde(rename = "255")]
    Packed {
        /// Serialized message bytes.
        #[serde(with = "serde_bytes")]
        buf: Vec<u8>,
    },
}

/// Helper structure to transparently deserialize both single and vector of
/// messages. Internally used to unwrap the content of `Packed` messages.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum MultiMessage {
    /// Simple message.
    Simple(Message),
    /// Vector of messages.
    Sequence(Vec<Message>),
}

/// Blockchain request sender alias.
pub type BlockRequestSender = channel::RequestSender<Message, Message>;

/// Blockchain request receiver alias.
pub type BlockRequestReceiver = channel::RequestReceiver<Message, Message>;

/// Blockchain response sender alias.
pub type BlockResponseSender = channel::Sender<Message>;

/// Blockchain response receiver alias.
pub type BlockResponseReceiver = channel::Receiver<Message>;
