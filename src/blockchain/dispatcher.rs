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

//! Blockchain component in charge of handling messages submitted via the
//! message queue exposed by the blockchain service.
//!
//! Messages can come from both internal and external components. When a
//! message arrives from a network interface its payload is passed "as-is"
//! using the `Packed` type and is assumed to use MessagePack format.
//!
//! The dispatcher runs on the worker's consensus sequence: handlers execute
//! one at a time, so mempool and registry mutations need no extra ordering.

use super::message::{DelegatePage, GetDelegatesParams, Message, MultiMessage};
use super::pool::Mempool;
use super::pubsub::{Event, PubSub};
use super::synchronizer::SyncHooks;
use crate::base::schema::{Delegate, Transaction};
use crate::base::serialize::{rmp_deserialize, rmp_serialize};
use crate::base::{Mutex, RwLock};
use crate::blockchain::accounts::AccountRepository;
use crate::{Error, ErrorKind, ResponseEntity};
use std::sync::Arc;

/// Validation failure prefix surfaced verbatim to the caller.
const GET_DELEGATES_INVALID: &str = "IS NOT VALID REQUEST:'GET_DELEGATES'... ";

/// Dispatcher context data.
pub(crate) struct Dispatcher {
    registry: Arc<RwLock<AccountRepository>>,
    mempool: Arc<RwLock<Mempool>>,
    pubsub: Arc<Mutex<PubSub>>,
    sync: Arc<dyn SyncHooks>,
}

impl Clone for Dispatcher {
    fn clone(&self) -> Self {
        Dispatcher {
            registry: self.registry.clone(),
            mempool: self.mempool.clone(),
            pubsub: self.pubsub.clone(),
            sync: self.sync.clone(),
        }
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<AccountRepository>>,
        mempool: Arc<RwLock<Mempool>>,
        pubsub: Arc<Mutex<PubSub>>,
        sync: Arc<dyn SyncHooks>,
    ) -> Self {
        Dispatcher {
            registry,
            mempool,
            pubsub,
            sync,
        }
    }

    /// Stage a transaction through the queue worker. Promoted transactions
    /// are relayed to peers and announced on the event bus.
    fn put_transaction_handler(&self, tx: Transaction, event: Event) -> Message {
        let hash = tx.id;
        debug!("Received transaction: {}", hash);

        let promoted = {
            let mut mempool = self.mempool.write();
            mempool.queue_push(tx);
            mempool.process_queue()
        };

        match promoted.iter().find(|tx| tx.id == hash) {
            Some(tx) => {
                self.sync.relay_transaction(tx);
                let mut pubsub = self.pubsub.lock();
                if pubsub.has_subscribers(event) {
                    let msg = if event == Event::TRANSACTION_CREATE {
                        Message::TransactionCreate { tx: tx.clone() }
                    } else {
                        Message::TransactionReceive { tx: tx.clone() }
                    };
                    pubsub.publish(event, msg);
                }
                Message::TransactionResponse { hash }
            }
            None => Message::Exception(Error::new_ext(
                ErrorKind::TransactionVerify,
                "transaction was not admitted to the pool",
            )),
        }
    }

    fn get_delegates_handler(&self, params: GetDelegatesParams) -> Message {
        Message::GetDelegatesResponse(self.get_delegates(params))
    }

    /// Validate, filter, sort and page the delegate listing.
    fn get_delegates(&self, params: GetDelegatesParams) -> ResponseEntity<DelegatePage> {
        let limit = match params.limit {
            None => {
                return ResponseEntity::fail_one(format!(
                    "{}Missing required property: limit",
                    GET_DELEGATES_INVALID
                ))
            }
            Some(limit) if !(1..=100).contains(&limit) => {
                return ResponseEntity::fail_one(format!(
                    "{}Value {} is out of range [1, 100]: limit",
                    GET_DELEGATES_INVALID, limit
                ))
            }
            Some(limit) => limit as usize,
        };
        let offset = params.offset.unwrap_or(0) as usize;
        if let Some(ref username) = params.username {
            if username.len() < 3 {
                return ResponseEntity::fail_one(format!(
                    "{}String is too short (minimum 3): username",
                    GET_DELEGATES_INVALID
                ));
            }
        }
        if let Some(ref sort) = params.sort {
            for (field, order) in sort {
                if !matches!(
                    field.as_str(),
                    "username" | "votes" | "publicKey" | "approval" | "missedBlocks"
                        | "forgedBlocks"
                ) {
                    return ResponseEntity::fail_one(format!(
                        "{}Unknown sort field: {}",
                        GET_DELEGATES_INVALID, field
                    ));
                }
                if order != "ASC" && order != "DESC" {
                    return ResponseEntity::fail_one(format!(
                        "{}Unknown sort order: {}",
                        GET_DELEGATES_INVALID, order
                    ));
                }
            }
        }

        let mut delegates = self.registry.read().delegates();
        if let Some(ref username) = params.username {
            delegates.retain(|delegate| delegate.username.starts_with(username.as_str()));
        }
        // Pinned base order so pagination is total: public key ascending.
        delegates.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        if let Some(ref sort) = params.sort {
            // Apply keys in reverse so the first pair dominates; each pass is
            // a stable sort.
            for (field, order) in sort.iter().rev() {
                delegates.sort_by(|a, b| {
                    let ord = compare_delegates(a, b, field);
                    if order == "DESC" {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }

        let count = delegates.len();
        let delegates: Vec<Delegate> =
            delegates.into_iter().skip(offset).take(limit).collect();
        ResponseEntity::ok(DelegatePage { delegates, count })
    }

    fn packed_message_handler(&self, buf: Vec<u8>) -> Option<Message> {
        trace!("RX ({}): {}", buf.len(), hex::encode(&buf));
        const ARRAY_HIGH_NIBBLE: u8 = 0x90;

        // Be sure that the client is using anonymous serialization format.
        let tag = buf.first().cloned().unwrap_or_default();
        if (tag & ARRAY_HIGH_NIBBLE) != ARRAY_HIGH_NIBBLE {
            let err = Error::new_ext(
                ErrorKind::MalformedData,
                "expected anonymous serialization format",
            );
            return Some(Message::Exception(err));
        }

        let res = match rmp_deserialize(&buf) {
            Ok(MultiMessage::Simple(req)) => self.message_handler(req).map(MultiMessage::Simple),
            Ok(MultiMessage::Sequence(requests)) => {
                let mut responses = Vec::with_capacity(requests.len());
                for req in requests.into_iter() {
                    if let Some(res) = self.message_handler(req) {
                        responses.push(res);
                    };
                }
                match responses.is_empty() {
                    true => None,
                    false => Some(MultiMessage::Sequence(responses)),
                }
            }
            Err(_err) => {
                let res = Message::Exception(ErrorKind::MalformedData.into());
                Some(MultiMessage::Simple(res))
            }
        };
        res.map(|res| {
            let buf = rmp_serialize(&res).unwrap_or_default();
            trace!("TX ({}): {}", buf.len(), hex::encode(&buf));
            Message::Packed { buf }
        })
    }

    /// Handle one message, returning the response when the type has one.
    /// Subscription management needs the response channel and is handled by
    /// the worker before delegation.
    pub fn message_handler(&self, req: Message) -> Option<Message> {
        match req {
            Message::TransactionCreate { tx } => {
                Some(self.put_transaction_handler(tx, Event::TRANSACTION_CREATE))
            }
            Message::TransactionReceive { tx } => {
                // Peer relays do not expect a confirmation.
                self.put_transaction_handler(tx, Event::TRANSACTION_RECEIVE);
                None
            }
            Message::GetDelegatesRequest { params } => Some(self.get_delegates_handler(params)),
            Message::Packed { buf } => self.packed_message_handler(buf),
            _ => None,
        }
    }

    pub fn subscribe(&self, id: String, events: Event, chan: super::message::BlockResponseSender) {
        self.pubsub.lock().subscribe(id, events, chan);
    }

    pub fn unsubscribe(&self, id: String, events: Event) {
        self.pubsub.lock().unsubscribe(id, events);
    }
}

fn compare_delegates(a: &Delegate, b: &Delegate, field: &str) -> std::cmp::Ordering {
    match field {
        "username" => a.username.cmp(&b.username),
        "votes" => a.votes.cmp(&b.votes),
        "publicKey" => a.public_key.cmp(&b.public_key),
        "approval" => a
            .approval
            .partial_cmp(&b.approval)
            .unwrap_or(std::cmp::Ordering::Equal),
        "missedBlocks" => a.missed_blocks.cmp(&b.missed_blocks),
        "forgedBlocks" => a.forged_blocks.cmp(&b.forged_blocks),
        _ => std::cmp::Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_send_tx;
    use crate::blockchain::service::tests::create_test_config;
    use crate::blockchain::synchronizer::EventSync;
    use crate::crypto::sign::tests::test_public_key;

    fn create_dispatcher(funded: &[(u8, u64)], delegates: &[(u8, &str, i64)]) -> Dispatcher {
        let mut registry = AccountRepository::new();
        for &(index, balance) in funded {
            let account = registry.add(test_public_key(index));
            account.balance = balance;
            account.unconfirmed_balance = balance;
        }
        for &(index, username, votes) in delegates {
            let public_key = test_public_key(index);
            let account = registry.add(public_key);
            let mut delegate = Delegate::new(username.to_string(), public_key);
            delegate.votes = votes;
            account.delegate = Some(delegate);
        }
        let registry = Arc::new(RwLock::new(registry));
        let config = Arc::new(create_test_config());
        let mempool = Arc::new(RwLock::new(Mempool::new(registry.clone(), config)));
        let pubsub = Arc::new(Mutex::new(PubSub::new()));
        let sync = Arc::new(EventSync::new(pubsub.clone()));
        Dispatcher::new(registry, mempool, pubsub, sync)
    }

    fn delegates_fixture() -> Vec<(u8, &'static str, i64)> {
        vec![
            (10, "delegate1", 2),
            (11, "delegate2", 0),
            (12, "delegate3", 0),
            (13, "delegate4", 0),
        ]
    }

    fn get_delegates(dispatcher: &Dispatcher, params: GetDelegatesParams) -> ResponseEntity<DelegatePage> {
        match dispatcher.message_handler(Message::GetDelegatesRequest { params }) {
            Some(Message::GetDelegatesResponse(res)) => res,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn transaction_create_stages_and_confirms() {
        let dispatcher = create_dispatcher(&[(0, 100_000)], &[]);
        let tx = create_test_send_tx(0, 1, 5000);
        let hash = tx.id;

        let res = dispatcher.message_handler(Message::TransactionCreate { tx });

        assert_eq!(res, Some(Message::TransactionResponse { hash }));
        assert!(dispatcher.mempool.read().contains(&hash));
    }

    #[test]
    fn invalid_transaction_returns_exception() {
        let dispatcher = create_dispatcher(&[(0, 100_000)], &[]);
        let mut tx = create_test_send_tx(0, 1, 5000);
        tx.signature[0] ^= 0xFF;
        tx.id = tx.compute_id();

        let res = dispatcher.message_handler(Message::TransactionCreate { tx });

        assert!(matches!(res, Some(Message::Exception(_))));
        assert!(dispatcher.mempool.read().is_empty());
    }

    #[test]
    fn get_delegates_sorted_by_votes() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(3),
            offset: Some(0),
            username: None,
            sort: Some(vec![("votes".to_string(), "DESC".to_string())]),
        };

        let res = get_delegates(&dispatcher, params);

        assert!(res.success());
        let page = res.data.unwrap();
        assert_eq!(page.count, 4);
        assert_eq!(page.delegates.len(), 3);
        assert_eq!(page.delegates[0].username, "delegate1");
        // Remaining entries keep the pinned base order.
        let mut rest: Vec<&str> = page.delegates[1..]
            .iter()
            .map(|d| d.username.as_str())
            .collect();
        rest.sort_unstable();
        assert!(rest.iter().all(|name| *name != "delegate1"));
    }

    #[test]
    fn get_delegates_empty_page_keeps_count() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(10),
            offset: Some(5),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        assert!(res.success());
        let page = res.data.unwrap();
        assert!(page.delegates.is_empty());
        assert_eq!(page.count, 4);
    }

    #[test]
    fn get_delegates_missing_limit() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            offset: Some(0),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        assert!(!res.success());
        assert_eq!(
            res.errors,
            vec!["IS NOT VALID REQUEST:'GET_DELEGATES'... Missing required property: limit"
                .to_string()]
        );
    }

    #[test]
    fn get_delegates_limit_out_of_range() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(101),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        assert!(!res.success());
        assert!(res.errors[0].contains("out of range"));
    }

    #[test]
    fn get_delegates_short_username_filter() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(10),
            username: Some("de".to_string()),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        assert!(!res.success());
        assert!(res.errors[0].contains("too short"));
    }

    #[test]
    fn get_delegates_username_prefix_filter() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(10),
            username: Some("delegate1".to_string()),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        let page = res.data.unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.delegates[0].username, "delegate1");
    }

    #[test]
    fn get_delegates_default_sort_is_public_key() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let params = GetDelegatesParams {
            limit: Some(10),
            ..Default::default()
        };

        let res = get_delegates(&dispatcher, params);

        let page = res.data.unwrap();
        let keys: Vec<_> = page.delegates.iter().map(|d| d.public_key).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn packed_message_round_trips_through_handler() {
        let dispatcher = create_dispatcher(&[], &delegates_fixture());
        let inner = Message::GetDelegatesRequest {
            params: GetDelegatesParams {
                limit: Some(1),
                ..Default::default()
            },
        };
        let buf = rmp_serialize(&inner).unwrap();

        let res = dispatcher.message_handler(Message::Packed { buf }).unwrap();

        match res {
            Message::Packed { buf } => {
                let inner: Message = rmp_deserialize(&buf).unwrap();
                assert!(matches!(inner, Message::GetDelegatesResponse(_)));
            }
            _ => panic!("unexpected"),
        }
    }

    #[test]
    fn packed_message_rejects_named_format() {
        let dispatcher = create_dispatcher(&[], &[]);

        let res = dispatcher
            .message_handler(Message::Packed { buf: vec![0x81] })
            .unwrap();

        assert!(matches!(res, Message::Exception(_)));
    }
}
