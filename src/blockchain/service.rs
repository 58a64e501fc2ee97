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

use super::message::{BlockRequestSender, Message};
use super::pubsub::PubSub;
use super::worker::BlockWorker;
use crate::base::schema::Transaction;
use crate::base::{Mutex, RwLock};
use crate::blockchain::accounts::AccountRepository;
use crate::channel::confirmed_channel;
use crate::crypto::KeyPair;
use crate::db::BlockRepo;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Per-type fee schedule. SEND, STAKE and VOTE values are rates per ten
/// thousand (of the moved amount and of the sender's active stake
/// respectively); the rest are flat fees.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub send: u64,
    pub vote: u64,
    pub stake: u64,
    pub delegate: u64,
    pub signature: u64,
    pub register: u64,
}

/// Blockchain service configuration.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Chain epoch anchor, seconds since the Unix epoch.
    pub epoch_time: i64,
    /// Slot length in seconds.
    pub slot_interval: i64,
    /// Max number of transactions within a block.
    pub max_transactions_per_block: usize,
    /// First height at which forged-slot bookkeeping applies.
    pub min_round_block_height: u64,
    /// Version stamped on (and required of) every block.
    pub block_version: u32,
    /// In-memory block window size.
    pub max_blocks_in_memory: usize,
    /// Number of forging slots per round.
    pub active_delegates: u64,
    /// Upper bound for delegate usernames.
    pub max_username_length: usize,
    pub fees: FeeSchedule,
}

/// Block service data.
pub struct BlockService<R: BlockRepo> {
    /// Worker object.
    worker: Option<BlockWorker<R>>,
    /// Threads data.
    handler: Option<JoinHandle<BlockWorker<R>>>,
    /// To send messages to worker.
    tx_chan: BlockRequestSender,
    /// Account registry shared reference.
    registry: Arc<RwLock<AccountRepository>>,
    /// Sync-in-progress flag, toggled by the external sync loop.
    syncing: Arc<AtomicBool>,
    /// Shutdown flag consulted between replayed blocks.
    is_cleaning: Arc<AtomicBool>,
    /// To check if the worker thread is still alive.
    canary: Arc<()>,
}

impl<R: BlockRepo> BlockService<R> {
    /// Create a new blockchain service instance. `keypair` is present on
    /// forging (delegate) nodes.
    pub fn new(config: ChainConfig, repo: R, keypair: Option<KeyPair>) -> Self {
        let (tx_chan, rx_chan) = confirmed_channel::<Message, Message>();

        let config = Arc::new(config);
        let registry = Arc::new(RwLock::new(AccountRepository::new()));
        let pubsub = Arc::new(Mutex::new(PubSub::new()));
        let syncing = Arc::new(AtomicBool::new(false));
        let is_cleaning = Arc::new(AtomicBool::new(false));

        let worker = BlockWorker::new(
            config,
            registry.clone(),
            Arc::new(RwLock::new(repo)),
            pubsub,
            keypair.map(Arc::new),
            rx_chan,
            syncing.clone(),
            is_cleaning.clone(),
        );

        BlockService {
            worker: Some(worker),
            handler: None,
            tx_chan,
            registry,
            syncing,
            is_cleaning,
            canary: Arc::new(()),
        }
    }

    /// Apply the genesis block and replay the durable store. Must run
    /// before `start`; returns the number of replayed blocks.
    /// If this panics, it panics early at node boot. Not a big deal.
    pub fn bootstrap(&mut self, genesis_transactions: Vec<Transaction>) -> Result<u64> {
        self.worker
            .as_mut()
            .unwrap()
            .bootstrap(genesis_transactions)
    }

    /// Start blockchain service.
    pub fn start(&mut self) {
        debug!("Starting blockchain service");
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => {
                warn!("service was already running");
                return;
            }
        };

        let mut canary = Arc::clone(&self.canary);
        let handle = thread::spawn(move || {
            let _ = Arc::get_mut(&mut canary);
            worker.run_sync();
            worker
        });
        self.handler = Some(handle);
    }

    /// Stop blockchain service.
    pub fn stop(&mut self) {
        debug!("Stopping block service");
        match self.handler.take() {
            Some(handle) => {
                self.is_cleaning.store(true, Ordering::Relaxed);
                if let Err(err) = self.tx_chan.send_sync(Message::Stop) {
                    error!("Error stopping blockchain service thread: {:?}", err);
                }
                let worker = handle.join().unwrap();
                self.worker = Some(worker);
            }
            None => {
                debug!("service was not running");
            }
        };
    }

    /// Check if service is running.
    pub fn is_running(&self) -> bool {
        // Hack to intercept crashed subthreads.
        Arc::strong_count(&self.canary) == 2 && self.worker.is_none()
    }

    /// Get a clone of block-service input channel.
    pub fn request_channel(&self) -> BlockRequestSender {
        self.tx_chan.clone()
    }

    /// Get a shared reference to the account registry.
    pub fn registry_arc(&self) -> Arc<RwLock<AccountRepository>> {
        self.registry.clone()
    }

    /// Toggle the receive-during-sync guard.
    pub fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_send_tx;
    use crate::blockchain::executor::tests::create_repo_mock;
    use crate::db::MockBlockRepo;

    pub(crate) fn create_test_config() -> ChainConfig {
        ChainConfig {
            epoch_time: 1_451_667_600,
            slot_interval: 10,
            max_transactions_per_block: 250,
            min_round_block_height: 2,
            block_version: 1,
            max_blocks_in_memory: 100,
            active_delegates: 3,
            max_username_length: 20,
            fees: FeeSchedule {
                send: 100,
                vote: 100,
                stake: 100,
                delegate: 100,
                signature: 100,
                register: 0,
            },
        }
    }

    fn create_block_service() -> BlockService<MockBlockRepo> {
        BlockService::new(create_test_config(), create_repo_mock(), None)
    }

    #[test]
    fn start_stop() {
        let mut svc = create_block_service();

        svc.start();
        assert!(svc.is_running());

        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn stopped_subthread() {
        let mut svc = create_block_service();

        svc.start();
        assert!(svc.is_running());

        svc.tx_chan.send_sync(Message::Stop).unwrap();
        std::thread::sleep(std::time::Duration::from_secs(1));

        assert!(!svc.is_running());
        svc.stop();
    }

    #[test]
    fn bootstrap_then_start() {
        let mut svc = create_block_service();

        svc.bootstrap(vec![create_test_send_tx(9, 4, 1_000_000)])
            .unwrap();
        svc.start();
        assert!(svc.is_running());

        let registry = svc.registry_arc();
        assert!(!registry.read().is_empty());

        svc.stop();
    }
}
