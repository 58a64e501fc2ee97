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

//! Sliding window over the newest blocks.
//!
//! Keeps the last N blocks in memory for the receive decision tree and fork
//! handling; anything older lives only in the durable repository.

use crate::base::schema::Block;
use crate::crypto::Hash;

/// In-memory block window.
pub struct BlockStorage {
    /// Newest blocks, oldest first.
    window: Vec<Block>,
    /// Window capacity.
    capacity: usize,
}

impl BlockStorage {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "block window capacity must be positive");
        BlockStorage {
            window: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Reference to the chain tip, when the chain is not empty.
    pub fn get_last(&self) -> Option<&Block> {
        self.window.last()
    }

    /// Append a block, evicting the oldest entry beyond capacity.
    pub fn push(&mut self, block: Block) {
        self.window.push(block);
        if self.window.len() > self.capacity {
            self.window.remove(0);
        }
    }

    /// Remove and return the tip.
    pub fn pop_last(&mut self) -> Option<Block> {
        self.window.pop()
    }

    /// Membership over the window.
    pub fn has(&self, id: &Hash) -> bool {
        self.window.iter().any(|block| block.id == *id)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::schema::tests::create_test_block;

    fn block_with_id(height: u64) -> Block {
        let mut block = create_test_block(height, None, 0);
        block.id = Hash::from_data(&height.to_le_bytes());
        block
    }

    #[test]
    fn push_and_get_last() {
        let mut storage = BlockStorage::new(3);

        storage.push(block_with_id(1));
        storage.push(block_with_id(2));

        assert_eq!(storage.get_last().unwrap().height, 2);
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut storage = BlockStorage::new(3);
        for height in 1..=5 {
            storage.push(block_with_id(height));
        }

        assert_eq!(storage.len(), 3);
        assert!(!storage.has(&Hash::from_data(&1u64.to_le_bytes())));
        assert!(storage.has(&Hash::from_data(&5u64.to_le_bytes())));
    }

    #[test]
    fn pop_last_returns_prior_tip() {
        let mut storage = BlockStorage::new(3);
        storage.push(block_with_id(1));
        storage.push(block_with_id(2));

        let popped = storage.pop_last().unwrap();

        assert_eq!(popped.height, 2);
        assert_eq!(storage.get_last().unwrap().height, 1);
    }

    #[test]
    fn empty_storage() {
        let mut storage = BlockStorage::new(3);

        assert!(storage.is_empty());
        assert!(storage.get_last().is_none());
        assert!(storage.pop_last().is_none());
    }
}
