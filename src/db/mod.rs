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

//! Durable block repository interface.
//!
//! The persistent schema is owned by an external repository; the core only
//! requires the four operations below. Calls run serially on the database
//! sequence so write ordering is preserved.

use crate::{base::schema::Block, crypto::Hash, Result};
#[cfg(test)]
use mockall::automock;

/// Trait providing access to the durable block store.
#[cfg_attr(test, automock)]
pub trait BlockRepo: Send + Sync + 'static {
    /// Persist a block together with its transactions.
    fn batch_save(&mut self, block: &Block) -> Result<()>;

    /// Delete a block by identifier.
    fn delete_by_id(&mut self, id: &Hash) -> Result<()>;

    /// Load the newest `limit` blocks, oldest first.
    fn load_last_n_blocks(&self, limit: usize) -> Result<Vec<Block>>;

    /// Load `limit` blocks starting at `offset` (block count from genesis),
    /// oldest first. An empty vector marks the chain tail.
    fn load_blocks_offset(&self, limit: u64, offset: u64) -> Result<Vec<Block>>;
}
