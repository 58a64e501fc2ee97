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

//! In-memory account registry.
//!
//! Single-owner dictionary keyed by address with a secondary index by public
//! key. Mutated only by the transaction handlers running on the consensus
//! sequence; rebuilt deterministically from genesis on startup.

use crate::base::schema::{Account, Address, Delegate};
use crate::crypto::PublicKey;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct AccountRepository {
    accounts: HashMap<Address, Account>,
    by_public_key: HashMap<PublicKey, Address>,
    /// Usernames claimed by pending delegate registrations: the unconfirmed
    /// mirror of the registered set, reversible like `unconfirmed_balance`.
    unconfirmed_usernames: HashSet<String>,
}

impl AccountRepository {
    pub fn new() -> Self {
        AccountRepository::default()
    }

    pub fn get_by_address(&self, address: Address) -> Option<&Account> {
        self.accounts.get(&address)
    }

    pub fn get_mut_by_address(&mut self, address: Address) -> Option<&mut Account> {
        self.accounts.get_mut(&address)
    }

    pub fn get_by_public_key(&self, public_key: &PublicKey) -> Option<&Account> {
        self.by_public_key
            .get(public_key)
            .and_then(|address| self.accounts.get(address))
    }

    /// Register an account for the given public key. Idempotent: an existing
    /// entry just learns the public key when it was created as an address-only
    /// stub.
    pub fn add(&mut self, public_key: PublicKey) -> &mut Account {
        let address = public_key.to_address();
        let account = self
            .accounts
            .entry(address)
            .or_insert_with(|| Account::new(address, Some(public_key)));
        if account.public_key.is_none() {
            account.public_key = Some(public_key);
        }
        self.by_public_key.insert(public_key, address);
        account
    }

    /// Fetch the sender account, creating an address-keyed stub with the
    /// newly learned public key when unknown.
    pub fn resolve_sender(&mut self, public_key: PublicKey) -> &mut Account {
        self.add(public_key)
    }

    /// Fetch the account for a bare address, creating a stub without a public
    /// key when unknown (value can arrive before the first outbound
    /// transaction reveals the key).
    pub fn resolve_address(&mut self, address: Address) -> &mut Account {
        self.accounts
            .entry(address)
            .or_insert_with(|| Account::new(address, None))
    }

    /// Attach (or detach, with `None`) a delegate record to the account.
    pub fn attach_delegate(&mut self, address: Address, delegate: Option<Delegate>) {
        if let Some(account) = self.accounts.get_mut(&address) {
            account.delegate = delegate;
        }
    }

    /// True when some account already registered the username.
    pub fn username_taken(&self, username: &str) -> bool {
        self.accounts
            .values()
            .any(|account| matches!(&account.delegate, Some(d) if d.username == username))
    }

    /// Claim a username for a pending registration.
    pub fn reserve_username(&mut self, username: String) {
        self.unconfirmed_usernames.insert(username);
    }

    /// Drop a pending registration claim.
    pub fn release_username(&mut self, username: &str) {
        self.unconfirmed_usernames.remove(username);
    }

    /// True when a pending registration already claims the username.
    pub fn username_reserved(&self, username: &str) -> bool {
        self.unconfirmed_usernames.contains(username)
    }

    /// All delegate records, unordered.
    pub fn delegates(&self) -> Vec<Delegate> {
        self.accounts
            .values()
            .filter_map(|account| account.delegate.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
