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

//! Foundation types shared by the whole library.

pub mod schema;
pub mod serialize;

/// Mutex type used by the library internals.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// RwLock type used by the library internals.
pub type RwLock<T> = parking_lot::RwLock<T>;

pub use schema::{Account, Address, Block, Delegate, Round, Transaction};
