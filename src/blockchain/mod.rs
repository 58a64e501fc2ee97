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

//! Blockchain service components.
//!
//! This module contains the consensus pipeline: block processing, fork
//! resolution and the two-tier transaction staging that feeds block
//! generation.
//!
//! The service exploits several sub-modules to perform specialized works, in
//! particular:
//! - dispatcher: handles incoming blockchain messages.
//! - executor: block creation, verification, application and fork handling.
//! - pool: transaction queue and unconfirmed pool.
//! - slots/rounds: forging schedule arithmetic and bookkeeping.
//! - synchronizer: hooks toward the external peer sync loop.
//!
//! External components interact with the blockchain service via message
//! passing.

pub(crate) mod dispatch;
pub(crate) mod dispatcher;
pub(crate) mod executor;
pub(crate) mod pool;
pub(crate) mod storage;

pub mod accounts;
pub mod message;
pub mod pubsub;
pub mod rounds;
pub mod service;
pub mod slots;
pub mod synchronizer;
pub mod worker;

pub use message::{
    BlockRequestReceiver, BlockRequestSender, BlockResponseReceiver, BlockResponseSender,
    DelegatePage, GetDelegatesParams, Message,
};
pub use pubsub::Event;
pub use service::{BlockService, ChainConfig, FeeSchedule};
pub use synchronizer::SyncHooks;
