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

//! Round schedule generation and bookkeeping.
//!
//! The active delegate list is shuffled with a PCG generator seeded on the
//! round number, so every honest node derives the identical slot assignment
//! without any exchange.

use crate::base::schema::{Round, RoundSlot};
use crate::crypto::PublicKey;
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use std::sync::atomic::{AtomicBool, Ordering};

/// Round repository: the schedule currently in force plus the tick guard
/// consulted by the receive path.
#[derive(Default)]
pub struct RoundService {
    /// Round currently in force, when one has been generated.
    current: Option<Round>,
    /// Set while a round transition is being applied.
    ticking: AtomicBool,
}

impl RoundService {
    pub fn new() -> Self {
        RoundService::default()
    }

    pub fn current(&self) -> Option<&Round> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, round: Round) {
        self.current = Some(round);
    }

    pub fn forget_current(&mut self) {
        self.current = None;
    }

    pub fn ticking(&self) -> bool {
        self.ticking.load(Ordering::Relaxed)
    }

    pub fn set_ticking(&self, value: bool) {
        self.ticking.store(value, Ordering::Relaxed);
    }

    /// Build the round starting at `first_slot`.
    ///
    /// `delegates` is the ordered active delegate list (username order); the
    /// schedule is a Fisher-Yates shuffle of it keyed on the round number, so
    /// the outcome is a pure function of `(round_number, delegates)`.
    pub fn generate(
        &self,
        first_slot: u64,
        start_height: u64,
        round_number: u64,
        delegates: &[PublicKey],
    ) -> Round {
        let mut order: Vec<PublicKey> = delegates.to_vec();
        let mut rng = Pcg32::seed_from_u64(round_number);
        for i in (1..order.len()).rev() {
            let j = (rng.next_u64() % (i as u64 + 1)) as usize;
            order.swap(i, j);
        }

        let mut round = Round {
            start_height,
            ..Default::default()
        };
        for (index, public_key) in order.into_iter().enumerate() {
            round.slots.insert(
                public_key,
                RoundSlot {
                    slot: first_slot + index as u64,
                    is_forged: false,
                },
            );
        }
        round
    }

    /// Mark the generator's slot as forged.
    pub fn mark_forged(&mut self, public_key: &PublicKey) {
        if let Some(round) = self.current.as_mut() {
            if let Some(slot) = round.slots.get_mut(public_key) {
                slot.is_forged = true;
            }
        }
    }

    /// Clear the generator's forged mark. Used when its block is deleted.
    pub fn unset_forged(&mut self, public_key: &PublicKey) {
        if let Some(round) = self.current.as_mut() {
            if let Some(slot) = round.slots.get_mut(public_key) {
                slot.is_forged = false;
            }
        }
    }

    /// Restore round state to the given slot: forged marks for later slots
    /// are cleared, and if the slot precedes the round the schedule itself is
    /// dropped so the caller regenerates it.
    pub fn restore_to_slot(&mut self, slot: u64) {
        let drop_round = match self.current.as_mut() {
            Some(round) => {
                if round.first_slot().map_or(false, |first| slot < first) {
                    true
                } else {
                    for entry in round.slots.values_mut() {
                        if entry.slot > slot {
                            entry.is_forged = false;
                        }
                    }
                    false
                }
            }
            None => false,
        };
        if drop_round {
            self.current = None;
        }
    }
}
