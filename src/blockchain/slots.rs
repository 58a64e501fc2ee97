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

//! Slot arithmetic.
//!
//! Time is measured in seconds relative to the chain epoch anchor; every
//! `interval` seconds open a new slot in which exactly one delegate may forge.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maps timestamps to slot numbers and round boundaries.
#[derive(Debug, Clone, Copy)]
pub struct Slots {
    /// Chain epoch anchor, seconds since the Unix epoch.
    epoch_time: i64,
    /// Slot length in seconds.
    interval: i64,
}

impl Slots {
    pub fn new(epoch_time: i64, interval: i64) -> Self {
        assert!(interval > 0, "slot interval must be positive");
        Slots {
            epoch_time,
            interval,
        }
    }

    /// Current time in slot-relative seconds.
    pub fn epoch_seconds_now(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        now - self.epoch_time
    }

    /// Slot number holding the given slot-relative time; defaults to now.
    pub fn get_slot_number(&self, time: Option<i64>) -> u64 {
        let time = time.unwrap_or_else(|| self.epoch_seconds_now());
        if time <= 0 {
            return 0;
        }
        (time / self.interval) as u64
    }

    /// Slot-relative start time of the given slot.
    pub fn get_slot_time(&self, slot: u64) -> u64 {
        slot * self.interval as u64
    }

    /// Round holding the given height: `ceil(height / active_delegates)`.
    pub fn calc_round(&self, height: u64, active_delegates: u64) -> u64 {
        assert!(active_delegates > 0, "active delegate count must be positive");
        (height + active_delegates - 1) / active_delegates
    }

    /// First slot number of the round containing `time`.
    pub fn get_first_slot_number_in_round(&self, time: Option<i64>, active_delegates: u64) -> u64 {
        let slot = self.get_slot_number(time);
        slot - slot % active_delegates
    }
}
