// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A poll multiplexer.
//!
//! `Cadence` lets you wrap a single periodic poll and treat it as several
//! independent periodic tasks, each running at its own rate. The tasks
//! correspond to variants of an enum type, to make it easy to tell them
//! apart.
//!
//! The expected usage model is:
//!
//! - Create an `enum` type naming your tasks, and derive the `Enum` trait
//!   (from the `enum_map` crate) for it.
//!
//! - Create a `Cadence<YourEnumType>` with the main polling rate.
//!
//! - `register` each task with a rate that evenly divides the polling rate.
//!
//! - Each time the main poll runs, call `Cadence::tick`, then process the
//!   tasks that came due with `Cadence::iter_fired`.
//!
//! Rates are whole hertz. A task registered at the polling rate runs on every
//! poll; a task at half the polling rate runs on every other poll, and so on.
//! All tasks run on the very first poll.

#![cfg_attr(not(test), no_std)]

use enum_map::{EnumArray, EnumMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CadenceError {
    /// The requested rate is zero, exceeds the polling rate, or does not
    /// divide it evenly.
    BadRate,
}

pub struct Cadence<E: EnumArray<Slot>> {
    rate_hz: u32,
    counter: u32,
    slots: EnumMap<E, Slot>,
}

impl<E: EnumArray<Slot> + Copy> Cadence<E> {
    /// Creates a cadence driven by a poll that runs `rate_hz` times per
    /// second. No tasks are registered.
    pub fn new(rate_hz: u32) -> Self {
        Self {
            rate_hz,
            counter: 0,
            slots: EnumMap::default(),
        }
    }

    /// Schedules `which` to run `rate_hz` times per second. This replaces any
    /// prior registration for the task.
    pub fn register(
        &mut self,
        which: E,
        rate_hz: u32,
    ) -> Result<(), CadenceError> {
        let interval = interval_for(self.rate_hz, rate_hz)?;

        // If the task has previously come due without us noticing it,
        // preserve that across register.
        let fired_but_not_observed = self.slots[which].fired_but_not_observed;
        self.slots[which] = Slot {
            interval: Some(interval),
            fired_but_not_observed,
        };
        Ok(())
    }

    /// Stops running `which`. Returns `true` if it was registered.
    pub fn clear(&mut self, which: E) -> bool {
        let slot = &mut self.slots[which];
        slot.fired_but_not_observed = false;
        slot.interval.take().is_some()
    }

    /// Returns the number of polls between runs of `which`, if registered.
    pub fn interval(&self, which: E) -> Option<u32> {
        self.slots[which].interval
    }

    /// Records one run of the main poll, marking every task whose interval
    /// divides the current poll count as due. The poll count then advances.
    ///
    /// Due tasks can be read out (destructively) using `iter_fired()`.
    pub fn tick(&mut self) {
        let counter = self.counter;
        for slot in self.slots.values_mut() {
            if let Some(interval) = slot.interval {
                if counter % interval == 0 {
                    slot.fired_but_not_observed = true;
                }
            }
        }
        self.counter = self.counter.wrapping_add(1);
    }

    /// Returns an iterator over the tasks that have come due since the last
    /// time they were observed. Each task is yielded once; its due flag is
    /// cleared as it is yielded.
    pub fn iter_fired(&mut self) -> impl Iterator<Item = E> + '_ {
        self.slots.iter_mut().filter_map(|(e, slot)| {
            if core::mem::replace(&mut slot.fired_but_not_observed, false) {
                Some(e)
            } else {
                None
            }
        })
    }

    /// Number of polls recorded so far.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The main polling rate in hertz.
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Time between polls, in milliseconds.
    pub fn period_ms(&self) -> u32 {
        1000 / self.rate_hz.max(1)
    }
}

/// Checks that `rate_hz` is a usable sub-rate of a `polling_hz` poll and
/// returns the number of polls between runs.
pub fn interval_for(polling_hz: u32, rate_hz: u32) -> Result<u32, CadenceError> {
    if rate_hz == 0 || rate_hz > polling_hz || polling_hz % rate_hz != 0 {
        return Err(CadenceError::BadRate);
    }
    Ok(polling_hz / rate_hz)
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Slot {
    interval: Option<u32>,
    fired_but_not_observed: bool,
}
