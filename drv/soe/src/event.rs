// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routing of unsolicited firmware events to host listeners.
//!
//! A listener is a plain function over some context `C` owned by whoever
//! drains the message queue. At most one listener exists per unit.

use drv_soe_api::{Frame, SoeError, UnitId};

/// Why a listener could not make sense of an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventFault {
    /// The body is shorter than the event type requires.
    ShortBody,
    /// The body names an event type the listener does not know.
    UnknownType(u8),
}

pub type Handler<C> = fn(&mut C, &Frame) -> Result<(), EventFault>;

/// Result of routing one event frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled(UnitId),
    Faulted(UnitId, EventFault),
    /// No listener for this unit id; the frame is dropped.
    Unclaimed(u8),
}

struct Listener<C> {
    unit: UnitId,
    desc: u32,
    handler: Handler<C>,
}

pub struct EventRegistry<C, const N: usize = 8> {
    listeners: heapless::Vec<Listener<C>, N>,
    next_desc: u32,
}

impl<C, const N: usize> Default for EventRegistry<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, const N: usize> EventRegistry<C, N> {
    pub fn new() -> Self {
        Self {
            listeners: heapless::Vec::new(),
            next_desc: 0,
        }
    }

    /// Installs `handler` for events from `unit`, returning a descriptor for
    /// later removal.
    pub fn register(
        &mut self,
        unit: UnitId,
        handler: Handler<C>,
    ) -> Result<u32, SoeError> {
        if matches!(unit, UnitId::Rewind | UnitId::Init) {
            return Err(SoeError::InvalidUnit);
        }
        if self.listeners.iter().any(|l| l.unit == unit) {
            return Err(SoeError::DuplicateUnit);
        }
        if self.listeners.is_full() {
            return Err(SoeError::RegistryFull);
        }

        // Skip any descriptor still held by a listener from a previous lap.
        let mut desc = self.next_desc;
        while self.listeners.iter().any(|l| l.desc == desc) {
            desc = desc.wrapping_add(1);
        }
        self.next_desc = desc.wrapping_add(1);

        self.listeners
            .push(Listener {
                unit,
                desc,
                handler,
            })
            .map_err(|_| SoeError::RegistryFull)?;
        Ok(desc)
    }

    pub fn unregister(&mut self, desc: u32) -> Result<UnitId, SoeError> {
        let i = self
            .listeners
            .iter()
            .position(|l| l.desc == desc)
            .ok_or(SoeError::NotFound)?;
        Ok(self.listeners.swap_remove(i).unit)
    }

    pub fn is_registered(&self, unit: UnitId) -> bool {
        self.listeners.iter().any(|l| l.unit == unit)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Runs the listener for `frame`'s unit. A listener that faults affects
    /// only its own frame.
    pub fn dispatch(&self, ctx: &mut C, frame: &Frame) -> Dispatch {
        let Some(l) =
            self.listeners.iter().find(|l| l.unit as u8 == frame.hdr.unit_id)
        else {
            return Dispatch::Unclaimed(frame.hdr.unit_id);
        };
        match (l.handler)(ctx, frame) {
            Ok(()) => Dispatch::Handled(l.unit),
            Err(e) => Dispatch::Faulted(l.unit, e),
        }
    }
}
