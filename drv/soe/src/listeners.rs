// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine's own event listeners and the state they accumulate.

use drv_soe_api::body::{HeartbeatEvent, ThermEvent, ThermEventType};
use drv_soe_api::cci::{CciEvent, CciEventType};
use drv_soe_api::Frame;

use crate::event::EventFault;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ThermState {
    pub last: Option<ThermEvent>,
    pub slowdowns: u32,
    pub shutdowns: u32,
}

/// CCI notifications waiting to be picked up by the onboarding engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CciNotice {
    /// Links that firmware saw fault.
    pub fault_links: u64,
    /// Modules whose presence firmware saw change.
    pub presence_modules: u32,
}

impl CciNotice {
    pub fn is_empty(&self) -> bool {
        self.fault_links == 0 && self.presence_modules == 0
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SoeEvents {
    pub therm: ThermState,
    pub cci: CciNotice,
    /// Firmware timestamp carried by the latest heartbeat.
    pub last_heartbeat: Option<u64>,
    pub heartbeats: u32,
}

pub fn therm(ev: &mut SoeEvents, frame: &Frame) -> Result<(), EventFault> {
    let t: ThermEvent = frame.body_as().ok_or(EventFault::ShortBody)?;
    match t.event_type {
        x if x == ThermEventType::Slowdown as u8 => {
            ev.therm.slowdowns = ev.therm.slowdowns.wrapping_add(1)
        }
        x if x == ThermEventType::Shutdown as u8 => {
            ev.therm.shutdowns = ev.therm.shutdowns.wrapping_add(1)
        }
        x => return Err(EventFault::UnknownType(x)),
    }
    ev.therm.last = Some(t);
    Ok(())
}

pub fn cci(ev: &mut SoeEvents, frame: &Frame) -> Result<(), EventFault> {
    let c: CciEvent = frame.body_as().ok_or(EventFault::ShortBody)?;
    match c.event_type {
        x if x == CciEventType::ModuleFault as u8 => {
            ev.cci.fault_links |= c.link_mask();
        }
        x if x == CciEventType::PresenceChange as u8 => {
            ev.cci.presence_modules |= 1u32
                .checked_shl(u32::from(c.module_id))
                .unwrap_or(0);
        }
        x => return Err(EventFault::UnknownType(x)),
    }
    Ok(())
}

pub fn heartbeat(ev: &mut SoeEvents, frame: &Frame) -> Result<(), EventFault> {
    let h: HeartbeatEvent = frame.body_as().ok_or(EventFault::ShortBody)?;
    ev.last_heartbeat = Some(h.timestamp.get());
    ev.heartbeats = ev.heartbeats.wrapping_add(1);
    Ok(())
}
