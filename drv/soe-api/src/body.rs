// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bodies of the INIT, CORE, THERM and HEARTBEAT frames.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{I32, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::NUM_QUEUES;

/// `msg_type` of the INIT message.
pub const INIT_MSG_SOE_INIT: u8 = 0;

/// Placement of one queue, as announced by firmware.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct QueueInfo {
    /// Byte offset of the queue in EMEM.
    pub queue_offset: U32,
    pub queue_size: U16,
    pub queue_phy_id: u8,
    pub queue_log_id: u8,
}

/// The first message firmware sends after boot. It tells the host where
/// the queues live.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct InitMsg {
    pub msg_type: u8,
    pub num_queues: u8,
    pub os_debug_entry_point: U16,
    pub q_info: [QueueInfo; NUM_QUEUES],
}
const_assert_eq!(core::mem::size_of::<InitMsg>(), 20);

/// `cmd_type` of the CORE unit commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreCmd {
    IngressStop = 0x0c,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct IngressStopCmd {
    pub cmd_type: u8,
    pub stop: u8,
    pub _rsvd: [u8; 2],
    pub nport: U32,
}
const_assert_eq!(core::mem::size_of::<IngressStopCmd>(), 8);

impl IngressStopCmd {
    pub fn new(nport: u32, stop: bool) -> Self {
        Self {
            cmd_type: CoreCmd::IngressStop as u8,
            stop: u8::from(stop),
            _rsvd: [0; 2],
            nport: U32::new(nport),
        }
    }
}

/// `event_type` values carried by THERM events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ThermEventType {
    Slowdown = 0,
    Shutdown = 1,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ThermEvent {
    pub event_type: u8,
    pub sensor_id: u8,
    pub _rsvd: [u8; 2],
    /// Millidegrees Celsius.
    pub temperature: I32,
    pub threshold: I32,
}
const_assert_eq!(core::mem::size_of::<ThermEvent>(), 12);

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct HeartbeatEvent {
    pub msg_type: u8,
    pub _rsvd: [u8; 3],
    /// Firmware uptime in milliseconds.
    pub timestamp: U64,
}
const_assert_eq!(core::mem::size_of::<HeartbeatEvent>(), 12);
