// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CCI unit commands and events.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CciCmd {
    OnboardPhase = 0x01,
}

/// Onboarding phase codes reported to firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PhaseCode {
    CheckCondition = 0,
    Identify = 1,
    InitCopper = 2,
    InitDirect = 3,
    InitOptical = 4,
    LaunchAli = 5,
    Sleep = 6,
    Monitor = 7,
    NonContinuousAli = 8,
}

/// Sub-phase codes for the optical bring-up phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubPhaseCode {
    None = 0,
    Start = 1,
    Configure = 2,
    EnableAli = 3,
}

/// Tells firmware which onboarding phase a module is entering, so it can
/// adjust its own handling (LED state, ALI behavior) to match.
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
pub struct OnboardPhaseCmd {
    pub cmd_type: u8,
    pub module_id: u8,
    pub onboard_phase: u8,
    pub onboard_sub_phase: u8,
    pub rx_det_enable: u8,
    pub _rsvd: [u8; 3],
    /// Links 0..32 of the train mask.
    pub link_mask_lo: U32,
    /// Links 32..64 of the train mask.
    pub link_mask_hi: U32,
}
const_assert_eq!(core::mem::size_of::<OnboardPhaseCmd>(), 16);

impl OnboardPhaseCmd {
    pub fn new(
        module_id: u8,
        phase: PhaseCode,
        sub_phase: SubPhaseCode,
        rx_det_enable: bool,
        link_mask: u64,
    ) -> Self {
        Self {
            cmd_type: CciCmd::OnboardPhase as u8,
            module_id,
            onboard_phase: phase as u8,
            onboard_sub_phase: sub_phase as u8,
            rx_det_enable: u8::from(rx_det_enable),
            _rsvd: [0; 3],
            link_mask_lo: U32::new(link_mask as u32),
            link_mask_hi: U32::new((link_mask >> 32) as u32),
        }
    }

    pub fn link_mask(&self) -> u64 {
        u64::from(self.link_mask_lo.get())
            | (u64::from(self.link_mask_hi.get()) << 32)
    }
}

/// `event_type` values carried by CCI events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CciEventType {
    /// The module reported a fault on the given links.
    ModuleFault = 0,
    /// Firmware observed a presence change on the module.
    PresenceChange = 1,
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
pub struct CciEvent {
    pub event_type: u8,
    pub module_id: u8,
    pub _rsvd: [u8; 2],
    pub link_mask_lo: U32,
    pub link_mask_hi: U32,
}
const_assert_eq!(core::mem::size_of::<CciEvent>(), 12);

impl CciEvent {
    pub fn new(event_type: CciEventType, module_id: u8, link_mask: u64) -> Self {
        Self {
            event_type: event_type as u8,
            module_id,
            _rsvd: [0; 2],
            link_mask_lo: U32::new(link_mask as u32),
            link_mask_hi: U32::new((link_mask >> 32) as u32),
        }
    }

    pub fn link_mask(&self) -> u64 {
        u64::from(self.link_mask_lo.get())
            | (u64::from(self.link_mask_hi.get()) << 32)
    }
}
