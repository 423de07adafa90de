// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Everything the onboarding engine needs from the rest of the system.
//!
//! Method names carry a prefix per collaborator so that one type can
//! implement all of them; the engine takes a single `&mut impl Platform`.

use drv_soe::falcon::FalconIo;
use drv_soe::hal::SoeHal;
use drv_soe::listeners::CciNotice;
use drv_soe::Soe;
use drv_soe_api::cci::{OnboardPhaseCmd, SubPhaseCode};
use drv_soe_api::{Frame, SoeError, UnitId};

use crate::cpld;
use crate::led::CageLeds;
use crate::CciError;

/// Link state for a set of links, as bit masks by link id.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkMasks {
    pub active: u64,
    pub fault: u64,
    /// Links on their way to active that should be left alone.
    pub active_pending: u64,
}

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u64);
}

/// Byte-wide register access to the board CPLD that controls the cages.
pub trait Cpld {
    fn cpld_read(&mut self, reg: u8) -> Result<u8, CciError>;
    fn cpld_write(&mut self, reg: u8, val: u8) -> Result<(), CciError>;
}

/// Cage indicator LEDs. Boards that wire them to the CPLD keep the default
/// methods.
pub trait XcvrLeds: Cpld {
    fn set_xcvr_leds(
        &mut self,
        module: u8,
        leds: CageLeds,
    ) -> Result<(), CciError> {
        cpld::set_leds(self, module, leds)
    }

    fn xcvr_leds(&mut self, module: u8) -> Result<CageLeds, CciError> {
        cpld::leds(self, module)
    }
}

/// Raw CMIS transactions. `addr` is the byte address in the module's
/// 256-byte window; paging is handled by [`crate::cmis`].
pub trait CmisBus {
    fn cmis_read(
        &mut self,
        module: u8,
        addr: u8,
        out: &mut [u8],
    ) -> Result<(), CciError>;
    fn cmis_write(
        &mut self,
        module: u8,
        addr: u8,
        data: &[u8],
    ) -> Result<(), CciError>;
}

pub trait Links {
    /// Links enabled on this device.
    fn enabled_links(&mut self) -> u64;
    /// Links administratively disabled.
    fn disabled_links(&mut self) -> u64;
    fn link_status(&mut self, mask: u64) -> LinkMasks;
    /// Resets the links in `mask` and drains their traffic. Without
    /// `forced`, links that are already down are left alone.
    fn reset_and_drain(&mut self, mask: u64, forced: bool)
        -> Result<(), CciError>;
    fn in_reset(&mut self, link: u8) -> bool;
    /// Asks the link to leave reset and train to active.
    fn request_active(&mut self, link: u8) -> Result<(), CciError>;
    /// Transmit and receive byte counters.
    fn throughput(&mut self, link: u8) -> Option<(u64, u64)>;
}

/// Cable-type-specific bring-up.
pub trait CableBringUp {
    fn init_copper(&mut self, module: u8, links: u64) -> Result<(), CciError>;
    fn init_direct(&mut self, module: u8, links: u64) -> Result<(), CciError>;
    /// Runs one step of optical bring-up. Returns how long the module needs
    /// to settle before the next step, in milliseconds.
    fn init_optical(
        &mut self,
        module: u8,
        links: u64,
        step: SubPhaseCode,
    ) -> Result<u64, CciError>;
}

/// The slice of the SOE the onboarding engine talks to.
pub trait SoeLink {
    /// Tells firmware which phase a module is entering, waiting for the
    /// acknowledgement.
    fn post_onboard_phase(
        &mut self,
        cmd: &OnboardPhaseCmd,
        timeout_ms: u64,
    ) -> Result<(), SoeError>;

    /// CCI events received since the last call.
    fn take_cci_notice(&mut self) -> CciNotice;
}

pub trait Platform:
    Clock + Cpld + XcvrLeds + CmisBus + Links + CableBringUp + SoeLink
{
}

impl<T> Platform for T where
    T: Clock + Cpld + XcvrLeds + CmisBus + Links + CableBringUp + SoeLink
{
}

impl<R: FalconIo, H: SoeHal> SoeLink for Soe<R, H> {
    fn post_onboard_phase(
        &mut self,
        cmd: &OnboardPhaseCmd,
        timeout_ms: u64,
    ) -> Result<(), SoeError> {
        let frame = Frame::with_body(UnitId::Cci, cmd)?;
        self.post_blocking(&frame, timeout_ms).map(|_| ())
    }

    fn take_cci_notice(&mut self) -> CciNotice {
        self.service();
        Soe::take_cci_notice(self)
    }
}
