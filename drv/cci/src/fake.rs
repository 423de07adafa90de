// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A scriptable stand-in for the board, links, and SOE.

use std::collections::BTreeMap;

use drv_soe::listeners::CciNotice;
use drv_soe_api::cci::{OnboardPhaseCmd, SubPhaseCode};
use drv_soe_api::SoeError;

use crate::cmis::{BANK_SELECT, UPPER_START};
use crate::cpld;
use crate::platform::{
    CableBringUp, Clock, CmisBus, Cpld, LinkMasks, Links, SoeLink, XcvrLeds,
};
use crate::{CciError, MAX_LINKS, MAX_MODULES};

/// Which bring-up step ran, for checking order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BringUp {
    Copper(u8),
    Direct(u8),
    Optical(u8, SubPhaseCode),
}

pub struct FakePlatform {
    pub now: u64,

    pub cpld: [u8; 256],
    pub cpld_writes: Vec<(u8, u8)>,
    pub cpld_fail: Option<u8>,

    lower: [[u8; 128]; MAX_MODULES],
    pages: BTreeMap<(u8, u8, u8), [u8; 128]>,
    pub cmis_reads: Vec<(u8, u8, usize)>,
    pub cmis_select_writes: usize,
    /// Modules whose CMIS accesses fail.
    pub cmis_fail: u32,

    pub enabled: u64,
    pub disabled: u64,
    pub active: u64,
    pub fault: u64,
    pub pending: u64,
    pub in_reset: u64,
    pub resets: Vec<(u64, bool)>,
    pub activations: Vec<u8>,
    /// Links that refuse to leave reset.
    pub ali_fail: u64,
    /// Links that train as soon as they are asked to.
    pub auto_train: u64,
    pub counters: [Option<(u64, u64)>; MAX_LINKS],

    pub bring_ups: Vec<BringUp>,
    /// Modules whose bring-up fails.
    pub bring_up_fail: u32,
    pub optical_settle_ms: u64,

    pub soe_cmds: Vec<OnboardPhaseCmd>,
    pub soe_fail: Option<SoeError>,
    pub notice: CciNotice,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            now: 0,
            cpld: [0; 256],
            cpld_writes: Vec::new(),
            cpld_fail: None,
            lower: [[0; 128]; MAX_MODULES],
            pages: BTreeMap::new(),
            cmis_reads: Vec::new(),
            cmis_select_writes: 0,
            cmis_fail: 0,
            enabled: u64::MAX,
            disabled: 0,
            active: 0,
            fault: 0,
            pending: 0,
            in_reset: 0,
            resets: Vec::new(),
            activations: Vec::new(),
            ali_fail: 0,
            auto_train: 0,
            counters: [None; MAX_LINKS],
            bring_ups: Vec::new(),
            bring_up_fail: 0,
            optical_settle_ms: 0,
            soe_cmds: Vec::new(),
            soe_fail: None,
            notice: CciNotice::default(),
        }
    }

    pub fn cmis_lower_mut(&mut self, module: u8) -> &mut [u8; 128] {
        &mut self.lower[usize::from(module)]
    }

    /// Upper page `page` of bank 0.
    pub fn cmis_page_mut(&mut self, module: u8, page: u8) -> &mut [u8; 128] {
        self.pages.entry((module, 0, page)).or_insert([0; 128])
    }

    pub fn cmis_selected(&self, module: u8) -> [u8; 2] {
        let l = &self.lower[usize::from(module)];
        [l[BANK_SELECT as usize], l[BANK_SELECT as usize + 1]]
    }

    /// Plugs in a paged CMIS module with a valid page 00h.
    pub fn install_module(&mut self, module: u8, media: u8) {
        let lower = self.cmis_lower_mut(module);
        lower[0] = 0x18;
        lower[1] = 0x50;
        lower[2] = 0;

        let page = self.cmis_page_mut(module, 0);
        page[84] = media;
        let sum = page[..94].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        page[94] = sum;

        self.set_present(module, true);
    }

    pub fn leds(&self, module: u8) -> u8 {
        self.cpld[usize::from(cpld::LED_BASE + module)]
    }

    pub fn set_present(&mut self, module: u8, present: bool) {
        let (reg, bit) = if module < 8 {
            (cpld::PRESENT.lo, 1 << module)
        } else {
            (cpld::PRESENT.hi, 1 << (module - 8))
        };
        let r = &mut self.cpld[usize::from(reg)];
        if present {
            *r |= bit;
        } else {
            *r &= !bit;
        }
    }

    fn byte(&mut self, module: u8, addr: u8) -> &mut u8 {
        let m = usize::from(module);
        if addr < UPPER_START {
            return &mut self.lower[m][usize::from(addr)];
        }
        let bank = self.lower[m][BANK_SELECT as usize];
        let page = self.lower[m][BANK_SELECT as usize + 1];
        let p = self.pages.entry((module, bank, page)).or_insert([0; 128]);
        &mut p[usize::from(addr - UPPER_START)]
    }
}

impl Clock for FakePlatform {
    fn now_ms(&self) -> u64 {
        self.now
    }

    fn delay_ms(&mut self, ms: u64) {
        self.now += ms;
    }
}

impl Cpld for FakePlatform {
    fn cpld_read(&mut self, reg: u8) -> Result<u8, CciError> {
        if self.cpld_fail == Some(reg) {
            return Err(CciError::Io);
        }
        Ok(self.cpld[usize::from(reg)])
    }

    fn cpld_write(&mut self, reg: u8, val: u8) -> Result<(), CciError> {
        if self.cpld_fail == Some(reg) {
            return Err(CciError::Io);
        }
        self.cpld_writes.push((reg, val));
        let r = &mut self.cpld[usize::from(reg)];
        // Fault bits are write-zero-to-clear.
        if reg == cpld::LD_SW_FAULT.lo || reg == cpld::LD_SW_FAULT.hi {
            *r &= val;
        } else {
            *r = val;
        }
        Ok(())
    }
}

impl XcvrLeds for FakePlatform {}

impl CmisBus for FakePlatform {
    fn cmis_read(
        &mut self,
        module: u8,
        addr: u8,
        out: &mut [u8],
    ) -> Result<(), CciError> {
        if self.cmis_fail & (1 << module) != 0 {
            return Err(CciError::Io);
        }
        self.cmis_reads.push((module, addr, out.len()));
        for (i, b) in out.iter_mut().enumerate() {
            *b = *self.byte(module, addr + i as u8);
        }
        Ok(())
    }

    fn cmis_write(
        &mut self,
        module: u8,
        addr: u8,
        data: &[u8],
    ) -> Result<(), CciError> {
        if self.cmis_fail & (1 << module) != 0 {
            return Err(CciError::Io);
        }
        if addr == BANK_SELECT {
            self.cmis_select_writes += 1;
        }
        for (i, b) in data.iter().enumerate() {
            *self.byte(module, addr + i as u8) = *b;
        }
        Ok(())
    }
}

impl Links for FakePlatform {
    fn enabled_links(&mut self) -> u64 {
        self.enabled
    }

    fn disabled_links(&mut self) -> u64 {
        self.disabled
    }

    fn link_status(&mut self, mask: u64) -> LinkMasks {
        LinkMasks {
            active: self.active & mask,
            fault: self.fault & mask,
            active_pending: self.pending & mask,
        }
    }

    fn reset_and_drain(&mut self, mask: u64, forced: bool) -> Result<(), CciError> {
        self.resets.push((mask, forced));
        self.active &= !mask;
        self.in_reset |= mask;
        Ok(())
    }

    fn in_reset(&mut self, link: u8) -> bool {
        self.in_reset & (1 << link) != 0
    }

    fn request_active(&mut self, link: u8) -> Result<(), CciError> {
        let bit = 1 << link;
        if self.ali_fail & bit != 0 {
            return Err(CciError::Io);
        }
        self.activations.push(link);
        self.in_reset &= !bit;
        if self.auto_train & bit != 0 {
            self.active |= bit;
        }
        Ok(())
    }

    fn throughput(&mut self, link: u8) -> Option<(u64, u64)> {
        self.counters[usize::from(link)]
    }
}

impl CableBringUp for FakePlatform {
    fn init_copper(&mut self, module: u8, _links: u64) -> Result<(), CciError> {
        self.bring_ups.push(BringUp::Copper(module));
        if self.bring_up_fail & (1 << module) != 0 {
            return Err(CciError::Io);
        }
        Ok(())
    }

    fn init_direct(&mut self, module: u8, _links: u64) -> Result<(), CciError> {
        self.bring_ups.push(BringUp::Direct(module));
        if self.bring_up_fail & (1 << module) != 0 {
            return Err(CciError::Io);
        }
        Ok(())
    }

    fn init_optical(
        &mut self,
        module: u8,
        _links: u64,
        step: SubPhaseCode,
    ) -> Result<u64, CciError> {
        self.bring_ups.push(BringUp::Optical(module, step));
        if self.bring_up_fail & (1 << module) != 0 {
            return Err(CciError::Io);
        }
        Ok(self.optical_settle_ms)
    }
}

impl SoeLink for FakePlatform {
    fn post_onboard_phase(
        &mut self,
        cmd: &OnboardPhaseCmd,
        _timeout_ms: u64,
    ) -> Result<(), SoeError> {
        self.soe_cmds.push(*cmd);
        match self.soe_fail {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn take_cci_notice(&mut self) -> CciNotice {
        core::mem::take(&mut self.notice)
    }
}
