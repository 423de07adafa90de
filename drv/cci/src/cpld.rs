// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cage control through the board CPLD.
//!
//! Every per-module control is split across two byte-wide registers: modules
//! 0 through 7 live in the first and 8 through 15 in the second. Indicator
//! LEDs have one register per cage starting at [`LED_BASE`].

use crate::led::CageLeds;
use crate::platform::{Clock, Cpld};
use crate::{CciError, MAX_MODULES};

/// A register split across two bytes of the CPLD map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegPair {
    pub lo: u8,
    pub hi: u8,
}

impl RegPair {
    /// Register and bit for `module`.
    fn locate(&self, module: u8) -> Result<(u8, u8), CciError> {
        if usize::from(module) >= MAX_MODULES {
            return Err(CciError::BadArgs);
        }
        let reg = if module < 8 { self.lo } else { self.hi };
        Ok((reg, 1 << (module % 8)))
    }
}

pub const RESET: RegPair = RegPair { lo: 0x10, hi: 0x11 };
pub const LP_MODE: RegPair = RegPair { lo: 0x12, hi: 0x13 };
pub const LD_SW_EN: RegPair = RegPair { lo: 0x14, hi: 0x15 };
pub const LD_SW_FAULT: RegPair = RegPair { lo: 0x16, hi: 0x17 };
pub const PRESENT: RegPair = RegPair { lo: 0x18, hi: 0x19 };
pub const LED_BASE: u8 = 0x20;

/// How long reset is held, in milliseconds.
const RESET_PULSE_MS: u64 = 1;
/// How long the load switch stays off during a power cycle, and how long
/// the fault flag gets to settle once cleared.
const POWER_CYCLE_MS: u64 = 1;

fn update<P: Cpld>(
    p: &mut P,
    pair: RegPair,
    module: u8,
    set: bool,
) -> Result<(), CciError> {
    let (reg, bit) = pair.locate(module)?;
    let val = p.cpld_read(reg)?;
    let val = if set { val | bit } else { val & !bit };
    p.cpld_write(reg, val)
}

fn test_bit<P: Cpld>(p: &mut P, pair: RegPair, module: u8) -> Result<bool, CciError> {
    let (reg, bit) = pair.locate(module)?;
    Ok(p.cpld_read(reg)? & bit != 0)
}

/// Pulses the module's reset line, then leaves it in low-power mode.
pub fn reset_module<P: Cpld + Clock>(p: &mut P, module: u8) -> Result<(), CciError> {
    RESET.locate(module)?;
    let mask = 1u16 << module;
    p.cpld_write(RESET.lo, mask as u8)?;
    p.cpld_write(RESET.hi, (mask >> 8) as u8)?;
    p.delay_ms(RESET_PULSE_MS);
    p.cpld_write(RESET.lo, 0)?;
    p.cpld_write(RESET.hi, 0)?;
    set_lp_mode(p, module, true)
}

pub fn set_lp_mode<P: Cpld>(p: &mut P, module: u8, on: bool) -> Result<(), CciError> {
    update(p, LP_MODE, module, on)
}

pub fn lp_mode<P: Cpld>(p: &mut P, module: u8) -> Result<bool, CciError> {
    test_bit(p, LP_MODE, module)
}

pub fn set_power<P: Cpld>(p: &mut P, module: u8, on: bool) -> Result<(), CciError> {
    update(p, LD_SW_EN, module, on)
}

pub fn power<P: Cpld>(p: &mut P, module: u8) -> Result<bool, CciError> {
    test_bit(p, LD_SW_EN, module)
}

/// Whether the module's load switch reports a fault. A register that cannot
/// be read counts as a fault.
pub fn module_fault<P: Cpld>(p: &mut P, module: u8) -> bool {
    test_bit(p, LD_SW_FAULT, module).unwrap_or(true)
}

pub fn clear_fault<P: Cpld>(p: &mut P, module: u8) -> Result<(), CciError> {
    let (reg, bit) = LD_SW_FAULT.locate(module)?;
    p.cpld_write(reg, !bit)
}

/// Power-cycles a faulted module and clears the fault. Returns whether the
/// module came back healthy.
pub fn recover_hw_good<P: Cpld + Clock>(
    p: &mut P,
    module: u8,
) -> Result<bool, CciError> {
    if !module_fault(p, module) {
        return Ok(true);
    }
    set_power(p, module, false)?;
    p.delay_ms(POWER_CYCLE_MS);
    set_power(p, module, true)?;
    clear_fault(p, module)?;
    p.delay_ms(POWER_CYCLE_MS);
    Ok(!module_fault(p, module))
}

fn led_reg(module: u8) -> Result<u8, CciError> {
    if usize::from(module) >= MAX_MODULES {
        return Err(CciError::BadArgs);
    }
    Ok(LED_BASE + module)
}

pub fn set_leds<P: Cpld + ?Sized>(
    p: &mut P,
    module: u8,
    leds: CageLeds,
) -> Result<(), CciError> {
    p.cpld_write(led_reg(module)?, leds.to_reg())
}

pub fn leds<P: Cpld + ?Sized>(p: &mut P, module: u8) -> Result<CageLeds, CciError> {
    CageLeds::from_reg(p.cpld_read(led_reg(module)?)?)
}

/// Modules with a cable plugged in.
pub fn present_mask<P: Cpld>(p: &mut P) -> Result<u32, CciError> {
    let lo = p.cpld_read(PRESENT.lo)?;
    let hi = p.cpld_read(PRESENT.hi)?;
    Ok(u32::from(lo) | (u32::from(hi) << 8))
}
