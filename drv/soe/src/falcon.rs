// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Falcon register interface.
//!
//! All hardware access goes through [`FalconIo`], which also supplies the
//! millisecond clock and the delay primitive. Register offsets are relative
//! to the SOE Falcon's register window.

use bitflags::bitflags;

/// Register access and timekeeping for one Falcon instance.
pub trait FalconIo {
    fn read(&mut self, reg: u32) -> u32;
    fn write(&mut self, reg: u32, val: u32);

    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Busy-waits for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u64);
}

pub mod regs {
    pub const IRQSSET: u32 = 0x000;
    pub const IRQSCLR: u32 = 0x004;
    pub const IRQSTAT: u32 = 0x008;
    pub const IRQMASK: u32 = 0x018;
    pub const IRQDEST: u32 = 0x01c;
    pub const MAILBOX0: u32 = 0x040;
    pub const MAILBOX1: u32 = 0x044;
    pub const OS: u32 = 0x080;

    pub const CPUCTL: u32 = 0x100;
    pub const CPUCTL_HALTED: u32 = 1 << 4;

    pub const HWCFG: u32 = 0x108;
    pub const HWCFG_EMEM_SIZE_MASK: u32 = 0x1ff;

    pub const HWCFG1: u32 = 0x12c;
    pub const HWCFG1_DMEM_TAG_WIDTH_SHIFT: u32 = 21;
    pub const HWCFG1_DMEM_TAG_WIDTH_MASK: u32 = 0x1f;

    /// EMEM blocks are 256 bytes.
    pub const EMEM_BLOCK_SIZE: u32 = 256;

    pub const fn ememc(port: u8) -> u32 {
        0xac0 + (port as u32) * 8
    }
    pub const fn ememd(port: u8) -> u32 {
        0xac4 + (port as u32) * 8
    }

    pub const EMEMC_OFFS: u32 = 0x0000_00fc;
    pub const EMEMC_BLK: u32 = 0x0000_ff00;
    pub const EMEMC_AINCW: u32 = 1 << 24;
    pub const EMEMC_AINCR: u32 = 1 << 25;

    pub const fn cmdq_head(phy: u8) -> u32 {
        0xc00 + (phy as u32) * 8
    }
    pub const fn cmdq_tail(phy: u8) -> u32 {
        0xc04 + (phy as u32) * 8
    }
    pub const fn msgq_head(phy: u8) -> u32 {
        0xc80 + (phy as u32) * 8
    }
    pub const fn msgq_tail(phy: u8) -> u32 {
        0xc84 + (phy as u32) * 8
    }

    /// Host-side attach status, written by the driver (LS10).
    pub const DRIVER_ATTACH_DETACH: u32 = 0x1000;
    /// Firmware-side attach status, written by the SOE (LS10).
    pub const SOE_ATTACH_DETACH: u32 = 0x1004;
    pub const ATTACH_STATUS_ATTACHED: u32 = 1 << 0;
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct IrqBits: u32 {
        const WDTMR = 1 << 1;
        const HALT = 1 << 4;
        const EXTERR = 1 << 5;
        const SWGEN0 = 1 << 6;
        const SWGEN1 = 1 << 7;
    }
}

/// Register snapshot taken when a command times out or the CPU halts.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub os: u32,
    pub mailbox0: u32,
    pub mailbox1: u32,
    pub irqstat: u32,
    pub cpuctl: u32,
    pub cmdq_head: u32,
    pub cmdq_tail: u32,
    pub msgq_head: u32,
    pub msgq_tail: u32,
}

impl Diagnostics {
    pub fn capture<R: FalconIo>(io: &mut R, phy: u8) -> Self {
        Self {
            os: io.read(regs::OS),
            mailbox0: io.read(regs::MAILBOX0),
            mailbox1: io.read(regs::MAILBOX1),
            irqstat: io.read(regs::IRQSTAT),
            cpuctl: io.read(regs::CPUCTL),
            cmdq_head: io.read(regs::cmdq_head(phy)),
            cmdq_tail: io.read(regs::cmdq_tail(phy)),
            msgq_head: io.read(regs::msgq_head(phy)),
            msgq_tail: io.read(regs::msgq_tail(phy)),
        }
    }
}
