// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-generation differences between SOE instances.

use drv_soe_api::{SoeError, UnitId};

use crate::falcon::{regs, FalconIo, IrqBits};

/// How the host learns where the queues are.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Boot {
    /// Firmware announces the queues in its INIT message.
    InitMessage,
    /// Queues sit at fixed offsets from the start of EMEM, and the driver
    /// attaches once firmware reports itself attached.
    FixedChannels {
        cmdq_offset: u32,
        msgq_offset: u32,
        queue_len: u32,
    },
}

pub trait SoeHal {
    /// Number of EMEM access ports.
    fn emem_ports(&self) -> u8;

    /// Port used for queue traffic.
    fn queue_port(&self) -> u8 {
        0
    }

    fn boot(&self) -> Boot;

    /// Units whose events the engine listens to.
    fn event_units(&self) -> &'static [UnitId];

    /// Start of the EMEM aperture in the Falcon's data address space. EMEM
    /// is mapped just above the range DMEM tags can address. A tag width
    /// that puts EMEM outside the 32-bit data space is `BadEmemAccess`.
    fn emem_start<R: FalconIo>(&self, io: &mut R) -> Result<u32, SoeError> {
        let hwcfg1 = io.read(regs::HWCFG1);
        let tag_width = (hwcfg1 >> regs::HWCFG1_DMEM_TAG_WIDTH_SHIFT)
            & regs::HWCFG1_DMEM_TAG_WIDTH_MASK;
        1u32.checked_shl(tag_width + 8)
            .ok_or(SoeError::BadEmemAccess)
    }

    fn emem_size<R: FalconIo>(&self, io: &mut R) -> u32 {
        (io.read(regs::HWCFG) & regs::HWCFG_EMEM_SIZE_MASK)
            * regs::EMEM_BLOCK_SIZE
    }

    fn is_cpu_halted<R: FalconIo>(&self, io: &mut R) -> bool {
        io.read(regs::CPUCTL) & regs::CPUCTL_HALTED != 0
    }

    /// Pending interrupts that are both unmasked and routed to the host.
    fn intr_status<R: FalconIo>(&self, io: &mut R) -> IrqBits {
        let irq = io.read(regs::IRQSTAT);
        let mask = io.read(regs::IRQMASK);
        let dest = io.read(regs::IRQDEST);
        IrqBits::from_bits_truncate(irq & mask & dest)
    }

    /// Whether firmware has attached to its queues.
    fn soe_attached<R: FalconIo>(&self, _io: &mut R) -> bool {
        true
    }

    fn attach<R: FalconIo>(&self, _io: &mut R, _attach: bool) {}
}

/// First generation: one EMEM port, queues described by the INIT message,
/// thermal events only.
#[derive(Copy, Clone, Debug, Default)]
pub struct Lr10;

impl SoeHal for Lr10 {
    fn emem_ports(&self) -> u8 {
        1
    }

    fn boot(&self) -> Boot {
        Boot::InitMessage
    }

    fn event_units(&self) -> &'static [UnitId] {
        &[UnitId::Therm]
    }
}

/// Second generation: four EMEM ports, fixed queue channels with an attach
/// handshake, and CCI and heartbeat events.
#[derive(Copy, Clone, Debug, Default)]
pub struct Ls10;

pub const LS10_CMDQ_OFFSET: u32 = 0x0;
pub const LS10_MSGQ_OFFSET: u32 = 0x400;
pub const LS10_QUEUE_LEN: u32 = 0x400;

impl SoeHal for Ls10 {
    fn emem_ports(&self) -> u8 {
        4
    }

    fn boot(&self) -> Boot {
        Boot::FixedChannels {
            cmdq_offset: LS10_CMDQ_OFFSET,
            msgq_offset: LS10_MSGQ_OFFSET,
            queue_len: LS10_QUEUE_LEN,
        }
    }

    fn event_units(&self) -> &'static [UnitId] {
        &[UnitId::Therm, UnitId::Cci, UnitId::Heartbeat]
    }

    fn soe_attached<R: FalconIo>(&self, io: &mut R) -> bool {
        io.read(regs::SOE_ATTACH_DETACH) & regs::ATTACH_STATUS_ATTACHED != 0
    }

    fn attach<R: FalconIo>(&self, io: &mut R, attach: bool) {
        let val = io.read(regs::DRIVER_ATTACH_DETACH);
        let val = if attach {
            val | regs::ATTACH_STATUS_ATTACHED
        } else {
            val & !regs::ATTACH_STATUS_ATTACHED
        };
        io.write(regs::DRIVER_ATTACH_DETACH, val);
    }
}
