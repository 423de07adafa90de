// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated Falcon with just enough firmware behind it to exercise the
//! transport from the host side.
//!
//! Time only moves when the host calls [`FalconIo::delay_ms`] (or a test
//! calls [`SimFalcon::advance`]). Each simulated millisecond the firmware
//! consumes the command queue and, once a command's latency has elapsed,
//! answers it with a header-only reply and raises SWGEN0.

use std::collections::BTreeMap;

use drv_soe_api::body::{InitMsg, QueueInfo, INIT_MSG_SOE_INIT};
use drv_soe_api::{Frame, SoeError, UnitId, CMDQ_LOG_ID, MSGQ_LOG_ID};
use zerocopy::byteorder::little_endian::{U16, U32};

use crate::falcon::{regs, FalconIo, IrqBits};
use crate::hal::{LS10_CMDQ_OFFSET, LS10_MSGQ_OFFSET, LS10_QUEUE_LEN};
use crate::queue::{head_reg, tail_reg, DmemQueue, QueueAccess, QueueKind};

/// DMEM tag width reported in HWCFG1; EMEM starts at `1 << (8 + 8)`.
const TAG_WIDTH: u32 = 8;
/// EMEM size in 256-byte blocks.
const EMEM_BLOCKS: u32 = 16;
const PORTS: usize = 4;

pub const EMEM_START: u32 = 1 << (TAG_WIDTH + 8);

/// Where the LR10 firmware puts its queues.
pub const LR10_CMDQ: u32 = EMEM_START;
pub const LR10_MSGQ: u32 = EMEM_START + 0x200;
pub const LR10_QUEUE_LEN: u32 = 0x200;

/// Register file and EMEM.
struct Hw {
    regs: BTreeMap<u32, u32>,
    emem: Vec<u8>,
}

impl Hw {
    fn reg(&self, reg: u32) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn set(&mut self, reg: u32, val: u32) {
        self.regs.insert(reg, val);
    }

    fn word(&self, off: usize) -> u32 {
        let b = &self.emem[off..off + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn set_word(&mut self, off: usize, val: u32) {
        self.emem[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn ememd_port(reg: u32) -> Option<u8> {
        (0..PORTS as u8).find(|&p| regs::ememd(p) == reg)
    }

    /// Current EMEMC offset for `port`, and the auto-increment flags.
    fn emem_cursor(&self, port: u8) -> (usize, u32) {
        let c = self.reg(regs::ememc(port));
        ((c & (regs::EMEMC_OFFS | regs::EMEMC_BLK)) as usize, c)
    }

    fn bump(&mut self, port: u8, ememc: u32) {
        let mask = regs::EMEMC_OFFS | regs::EMEMC_BLK;
        let off = ((ememc & mask) + 4) & mask;
        self.set(regs::ememc(port), (ememc & !mask) | off);
    }

    fn local(&self, addr: u32, len: usize) -> Result<usize, SoeError> {
        let off = addr
            .checked_sub(EMEM_START)
            .ok_or(SoeError::BadEmemAccess)? as usize;
        if off + len > self.emem.len() {
            return Err(SoeError::BadEmemAccess);
        }
        Ok(off)
    }
}

/// Firmware's view of the queues: straight memory, no ports.
impl QueueAccess for Hw {
    fn head(&mut self, kind: QueueKind, phy: u8) -> u32 {
        self.reg(head_reg(kind, phy))
    }

    fn set_head(&mut self, kind: QueueKind, phy: u8, val: u32) {
        self.set(head_reg(kind, phy), val)
    }

    fn tail(&mut self, kind: QueueKind, phy: u8) -> u32 {
        self.reg(tail_reg(kind, phy))
    }

    fn set_tail(&mut self, kind: QueueKind, phy: u8, val: u32) {
        self.set(tail_reg(kind, phy), val)
    }

    fn copy_to(&mut self, addr: u32, data: &[u8]) -> Result<(), SoeError> {
        let off = self.local(addr, data.len())?;
        self.emem[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy_from(
        &mut self,
        addr: u32,
        data: &mut [u8],
    ) -> Result<(), SoeError> {
        let off = self.local(addr, data.len())?;
        data.copy_from_slice(&self.emem[off..off + data.len()]);
        Ok(())
    }
}

struct Firmware {
    cmdq: Option<DmemQueue>,
    msgq: Option<DmemQueue>,
    /// Reply latency per unit; `None` means the unit never answers.
    latency: BTreeMap<u8, Option<u64>>,
    /// Frames due for the message queue, with the time they become due.
    outbox: Vec<(u64, Frame)>,
    received: Vec<Frame>,
    paused: bool,
    halted: bool,
}

pub struct SimFalcon {
    hw: Hw,
    fw: Firmware,
    now: u64,
}

impl SimFalcon {
    fn bare() -> Self {
        let mut hw = Hw {
            regs: BTreeMap::new(),
            emem: vec![0; (EMEM_BLOCKS * regs::EMEM_BLOCK_SIZE) as usize],
        };
        hw.set(
            regs::HWCFG1,
            TAG_WIDTH << regs::HWCFG1_DMEM_TAG_WIDTH_SHIFT,
        );
        hw.set(regs::HWCFG, EMEM_BLOCKS);
        hw.set(regs::IRQMASK, u32::MAX);
        hw.set(regs::IRQDEST, u32::MAX);
        Self {
            hw,
            fw: Firmware {
                cmdq: None,
                msgq: None,
                latency: BTreeMap::new(),
                outbox: Vec::new(),
                received: Vec::new(),
                paused: false,
                halted: false,
            },
            now: 0,
        }
    }

    fn open_queues(&mut self, cmdq: DmemQueue, msgq: DmemQueue) {
        cmdq.reset(&mut self.hw);
        msgq.reset(&mut self.hw);
        self.fw.cmdq = Some(cmdq);
        self.fw.msgq = Some(msgq);
    }

    /// First-generation part: firmware has booted and left its INIT message
    /// in the message queue.
    pub fn lr10() -> Self {
        Self::lr10_announcing(|_| ())
    }

    /// Like [`SimFalcon::lr10`], but `edit` gets to change the INIT message
    /// before firmware sends it. The queues firmware actually serves stay
    /// where they are.
    pub fn lr10_announcing(edit: impl FnOnce(&mut InitMsg)) -> Self {
        let mut sim = Self::bare();
        let cmdq = DmemQueue::new(
            QueueKind::Command,
            CMDQ_LOG_ID,
            0,
            LR10_CMDQ,
            LR10_QUEUE_LEN,
        );
        let msgq = DmemQueue::new(
            QueueKind::Message,
            MSGQ_LOG_ID,
            0,
            LR10_MSGQ,
            LR10_QUEUE_LEN,
        );
        sim.open_queues(cmdq, msgq);

        let info = |q: &DmemQueue| QueueInfo {
            queue_offset: U32::new(q.offset),
            queue_size: U16::new(q.size as u16),
            queue_phy_id: q.phy_id,
            queue_log_id: q.log_id,
        };
        let mut init = InitMsg {
            msg_type: INIT_MSG_SOE_INIT,
            num_queues: 2,
            os_debug_entry_point: U16::new(0),
            q_info: [info(&cmdq), info(&msgq)],
        };
        edit(&mut init);
        if let Ok(f) = Frame::with_body(UnitId::Init, &init) {
            sim.fw.outbox.push((0, f.into_event()));
        }
        sim.deliver();
        sim
    }

    /// Second-generation part: fixed queues, firmware already attached.
    pub fn ls10() -> Self {
        let mut sim = Self::bare();
        let cmdq = DmemQueue::new(
            QueueKind::Command,
            CMDQ_LOG_ID,
            0,
            EMEM_START + LS10_CMDQ_OFFSET,
            LS10_QUEUE_LEN,
        );
        let msgq = DmemQueue::new(
            QueueKind::Message,
            MSGQ_LOG_ID,
            0,
            EMEM_START + LS10_MSGQ_OFFSET,
            LS10_QUEUE_LEN,
        );
        sim.open_queues(cmdq, msgq);
        sim.hw
            .set(regs::SOE_ATTACH_DETACH, regs::ATTACH_STATUS_ATTACHED);
        sim
    }

    /// Sets how long `unit` takes to answer, or `None` for never.
    pub fn set_latency(&mut self, unit: UnitId, ms: Option<u64>) {
        self.fw.latency.insert(unit as u8, ms);
    }

    /// Stops (or resumes) consuming the command queue.
    pub fn set_paused(&mut self, paused: bool) {
        self.fw.paused = paused;
    }

    /// Queues an unsolicited event for delivery on the next step.
    pub fn post_event(&mut self, frame: Frame) {
        self.fw.outbox.push((self.now, frame.into_event()));
        self.deliver();
    }

    /// Writes raw bytes as if firmware had produced them, advancing the
    /// message queue head past them.
    pub fn inject_raw(&mut self, bytes: &[u8]) {
        let Some(q) = self.fw.msgq else { return };
        let head = self.hw.head(q.kind, q.phy_id);
        if self.hw.copy_to(head, bytes).is_ok() {
            let next = head + drv_soe_api::align_up(bytes.len()) as u32;
            self.hw.set_head(q.kind, q.phy_id, next);
            self.raise(IrqBits::SWGEN0);
        }
    }

    /// Halts the Falcon CPU.
    pub fn halt(&mut self) {
        self.fw.halted = true;
        let cpuctl = self.hw.reg(regs::CPUCTL) | regs::CPUCTL_HALTED;
        self.hw.set(regs::CPUCTL, cpuctl);
        self.raise(IrqBits::HALT);
    }

    /// Commands firmware has taken off the command queue, oldest first.
    pub fn received(&self) -> &[Frame] {
        &self.fw.received
    }

    pub fn driver_attached(&self) -> bool {
        self.hw.reg(regs::DRIVER_ATTACH_DETACH) & regs::ATTACH_STATUS_ATTACHED
            != 0
    }

    pub fn irq_pending(&self) -> IrqBits {
        IrqBits::from_bits_truncate(self.hw.reg(regs::IRQSTAT))
    }

    /// Runs firmware for `ms` milliseconds without host involvement.
    pub fn advance(&mut self, ms: u64) {
        for _ in 0..ms {
            self.now += 1;
            self.step();
        }
    }

    fn raise(&mut self, bits: IrqBits) {
        let irq = self.hw.reg(regs::IRQSTAT) | bits.bits();
        self.hw.set(regs::IRQSTAT, irq);
    }

    fn step(&mut self) {
        if self.fw.halted {
            return;
        }
        if let (Some(cmdq), false) = (self.fw.cmdq, self.fw.paused) {
            while let Ok(Some(cmd)) = cmdq.read_frame(&mut self.hw) {
                let latency = self
                    .fw
                    .latency
                    .get(&cmd.hdr.unit_id)
                    .copied()
                    .unwrap_or(Some(1));
                if let (Some(ms), Some(unit)) = (latency, cmd.unit()) {
                    let mut reply = Frame::header_only(unit);
                    reply.hdr.seq_num_id = cmd.seq();
                    self.fw.outbox.push((self.now + ms, reply));
                }
                self.fw.received.push(cmd);
            }
        }
        self.deliver();
    }

    /// Moves every due frame into the message queue, in order, stopping at
    /// the first one that does not fit.
    fn deliver(&mut self) {
        let Some(msgq) = self.fw.msgq else { return };
        let mut sent = false;
        while let Some(i) =
            self.fw.outbox.iter().position(|(due, _)| *due <= self.now)
        {
            if msgq.write_frame(&mut self.hw, &self.fw.outbox[i].1).is_err() {
                break;
            }
            self.fw.outbox.remove(i);
            sent = true;
        }
        if sent {
            self.raise(IrqBits::SWGEN0);
        }
    }
}

impl FalconIo for SimFalcon {
    fn read(&mut self, reg: u32) -> u32 {
        if let Some(port) = Hw::ememd_port(reg) {
            let (off, ememc) = self.hw.emem_cursor(port);
            if off + 4 > self.hw.emem.len() {
                return 0;
            }
            let val = self.hw.word(off);
            if ememc & regs::EMEMC_AINCR != 0 {
                self.hw.bump(port, ememc);
            }
            return val;
        }
        self.hw.reg(reg)
    }

    fn write(&mut self, reg: u32, val: u32) {
        if let Some(port) = Hw::ememd_port(reg) {
            let (off, ememc) = self.hw.emem_cursor(port);
            if off + 4 > self.hw.emem.len() {
                return;
            }
            self.hw.set_word(off, val);
            if ememc & regs::EMEMC_AINCW != 0 {
                self.hw.bump(port, ememc);
            }
            return;
        }
        match reg {
            regs::IRQSSET => self.raise(IrqBits::from_bits_retain(val)),
            regs::IRQSCLR => {
                let irq = self.hw.reg(regs::IRQSTAT) & !val;
                self.hw.set(regs::IRQSTAT, irq);
            }
            _ => self.hw.set(reg, val),
        }
    }

    fn now_ms(&self) -> u64 {
        self.now
    }

    fn delay_ms(&mut self, ms: u64) {
        self.advance(ms);
    }
}
