// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring-buffer queues living in Falcon EMEM.
//!
//! Each queue has a head and a tail register. The producer owns the head and
//! the consumer owns the tail; both hold absolute data-space addresses. A
//! frame never wraps: when it does not fit before the end of the ring, the
//! producer drops a REWIND header at the current head and restarts at the
//! queue base. One header's worth of space is always kept free at the end
//! of the ring for that marker.

use drv_soe_api::{
    align_up, Frame, QueueHeader, SoeError, UnitId, MAX_FRAME_SIZE,
    QUEUE_HDR_SIZE,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::emem;
use crate::falcon::{regs, FalconIo};
use crate::hal::SoeHal;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Host to firmware.
    Command,
    /// Firmware to host.
    Message,
}

/// Pointer registers and memory behind a set of queues. The host reaches
/// them through EMEM ports; the simulator implements this directly.
pub trait QueueAccess {
    fn head(&mut self, kind: QueueKind, phy: u8) -> u32;
    fn set_head(&mut self, kind: QueueKind, phy: u8, val: u32);
    fn tail(&mut self, kind: QueueKind, phy: u8) -> u32;
    fn set_tail(&mut self, kind: QueueKind, phy: u8, val: u32);

    fn copy_to(&mut self, addr: u32, data: &[u8]) -> Result<(), SoeError>;
    fn copy_from(&mut self, addr: u32, data: &mut [u8])
        -> Result<(), SoeError>;
}

pub fn head_reg(kind: QueueKind, phy: u8) -> u32 {
    match kind {
        QueueKind::Command => regs::cmdq_head(phy),
        QueueKind::Message => regs::msgq_head(phy),
    }
}

pub fn tail_reg(kind: QueueKind, phy: u8) -> u32 {
    match kind {
        QueueKind::Command => regs::cmdq_tail(phy),
        QueueKind::Message => regs::msgq_tail(phy),
    }
}

/// Host view of the queues.
pub struct HostBus<'a, R, H> {
    io: &'a mut R,
    hal: &'a H,
}

impl<'a, R: FalconIo, H: SoeHal> HostBus<'a, R, H> {
    pub fn new(io: &'a mut R, hal: &'a H) -> Self {
        Self { io, hal }
    }
}

impl<R: FalconIo, H: SoeHal> QueueAccess for HostBus<'_, R, H> {
    fn head(&mut self, kind: QueueKind, phy: u8) -> u32 {
        self.io.read(head_reg(kind, phy))
    }

    fn set_head(&mut self, kind: QueueKind, phy: u8, val: u32) {
        self.io.write(head_reg(kind, phy), val)
    }

    fn tail(&mut self, kind: QueueKind, phy: u8) -> u32 {
        self.io.read(tail_reg(kind, phy))
    }

    fn set_tail(&mut self, kind: QueueKind, phy: u8, val: u32) {
        self.io.write(tail_reg(kind, phy), val)
    }

    fn copy_to(&mut self, addr: u32, data: &[u8]) -> Result<(), SoeError> {
        let port = self.hal.queue_port();
        emem::copy_to(self.io, self.hal, port, addr, data)
    }

    fn copy_from(
        &mut self,
        addr: u32,
        data: &mut [u8],
    ) -> Result<(), SoeError> {
        let port = self.hal.queue_port();
        emem::copy_from(self.io, self.hal, port, addr, data)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmemQueue {
    pub kind: QueueKind,
    pub log_id: u8,
    pub phy_id: u8,
    /// Address of the first byte of the ring.
    pub offset: u32,
    /// Ring length in bytes.
    pub size: u32,
}

impl DmemQueue {
    pub fn new(
        kind: QueueKind,
        log_id: u8,
        phy_id: u8,
        offset: u32,
        size: u32,
    ) -> Self {
        Self {
            kind,
            log_id,
            phy_id,
            offset,
            size,
        }
    }

    /// Like [`DmemQueue::new`], for a ring described by firmware. The ring
    /// must hold more than a header and end inside the 32-bit data space.
    pub fn try_new(
        kind: QueueKind,
        log_id: u8,
        phy_id: u8,
        offset: u32,
        size: u32,
    ) -> Result<Self, SoeError> {
        if size <= QUEUE_HDR_SIZE as u32 || offset.checked_add(size).is_none() {
            return Err(SoeError::InitFailed);
        }
        Ok(Self::new(kind, log_id, phy_id, offset, size))
    }

    fn end(&self) -> u32 {
        self.offset.saturating_add(self.size)
    }

    pub fn is_empty<B: QueueAccess>(&self, bus: &mut B) -> bool {
        bus.head(self.kind, self.phy_id) == bus.tail(self.kind, self.phy_id)
    }

    /// Points both registers at the base of the ring.
    pub fn reset<B: QueueAccess>(&self, bus: &mut B) {
        bus.set_head(self.kind, self.phy_id, self.offset);
        bus.set_tail(self.kind, self.phy_id, self.offset);
    }

    /// Works out where a `need`-byte frame can go. Returns `None` if there is
    /// no room; otherwise the write position, and whether the producer has to
    /// rewind first.
    fn place(&self, head: u32, tail: u32, need: u32) -> Option<(u32, bool)> {
        let mut head = head;
        let mut rewind = false;
        let mut free = 0;

        if head >= tail {
            free = self
                .end()
                .saturating_sub(head)
                .saturating_sub(QUEUE_HDR_SIZE as u32);
            if need > free {
                rewind = true;
                head = self.offset;
            }
        }
        if head < tail {
            free = tail - head - 1;
        }

        (need <= free).then_some((head, rewind))
    }

    /// Whether a frame of `size` bytes would fit right now.
    pub fn has_room<B: QueueAccess>(&self, bus: &mut B, size: usize) -> bool {
        let head = bus.head(self.kind, self.phy_id);
        let tail = bus.tail(self.kind, self.phy_id);
        self.place(head, tail, align_up(size) as u32).is_some()
    }

    /// Appends `frame` as producer. Fails with `QueueFull` without touching
    /// the queue if it does not fit.
    pub fn write_frame<B: QueueAccess>(
        &self,
        bus: &mut B,
        frame: &Frame,
    ) -> Result<(), SoeError> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = frame.encode(&mut buf)?;
        let need = align_up(len) as u32;

        let head = bus.head(self.kind, self.phy_id);
        let tail = bus.tail(self.kind, self.phy_id);
        let (pos, rewind) =
            self.place(head, tail, need).ok_or(SoeError::QueueFull)?;

        if rewind {
            bus.copy_to(head, QueueHeader::rewind().as_bytes())?;
        }
        bus.copy_to(pos, &buf[..len])?;
        bus.set_head(self.kind, self.phy_id, pos + need);
        Ok(())
    }

    /// Takes the next frame as consumer. Returns `Ok(None)` when the queue
    /// is empty.
    ///
    /// A frame with a sane size but an unknown unit is consumed and reported
    /// as `MalformedFrame`. A header whose size cannot be trusted leaves no
    /// way to find the next frame, so the consumer skips to the producer's
    /// position and reports `MalformedFrame`.
    pub fn read_frame<B: QueueAccess>(
        &self,
        bus: &mut B,
    ) -> Result<Option<Frame>, SoeError> {
        let head = bus.head(self.kind, self.phy_id);
        let mut tail = bus.tail(self.kind, self.phy_id);
        if head == tail {
            return Ok(None);
        }

        let mut hdr = self.read_header(bus, tail)?;
        if hdr.unit_id == UnitId::Rewind as u8 {
            tail = self.offset;
            bus.set_tail(self.kind, self.phy_id, tail);
            if head == tail {
                return Ok(None);
            }
            hdr = self.read_header(bus, tail)?;
        }

        let size = usize::from(hdr.size);
        let limit = if head > tail { head } else { self.end() };
        let next = tail
            .checked_add(align_up(size) as u32)
            .filter(|&n| n <= limit)
            .filter(|_| (QUEUE_HDR_SIZE..=MAX_FRAME_SIZE).contains(&size));
        let Some(next) = next else {
            bus.set_tail(self.kind, self.phy_id, head);
            return Err(SoeError::MalformedFrame);
        };

        let mut buf = [0u8; MAX_FRAME_SIZE];
        bus.copy_from(tail, &mut buf[..size])?;
        bus.set_tail(self.kind, self.phy_id, next);

        let frame = Frame::decode(&buf[..size])?;
        if frame.unit().is_none() {
            return Err(SoeError::MalformedFrame);
        }
        Ok(Some(frame))
    }

    fn read_header<B: QueueAccess>(
        &self,
        bus: &mut B,
        at: u32,
    ) -> Result<QueueHeader, SoeError> {
        let mut raw = [0u8; QUEUE_HDR_SIZE];
        bus.copy_from(at, &mut raw)?;
        QueueHeader::read_from_bytes(&raw).map_err(|_| SoeError::MalformedFrame)
    }
}
