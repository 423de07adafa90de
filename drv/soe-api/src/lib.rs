// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format shared between the host driver and the SOE Falcon firmware.
//!
//! Every frame exchanged through the command and message queues starts with a
//! four byte [`QueueHeader`]. The header's `size` covers the header itself, so
//! a header-only frame has size [`QUEUE_HDR_SIZE`]. Frames are padded to
//! [`DMEM_ALIGNMENT`] in the queue, but `size` records the unpadded length.

#![cfg_attr(not(test), no_std)]

pub mod body;
pub mod cci;

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Logical id of the host-to-firmware command queue.
pub const CMDQ_LOG_ID: u8 = 0;
/// Logical id of the firmware-to-host message queue.
pub const MSGQ_LOG_ID: u8 = 1;
/// Number of logical queues the firmware exposes.
pub const NUM_QUEUES: usize = 2;

/// Number of distinct sequence ids; `seq_num_id` is a byte.
pub const MAX_SEQUENCES: usize = 256;

/// Queue positions advance in units of this many bytes.
pub const DMEM_ALIGNMENT: usize = 4;

/// Largest frame either side will put in a queue.
pub const MAX_FRAME_SIZE: usize = 128;
pub const MAX_BODY_SIZE: usize = MAX_FRAME_SIZE - QUEUE_HDR_SIZE;

/// Timeout for administrative commands (init handshake, NULL test,
/// shutdown).
pub const ADMIN_TIMEOUT_MS: u64 = 5000;
/// Timeout for per-port control commands.
pub const PORT_TIMEOUT_MS: u64 = 5;

/// Rounds `n` up to the queue alignment.
pub const fn align_up(n: usize) -> usize {
    (n + DMEM_ALIGNMENT - 1) & !(DMEM_ALIGNMENT - 1)
}

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
pub struct QueueHeader {
    pub unit_id: u8,
    pub size: u8,
    pub ctrl_flags: u8,
    pub seq_num_id: u8,
}

pub const QUEUE_HDR_SIZE: usize = core::mem::size_of::<QueueHeader>();
const_assert!(QUEUE_HDR_SIZE == 4);
const_assert!(MAX_FRAME_SIZE <= u8::MAX as usize);
const_assert!(MAX_FRAME_SIZE % DMEM_ALIGNMENT == 0);

impl QueueHeader {
    pub fn unit(&self) -> Option<UnitId> {
        UnitId::from_u8(self.unit_id)
    }

    pub fn flags(&self) -> CtrlFlags {
        CtrlFlags::from_bits_truncate(self.ctrl_flags)
    }

    pub fn is_event(&self) -> bool {
        self.flags().contains(CtrlFlags::EVENT)
    }

    /// Header that tells the consumer to continue reading at the start of
    /// the queue.
    pub const fn rewind() -> Self {
        Self {
            unit_id: UnitId::Rewind as u8,
            size: QUEUE_HDR_SIZE as u8,
            ctrl_flags: 0,
            seq_num_id: 0,
        }
    }
}

/// Firmware units. Commands are routed to a unit; events are tagged with the
/// unit that raised them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum UnitId {
    Rewind = 0x00,
    Init = 0x01,
    Null = 0x02,
    Unload = 0x03,
    Core = 0x04,
    Therm = 0x05,
    Cci = 0x06,
    Heartbeat = 0x07,
}

impl UnitId {
    /// Whether a host command may be addressed to this unit. `Rewind` is a
    /// queue marker and `Init` only ever flows from firmware to host.
    pub fn is_command_target(self) -> bool {
        !matches!(self, UnitId::Rewind | UnitId::Init)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct CtrlFlags: u8 {
        /// The host wants a reply for this command.
        const STATUS = 1 << 0;
        /// The frame is an unsolicited event rather than a reply.
        const EVENT = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, FromPrimitive, PartialEq, Eq)]
#[repr(u32)]
pub enum SoeError {
    /// No room for the frame before the deadline.
    QueueFull = 1,
    /// Every sequence id is in flight.
    NoFreeSequence,
    /// No reply before the deadline. The queues are still consistent.
    Timeout,
    /// A frame read from the message queue could not be parsed.
    MalformedFrame,
    /// The Falcon CPU is halted.
    Halted,
    /// The firmware has not completed its init handshake.
    NotReady,
    /// The command failed validation before being queued.
    InvalidCommand,
    /// An EMEM transfer was outside the aperture, misaligned or empty.
    BadEmemAccess,
    /// The sequence id or descriptor is not tracked.
    UnknownSequence,
    /// The unit id is not a valid event source.
    InvalidUnit,
    /// A listener is already registered for the unit.
    DuplicateUnit,
    /// The event descriptor is not registered.
    NotFound,
    /// The event registry has no free slots.
    RegistryFull,
    /// The init handshake did not complete.
    InitFailed,
}

/// A frame as it travels through a queue: header plus an opaque body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub hdr: QueueHeader,
    pub body: heapless::Vec<u8, MAX_BODY_SIZE>,
}

impl Frame {
    /// Builds a frame for `unit` carrying `body`; the size field is filled
    /// in.
    pub fn new(unit: UnitId, body: &[u8]) -> Result<Self, SoeError> {
        let body = heapless::Vec::from_slice(body)
            .map_err(|_| SoeError::InvalidCommand)?;
        Ok(Self {
            hdr: QueueHeader {
                unit_id: unit as u8,
                size: (QUEUE_HDR_SIZE + body.len()) as u8,
                ctrl_flags: 0,
                seq_num_id: 0,
            },
            body,
        })
    }

    /// Builds a frame carrying `body` as its payload.
    pub fn with_body<T: IntoBytes + Immutable>(
        unit: UnitId,
        body: &T,
    ) -> Result<Self, SoeError> {
        Self::new(unit, body.as_bytes())
    }

    /// A frame with no body, such as the NULL test command.
    pub fn header_only(unit: UnitId) -> Self {
        Self {
            hdr: QueueHeader {
                unit_id: unit as u8,
                size: QUEUE_HDR_SIZE as u8,
                ctrl_flags: 0,
                seq_num_id: 0,
            },
            body: heapless::Vec::new(),
        }
    }

    /// Marks this frame as an event. Used by firmware-side code and tests.
    pub fn into_event(mut self) -> Self {
        self.hdr.ctrl_flags |= CtrlFlags::EVENT.bits();
        self
    }

    pub fn unit(&self) -> Option<UnitId> {
        self.hdr.unit()
    }

    pub fn is_event(&self) -> bool {
        self.hdr.is_event()
    }

    pub fn seq(&self) -> u8 {
        self.hdr.seq_num_id
    }

    /// Length on the wire, before alignment padding.
    pub fn len(&self) -> usize {
        usize::from(self.hdr.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the frame into `out`, returning the number of bytes
    /// written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, SoeError> {
        let total = QUEUE_HDR_SIZE + self.body.len();
        let dest = out.get_mut(..total).ok_or(SoeError::InvalidCommand)?;
        let (hdr, body) = dest.split_at_mut(QUEUE_HDR_SIZE);
        hdr.copy_from_slice(self.hdr.as_bytes());
        body.copy_from_slice(&self.body);
        Ok(total)
    }

    /// Parses a frame from `bytes`, which must hold at least `size` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, SoeError> {
        let (hdr, rest) = QueueHeader::read_from_prefix(bytes)
            .map_err(|_| SoeError::MalformedFrame)?;
        let size = usize::from(hdr.size);
        if size < QUEUE_HDR_SIZE || size > MAX_FRAME_SIZE {
            return Err(SoeError::MalformedFrame);
        }
        let body = rest
            .get(..size - QUEUE_HDR_SIZE)
            .ok_or(SoeError::MalformedFrame)?;
        let body = heapless::Vec::from_slice(body)
            .map_err(|_| SoeError::MalformedFrame)?;
        Ok(Self { hdr, body })
    }

    /// Interprets the start of the body as `T`. Returns `None` if the body is
    /// too short.
    pub fn body_as<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.body).ok().map(|(t, _)| t)
    }
}
