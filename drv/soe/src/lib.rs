// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host driver for the SOE Falcon.
//!
//! The SOE is an embedded Falcon that takes administrative work (cable
//! onboarding, thermal monitoring, port control) off the host. The host talks
//! to it through two ring buffers in the Falcon's EMEM aperture: commands go
//! down the command queue, and replies and unsolicited events come back on
//! the message queue, announced by the SWGEN0 interrupt.
//!
//! [`Soe`] owns both queues, the [`seq::Sequencer`] that correlates replies
//! with commands, and the [`event::EventRegistry`] that routes events.
//! Nothing here blocks except [`Soe::post_blocking`] and [`Soe::init`], both
//! bounded by explicit timeouts.
//!
//! The chip generation is picked by the [`hal::SoeHal`] type parameter.

#![cfg_attr(not(any(test, feature = "sim")), no_std)]

pub mod emem;
pub mod event;
pub mod falcon;
pub mod hal;
pub mod listeners;
pub mod queue;
pub mod seq;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use drv_soe_api::body::{IngressStopCmd, InitMsg, INIT_MSG_SOE_INIT};
use drv_soe_api::{
    align_up, CtrlFlags, Frame, QueueHeader, SoeError, UnitId, CMDQ_LOG_ID,
    MAX_FRAME_SIZE, MSGQ_LOG_ID, PORT_TIMEOUT_MS, QUEUE_HDR_SIZE,
};
pub use drv_soe_api::ADMIN_TIMEOUT_MS;
use ringbuf::{ringbuf_entry, Ringbuf};
use zerocopy::FromBytes;

use crate::event::{Dispatch, EventFault, EventRegistry, Handler};
use crate::falcon::{regs, Diagnostics, FalconIo, IrqBits};
use crate::hal::{Boot, SoeHal};
use crate::listeners::{CciNotice, SoeEvents};
use crate::queue::{DmemQueue, HostBus, QueueKind};
use crate::seq::{CmdState, Completion, Sequencer};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    QueuesReady { cmdq: u32, msgq: u32 },
    InitFailed,
    InitIgnored,
    Posted { unit: u8, seq: u8, desc: u32 },
    QueueFullRetry { seq: u8 },
    QueueFull { seq: u8 },
    NoFreeSequence,
    Reply { seq: u8 },
    LateReply { seq: u8 },
    UnknownSequence { seq: u8 },
    DuplicateReply { seq: u8 },
    Event(UnitId),
    EventFault(UnitId, EventFault),
    UnclaimedEvent(u8),
    MalformedFrame,
    DrainFailed(SoeError),
    Timeout { desc: u32 },
    Irq(u32),
    Watchdog,
    ExtErr,
    Halted,
    Swgen1,
    Rearmed,
    NullTestFailed(SoeError),
    Detached,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Queues {
    pub cmd: DmemQueue,
    pub msg: DmemQueue,
}

pub struct Soe<R: FalconIo, H: SoeHal> {
    io: R,
    hal: H,
    queues: Option<Queues>,
    seq: Sequencer,
    registry: EventRegistry<SoeEvents>,
    events: SoeEvents,
    listener_descs: heapless::Vec<u32, 4>,
    os_ready: bool,
    diag: Option<Diagnostics>,
    trace: Ringbuf<Trace, 64>,
}

impl<R: FalconIo, H: SoeHal> Soe<R, H> {
    pub fn new(io: R, hal: H) -> Self {
        Self {
            io,
            hal,
            queues: None,
            seq: Sequencer::new(),
            registry: EventRegistry::new(),
            events: SoeEvents::default(),
            listener_descs: heapless::Vec::new(),
            os_ready: false,
            diag: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Waits for firmware to come up, installs the engine's listeners, and
    /// checks the round trip with a NULL command.
    pub fn init(&mut self) -> Result<(), SoeError> {
        self.wait_for_init_ack(ADMIN_TIMEOUT_MS)?;
        self.register_listeners()?;
        self.test_null()
    }

    /// Detaches from firmware. Outstanding commands are forgotten.
    pub fn teardown(&mut self) {
        while let Some(desc) = self.listener_descs.pop() {
            let _ = self.registry.unregister(desc);
        }
        self.seq.cancel_all();
        if matches!(self.hal.boot(), Boot::FixedChannels { .. }) {
            self.hal.attach(&mut self.io, false);
        }
        self.queues = None;
        self.os_ready = false;
        ringbuf_entry!(self.trace, Trace::Detached);
    }

    pub fn is_ready(&self) -> bool {
        self.os_ready
    }

    pub fn wait_for_init_ack(&mut self, timeout_ms: u64) -> Result<(), SoeError> {
        let deadline = self.io.now_ms().saturating_add(timeout_ms);
        loop {
            self.bring_up_queues();
            if self.os_ready {
                return Ok(());
            }
            if self.io.now_ms() >= deadline {
                ringbuf_entry!(self.trace, Trace::InitFailed);
                return Err(SoeError::InitFailed);
            }
            self.io.delay_ms(1);
        }
    }

    /// Locates the queues if that has not happened yet.
    fn bring_up_queues(&mut self) {
        if self.os_ready {
            return;
        }
        match self.hal.boot() {
            Boot::InitMessage => match self.read_init_message() {
                Ok(()) | Err(SoeError::NotReady) => (),
                Err(_) => ringbuf_entry!(self.trace, Trace::InitFailed),
            },
            Boot::FixedChannels {
                cmdq_offset,
                msgq_offset,
                queue_len,
            } => {
                if !self.hal.soe_attached(&mut self.io) {
                    return;
                }
                match self.fixed_queues(cmdq_offset, msgq_offset, queue_len) {
                    Ok(q) => {
                        self.set_queues(q);
                        self.hal.attach(&mut self.io, true);
                    }
                    Err(_) => ringbuf_entry!(self.trace, Trace::InitFailed),
                }
            }
        }
    }

    fn fixed_queues(
        &mut self,
        cmdq_offset: u32,
        msgq_offset: u32,
        queue_len: u32,
    ) -> Result<Queues, SoeError> {
        let base = self.hal.emem_start(&mut self.io)?;
        let at = |off: u32| base.checked_add(off).ok_or(SoeError::InitFailed);
        let cmd = DmemQueue::try_new(
            QueueKind::Command,
            CMDQ_LOG_ID,
            0,
            at(cmdq_offset)?,
            queue_len,
        )?;
        let msg = DmemQueue::try_new(
            QueueKind::Message,
            MSGQ_LOG_ID,
            0,
            at(msgq_offset)?,
            queue_len,
        )?;
        Ok(Queues { cmd, msg })
    }

    fn set_queues(&mut self, q: Queues) {
        self.queues = Some(q);
        self.os_ready = true;
        ringbuf_entry!(
            self.trace,
            Trace::QueuesReady {
                cmdq: q.cmd.offset,
                msgq: q.msg.offset,
            }
        );
    }

    /// Reads the INIT message straight out of EMEM. Until it is parsed there
    /// is no queue object to read through, so the message queue registers are
    /// used directly.
    fn read_init_message(&mut self) -> Result<(), SoeError> {
        let port = self.hal.queue_port();
        let head = self.io.read(regs::msgq_head(0));
        let tail = self.io.read(regs::msgq_tail(0));
        if head == tail {
            return Err(SoeError::NotReady);
        }

        let mut raw = [0u8; MAX_FRAME_SIZE];
        emem::copy_from(
            &mut self.io,
            &self.hal,
            port,
            tail,
            &mut raw[..QUEUE_HDR_SIZE],
        )?;
        let hdr = QueueHeader::read_from_bytes(&raw[..QUEUE_HDR_SIZE])
            .map_err(|_| SoeError::MalformedFrame)?;
        let size = usize::from(hdr.size);
        let min = QUEUE_HDR_SIZE + core::mem::size_of::<InitMsg>();
        if hdr.unit_id != UnitId::Init as u8 || size < min || size > MAX_FRAME_SIZE
        {
            return Err(SoeError::MalformedFrame);
        }

        emem::copy_from(&mut self.io, &self.hal, port, tail, &mut raw[..size])?;
        let frame = Frame::decode(&raw[..size])?;
        let next = tail
            .checked_add(align_up(size) as u32)
            .ok_or(SoeError::MalformedFrame)?;
        self.handle_init(&frame)?;
        self.io.write(regs::msgq_tail(0), next);
        Ok(())
    }

    fn handle_init(&mut self, frame: &Frame) -> Result<(), SoeError> {
        let init: InitMsg = frame.body_as().ok_or(SoeError::MalformedFrame)?;
        if init.msg_type != INIT_MSG_SOE_INIT {
            return Err(SoeError::InitFailed);
        }

        let mut cmd = None;
        let mut msg = None;
        let n = usize::from(init.num_queues).min(init.q_info.len());
        for qi in &init.q_info[..n] {
            let kind = match qi.queue_log_id {
                CMDQ_LOG_ID => QueueKind::Command,
                MSGQ_LOG_ID => QueueKind::Message,
                _ => continue,
            };
            let q = DmemQueue::try_new(
                kind,
                qi.queue_log_id,
                qi.queue_phy_id,
                qi.queue_offset.get(),
                u32::from(qi.queue_size.get()),
            )?;
            match kind {
                QueueKind::Command => cmd = Some(q),
                QueueKind::Message => msg = Some(q),
            }
        }

        match (cmd, msg) {
            (Some(cmd), Some(msg)) => {
                self.set_queues(Queues { cmd, msg });
                Ok(())
            }
            _ => Err(SoeError::InitFailed),
        }
    }

    fn register_listeners(&mut self) -> Result<(), SoeError> {
        for &unit in self.hal.event_units() {
            let handler: Handler<SoeEvents> = match unit {
                UnitId::Therm => listeners::therm,
                UnitId::Cci => listeners::cci,
                UnitId::Heartbeat => listeners::heartbeat,
                _ => continue,
            };
            if self.registry.is_registered(unit) {
                continue;
            }
            let desc = self.registry.register(unit, handler)?;
            self.listener_descs
                .push(desc)
                .map_err(|_| SoeError::RegistryFull)?;
        }
        Ok(())
    }

    /// Sends a header-only NULL command and waits for its reply.
    pub fn test_null(&mut self) -> Result<(), SoeError> {
        let r = self.post_blocking(&Frame::header_only(UnitId::Null), ADMIN_TIMEOUT_MS);
        if let Err(e) = r {
            ringbuf_entry!(self.trace, Trace::NullTestFailed(e));
        }
        r.map(|_| ())
    }

    /// Stops or restarts ingress traffic on `nport`.
    pub fn issue_ingress_stop(
        &mut self,
        nport: u32,
        stop: bool,
    ) -> Result<(), SoeError> {
        let cmd = Frame::with_body(UnitId::Core, &IngressStopCmd::new(nport, stop))?;
        self.post_blocking(&cmd, PORT_TIMEOUT_MS).map(|_| ())
    }

    fn validate(&self, q: &Queues, frame: &Frame) -> Result<(), SoeError> {
        let target = frame.unit().is_some_and(UnitId::is_command_target);
        let len = frame.len();
        if !target
            || len < QUEUE_HDR_SIZE
            || len != QUEUE_HDR_SIZE + frame.body.len()
            || len > (q.cmd.size / 2) as usize
        {
            return Err(SoeError::InvalidCommand);
        }
        Ok(())
    }

    /// Queues `frame` and returns its descriptor without waiting for the
    /// reply. If the queue is full, retries until `timeout_ms` runs out.
    pub fn post(&mut self, frame: &Frame, timeout_ms: u64) -> Result<u32, SoeError> {
        let q = match self.queues {
            Some(q) if self.os_ready => q,
            _ => return Err(SoeError::NotReady),
        };
        self.validate(&q, frame)?;

        let id = match self.seq.acquire() {
            Ok(id) => id,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::NoFreeSequence);
                return Err(e);
            }
        };
        let deadline = self.io.now_ms().saturating_add(timeout_ms);
        let desc = self.seq.assign(id, Some(deadline));

        let mut f = frame.clone();
        f.hdr.seq_num_id = id;
        f.hdr.ctrl_flags = CtrlFlags::STATUS.bits();

        loop {
            let r = q
                .cmd
                .write_frame(&mut HostBus::new(&mut self.io, &self.hal), &f);
            match r {
                Ok(()) => break,
                Err(SoeError::QueueFull) => {
                    if self.hal.is_cpu_halted(&mut self.io) {
                        self.seq.release(id);
                        self.capture_diagnostics();
                        ringbuf_entry!(self.trace, Trace::Halted);
                        return Err(SoeError::Halted);
                    }
                    if self.io.now_ms() >= deadline {
                        self.seq.release(id);
                        ringbuf_entry!(self.trace, Trace::QueueFull { seq: id });
                        return Err(SoeError::QueueFull);
                    }
                    ringbuf_entry!(self.trace, Trace::QueueFullRetry { seq: id });
                    self.io.delay_ms(1);
                    self.service();
                }
                Err(e) => {
                    self.seq.release(id);
                    return Err(e);
                }
            }
        }

        self.seq.mark_used(id);
        ringbuf_entry!(
            self.trace,
            Trace::Posted {
                unit: f.hdr.unit_id,
                seq: id,
                desc,
            }
        );
        Ok(desc)
    }

    /// Waits up to `timeout_ms` for the reply to `desc`, servicing interrupts
    /// in the meantime.
    pub fn wait(&mut self, desc: u32, timeout_ms: u64) -> Result<Frame, SoeError> {
        let deadline = self.io.now_ms().saturating_add(timeout_ms);
        self.wait_until(desc, deadline)
    }

    fn wait_until(&mut self, desc: u32, deadline: u64) -> Result<Frame, SoeError> {
        loop {
            self.service();
            if let Some(reply) = self.seq.take_reply(desc) {
                return Ok(reply);
            }
            if self.seq.status(desc) != CmdState::Running {
                return Err(SoeError::UnknownSequence);
            }
            if self.hal.is_cpu_halted(&mut self.io) {
                return Err(SoeError::Halted);
            }
            if self.io.now_ms() >= deadline {
                return Err(SoeError::Timeout);
            }
            self.io.delay_ms(1);
        }
    }

    /// Posts `frame` and waits for its reply, all within `timeout_ms`.
    ///
    /// On timeout the command is abandoned: its sequence id stays reserved
    /// until firmware answers, and the late answer is discarded by a later
    /// drain. The queues are left consistent.
    pub fn post_blocking(
        &mut self,
        frame: &Frame,
        timeout_ms: u64,
    ) -> Result<Frame, SoeError> {
        let desc = self.post(frame, timeout_ms)?;
        let deadline = self
            .seq
            .deadline(desc)
            .unwrap_or_else(|| self.io.now_ms().saturating_add(timeout_ms));

        match self.wait_until(desc, deadline) {
            Err(e @ (SoeError::Timeout | SoeError::Halted)) => {
                let _ = self.seq.cancel(desc);
                self.capture_diagnostics();
                ringbuf_entry!(self.trace, Trace::Timeout { desc });
                Err(e)
            }
            r => r,
        }
    }

    pub fn cmd_status(&self, desc: u32) -> CmdState {
        self.seq.status(desc)
    }

    pub fn cmd_cancel(&mut self, desc: u32) -> Result<(), SoeError> {
        self.seq.cancel(desc).map(|_| ())
    }

    pub fn register_event(
        &mut self,
        unit: UnitId,
        handler: Handler<SoeEvents>,
    ) -> Result<u32, SoeError> {
        self.registry.register(unit, handler)
    }

    pub fn unregister_event(&mut self, desc: u32) -> Result<UnitId, SoeError> {
        self.registry.unregister(desc)
    }

    /// Services pending Falcon interrupts and returns whatever is still
    /// pending afterwards.
    pub fn service(&mut self) -> IrqBits {
        let status = self.hal.intr_status(&mut self.io);
        if status.is_empty() {
            return status;
        }
        ringbuf_entry!(self.trace, Trace::Irq(status.bits()));

        let mut clear = IrqBits::empty();
        if status.contains(IrqBits::WDTMR) {
            ringbuf_entry!(self.trace, Trace::Watchdog);
            clear |= IrqBits::WDTMR;
        }
        if status.contains(IrqBits::EXTERR) {
            ringbuf_entry!(self.trace, Trace::ExtErr);
            clear |= IrqBits::EXTERR;
        }
        if status.contains(IrqBits::HALT) {
            clear |= IrqBits::HALT;
            self.capture_diagnostics();
            ringbuf_entry!(self.trace, Trace::Halted);
        }
        let recheck = status.contains(IrqBits::SWGEN0);
        if recheck {
            clear |= IrqBits::SWGEN0;
            self.drain_messages();
        }
        if status.contains(IrqBits::SWGEN1) {
            ringbuf_entry!(self.trace, Trace::Swgen1);
            clear |= IrqBits::SWGEN1;
        }
        self.io.write(regs::IRQSCLR, clear.bits());

        // SWGEN0 is now clear, so anything that landed in the message queue
        // during the drain needs a fresh interrupt.
        if recheck {
            if let Some(q) = self.queues {
                if !q.msg.is_empty(&mut HostBus::new(&mut self.io, &self.hal)) {
                    self.io.write(regs::IRQSSET, IrqBits::SWGEN0.bits());
                    ringbuf_entry!(self.trace, Trace::Rearmed);
                }
            }
        }

        self.hal.intr_status(&mut self.io)
    }

    /// Takes the next frame off the message queue without acting on it.
    pub fn pop_message(&mut self) -> Result<Option<Frame>, SoeError> {
        let q = self.queues.ok_or(SoeError::NotReady)?;
        q.msg.read_frame(&mut HostBus::new(&mut self.io, &self.hal))
    }

    /// Processes every frame in the message queue: replies complete their
    /// commands and events go to listeners. Returns the number of frames
    /// handled.
    pub fn drain_messages(&mut self) -> usize {
        self.bring_up_queues();
        if !self.os_ready {
            return 0;
        }

        let mut n = 0;
        loop {
            match self.pop_message() {
                Ok(Some(frame)) => {
                    n += 1;
                    self.handle_message(frame);
                }
                Ok(None) => break,
                // The queue has already stepped past the bad frame.
                Err(SoeError::MalformedFrame) => {
                    ringbuf_entry!(self.trace, Trace::MalformedFrame);
                }
                Err(e) => {
                    ringbuf_entry!(self.trace, Trace::DrainFailed(e));
                    break;
                }
            }
        }
        n
    }

    fn handle_message(&mut self, frame: Frame) {
        if frame.is_event() {
            if frame.unit() == Some(UnitId::Init) {
                if self.os_ready || self.handle_init(&frame).is_err() {
                    ringbuf_entry!(self.trace, Trace::InitIgnored);
                }
                return;
            }
            let t = match self.registry.dispatch(&mut self.events, &frame) {
                Dispatch::Handled(u) => Trace::Event(u),
                Dispatch::Faulted(u, e) => Trace::EventFault(u, e),
                Dispatch::Unclaimed(u) => Trace::UnclaimedEvent(u),
            };
            ringbuf_entry!(self.trace, t);
            return;
        }

        let seq = frame.seq();
        let t = match self.seq.complete(seq, frame) {
            Completion::Delivered => Trace::Reply { seq },
            Completion::Late => Trace::LateReply { seq },
            Completion::Unknown => Trace::UnknownSequence { seq },
            Completion::Duplicate => Trace::DuplicateReply { seq },
        };
        ringbuf_entry!(self.trace, t);
    }

    fn capture_diagnostics(&mut self) {
        if cfg!(debug_assertions) {
            let phy = self.queues.map(|q| q.cmd.phy_id).unwrap_or(0);
            self.diag = Some(Diagnostics::capture(&mut self.io, phy));
        }
    }

    /// Registers captured at the last timeout or halt (debug builds only).
    pub fn diagnostics(&self) -> Option<Diagnostics> {
        self.diag
    }

    pub fn events(&self) -> &SoeEvents {
        &self.events
    }

    /// Hands over CCI notifications received since the last call.
    pub fn take_cci_notice(&mut self) -> CciNotice {
        core::mem::take(&mut self.events.cci)
    }

    pub fn queues(&self) -> Option<Queues> {
        self.queues
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.seq
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut R {
        &mut self.io
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }
}
