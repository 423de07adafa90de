// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The onboarding engine.
//!
//! Every onboard poll visits each cage once. If the module's CMIS lock can
//! be taken, exactly one phase runs and exactly one transition is committed
//! (possibly back to the same phase). Phases never wait: a module that
//! needs time to settle parks in `Sleep` with a deadline that later polls
//! check.
//!
//! Continuous ALI ("asynchronous link initialization") means links are
//! retrained whenever they are down. With it off, only links a client has
//! asked for with [`CciDevice::request_ali`] are trained, and idle modules
//! rest in `NonContinuousAli`.

use drv_soe_api::cci::{OnboardPhaseCmd, PhaseCode, SubPhaseCode};
use enum_map::{Enum, EnumMap};
use poll_cadence::Cadence;
use ringbuf::{ringbuf_entry, Ringbuf};

use crate::cmis::{self, LockOwner, Target};
use crate::config::CciConfig;
use crate::cpld;
use crate::led::{CageLeds, LedState, Locate, Port};
use crate::links::LinkMap;
use crate::module::{CableType, ModuleState, Phase};
use crate::platform::{CmisBus, LinkMasks, Platform};
use crate::{bits, CciError, MAX_LINKS, MAX_MODULES};

/// Work scheduled off the main poll.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum Task {
    Presence,
    Onboard,
    Traffic,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Trace {
    None,
    Phase {
        module: u8,
        from: PhaseCode,
        to: PhaseCode,
    },
    LockSkipped(u8),
    LockRetained(u8),
    ModuleReset(u8),
    ModuleResetFailed(u8, CciError),
    LinkResetFailed {
        module: u8,
        forced: bool,
        err: CciError,
    },
    PhaseFailed {
        module: u8,
        phase: PhaseCode,
        err: CciError,
    },
    AliFailed {
        link: u8,
        err: CciError,
    },
    HotPlug(u8),
    AttemptsExhausted(u8),
    ErrorsChecked {
        module: u8,
        hw_good: bool,
    },
    Presence {
        arrived: u32,
        departed: u32,
    },
    PresenceReadFailed(CciError),
    PowerFailed(u8, CciError),
    FaultNotice(u32),
    PresenceNotice(u32),
    Demoted(u8),
    AliReenabled(u8),
    ContinuousAli(bool),
    ShutdownFailed(u8, CciError),
    Leds {
        module: u8,
        leds: CageLeds,
    },
    LedFailed(u8, CciError),
    Quiesced,
}

pub struct CciDevice {
    map: LinkMap,
    modules: [ModuleState; MAX_MODULES],
    cages: u32,
    present: u32,
    max_attempts: u32,
    lock_timeout_ms: u64,
    onboard_cmd_timeout_ms: u64,
    shutdown_cmd_timeout_ms: u64,

    continuous_ali: bool,
    /// Links a client asked to train while continuous ALI is off.
    ali_requested: u64,
    /// Modules that should pick continuous ALI back up.
    ali_reenable: u32,
    enabled: u64,

    traffic_prev: [u64; MAX_LINKS],
    traffic: u64,
    traffic_baseline: bool,

    /// What each cage's LEDs show.
    leds: [CageLeds; MAX_MODULES],
    locate: [Locate; MAX_MODULES],

    cadence: Cadence<Task>,
    quiesced: bool,
    trace: Ringbuf<Trace, 64>,
}

impl CciDevice {
    pub fn new(cfg: &CciConfig) -> Result<Self, CciError> {
        cfg.validate()?;
        let map = LinkMap::new(&cfg.link_map)?;

        let mut cadence = Cadence::new(cfg.polling_rate_hz);
        for (task, rate) in [
            (Task::Presence, cfg.presence_rate_hz),
            (Task::Onboard, cfg.onboard_rate_hz),
            (Task::Traffic, cfg.traffic_rate_hz),
        ] {
            cadence.register(task, rate).map_err(|_| CciError::BadArgs)?;
        }

        Ok(Self {
            map,
            modules: core::array::from_fn(|m| {
                ModuleState::new(cfg.continuous_ali, cfg.rx_det_mask & (1 << m) != 0)
            }),
            cages: cfg.cages_mask,
            present: 0,
            max_attempts: cfg.max_onboard_attempts,
            lock_timeout_ms: cfg.cmis_lock_timeout_ms,
            onboard_cmd_timeout_ms: cfg.onboard_cmd_timeout_ms,
            shutdown_cmd_timeout_ms: cfg.shutdown_cmd_timeout_ms,
            continuous_ali: cfg.continuous_ali,
            ali_requested: 0,
            ali_reenable: 0,
            enabled: 0,
            traffic_prev: [0; MAX_LINKS],
            traffic: 0,
            traffic_baseline: false,
            leds: [CageLeds::OFF; MAX_MODULES],
            locate: [Locate::default(); MAX_MODULES],
            cadence,
            quiesced: false,
            trace: Ringbuf::new(Trace::None),
        })
    }

    /// Reads the enabled links and the LEDs, and powers up whatever is
    /// plugged in.
    pub fn init<P: Platform>(&mut self, p: &mut P) {
        self.enabled = p.enabled_links();
        for m in bits(u64::from(self.cages)) {
            match p.xcvr_leds(m) {
                Ok(leds) => self.leds[usize::from(m)] = leds,
                Err(e) => ringbuf_entry!(self.trace, Trace::LedFailed(m, e)),
            }
        }
        self.scan_presence(p);
    }

    /// Runs one main poll.
    pub fn tick<P: Platform>(&mut self, p: &mut P) {
        if self.quiesced {
            return;
        }
        self.absorb_notices(p);

        self.cadence.tick();
        let mut due = EnumMap::<Task, bool>::default();
        for t in self.cadence.iter_fired() {
            due[t] = true;
        }
        if due[Task::Presence] {
            self.scan_presence(p);
        }
        if due[Task::Onboard] {
            self.onboard_all(p);
        }
        if due[Task::Traffic] {
            self.check_traffic(p);
            self.update_leds(p);
        }
    }

    fn check_module(&self, module: u8) -> Result<usize, CciError> {
        let i = usize::from(module);
        if i >= MAX_MODULES {
            return Err(CciError::BadArgs);
        }
        if self.cages & (1 << module) == 0 {
            return Err(CciError::NotFound);
        }
        Ok(i)
    }

    fn continuous(&self, module: u8) -> bool {
        self.continuous_ali && self.modules[usize::from(module)].continuous_ali
    }

    fn is_present(&self, module: u8) -> bool {
        self.present & (1 << module) != 0
    }

    /// Enabled links on `module`.
    fn module_links<P: Platform>(&self, p: &mut P, module: u8) -> u64 {
        self.map.links_of(module) & self.enabled & !p.disabled_links()
    }

    fn absorb_notices<P: Platform>(&mut self, p: &mut P) {
        let notice = p.take_cci_notice();
        if notice.is_empty() {
            return;
        }

        let faulty = self.map.modules_of(notice.fault_links) & self.cages;
        if faulty != 0 {
            ringbuf_entry!(self.trace, Trace::FaultNotice(faulty));
            for m in bits(u64::from(faulty)) {
                self.modules[usize::from(m)].faulty = true;
            }
        }

        let changed = notice.presence_modules & self.cages;
        if changed != 0 {
            ringbuf_entry!(self.trace, Trace::PresenceNotice(changed));
            for m in bits(u64::from(changed)) {
                self.forget_module(m);
            }
        }
    }

    /// Treats the module as freshly plugged.
    fn forget_module(&mut self, module: u8) {
        let st = &mut self.modules[usize::from(module)];
        st.faulty = false;
        st.cable = CableType::Invalid;
        st.flat_memory = false;
        st.sw_reset();
    }

    fn scan_presence<P: Platform>(&mut self, p: &mut P) {
        let now = match cpld::present_mask(p) {
            Ok(mask) => mask & self.cages,
            Err(e) => {
                ringbuf_entry!(self.trace, Trace::PresenceReadFailed(e));
                return;
            }
        };
        let arrived = now & !self.present;
        let departed = self.present & !now;
        if arrived | departed == 0 {
            return;
        }
        ringbuf_entry!(self.trace, Trace::Presence { arrived, departed });

        for (mask, on) in [(arrived, true), (departed, false)] {
            for m in bits(u64::from(mask)) {
                if let Err(e) = cpld::set_power(p, m, on) {
                    ringbuf_entry!(self.trace, Trace::PowerFailed(m, e));
                }
                self.forget_module(m);
            }
        }
        self.present = now;
    }

    fn onboard_all<P: Platform>(&mut self, p: &mut P) {
        self.enabled = p.enabled_links();
        let now = p.now_ms();

        for m in bits(u64::from(self.cages)) {
            let i = usize::from(m);
            let timeout = self.lock_timeout_ms;
            if self.modules[i]
                .lock
                .try_lock(LockOwner::Driver, now, timeout)
                .is_err()
            {
                ringbuf_entry!(self.trace, Trace::LockSkipped(m));
                continue;
            }

            let from = self.modules[i].onboard.phase;
            let next = self.step(p, m);
            self.commit_from(m, from, next);

            // Someone else touching the module mid bring-up would undo it.
            if next.in_lp_window() {
                ringbuf_entry!(self.trace, Trace::LockRetained(m));
            } else {
                let _ = self.modules[i].lock.unlock(LockOwner::Driver);
            }
        }
    }

    /// Runs the module's current phase and returns the next one.
    fn step<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let phase = self.modules[usize::from(module)].onboard.phase;
        match phase {
            Phase::CheckCondition => self.check_condition(p, module),
            Phase::Identify => self.identify(p, module),
            phase @ (Phase::InitCopper
            | Phase::InitDirect
            | Phase::InitOptical(_)) => self.bring_up(p, module, phase),
            Phase::LaunchAli => self.launch_ali(p, module),
            phase @ Phase::Sleep { wake_at, then, sub } => {
                if p.now_ms() >= wake_at {
                    Phase::resume(then, sub).unwrap_or(Phase::CheckCondition)
                } else {
                    phase
                }
            }
            Phase::Monitor => self.monitor(p, module),
            Phase::NonContinuousAli => self.non_continuous_ali(p, module),
        }
    }

    fn commit(&mut self, module: u8, next: Phase) {
        let from = self.modules[usize::from(module)].onboard.phase;
        self.commit_from(module, from, next);
    }

    /// Moves `module` from `from` to `next`. All transitions go through
    /// here. A phase that resets the module has already overwritten its
    /// phase, so the caller says where it came from.
    fn commit_from(&mut self, module: u8, from: Phase, next: Phase) {
        self.modules[usize::from(module)].onboard.phase = next;
        ringbuf_entry!(
            self.trace,
            Trace::Phase {
                module,
                from: from.code(),
                to: next.code(),
            }
        );
    }

    fn fail(&mut self, module: u8, phase: PhaseCode, err: CciError) -> Phase {
        ringbuf_entry!(self.trace, Trace::PhaseFailed { module, phase, err });
        self.modules[usize::from(module)].onboard.error = Some(phase);
        Phase::CheckCondition
    }


    fn check_condition<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let i = usize::from(module);
        if self.modules[i].faulty {
            return Phase::Monitor;
        }

        let links = self.module_links(p, module);
        let masks = p.link_status(links);
        let train = if self.continuous(module) {
            links & !masks.active
        } else {
            links & self.ali_requested
        };
        let train = train & !masks.active_pending;
        let fault = train & masks.fault;
        for (mask, forced) in [(fault, false), (train & !fault, true)] {
            if mask == 0 {
                continue;
            }
            if let Err(err) = p.reset_and_drain(mask, forced) {
                ringbuf_entry!(
                    self.trace,
                    Trace::LinkResetFailed {
                        module,
                        forced,
                        err
                    }
                );
            }
        }

        if train != 0 && (train == links || !self.modules[i].onboard.onboarded) {
            match cpld::reset_module(p, module) {
                Ok(()) => ringbuf_entry!(self.trace, Trace::ModuleReset(module)),
                Err(e) => {
                    ringbuf_entry!(self.trace, Trace::ModuleResetFailed(module, e))
                }
            }
        }

        let present = self.is_present(module);
        let st = &mut self.modules[i].onboard;
        st.link_train_mask = train;
        if train != 0 {
            st.link_train_complete = false;
        }
        if train != 0 && present && st.attempts < self.max_attempts {
            st.attempts += 1;
            Phase::Identify
        } else {
            Phase::Monitor
        }
    }

    fn identify<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let rx_det = self.modules[usize::from(module)].rx_det;
        let found = cmis::identify(p, module).and_then(|info| {
            cmis::validate(p, module, &info, rx_det).map(|()| info)
        });
        let info = match found {
            Ok(info) => info,
            Err(e) => return self.fail(module, PhaseCode::Identify, e),
        };

        let st = &mut self.modules[usize::from(module)];
        st.cable = info.cable;
        st.flat_memory = info.flat_memory;
        match info.cable {
            CableType::Copper => Phase::InitCopper,
            CableType::Direct => Phase::InitDirect,
            CableType::Optical => Phase::InitOptical(SubPhaseCode::Start),
            CableType::Invalid => {
                self.fail(module, PhaseCode::Identify, CciError::InvalidCableType)
            }
        }
    }

    fn bring_up<P: Platform>(&mut self, p: &mut P, module: u8, phase: Phase) -> Phase {
        let st = self.modules[usize::from(module)];
        let links = st.onboard.link_train_mask;
        let cmd = OnboardPhaseCmd::new(
            module,
            phase.code(),
            phase.sub_code(),
            st.rx_det,
            links,
        );
        if let Err(e) = p.post_onboard_phase(&cmd, self.onboard_cmd_timeout_ms) {
            return self.fail(module, phase.code(), e.into());
        }

        let result = match phase {
            Phase::InitCopper => p.init_copper(module, links).map(|()| Phase::LaunchAli),
            Phase::InitDirect => p.init_direct(module, links).map(|()| Phase::LaunchAli),
            Phase::InitOptical(sub) => {
                let next = match sub {
                    SubPhaseCode::None | SubPhaseCode::Start => {
                        Phase::InitOptical(SubPhaseCode::Configure)
                    }
                    SubPhaseCode::Configure => {
                        Phase::InitOptical(SubPhaseCode::EnableAli)
                    }
                    SubPhaseCode::EnableAli => Phase::LaunchAli,
                };
                p.init_optical(module, links, sub).map(|settle_ms| {
                    if settle_ms == 0 {
                        next
                    } else {
                        sleep_until(p.now_ms().saturating_add(settle_ms), next)
                    }
                })
            }
            _ => Err(CciError::BadArgs),
        };
        result.unwrap_or_else(|e| self.fail(module, phase.code(), e))
    }

    fn launch_ali<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let train = self.modules[usize::from(module)].onboard.link_train_mask;
        for link in bits(train) {
            // Links out of reset are already on their way.
            if !p.in_reset(link) {
                continue;
            }
            if let Err(err) = p.request_active(link) {
                ringbuf_entry!(self.trace, Trace::AliFailed { link, err });
            }
        }
        Phase::Monitor
    }

    fn monitor<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let links = self.module_links(p, module);
        let masks = p.link_status(links);
        let continuous = self.continuous(module);
        let active = masks.active & links;
        let max_attempts = self.max_attempts;

        if !continuous {
            self.ali_requested &= !active;
        }

        let st = &mut self.modules[usize::from(module)].onboard;
        if active != 0 {
            st.onboarded = true;
        }
        let newly_active = st.link_train_mask & active;
        st.link_train_mask &= !active;
        if newly_active != 0 && st.link_train_mask != 0 {
            st.partial_link_train_complete = true;
        }

        let fault = if continuous {
            masks.fault & links
        } else {
            masks.fault & st.link_train_mask
        };

        let mut next = Phase::Monitor;
        let mut retry = false;
        let mut check_errors = false;
        if fault != 0 || st.error.is_some() {
            if self.continuous_ali && fault & st.active_saved != 0 {
                ringbuf_entry!(self.trace, Trace::HotPlug(module));
                let m = &mut self.modules[usize::from(module)];
                m.sw_reset();
                return m.onboard.phase;
            }

            if st.attempts >= max_attempts {
                if !st.errors_checked {
                    st.errors_checked = true;
                    check_errors = true;
                }
                if !continuous {
                    self.ali_requested &= !st.link_train_mask;
                }
                st.link_train_mask = 0;
            } else {
                st.error = None;
                retry = true;
                next = Phase::CheckCondition;
            }
        }

        if !retry && st.link_train_mask == 0 {
            if st.link_train_deferred {
                st.link_train_deferred = false;
                next = Phase::CheckCondition;
            } else {
                st.link_train_complete = true;
                if continuous {
                    st.active_saved = active;
                } else {
                    ringbuf_entry!(self.trace, Trace::Demoted(module));
                    next = Phase::NonContinuousAli;
                }
            }
        }

        if check_errors {
            ringbuf_entry!(self.trace, Trace::AttemptsExhausted(module));
            self.check_errors(p, module);
        }
        next
    }

    /// Looks for a hardware reason behind a module that will not onboard.
    fn check_errors<P: Platform>(&mut self, p: &mut P, module: u8) {
        let hw_good = !cpld::module_fault(p, module)
            || cpld::recover_hw_good(p, module).unwrap_or(false);
        if !hw_good {
            self.modules[usize::from(module)].faulty = true;
        }
        ringbuf_entry!(self.trace, Trace::ErrorsChecked { module, hw_good });
    }

    fn non_continuous_ali<P: Platform>(&mut self, p: &mut P, module: u8) -> Phase {
        let i = usize::from(module);
        let bit = 1u32 << module;
        if self.continuous_ali && self.ali_reenable & bit != 0 {
            self.ali_reenable &= !bit;
            let st = &mut self.modules[i];
            st.continuous_ali = true;
            st.sw_reset();
            // Monitor hands straight back to CheckCondition.
            st.onboard.link_train_deferred = true;
            ringbuf_entry!(self.trace, Trace::AliReenabled(module));
            return Phase::Monitor;
        }

        if self.is_present(module) {
            if let Ok(info) = cmis::identify(p, module) {
                let st = &mut self.modules[i];
                st.cable = info.cable;
                st.flat_memory = info.flat_memory;
            }
        }

        if self.ali_requested & self.map.links_of(module) != 0 {
            self.modules[i].sw_reset();
            return Phase::CheckCondition;
        }
        Phase::NonContinuousAli
    }

    fn check_traffic<P: Platform>(&mut self, p: &mut P) {
        let mut moved = 0;
        for link in bits(self.map.managed()) {
            let Some((tx, rx)) = p.throughput(link) else {
                continue;
            };
            let sum = tx.wrapping_add(rx);
            let prev = &mut self.traffic_prev[usize::from(link)];
            if self.traffic_baseline && sum != *prev {
                moved |= 1 << link;
            }
            *prev = sum;
        }
        self.traffic_baseline = true;
        self.traffic = moved;
    }

    /// Brings every cage's LEDs in line with its links. Only cages whose
    /// state changed are written.
    fn update_leds<P: Platform>(&mut self, p: &mut P) {
        for m in bits(u64::from(self.cages)) {
            let next = self.next_leds(p, m);
            if next != self.leds[usize::from(m)] {
                self.show_leds(p, m, next);
            }
        }
    }

    fn next_leds<P: Platform>(&self, p: &mut P, module: u8) -> CageLeds {
        let i = usize::from(module);
        let links = self.map.links_of(module);
        let masks = p.link_status(links);
        // An empty cage is not training anything, whatever its mask says.
        let training = if self.is_present(module) {
            self.modules[i].onboard.link_train_mask
        } else {
            0
        };

        let mut next = CageLeds::OFF;
        for port in [Port::A, Port::B] {
            let state = if self.locate[i].contains(port) {
                LedState::Locate
            } else {
                let on_port = bits(links)
                    .filter(|&l| {
                        self.map.lane_mask(l).map(Port::of_lanes) == Some(port)
                    })
                    .fold(0u64, |acc, l| acc | (1 << l));
                port_led(&masks, training, self.traffic, on_port)
            };
            next.set(port, state);
        }
        next
    }

    fn show_leds<P: Platform>(&mut self, p: &mut P, module: u8, leds: CageLeds) {
        match p.set_xcvr_leds(module, leds) {
            Ok(()) => {
                self.leds[usize::from(module)] = leds;
                ringbuf_entry!(self.trace, Trace::Leds { module, leds });
            }
            Err(e) => ringbuf_entry!(self.trace, Trace::LedFailed(module, e)),
        }
    }

    /// Turns locate on or off for one port of a cage. The LED changes right
    /// away; with locate off it goes back to showing link state.
    pub fn set_locate<P: Platform>(
        &mut self,
        p: &mut P,
        module: u8,
        port: u8,
        on: bool,
    ) -> Result<(), CciError> {
        let i = self.check_module(module)?;
        let port = Port::from_index(port)?;
        self.locate[i].set(port, on);
        let next = self.next_leds(p, module);
        p.set_xcvr_leds(module, next)?;
        self.leds[i] = next;
        Ok(())
    }

    /// What a cage's LEDs were last set to.
    pub fn xcvr_leds(&self, module: u8) -> Result<CageLeds, CciError> {
        let i = self.check_module(module)?;
        Ok(self.leds[i])
    }

    /// Hands every module back to firmware's default ALI handling, turns
    /// the LEDs off and stops the engine. Later ticks do nothing.
    pub fn shutdown<P: Platform>(&mut self, p: &mut P) {
        let phase = Phase::InitOptical(SubPhaseCode::EnableAli);
        for m in bits(u64::from(self.cages & self.present)) {
            let st = self.modules[usize::from(m)];
            let cmd = OnboardPhaseCmd::new(
                m,
                phase.code(),
                phase.sub_code(),
                st.rx_det,
                self.map.links_of(m),
            );
            if let Err(e) = p.post_onboard_phase(&cmd, self.shutdown_cmd_timeout_ms) {
                ringbuf_entry!(self.trace, Trace::ShutdownFailed(m, e.into()));
            }
            self.commit(m, phase);
            let _ = self.modules[usize::from(m)].lock.unlock(LockOwner::Driver);
        }
        self.traffic = 0;
        for m in bits(u64::from(self.cages)) {
            self.locate[usize::from(m)] = Locate::default();
            self.show_leds(p, m, CageLeds::OFF);
        }
        self.quiesced = true;
        ringbuf_entry!(self.trace, Trace::Quiesced);
    }

    /// Forces `module` into `phase`.
    pub fn set_phase(&mut self, module: u8, phase: Phase) -> Result<(), CciError> {
        self.check_module(module)?;
        self.commit(module, phase);
        Ok(())
    }

    /// Parks `module` for `ms` milliseconds, then resumes at `then`.
    pub fn schedule_sleep(
        &mut self,
        module: u8,
        now: u64,
        ms: u64,
        then: Phase,
    ) -> Result<(), CciError> {
        self.check_module(module)?;
        if matches!(then, Phase::Sleep { .. }) {
            return Err(CciError::BadArgs);
        }
        self.commit(module, sleep_until(now.saturating_add(ms), then));
        Ok(())
    }

    /// Asks for `links` to be trained. Only meaningful with continuous ALI
    /// off.
    pub fn request_ali(&mut self, links: u64) -> Result<(), CciError> {
        if self.continuous_ali {
            return Err(CciError::ContinuousAliEnabled);
        }
        if links & !self.map.managed() != 0 {
            return Err(CciError::BadArgs);
        }
        self.ali_requested |= links;
        Ok(())
    }

    pub fn set_continuous_ali(&mut self, enable: bool) {
        if enable == self.continuous_ali {
            return;
        }
        self.continuous_ali = enable;
        self.ali_reenable = if enable { self.cages } else { 0 };
        ringbuf_entry!(self.trace, Trace::ContinuousAli(enable));
    }

    /// Turns continuous ALI on or off for one module. Turning it on takes
    /// effect once the module next rests in `NonContinuousAli`.
    pub fn set_module_continuous_ali(
        &mut self,
        module: u8,
        enable: bool,
    ) -> Result<(), CciError> {
        let i = self.check_module(module)?;
        if enable {
            self.ali_reenable |= 1 << module;
        } else {
            self.modules[i].continuous_ali = false;
            self.ali_reenable &= !(1 << module);
        }
        Ok(())
    }

    /// Whether `link` is not being trained right now.
    pub fn link_train_idle(&self, link: u8) -> Result<bool, CciError> {
        let m = self.map.module_of(link).ok_or(CciError::NotFound)?;
        let st = &self.modules[usize::from(m)].onboard;
        Ok(st.link_train_mask & (1 << link) == 0)
    }

    /// Whether `module` ran out of onboarding attempts.
    pub fn module_onboard_failed(&self, module: u8) -> Result<bool, CciError> {
        let i = self.check_module(module)?;
        Ok(self.modules[i].onboard.errors_checked)
    }

    pub fn cmis_lock(
        &mut self,
        module: u8,
        owner: LockOwner,
        now: u64,
    ) -> Result<(), CciError> {
        let i = self.check_module(module)?;
        let timeout = self.lock_timeout_ms;
        self.modules[i].lock.try_lock(owner, now, timeout)
    }

    pub fn cmis_unlock(&mut self, module: u8, owner: LockOwner) -> Result<(), CciError> {
        let i = self.check_module(module)?;
        self.modules[i].lock.unlock(owner)
    }

    fn cmis_access(&self, module: u8, owner: LockOwner) -> Result<bool, CciError> {
        let i = self.check_module(module)?;
        let st = &self.modules[i];
        match st.lock.holder() {
            Some(h) if h != owner => Err(CciError::InUse),
            _ => Ok(st.flat_memory),
        }
    }

    /// Reads CMIS memory on behalf of `owner`, which must hold the module's
    /// lock or find it free.
    pub fn cmis_read<B: CmisBus>(
        &self,
        bus: &mut B,
        module: u8,
        owner: LockOwner,
        t: Target,
        out: &mut [u8],
    ) -> Result<(), CciError> {
        let flat = self.cmis_access(module, owner)?;
        cmis::read(bus, module, flat, t, out)
    }

    pub fn cmis_write<B: CmisBus>(
        &self,
        bus: &mut B,
        module: u8,
        owner: LockOwner,
        t: Target,
        data: &[u8],
    ) -> Result<(), CciError> {
        let flat = self.cmis_access(module, owner)?;
        cmis::write(bus, module, flat, t, data)
    }

    pub fn module(&self, module: u8) -> Option<&ModuleState> {
        self.check_module(module).ok().map(|i| &self.modules[i])
    }

    pub fn phase(&self, module: u8) -> Option<Phase> {
        self.module(module).map(|m| m.onboard.phase)
    }

    pub fn present_mask(&self) -> u32 {
        self.present
    }

    pub fn ali_requested(&self) -> u64 {
        self.ali_requested
    }

    pub fn continuous_ali(&self) -> bool {
        self.continuous_ali
    }

    /// Links whose counters moved over the last traffic poll.
    pub fn traffic(&self) -> u64 {
        self.traffic
    }

    pub fn link_map(&self) -> &LinkMap {
        &self.map
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    pub fn trace(&self) -> &Ringbuf<Trace, 64> {
        &self.trace
    }
}

/// What a port's LED shows for its `links`. The worst link wins, and a port
/// that is up shows activity if any of its links moved traffic.
fn port_led(
    masks: &LinkMasks,
    training: u64,
    traffic: u64,
    links: u64,
) -> LedState {
    let state = bits(links)
        .map(|l| {
            let bit = 1u64 << l;
            if masks.fault & bit != 0 {
                LedState::Fault
            } else if masks.active & bit != 0 {
                LedState::UpWarm
            } else if (masks.active_pending | training) & bit != 0 {
                LedState::Initialize
            } else {
                LedState::Off
            }
        })
        .reduce(LedState::resolve)
        .unwrap_or(LedState::Off);
    if state == LedState::UpWarm && traffic & links != 0 {
        LedState::UpActive
    } else {
        state
    }
}

fn sleep_until(wake_at: u64, then: Phase) -> Phase {
    Phase::Sleep {
        wake_at,
        then: then.code(),
        sub: then.sub_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkMapping;
    use crate::fake::{BringUp, FakePlatform};
    use drv_soe::listeners::CciNotice;
    use drv_soe_api::SoeError;
    use proptest::prelude::*;

    const COPPER: u8 = 0x0a;
    const OPTICAL: u8 = 0x03;

    /// One cage carrying links 0 and 1. Every task runs on every tick.
    fn config(continuous_ali: bool) -> CciConfig {
        CciConfig {
            cages_mask: 0b1,
            link_map: [0, 1]
                .iter()
                .map(|&link| LinkMapping {
                    link,
                    module: 0,
                    lanes: 0xf << (4 * link),
                })
                .collect(),
            continuous_ali,
            presence_rate_hz: 10,
            onboard_rate_hz: 10,
            traffic_rate_hz: 10,
            ..Default::default()
        }
    }

    fn setup(cfg: &CciConfig, media: Option<u8>) -> (CciDevice, FakePlatform) {
        let mut dev = CciDevice::new(cfg).unwrap();
        let mut p = FakePlatform::new();
        if let Some(media) = media {
            p.install_module(0, media);
        }
        dev.init(&mut p);
        (dev, p)
    }

    fn ticks(dev: &mut CciDevice, p: &mut FakePlatform, n: usize) {
        for _ in 0..n {
            dev.tick(p);
        }
    }

    fn onboard(dev: &CciDevice) -> crate::module::Onboard {
        dev.module(0).unwrap().onboard
    }

    fn moved(dev: &CciDevice, from: PhaseCode, to: PhaseCode) -> bool {
        dev.trace()
            .payloads()
            .any(|t| t == Trace::Phase { module: 0, from, to })
    }

    fn visited(dev: &CciDevice, code: PhaseCode) -> bool {
        dev.trace()
            .payloads()
            .any(|t| matches!(t, Trace::Phase { to, .. } if to == code))
    }

    #[test]
    fn rejects_bad_config() {
        let cfg = CciConfig {
            traffic_rate_hz: 4,
            ..config(true)
        };
        assert!(matches!(CciDevice::new(&cfg), Err(CciError::BadArgs)));
    }

    #[test]
    fn links_already_up_skip_identify() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
        dev.tick(&mut p);

        let st = onboard(&dev);
        assert!(st.onboarded);
        assert!(st.link_train_complete);
        assert_eq!(st.active_saved, 0b11);
        assert_eq!(st.attempts, 0);
        assert!(!visited(&dev, PhaseCode::Identify));
        assert!(p.cmis_reads.is_empty());
        assert!(p.resets.is_empty());
    }

    #[test]
    fn copper_with_rx_det_onboards_without_checksum() {
        let cfg = CciConfig {
            rx_det_mask: 0b1,
            ..config(true)
        };
        let (mut dev, mut p) = setup(&cfg, Some(COPPER));
        p.auto_train = 0b11;

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Identify));
        assert_eq!(p.resets, [(0b11, true)]);
        assert_eq!(onboard(&dev).attempts, 1);

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::InitCopper));
        assert_eq!(dev.module(0).unwrap().cable, CableType::Copper);
        assert!(!p
            .cmis_reads
            .iter()
            .any(|&(_, addr, _)| addr == cmis::UPPER_START));

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::LaunchAli));
        assert_eq!(p.bring_ups, [BringUp::Copper(0)]);
        let cmd = p.soe_cmds[0];
        assert_eq!(cmd.onboard_phase, PhaseCode::InitCopper as u8);
        assert_eq!(cmd.rx_det_enable, 1);
        assert_eq!(cmd.link_mask(), 0b11);

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
        assert_eq!(p.activations, [0, 1]);

        dev.tick(&mut p);
        let st = onboard(&dev);
        assert!(st.onboarded);
        assert!(st.link_train_complete);
        assert!(!st.partial_link_train_complete);
        assert_eq!(st.link_train_mask, 0);
    }

    #[test]
    fn optical_bring_up_holds_the_lock() {
        let (mut dev, mut p) = setup(&config(true), Some(OPTICAL));
        p.auto_train = 0b11;
        ticks(&mut dev, &mut p, 2);
        assert_eq!(
            dev.phase(0),
            Some(Phase::InitOptical(SubPhaseCode::Start))
        );

        // Mid bring-up the driver keeps the module to itself.
        let lock = dev.module(0).unwrap().lock;
        assert_eq!(lock.holder(), Some(LockOwner::Driver));
        assert_eq!(
            dev.cmis_lock(0, LockOwner::Client(3), p.now),
            Err(CciError::InUse)
        );
        let mut b = [0u8];
        assert_eq!(
            dev.cmis_read(&mut p, 0, LockOwner::Client(3), Target::lower(0), &mut b),
            Err(CciError::InUse)
        );

        ticks(&mut dev, &mut p, 3);
        assert_eq!(dev.phase(0), Some(Phase::LaunchAli));
        assert_eq!(dev.module(0).unwrap().lock.holder(), None);
        assert_eq!(
            p.bring_ups,
            [
                BringUp::Optical(0, SubPhaseCode::Start),
                BringUp::Optical(0, SubPhaseCode::Configure),
                BringUp::Optical(0, SubPhaseCode::EnableAli),
            ]
        );
        let subs: Vec<u8> =
            p.soe_cmds.iter().map(|c| c.onboard_sub_phase).collect();
        assert_eq!(subs, [1, 2, 3]);

        ticks(&mut dev, &mut p, 2);
        assert!(onboard(&dev).link_train_complete);
    }

    #[test]
    fn optical_settle_time_parks_in_sleep() {
        let (mut dev, mut p) = setup(&config(true), Some(OPTICAL));
        p.optical_settle_ms = 100;
        ticks(&mut dev, &mut p, 3);

        let Some(Phase::Sleep { wake_at, then, sub }) = dev.phase(0) else {
            panic!("not sleeping: {:?}", dev.phase(0));
        };
        assert_eq!(wake_at, p.now + 100);
        assert_eq!(then, PhaseCode::InitOptical);
        assert_eq!(sub, SubPhaseCode::Configure);
        assert!(dev.module(0).unwrap().lock.holder().is_some());

        ticks(&mut dev, &mut p, 5);
        assert!(matches!(dev.phase(0), Some(Phase::Sleep { .. })));

        p.now += 100;
        dev.tick(&mut p);
        assert_eq!(
            dev.phase(0),
            Some(Phase::InitOptical(SubPhaseCode::Configure))
        );
    }

    #[test]
    fn persistent_fault_exhausts_attempts_once() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        // Link 1 trains, link 0 stays faulted.
        p.auto_train = 0b10;
        p.fault = 0b01;

        let mut exhausted_at = None;
        for tick in 0..100 {
            dev.tick(&mut p);
            let st = onboard(&dev);
            assert!(st.attempts <= 5);
            if st.errors_checked {
                exhausted_at = Some(tick);
                assert_eq!(st.attempts, 5);
                assert_eq!(st.link_train_mask, 0);
                break;
            }
        }
        assert!(exhausted_at.is_some());
        assert!(onboard(&dev).partial_link_train_complete);

        let checked = |dev: &CciDevice| {
            dev.trace()
                .payloads()
                .filter(|t| matches!(t, Trace::ErrorsChecked { .. }))
                .count()
        };
        assert_eq!(checked(&dev), 1);
        assert_eq!(dev.module_onboard_failed(0), Ok(true));

        let resets = p.resets.len();
        for _ in 0..20 {
            dev.tick(&mut p);
            assert_eq!(dev.phase(0), Some(Phase::Monitor));
        }
        assert_eq!(checked(&dev), 1);
        assert_eq!(p.resets.len(), resets);
        // The load switch looked fine, so the module is not written off.
        assert!(!dev.module(0).unwrap().faulty);
    }

    #[test]
    fn exhaustion_with_bad_hardware_marks_module_faulty() {
        let cfg = CciConfig {
            max_onboard_attempts: 1,
            ..config(true)
        };
        let (mut dev, mut p) = setup(&cfg, Some(COPPER));
        p.fault = 0b11;
        // A fault register that cannot be read counts as a fault.
        p.cpld_fail = Some(cpld::LD_SW_FAULT.lo);
        ticks(&mut dev, &mut p, 5);

        assert!(onboard(&dev).errors_checked);
        assert!(dev.module(0).unwrap().faulty);
        assert!(dev
            .trace()
            .payloads()
            .any(|t| t == Trace::ErrorsChecked { module: 0, hw_good: false }));
    }

    #[test]
    fn hot_plug_fault_resets_the_module() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;
        ticks(&mut dev, &mut p, 2);
        assert_eq!(onboard(&dev).active_saved, 0b11);

        p.fault = 0b01;
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        assert_eq!(onboard(&dev).attempts, 0);
        assert!(!onboard(&dev).link_train_complete);
        assert!(dev.trace().payloads().any(|t| t == Trace::HotPlug(0)));
        assert!(moved(&dev, PhaseCode::Monitor, PhaseCode::CheckCondition));
        assert!(!moved(
            &dev,
            PhaseCode::CheckCondition,
            PhaseCode::CheckCondition
        ));
    }

    #[test]
    fn completion_lands_on_the_same_tick() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        ticks(&mut dev, &mut p, 4);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
        assert_eq!(onboard(&dev).link_train_mask, 0b11);
        assert_eq!(dev.link_train_idle(0), Ok(false));

        p.active = 0b01;
        dev.tick(&mut p);
        assert!(onboard(&dev).partial_link_train_complete);
        assert!(!onboard(&dev).link_train_complete);
        assert_eq!(dev.link_train_idle(0), Ok(true));

        p.active = 0b11;
        dev.tick(&mut p);
        assert!(onboard(&dev).link_train_complete);
        assert_eq!(dev.link_train_idle(1), Ok(true));
        assert_eq!(dev.link_train_idle(9), Err(CciError::NotFound));
    }

    #[test]
    fn check_condition_is_idempotent() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b01;
        dev.check_condition(&mut p, 0);
        let first = onboard(&dev).link_train_mask;
        dev.check_condition(&mut p, 0);
        assert_eq!(onboard(&dev).link_train_mask, first);
        assert_eq!(first, 0b10);
        assert_eq!(p.resets, [(0b10, true), (0b10, true)]);
    }

    #[test]
    fn faulty_module_is_parked_until_replugged() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.notice = CciNotice {
            fault_links: 0b10,
            presence_modules: 0,
        };
        dev.tick(&mut p);
        assert!(dev.module(0).unwrap().faulty);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
        assert!(p.resets.is_empty());
        assert!(!visited(&dev, PhaseCode::Identify));

        p.notice = CciNotice {
            fault_links: 0,
            presence_modules: 0b1,
        };
        dev.tick(&mut p);
        assert!(!dev.module(0).unwrap().faulty);
        assert_eq!(dev.phase(0), Some(Phase::Identify));
    }

    #[test]
    fn bring_up_failure_is_retried() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.soe_fail = Some(SoeError::Timeout);
        ticks(&mut dev, &mut p, 3);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        assert_eq!(onboard(&dev).error, Some(PhaseCode::InitCopper));
        assert!(p.bring_ups.is_empty());

        p.soe_fail = None;
        p.bring_up_fail = 0b1;
        ticks(&mut dev, &mut p, 3);
        assert_eq!(onboard(&dev).attempts, 2);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        assert_eq!(p.bring_ups, [BringUp::Copper(0)]);
    }

    #[test]
    fn unknown_cable_is_not_brought_up() {
        let (mut dev, mut p) = setup(&config(true), Some(0x40));
        ticks(&mut dev, &mut p, 2);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        assert!(dev.trace().payloads().any(|t| t
            == Trace::PhaseFailed {
                module: 0,
                phase: PhaseCode::Identify,
                err: CciError::InvalidCableType,
            }));
    }

    #[test]
    fn requested_links_train_without_continuous_ali() {
        let (mut dev, mut p) = setup(&config(false), Some(COPPER));
        p.auto_train = 0b11;
        assert_eq!(dev.phase(0), Some(Phase::NonContinuousAli));

        // Nothing asked for, nothing happens.
        ticks(&mut dev, &mut p, 3);
        assert_eq!(dev.phase(0), Some(Phase::NonContinuousAli));
        assert!(p.resets.is_empty());
        assert_eq!(dev.module(0).unwrap().cable, CableType::Copper);

        assert_eq!(dev.request_ali(1 << 5), Err(CciError::BadArgs));
        assert_eq!(dev.request_ali(0b01), Ok(()));
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));

        ticks(&mut dev, &mut p, 5);
        assert_eq!(p.resets, [(0b01, true)]);
        assert_eq!(p.activations, [0]);
        assert_eq!(dev.ali_requested(), 0);
        assert_eq!(dev.phase(0), Some(Phase::NonContinuousAli));
        assert!(onboard(&dev).link_train_complete);
        assert!(dev.trace().payloads().any(|t| t == Trace::Demoted(0)));
    }

    #[test]
    fn continuous_ali_can_be_turned_back_on() {
        let (mut dev, mut p) = setup(&config(false), Some(COPPER));
        p.active = 0b01;
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::NonContinuousAli));

        dev.set_continuous_ali(true);
        assert_eq!(dev.request_ali(0b01), Err(CciError::ContinuousAliEnabled));

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
        assert!(dev.module(0).unwrap().continuous_ali);
        assert!(onboard(&dev).link_train_deferred);
        assert!(moved(&dev, PhaseCode::NonContinuousAli, PhaseCode::Monitor));

        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Identify));
        assert_eq!(onboard(&dev).link_train_mask, 0b10);
    }

    #[test]
    fn turning_continuous_ali_off_demotes() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;
        ticks(&mut dev, &mut p, 2);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));

        dev.set_module_continuous_ali(0, false).unwrap();
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::NonContinuousAli));
        assert_eq!(
            dev.set_module_continuous_ali(3, true),
            Err(CciError::NotFound)
        );
    }

    #[test]
    fn client_lock_stalls_the_module() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        dev.cmis_lock(0, LockOwner::Client(9), p.now).unwrap();
        ticks(&mut dev, &mut p, 3);
        assert_eq!(dev.phase(0), Some(Phase::CheckCondition));
        assert!(dev.trace().payloads().any(|t| t == Trace::LockSkipped(0)));

        // The client may read through the engine while it holds the lock.
        let mut id = [0u8];
        dev.cmis_read(&mut p, 0, LockOwner::Client(9), Target::lower(0), &mut id)
            .unwrap();
        assert_eq!(id[0], 0x18);

        dev.cmis_unlock(0, LockOwner::Client(9)).unwrap();
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Identify));
    }

    #[test]
    fn abandoned_client_lock_times_out() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        dev.cmis_lock(0, LockOwner::Client(9), p.now).unwrap();
        p.now += 10_000;
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Identify));
    }

    #[test]
    fn presence_changes_power_the_cage() {
        let (mut dev, mut p) = setup(&config(true), None);
        assert_eq!(dev.present_mask(), 0);
        ticks(&mut dev, &mut p, 2);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));

        p.install_module(0, COPPER);
        dev.tick(&mut p);
        assert_eq!(dev.present_mask(), 0b1);
        assert!(cpld::power(&mut p, 0).unwrap());
        assert_eq!(dev.phase(0), Some(Phase::Identify));
        assert!(dev.trace().payloads().any(|t| t
            == Trace::Presence {
                arrived: 0b1,
                departed: 0
            }));

        p.set_present(0, false);
        dev.tick(&mut p);
        assert_eq!(dev.present_mask(), 0);
        assert!(!cpld::power(&mut p, 0).unwrap());
        assert_eq!(dev.module(0).unwrap().cable, CableType::Invalid);
    }

    #[test]
    fn traffic_needs_a_baseline() {
        let (mut dev, mut p) = setup(&config(true), None);
        p.counters[0] = Some((10, 10));
        p.counters[1] = Some((4, 4));
        dev.tick(&mut p);
        assert_eq!(dev.traffic(), 0);

        p.counters[0] = Some((15, 10));
        dev.tick(&mut p);
        assert_eq!(dev.traffic(), 0b01);

        dev.tick(&mut p);
        assert_eq!(dev.traffic(), 0);
    }

    #[test]
    fn sleep_requests_are_checked() {
        let (mut dev, mut p) = setup(&config(true), None);
        let sleep = Phase::Sleep {
            wake_at: 0,
            then: PhaseCode::Monitor,
            sub: SubPhaseCode::None,
        };
        assert_eq!(dev.schedule_sleep(0, 0, 10, sleep), Err(CciError::BadArgs));
        assert_eq!(
            dev.schedule_sleep(4, 0, 10, Phase::Monitor),
            Err(CciError::NotFound)
        );

        dev.schedule_sleep(0, p.now, 50, Phase::Monitor).unwrap();
        dev.tick(&mut p);
        assert!(matches!(dev.phase(0), Some(Phase::Sleep { .. })));
        p.now += 50;
        dev.tick(&mut p);
        assert_eq!(dev.phase(0), Some(Phase::Monitor));
    }

    #[test]
    fn shutdown_hands_modules_back() {
        let (mut dev, mut p) = setup(&config(true), Some(OPTICAL));
        dev.shutdown(&mut p);
        assert!(dev.is_quiesced());
        assert_eq!(
            dev.phase(0),
            Some(Phase::InitOptical(SubPhaseCode::EnableAli))
        );
        let cmd = p.soe_cmds[0];
        assert_eq!(cmd.onboard_phase, PhaseCode::InitOptical as u8);
        assert_eq!(cmd.onboard_sub_phase, SubPhaseCode::EnableAli as u8);
        assert_eq!(cmd.link_mask(), 0b11);

        ticks(&mut dev, &mut p, 3);
        assert_eq!(p.soe_cmds.len(), 1);
        assert!(p.bring_ups.is_empty());
    }

    fn led_writes(p: &FakePlatform) -> usize {
        p.cpld_writes
            .iter()
            .filter(|&&(r, _)| r == cpld::LED_BASE)
            .count()
    }

    #[test]
    fn leds_follow_links_and_traffic() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;
        p.counters[0] = Some((0, 0));
        p.counters[1] = Some((0, 0));
        dev.tick(&mut p);
        let up = CageLeds {
            a: LedState::UpWarm,
            b: LedState::UpWarm,
        };
        assert_eq!(dev.xcvr_leds(0), Ok(up));
        assert_eq!(p.leds(0), up.to_reg());

        p.counters[1] = Some((8, 0));
        dev.tick(&mut p);
        let busy = CageLeds {
            b: LedState::UpActive,
            ..up
        };
        assert_eq!(dev.xcvr_leds(0), Ok(busy));
        assert_eq!(p.leds(0), busy.to_reg());

        // Same state again, so the register is left alone.
        p.counters[1] = Some((16, 0));
        let writes = led_writes(&p);
        dev.tick(&mut p);
        assert_eq!(led_writes(&p), writes);

        p.fault = 0b01;
        p.active = 0b10;
        dev.tick(&mut p);
        assert_eq!(dev.xcvr_leds(0).unwrap().a, LedState::Fault);
        assert_eq!(dev.xcvr_leds(0).unwrap().b, LedState::UpWarm);

        // Retraining after the fault.
        p.fault = 0;
        dev.tick(&mut p);
        assert_eq!(onboard(&dev).link_train_mask, 0b01);
        assert_eq!(dev.xcvr_leds(0).unwrap().a, LedState::Initialize);
    }

    #[test]
    fn locate_overrides_link_state() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;
        dev.tick(&mut p);

        dev.set_locate(&mut p, 0, 1, true).unwrap();
        let located = CageLeds {
            a: LedState::UpWarm,
            b: LedState::Locate,
        };
        assert_eq!(dev.xcvr_leds(0), Ok(located));
        assert_eq!(p.leds(0), 0x53);
        dev.tick(&mut p);
        assert_eq!(dev.xcvr_leds(0), Ok(located));

        dev.set_locate(&mut p, 0, 1, false).unwrap();
        assert_eq!(dev.xcvr_leds(0).unwrap().b, LedState::UpWarm);
        assert_eq!(dev.set_locate(&mut p, 0, 2, true), Err(CciError::BadArgs));
        assert_eq!(dev.set_locate(&mut p, 3, 0, true), Err(CciError::NotFound));
    }

    #[test]
    fn init_reads_back_the_leds() {
        let mut dev = CciDevice::new(&config(true)).unwrap();
        let mut p = FakePlatform::new();
        p.cpld[usize::from(cpld::LED_BASE)] = 0x33;
        dev.init(&mut p);
        let up = CageLeds {
            a: LedState::UpWarm,
            b: LedState::UpWarm,
        };
        assert_eq!(dev.xcvr_leds(0), Ok(up));

        // Nothing is plugged in, so the next update turns them off.
        dev.tick(&mut p);
        assert_eq!(p.leds(0), 0);

        let mut dev = CciDevice::new(&config(true)).unwrap();
        p.cpld_fail = Some(cpld::LED_BASE);
        dev.init(&mut p);
        assert!(dev
            .trace()
            .payloads()
            .any(|t| t == Trace::LedFailed(0, CciError::Io)));
    }

    #[test]
    fn shutdown_turns_the_leds_off() {
        let (mut dev, mut p) = setup(&config(true), Some(COPPER));
        p.active = 0b11;
        dev.tick(&mut p);
        dev.set_locate(&mut p, 0, 0, true).unwrap();
        assert_ne!(p.leds(0), 0);

        dev.shutdown(&mut p);
        assert_eq!(p.leds(0), CageLeds::OFF.to_reg());
        assert_eq!(dev.xcvr_leds(0), Ok(CageLeds::OFF));
        ticks(&mut dev, &mut p, 2);
        assert_eq!(p.leds(0), 0);
    }

    proptest! {
        #[test]
        fn attempts_stay_bounded(
            steps in proptest::collection::vec(
                (0u64..4, 0u64..4, any::<bool>(), any::<bool>()),
                1..80,
            )
        ) {
            let (mut dev, mut p) = setup(&config(true), Some(COPPER));
            for (fault, train, fail, clock) in steps {
                p.fault = fault;
                p.auto_train = train;
                p.bring_up_fail = u32::from(fail);
                if clock {
                    p.now += 250;
                }
                dev.tick(&mut p);
                let st = onboard(&dev);
                prop_assert!(st.attempts <= 5);
                if st.errors_checked {
                    prop_assert_eq!(st.attempts, 5);
                }
            }
        }
    }
}
