// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-module onboarding state.

use drv_soe_api::cci::{PhaseCode, SubPhaseCode};

use crate::cmis::CmisLock;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CableType {
    #[default]
    Invalid,
    /// Passive copper.
    Copper,
    /// Active or linear copper, driven directly.
    Direct,
    Optical,
}

/// Where a module is in onboarding. Phases that carry state keep it in the
/// variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    CheckCondition,
    Identify,
    InitCopper,
    InitDirect,
    InitOptical(SubPhaseCode),
    LaunchAli,
    /// Waiting until `wake_at`, then carrying on with `then`.
    Sleep {
        wake_at: u64,
        then: PhaseCode,
        sub: SubPhaseCode,
    },
    Monitor,
    NonContinuousAli,
}

impl Phase {
    pub fn code(&self) -> PhaseCode {
        match self {
            Phase::CheckCondition => PhaseCode::CheckCondition,
            Phase::Identify => PhaseCode::Identify,
            Phase::InitCopper => PhaseCode::InitCopper,
            Phase::InitDirect => PhaseCode::InitDirect,
            Phase::InitOptical(_) => PhaseCode::InitOptical,
            Phase::LaunchAli => PhaseCode::LaunchAli,
            Phase::Sleep { .. } => PhaseCode::Sleep,
            Phase::Monitor => PhaseCode::Monitor,
            Phase::NonContinuousAli => PhaseCode::NonContinuousAli,
        }
    }

    pub fn sub_code(&self) -> SubPhaseCode {
        match self {
            Phase::InitOptical(s) => *s,
            _ => SubPhaseCode::None,
        }
    }

    /// Rebuilds the phase a sleep returns to. Returns `None` for `Sleep`
    /// itself, which cannot be resumed into.
    pub fn resume(code: PhaseCode, sub: SubPhaseCode) -> Option<Self> {
        Some(match code {
            PhaseCode::CheckCondition => Phase::CheckCondition,
            PhaseCode::Identify => Phase::Identify,
            PhaseCode::InitCopper => Phase::InitCopper,
            PhaseCode::InitDirect => Phase::InitDirect,
            PhaseCode::InitOptical => Phase::InitOptical(sub),
            PhaseCode::LaunchAli => Phase::LaunchAli,
            PhaseCode::Sleep => return None,
            PhaseCode::Monitor => Phase::Monitor,
            PhaseCode::NonContinuousAli => Phase::NonContinuousAli,
        })
    }

    /// Whether the module is in the middle of optical bring-up, when the
    /// module is moving in and out of low-power mode.
    pub fn in_lp_window(&self) -> bool {
        match self {
            Phase::InitOptical(_) => true,
            Phase::Sleep { then, .. } => *then == PhaseCode::InitOptical,
            _ => false,
        }
    }
}

/// State cleared by a software reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Onboard {
    pub phase: Phase,
    /// Links this round of onboarding is trying to bring up.
    pub link_train_mask: u64,
    pub attempts: u32,
    /// Phase that failed, latched until the next retry.
    pub error: Option<PhaseCode>,
    pub onboarded: bool,
    pub link_train_complete: bool,
    pub partial_link_train_complete: bool,
    pub link_train_deferred: bool,
    /// Set once attempts ran out and the failure was looked into.
    pub errors_checked: bool,
    /// Links that were active when training last completed.
    pub active_saved: u64,
}

impl Onboard {
    pub fn new(continuous_ali: bool) -> Self {
        Self {
            phase: if continuous_ali {
                Phase::CheckCondition
            } else {
                Phase::NonContinuousAli
            },
            link_train_mask: 0,
            attempts: 0,
            error: None,
            onboarded: false,
            link_train_complete: false,
            partial_link_train_complete: false,
            link_train_deferred: false,
            errors_checked: false,
            active_saved: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModuleState {
    pub onboard: Onboard,
    pub cable: CableType,
    pub flat_memory: bool,
    pub rx_det: bool,
    /// The module itself is broken; nothing is attempted until it is
    /// replugged.
    pub faulty: bool,
    pub continuous_ali: bool,
    pub lock: CmisLock,
}

impl ModuleState {
    pub fn new(continuous_ali: bool, rx_det: bool) -> Self {
        Self {
            onboard: Onboard::new(continuous_ali),
            cable: CableType::Invalid,
            flat_memory: false,
            rx_det,
            faulty: false,
            continuous_ali,
            lock: CmisLock::new(),
        }
    }

    /// Forgets all onboarding progress.
    pub fn sw_reset(&mut self) {
        self.onboard = Onboard::new(self.continuous_ali);
    }
}
