// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cage indicator LEDs.
//!
//! Each cage has two LEDs, one per port. Port A shows the links on module
//! lanes 0 through 3 and port B those on lanes 4 through 7. The CPLD holds
//! one register per cage with port A in the low nibble and port B in the
//! high nibble.

use crate::CciError;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum LedState {
    #[default]
    Off = 0,
    Fault = 1,
    /// Links on the port are training.
    Initialize = 2,
    /// Links are up with no traffic.
    UpWarm = 3,
    UpActive = 4,
    Locate = 5,
}

impl LedState {
    pub fn from_code(code: u8) -> Result<Self, CciError> {
        Ok(match code {
            0 => Self::Off,
            1 => Self::Fault,
            2 => Self::Initialize,
            3 => Self::UpWarm,
            4 => Self::UpActive,
            5 => Self::Locate,
            _ => return Err(CciError::Io),
        })
    }

    /// Lower is shown in preference to higher when partner links on a port
    /// disagree.
    fn rank(self) -> u8 {
        match self {
            Self::Fault => 0,
            Self::Off => 1,
            Self::Initialize => 2,
            Self::UpWarm | Self::UpActive | Self::Locate => 3,
        }
    }

    /// The state a port shows when one link says `self` and a partner link
    /// says `other`.
    pub fn resolve(self, other: Self) -> Self {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Port {
    A,
    B,
}

impl Port {
    pub fn from_index(i: u8) -> Result<Self, CciError> {
        match i {
            0 => Ok(Self::A),
            1 => Ok(Self::B),
            _ => Err(CciError::BadArgs),
        }
    }

    /// Port whose LED shows a link using `lanes`.
    pub fn of_lanes(lanes: u8) -> Self {
        if lanes & 0x0f != 0 {
            Self::A
        } else {
            Self::B
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::A => 0b01,
            Self::B => 0b10,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CageLeds {
    pub a: LedState,
    pub b: LedState,
}

impl CageLeds {
    pub const OFF: Self = Self {
        a: LedState::Off,
        b: LedState::Off,
    };

    pub fn get(&self, port: Port) -> LedState {
        match port {
            Port::A => self.a,
            Port::B => self.b,
        }
    }

    pub fn set(&mut self, port: Port, state: LedState) {
        match port {
            Port::A => self.a = state,
            Port::B => self.b = state,
        }
    }

    pub fn to_reg(self) -> u8 {
        (self.a as u8) | ((self.b as u8) << 4)
    }

    pub fn from_reg(val: u8) -> Result<Self, CciError> {
        Ok(Self {
            a: LedState::from_code(val & 0xf)?,
            b: LedState::from_code(val >> 4)?,
        })
    }
}

/// Ports of a cage that are being located, one bit per port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Locate(u8);

impl Locate {
    pub fn set(&mut self, port: Port, on: bool) {
        if on {
            self.0 |= port.bit();
        } else {
            self.0 &= !port.bit();
        }
    }

    pub fn contains(&self, port: Port) -> bool {
        self.0 & port.bit() != 0
    }
}
