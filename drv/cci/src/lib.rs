// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cable onboarding for NVLink cable cages.
//!
//! Each cage holds one CMIS module carrying some number of NVLinks. The
//! [`CciDevice`] keeps a small state machine per module that finds out what
//! kind of cable is plugged in, validates it, hands it to the matching
//! bring-up routine and then watches its links, retrying a bounded number of
//! times when training fails and starting over when a cable is swapped.
//!
//! Nothing in here blocks for long. The host calls [`CciDevice::tick`] from
//! its periodic poll; each call runs at most one phase per module. All
//! hardware is reached through the collaborator traits in [`platform`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod cmis;
pub mod config;
pub mod cpld;
pub mod device;
pub mod led;
pub mod links;
pub mod module;
pub mod platform;

#[cfg(test)]
mod fake;

pub use config::CciConfig;
pub use device::{CciDevice, Trace};
pub use module::{CableType, Phase};

use drv_soe_api::SoeError;
use static_assertions::const_assert;

/// Cages per device. Module masks are `u32`.
pub const MAX_MODULES: usize = 16;
/// NVLinks per device. Link masks are `u64`.
pub const MAX_LINKS: usize = 64;

const_assert!(MAX_MODULES <= 32);
const_assert!(MAX_LINKS <= 64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CciError {
    NotSupported,
    BadArgs,
    NotFound,
    /// Someone else holds the module's CMIS lock.
    InUse,
    /// A CPLD, CMIS or link access failed.
    Io,
    ChecksumMismatch,
    UnsupportedRevision(u8),
    UnsupportedIdentifier(u8),
    InvalidCableType,
    /// The operation only makes sense with continuous ALI turned off.
    ContinuousAliEnabled,
    Soe(SoeError),
}

impl From<SoeError> for CciError {
    fn from(e: SoeError) -> Self {
        Self::Soe(e)
    }
}

/// Iterates over the indices of the set bits in `mask`, lowest first.
pub(crate) fn bits(mut mask: u64) -> impl Iterator<Item = u8> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let i = mask.trailing_zeros();
        mask &= mask - 1;
        Some(i as u8)
    })
}
