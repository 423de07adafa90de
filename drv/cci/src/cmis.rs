// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CMIS module access: the per-module lock, paged reads and writes, and
//! identification of what is plugged in.
//!
//! A CMIS module exposes a 256-byte window. The lower half is fixed; the
//! upper half shows whichever bank and page were last selected through
//! bytes 0x7E and 0x7F. Flat-memory modules only have bank 0 page 0.

use crate::module::CableType;
use crate::platform::CmisBus;
use crate::CciError;

pub const BANK_SELECT: u8 = 0x7e;
pub const PAGE_SELECT: u8 = 0x7f;
pub const UPPER_START: u8 = 0x80;
pub const MAX_ACCESS: usize = 128;

/// Lower page bytes used by identification.
pub const IDENTIFIER: u8 = 0;
pub const REVISION: u8 = 1;
pub const CHARACTERISTICS: u8 = 2;
pub const FLAT_MEMORY: u8 = 1 << 7;

/// Page 00h bytes.
pub const MEDIA_INTERFACE_TECH: u8 = 212;
pub const CHECKSUM: u8 = 222;

/// Identifiers of modules that speak CMIS.
pub const CMIS_IDENTIFIERS: [u8; 4] = [0x18, 0x19, 0x1b, 0x1e];

/// Who holds a module's CMIS lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockOwner {
    /// The onboarding engine.
    Driver,
    /// An outside client, by id.
    Client(u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmisLock {
    locked: bool,
    timestamp: u64,
    owner: LockOwner,
}

impl Default for CmisLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CmisLock {
    pub const fn new() -> Self {
        Self {
            locked: false,
            timestamp: 0,
            owner: LockOwner::Driver,
        }
    }

    /// Takes (or refreshes) the lock for `owner`. A lock left idle for
    /// `timeout_ms` is taken away from its holder.
    pub fn try_lock(
        &mut self,
        owner: LockOwner,
        now: u64,
        timeout_ms: u64,
    ) -> Result<(), CciError> {
        if self.locked && now.saturating_sub(self.timestamp) >= timeout_ms {
            self.locked = false;
        }
        if self.locked && self.owner != owner {
            return Err(CciError::InUse);
        }
        *self = Self {
            locked: true,
            timestamp: now,
            owner,
        };
        Ok(())
    }

    pub fn unlock(&mut self, owner: LockOwner) -> Result<(), CciError> {
        if self.locked && self.owner != owner {
            return Err(CciError::InUse);
        }
        self.locked = false;
        Ok(())
    }

    pub fn holder(&self) -> Option<LockOwner> {
        self.locked.then_some(self.owner)
    }
}

/// Location of a CMIS access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub bank: u8,
    pub page: u8,
    pub addr: u8,
}

impl Target {
    pub const fn lower(addr: u8) -> Self {
        Self {
            bank: 0,
            page: 0,
            addr,
        }
    }

    pub const fn page(page: u8, addr: u8) -> Self {
        Self {
            bank: 0,
            page,
            addr,
        }
    }
}

/// Checks an access and selects its bank and page. Returns the selection to
/// put back afterwards, if it had to be changed.
fn setup<B: CmisBus>(
    bus: &mut B,
    module: u8,
    flat: bool,
    t: Target,
    len: usize,
) -> Result<Option<[u8; 2]>, CciError> {
    if len == 0 || len > MAX_ACCESS || usize::from(t.addr) + len > 256 {
        return Err(CciError::BadArgs);
    }
    if flat && (t.bank != 0 || t.page != 0) {
        return Err(CciError::BadArgs);
    }
    if flat || usize::from(t.addr) + len <= usize::from(UPPER_START) {
        return Ok(None);
    }

    let mut saved = [0u8; 2];
    bus.cmis_read(module, BANK_SELECT, &mut saved)?;
    let want = [t.bank, t.page];
    if saved == want {
        return Ok(None);
    }
    bus.cmis_write(module, BANK_SELECT, &want)?;
    Ok(Some(saved))
}

fn restore<B: CmisBus>(
    bus: &mut B,
    module: u8,
    saved: Option<[u8; 2]>,
) -> Result<(), CciError> {
    match saved {
        Some(s) => bus.cmis_write(module, BANK_SELECT, &s),
        None => Ok(()),
    }
}

pub fn read<B: CmisBus>(
    bus: &mut B,
    module: u8,
    flat: bool,
    t: Target,
    out: &mut [u8],
) -> Result<(), CciError> {
    let saved = setup(bus, module, flat, t, out.len())?;
    let r = bus.cmis_read(module, t.addr, out);
    // Put the selection back even if the read failed.
    let s = restore(bus, module, saved);
    r.and(s)
}

pub fn write<B: CmisBus>(
    bus: &mut B,
    module: u8,
    flat: bool,
    t: Target,
    data: &[u8],
) -> Result<(), CciError> {
    let saved = setup(bus, module, flat, t, data.len())?;
    let r = bus.cmis_write(module, t.addr, data);
    let s = restore(bus, module, saved);
    r.and(s)
}

/// What identification found out about a module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CableInfo {
    pub identifier: u8,
    pub revision: u8,
    pub flat_memory: bool,
    pub cable: CableType,
}

/// Maps the page 00h media interface technology byte to a cable type.
pub fn cable_type(media: u8) -> CableType {
    match media {
        0x00..=0x09 => CableType::Optical,
        0x0a..=0x0b => CableType::Copper,
        0x0c..=0x0f => CableType::Direct,
        _ => CableType::Invalid,
    }
}

pub fn identify<B: CmisBus>(bus: &mut B, module: u8) -> Result<CableInfo, CciError> {
    let mut lower = [0u8; 3];
    read(bus, module, false, Target::lower(IDENTIFIER), &mut lower)?;
    let identifier = lower[IDENTIFIER as usize];
    if !CMIS_IDENTIFIERS.contains(&identifier) {
        return Err(CciError::UnsupportedIdentifier(identifier));
    }
    let flat_memory = lower[CHARACTERISTICS as usize] & FLAT_MEMORY != 0;

    let mut media = [0u8];
    read(
        bus,
        module,
        flat_memory,
        Target::page(0, MEDIA_INTERFACE_TECH),
        &mut media,
    )?;

    Ok(CableInfo {
        identifier,
        revision: lower[REVISION as usize],
        flat_memory,
        cable: cable_type(media[0]),
    })
}

/// Checks the revision and the page 00h checksum. Passive copper with rxDet
/// is accepted as is.
pub fn validate<B: CmisBus>(
    bus: &mut B,
    module: u8,
    info: &CableInfo,
    rx_det: bool,
) -> Result<(), CciError> {
    if info.cable == CableType::Copper && rx_det {
        return Ok(());
    }

    let major = info.revision >> 4;
    if !matches!(major, 4 | 5) {
        return Err(CciError::UnsupportedRevision(info.revision));
    }

    const LEN: usize = (CHECKSUM - UPPER_START) as usize + 1;
    let mut page = [0u8; LEN];
    read(
        bus,
        module,
        info.flat_memory,
        Target::page(0, UPPER_START),
        &mut page,
    )?;
    let sum = page[..LEN - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != page[LEN - 1] {
        return Err(CciError::ChecksumMismatch);
    }
    Ok(())
}
