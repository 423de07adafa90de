// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfers between host buffers and the Falcon's EMEM aperture.
//!
//! Addresses are Falcon data-space addresses and must fall inside EMEM,
//! which sits directly above the highest DMEM virtual address. Transfers go
//! through an EMEMC/EMEMD port pair: EMEMC selects the offset and enables
//! auto-increment, and each EMEMD access moves one 32-bit word.

use drv_soe_api::{SoeError, DMEM_ALIGNMENT};

use crate::falcon::{regs, FalconIo};
use crate::hal::SoeHal;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    ToEmem,
    FromEmem,
}

/// Checks the transfer and programs EMEMC. Returns the EMEMD register for
/// the port.
fn setup<R: FalconIo, H: SoeHal>(
    io: &mut R,
    hal: &H,
    port: u8,
    addr: u32,
    len: usize,
    dir: Direction,
) -> Result<u32, SoeError> {
    if len == 0 || addr as usize % DMEM_ALIGNMENT != 0 {
        return Err(SoeError::BadEmemAccess);
    }
    if port >= hal.emem_ports() {
        return Err(SoeError::BadEmemAccess);
    }

    let start = hal.emem_start(io)?;
    let end = start.saturating_add(hal.emem_size(io));
    let len = u32::try_from(len).map_err(|_| SoeError::BadEmemAccess)?;
    let last = addr.checked_add(len).ok_or(SoeError::BadEmemAccess)?;
    if addr < start || last > end {
        return Err(SoeError::BadEmemAccess);
    }

    let mut ememc = (addr - start) & (regs::EMEMC_OFFS | regs::EMEMC_BLK);
    ememc |= match dir {
        Direction::ToEmem => regs::EMEMC_AINCW,
        Direction::FromEmem => regs::EMEMC_AINCR,
    };
    io.write(regs::ememc(port), ememc);
    Ok(regs::ememd(port))
}

/// Copies `data` into EMEM at `addr`.
pub fn copy_to<R: FalconIo, H: SoeHal>(
    io: &mut R,
    hal: &H,
    port: u8,
    addr: u32,
    data: &[u8],
) -> Result<(), SoeError> {
    let ememd = setup(io, hal, port, addr, data.len(), Direction::ToEmem)?;

    let mut words = data.chunks_exact(4);
    for w in &mut words {
        io.write(ememd, u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    }

    let rest = words.remainder();
    if !rest.is_empty() {
        // Auto-increment is only armed for writes, so this read leaves the
        // pointer on the word we are about to patch.
        let mut word = io.read(ememd).to_le_bytes();
        word[..rest.len()].copy_from_slice(rest);
        io.write(ememd, u32::from_le_bytes(word));
    }
    Ok(())
}

/// Fills `data` from EMEM at `addr`.
pub fn copy_from<R: FalconIo, H: SoeHal>(
    io: &mut R,
    hal: &H,
    port: u8,
    addr: u32,
    data: &mut [u8],
) -> Result<(), SoeError> {
    let ememd = setup(io, hal, port, addr, data.len(), Direction::FromEmem)?;

    let mut words = data.chunks_exact_mut(4);
    for w in &mut words {
        w.copy_from_slice(&io.read(ememd).to_le_bytes());
    }

    let rest = words.into_remainder();
    if !rest.is_empty() {
        let word = io.read(ememd).to_le_bytes();
        let n = rest.len();
        rest.copy_from_slice(&word[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Lr10, Ls10};
    use crate::sim::SimFalcon;

    #[test]
    fn round_trips_with_partial_tail_word() {
        let mut sim = SimFalcon::ls10();
        let base = Ls10.emem_start(&mut sim).unwrap();
        copy_to(&mut sim, &Ls10, 0, base + 8, &[0x11; 8]).unwrap();

        // Overwrite three bytes of the first word; the fourth must survive.
        copy_to(&mut sim, &Ls10, 1, base + 8, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 8];
        copy_from(&mut sim, &Ls10, 2, base + 8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0x11, 0x11, 0x11, 0x11, 0x11]);
    }

    #[test]
    fn rejects_bad_transfers() {
        let mut sim = SimFalcon::lr10();
        let base = Lr10.emem_start(&mut sim).unwrap();
        let size = Lr10.emem_size(&mut sim);
        let mut buf = [0u8; 4];

        assert_eq!(
            copy_from(&mut sim, &Lr10, 0, base, &mut []),
            Err(SoeError::BadEmemAccess)
        );
        assert_eq!(
            copy_from(&mut sim, &Lr10, 0, base + 2, &mut buf),
            Err(SoeError::BadEmemAccess)
        );
        // LR10 has a single port.
        assert_eq!(
            copy_from(&mut sim, &Lr10, 1, base, &mut buf),
            Err(SoeError::BadEmemAccess)
        );
        assert_eq!(
            copy_from(&mut sim, &Lr10, 0, base - 4, &mut buf),
            Err(SoeError::BadEmemAccess)
        );
        assert_eq!(
            copy_from(&mut sim, &Lr10, 0, base + size - 4, &mut [0u8; 8]),
            Err(SoeError::BadEmemAccess)
        );
        assert_eq!(copy_from(&mut sim, &Lr10, 0, base + size - 4, &mut buf), Ok(()));
    }

    #[test]
    fn oversized_tag_width_is_refused() {
        let mut sim = SimFalcon::lr10();
        sim.write(regs::HWCFG1, 24 << regs::HWCFG1_DMEM_TAG_WIDTH_SHIFT);
        assert_eq!(Lr10.emem_start(&mut sim), Err(SoeError::BadEmemAccess));
        assert_eq!(
            copy_from(&mut sim, &Lr10, 0, 0x1_0000, &mut [0u8; 4]),
            Err(SoeError::BadEmemAccess)
        );

        sim.write(regs::HWCFG1, 23 << regs::HWCFG1_DMEM_TAG_WIDTH_SHIFT);
        assert_eq!(Lr10.emem_start(&mut sim), Ok(1 << 31));
    }
}
