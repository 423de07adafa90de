// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which links live on which module.

use crate::config::LinkMapping;
use crate::{bits, CciError, MAX_LINKS, MAX_MODULES};

#[derive(Copy, Clone, Debug)]
pub struct LinkMap {
    module_of: [Option<u8>; MAX_LINKS],
    lanes: [u8; MAX_LINKS],
    by_module: [u64; MAX_MODULES],
}

impl LinkMap {
    pub fn new(entries: &[LinkMapping]) -> Result<Self, CciError> {
        let mut map = Self {
            module_of: [None; MAX_LINKS],
            lanes: [0; MAX_LINKS],
            by_module: [0; MAX_MODULES],
        };
        for e in entries {
            let link = usize::from(e.link);
            let module = usize::from(e.module);
            if link >= MAX_LINKS
                || module >= MAX_MODULES
                || map.module_of[link].is_some()
            {
                return Err(CciError::BadArgs);
            }
            map.module_of[link] = Some(e.module);
            map.lanes[link] = e.lanes;
            map.by_module[module] |= 1 << link;
        }
        Ok(map)
    }

    pub fn module_of(&self, link: u8) -> Option<u8> {
        self.module_of.get(usize::from(link)).copied().flatten()
    }

    /// Modules carrying any of the links in `links`.
    pub fn modules_of(&self, links: u64) -> u32 {
        bits(links)
            .filter_map(|l| self.module_of(l))
            .fold(0, |acc, m| acc | (1 << m))
    }

    /// Module lanes used by `link`.
    pub fn lane_mask(&self, link: u8) -> Option<u8> {
        self.module_of(link)?;
        Some(self.lanes[usize::from(link)])
    }

    /// Every link that belongs to some module.
    pub fn managed(&self) -> u64 {
        self.by_module.iter().fold(0, |acc, m| acc | m)
    }

    pub fn links_of(&self, module: u8) -> u64 {
        self.by_module
            .get(usize::from(module))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(link: u8, module: u8, lanes: u8) -> LinkMapping {
        LinkMapping {
            link,
            module,
            lanes,
        }
    }

    #[test]
    fn lookups() {
        let map =
            LinkMap::new(&[m(0, 0, 0x0f), m(1, 0, 0xf0), m(40, 3, 0xff)])
                .unwrap();
        assert_eq!(map.module_of(1), Some(0));
        assert_eq!(map.module_of(2), None);
        assert_eq!(map.module_of(200), None);
        assert_eq!(map.modules_of(0b11 | 1 << 40 | 1 << 7), 0b1001);
        assert_eq!(map.lane_mask(1), Some(0xf0));
        assert_eq!(map.lane_mask(5), None);
        assert_eq!(map.managed(), 0b11 | 1 << 40);
        assert_eq!(map.links_of(0), 0b11);
        assert_eq!(map.links_of(3), 1 << 40);
        assert_eq!(map.links_of(99), 0);
    }

    #[test]
    fn rejects_duplicates() {
        assert_eq!(
            LinkMap::new(&[m(4, 0, 1), m(4, 1, 1)]).map(|_| ()),
            Err(CciError::BadArgs)
        );
    }
}
