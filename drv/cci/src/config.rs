// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board description and tunables for the onboarding engine.
//!
//! ```toml
//! cages-mask = 0x3
//! link-map = [
//!     { link = 0, module = 0, lanes = 0x0f },
//!     { link = 1, module = 0, lanes = 0xf0 },
//!     { link = 2, module = 1, lanes = 0x0f },
//! ]
//! continuous-ali = false
//! ```

use serde::Deserialize;

use crate::{CciError, MAX_LINKS, MAX_MODULES};

/// One NVLink and the module (and lanes of it) that carry it.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LinkMapping {
    pub link: u8,
    pub module: u8,
    /// Module lanes used by the link.
    pub lanes: u8,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CciConfig {
    /// Modules that physically exist on this board.
    #[serde(default)]
    pub cages_mask: u32,
    pub link_map: heapless::Vec<LinkMapping, MAX_LINKS>,
    #[serde(default = "default_max_onboard_attempts")]
    pub max_onboard_attempts: u32,
    #[serde(default = "default_polling_rate_hz")]
    pub polling_rate_hz: u32,
    #[serde(default = "default_onboard_rate_hz")]
    pub onboard_rate_hz: u32,
    #[serde(default = "default_presence_rate_hz")]
    pub presence_rate_hz: u32,
    #[serde(default = "default_traffic_rate_hz")]
    pub traffic_rate_hz: u32,
    #[serde(default = "default_cmis_lock_timeout_ms")]
    pub cmis_lock_timeout_ms: u64,
    #[serde(default = "default_continuous_ali")]
    pub continuous_ali: bool,
    /// Modules whose receivers use rxDet.
    #[serde(default)]
    pub rx_det_mask: u32,
    #[serde(default = "default_onboard_cmd_timeout_ms")]
    pub onboard_cmd_timeout_ms: u64,
    #[serde(default = "default_shutdown_cmd_timeout_ms")]
    pub shutdown_cmd_timeout_ms: u64,
}

fn default_max_onboard_attempts() -> u32 {
    5
}

fn default_polling_rate_hz() -> u32 {
    10
}

fn default_onboard_rate_hz() -> u32 {
    10
}

fn default_presence_rate_hz() -> u32 {
    2
}

fn default_traffic_rate_hz() -> u32 {
    1
}

fn default_cmis_lock_timeout_ms() -> u64 {
    10_000
}

fn default_continuous_ali() -> bool {
    true
}

fn default_onboard_cmd_timeout_ms() -> u64 {
    drv_soe_api::PORT_TIMEOUT_MS
}

fn default_shutdown_cmd_timeout_ms() -> u64 {
    drv_soe_api::ADMIN_TIMEOUT_MS
}

impl Default for CciConfig {
    fn default() -> Self {
        Self {
            cages_mask: 0,
            link_map: heapless::Vec::new(),
            max_onboard_attempts: default_max_onboard_attempts(),
            polling_rate_hz: default_polling_rate_hz(),
            onboard_rate_hz: default_onboard_rate_hz(),
            presence_rate_hz: default_presence_rate_hz(),
            traffic_rate_hz: default_traffic_rate_hz(),
            cmis_lock_timeout_ms: default_cmis_lock_timeout_ms(),
            continuous_ali: default_continuous_ali(),
            rx_det_mask: 0,
            onboard_cmd_timeout_ms: default_onboard_cmd_timeout_ms(),
            shutdown_cmd_timeout_ms: default_shutdown_cmd_timeout_ms(),
        }
    }
}

impl CciConfig {
    pub fn validate(&self) -> Result<(), CciError> {
        let cages = u32::MAX >> (32 - MAX_MODULES);
        if self.cages_mask & !cages != 0 {
            return Err(CciError::BadArgs);
        }

        let mut seen = 0u64;
        for m in &self.link_map {
            if usize::from(m.link) >= MAX_LINKS
                || usize::from(m.module) >= MAX_MODULES
                || self.cages_mask & (1 << m.module) == 0
            {
                return Err(CciError::BadArgs);
            }
            let bit = 1u64 << m.link;
            if seen & bit != 0 {
                return Err(CciError::BadArgs);
            }
            seen |= bit;
        }

        for rate in [
            self.onboard_rate_hz,
            self.presence_rate_hz,
            self.traffic_rate_hz,
        ] {
            poll_cadence::interval_for(self.polling_rate_hz, rate)
                .map_err(|_| CciError::BadArgs)?;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
#[derive(Debug)]
pub enum ConfigError {
    Toml(toml::de::Error),
    Invalid(CciError),
}

#[cfg(feature = "std")]
impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Toml(e) => write!(f, "{e}"),
            ConfigError::Invalid(e) => write!(f, "invalid configuration: {e:?}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

#[cfg(feature = "std")]
impl CciConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text).map_err(ConfigError::Toml)?;
        cfg.validate().map_err(ConfigError::Invalid)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(u8, u8)]) -> heapless::Vec<LinkMapping, MAX_LINKS> {
        entries
            .iter()
            .map(|&(link, module)| LinkMapping {
                link,
                module,
                lanes: 0xf,
            })
            .collect()
    }

    #[test]
    fn defaults_validate() {
        let cfg = CciConfig {
            cages_mask: 0b11,
            link_map: map(&[(0, 0), (1, 1)]),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
        assert_eq!(cfg.max_onboard_attempts, 5);
        assert!(cfg.continuous_ali);
    }

    #[test]
    fn rejects_bad_maps_and_rates() {
        let base = CciConfig {
            cages_mask: 0b1,
            ..Default::default()
        };
        let bad = [
            CciConfig {
                link_map: map(&[(64, 0)]),
                ..base.clone()
            },
            CciConfig {
                link_map: map(&[(0, 1)]),
                ..base.clone()
            },
            CciConfig {
                link_map: map(&[(3, 0), (3, 0)]),
                ..base.clone()
            },
            CciConfig {
                presence_rate_hz: 3,
                ..base.clone()
            },
            CciConfig {
                cages_mask: 1 << 20,
                ..base.clone()
            },
        ];
        for cfg in bad {
            assert_eq!(cfg.validate(), Err(CciError::BadArgs), "{cfg:?}");
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn parses_toml() {
        let cfg = CciConfig::from_toml(
            r#"
            cages-mask = 3
            link-map = [
                { link = 0, module = 0, lanes = 0x0f },
                { link = 5, module = 1, lanes = 0xf0 },
            ]
            continuous-ali = false
            rx-det-mask = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.link_map.len(), 2);
        assert_eq!(cfg.link_map[1].link, 5);
        assert!(!cfg.continuous_ali);
        assert_eq!(cfg.polling_rate_hz, 10);

        assert!(matches!(
            CciConfig::from_toml("link-map = []\nbogus = 1"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            CciConfig::from_toml("link-map = [{ link = 0, module = 4, lanes = 1 }]"),
            Err(ConfigError::Invalid(CciError::BadArgs))
        ));
    }
}
