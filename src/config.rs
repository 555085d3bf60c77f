//! Machine configuration.
//!
//! With the `serde-config` feature the configuration can be read from YAML or
//! JSON files:
//!
//! ```yaml
//! ram_size: 1048576
//! rom: tos.img
//! refresh_hz: 50
//! modules:
//!   - path: modules/chipset.stm
//!     kind: system
//! ```

#[cfg(feature = "serde-config")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::glue::SyncMode;
use crate::module::{ExternalMemory, ModuleType};
use crate::psg::DEFAULT_SAMPLE_RATE;

/// One module to load: image path relative to the storage root, and the
/// capability it must provide.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-config", derive(Serialize, Deserialize))]
pub struct ModuleSpec {
    pub path: String,
    pub kind: ModuleType,
}

impl ModuleSpec {
    pub fn new(path: impl Into<String>, kind: ModuleType) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde-config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-config", serde(default))]
pub struct MachineConfig {
    pub ram_size: usize,
    pub rom: Option<String>,
    pub cartridge: Option<String>,
    /// 50 or 60
    pub refresh_hz: u32,
    pub sample_rate: u32,
    pub pool_base: u32,
    pub pool_size: usize,
    pub modules: Vec<ModuleSpec>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 0x10_0000,
            rom: None,
            cartridge: None,
            refresh_hz: 50,
            sample_rate: DEFAULT_SAMPLE_RATE,
            pool_base: ExternalMemory::DEFAULT_BASE,
            pool_size: ExternalMemory::DEFAULT_CAPACITY,
            modules: Vec::new(),
        }
    }
}

impl MachineConfig {
    pub fn sync_mode(&self) -> Result<SyncMode> {
        SyncMode::from_refresh(self.refresh_hz).ok_or_else(|| {
            Error::invalid_argument(format!("refresh rate {} Hz (50 or 60)", self.refresh_hz))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.sync_mode()?;
        if self.sample_rate == 0 {
            return Err(Error::invalid_argument("sample rate 0"));
        }
        if self.pool_size == 0 {
            return Err(Error::invalid_argument("empty module pool"));
        }
        if let Some(spec) = self.modules.iter().find(|m| m.path.is_empty()) {
            return Err(Error::invalid_argument(format!(
                "{:?} module without a path",
                spec.kind
            )));
        }
        Ok(())
    }

    /// Parse from YAML, or JSON when `path` ends in `.json`.
    #[cfg(feature = "serde-config")]
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::not_found(format!("{}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&text)
                .map_err(|e| Error::invalid_argument(format!("{}: {e}", path.display())))?
        } else {
            serde_yaml::from_str(&text)
                .map_err(|e| Error::invalid_argument(format!("{}: {e}", path.display())))?
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_one_megabyte_pal_machine() {
        let config = MachineConfig::default();
        assert_eq!(config.ram_size, 1 << 20);
        assert_eq!(config.sync_mode().unwrap(), SyncMode::Hz50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = MachineConfig {
            refresh_hz: 70,
            ..MachineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = MachineConfig {
            modules: vec![ModuleSpec::new("", ModuleType::Io)],
            ..MachineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[cfg(feature = "serde-config")]
    #[test]
    fn yaml_config_fills_in_defaults() {
        let yaml = "ram_size: 524288\nrefresh_hz: 60\nmodules:\n  - path: chipset.stm\n    kind: system\n";
        let config: MachineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ram_size, 0x8_0000);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(
            config.modules,
            vec![ModuleSpec::new("chipset.stm", ModuleType::System)]
        );
    }

    #[cfg(feature = "serde-config")]
    #[test]
    fn json_config_round_trips() {
        let config = MachineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MachineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
