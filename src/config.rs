use std::{collections::HashMap, path::Path, str::FromStr};

use anyhow::{Context, Result};
use ini::Ini;
use netrace_core::{ConfigError, ModuleConfig};
use probe_common::schema::{EVENT_CAPACITY_DEFAULT, SECTION_HEADER_SIZE};

pub const EVENTS_SECTION: &str = "events";
pub const FILTERS_SECTION: &str = "filters";
pub const TRACKING_SECTION: &str = skb_tracking::MODULE_NAME;

/// Configuration of every component, one [`ModuleConfig`] per `INI`
/// section. Keys outside of a section are ignored.
#[derive(Debug, Clone, Default)]
pub struct NetraceConfig {
    sections: HashMap<String, ModuleConfig>,
}

impl NetraceConfig {
    pub fn from_file(config_file: impl AsRef<Path>) -> Result<Self> {
        let config_file = config_file.as_ref();
        let ini = Ini::load_from_file(config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&ini))
    }

    fn from_ini(ini: &Ini) -> Self {
        let mut sections: HashMap<String, ModuleConfig> = HashMap::new();
        for (section, prop) in ini {
            let Some(section) = section else {
                continue;
            };
            let module_config = sections.entry(section.to_string()).or_default();
            for (key, value) in prop.iter() {
                log::debug!("{section}.{key}={value}");
                module_config.insert(key.to_string(), value.to_string());
            }
        }
        Self { sections }
    }

    /// Configuration of a section, empty if the section is missing.
    pub fn module_config(&self, section: &str) -> ModuleConfig {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    /// Set a single value, creating the section if needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }
}

impl FromStr for NetraceConfig {
    type Err = anyhow::Error;

    fn from_str(config: &str) -> Result<Self> {
        let ini = Ini::load_from_str(config).context("Error parsing configuration")?;
        Ok(Self::from_ini(&ini))
    }
}

/// `[events]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventsConfig {
    /// Size in bytes of the buffer of a single event.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: EVENT_CAPACITY_DEFAULT,
        }
    }
}

impl TryFrom<&ModuleConfig> for EventsConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let capacity = config.with_default("capacity", EVENT_CAPACITY_DEFAULT)?;
        if capacity <= SECTION_HEADER_SIZE {
            return Err(ConfigError::invalid(
                "capacity",
                capacity,
                format!("must be greater than {SECTION_HEADER_SIZE}"),
            ));
        }
        Ok(Self { capacity })
    }
}
