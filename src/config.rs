use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub loader: LoaderConfig,
    pub emulator: EmulatorConfig,
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Directories searched for implicitly linked DLLs after the importing
    /// module's own directory.
    pub search_path: Vec<PathBuf>,
    /// Reported Windows version; below 3.00 extension-less imports are `.EXE`.
    pub windows_version: u16,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_path: Vec::new(),
            windows_version: 0x030a,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    pub bios_tick_ms: u64,
    pub relay_code: Option<RelayCode>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            bios_tick_ms: 55,
            relay_code: None,
        }
    }
}

/// Linear address range of the host's 16-bit relay thunks.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayCode {
    pub start: u32,
    pub end: u32,
}

impl RelayCode {
    pub fn range(self) -> Range<u32> {
        self.start..self.end
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsConfig {
    pub device: PathBuf,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/port"),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config '{}'", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
