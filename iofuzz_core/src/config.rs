use crate::fuzzer::MAX_PORTS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("empty entry in port list")]
    EmptyEntry,
    #[error("invalid port number '{0}'")]
    InvalidNumber(String),
    #[error("port {0:#x} is outside the 16-bit port space")]
    PortOutOfRange(u64),
    #[error("port range {0:#x}-{1:#x} is reversed")]
    ReversedRange(u16, u16),
    #[error("port list has more than {} entries", MAX_PORTS)]
    TooManyPorts,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Single iteration over a captured input.
    #[default]
    Replay,
    /// Unbounded iterations over seeded pseudorandom inputs.
    Generate,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Quiet => log::LevelFilter::Error,
            Verbosity::Normal => log::LevelFilter::Warn,
            Verbosity::Verbose => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
}

pub fn default_seed() -> u64 {
    crate::driver::DEFAULT_SEED
}

pub fn default_timeout_secs() -> u64 {
    5
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            seed: default_seed(),
            timeout_secs: default_timeout_secs(),
            max_iterations: None,
            dry_run: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Port list in the `--ports` syntax, e.g. `"0x60,0x64,0x70-0x71"`.
    #[serde(default)]
    pub ports: Option<String>,
}

impl TargetSettings {
    pub fn port_list(&self) -> Result<Option<Vec<u16>>, ConfigError> {
        self.ports.as_deref().map(parse_port_list).transpose()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    /// Log file, opened for appending. Records go to stdout when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub verbosity: Verbosity,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct IoFuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl IoFuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: IoFuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.target.port_list()?;
        Ok(config)
    }
}

/// Parses a number the way `strtoul(.., 0)` does: `0x` hex, leading `0`
/// octal, decimal otherwise.
pub fn parse_number(text: &str) -> Result<u64, ConfigError> {
    let text = text.trim();
    let invalid = || ConfigError::InvalidNumber(text.to_owned());
    if text.is_empty() {
        return Err(ConfigError::EmptyEntry);
    }
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

fn parse_port(text: &str) -> Result<u16, ConfigError> {
    let value = parse_number(text)?;
    u16::try_from(value).map_err(|_| ConfigError::PortOutOfRange(value))
}

/// Parses a comma separated list of ports and inclusive `a-b` ranges.
pub fn parse_port_list(list: &str) -> Result<Vec<u16>, ConfigError> {
    let mut ports = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ConfigError::EmptyEntry);
        }
        let (first, last) = match entry.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(entry)?;
                (port, port)
            }
        };
        if first > last {
            return Err(ConfigError::ReversedRange(first, last));
        }
        if ports.len() + usize::from(last - first) + 1 > MAX_PORTS {
            return Err(ConfigError::TooManyPorts);
        }
        ports.extend(first..=last);
    }
    Ok(ports)
}
