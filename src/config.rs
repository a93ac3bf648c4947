//! Runtime configuration: defaults for the timeout, inter-test delay,
//! retry count, and device cap that the CLI/bridge layers above the
//! core would otherwise have to hardcode.
//!
//! Grounded in `comsrv`'s layered use of the `config` crate (defaults,
//! then an optional file, then environment overrides prefixed
//! `MODBUS_MESH_`).

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_max_devices")]
    pub default_max_devices: usize,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_delay_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    1
}

fn default_max_devices() -> usize {
    1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            default_delay_ms: default_delay_ms(),
            default_max_retries: default_max_retries(),
            default_max_devices: default_max_devices(),
        }
    }
}

impl RuntimeConfig {
    /// Layers an optional `modbus_mesh.toml` over the built-in defaults,
    /// then applies `MODBUS_MESH_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("default_timeout_ms", default_timeout_ms())?
            .set_default("default_delay_ms", default_delay_ms())?
            .set_default("default_max_retries", default_max_retries())?
            .set_default("default_max_devices", default_max_devices() as i64)?
            .add_source(File::with_name("modbus_mesh").required(false))
            .add_source(Environment::with_prefix("MODBUS_MESH"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_discovery_scanner_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.default_timeout_ms, 1000);
        assert_eq!(cfg.default_delay_ms, 100);
        assert_eq!(cfg.default_max_retries, 1);
        assert_eq!(cfg.default_max_devices, 1);
    }
}
