//! Service configuration
//!
//! Loaded from a YAML file such as:
//!
//! ```yaml
//! log_file: pairgate.log
//! log_level: 5
//! bind_address: 0.0.0.0
//! gateways:
//!   - port1: 7001
//!     port2: 7002
//!     multiply: 4
//! ```

use anyhow::{bail, Context, Result};
use pairgate_relay::{level, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "pairgate.yaml";

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Log file path; stderr when unset
    pub log_file: Option<PathBuf>,
    /// Numeric verbosity, 0 to 9
    pub log_level: u8,
    /// Address every gateway listens on
    pub bind_address: IpAddr,
    pub gateways: Vec<GatewayDefinition>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: level::GATEWAY,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            gateways: Vec::new(),
        }
    }
}

/// One gateway entry, possibly standing for several gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDefinition {
    pub port1: u16,
    pub port2: u16,
    /// Number of gateways on consecutive port numbers
    #[serde(default = "default_multiply")]
    pub multiply: u16,
}

fn default_multiply() -> u16 {
    1
}

impl GatewayDefinition {
    pub fn new(port1: u16, port2: u16) -> Self {
        Self {
            port1,
            port2,
            multiply: 1,
        }
    }

    /// Port pairs of every gateway this entry stands for.
    ///
    /// Adjacent port pairs step by two so the expanded pairs never overlap.
    pub fn expand(&self) -> Result<Vec<(u16, u16)>> {
        let incr: u32 = if self.port1.abs_diff(self.port2) == 1 { 2 } else { 1 };
        (0..u32::from(self.multiply))
            .map(|i| {
                let offset = i * incr;
                let port1 = u16::try_from(u32::from(self.port1) + offset);
                let port2 = u16::try_from(u32::from(self.port2) + offset);
                match (port1, port2) {
                    (Ok(port1), Ok(port2)) => Ok((port1, port2)),
                    _ => bail!(
                        "Gateway {}/{} multiplied {} times runs past port 65535",
                        self.port1,
                        self.port2,
                        self.multiply
                    ),
                }
            })
            .collect()
    }
}

impl FromStr for GatewayDefinition {
    type Err = anyhow::Error;

    /// Parses `port1:port2`.
    fn from_str(s: &str) -> Result<Self> {
        let (port1, port2) = s
            .split_once(':')
            .with_context(|| format!("Invalid gateway '{}', expected PORT1:PORT2", s))?;
        let port1 = port1
            .trim()
            .parse()
            .with_context(|| format!("Invalid first port in gateway '{}'", s))?;
        let port2 = port2
            .trim()
            .parse()
            .with_context(|| format!("Invalid second port in gateway '{}'", s))?;
        Ok(Self::new(port1, port2))
    }
}

impl ServiceConfig {
    /// Loads the configuration file at `path`.
    ///
    /// A relative `log_file` is resolved against the directory holding the
    /// configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config: ServiceConfig = serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        if let Some(log_file) = &config.log_file {
            if log_file.is_relative() {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                config.log_file = Some(dir.join(log_file));
            }
        }
        Ok(config)
    }

    /// Like [`ServiceConfig::load`], but falls back to the defaults when the
    /// file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_level > level::MAX {
            bail!(
                "Invalid log level {}, expected 0 to {}",
                self.log_level,
                level::MAX
            );
        }
        if self.gateway_configs()?.is_empty() {
            bail!("No gateway definitions in configuration");
        }
        Ok(())
    }

    /// Expands every gateway entry into the configuration of one gateway.
    pub fn gateway_configs(&self) -> Result<Vec<GatewayConfig>> {
        let mut configs = Vec::new();
        for definition in &self.gateways {
            for (port1, port2) in definition.expand()? {
                configs.push(GatewayConfig::new(port1, port2).with_bind_ip(self.bind_address));
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.log_file.is_none());
        assert_eq!(config.log_level, 5);
        assert_eq!(config.bind_address.to_string(), "0.0.0.0");
        assert!(config.gateways.is_empty());
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pairgate.yaml");
        fs::write(
            &path,
            "log_file: logs/pairgate.log\n\
             log_level: 7\n\
             bind_address: 127.0.0.1\n\
             gateways:\n\
             \x20 - port1: 7001\n\
             \x20   port2: 7002\n\
             \x20   multiply: 3\n\
             \x20 - port1: 9000\n\
             \x20   port2: 9100\n",
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.log_file, Some(dir.path().join("logs/pairgate.log")));
        assert_eq!(config.log_level, 7);
        assert_eq!(config.bind_address.to_string(), "127.0.0.1");
        assert_eq!(config.gateways.len(), 2);
        assert_eq!(config.gateways[1].multiply, 1);
        config.validate().unwrap();

        let configs = config.gateway_configs().unwrap();
        let ports: Vec<_> = configs.iter().map(|c| (c.port1, c.port2)).collect();
        assert_eq!(
            ports,
            vec![(7001, 7002), (7003, 7004), (7005, 7006), (9000, 9100)]
        );
        assert!(configs.iter().all(|c| c.bind_ip == config.bind_address));
    }

    #[test]
    fn test_absolute_log_file_is_kept() {
        let log_dir = TempDir::new().unwrap();
        let log_path = log_dir.path().join("gateway.log");
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "log_file: {}", log_path.display()).unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.log_file, Some(log_path));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert!(ServiceConfig::load(&dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "gateways: [{{ port1: seven }}]").unwrap();
        let err = ServiceConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_expand_steps_over_adjacent_ports() {
        let adjacent = GatewayDefinition {
            port1: 5001,
            port2: 5000,
            multiply: 3,
        };
        assert_eq!(
            adjacent.expand().unwrap(),
            vec![(5001, 5000), (5003, 5002), (5005, 5004)]
        );

        let apart = GatewayDefinition {
            port1: 5000,
            port2: 6000,
            multiply: 2,
        };
        assert_eq!(apart.expand().unwrap(), vec![(5000, 6000), (5001, 6001)]);
    }

    #[test]
    fn test_expand_past_last_port_fails() {
        let definition = GatewayDefinition {
            port1: 65533,
            port2: 65534,
            multiply: 2,
        };
        assert!(definition.expand().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            gateways: vec![GatewayDefinition {
                multiply: 0,
                ..GatewayDefinition::new(7001, 7002)
            }],
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServiceConfig {
            log_level: 10,
            gateways: vec![GatewayDefinition::new(7001, 7002)],
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_gateway_argument() {
        let definition: GatewayDefinition = "7001:7002".parse().unwrap();
        assert_eq!(definition, GatewayDefinition::new(7001, 7002));

        assert!("7001".parse::<GatewayDefinition>().is_err());
        assert!("7001:http".parse::<GatewayDefinition>().is_err());
        assert!("70000:7002".parse::<GatewayDefinition>().is_err());
    }
}
