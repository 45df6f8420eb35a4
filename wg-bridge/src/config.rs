// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the TOML configuration file, validating its
//! contents, and the name/CIDR checks shared with the tunnel config parser.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Longest Linux interface name (IFNAMSIZ - 1)
pub const MAX_TUNNEL_NAME_LEN: usize = 15;

/// Smallest accepted non-zero monitor interval
const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    if path.as_ref().exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.backend.config_dir.is_empty() {
        anyhow::bail!("backend.config_dir cannot be empty");
    }

    validate_name(
        &config.backend.userspace_implementation,
        "backend.userspace_implementation",
    )?;

    let interval = config.monitor.poll_interval_ms;
    if interval != 0 && interval < MIN_POLL_INTERVAL_MS {
        anyhow::bail!(
            "monitor.poll_interval_ms must be 0 (disabled) or >= {}, got {}",
            MIN_POLL_INTERVAL_MS,
            interval
        );
    }

    match config.bridge.bus.as_str() {
        "system" | "session" => {}
        other => anyhow::bail!("bridge.bus must be \"system\" or \"session\", got {:?}", other),
    }

    Ok(())
}

/// Validates that a name is safe to use as a command argument.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validate a tunnel name. The name doubles as the interface name, so the
/// Linux length limit applies on top of the character whitelist.
pub fn validate_tunnel_name(name: &str) -> Result<()> {
    validate_name(name, "Tunnel name")?;
    if name.len() > MAX_TUNNEL_NAME_LEN {
        anyhow::bail!(
            "Tunnel name '{}' is longer than {} characters",
            name,
            MAX_TUNNEL_NAME_LEN
        );
    }
    Ok(())
}

/// Parse CIDR notation (IPv4 or IPv6) into an (address, prefix) pair.
/// A bare address is accepted as a host route (/32 or /128).
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let cidr = cidr.trim();
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };

    let ip: IpAddr = addr.parse().context("Invalid IP address")?;
    let max_prefix = if ip.is_ipv4() { 32 } else { 128 };

    let prefix_len = match prefix {
        Some(p) => p.parse::<u8>().context("Invalid prefix length")?,
        None => max_prefix,
    };

    if prefix_len > max_prefix {
        anyhow::bail!("Prefix length must be <= {}", max_prefix);
    }

    Ok((ip, prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_cidr() {
        let (ip, prefix) = parse_cidr("10.0.0.2/32").unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(prefix, 32);

        let (ip, prefix) = parse_cidr("fd00::2/64").unwrap();
        assert_eq!(ip, "fd00::2".parse::<IpAddr>().unwrap());
        assert_eq!(prefix, 64);

        let (_, prefix) = parse_cidr(" 0.0.0.0/0 ").unwrap();
        assert_eq!(prefix, 0);
    }

    #[test]
    fn test_parse_cidr_bare_address() {
        assert_eq!(parse_cidr("192.168.1.1").unwrap().1, 32);
        assert_eq!(parse_cidr("::1").unwrap().1, 128);
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("invalid").is_err());
        assert!(parse_cidr("192.168.1.0/").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("fd00::/129").is_err());
        assert!(parse_cidr("999.999.999.999/24").is_err());
    }

    #[test]
    fn test_validate_tunnel_name() {
        assert!(validate_tunnel_name("home").is_ok());
        assert!(validate_tunnel_name("wg0").is_ok());
        assert!(validate_tunnel_name("my-vpn_2").is_ok());
        assert!(validate_tunnel_name("abcdefghijklmno").is_ok());
    }

    #[test]
    fn test_validate_tunnel_name_invalid() {
        assert!(validate_tunnel_name("").is_err());
        assert!(validate_tunnel_name("abcdefghijklmnop").is_err());
        assert!(validate_tunnel_name("wg0; rm -rf /").is_err());
        assert!(validate_tunnel_name("$(whoami)").is_err());
        assert!(validate_tunnel_name("../etc").is_err());
        assert!(validate_tunnel_name("wg 0").is_err());
    }

    #[test]
    fn test_validate_config_defaults() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_config_rejects_bad_values() {
        let mut config = Config::default();
        config.backend.config_dir = String::new();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.backend.userspace_implementation = "wireguard-go && reboot".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.monitor.poll_interval_ms = 10;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.bridge.bus = "starship".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_config_monitor_disabled() {
        let mut config = Config::default();
        config.monitor.poll_interval_ms = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[backend]\nprefer = \"kernel\"\nconfig_dir = \"/tmp/wg\"\n\n[monitor]\npoll_interval_ms = 250\npublish_stats = true\n\n[bridge]\nallow_hooks = true\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.bridge.allow_hooks);
        assert_eq!(config.backend.config_dir, "/tmp/wg");
        assert_eq!(config.monitor.poll_interval_ms, 250);
        assert!(config.monitor.publish_stats);
    }

    #[test]
    fn test_load_config_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.backend.userspace_implementation, "wireguard-go");
        assert!(!config.bridge.allow_hooks);
    }
}
