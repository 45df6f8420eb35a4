// wg-quick configuration text parser

//! Parsing of backend-native tunnel configuration
//!
//! Tunnels are started from the same INI-style text `wg-quick` reads:
//! one `[Interface]` section followed by any number of `[Peer]` sections.
//! Parsing rejects unknown keys and malformed values up front so a bad
//! config never reaches a backend.

use crate::config::parse_cidr;
use std::net::IpAddr;
use thiserror::Error;
use wireguard_control::Key;

/// Malformed configuration text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ConfigParseError {
    /// 1-based line number (0 for whole-file problems)
    pub line: usize,
    /// What was wrong
    pub message: String,
}

impl ConfigParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// `[Interface]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSection {
    /// Base64 private key
    pub private_key: String,
    /// Interface addresses
    pub addresses: Vec<(IpAddr, u8)>,
    /// UDP listen port
    pub listen_port: Option<u16>,
    /// DNS servers / search domains (applied by wg-quick only)
    pub dns: Vec<String>,
    /// Interface MTU
    pub mtu: Option<u16>,
    /// Firewall mark
    pub fwmark: Option<u32>,
    /// wg-quick routing table setting
    pub table: Option<String>,
    /// PreUp/PostUp/PreDown/PostDown hooks (wg-quick only)
    pub hooks: Vec<(String, String)>,
    /// wg-quick SaveConfig flag
    pub save_config: bool,
}

/// `[Peer]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSection {
    /// Base64 public key
    pub public_key: String,
    /// Base64 preshared key
    pub preshared_key: Option<String>,
    /// Allowed source/destination ranges
    pub allowed_ips: Vec<(IpAddr, u8)>,
    /// `host:port`, resolved when applied
    pub endpoint: Option<String>,
    /// Keepalive interval in seconds
    pub persistent_keepalive: Option<u16>,
}

/// A parsed tunnel configuration, keeping the original text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    /// Interface settings
    pub interface: InterfaceSection,
    /// Peers in file order
    pub peers: Vec<PeerSection>,
    text: String,
}

impl WgConfig {
    /// Parse wg-quick configuration text
    pub fn parse(text: &str) -> Result<Self, ConfigParseError> {
        parse(text)
    }

    /// Original configuration text
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parse wg-quick configuration text
pub fn parse(text: &str) -> Result<WgConfig, ConfigParseError> {
    let mut section = Section::None;
    let mut interface: Option<InterfaceSection> = None;
    let mut peers: Vec<PeerSection> = Vec::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            section = match name.to_ascii_lowercase().as_str() {
                "interface" => {
                    if interface.is_some() {
                        return Err(ConfigParseError::new(line_no, "duplicate [Interface] section"));
                    }
                    interface = Some(InterfaceSection::default());
                    Section::Interface
                }
                "peer" => {
                    peers.push(PeerSection::default());
                    Section::Peer
                }
                _ => {
                    return Err(ConfigParseError::new(
                        line_no,
                        format!("unknown section [{}]", name),
                    ))
                }
            };
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| ConfigParseError::new(line_no, "expected key = value"))?;

        match section {
            Section::None => {
                return Err(ConfigParseError::new(
                    line_no,
                    format!("{} outside of a section", key),
                ))
            }
            Section::Interface => {
                // Present by construction of Section::Interface
                if let Some(iface) = interface.as_mut() {
                    parse_interface_key(iface, key, value, line_no)?;
                }
            }
            Section::Peer => {
                if let Some(peer) = peers.last_mut() {
                    parse_peer_key(peer, key, value, line_no)?;
                }
            }
        }
    }

    let interface =
        interface.ok_or_else(|| ConfigParseError::new(0, "missing [Interface] section"))?;
    if interface.private_key.is_empty() {
        return Err(ConfigParseError::new(0, "[Interface] has no PrivateKey"));
    }
    for (i, peer) in peers.iter().enumerate() {
        if peer.public_key.is_empty() {
            return Err(ConfigParseError::new(
                0,
                format!("[Peer] #{} has no PublicKey", i + 1),
            ));
        }
    }

    Ok(WgConfig {
        interface,
        peers,
        text: text.to_string(),
    })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_interface_key(
    iface: &mut InterfaceSection,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigParseError> {
    match key.to_ascii_lowercase().as_str() {
        "privatekey" => iface.private_key = parse_key(value, line)?,
        "address" => {
            for item in split_list(value) {
                iface.addresses.push(parse_range(item, line)?);
            }
        }
        "listenport" => iface.listen_port = Some(parse_number(value, "ListenPort", line)?),
        "dns" => iface.dns.extend(split_list(value).map(str::to_string)),
        "mtu" => iface.mtu = Some(parse_number(value, "MTU", line)?),
        "fwmark" => {
            iface.fwmark = if value.eq_ignore_ascii_case("off") {
                None
            } else if let Some(hex) = value.strip_prefix("0x") {
                Some(
                    u32::from_str_radix(hex, 16)
                        .map_err(|_| ConfigParseError::new(line, "invalid FwMark"))?,
                )
            } else {
                Some(parse_number(value, "FwMark", line)?)
            }
        }
        "table" => iface.table = Some(value.to_string()),
        "preup" | "postup" | "predown" | "postdown" => {
            iface.hooks.push((key.to_string(), value.to_string()))
        }
        "saveconfig" => iface.save_config = parse_bool(value, line)?,
        _ => {
            return Err(ConfigParseError::new(
                line,
                format!("unknown [Interface] key {}", key),
            ))
        }
    }
    Ok(())
}

fn parse_peer_key(
    peer: &mut PeerSection,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigParseError> {
    match key.to_ascii_lowercase().as_str() {
        "publickey" => peer.public_key = parse_key(value, line)?,
        "presharedkey" => peer.preshared_key = Some(parse_key(value, line)?),
        "allowedips" => {
            for item in split_list(value) {
                peer.allowed_ips.push(parse_range(item, line)?);
            }
        }
        "endpoint" => peer.endpoint = Some(parse_endpoint(value, line)?),
        "persistentkeepalive" => {
            peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_number(value, "PersistentKeepalive", line)?)
            }
        }
        _ => {
            return Err(ConfigParseError::new(
                line,
                format!("unknown [Peer] key {}", key),
            ))
        }
    }
    Ok(())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_key(value: &str, line: usize) -> Result<String, ConfigParseError> {
    Key::from_base64(value)
        .map(|_| value.to_string())
        .map_err(|_| ConfigParseError::new(line, "invalid key (expected 32 bytes, base64)"))
}

fn parse_range(value: &str, line: usize) -> Result<(IpAddr, u8), ConfigParseError> {
    parse_cidr(value)
        .map_err(|e| ConfigParseError::new(line, format!("invalid address {}: {:#}", value, e)))
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    field: &str,
    line: usize,
) -> Result<T, ConfigParseError> {
    value
        .parse()
        .map_err(|_| ConfigParseError::new(line, format!("invalid {}: {}", field, value)))
}

fn parse_bool(value: &str, line: usize) -> Result<bool, ConfigParseError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigParseError::new(line, format!("invalid boolean: {}", value))),
    }
}

/// Accepts `host:port` and `[v6]:port`; the host is resolved later.
fn parse_endpoint(value: &str, line: usize) -> Result<String, ConfigParseError> {
    let err = || ConfigParseError::new(line, format!("invalid Endpoint: {}", value));

    let (host, port) = value.rsplit_once(':').ok_or_else(err)?;
    port.parse::<u16>().map_err(|_| err())?;

    let host = host.trim();
    if host.is_empty() {
        return Err(err());
    }
    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(err)?;
        inner.parse::<std::net::Ipv6Addr>().map_err(|_| err())?;
    } else if host.contains(':') {
        // Bare IPv6 must be bracketed
        return Err(err());
    }

    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUBLIC_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    fn sample() -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = 10.0.0.2/32, fd00::2/128\n\
             ListenPort = 51820\n\
             DNS = 1.1.1.1\n\
             MTU = 1420\n\
             \n\
             # home router\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 10.0.0.0/24, 192.168.1.0/24\n\
             Endpoint = vpn.example.com:51820\n\
             PersistentKeepalive = 25\n",
            PRIVATE_KEY, PUBLIC_KEY
        )
    }

    #[test]
    fn test_parse_full_config() {
        let text = sample();
        let config = parse(&text).unwrap();

        assert_eq!(config.interface.private_key, PRIVATE_KEY);
        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.dns, vec!["1.1.1.1".to_string()]);
        assert_eq!(config.interface.mtu, Some(1420));

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.public_key, PUBLIC_KEY);
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.endpoint.as_deref(), Some("vpn.example.com:51820"));
        assert_eq!(peer.persistent_keepalive, Some(25));

        assert_eq!(config.text(), text);
    }

    #[test]
    fn test_parse_multiple_peers() {
        let text = format!(
            "[Interface]\nPrivateKey = {k}\n[Peer]\nPublicKey = {p}\n[Peer]\nPublicKey = {p}\nEndpoint = [fd00::1]:51820\n",
            k = PRIVATE_KEY,
            p = PUBLIC_KEY
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].endpoint.as_deref(), Some("[fd00::1]:51820"));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let text = format!("[interface]\nprivatekey = {}\n", PRIVATE_KEY);
        assert!(parse(&text).is_ok());
    }

    #[test]
    fn test_missing_interface() {
        let err = parse(&format!("[Peer]\nPublicKey = {}\n", PUBLIC_KEY)).unwrap_err();
        assert!(err.message.contains("missing [Interface]"));
    }

    #[test]
    fn test_missing_private_key() {
        let err = parse("[Interface]\nListenPort = 51820\n").unwrap_err();
        assert!(err.message.contains("PrivateKey"));
    }

    #[test]
    fn test_peer_without_public_key() {
        let text = format!("[Interface]\nPrivateKey = {}\n[Peer]\nAllowedIPs = 0.0.0.0/0\n", PRIVATE_KEY);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_invalid_values_report_line() {
        let text = format!("[Interface]\nPrivateKey = {}\nListenPort = seventy\n", PRIVATE_KEY);
        let err = parse(&text).unwrap_err();
        assert_eq!(err.line, 3);

        let err = parse("[Interface]\nPrivateKey = not-a-key\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unknown_keys_and_sections() {
        let text = format!("[Interface]\nPrivateKey = {}\nColour = blue\n", PRIVATE_KEY);
        assert!(parse(&text).is_err());

        let text = format!("[Interface]\nPrivateKey = {}\n[Tunnel]\n", PRIVATE_KEY);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_duplicate_interface() {
        let text = format!("[Interface]\nPrivateKey = {k}\n[Interface]\nPrivateKey = {k}\n", k = PRIVATE_KEY);
        assert!(parse(&text).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse("this is not a wireguard config").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(parse_endpoint("1.2.3.4:51820", 1).is_ok());
        assert!(parse_endpoint("[::1]:51820", 1).is_ok());
        assert!(parse_endpoint("host.example:51820", 1).is_ok());
        assert!(parse_endpoint("1.2.3.4", 1).is_err());
        assert!(parse_endpoint("::1:51820", 1).is_err());
        assert!(parse_endpoint(":51820", 1).is_err());
        assert!(parse_endpoint("1.2.3.4:99999", 1).is_err());
    }

    #[test]
    fn test_keepalive_off_and_fwmark() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\nFwMark = 0xca6c\n[Peer]\nPublicKey = {}\nPersistentKeepalive = off\n",
            PRIVATE_KEY, PUBLIC_KEY
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.interface.fwmark, Some(0xca6c));
        assert_eq!(config.peers[0].persistent_keepalive, None);
    }

    #[test]
    fn test_hooks_and_save_config() {
        let text = format!(
            "[Interface]\nPrivateKey = {}\nPostUp = echo up\nSaveConfig = true\n",
            PRIVATE_KEY
        );
        let config = parse(&text).unwrap();
        assert_eq!(config.interface.hooks, vec![("PostUp".to_string(), "echo up".to_string())]);
        assert!(config.interface.save_config);
    }
}
