use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::lease::{StateDuration, format_hex, parse_hex};
use crate::options::DhcpOption;
use crate::packet::{DEFAULT_MINIMUM_PACKET_SIZE, MINIMUM_PACKET_SIZE_FLOOR};

/// Standard DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;

/// Standard DHCP client port.
pub const DHCP_CLIENT_PORT: u16 = 68;

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_server_port() -> u16 {
    DHCP_SERVER_PORT
}

fn default_client_port() -> u16 {
    DHCP_CLIENT_PORT
}

fn default_offer_expiration_seconds() -> u32 {
    30
}

fn default_lease_duration_seconds() -> u32 {
    86_400
}

fn default_minimum_packet_size() -> usize {
    DEFAULT_MINIMUM_PACKET_SIZE
}

fn default_leases_file() -> String {
    "leases.json".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(flatten)]
    pub pool: AddressPool,
    #[serde(default)]
    pub extra_options: Vec<ExtraOption>,
    #[serde(default = "default_leases_file")]
    pub leases_file: String,
}

/// The address range this server hands out and the timings it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressPool {
    /// This server's own address; also sent as the server identifier.
    pub server_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    #[serde(default = "default_offer_expiration_seconds")]
    pub offer_expiration_seconds: u32,
    #[serde(default = "default_lease_duration_seconds")]
    pub lease_duration_seconds: u32,
    #[serde(default = "default_minimum_packet_size")]
    pub minimum_packet_size: usize,
}

/// An option the operator wants in replies.
///
/// `data` is the option payload as hex. `force` sends it in every OFFER and
/// ACK; otherwise it goes out only when the client lists `code` in its
/// parameter request list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraOption {
    pub code: u8,
    pub data: String,
    #[serde(default)]
    pub force: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            server_port: DHCP_SERVER_PORT,
            client_port: DHCP_CLIENT_PORT,
            pool: AddressPool::default(),
            extra_options: vec![
                ExtraOption::new(&DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)]), true),
                ExtraOption::new(
                    &DhcpOption::DnsServer(vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]),
                    false,
                ),
            ],
            leases_file: default_leases_file(),
        }
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            server_address: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            offer_expiration_seconds: default_offer_expiration_seconds(),
            lease_duration_seconds: default_lease_duration_seconds(),
            minimum_packet_size: DEFAULT_MINIMUM_PACKET_SIZE,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        for extra in &self.extra_options {
            extra.decode()?;
        }

        Ok(())
    }

    /// Decodes every extra option through the codec registry.
    pub fn decoded_extra_options(&self) -> Result<Vec<(DhcpOption, bool)>> {
        self.extra_options
            .iter()
            .map(|extra| Ok((extra.decode()?, extra.force)))
            .collect()
    }
}

impl AddressPool {
    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start > end {
            return Err(Error::InvalidConfig(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        if self.contains(self.server_address) {
            return Err(Error::InvalidConfig(
                "server_address must not be within the pool range".to_string(),
            ));
        }

        if !self.in_subnet(self.pool_start) || !self.in_subnet(self.pool_end) {
            return Err(Error::InvalidConfig(format!(
                "pool {} - {} is outside the subnet of {}/{}",
                self.pool_start, self.pool_end, self.server_address, self.subnet_mask
            )));
        }

        if self.offer_expiration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_expiration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// True if `ip` lies within pool_start..=pool_end.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.pool_start) && addr <= u32::from(self.pool_end)
    }

    /// True if `ip` shares the server's network prefix.
    pub fn in_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.server_address) & mask
    }

    /// Pool addresses in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.pool_start)..=u32::from(self.pool_end)).map(Ipv4Addr::from)
    }

    pub fn size(&self) -> u32 {
        u32::from(self.pool_end)
            .saturating_sub(u32::from(self.pool_start))
            .saturating_add(1)
    }

    pub fn offer_expiration(&self) -> StateDuration {
        StateDuration::from_secs(u64::from(self.offer_expiration_seconds))
    }

    pub fn lease_duration(&self) -> StateDuration {
        StateDuration::from_secs(u64::from(self.lease_duration_seconds))
    }

    /// Padding target for outgoing packets, never below 312 bytes.
    pub fn minimum_packet_size(&self) -> usize {
        self.minimum_packet_size.max(MINIMUM_PACKET_SIZE_FLOOR)
    }
}

impl ExtraOption {
    /// Captures `option`'s payload as hex.
    pub fn new(option: &DhcpOption, force: bool) -> Self {
        let encoded = option.encode();
        Self {
            code: encoded[0],
            data: format_hex(encoded.get(2..).unwrap_or_default()),
            force,
        }
    }

    pub fn decode(&self) -> Result<DhcpOption> {
        let payload = parse_hex(&self.data).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "extra option {} has invalid hex data {:?}",
                self.code, self.data
            ))
        })?;

        if payload.len() > 255 {
            return Err(Error::InvalidConfig(format!(
                "extra option {} is longer than 255 bytes",
                self.code
            )));
        }

        DhcpOption::decode(self.code, &payload).map_err(|error| {
            Error::InvalidConfig(format!("extra option {}: {}", self.code, error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> AddressPool {
        AddressPool {
            server_address: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(10, 0, 0, 10),
            pool_end: Ipv4Addr::new(10, 0, 0, 20),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_start_greater_than_end() {
        let pool = AddressPool {
            pool_start: Ipv4Addr::new(10, 0, 0, 20),
            pool_end: Ipv4Addr::new(10, 0, 0, 10),
            ..pool()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_server_address_in_pool() {
        let pool = AddressPool {
            server_address: Ipv4Addr::new(10, 0, 0, 15),
            ..pool()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_pool_outside_subnet() {
        let pool = AddressPool {
            pool_end: Ipv4Addr::new(10, 0, 1, 20),
            ..pool()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        assert!(AddressPool { offer_expiration_seconds: 0, ..pool() }.validate().is_err());
        assert!(AddressPool { lease_duration_seconds: 0, ..pool() }.validate().is_err());
    }

    #[test]
    fn test_contains_and_subnet() {
        let pool = pool();
        assert!(pool.contains(Ipv4Addr::new(10, 0, 0, 15)));
        assert!(!pool.contains(Ipv4Addr::new(10, 0, 0, 9)));
        assert!(!pool.contains(Ipv4Addr::new(10, 0, 0, 21)));
        assert!(pool.in_subnet(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!pool.in_subnet(Ipv4Addr::new(192, 168, 5, 5)));
        assert_eq!(pool.size(), 11);
        assert_eq!(pool.addresses().count(), 11);
    }

    #[test]
    fn test_minimum_packet_size_floor() {
        assert_eq!(pool().minimum_packet_size(), 576);
        let small = AddressPool {
            minimum_packet_size: 100,
            ..pool()
        };
        assert_eq!(small.minimum_packet_size(), 312);
    }

    #[test]
    fn test_extra_option_decodes_through_registry() {
        let extra = ExtraOption {
            code: 6,
            data: "08 08 08 08".to_string(),
            force: false,
        };
        assert_eq!(
            extra.decode().unwrap(),
            DhcpOption::DnsServer(vec![Ipv4Addr::new(8, 8, 8, 8)])
        );

        let bad_length = ExtraOption {
            code: 1,
            data: "ff:ff".to_string(),
            force: true,
        };
        assert!(matches!(bad_length.decode(), Err(Error::InvalidConfig(_))));

        let bad_hex = ExtraOption {
            code: 15,
            data: "xyz".to_string(),
            force: true,
        };
        assert!(bad_hex.decode().is_err());
    }

    #[test]
    fn test_extra_option_new_roundtrips() {
        let option = DhcpOption::DomainName("lan".to_string());
        let extra = ExtraOption::new(&option, true);
        assert_eq!(extra.code, 15);
        assert_eq!(extra.data, "6c:61:6e");
        assert_eq!(extra.decode().unwrap(), option);
    }

    #[test]
    fn test_config_json_defaults() {
        let json = r#"{
            "server_address": "10.0.0.1",
            "subnet_mask": "255.255.255.0",
            "pool_start": "10.0.0.10",
            "pool_end": "10.0.0.20"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.server_port, 67);
        assert_eq!(config.client_port, 68);
        assert_eq!(config.pool.offer_expiration_seconds, 30);
        assert_eq!(config.pool.lease_duration_seconds, 86_400);
        assert_eq!(config.pool.minimum_packet_size, 576);
        assert!(config.extra_options.is_empty());
        assert_eq!(config.leases_file, "leases.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }
}
