//! DHCP options as defined in RFC 2132.
//!
//! Each option travels as `[code][length][payload]`, except Pad (0) and
//! End (255) which are a single byte. Decoding goes through a static codec
//! table keyed by option code: the table entry knows the option's name, its
//! length rule and how to turn a payload into a [`DhcpOption`]. Codes with
//! no table entry decode to [`DhcpOption::Generic`] and are re-encoded byte
//! for byte.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Maximum number of IP addresses in Router (3) or DNS Server (6) options.
///
/// Options have a 1-byte length field, so maximum data is 255 bytes.
/// With 4 bytes per IPv4 address, that's 63 addresses maximum.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Largest payload a single option can carry.
const MAX_OPTION_PAYLOAD: usize = 255;

/// DHCP option codes with a dedicated codec.
///
/// Codes not listed here are handled via [`DhcpOption::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Used for alignment.
    Pad = 0,
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// DNS server addresses (RFC 2132 §3.8).
    DnsServer = 6,
    /// Client hostname (RFC 2132 §3.14).
    Hostname = 12,
    /// Domain name for DNS resolution (RFC 2132 §3.17).
    DomainName = 15,
    /// Interface MTU (RFC 2132 §5.1).
    InterfaceMtu = 26,
    /// Broadcast address (RFC 2132 §5.3).
    BroadcastAddress = 28,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// Option overload - sname/file fields contain options (RFC 2132 §9.3).
    OptionOverload = 52,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Error or diagnostic text, sent with NAK (RFC 2132 §9.9).
    Message = 56,
    /// Maximum DHCP message size the client accepts (RFC 2132 §9.10).
    MaxMessageSize = 57,
    /// Renewal time T1 (RFC 2132 §9.11).
    RenewalTime = 58,
    /// Rebinding time T2 (RFC 2132 §9.12).
    RebindingTime = 59,
    /// Vendor class identifier (RFC 2132 §9.13).
    VendorClassIdentifier = 60,
    /// Client identifier (RFC 2132 §9.14).
    ClientIdentifier = 61,
    /// TFTP server name (RFC 2132 §9.4).
    TftpServerName = 66,
    /// Boot file name (RFC 2132 §9.5).
    BootFileName = 67,
    /// Client fully qualified domain name (RFC 4702).
    ClientFqdn = 81,
    /// Relay agent information (RFC 3046).
    RelayAgentInfo = 82,
    /// End of options marker.
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        CODECS
            .iter()
            .find(|codec| codec.code as u8 == value)
            .map(|codec| codec.code)
            .ok_or(value)
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Option overload flags (Option 52) as defined in RFC 2132 §9.3.
///
/// Indicates that the `sname` and/or `file` fields in the DHCP packet
/// header contain DHCP options instead of their normal content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    /// The `file` field contains options.
    File = 1,
    /// The `sname` field contains options.
    Sname = 2,
    /// Both `file` and `sname` fields contain options.
    Both = 3,
}

impl OverloadFlag {
    pub fn covers_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }

    pub fn covers_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A decoded DHCP option.
///
/// One variant per code in the codec table, plus [`Generic`](Self::Generic)
/// for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Single padding byte (Option 0).
    Pad,
    /// End of an option stream (Option 255).
    End,
    /// Subnet mask (Option 1).
    SubnetMask(Ipv4Addr),
    /// Router/gateway addresses (Option 3). First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    /// DNS server addresses (Option 6).
    DnsServer(Vec<Ipv4Addr>),
    /// Client hostname (Option 12).
    Hostname(String),
    /// Domain name for client DNS resolution (Option 15).
    DomainName(String),
    /// Interface MTU (Option 26).
    InterfaceMtu(u16),
    /// Broadcast address (Option 28).
    BroadcastAddress(Ipv4Addr),
    /// Client's requested IP address (Option 50).
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds (Option 51). `u32::MAX` means infinite.
    LeaseTime(u32),
    /// Indicates sname/file fields contain options (Option 52).
    OptionOverload(OverloadFlag),
    /// DHCP message type (Option 53).
    MessageType(MessageType),
    /// Server identifier - IP of the DHCP server (Option 54).
    ServerIdentifier(Ipv4Addr),
    /// List of option codes the client wants (Option 55).
    ParameterRequestList(Vec<u8>),
    /// Human readable explanation, mostly for NAK (Option 56).
    Message(String),
    /// Largest message the client is willing to accept (Option 57).
    MaxMessageSize(u16),
    /// Renewal time T1 in seconds (Option 58).
    RenewalTime(u32),
    /// Rebinding time T2 in seconds (Option 59).
    RebindingTime(u32),
    /// Vendor class identifier (Option 60).
    VendorClassIdentifier(Vec<u8>),
    /// Client identifier for unique identification (Option 61).
    ClientIdentifier(Vec<u8>),
    /// TFTP server name (Option 66).
    TftpServerName(String),
    /// Boot file name (Option 67).
    BootFileName(String),
    /// Client FQDN, kept as raw flags + name bytes (Option 81).
    ClientFqdn(Vec<u8>),
    /// Relay agent information (Option 82, RFC 3046).
    RelayAgentInfo(Vec<u8>),
    /// Any other option, kept as raw code and payload.
    Generic(u8, Vec<u8>),
}

/// Payload length rule enforced before a codec's decode function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// Payload must be exactly this many bytes.
    Exact(usize),
    /// Payload must be a non-empty multiple of this many bytes.
    NonEmptyMultipleOf(usize),
    /// Any payload length is accepted.
    Any,
}

impl LengthRule {
    fn accepts(self, len: usize) -> bool {
        match self {
            Self::Exact(expected) => len == expected,
            Self::NonEmptyMultipleOf(unit) => len > 0 && len.is_multiple_of(unit),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for LengthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(expected) => write!(f, "exactly {}", expected),
            Self::NonEmptyMultipleOf(unit) => write!(f, "a non-empty multiple of {}", unit),
            Self::Any => write!(f, "any length"),
        }
    }
}

/// Registry entry: how one option code is decoded.
///
/// Encoding needs no table lookup since every variant already knows its
/// code and payload; see [`DhcpOption::encode`].
pub struct Codec {
    pub code: OptionCode,
    pub name: &'static str,
    pub length: LengthRule,
    decode: fn(&[u8]) -> Result<DhcpOption>,
}

impl Codec {
    fn decode(&self, data: &[u8]) -> Result<DhcpOption> {
        if !self.length.accepts(data.len()) {
            return Err(Error::MalformedPacket(format!(
                "Invalid {} length {} (expected {})",
                self.name,
                data.len(),
                self.length
            )));
        }
        (self.decode)(data)
    }
}

fn read_address(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(data[0], data[1], data[2], data[3])
}

fn read_addresses(data: &[u8]) -> Vec<Ipv4Addr> {
    data.chunks_exact(4).map(read_address).collect()
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

/// Reads text up to the first NUL; some clients zero-terminate option strings.
fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|&byte| byte == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

static CODECS: &[Codec] = &[
    Codec {
        code: OptionCode::Pad,
        name: "pad",
        length: LengthRule::Exact(0),
        decode: |_| Ok(DhcpOption::Pad),
    },
    Codec {
        code: OptionCode::SubnetMask,
        name: "subnet mask",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::SubnetMask(read_address(data))),
    },
    Codec {
        code: OptionCode::Router,
        name: "router",
        length: LengthRule::NonEmptyMultipleOf(4),
        decode: |data| Ok(DhcpOption::Router(read_addresses(data))),
    },
    Codec {
        code: OptionCode::DnsServer,
        name: "DNS server",
        length: LengthRule::NonEmptyMultipleOf(4),
        decode: |data| Ok(DhcpOption::DnsServer(read_addresses(data))),
    },
    Codec {
        code: OptionCode::Hostname,
        name: "hostname",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::Hostname(read_string(data))),
    },
    Codec {
        code: OptionCode::DomainName,
        name: "domain name",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::DomainName(read_string(data))),
    },
    Codec {
        code: OptionCode::InterfaceMtu,
        name: "interface MTU",
        length: LengthRule::Exact(2),
        decode: |data| Ok(DhcpOption::InterfaceMtu(read_u16(data))),
    },
    Codec {
        code: OptionCode::BroadcastAddress,
        name: "broadcast address",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::BroadcastAddress(read_address(data))),
    },
    Codec {
        code: OptionCode::RequestedIpAddress,
        name: "requested IP address",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::RequestedIpAddress(read_address(data))),
    },
    Codec {
        code: OptionCode::LeaseTime,
        name: "lease time",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::LeaseTime(read_u32(data))),
    },
    Codec {
        code: OptionCode::OptionOverload,
        name: "option overload",
        length: LengthRule::Exact(1),
        decode: |data| {
            OverloadFlag::try_from(data[0])
                .map(DhcpOption::OptionOverload)
                .map_err(|value| {
                    Error::MalformedPacket(format!("Invalid option overload value: {}", value))
                })
        },
    },
    Codec {
        code: OptionCode::MessageType,
        name: "message type",
        length: LengthRule::Exact(1),
        decode: |data| {
            MessageType::try_from(data[0])
                .map(DhcpOption::MessageType)
                .map_err(|value| {
                    Error::MalformedPacket(format!("Unknown message type: {}", value))
                })
        },
    },
    Codec {
        code: OptionCode::ServerIdentifier,
        name: "server identifier",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::ServerIdentifier(read_address(data))),
    },
    Codec {
        code: OptionCode::ParameterRequestList,
        name: "parameter request list",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::ParameterRequestList(data.to_vec())),
    },
    Codec {
        code: OptionCode::Message,
        name: "message",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::Message(read_string(data))),
    },
    Codec {
        code: OptionCode::MaxMessageSize,
        name: "maximum message size",
        length: LengthRule::Exact(2),
        decode: |data| Ok(DhcpOption::MaxMessageSize(read_u16(data))),
    },
    Codec {
        code: OptionCode::RenewalTime,
        name: "renewal time",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::RenewalTime(read_u32(data))),
    },
    Codec {
        code: OptionCode::RebindingTime,
        name: "rebinding time",
        length: LengthRule::Exact(4),
        decode: |data| Ok(DhcpOption::RebindingTime(read_u32(data))),
    },
    Codec {
        code: OptionCode::VendorClassIdentifier,
        name: "vendor class identifier",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::VendorClassIdentifier(data.to_vec())),
    },
    Codec {
        code: OptionCode::ClientIdentifier,
        name: "client identifier",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::ClientIdentifier(data.to_vec())),
    },
    Codec {
        code: OptionCode::TftpServerName,
        name: "TFTP server name",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::TftpServerName(read_string(data))),
    },
    Codec {
        code: OptionCode::BootFileName,
        name: "boot file name",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::BootFileName(read_string(data))),
    },
    Codec {
        code: OptionCode::ClientFqdn,
        name: "client FQDN",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::ClientFqdn(data.to_vec())),
    },
    Codec {
        code: OptionCode::RelayAgentInfo,
        name: "relay agent information",
        length: LengthRule::Any,
        decode: |data| Ok(DhcpOption::RelayAgentInfo(data.to_vec())),
    },
    Codec {
        code: OptionCode::End,
        name: "end",
        length: LengthRule::Exact(0),
        decode: |_| Ok(DhcpOption::End),
    },
];

/// Looks up the registry entry for an option code.
///
/// Returns `None` for codes that decode as [`DhcpOption::Generic`].
pub fn codec(code: u8) -> Option<&'static Codec> {
    CODECS.iter().find(|codec| codec.code as u8 == code)
}

impl DhcpOption {
    /// Decodes an option from its code and payload (the bytes after the
    /// length byte).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if the payload violates the code's
    /// length rule (e.g. server identifier must be exactly 4 bytes) or holds
    /// an out-of-range enumerated value.
    pub fn decode(code: u8, data: &[u8]) -> Result<Self> {
        match codec(code) {
            Some(codec) => codec.decode(data),
            None => Ok(Self::Generic(code, data.to_vec())),
        }
    }

    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::Pad => OptionCode::Pad,
            Self::End => OptionCode::End,
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::TftpServerName(_) => OptionCode::TftpServerName,
            Self::BootFileName(_) => OptionCode::BootFileName,
            Self::ClientFqdn(_) => OptionCode::ClientFqdn,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo,
            Self::Generic(code, _) => return *code,
        };
        code as u8
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::Pad | Self::End => Vec::new(),
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DnsServer(addrs) => addrs
                .iter()
                .take(MAX_ADDRESSES_PER_OPTION)
                .flat_map(|addr| addr.octets())
                .collect(),
            Self::Hostname(text)
            | Self::DomainName(text)
            | Self::Message(text)
            | Self::TftpServerName(text)
            | Self::BootFileName(text) => text.as_bytes().to_vec(),
            Self::InterfaceMtu(value) | Self::MaxMessageSize(value) => value.to_be_bytes().to_vec(),
            Self::LeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                secs.to_be_bytes().to_vec()
            }
            Self::OptionOverload(flag) => vec![*flag as u8],
            Self::MessageType(message_type) => vec![*message_type as u8],
            Self::ParameterRequestList(data)
            | Self::VendorClassIdentifier(data)
            | Self::ClientIdentifier(data)
            | Self::ClientFqdn(data)
            | Self::RelayAgentInfo(data)
            | Self::Generic(_, data) => data.clone(),
        }
    }

    /// Encodes the option to its wire format.
    ///
    /// Pad and End are a single code byte. Everything else is
    /// `[code][length][payload]`, with the payload cut at 255 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        if matches!(self, Self::Pad | Self::End) {
            return vec![code];
        }

        let payload = self.payload();
        let len = payload.len().min(MAX_OPTION_PAYLOAD);
        let mut result = Vec::with_capacity(len + 2);
        result.push(code);
        result.push(len as u8);
        result.extend_from_slice(&payload[..len]);
        result
    }
}
