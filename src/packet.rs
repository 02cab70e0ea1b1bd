//! DHCP packet decoding and encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. When the Option Overload
//! option (52) is present, the `sname` and/or `file` header fields carry
//! additional options instead of text.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                sname (64) - options if overload 2/3           |
//! +---------------------------------------------------------------+
//! |                file (128) - options if overload 1/3           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 2132 §9.3: Option Overload

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode, OverloadFlag};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const DHCP_CHADDR_OFFSET: usize = 28;
const DHCP_CHADDR_SIZE: usize = 16;
const DHCP_SNAME_OFFSET: usize = DHCP_CHADDR_OFFSET + DHCP_CHADDR_SIZE;
const DHCP_SNAME_SIZE: usize = 64;
const DHCP_FILE_OFFSET: usize = DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE;
const DHCP_FILE_SIZE: usize = 128;
const DHCP_MAGIC_COOKIE_OFFSET: usize = DHCP_FILE_OFFSET + DHCP_FILE_SIZE;

/// Size of the fixed header portion including magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = DHCP_MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Smallest packet this codec will ever emit.
///
/// 300 bytes of BOOTP plus headroom for the cookie and a minimal option set.
pub const MINIMUM_PACKET_SIZE_FLOOR: usize = 312;

/// Default padding target: the datagram size every host must accept (RFC 791).
pub const DEFAULT_MINIMUM_PACKET_SIZE: usize = 576;

/// Maximum hop count before dropping the packet.
///
/// Prevents infinite relay loops. Per RFC 2131 §4.1, relay agents
/// increment hops and should discard packets with excessive counts.
const MAX_HOPS: u8 = 16;

/// Flags bit asking the server to broadcast its reply.
pub const BROADCAST_FLAG: u16 = 0x8000;

/// BOOTP/DHCP operation code for client requests.
pub const BOOTREQUEST: u8 = 1;

/// BOOTP/DHCP operation code for server replies.
pub const BOOTREPLY: u8 = 2;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// A decoded DHCP packet.
///
/// This struct represents both client requests and server replies.
/// Use [`decode`](Self::decode) for incoming datagrams and
/// [`reply_to`](Self::reply_to) to start a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    /// Operation code: [`BOOTREQUEST`] (1) or [`BOOTREPLY`] (2).
    pub op: u8,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Flags. Bit 15 ([`BROADCAST_FLAG`]) asks for a broadcast reply.
    pub flags: u16,

    /// Client IP address (set by client in BOUND/RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,

    /// Next server IP address.
    pub siaddr: Ipv4Addr,

    /// Relay agent IP address.
    pub giaddr: Ipv4Addr,

    /// Client hardware address, at most 16 bytes. Its length is `hlen`.
    pub chaddr: Vec<u8>,

    /// Server host name. Empty when the field carried overloaded options.
    pub sname: String,

    /// Boot file name. Empty when the field carried overloaded options.
    pub file: String,

    /// Options in wire order: main area, then sname, then file.
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Decodes a DHCP packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPacket`] if:
    /// - Packet is shorter than 240 bytes (fixed header + magic cookie)
    /// - A magic cookie byte is wrong (the message names the byte and offset)
    /// - Hop count exceeds 16 (relay loop protection)
    /// - Hardware length exceeds the 16-byte chaddr field
    /// - Options are malformed in the main area or in an overloaded field
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        for (index, expected) in DHCP_MAGIC_COOKIE.iter().enumerate() {
            let offset = DHCP_MAGIC_COOKIE_OFFSET + index;
            if data[offset] != *expected {
                return Err(Error::MalformedPacket(format!(
                    "Invalid magic cookie byte 0x{:02x} at offset {} (expected 0x{:02x})",
                    data[offset], offset, expected
                )));
            }
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2] as usize;
        let hops = data[3];

        if hops > MAX_HOPS {
            return Err(Error::MalformedPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        if hlen > DHCP_CHADDR_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Hardware address length {} exceeds {}",
                hlen, DHCP_CHADDR_SIZE
            )));
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let chaddr = data[DHCP_CHADDR_OFFSET..DHCP_CHADDR_OFFSET + hlen].to_vec();
        let sname_field = &data[DHCP_SNAME_OFFSET..DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE];
        let file_field = &data[DHCP_FILE_OFFSET..DHCP_FILE_OFFSET + DHCP_FILE_SIZE];
        let option_area = &data[DHCP_FIXED_HEADER_SIZE..];

        // The overload value decides how sname/file are read, so find it first.
        let overload = Self::find_overload(option_area, DHCP_FIXED_HEADER_SIZE)?;

        let mut options = Self::decode_options(option_area, DHCP_FIXED_HEADER_SIZE)?;
        let mut sname = String::new();
        let mut file = String::new();

        match overload {
            Some(flag) if flag.covers_sname() => {
                options.extend(Self::decode_options(sname_field, DHCP_SNAME_OFFSET)?);
            }
            _ => sname = read_zero_terminated(sname_field),
        }

        match overload {
            Some(flag) if flag.covers_file() => {
                options.extend(Self::decode_options(file_field, DHCP_FILE_OFFSET)?);
            }
            _ => file = read_zero_terminated(file_field),
        }

        Ok(Self {
            op,
            htype,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Scans an option area for the overload option only.
    ///
    /// Skips Pad and stops at End or at a length byte that runs past the
    /// area; the full pass reports those as errors.
    fn find_overload(data: &[u8], base_offset: usize) -> Result<Option<OverloadFlag>> {
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 || index + 1 >= data.len() {
                break;
            }

            let length = data[index + 1] as usize;
            let start = index + 2;
            if start + length > data.len() {
                break;
            }

            if code == OptionCode::OptionOverload as u8 {
                return match DhcpOption::decode(code, &data[start..start + length]) {
                    Ok(DhcpOption::OptionOverload(flag)) => Ok(Some(flag)),
                    Ok(_) => Ok(None),
                    Err(Error::MalformedPacket(message)) => Err(Error::MalformedPacket(format!(
                        "{} at offset {}",
                        message,
                        base_offset + index
                    ))),
                    Err(error) => Err(error),
                };
            }

            index = start + length;
        }

        Ok(None)
    }

    fn decode_options(data: &[u8], base_offset: usize) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::MalformedPacket(format!(
                    "Option {} at offset {} is missing its length byte",
                    code,
                    base_offset + index
                )));
            }

            let length = data[index + 1] as usize;
            let start = index + 2;

            if start + length > data.len() {
                return Err(Error::MalformedPacket(format!(
                    "Option {} at offset {} declares {} bytes but only {} remain",
                    code,
                    base_offset + index,
                    length,
                    data.len() - start
                )));
            }

            let option = DhcpOption::decode(code, &data[start..start + length]).map_err(
                |error| match error {
                    Error::MalformedPacket(message) => Error::MalformedPacket(format!(
                        "{} at offset {}",
                        message,
                        base_offset + index
                    )),
                    other => other,
                },
            )?;
            options.push(option);

            index = start + length;
        }

        Ok(options)
    }

    /// Encodes the packet for transmission.
    ///
    /// Options are written in list order followed by End, then the buffer is
    /// zero-padded to `minimum_size` (never below
    /// [`MINIMUM_PACKET_SIZE_FLOOR`]). `sname` and `file` are truncated to
    /// 63 and 127 bytes so a terminator always fits.
    pub fn encode(&self, minimum_size: usize) -> Vec<u8> {
        let minimum_size = minimum_size.max(MINIMUM_PACKET_SIZE_FLOOR);
        let mut packet = Vec::with_capacity(minimum_size.max(DEFAULT_MINIMUM_PACKET_SIZE));

        let hlen = self.chaddr.len().min(DHCP_CHADDR_SIZE);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(hlen as u8);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        write_fixed(&mut packet, &self.chaddr[..hlen], DHCP_CHADDR_SIZE);
        write_fixed(
            &mut packet,
            truncate(self.sname.as_bytes(), DHCP_SNAME_SIZE - 1),
            DHCP_SNAME_SIZE,
        );
        write_fixed(
            &mut packet,
            truncate(self.file.as_bytes(), DHCP_FILE_SIZE - 1),
            DHCP_FILE_SIZE,
        );

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            packet.extend_from_slice(&option.encode());
        }

        packet.push(OptionCode::End as u8);

        if packet.len() < minimum_size {
            packet.resize(minimum_size, 0);
        }

        packet
    }

    /// Returns the DHCP message type (Option 53) if present.
    ///
    /// Returns `None` for BOOTP packets which don't have this option.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Sets the message type, replacing an existing Option 53 in place or
    /// inserting one at the front.
    pub fn set_message_type(&mut self, message_type: MessageType) -> &mut Self {
        let existing = self
            .options
            .iter_mut()
            .find(|opt| matches!(opt, DhcpOption::MessageType(_)));

        match existing {
            Some(option) => *option = DhcpOption::MessageType(message_type),
            None => self
                .options
                .insert(0, DhcpOption::MessageType(message_type)),
        }
        self
    }

    /// Returns the requested IP address (Option 50) if present.
    ///
    /// Clients include this in REQUEST to confirm the offered IP, and in
    /// INIT-REBOOT to ask for their previous address back.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients include this in REQUEST to indicate which server's
    /// offer they are accepting.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the client identifier (Option 61) if present.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    /// Returns the client hostname (Option 12) if present.
    pub fn hostname(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Returns the parameter request list (Option 55) if present.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ParameterRequestList(params) => Some(params.as_slice()),
            _ => None,
        })
    }

    /// Returns the relay agent information (Option 82) if present.
    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RelayAgentInfo(info) => Some(info.as_slice()),
            _ => None,
        })
    }

    /// Returns true if the client listed `code` in its parameter request list.
    pub fn requests_option(&self, code: u8) -> bool {
        self.parameter_request_list()
            .is_some_and(|params| params.contains(&code))
    }

    /// Returns true if an option with `code` is already in the packet.
    pub fn has_option(&self, code: u8) -> bool {
        self.options.iter().any(|opt| opt.option_code() == code)
    }

    /// Formats the client hardware address as a colon-separated string.
    ///
    /// For Ethernet, returns format like "aa:bb:cc:dd:ee:ff".
    pub fn format_mac(&self) -> String {
        crate::lease::format_hex(&self.chaddr)
    }

    /// Returns true if the broadcast flag (bit 15) is set.
    pub fn is_broadcast(&self) -> bool {
        (self.flags & BROADCAST_FLAG) != 0
    }

    /// Starts a reply to `request`.
    ///
    /// Copies `htype`, `chaddr`, `xid`, `flags` and `giaddr`. Hops and secs
    /// are zero, all three address fields are 0.0.0.0, and the only option
    /// is the message type. Callers fill in `yiaddr` and options.
    pub fn reply_to(request: &DhcpPacket, message_type: MessageType) -> Self {
        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr.clone(),
            sname: String::new(),
            file: String::new(),
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }
}

fn read_zero_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&byte| byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn truncate(bytes: &[u8], max: usize) -> &[u8] {
    &bytes[..bytes.len().min(max)]
}

fn write_fixed(packet: &mut Vec<u8>, bytes: &[u8], width: usize) {
    packet.extend_from_slice(bytes);
    packet.resize(packet.len() + width - bytes.len(), 0);
}
