//! Client lease records and the in-memory lease table.
//!
//! A [`Lease`] tracks one client through `Released → Offered → Bound →
//! Expired`. The [`LeaseTable`] owns every record, keyed by [`ClientId`],
//! and raises a mutation flag on every add, remove or in-place change so the
//! server can turn each change into a persistence save.
//!
//! The table does no locking of its own: the server keeps it behind a single
//! `tokio::sync::Mutex` shared by the receive loop and the expiry sweep.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::packet::DhcpPacket;

/// Formats bytes as colon-separated lowercase hex ("aa:bb:cc").
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses hex written as "aa:bb:cc", "aa-bb-cc", "aa bb cc" or "aabbcc".
///
/// Returns `None` on an odd digit count or a non-hex character.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|byte| !matches!(byte, b':' | b'-' | b' '))
        .collect();

    if !digits.len().is_multiple_of(2) {
        return None;
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_hex(&text).ok_or_else(|| D::Error::custom(format!("invalid hex: {}", text)))
    }
}

/// Client identity used as the lease table key.
///
/// The payload of Option 61 when the client sends one, otherwise the raw
/// hardware address. Equality, ordering and hashing work on the bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(#[serde(with = "hex_bytes")] Vec<u8>);

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_packet(packet: &DhcpPacket) -> Self {
        match packet.client_identifier() {
            Some(id) => Self(id.to_vec()),
            None => Self(packet.chaddr.clone()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex(&self.0))
    }
}

/// Where a client is in its lease lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// The client gave its address back (or never got one).
    Released,
    /// An OFFER went out and the server is waiting for REQUEST.
    Offered,
    /// The client holds the address.
    Bound,
    /// The lease ran out; the record lingers for a grace window.
    Expired,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "released"),
            Self::Offered => write!(f, "offered"),
            Self::Bound => write!(f, "bound"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// How long a lease stays in its current state, in whole seconds.
///
/// `u32::MAX` seconds is the infinite sentinel, matching the DHCP lease time
/// option's "infinity" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDuration(u32);

impl StateDuration {
    pub const INFINITE: Self = Self(u32::MAX);

    /// Builds a duration, saturating to [`INFINITE`](Self::INFINITE).
    pub fn from_secs(secs: u64) -> Self {
        Self(u32::try_from(secs).unwrap_or(u32::MAX))
    }

    pub fn from_days(days: u64) -> Self {
        Self::from_secs(days.saturating_mul(86_400))
    }

    pub fn as_secs(self) -> u32 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self == Self::INFINITE
    }

    /// Start plus this duration, or `None` for "never".
    pub fn end_from(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_infinite() {
            return None;
        }
        start.checked_add_signed(TimeDelta::seconds(i64::from(self.0)))
    }
}

/// One client's lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Table key; see [`ClientId`].
    pub client_id: ClientId,

    /// Client hardware address (hex-encoded on disk).
    #[serde(with = "hex_bytes")]
    pub hardware_address: Vec<u8>,

    /// Client-provided hostname (Option 12), empty if none.
    #[serde(default)]
    pub hostname: String,

    /// Address held by this client; 0.0.0.0 when none.
    pub ip_address: Ipv4Addr,

    pub state: LeaseState,

    /// When the current state was entered (UTC).
    pub state_started: DateTime<Utc>,

    pub state_duration: StateDuration,
}

impl Lease {
    /// Creates a Released record with no address.
    pub fn new(client_id: ClientId, hardware_address: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            client_id,
            hardware_address,
            hostname: String::new(),
            ip_address: Ipv4Addr::UNSPECIFIED,
            state: LeaseState::Released,
            state_started: now,
            state_duration: StateDuration::INFINITE,
        }
    }

    /// Moves to `state`, stamping `now` as the state start.
    pub fn enter(&mut self, state: LeaseState, now: DateTime<Utc>, duration: StateDuration) {
        self.state = state;
        self.state_started = now;
        self.state_duration = duration;
    }

    /// When the current state ends, or `None` if it never does.
    pub fn state_end(&self) -> Option<DateTime<Utc>> {
        self.state_duration.end_from(self.state_started)
    }

    /// True once `now` is strictly past the state end.
    pub fn state_ended(&self, now: DateTime<Utc>) -> bool {
        self.state_end().is_some_and(|end| now > end)
    }

    /// Time spent in the current state so far.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.state_started)
    }

    pub fn has_address(&self) -> bool {
        !self.ip_address.is_unspecified()
    }
}

/// Mapping from [`ClientId`] to [`Lease`].
///
/// Ordered by client id so scans are deterministic. Every structural or
/// in-place change sets the mutation flag; [`take_mutated`](Self::take_mutated)
/// reads and clears it.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: BTreeMap<ClientId, Lease>,
    mutated: bool,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from loaded records without raising the mutation flag.
    ///
    /// A later record with the same client id replaces an earlier one.
    pub fn from_leases(leases: impl IntoIterator<Item = Lease>) -> Self {
        Self {
            leases: leases
                .into_iter()
                .map(|lease| (lease.client_id.clone(), lease))
                .collect(),
            mutated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&Lease> {
        self.leases.get(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.leases.contains_key(client_id)
    }

    /// Mutable access to one record. Counts as a mutation when found.
    pub fn get_mut(&mut self, client_id: &ClientId) -> Option<&mut Lease> {
        let lease = self.leases.get_mut(client_id);
        if lease.is_some() {
            self.mutated = true;
        }
        lease
    }

    /// Adds or replaces the record for `lease.client_id`.
    pub fn insert(&mut self, lease: Lease) -> Option<Lease> {
        self.mutated = true;
        self.leases.insert(lease.client_id.clone(), lease)
    }

    pub fn remove(&mut self, client_id: &ClientId) -> Option<Lease> {
        let removed = self.leases.remove(client_id);
        if removed.is_some() {
            self.mutated = true;
        }
        removed
    }

    /// Keeps only the records for which `keep` returns true.
    ///
    /// Returns the number of removed records.
    pub fn retain(&mut self, mut keep: impl FnMut(&Lease) -> bool) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| keep(lease));
        let removed = before - self.leases.len();
        if removed > 0 {
            self.mutated = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.leases.is_empty() {
            self.mutated = true;
        }
        self.leases.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    /// Copies every record for persistence.
    pub fn snapshot(&self) -> Vec<Lease> {
        self.leases.values().cloned().collect()
    }

    /// Returns whether the table changed since the last call, and resets.
    pub fn take_mutated(&mut self) -> bool {
        std::mem::take(&mut self.mutated)
    }
}
