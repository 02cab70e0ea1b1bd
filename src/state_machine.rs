//! Per-message lease transitions and the periodic expiry sweep.
//!
//! Everything here is synchronous and works on a [`ServerState`] the caller
//! has already locked. A handler returns the reply to send, if any, together
//! with its destination; the caller sends it after releasing the lock.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::allocator::Allocator;
use crate::config::{AddressPool, Config};
use crate::error::Result;
use crate::lease::{ClientId, Lease, LeaseState, LeaseTable, StateDuration};
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{BROADCAST_FLAG, DhcpPacket};

/// Grace window an expired binding keeps before the sweep drops it.
const EXPIRED_GRACE_DAYS: u64 = 1;

/// Mutable state shared by the receive loop and the sweep.
#[derive(Debug, Default)]
pub struct ServerState {
    pub table: LeaseTable,
    /// Addresses reported in use by a DECLINE. Kept until restart.
    pub declined: BTreeSet<Ipv4Addr>,
}

impl ServerState {
    pub fn new(table: LeaseTable) -> Self {
        Self {
            table,
            declined: BTreeSet::new(),
        }
    }
}

/// Read-only settings the transitions need.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub pool: AddressPool,
    /// Decoded extra options with their force flag.
    pub extra_options: Vec<(DhcpOption, bool)>,
    pub server_port: u16,
    pub client_port: u16,
}

impl ServerContext {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            pool: config.pool.clone(),
            extra_options: config.decoded_extra_options()?,
            server_port: config.server_port,
            client_port: config.client_port,
        })
    }
}

/// A reply and where to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub packet: DhcpPacket,
    pub destination: SocketAddrV4,
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: usize,
    pub expired: usize,
}

/// Runs one inbound BOOTREQUEST through the state machine.
pub fn handle_packet(
    state: &mut ServerState,
    context: &ServerContext,
    request: &DhcpPacket,
    now: DateTime<Utc>,
) -> Option<Outgoing> {
    let Some(message_type) = request.message_type() else {
        debug!("Ignoring BOOTP request from {}", request.format_mac());
        return None;
    };

    match message_type {
        MessageType::Discover => handle_discover(state, context, request, now),
        MessageType::Request => handle_request(state, context, request, now),
        MessageType::Release => {
            handle_release(state, request, now);
            None
        }
        MessageType::Decline => {
            handle_decline(state, context, request);
            None
        }
        MessageType::Inform => Some(handle_inform(context, request)),
        other => {
            debug!("Ignoring {} from {}", other, request.format_mac());
            None
        }
    }
}

fn handle_discover(
    state: &mut ServerState,
    context: &ServerContext,
    request: &DhcpPacket,
    now: DateTime<Utc>,
) -> Option<Outgoing> {
    let mac = request.format_mac();
    let client_id = ClientId::from_packet(request);

    let outstanding = state
        .table
        .get(&client_id)
        .filter(|lease| lease.state == LeaseState::Offered && lease.has_address())
        .map(|lease| lease.ip_address);

    let offered_ip = match outstanding {
        Some(ip) => ip,
        None => {
            let allocator = Allocator::new(&context.pool, &state.declined, now);
            match allocator.allocate(&mut state.table, &client_id, request.requested_ip()) {
                Some(ip) => ip,
                None => {
                    warn!("Pool exhausted, cannot offer an address to {}", mac);
                    return None;
                }
            }
        }
    };

    let mut lease = state
        .table
        .remove(&client_id)
        .unwrap_or_else(|| Lease::new(client_id.clone(), request.chaddr.clone(), now));
    lease.hardware_address = request.chaddr.clone();
    if let Some(hostname) = request.hostname() {
        lease.hostname = hostname.to_string();
    }
    lease.ip_address = offered_ip;
    lease.enter(LeaseState::Offered, now, context.pool.offer_expiration());
    state.table.insert(lease);

    let mut offer = DhcpPacket::reply_to(request, MessageType::Offer);
    offer.yiaddr = offered_ip;
    push_lease_options(&mut offer, &context.pool);
    push_subnet_mask(&mut offer, request, &context.pool);
    append_extra_options(&mut offer, request, &context.extra_options);
    echo_relay_agent_info(&mut offer, request);

    info!("OFFER {} to {}", offered_ip, mac);

    Some(Outgoing {
        destination: route(request, context),
        packet: offer,
    })
}

fn handle_request(
    state: &mut ServerState,
    context: &ServerContext,
    request: &DhcpPacket,
    now: DateTime<Utc>,
) -> Option<Outgoing> {
    let mac = request.format_mac();
    let client_id = ClientId::from_packet(request);

    let Some(lease) = state.table.get(&client_id) else {
        debug!("REQUEST from unknown client {}, ignoring", mac);
        return None;
    };
    let held_ip = lease.ip_address;
    let held_state = lease.state;

    if let Some(server_id) = request.server_identifier() {
        if server_id != context.pool.server_address {
            state.table.remove(&client_id);
            info!("{} selected server {}, dropping its record", mac, server_id);
            return None;
        }
        if held_state != LeaseState::Offered {
            return Some(nak(request, context, "No offer is outstanding for this client"));
        }
        if request.requested_ip() != Some(held_ip) {
            return Some(nak(
                request,
                context,
                "Requested address does not match the offer",
            ));
        }
        bind(&mut state.table, &client_id, request, &context.pool, now);
        return Some(ack(request, context, held_ip));
    }

    if let Some(requested_ip) = request.requested_ip() {
        let rebootable = matches!(held_state, LeaseState::Bound | LeaseState::Expired);
        if rebootable && requested_ip == held_ip && context.pool.in_subnet(requested_ip) {
            bind(&mut state.table, &client_id, request, &context.pool, now);
            return Some(ack(request, context, held_ip));
        }
        state.table.remove(&client_id);
        return Some(nak(request, context, "Requested address is not valid"));
    }

    if !request.ciaddr.is_unspecified() {
        if held_state == LeaseState::Bound && request.ciaddr == held_ip {
            bind(&mut state.table, &client_id, request, &context.pool, now);
            return Some(ack(request, context, held_ip));
        }

        let allocator = Allocator::new(&context.pool, &state.declined, now);
        if allocator.is_free(&mut state.table, held_ip, false, Some(&client_id)) {
            bind(&mut state.table, &client_id, request, &context.pool, now);
            return Some(ack(request, context, held_ip));
        }

        debug!(
            "REQUEST from {} for {} cannot be honoured, staying silent",
            mac, request.ciaddr
        );
        return None;
    }

    debug!("REQUEST from {} carries no address, ignoring", mac);
    None
}

fn handle_release(state: &mut ServerState, request: &DhcpPacket, now: DateTime<Utc>) {
    let mac = request.format_mac();
    let client_id = ClientId::from_packet(request);

    let Some(lease) = state.table.get_mut(&client_id) else {
        debug!("RELEASE from unknown client {}, ignoring", mac);
        return;
    };

    if request.ciaddr != lease.ip_address {
        lease.ip_address = Ipv4Addr::UNSPECIFIED;
    }
    let duration = lease.state_duration;
    lease.enter(LeaseState::Released, now, duration);

    info!("RELEASE from {} for {}", mac, request.ciaddr);
}

/// Unknown clients are heard only when the DECLINE names this server.
fn handle_decline(state: &mut ServerState, context: &ServerContext, request: &DhcpPacket) {
    let mac = request.format_mac();
    let client_id = ClientId::from_packet(request);

    let held_ip = match state.table.remove(&client_id) {
        Some(lease) => lease.ip_address,
        None if request.server_identifier() == Some(context.pool.server_address) => {
            Ipv4Addr::UNSPECIFIED
        }
        None => {
            debug!("DECLINE from unknown client {} for another server, ignoring", mac);
            return;
        }
    };

    let declined_ip = request
        .requested_ip()
        .or(Some(request.ciaddr).filter(|ip| !ip.is_unspecified()))
        .unwrap_or(held_ip);

    if declined_ip.is_unspecified() {
        warn!("DECLINE from {} names no address", mac);
        return;
    }

    state.declined.insert(declined_ip);
    warn!(
        "DECLINE from {} for {}, address withheld until restart",
        mac, declined_ip
    );
}

fn handle_inform(context: &ServerContext, request: &DhcpPacket) -> Outgoing {
    let mut reply = DhcpPacket::reply_to(request, MessageType::Ack);
    reply.ciaddr = request.ciaddr;
    reply
        .options
        .push(DhcpOption::ServerIdentifier(context.pool.server_address));
    push_subnet_mask(&mut reply, request, &context.pool);
    append_extra_options(&mut reply, request, &context.extra_options);
    echo_relay_agent_info(&mut reply, request);

    let destination = if request.ciaddr.is_unspecified() {
        route(request, context)
    } else {
        SocketAddrV4::new(request.ciaddr, context.client_port)
    };

    info!("INFORM reply to {} at {}", request.format_mac(), destination);

    Outgoing {
        packet: reply,
        destination,
    }
}

fn bind(
    table: &mut LeaseTable,
    client_id: &ClientId,
    request: &DhcpPacket,
    pool: &AddressPool,
    now: DateTime<Utc>,
) {
    if let Some(lease) = table.get_mut(client_id) {
        if let Some(hostname) = request.hostname() {
            lease.hostname = hostname.to_string();
        }
        lease.enter(LeaseState::Bound, now, pool.lease_duration());
    }
}

fn ack(request: &DhcpPacket, context: &ServerContext, ip: Ipv4Addr) -> Outgoing {
    let mut reply = DhcpPacket::reply_to(request, MessageType::Ack);
    reply.ciaddr = request.ciaddr;
    reply.yiaddr = ip;
    push_lease_options(&mut reply, &context.pool);
    push_subnet_mask(&mut reply, request, &context.pool);
    append_extra_options(&mut reply, request, &context.extra_options);
    echo_relay_agent_info(&mut reply, request);

    info!(
        "ACK {} to {} (lease: {} seconds)",
        ip,
        request.format_mac(),
        context.pool.lease_duration_seconds
    );

    Outgoing {
        destination: route(request, context),
        packet: reply,
    }
}

/// A NAK goes to the relay agent with the broadcast bit set, or to the
/// limited broadcast address.
fn nak(request: &DhcpPacket, context: &ServerContext, reason: &str) -> Outgoing {
    let mut reply = DhcpPacket::reply_to(request, MessageType::Nak);
    reply
        .options
        .push(DhcpOption::ServerIdentifier(context.pool.server_address));
    reply.options.push(DhcpOption::Message(reason.to_string()));
    echo_relay_agent_info(&mut reply, request);

    let destination = if request.giaddr.is_unspecified() {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, context.client_port)
    } else {
        reply.flags |= BROADCAST_FLAG;
        SocketAddrV4::new(request.giaddr, context.server_port)
    };

    info!("NAK to {}: {}", request.format_mac(), reason);

    Outgoing {
        packet: reply,
        destination,
    }
}

fn route(request: &DhcpPacket, context: &ServerContext) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, context.server_port)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, context.client_port)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, context.client_port)
    }
}

/// Lease time and server identifier, then T1 (50%) and T2 (87.5%) for
/// finite leases.
fn push_lease_options(reply: &mut DhcpPacket, pool: &AddressPool) {
    let lease_duration = pool.lease_duration();
    reply
        .options
        .push(DhcpOption::LeaseTime(lease_duration.as_secs()));
    reply
        .options
        .push(DhcpOption::ServerIdentifier(pool.server_address));

    if !lease_duration.is_infinite() {
        let seconds = u64::from(lease_duration.as_secs());
        reply.options.push(DhcpOption::RenewalTime((seconds / 2) as u32));
        reply
            .options
            .push(DhcpOption::RebindingTime((seconds * 7 / 8) as u32));
    }
}

fn push_subnet_mask(reply: &mut DhcpPacket, request: &DhcpPacket, pool: &AddressPool) {
    if request.requests_option(OptionCode::SubnetMask as u8) {
        reply.options.push(DhcpOption::SubnetMask(pool.subnet_mask));
    }
}

/// Relayed requests get their relay agent information back (RFC 3046).
fn echo_relay_agent_info(reply: &mut DhcpPacket, request: &DhcpPacket) {
    if request.giaddr.is_unspecified() {
        return;
    }
    if let Some(info) = request.relay_agent_info() {
        reply.options.push(DhcpOption::RelayAgentInfo(info.to_vec()));
    }
}

/// Adds each configured option that is forced or that the client asked for,
/// unless the reply already carries that code.
pub fn append_extra_options(
    reply: &mut DhcpPacket,
    request: &DhcpPacket,
    extra_options: &[(DhcpOption, bool)],
) {
    for (option, force) in extra_options {
        let code = option.option_code();
        if (*force || request.requests_option(code)) && !reply.has_option(code) {
            reply.options.push(option.clone());
        }
    }
}

/// Applies the time-based transitions.
///
/// Stale offers and expired records past their grace window are removed.
/// Bindings whose lease has ended become Expired for one day.
pub fn sweep(table: &mut LeaseTable, pool: &AddressPool, now: DateTime<Utc>) -> SweepOutcome {
    let offer_expiration = TimeDelta::seconds(i64::from(pool.offer_expiration_seconds));

    let removed = table.retain(|lease| match lease.state {
        LeaseState::Offered => lease.time_in_state(now) <= offer_expiration,
        LeaseState::Expired => !lease.state_ended(now),
        LeaseState::Bound | LeaseState::Released => true,
    });

    let ended: Vec<ClientId> = table
        .iter()
        .filter(|lease| lease.state == LeaseState::Bound && lease.state_ended(now))
        .map(|lease| lease.client_id.clone())
        .collect();

    for client_id in &ended {
        if let Some(lease) = table.get_mut(client_id) {
            lease.enter(
                LeaseState::Expired,
                now,
                StateDuration::from_days(EXPIRED_GRACE_DAYS),
            );
            info!("Lease {} for {} expired", lease.ip_address, client_id);
        }
    }

    SweepOutcome {
        removed,
        expired: ended.len(),
    }
}
