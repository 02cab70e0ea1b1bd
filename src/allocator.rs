//! Address selection for DISCOVER and the free-address predicate.
//!
//! The allocator works directly on the [`LeaseTable`] it is handed; the
//! caller holds the table lock for the whole evaluation. Checking an address
//! can mutate the table: a Released or long-Expired record loses its address
//! when that address goes to another client.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::AddressPool;
use crate::lease::{ClientId, Lease, LeaseState, LeaseTable};

/// How long an Expired record keeps its address before it can go to
/// someone else.
const EXPIRED_GRACE_SECONDS: i64 = 60;

/// Picks addresses from a pool for one message evaluation.
pub struct Allocator<'a> {
    pool: &'a AddressPool,
    declined: &'a BTreeSet<Ipv4Addr>,
    now: DateTime<Utc>,
}

impl<'a> Allocator<'a> {
    /// `declined` holds addresses clients reported as already in use.
    pub fn new(pool: &'a AddressPool, declined: &'a BTreeSet<Ipv4Addr>, now: DateTime<Utc>) -> Self {
        Self {
            pool,
            declined,
            now,
        }
    }

    /// Returns true if `ip` may be handed to `client`.
    ///
    /// The address must be in the server's subnet, must not be the server's
    /// own address, and must not have been declined. Every record already
    /// holding it must give it up, which a record does when it:
    /// - belongs to `client` and is not Offered, or
    /// - has been Expired for more than a minute, or
    /// - is Released and `reclaim_released` is set.
    ///
    /// When the address is free, holders belonging to other clients have
    /// their address reset to 0.0.0.0.
    pub fn is_free(
        &self,
        table: &mut LeaseTable,
        ip: Ipv4Addr,
        reclaim_released: bool,
        client: Option<&ClientId>,
    ) -> bool {
        if ip.is_unspecified()
            || !self.pool.in_subnet(ip)
            || ip == self.pool.server_address
            || self.declined.contains(&ip)
        {
            return false;
        }

        let holders: Vec<&Lease> = table.iter().filter(|lease| lease.ip_address == ip).collect();
        if !holders
            .iter()
            .all(|holder| self.gives_up(holder, reclaim_released, client))
        {
            return false;
        }

        let displaced: Vec<ClientId> = holders
            .iter()
            .filter(|holder| Some(&holder.client_id) != client)
            .map(|holder| holder.client_id.clone())
            .collect();
        for holder_id in &displaced {
            if let Some(lease) = table.get_mut(holder_id) {
                lease.ip_address = Ipv4Addr::UNSPECIFIED;
            }
        }

        true
    }

    fn gives_up(&self, holder: &Lease, reclaim_released: bool, client: Option<&ClientId>) -> bool {
        match holder.state {
            _ if Some(&holder.client_id) == client => holder.state != LeaseState::Offered,
            LeaseState::Expired => {
                holder.time_in_state(self.now) > TimeDelta::seconds(EXPIRED_GRACE_SECONDS)
            }
            LeaseState::Released => reclaim_released,
            LeaseState::Offered | LeaseState::Bound => false,
        }
    }

    /// Chooses an address for `client`, in order of preference:
    ///
    /// 1. the client's own recorded address, unless it is only Offered
    /// 2. `requested`, if it is inside the pool and free for this client
    /// 3. the first pool address free without reclaiming Released records
    /// 4. the first pool address free when Released records may be reclaimed
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn allocate(
        &self,
        table: &mut LeaseTable,
        client: &ClientId,
        requested: Option<Ipv4Addr>,
    ) -> Option<Ipv4Addr> {
        if let Some(lease) = table.get(client)
            && lease.state != LeaseState::Offered
            && lease.has_address()
        {
            let ip = lease.ip_address;
            if self.is_free(table, ip, true, Some(client)) {
                return Some(ip);
            }
        }

        if let Some(ip) = requested
            && self.pool.contains(ip)
            && self.is_free(table, ip, true, Some(client))
        {
            return Some(ip);
        }

        for reclaim_released in [false, true] {
            if let Some(ip) = self
                .pool
                .addresses()
                .find(|&ip| self.is_free(table, ip, reclaim_released, None))
            {
                return Some(ip);
            }
        }

        None
    }
}
