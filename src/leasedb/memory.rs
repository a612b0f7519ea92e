//! In-memory lease store backed by concurrent hash maps.
//!
//! The hot-path operations (point lookups, inserts, updates) touch a
//! single shard of a `DashMap`; the collection queries iterate and sort,
//! which is acceptable for the table sizes a single server holds.

use std::net::{Ipv4Addr, Ipv6Addr};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{check_max, LeaseStore, LEASE_SCHEMA_VERSION};
use crate::{
    ClientId, Duid, Error, HwAddr, Lease4, Lease6, Lease6Type, LeaseState, Result, SchemaVersion,
    SubnetId,
};

pub struct MemoryLeaseStore {
    v4: DashMap<Ipv4Addr, Lease4>,
    v6: DashMap<(Ipv6Addr, Lease6Type), Lease6>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            v4: DashMap::new(),
            v6: DashMap::new(),
        }
    }

    fn collect4<F: Fn(&Lease4) -> bool>(&self, pred: F) -> Vec<Lease4> {
        let mut leases: Vec<Lease4> = self
            .v4
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by_key(|l| l.addr);
        leases
    }

    fn collect6<F: Fn(&Lease6) -> bool>(&self, pred: F) -> Vec<Lease6> {
        let mut leases: Vec<Lease6> = self
            .v6
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        leases.sort_by_key(|l| (l.addr, l.ty.as_u8()));
        leases
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn add_lease4(&self, lease: Lease4) -> Result<bool> {
        lease.validate()?;
        match self.v4.entry(lease.addr) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state != LeaseState::ExpiredReclaimed {
                    return Ok(false);
                }
                occupied.insert(lease);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    fn lease4_by_addr(&self, addr: Ipv4Addr) -> Result<Option<Lease4>> {
        Ok(self.v4.get(&addr).map(|entry| entry.value().clone()))
    }

    fn leases4_by_hwaddr(&self, hw: &HwAddr) -> Result<Vec<Lease4>> {
        Ok(self.collect4(|l| l.hwaddr.as_ref() == Some(hw)))
    }

    fn lease4_by_hwaddr_in(&self, hw: &HwAddr, subnet_id: SubnetId) -> Result<Option<Lease4>> {
        Ok(self
            .collect4(|l| l.subnet_id == subnet_id && l.hwaddr.as_ref() == Some(hw))
            .into_iter()
            .next())
    }

    fn leases4_by_client_id(&self, id: &ClientId) -> Result<Vec<Lease4>> {
        Ok(self.collect4(|l| l.client_id.as_ref() == Some(id)))
    }

    fn lease4_by_client_id_in(
        &self,
        id: &ClientId,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease4>> {
        Ok(self
            .collect4(|l| l.subnet_id == subnet_id && l.client_id.as_ref() == Some(id))
            .into_iter()
            .next())
    }

    fn leases4_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease4>> {
        Ok(self.collect4(|l| l.subnet_id == subnet_id))
    }

    fn expired4(&self, now: i64, max: usize) -> Result<Vec<Lease4>> {
        check_max(max)?;
        let mut expired =
            self.collect4(|l| l.state != LeaseState::ExpiredReclaimed && l.is_expired(now));
        expired.sort_by_key(Lease4::expires_at);
        expired.truncate(max);
        Ok(expired)
    }

    fn modified4_since(&self, since: i64) -> Result<Vec<Lease4>> {
        let mut modified = self.collect4(|l| l.cltt > since);
        modified.sort_by_key(|l| l.cltt);
        Ok(modified)
    }

    fn update_lease4(&self, lease: &Lease4) -> Result<()> {
        lease.validate()?;
        match self.v4.get_mut(&lease.addr) {
            Some(mut entry) => {
                *entry = lease.clone();
                Ok(())
            }
            None => Err(Error::NoSuchLease(lease.addr.to_string())),
        }
    }

    fn delete_lease4(&self, addr: Ipv4Addr) -> Result<bool> {
        Ok(self.v4.remove(&addr).is_some())
    }

    fn purge_reclaimed4(&self, before: i64) -> Result<u64> {
        let before_len = self.v4.len();
        self.v4
            .retain(|_, l| l.state != LeaseState::ExpiredReclaimed || l.expires_at() >= before);
        Ok(before_len.saturating_sub(self.v4.len()) as u64)
    }

    fn add_lease6(&self, lease: Lease6) -> Result<bool> {
        lease.validate()?;
        match self.v6.entry((lease.addr, lease.ty)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state != LeaseState::ExpiredReclaimed {
                    return Ok(false);
                }
                occupied.insert(lease);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    fn lease6_by_addr(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<Option<Lease6>> {
        Ok(self.v6.get(&(addr, ty)).map(|entry| entry.value().clone()))
    }

    fn leases6_by_duid_iaid(&self, duid: &Duid, iaid: u32) -> Result<Vec<Lease6>> {
        Ok(self.collect6(|l| l.iaid == iaid && &l.duid == duid))
    }

    fn lease6_by_duid_iaid_in(
        &self,
        duid: &Duid,
        iaid: u32,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease6>> {
        Ok(self
            .collect6(|l| l.subnet_id == subnet_id && l.iaid == iaid && &l.duid == duid)
            .into_iter()
            .next())
    }

    fn leases6_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease6>> {
        Ok(self.collect6(|l| l.subnet_id == subnet_id))
    }

    fn expired6(&self, now: i64, max: usize) -> Result<Vec<Lease6>> {
        check_max(max)?;
        let mut expired =
            self.collect6(|l| l.state != LeaseState::ExpiredReclaimed && l.is_expired(now));
        expired.sort_by_key(Lease6::expires_at);
        expired.truncate(max);
        Ok(expired)
    }

    fn modified6_since(&self, since: i64) -> Result<Vec<Lease6>> {
        let mut modified = self.collect6(|l| l.cltt > since);
        modified.sort_by_key(|l| l.cltt);
        Ok(modified)
    }

    fn update_lease6(&self, lease: &Lease6) -> Result<()> {
        lease.validate()?;
        match self.v6.get_mut(&(lease.addr, lease.ty)) {
            Some(mut entry) => {
                *entry = lease.clone();
                Ok(())
            }
            None => Err(Error::NoSuchLease(format!("{}/{:?}", lease.addr, lease.ty))),
        }
    }

    fn delete_lease6(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<bool> {
        Ok(self.v6.remove(&(addr, ty)).is_some())
    }

    fn purge_reclaimed6(&self, before: i64) -> Result<u64> {
        let before_len = self.v6.len();
        self.v6
            .retain(|_, l| l.state != LeaseState::ExpiredReclaimed || l.expires_at() >= before);
        Ok(before_len.saturating_sub(self.v6.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "in-memory lease database, lost on restart"
    }

    fn schema_version(&self) -> Result<SchemaVersion> {
        Ok(LEASE_SCHEMA_VERSION)
    }
}
