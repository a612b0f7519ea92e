//! Allocation, renewal, decline and release.
//!
//! The engine reads one immutable configuration snapshot per request,
//! prefers renewing what the client already holds, honors host
//! reservations, and otherwise probes pool addresses picked by the
//! subnet's configured strategy. Commit relies on the store's primary-key
//! uniqueness: a lost insert race simply moves on to the next candidate.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use super::picker;
use super::{ClientContext4, ClientContext6, EngineConfig};
use crate::configdb::{PdPool, Pool4, Pool6, Subnet4, Subnet6};
use crate::leasedb::LeaseStore;
use crate::reservations::{Reservation, ReservationDb};
use crate::snapshot::{ConfigSnapshot, SnapshotHandle};
use crate::{Error, Lease4, Lease6, Lease6Type, LeaseState, Result, SubnetId};

const MAX_DB_BACKOFF_MS: u64 = 1_000;

pub struct AllocEngine {
    store: Arc<dyn LeaseStore>,
    reservations: Arc<ReservationDb>,
    snapshots: Arc<SnapshotHandle>,
    config: EngineConfig,
    cursors4: DashMap<SubnetId, Arc<AtomicU64>>,
    cursors6: DashMap<SubnetId, Arc<AtomicU64>>,
    cursors_pd: DashMap<SubnetId, Arc<AtomicU64>>,
    subnet_locks: DashMap<SubnetId, Arc<Mutex<()>>>,
}

impl AllocEngine {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        reservations: Arc<ReservationDb>,
        snapshots: Arc<SnapshotHandle>,
        config: EngineConfig,
    ) -> Self {
        AllocEngine {
            store,
            reservations,
            snapshots,
            config,
            cursors4: DashMap::new(),
            cursors6: DashMap::new(),
            cursors_pd: DashMap::new(),
            subnet_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Retries transient store failures with capped exponential backoff,
    /// within the request deadline and the configured budget.
    fn retry_db<T>(&self, deadline: Instant, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut failures: u32 = 0;
        loop {
            match op() {
                Err(err)
                    if err.is_transient()
                        && failures < self.config.db_retry_budget
                        && Instant::now() < deadline =>
                {
                    failures += 1;
                    let backoff_ms = std::cmp::min(
                        10_u64.saturating_mul(2_u64.saturating_pow(failures)),
                        MAX_DB_BACKOFF_MS,
                    );
                    warn!(%err, failures, backoff_ms, "transient lease store failure, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
                }
                other => return other,
            }
        }
    }

    fn cursor(map: &DashMap<SubnetId, Arc<AtomicU64>>, subnet_id: SubnetId) -> Arc<AtomicU64> {
        map.entry(subnet_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn subnet_lock(&self, subnet_id: SubnetId) -> Arc<Mutex<()>> {
        self.subnet_locks
            .entry(subnet_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn class_allows(class: &Option<compact_str::CompactString>, ctx_classes: &std::collections::HashSet<compact_str::CompactString>) -> bool {
        class.as_ref().map_or(true, |c| ctx_classes.contains(c))
    }

    // ---- IPv4 -----------------------------------------------------------

    /// Produces a lease for the request, renewing an existing binding when
    /// one is still valid. Fails with `NoAddressAvailable` when the retry
    /// budget, the pools, or the deadline run out.
    #[instrument(skip(self, ctx), fields(subnet = %ctx.subnet_id))]
    pub fn allocate4(&self, ctx: &ClientContext4) -> Result<Lease4> {
        let snapshot = self.snapshots.load();
        let candidates = snapshot.candidate_subnets4(ctx.subnet_id);
        if candidates.is_empty() {
            return Err(Error::BadValue(format!(
                "subnet {} is not configured",
                ctx.subnet_id
            )));
        }

        for subnet in candidates {
            if Instant::now() >= ctx.deadline {
                debug!("request deadline passed");
                break;
            }
            if !Self::class_allows(&subnet.client_class, &ctx.classes) {
                continue;
            }

            // renew what the client already holds in this subnet
            if let Some(lease) = self.try_renew4(&snapshot, subnet, ctx)? {
                return Ok(lease);
            }

            if let Some(lease) = self.allocate_in_subnet4(&snapshot, subnet, ctx)? {
                return Ok(lease);
            }
        }
        Err(Error::NoAddressAvailable(ctx.subnet_id))
    }

    fn existing4(&self, subnet_id: SubnetId, ctx: &ClientContext4) -> Result<Option<Lease4>> {
        if let Some(client_id) = &ctx.client_id {
            let found = self.retry_db(ctx.deadline, || {
                self.store.lease4_by_client_id_in(client_id, subnet_id)
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        if let Some(hwaddr) = &ctx.hwaddr {
            return self.retry_db(ctx.deadline, || {
                self.store.lease4_by_hwaddr_in(hwaddr, subnet_id)
            });
        }
        Ok(None)
    }

    fn reservation_for4(&self, subnet_id: SubnetId, ctx: &ClientContext4) -> Option<Arc<Reservation>> {
        if let Some(client_id) = &ctx.client_id {
            if let Some(res) = self.reservations.by_client_id(subnet_id, client_id) {
                return Some(res);
            }
        }
        ctx.hwaddr
            .as_ref()
            .and_then(|hw| self.reservations.by_hwaddr(subnet_id, hw))
    }

    fn reservation_is_for_client4(&self, reservation: &Reservation, ctx: &ClientContext4) -> bool {
        let by_id = match (&reservation.client_id, &ctx.client_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        let by_hw = match (&reservation.hwaddr, &ctx.hwaddr) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        by_id || by_hw
    }

    fn try_renew4(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet4,
        ctx: &ClientContext4,
    ) -> Result<Option<Lease4>> {
        let Some(mut lease) = self.existing4(subnet.id, ctx)? else {
            return Ok(None);
        };
        if lease.state != LeaseState::Default || lease.is_expired(ctx.now) {
            return Ok(None);
        }
        // the address must still be deliverable: inside an active pool,
        // or pinned by this client's reservation
        let still_valid = subnet.in_pool(lease.addr)
            || lease.fixed
            || self
                .reservation_for4(subnet.id, ctx)
                .is_some_and(|r| r.ipv4 == Some(lease.addr));
        if !still_valid {
            debug!(addr = %lease.addr, "held address no longer deliverable, reallocating");
            return Ok(None);
        }
        if let Some(holder) = self.reservations.holder_of4(lease.addr) {
            if !self.reservation_is_for_client4(&holder, ctx) {
                debug!(addr = %lease.addr, "held address now reserved for another client");
                return Ok(None);
            }
        }

        let (valid_lft, t1, t2) = snapshot.timers4(subnet);
        lease.renew(ctx.now, valid_lft, t1, t2);
        if let Some(hostname) = &ctx.hostname {
            lease.set_hostname(hostname);
        }
        self.retry_db(ctx.deadline, || self.store.update_lease4(&lease))?;
        info!(addr = %lease.addr, "lease renewed");
        Ok(Some(lease))
    }

    fn allocate_in_subnet4(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet4,
        ctx: &ClientContext4,
    ) -> Result<Option<Lease4>> {
        let lock = self.subnet_lock(subnet.id);
        let _guard = self
            .config
            .threading
            .enabled()
            .then(|| lock.lock().expect("subnet lock poisoned"));

        // host reservation first
        if let Some(reservation) = self.reservation_for4(subnet.id, ctx) {
            if let Some(addr) = reservation.ipv4 {
                match self.try_claim4(snapshot, subnet, ctx, addr, true)? {
                    Some(lease) => return Ok(Some(lease)),
                    None => {
                        // the reserved address is squatted by someone else;
                        // hand out dynamic space and let the operator see it
                        warn!(%addr, "reserved address is in use by another client");
                    }
                }
            }
        }

        // explicit requested address, when it is ours to give
        if let Some(requested) = ctx.requested {
            if subnet.in_pool(requested)
                && self
                    .reservations
                    .holder_of4(requested)
                    .map_or(true, |r| self.reservation_is_for_client4(&r, ctx))
            {
                if let Some(lease) = self.try_claim4(snapshot, subnet, ctx, requested, false)? {
                    return Ok(Some(lease));
                }
            }
        }

        let pools: Vec<&Pool4> = subnet
            .pools
            .iter()
            .filter(|pool| Self::class_allows(&pool.client_class, &ctx.classes))
            .collect();
        if pools.is_empty() {
            return Ok(None);
        }
        let cursor = Self::cursor(&self.cursors4, subnet.id);
        let key = ctx.picker_key();
        let max_retries = subnet.max_retries.unwrap_or(self.config.max_retries);

        for attempt in 0..max_retries {
            if Instant::now() >= ctx.deadline {
                debug!(attempt, "deadline passed during allocation");
                break;
            }
            let Some(addr) = picker::pick4(&pools, subnet.picker, &cursor, &key, attempt) else {
                break;
            };
            if self
                .reservations
                .holder_of4(addr)
                .is_some_and(|r| !self.reservation_is_for_client4(&r, ctx))
            {
                continue;
            }
            if let Some(lease) = self.try_claim4(snapshot, subnet, ctx, addr, false)? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Probes and inserts one candidate address. `None` means the address
    /// is taken (or a racing worker won); the caller moves on.
    fn try_claim4(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet4,
        ctx: &ClientContext4,
        addr: Ipv4Addr,
        fixed: bool,
    ) -> Result<Option<Lease4>> {
        let occupied = self.retry_db(ctx.deadline, || self.store.lease4_by_addr(addr))?;
        if occupied.is_some_and(|l| l.state != LeaseState::ExpiredReclaimed) {
            return Ok(None);
        }

        let (valid_lft, t1, t2) = snapshot.timers4(subnet);
        let mut lease = Lease4::new(addr, subnet.id, valid_lft, ctx.now);
        lease.t1 = t1;
        lease.t2 = t2;
        lease.hwaddr = ctx.hwaddr.clone();
        lease.client_id = ctx.client_id.clone();
        lease.fixed = fixed;
        if let Some(hostname) = &ctx.hostname {
            lease.set_hostname(hostname);
        }

        if self.retry_db(ctx.deadline, || self.store.add_lease4(lease.clone()))? {
            info!(%addr, fixed, "lease allocated");
            Ok(Some(lease))
        } else {
            debug!(%addr, "lost insert race, trying next candidate");
            Ok(None)
        }
    }

    /// Quarantines the lease named by a DHCPDECLINE.
    #[instrument(skip(self))]
    pub fn decline4(&self, addr: Ipv4Addr, now: i64) -> Result<Lease4> {
        let Some(mut lease) = self.store.lease4_by_addr(addr)? else {
            return Err(Error::NoSuchLease(addr.to_string()));
        };
        lease.decline(self.config.probation_secs, now);
        self.store.update_lease4(&lease)?;
        info!(%addr, probation = self.config.probation_secs, "lease declined and quarantined");
        Ok(lease)
    }

    /// Releases a lease. Fixed leases keep their row; dynamic ones go
    /// straight to the reclaimed state.
    #[instrument(skip(self))]
    pub fn release4(&self, addr: Ipv4Addr, now: i64) -> Result<Option<Lease4>> {
        let Some(mut lease) = self.store.lease4_by_addr(addr)? else {
            return Ok(None);
        };
        if lease.fixed {
            lease.valid_lft = 0;
            lease.cltt = now;
        } else {
            lease.release(now);
        }
        self.store.update_lease4(&lease)?;
        info!(%addr, "lease released");
        Ok(Some(lease))
    }

    // ---- IPv6 -----------------------------------------------------------

    #[instrument(skip(self, ctx), fields(subnet = %ctx.subnet_id, ty = ?ctx.ty))]
    pub fn allocate6(&self, ctx: &ClientContext6) -> Result<Lease6> {
        let snapshot = self.snapshots.load();
        let candidates = snapshot.candidate_subnets6(ctx.subnet_id);
        if candidates.is_empty() {
            return Err(Error::BadValue(format!(
                "subnet {} is not configured",
                ctx.subnet_id
            )));
        }

        for subnet in candidates {
            if Instant::now() >= ctx.deadline {
                break;
            }
            if !Self::class_allows(&subnet.client_class, &ctx.classes) {
                continue;
            }
            if let Some(lease) = self.try_renew6(&snapshot, subnet, ctx)? {
                return Ok(lease);
            }
            let allocated = match ctx.ty {
                Lease6Type::Na | Lease6Type::Ta => self.allocate_addr6(&snapshot, subnet, ctx)?,
                Lease6Type::Pd => self.allocate_prefix6(&snapshot, subnet, ctx)?,
            };
            if let Some(lease) = allocated {
                return Ok(lease);
            }
        }
        Err(Error::NoAddressAvailable(ctx.subnet_id))
    }

    fn try_renew6(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet6,
        ctx: &ClientContext6,
    ) -> Result<Option<Lease6>> {
        let held = self.retry_db(ctx.deadline, || {
            self.store
                .lease6_by_duid_iaid_in(&ctx.duid, ctx.iaid, subnet.id)
        })?;
        let Some(mut lease) = held.filter(|l| l.ty == ctx.ty) else {
            return Ok(None);
        };
        if lease.state != LeaseState::Default || lease.is_expired(ctx.now) {
            return Ok(None);
        }
        let still_valid = match ctx.ty {
            Lease6Type::Na | Lease6Type::Ta => subnet.in_pool(lease.addr) || lease.fixed,
            Lease6Type::Pd => subnet.in_pd_pool(lease.addr, lease.prefix_len) || lease.fixed,
        };
        if !still_valid {
            return Ok(None);
        }

        let (preferred_lft, valid_lft, t1, t2) = snapshot.timers6(subnet);
        lease.renew(ctx.now, preferred_lft, valid_lft, t1, t2);
        if let Some(hostname) = &ctx.hostname {
            lease.set_hostname(hostname);
        }
        self.retry_db(ctx.deadline, || self.store.update_lease6(&lease))?;
        info!(addr = %lease.addr, "lease renewed");
        Ok(Some(lease))
    }

    fn allocate_addr6(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet6,
        ctx: &ClientContext6,
    ) -> Result<Option<Lease6>> {
        let lock = self.subnet_lock(subnet.id);
        let _guard = self
            .config
            .threading
            .enabled()
            .then(|| lock.lock().expect("subnet lock poisoned"));

        if let Some(reservation) = self.reservations.by_duid(subnet.id, &ctx.duid) {
            if let Some(addr) = reservation.ipv6_na {
                match self.try_claim6(snapshot, subnet, ctx, addr, 128, true)? {
                    Some(lease) => return Ok(Some(lease)),
                    None => warn!(%addr, "reserved address is in use by another client"),
                }
            }
        }

        if let Some(requested) = ctx.requested {
            if subnet.in_pool(requested) {
                if let Some(lease) = self.try_claim6(snapshot, subnet, ctx, requested, 128, false)? {
                    return Ok(Some(lease));
                }
            }
        }

        let pools: Vec<&Pool6> = subnet
            .pools
            .iter()
            .filter(|pool| Self::class_allows(&pool.client_class, &ctx.classes))
            .collect();
        if pools.is_empty() {
            return Ok(None);
        }
        let cursor = Self::cursor(&self.cursors6, subnet.id);
        let key = ctx.picker_key();
        let max_retries = subnet.max_retries.unwrap_or(self.config.max_retries);

        for attempt in 0..max_retries {
            if Instant::now() >= ctx.deadline {
                break;
            }
            let Some(addr) = picker::pick6(&pools, subnet.picker, &cursor, &key, attempt) else {
                break;
            };
            if self.reservations.holder_of6(addr).is_some() {
                continue;
            }
            if let Some(lease) = self.try_claim6(snapshot, subnet, ctx, addr, 128, false)? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    fn allocate_prefix6(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet6,
        ctx: &ClientContext6,
    ) -> Result<Option<Lease6>> {
        let lock = self.subnet_lock(subnet.id);
        let _guard = self
            .config
            .threading
            .enabled()
            .then(|| lock.lock().expect("subnet lock poisoned"));

        if let Some(reservation) = self.reservations.by_duid(subnet.id, &ctx.duid) {
            if let Some(prefix) = reservation.ipv6_pd {
                match self.try_claim6(
                    snapshot,
                    subnet,
                    ctx,
                    prefix.network(),
                    prefix.prefix_len(),
                    true,
                )? {
                    Some(lease) => return Ok(Some(lease)),
                    None => {
                        warn!(%prefix, "reserved prefix is in use by another client")
                    }
                }
            }
        }

        let pools: Vec<&PdPool> = subnet
            .pd_pools
            .iter()
            .filter(|pool| Self::class_allows(&pool.client_class, &ctx.classes))
            .collect();
        if pools.is_empty() {
            return Ok(None);
        }
        let cursor = Self::cursor(&self.cursors_pd, subnet.id);
        let key = ctx.picker_key();
        let max_retries = subnet.max_retries.unwrap_or(self.config.max_retries);

        for attempt in 0..max_retries {
            if Instant::now() >= ctx.deadline {
                break;
            }
            let Some(prefix) = picker::pick_pd(&pools, subnet.picker, &cursor, &key, attempt)
            else {
                break;
            };
            if let Some(lease) = self.try_claim6(
                snapshot,
                subnet,
                ctx,
                prefix.network(),
                prefix.prefix_len(),
                false,
            )? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    fn try_claim6(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Subnet6,
        ctx: &ClientContext6,
        addr: std::net::Ipv6Addr,
        prefix_len: u8,
        fixed: bool,
    ) -> Result<Option<Lease6>> {
        let occupied = self.retry_db(ctx.deadline, || self.store.lease6_by_addr(addr, ctx.ty))?;
        if occupied.is_some_and(|l| l.state != LeaseState::ExpiredReclaimed) {
            return Ok(None);
        }

        let (preferred_lft, valid_lft, t1, t2) = snapshot.timers6(subnet);
        let mut lease = Lease6::new(
            ctx.ty,
            addr,
            prefix_len,
            ctx.duid.clone(),
            ctx.iaid,
            subnet.id,
            valid_lft,
            ctx.now,
        );
        lease.preferred_lft = preferred_lft;
        lease.t1 = t1;
        lease.t2 = t2;
        lease.fixed = fixed;
        if let Some(hostname) = &ctx.hostname {
            lease.set_hostname(hostname);
        }

        if self.retry_db(ctx.deadline, || self.store.add_lease6(lease.clone()))? {
            info!(%addr, prefix_len, "lease allocated");
            Ok(Some(lease))
        } else {
            debug!(%addr, "lost insert race, trying next candidate");
            Ok(None)
        }
    }

    #[instrument(skip(self))]
    pub fn decline6(&self, addr: std::net::Ipv6Addr, now: i64) -> Result<Lease6> {
        let Some(mut lease) = self.store.lease6_by_addr(addr, Lease6Type::Na)? else {
            return Err(Error::NoSuchLease(addr.to_string()));
        };
        lease.decline(self.config.probation_secs, now);
        self.store.update_lease6(&lease)?;
        info!(%addr, "lease declined and quarantined");
        Ok(lease)
    }

    #[instrument(skip(self))]
    pub fn release6(
        &self,
        addr: std::net::Ipv6Addr,
        ty: Lease6Type,
        now: i64,
    ) -> Result<Option<Lease6>> {
        let Some(mut lease) = self.store.lease6_by_addr(addr, ty)? else {
            return Ok(None);
        };
        if lease.fixed {
            lease.valid_lft = 0;
            lease.preferred_lft = 0;
            lease.cltt = now;
        } else {
            lease.release(now);
        }
        self.store.update_lease6(&lease)?;
        info!(%addr, "lease released");
        Ok(Some(lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configdb::{ConfigBackend, MemoryConfigBackend, PickerKind, ServerSelector};
    use crate::leasedb::MemoryLeaseStore;
    use crate::{ClientId, Duid};
    use std::time::Duration;

    fn engine_with(
        setup: impl FnOnce(&MemoryConfigBackend, &ReservationDb),
    ) -> AllocEngine {
        let backend = MemoryConfigBackend::new();
        let reservations = ReservationDb::new();
        setup(&backend, &reservations);
        let snapshot =
            ConfigSnapshot::build(&backend, &ServerSelector::AllServers).unwrap();
        AllocEngine::new(
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(reservations),
            Arc::new(SnapshotHandle::new(snapshot)),
            EngineConfig::default(),
        )
    }

    fn small_subnet(backend: &MemoryConfigBackend) {
        let mut subnet = crate::configdb::Subnet4::new(
            SubnetId::from_raw(7),
            "192.0.2.0/29".parse().unwrap(),
            3600,
        );
        subnet.pools.push(
            crate::configdb::Pool4::new(
                "192.0.2.2".parse().unwrap(),
                "192.0.2.6".parse().unwrap(),
            )
            .unwrap(),
        );
        backend
            .upsert_subnet4(&ServerSelector::AllServers, subnet)
            .unwrap();
    }

    fn ctx(now: i64) -> ClientContext4 {
        let mut ctx = ClientContext4::new(SubnetId::from_raw(7), now);
        ctx.client_id = Some(ClientId::new(vec![0x01, 0x02, 0x03]).unwrap());
        ctx.deadline = Instant::now() + Duration::from_secs(5);
        ctx
    }

    #[test]
    fn exhausts_pool_then_naks() {
        let engine = engine_with(|backend, _| small_subnet(backend));
        for i in 0..5u8 {
            let mut c = ctx(100);
            c.client_id = Some(ClientId::new(vec![0x01, i]).unwrap());
            engine.allocate4(&c).unwrap();
        }
        let mut sixth = ctx(100);
        sixth.client_id = Some(ClientId::new(vec![0x01, 0xff]).unwrap());
        let err = engine.allocate4(&sixth).unwrap_err();
        assert!(matches!(err, Error::NoAddressAvailable(_)));
    }

    #[test]
    fn renew_keeps_address_and_bumps_cltt() {
        let engine = engine_with(|backend, _| small_subnet(backend));
        let first = engine.allocate4(&ctx(1_000)).unwrap();
        let renewed = engine.allocate4(&ctx(1_001)).unwrap();
        assert_eq!(renewed.addr, first.addr);
        assert_eq!(renewed.cltt, 1_001);
        // still a single lease in the store
        assert_eq!(
            engine
                .store()
                .leases4_in_subnet(SubnetId::from_raw(7))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn reservation_wins_over_dynamic_pool() {
        let engine = engine_with(|backend, reservations| {
            small_subnet(backend);
            reservations.insert(Reservation {
                subnet_id: SubnetId::from_raw(7),
                ipv4: Some("192.0.2.4".parse().unwrap()),
                ipv6_na: None,
                ipv6_pd: None,
                hostname: None,
                hwaddr: None,
                client_id: Some(ClientId::new(vec![0x01, 0x02, 0x03]).unwrap()),
                duid: None,
            });
        });
        let lease = engine.allocate4(&ctx(100)).unwrap();
        assert_eq!(lease.addr, "192.0.2.4".parse::<Ipv4Addr>().unwrap());
        assert!(lease.fixed);
    }

    #[test]
    fn squatted_reservation_falls_back_to_pool() {
        let engine = engine_with(|backend, reservations| {
            small_subnet(backend);
            reservations.insert(Reservation {
                subnet_id: SubnetId::from_raw(7),
                ipv4: Some("192.0.2.2".parse().unwrap()),
                ipv6_na: None,
                ipv6_pd: None,
                hostname: None,
                hwaddr: None,
                client_id: Some(ClientId::new(vec![0x01, 0x02, 0x03]).unwrap()),
                duid: None,
            });
        });
        // someone else sits on the reserved address
        let mut squatter = Lease4::new(
            "192.0.2.2".parse().unwrap(),
            SubnetId::from_raw(7),
            3600,
            50,
        );
        squatter.client_id = Some(ClientId::new(vec![0x0e, 0x0e]).unwrap());
        assert!(engine.store().add_lease4(squatter).unwrap());

        let lease = engine.allocate4(&ctx(100)).unwrap();
        assert_ne!(lease.addr, "192.0.2.2".parse::<Ipv4Addr>().unwrap());
        assert!(!lease.fixed);
    }

    #[test]
    fn reserved_addresses_skipped_for_other_clients() {
        let engine = engine_with(|backend, reservations| {
            small_subnet(backend);
            reservations.insert(Reservation {
                subnet_id: SubnetId::from_raw(7),
                ipv4: Some("192.0.2.2".parse().unwrap()),
                ipv6_na: None,
                ipv6_pd: None,
                hostname: None,
                hwaddr: None,
                client_id: Some(ClientId::new(vec![0xaa, 0xbb]).unwrap()),
                duid: None,
            });
        });
        // iterative picker would hand out .2 first, but it is reserved for
        // someone else
        let lease = engine.allocate4(&ctx(100)).unwrap();
        assert_eq!(lease.addr, "192.0.2.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn decline_quarantines_and_reclaim_frees() {
        let engine = engine_with(|backend, _| small_subnet(backend));
        let lease = engine.allocate4(&ctx(100)).unwrap();
        let declined = engine.decline4(lease.addr, 200).unwrap();
        assert_eq!(declined.state, LeaseState::Declined);
        assert!(declined.client_id.is_none());
        assert_eq!(declined.valid_lft, EngineConfig::default().probation_secs);

        // before quarantine expiry the address stays unavailable
        let probe = engine.store().lease4_by_addr(lease.addr).unwrap().unwrap();
        assert_eq!(probe.state, LeaseState::Declined);
    }

    #[test]
    fn requested_address_honored_when_free() {
        let engine = engine_with(|backend, _| small_subnet(backend));
        let mut c = ctx(100);
        c.requested = Some("192.0.2.5".parse().unwrap());
        let lease = engine.allocate4(&c).unwrap();
        assert_eq!(lease.addr, "192.0.2.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn expired_deadline_yields_no_address() {
        let engine = engine_with(|backend, _| small_subnet(backend));
        let mut c = ctx(100);
        c.deadline = Instant::now() - Duration::from_millis(1);
        let err = engine.allocate4(&c).unwrap_err();
        assert!(matches!(err, Error::NoAddressAvailable(_)));
        assert!(engine
            .store()
            .leases4_in_subnet(SubnetId::from_raw(7))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pd_lease_allocation_and_collision() {
        let backend = MemoryConfigBackend::new();
        let mut subnet = crate::configdb::Subnet6::new(
            SubnetId::from_raw(2),
            "2001:db8::/32".parse().unwrap(),
            7200,
        );
        subnet.pd_pools.push(
            crate::configdb::PdPool::new("2001:db8::/48".parse().unwrap(), 56).unwrap(),
        );
        subnet.picker = PickerKind::Iterative;
        backend
            .upsert_subnet6(&ServerSelector::AllServers, subnet)
            .unwrap();
        let snapshot =
            ConfigSnapshot::build(&backend, &ServerSelector::AllServers).unwrap();
        let engine = AllocEngine::new(
            Arc::new(MemoryLeaseStore::new()),
            Arc::new(ReservationDb::new()),
            Arc::new(SnapshotHandle::new(snapshot)),
            EngineConfig::default(),
        );

        let duid_a = Duid::new(vec![0xde, 0xad]).unwrap();
        let duid_b = Duid::new(vec![0xbe, 0xef]).unwrap();
        let a = engine
            .allocate6(&ClientContext6::new(
                SubnetId::from_raw(2),
                duid_a,
                1,
                Lease6Type::Pd,
                100,
            ))
            .unwrap();
        assert_eq!(a.ty, Lease6Type::Pd);
        assert_eq!(a.prefix_len, 56);

        let b = engine
            .allocate6(&ClientContext6::new(
                SubnetId::from_raw(2),
                duid_b,
                1,
                Lease6Type::Pd,
                100,
            ))
            .unwrap();
        assert_ne!((a.addr, a.ty), (b.addr, b.ty));
    }
}
