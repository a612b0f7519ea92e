//! Immutable configuration snapshots and the reconfiguration task.
//!
//! The allocation engine never reads the configuration backend directly.
//! It loads the current [`ConfigSnapshot`] through a [`SnapshotHandle`]
//! and keeps that `Arc` for the duration of one request. The
//! [`ConfigPoller`] tails the backend's audit log; when anything changed
//! it rebuilds a snapshot off-path and publishes it with a single pointer
//! swap.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use compact_str::CompactString;
use tracing::{debug, info, instrument};

use crate::configdb::{
    ConfigBackend, GlobalParameter, OptionDescriptor, OptionScope, ServerSelector, SharedNetwork4,
    SharedNetwork6, Subnet4, Subnet6,
};
use crate::{Result, SubnetId};

/// A resolved, immutable view of one server's configuration.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    subnets4: BTreeMap<SubnetId, Subnet4>,
    subnets6: BTreeMap<SubnetId, Subnet6>,
    networks4: HashMap<CompactString, SharedNetwork4>,
    networks6: HashMap<CompactString, SharedNetwork6>,
    /// Shared-network membership in declaration order (ascending subnet
    /// id, the order subnets are declared and assigned ids).
    members4: HashMap<CompactString, Vec<SubnetId>>,
    members6: HashMap<CompactString, Vec<SubnetId>>,
    options: Vec<(OptionScope, OptionDescriptor)>,
    globals: HashMap<CompactString, GlobalParameter>,
}

impl ConfigSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads every entity visible to `sel` and resolves the indices.
    pub fn build(backend: &dyn ConfigBackend, sel: &ServerSelector) -> Result<Self> {
        let mut snapshot = ConfigSnapshot::default();

        for subnet in backend.all_subnets4(sel)? {
            if let Some(network) = subnet.shared_network.clone() {
                snapshot
                    .members4
                    .entry(network)
                    .or_default()
                    .push(subnet.id);
            }
            snapshot.subnets4.insert(subnet.id, subnet);
        }
        for subnet in backend.all_subnets6(sel)? {
            if let Some(network) = subnet.shared_network.clone() {
                snapshot
                    .members6
                    .entry(network)
                    .or_default()
                    .push(subnet.id);
            }
            snapshot.subnets6.insert(subnet.id, subnet);
        }
        for network in backend.all_shared_networks4(sel)? {
            snapshot.networks4.insert(network.name.clone(), network);
        }
        for network in backend.all_shared_networks6(sel)? {
            snapshot.networks6.insert(network.name.clone(), network);
        }
        snapshot.options = backend.all_options(sel)?;
        for parameter in backend.all_global_parameters(sel)? {
            snapshot
                .globals
                .insert(CompactString::from(parameter.name()), parameter);
        }

        // member lists come out of a sorted map already, but keep the
        // ordering explicit
        for members in snapshot.members4.values_mut() {
            members.sort_unstable();
        }
        for members in snapshot.members6.values_mut() {
            members.sort_unstable();
        }
        Ok(snapshot)
    }

    pub fn subnet4(&self, id: SubnetId) -> Option<&Subnet4> {
        self.subnets4.get(&id)
    }

    pub fn subnet6(&self, id: SubnetId) -> Option<&Subnet6> {
        self.subnets6.get(&id)
    }

    pub fn shared_network4(&self, name: &str) -> Option<&SharedNetwork4> {
        self.networks4.get(name)
    }

    pub fn shared_network6(&self, name: &str) -> Option<&SharedNetwork6> {
        self.networks6.get(name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalParameter> {
        self.globals.get(name)
    }

    /// The subnets tried for a request selecting `id`: the subnet itself
    /// first, then its shared-network siblings in declaration order.
    pub fn candidate_subnets4(&self, id: SubnetId) -> Vec<&Subnet4> {
        let Some(selected) = self.subnets4.get(&id) else {
            return Vec::new();
        };
        let mut candidates = vec![selected];
        if let Some(network) = selected.shared_network.as_ref() {
            if let Some(members) = self.members4.get(network) {
                candidates.extend(
                    members
                        .iter()
                        .filter(|member| **member != id)
                        .filter_map(|member| self.subnets4.get(member)),
                );
            }
        }
        candidates
    }

    pub fn candidate_subnets6(&self, id: SubnetId) -> Vec<&Subnet6> {
        let Some(selected) = self.subnets6.get(&id) else {
            return Vec::new();
        };
        let mut candidates = vec![selected];
        if let Some(network) = selected.shared_network.as_ref() {
            if let Some(members) = self.members6.get(network) {
                candidates.extend(
                    members
                        .iter()
                        .filter(|member| **member != id)
                        .filter_map(|member| self.subnets6.get(member)),
                );
            }
        }
        candidates
    }

    /// Effective IPv4 lease timers for a subnet: the subnet's own values,
    /// falling back to its shared network where the subnet leaves a timer
    /// at zero.
    pub fn timers4(&self, subnet: &Subnet4) -> (u32, u32, u32) {
        let network = subnet
            .shared_network
            .as_ref()
            .and_then(|name| self.networks4.get(name));
        let valid = nonzero_or(subnet.valid_lft, network.and_then(|n| n.valid_lft));
        let t1 = nonzero_or(subnet.t1, network.and_then(|n| n.t1));
        let t2 = nonzero_or(subnet.t2, network.and_then(|n| n.t2));
        (valid, t1, t2)
    }

    pub fn timers6(&self, subnet: &Subnet6) -> (u32, u32, u32, u32) {
        let network = subnet
            .shared_network
            .as_ref()
            .and_then(|name| self.networks6.get(name));
        let preferred = nonzero_or(subnet.preferred_lft, network.and_then(|n| n.preferred_lft));
        let valid = nonzero_or(subnet.valid_lft, network.and_then(|n| n.valid_lft));
        let t1 = nonzero_or(subnet.t1, network.and_then(|n| n.t1));
        let t2 = nonzero_or(subnet.t2, network.and_then(|n| n.t2));
        (preferred, valid, t1, t2)
    }

    /// Options effective for an IPv4 subnet, merged narrowest-scope-wins:
    /// global, then shared-network, then subnet, then the pool holding
    /// `addr`. A cancelled descriptor removes the inherited option.
    pub fn options_for4(
        &self,
        subnet: &Subnet4,
        addr: Option<Ipv4Addr>,
    ) -> Vec<&OptionDescriptor> {
        let mut merged: BTreeMap<(&str, u16), &OptionDescriptor> = BTreeMap::new();
        let mut apply = |scope_matches: &dyn Fn(&OptionScope) -> bool| {
            for (scope, option) in &self.options {
                if scope_matches(scope) {
                    if option.cancelled {
                        merged.remove(&(option.space.as_str(), option.code));
                    } else {
                        merged.insert((option.space.as_str(), option.code), option);
                    }
                }
            }
        };

        apply(&|scope| matches!(scope, OptionScope::Global));
        if let Some(network) = subnet.shared_network.as_ref() {
            apply(&|scope| {
                matches!(scope, OptionScope::SharedNetwork { name } if name == network)
            });
        }
        let id = subnet.id;
        apply(&|scope| matches!(scope, OptionScope::Subnet { subnet_id } if *subnet_id == id));
        if let Some(addr) = addr {
            if let Some(pool) = subnet.pools.iter().find(|p| p.contains(addr)) {
                let (start, end) = (pool.start, pool.end);
                apply(&|scope| {
                    matches!(scope, OptionScope::Pool { start: s, end: e }
                        if *s == std::net::IpAddr::V4(start) && *e == std::net::IpAddr::V4(end))
                });
            }
        }
        merged.into_values().collect()
    }
}

fn nonzero_or(own: u32, fallback: Option<u32>) -> u32 {
    if own != 0 {
        own
    } else {
        fallback.unwrap_or(0)
    }
}

/// The publish point: one atomic pointer swap per reconfiguration.
pub struct SnapshotHandle {
    current: ArcSwap<ConfigSnapshot>,
}

impl SnapshotHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        SnapshotHandle {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The snapshot as of now. Callers keep the `Arc` for the whole
    /// request so a concurrent publish never changes their view.
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: Arc<ConfigSnapshot>) {
        self.current.store(snapshot);
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        SnapshotHandle::new(ConfigSnapshot::empty())
    }
}

/// Periodic task that tails the audit log and republishes the snapshot
/// when anything changed.
pub struct ConfigPoller {
    backend: Arc<dyn ConfigBackend>,
    handle: Arc<SnapshotHandle>,
    selector: ServerSelector,
    last_seen: Option<(DateTime<Utc>, u64)>,
}

impl ConfigPoller {
    pub fn new(
        backend: Arc<dyn ConfigBackend>,
        handle: Arc<SnapshotHandle>,
        selector: ServerSelector,
    ) -> Self {
        ConfigPoller {
            backend,
            handle,
            selector,
            last_seen: None,
        }
    }

    /// Installs the initial snapshot regardless of audit state.
    pub fn prime(&mut self) -> Result<()> {
        let snapshot = ConfigSnapshot::build(self.backend.as_ref(), &self.selector)?;
        self.handle.publish(Arc::new(snapshot));
        if let Some(last) = self
            .backend
            .recent_audit_entries(&self.selector, DateTime::<Utc>::MIN_UTC)?
            .last()
        {
            self.last_seen = Some((last.modified_at, last.revision));
        }
        Ok(())
    }

    /// One poll cycle. Returns whether a new snapshot was published.
    #[instrument(skip(self), fields(selector = %self.selector))]
    pub fn poll(&mut self) -> Result<bool> {
        // re-read one microsecond behind the watermark and filter on
        // (timestamp, revision) so equal-timestamp entries from other
        // writers are never skipped
        let from = match self.last_seen {
            None => DateTime::<Utc>::MIN_UTC,
            Some((ts, _)) => ts - Duration::microseconds(1),
        };
        let entries = self.backend.recent_audit_entries(&self.selector, from)?;
        let fresh: Vec<_> = entries
            .into_iter()
            .filter(|e| match self.last_seen {
                None => true,
                Some((ts, rev)) => (e.modified_at, e.revision) > (ts, rev),
            })
            .collect();
        if fresh.is_empty() {
            debug!("configuration unchanged");
            return Ok(false);
        }

        let snapshot = ConfigSnapshot::build(self.backend.as_ref(), &self.selector)?;
        self.handle.publish(Arc::new(snapshot));
        if let Some(last) = fresh.last() {
            self.last_seen = Some((last.modified_at, last.revision));
        }
        info!(changes = fresh.len(), "installed new configuration snapshot");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configdb::{MemoryConfigBackend, Pool4};

    fn subnet(id: u32, prefix: &str) -> Subnet4 {
        Subnet4::new(SubnetId::from_raw(id), prefix.parse().unwrap(), 3600)
    }

    fn backend_with_network() -> MemoryConfigBackend {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::AllServers;
        backend
            .upsert_shared_network4(&sel, SharedNetwork4::new("floor-2"))
            .unwrap();
        for (id, prefix) in [(3u32, "10.3.0.0/24"), (1, "10.1.0.0/24"), (2, "10.2.0.0/24")] {
            let mut s = subnet(id, prefix);
            s.shared_network = Some("floor-2".into());
            backend.upsert_subnet4(&sel, s).unwrap();
        }
        backend
    }

    #[test]
    fn candidates_follow_declaration_order() {
        let backend = backend_with_network();
        let snapshot =
            ConfigSnapshot::build(&backend, &ServerSelector::AllServers).unwrap();

        let candidates = snapshot.candidate_subnets4(SubnetId::from_raw(2));
        let ids: Vec<u32> = candidates.iter().map(|s| s.id.get()).collect();
        // selected subnet first, then remaining members in declaration order
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn unknown_subnet_has_no_candidates() {
        let snapshot = ConfigSnapshot::empty();
        assert!(snapshot.candidate_subnets4(SubnetId::from_raw(9)).is_empty());
    }

    #[test]
    fn network_timers_fill_zero_subnet_timers() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::AllServers;
        let mut network = SharedNetwork4::new("lab");
        network.valid_lft = Some(7200);
        network.t1 = Some(3600);
        backend.upsert_shared_network4(&sel, network).unwrap();

        let mut s = subnet(1, "10.0.0.0/24");
        s.shared_network = Some("lab".into());
        s.valid_lft = 0;
        s.t1 = 0;
        s.t2 = 900;
        backend.upsert_subnet4(&sel, s).unwrap();

        let snapshot = ConfigSnapshot::build(&backend, &sel).unwrap();
        let subnet = snapshot.subnet4(SubnetId::from_raw(1)).unwrap();
        assert_eq!(snapshot.timers4(subnet), (7200, 3600, 900));
    }

    #[test]
    fn option_merge_narrowest_scope_wins() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::AllServers;
        let mut s = subnet(7, "192.0.2.0/24");
        s.pools
            .push(Pool4::new("192.0.2.10".parse().unwrap(), "192.0.2.99".parse().unwrap()).unwrap());
        backend.upsert_subnet4(&sel, s).unwrap();

        let dns = |value: &str| OptionDescriptor {
            code: 6,
            space: "dhcp4".into(),
            value: value.into(),
            persistent: true,
            cancelled: false,
            stamp: Default::default(),
        };
        backend
            .upsert_option(&sel, &OptionScope::Global, dns("192.0.2.1"))
            .unwrap();
        backend
            .upsert_option(
                &sel,
                &OptionScope::Subnet {
                    subnet_id: SubnetId::from_raw(7),
                },
                dns("192.0.2.53"),
            )
            .unwrap();
        // cancelled at pool scope hides the option inside that pool
        let mut cancelled = dns("");
        cancelled.cancelled = true;
        backend
            .upsert_option(
                &sel,
                &OptionScope::Pool {
                    start: "192.0.2.10".parse().unwrap(),
                    end: "192.0.2.99".parse().unwrap(),
                },
                cancelled,
            )
            .unwrap();

        let snapshot = ConfigSnapshot::build(&backend, &sel).unwrap();
        let subnet = snapshot.subnet4(SubnetId::from_raw(7)).unwrap();

        let merged = snapshot.options_for4(subnet, None);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, "192.0.2.53");

        let inside_pool = snapshot.options_for4(subnet, Some("192.0.2.20".parse().unwrap()));
        assert!(inside_pool.is_empty());
    }

    #[test]
    fn poller_publishes_only_on_change() {
        let backend = Arc::new(backend_with_network());
        let handle = Arc::new(SnapshotHandle::default());
        let mut poller = ConfigPoller::new(
            Arc::clone(&backend) as Arc<dyn ConfigBackend>,
            Arc::clone(&handle),
            ServerSelector::AllServers,
        );

        poller.prime().unwrap();
        let first = handle.load();
        assert!(first.subnet4(SubnetId::from_raw(1)).is_some());

        // no change, no publish
        assert!(!poller.poll().unwrap());
        assert!(Arc::ptr_eq(&first, &handle.load()));

        backend
            .upsert_subnet4(&ServerSelector::AllServers, subnet(9, "172.16.9.0/24"))
            .unwrap();
        assert!(poller.poll().unwrap());
        let second = handle.load();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.subnet4(SubnetId::from_raw(9)).is_some());
        // readers holding the old Arc still see their request-time view
        assert!(first.subnet4(SubnetId::from_raw(9)).is_none());

        assert!(!poller.poll().unwrap());
    }
}
