//! Expired-lease reclamation.
//!
//! A periodic task moves leases past `cltt + valid_lft`, including
//! declined leases whose quarantine ran out, into the reclaimed state,
//! then ages out reclaimed rows older than the configured horizon. The
//! store returns expired leases oldest-first, so a bounded batch always
//! makes progress on the backlog.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::leasedb::LeaseStore;
use crate::{LeaseState, Result};

pub struct Reclaimer {
    store: Arc<dyn LeaseStore>,
    /// Reclaimed rows whose expiry is older than this many seconds are
    /// purged entirely.
    pub horizon_secs: i64,
    /// Upper bound on leases processed per family per pass.
    pub batch: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub reclaimed4: u64,
    pub reclaimed6: u64,
    pub purged4: u64,
    pub purged6: u64,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn LeaseStore>, horizon_secs: i64, batch: usize) -> Self {
        Reclaimer {
            store,
            horizon_secs,
            batch,
        }
    }

    /// One reclamation pass at instant `now`.
    #[instrument(skip(self))]
    pub fn run_once(&self, now: i64) -> Result<ReclaimStats> {
        let mut stats = ReclaimStats::default();

        for mut lease in self.store.expired4(now, self.batch)? {
            // fixed leases keep their binding across expiry
            if lease.fixed {
                continue;
            }
            lease.state = LeaseState::ExpiredReclaimed;
            self.store.update_lease4(&lease)?;
            stats.reclaimed4 += 1;
        }
        for mut lease in self.store.expired6(now, self.batch)? {
            if lease.fixed {
                continue;
            }
            lease.state = LeaseState::ExpiredReclaimed;
            self.store.update_lease6(&lease)?;
            stats.reclaimed6 += 1;
        }

        let before = now - self.horizon_secs;
        stats.purged4 = self.store.purge_reclaimed4(before)?;
        stats.purged6 = self.store.purge_reclaimed6(before)?;

        if stats != ReclaimStats::default() {
            info!(
                reclaimed4 = stats.reclaimed4,
                reclaimed6 = stats.reclaimed6,
                purged4 = stats.purged4,
                purged6 = stats.purged6,
                "reclamation pass complete"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasedb::{LeaseStore, MemoryLeaseStore};
    use crate::{Lease4, SubnetId};
    use std::net::Ipv4Addr;

    fn store_with_leases() -> Arc<MemoryLeaseStore> {
        let store = Arc::new(MemoryLeaseStore::new());
        // expires at 1100
        store
            .add_lease4(Lease4::new(
                Ipv4Addr::new(192, 0, 2, 2),
                SubnetId::from_raw(1),
                1000,
                100,
            ))
            .unwrap();
        // expires at 10_100
        store
            .add_lease4(Lease4::new(
                Ipv4Addr::new(192, 0, 2, 3),
                SubnetId::from_raw(1),
                10_000,
                100,
            ))
            .unwrap();
        store
    }

    #[test]
    fn expired_leases_move_to_reclaimed() {
        let store = store_with_leases();
        let reclaimer = Reclaimer::new(store.clone() as Arc<dyn LeaseStore>, 3600, 100);

        let stats = reclaimer.run_once(2_000).unwrap();
        assert_eq!(stats.reclaimed4, 1);
        assert_eq!(stats.purged4, 0);

        let reclaimed = store
            .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 2))
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.state, LeaseState::ExpiredReclaimed);
        let active = store
            .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 3))
            .unwrap()
            .unwrap();
        assert_eq!(active.state, LeaseState::Default);
    }

    #[test]
    fn old_reclaimed_rows_are_purged() {
        let store = store_with_leases();
        let reclaimer = Reclaimer::new(store.clone() as Arc<dyn LeaseStore>, 3600, 100);

        reclaimer.run_once(2_000).unwrap();
        // well past the horizon: row expired at 1100, horizon 3600
        let stats = reclaimer.run_once(10_000).unwrap();
        assert_eq!(stats.purged4, 1);
        assert!(store
            .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn declined_leases_reclaim_after_quarantine() {
        let store = Arc::new(MemoryLeaseStore::new());
        let mut lease = Lease4::new(
            Ipv4Addr::new(192, 0, 2, 9),
            SubnetId::from_raw(1),
            3600,
            100,
        );
        store.add_lease4(lease.clone()).unwrap();
        lease.decline(600, 200);
        store.update_lease4(&lease).unwrap();

        let reclaimer = Reclaimer::new(store.clone() as Arc<dyn LeaseStore>, 86_400, 100);
        // quarantine runs until 800
        assert_eq!(reclaimer.run_once(500).unwrap().reclaimed4, 0);
        assert_eq!(reclaimer.run_once(900).unwrap().reclaimed4, 1);
        assert_eq!(
            store
                .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 9))
                .unwrap()
                .unwrap()
                .state,
            LeaseState::ExpiredReclaimed
        );
    }

    #[test]
    fn fixed_leases_survive_reclamation() {
        let store = Arc::new(MemoryLeaseStore::new());
        let mut lease = Lease4::new(
            Ipv4Addr::new(192, 0, 2, 8),
            SubnetId::from_raw(1),
            1000,
            100,
        );
        lease.fixed = true;
        store.add_lease4(lease).unwrap();

        let reclaimer = Reclaimer::new(store.clone() as Arc<dyn LeaseStore>, 3600, 100);
        let stats = reclaimer.run_once(100_000).unwrap();
        assert_eq!(stats.reclaimed4, 0);
        assert_eq!(
            store
                .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 8))
                .unwrap()
                .unwrap()
                .state,
            LeaseState::Default
        );
    }
}
