//! Lease store backends.
//!
//! One contract, three backends: a [`memory`] store for testing and
//! single-host deployments, a [`sqlite`] store for durable single-file
//! persistence, and a [`wide`] ClickHouse-backed store for deployments
//! that keep lease history in a wide-column cluster.
//!
//! All methods take `&self`; backends serialize conflicting writes on the
//! same primary key internally. A reader observes either the pre- or the
//! post-image of a write, never a torn value.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{ClientId, Duid, HwAddr, Lease4, Lease6, Lease6Type, Result, SchemaVersion, SubnetId};

pub mod memory;
pub mod sqlite;
pub mod wide;

pub use memory::MemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;
pub use wide::WideLeaseStore;

/// Schema version this build reads and writes. A backend whose stored
/// major differs refuses to open.
pub const LEASE_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(5, 0);

/// The lease database contract shared by every backend.
///
/// Conventions:
/// * `add_lease4`/`add_lease6` return `Ok(false)` when a lease with the
///   same primary key exists in a state other than `ExpiredReclaimed`;
///   reclaimed rows are silently overwritten. Mutation of an existing
///   lease goes through `update_lease*`, never through a duplicate add.
/// * `expired4`/`expired6` return leases past `cltt + valid_lft` that have
///   not been reclaimed yet, ordered by ascending expiry so the reclaimer
///   processes the oldest first. A zero `max` is caller misuse.
/// * `modified4_since`/`modified6_since` return leases whose `cltt`
///   (bumped on every mutation) strictly exceeds the given instant,
///   ordered by ascending `cltt`.
/// * Deletes report whether a row was removed; removing nothing is not an
///   error.
pub trait LeaseStore: Send + Sync {
    fn add_lease4(&self, lease: Lease4) -> Result<bool>;
    fn lease4_by_addr(&self, addr: Ipv4Addr) -> Result<Option<Lease4>>;
    fn leases4_by_hwaddr(&self, hw: &HwAddr) -> Result<Vec<Lease4>>;
    fn lease4_by_hwaddr_in(&self, hw: &HwAddr, subnet_id: SubnetId) -> Result<Option<Lease4>>;
    fn leases4_by_client_id(&self, id: &ClientId) -> Result<Vec<Lease4>>;
    fn lease4_by_client_id_in(&self, id: &ClientId, subnet_id: SubnetId)
        -> Result<Option<Lease4>>;
    fn leases4_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease4>>;
    fn expired4(&self, now: i64, max: usize) -> Result<Vec<Lease4>>;
    fn modified4_since(&self, since: i64) -> Result<Vec<Lease4>>;
    fn update_lease4(&self, lease: &Lease4) -> Result<()>;
    fn delete_lease4(&self, addr: Ipv4Addr) -> Result<bool>;
    /// Removes `ExpiredReclaimed` rows whose expiry predates `before`.
    /// Returns the number of rows removed.
    fn purge_reclaimed4(&self, before: i64) -> Result<u64>;

    fn add_lease6(&self, lease: Lease6) -> Result<bool>;
    fn lease6_by_addr(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<Option<Lease6>>;
    fn leases6_by_duid_iaid(&self, duid: &Duid, iaid: u32) -> Result<Vec<Lease6>>;
    fn lease6_by_duid_iaid_in(
        &self,
        duid: &Duid,
        iaid: u32,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease6>>;
    fn leases6_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease6>>;
    fn expired6(&self, now: i64, max: usize) -> Result<Vec<Lease6>>;
    fn modified6_since(&self, since: i64) -> Result<Vec<Lease6>>;
    fn update_lease6(&self, lease: &Lease6) -> Result<()>;
    fn delete_lease6(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<bool>;
    fn purge_reclaimed6(&self, before: i64) -> Result<u64>;

    /// Short backend identifier, e.g. `"memory"` or `"sqlite"`.
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema_version(&self) -> Result<SchemaVersion>;
}

pub(crate) fn check_max(max: usize) -> Result<()> {
    if max == 0 {
        return Err(crate::Error::InvalidParameter(
            "expired-lease batch size must be positive".into(),
        ));
    }
    Ok(())
}
