//! The allocation engine.
//!
//! Given a parsed request context and the current configuration snapshot,
//! the engine produces or revises a lease through the lease store. It is
//! CPU-bound apart from store calls; requests carry a deadline checked
//! between retry iterations.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use compact_str::CompactString;

use crate::threading::MultiThreading;
use crate::{ClientId, Duid, HwAddr, Lease6Type, SubnetId};

pub mod engine;
pub mod picker;

pub use engine::AllocEngine;

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Allocation probe budget per subnet; subnets may override.
    pub max_retries: u32,
    /// How many transient store failures one operation absorbs before the
    /// error surfaces.
    pub db_retry_budget: u32,
    /// Quarantine period for declined leases, seconds.
    pub probation_secs: u32,
    pub threading: MultiThreading,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_retries: 50,
            db_retry_budget: 3,
            probation_secs: 86_400,
            threading: MultiThreading::multi(),
        }
    }
}

/// A parsed DHCPv4 request as the engine sees it. The subnet is resolved
/// upstream from relay agent information or the receiving interface.
#[derive(Debug, Clone)]
pub struct ClientContext4 {
    pub subnet_id: SubnetId,
    pub client_id: Option<ClientId>,
    pub hwaddr: Option<HwAddr>,
    /// Requested-address option or prior-state hint.
    pub requested: Option<Ipv4Addr>,
    pub classes: HashSet<CompactString>,
    pub hostname: Option<String>,
    /// Request receive time, epoch seconds; becomes the lease `cltt`.
    pub now: i64,
    pub deadline: Instant,
}

impl ClientContext4 {
    pub fn new(subnet_id: SubnetId, now: i64) -> Self {
        ClientContext4 {
            subnet_id,
            client_id: None,
            hwaddr: None,
            requested: None,
            classes: HashSet::new(),
            hostname: None,
            now,
            deadline: Instant::now() + Duration::from_millis(500),
        }
    }

    /// Bytes the hashed picker feeds to the hash: client-id first, the
    /// hardware address as fallback.
    pub(crate) fn picker_key(&self) -> Vec<u8> {
        if let Some(id) = &self.client_id {
            return id.as_bytes().to_vec();
        }
        self.hwaddr
            .as_ref()
            .map(|hw| hw.as_bytes().to_vec())
            .unwrap_or_default()
    }
}

/// A parsed DHCPv6 request for one IA.
#[derive(Debug, Clone)]
pub struct ClientContext6 {
    pub subnet_id: SubnetId,
    pub duid: Duid,
    pub iaid: u32,
    pub ty: Lease6Type,
    pub requested: Option<Ipv6Addr>,
    pub classes: HashSet<CompactString>,
    pub hostname: Option<String>,
    pub now: i64,
    pub deadline: Instant,
}

impl ClientContext6 {
    pub fn new(subnet_id: SubnetId, duid: Duid, iaid: u32, ty: Lease6Type, now: i64) -> Self {
        ClientContext6 {
            subnet_id,
            duid,
            iaid,
            ty,
            requested: None,
            classes: HashSet::new(),
            hostname: None,
            now,
            deadline: Instant::now() + Duration::from_millis(500),
        }
    }

    pub(crate) fn picker_key(&self) -> Vec<u8> {
        let mut key = self.duid.as_bytes().to_vec();
        key.extend_from_slice(&self.iaid.to_be_bytes());
        key
    }
}
