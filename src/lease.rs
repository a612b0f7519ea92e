//! Lease records for IPv4 addresses and IPv6 addresses/prefixes.
//!
//! Leases are plain records with public fields. They sit on the hot path of
//! every DHCP request, so access is direct rather than through accessors;
//! the handful of methods here implement lifecycle transitions shared by
//! every backend.

use std::net::{Ipv4Addr, Ipv6Addr};

use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};

use crate::{ClientId, Duid, Error, HwAddr, Result, SubnetId};

/// Lease lifecycle state as persisted by the stores.
///
/// `Expired` is not a stored state: a lease past `cltt + valid_lft` is
/// expired by inspection until the reclaimer moves it to
/// `ExpiredReclaimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseState {
    Default,
    Declined,
    ExpiredReclaimed,
}

impl LeaseState {
    pub fn as_u8(self) -> u8 {
        match self {
            LeaseState::Default => 0,
            LeaseState::Declined => 1,
            LeaseState::ExpiredReclaimed => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LeaseState::Default),
            1 => Ok(LeaseState::Declined),
            2 => Ok(LeaseState::ExpiredReclaimed),
            other => Err(Error::BadValue(format!("unknown lease state {other}"))),
        }
    }
}

/// DHCPv6 lease kinds: non-temporary address, temporary address, or a
/// delegated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lease6Type {
    Na,
    Ta,
    Pd,
}

impl Lease6Type {
    pub fn as_u8(self) -> u8 {
        match self {
            Lease6Type::Na => 0,
            Lease6Type::Ta => 1,
            Lease6Type::Pd => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Lease6Type::Na),
            1 => Ok(Lease6Type::Ta),
            2 => Ok(Lease6Type::Pd),
            other => Err(Error::BadValue(format!("unknown lease type {other}"))),
        }
    }
}

/// An IPv4 lease. The address is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease4 {
    pub addr: Ipv4Addr,
    pub hwaddr: Option<HwAddr>,
    pub client_id: Option<ClientId>,
    /// Seconds the lease stays valid, counted from `cltt`. Zero means the
    /// lease was released.
    pub valid_lft: u32,
    /// Renewal timer, seconds since `cltt`.
    pub t1: u32,
    /// Rebind timer, seconds since `cltt`.
    pub t2: u32,
    /// Client last transmission time, epoch seconds.
    pub cltt: i64,
    pub subnet_id: SubnetId,
    /// Reservation-bound leases survive release and expiry.
    pub fixed: bool,
    pub hostname: CompactString,
    pub fqdn_fwd: bool,
    pub fqdn_rev: bool,
    pub state: LeaseState,
    pub user_context: Option<serde_json::Value>,
}

impl Lease4 {
    pub fn new(addr: Ipv4Addr, subnet_id: SubnetId, valid_lft: u32, cltt: i64) -> Self {
        Lease4 {
            addr,
            hwaddr: None,
            client_id: None,
            valid_lft,
            t1: 0,
            t2: 0,
            cltt,
            subnet_id,
            fixed: false,
            hostname: CompactString::default(),
            fqdn_fwd: false,
            fqdn_rev: false,
            state: LeaseState::Default,
            user_context: None,
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.cltt.saturating_add(i64::from(self.valid_lft))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_lft == 0 || self.expires_at() <= now
    }

    /// True when this lease belongs to the given client. Client-id wins
    /// over the hardware address when both sides carry one.
    pub fn matches_client(&self, client_id: Option<&ClientId>, hwaddr: Option<&HwAddr>) -> bool {
        match (client_id, self.client_id.as_ref()) {
            (Some(theirs), Some(ours)) => return theirs == ours,
            (Some(_), None) | (None, Some(_)) => {}
            (None, None) => {}
        }
        matches!((hwaddr, self.hwaddr.as_ref()), (Some(theirs), Some(ours)) if theirs == ours)
    }

    /// Hostnames are canonicalized to lower case at write time.
    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_ascii_lowercase().to_compact_string();
    }

    pub fn renew(&mut self, now: i64, valid_lft: u32, t1: u32, t2: u32) {
        self.cltt = now;
        self.valid_lft = valid_lft;
        self.t1 = t1;
        self.t2 = t2;
        self.state = LeaseState::Default;
    }

    /// Quarantines the lease after a DHCPDECLINE: client identity is
    /// scrubbed and the lease sits out the probation period before the
    /// reclaimer returns the address to the free pool.
    pub fn decline(&mut self, probation_secs: u32, now: i64) {
        self.hwaddr = None;
        self.client_id = None;
        self.hostname = CompactString::default();
        self.fqdn_fwd = false;
        self.fqdn_rev = false;
        self.t1 = 0;
        self.t2 = 0;
        self.valid_lft = probation_secs;
        self.cltt = now;
        self.state = LeaseState::Declined;
    }

    pub fn release(&mut self, now: i64) {
        self.valid_lft = 0;
        self.cltt = now;
        self.state = LeaseState::ExpiredReclaimed;
    }

    /// Checks the record invariants a store must reject on write.
    pub fn validate(&self) -> Result<()> {
        validate_timers(self.t1, self.t2, self.valid_lft)
    }
}

/// An IPv6 lease: an address (prefix length 128) or a delegated prefix.
/// The `(addr, ty)` pair is the primary key; a PD lease is keyed by its
/// prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease6 {
    pub addr: Ipv6Addr,
    /// 128 for NA/TA leases, the delegated length for PD.
    pub prefix_len: u8,
    pub ty: Lease6Type,
    pub duid: Duid,
    pub iaid: u32,
    pub hwaddr: Option<HwAddr>,
    /// Seconds the address is preferred, counted from `cltt`.
    pub preferred_lft: u32,
    pub valid_lft: u32,
    pub t1: u32,
    pub t2: u32,
    pub cltt: i64,
    pub subnet_id: SubnetId,
    pub fixed: bool,
    pub hostname: CompactString,
    pub fqdn_fwd: bool,
    pub fqdn_rev: bool,
    pub state: LeaseState,
    pub user_context: Option<serde_json::Value>,
}

impl Lease6 {
    pub fn new(
        ty: Lease6Type,
        addr: Ipv6Addr,
        prefix_len: u8,
        duid: Duid,
        iaid: u32,
        subnet_id: SubnetId,
        valid_lft: u32,
        cltt: i64,
    ) -> Self {
        Lease6 {
            addr,
            prefix_len,
            ty,
            duid,
            iaid,
            hwaddr: None,
            preferred_lft: 0,
            valid_lft,
            t1: 0,
            t2: 0,
            cltt,
            subnet_id,
            fixed: false,
            hostname: CompactString::default(),
            fqdn_fwd: false,
            fqdn_rev: false,
            state: LeaseState::Default,
            user_context: None,
        }
    }

    pub fn expires_at(&self) -> i64 {
        self.cltt.saturating_add(i64::from(self.valid_lft))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.valid_lft == 0 || self.expires_at() <= now
    }

    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_ascii_lowercase().to_compact_string();
    }

    pub fn renew(&mut self, now: i64, preferred_lft: u32, valid_lft: u32, t1: u32, t2: u32) {
        self.cltt = now;
        self.preferred_lft = preferred_lft;
        self.valid_lft = valid_lft;
        self.t1 = t1;
        self.t2 = t2;
        self.state = LeaseState::Default;
    }

    pub fn decline(&mut self, probation_secs: u32, now: i64) {
        self.duid = Duid::empty();
        self.hwaddr = None;
        self.hostname = CompactString::default();
        self.fqdn_fwd = false;
        self.fqdn_rev = false;
        self.preferred_lft = 0;
        self.t1 = 0;
        self.t2 = 0;
        self.valid_lft = probation_secs;
        self.cltt = now;
        self.state = LeaseState::Declined;
    }

    pub fn release(&mut self, now: i64) {
        self.valid_lft = 0;
        self.preferred_lft = 0;
        self.cltt = now;
        self.state = LeaseState::ExpiredReclaimed;
    }

    pub fn validate(&self) -> Result<()> {
        match self.ty {
            Lease6Type::Na | Lease6Type::Ta if self.prefix_len != 128 => {
                return Err(Error::BadValue(format!(
                    "address lease {} must have prefix length 128, got {}",
                    self.addr, self.prefix_len
                )));
            }
            Lease6Type::Pd if self.prefix_len >= 128 => {
                return Err(Error::BadValue(format!(
                    "delegated prefix {} must be shorter than 128 bits",
                    self.addr
                )));
            }
            _ => {}
        }
        validate_timers(self.t1, self.t2, self.valid_lft)
    }
}

fn validate_timers(t1: u32, t2: u32, valid_lft: u32) -> Result<()> {
    if t1 == 0 && t2 == 0 {
        return Ok(());
    }
    if t1 <= t2 && t2 <= valid_lft {
        Ok(())
    } else {
        Err(Error::BadValue(format!(
            "timers must satisfy t1 <= t2 <= valid lifetime, got t1={t1} t2={t2} valid={valid_lft}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease4() -> Lease4 {
        Lease4::new(
            Ipv4Addr::new(192, 0, 2, 3),
            SubnetId::from_raw(7),
            3600,
            1_000,
        )
    }

    #[test]
    fn expiry_is_cltt_plus_valid() {
        let lease = lease4();
        assert_eq!(lease.expires_at(), 4_600);
        assert!(!lease.is_expired(4_599));
        assert!(lease.is_expired(4_600));
    }

    #[test]
    fn released_lease_is_expired_immediately() {
        let mut lease = lease4();
        lease.release(2_000);
        assert!(lease.is_expired(2_000));
        assert_eq!(lease.state, LeaseState::ExpiredReclaimed);
    }

    #[test]
    fn timer_ordering_enforced() {
        let mut lease = lease4();
        lease.t1 = 1800;
        lease.t2 = 3100;
        assert!(lease.validate().is_ok());
        lease.t2 = 1700;
        assert!(lease.validate().is_err());
        lease.t1 = 0;
        lease.t2 = 4000;
        assert!(lease.validate().is_err());
    }

    #[test]
    fn decline_scrubs_client_identity() {
        let mut lease = lease4();
        lease.client_id = Some(ClientId::new(vec![1, 2, 3]).unwrap());
        lease.set_hostname("Laptop.Example.ORG");
        lease.decline(86_400, 5_000);
        assert_eq!(lease.state, LeaseState::Declined);
        assert!(lease.client_id.is_none());
        assert!(lease.hwaddr.is_none());
        assert!(lease.hostname.is_empty());
        assert_eq!(lease.valid_lft, 86_400);
        assert_eq!(lease.cltt, 5_000);
    }

    #[test]
    fn hostname_is_lowercased_on_write() {
        let mut lease = lease4();
        lease.set_hostname("Printer-12.Example.ORG");
        assert_eq!(lease.hostname, "printer-12.example.org");
    }

    #[test]
    fn pd_lease_prefix_length_checked() {
        let duid = Duid::new(vec![0xde, 0xad]).unwrap();
        let mut lease = Lease6::new(
            Lease6Type::Pd,
            "2001:db8::".parse().unwrap(),
            56,
            duid.clone(),
            1,
            SubnetId::from_raw(1),
            7200,
            0,
        );
        assert!(lease.validate().is_ok());
        lease.prefix_len = 128;
        assert!(lease.validate().is_err());

        let mut na = Lease6::new(
            Lease6Type::Na,
            "2001:db8::1".parse().unwrap(),
            128,
            duid,
            1,
            SubnetId::from_raw(1),
            7200,
            0,
        );
        assert!(na.validate().is_ok());
        na.prefix_len = 64;
        assert!(na.validate().is_err());
    }
}
