//! Persistent configuration entities.
//!
//! Every entity embeds a [`StampedInfo`]: the instant it was last modified
//! and the server tags it applies to. Backends own the stamp; they assign
//! it on upsert from the write selector and the audit clock.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::stamped::StampedValue;
use crate::{Error, Result, SubnetId};

/// Modification stamp plus server-tag scope, carried by every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedInfo {
    pub modified_at: DateTime<Utc>,
    pub server_tags: BTreeSet<CompactString>,
}

impl StampedInfo {
    pub fn tags_intersect(&self, other: &StampedInfo) -> bool {
        self.server_tags
            .iter()
            .any(|t| other.server_tags.contains(t))
            || self.server_tags.contains(super::ALL_TAG)
            || other.server_tags.contains(super::ALL_TAG)
    }
}

impl Default for StampedInfo {
    fn default() -> Self {
        StampedInfo {
            modified_at: Utc::now(),
            server_tags: BTreeSet::new(),
        }
    }
}

/// Access to the embedded stamp, used by the backends' generic plumbing.
pub trait Stamped {
    fn stamp(&self) -> &StampedInfo;
    fn stamp_mut(&mut self) -> &mut StampedInfo;
    /// Invoked after a backend assigns a fresh stamp; entities that mirror
    /// the modification instant internally sync themselves here.
    fn stamp_applied(&mut self) {}
}

macro_rules! impl_stamped {
    ($($ty:ty),+) => {$(
        impl Stamped for $ty {
            fn stamp(&self) -> &StampedInfo {
                &self.stamp
            }
            fn stamp_mut(&mut self) -> &mut StampedInfo {
                &mut self.stamp
            }
        }
    )+};
}

/// How the allocator walks a pool looking for a free address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickerKind {
    /// Walk the pool in address order, resuming where the last allocation
    /// left off.
    #[default]
    Iterative,
    Random,
    /// Derive the starting probe from a hash of the client identifier, so
    /// a returning client tends to land on the same address.
    Hashed,
}

/// A contiguous IPv4 address range inside a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool4 {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
}

impl Pool4 {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(Error::BadValue(format!(
                "pool start {start} is above pool end {end}"
            )));
        }
        Ok(Pool4 {
            start,
            end,
            client_class: None,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn overlaps(&self, other: &Pool4) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A contiguous IPv6 address range inside a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool6 {
    pub start: Ipv6Addr,
    pub end: Ipv6Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
}

impl Pool6 {
    pub fn new(start: Ipv6Addr, end: Ipv6Addr) -> Result<Self> {
        if start > end {
            return Err(Error::BadValue(format!(
                "pool start {start} is above pool end {end}"
            )));
        }
        Ok(Pool6 {
            start,
            end,
            client_class: None,
        })
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        self.start <= addr && addr <= self.end
    }

    pub fn size(&self) -> u128 {
        u128::from(self.end) - u128::from(self.start) + 1
    }

    pub fn overlaps(&self, other: &Pool6) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// A prefix-delegation pool: whole `delegated_len` prefixes are carved out
/// of `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdPool {
    pub prefix: Ipv6Net,
    pub delegated_len: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
}

impl PdPool {
    pub fn new(prefix: Ipv6Net, delegated_len: u8) -> Result<Self> {
        if delegated_len < prefix.prefix_len() || delegated_len > 127 {
            return Err(Error::BadValue(format!(
                "delegated length {delegated_len} out of range for pd-pool {prefix}"
            )));
        }
        Ok(PdPool {
            prefix,
            delegated_len,
            client_class: None,
        })
    }

    /// Number of delegable prefixes, saturating for absurdly wide pools.
    pub fn size(&self) -> u128 {
        let bits = u32::from(self.delegated_len - self.prefix.prefix_len());
        1u128.checked_shl(bits).unwrap_or(u128::MAX)
    }

    /// The `index`-th delegable prefix inside the pool.
    pub fn prefix_at(&self, index: u128) -> Option<Ipv6Net> {
        if index >= self.size() {
            return None;
        }
        let step = 1u128 << (128 - u32::from(self.delegated_len));
        let base = u128::from(self.prefix.network());
        let addr = Ipv6Addr::from(base + index * step);
        Ipv6Net::new(addr, self.delegated_len).ok()
    }

    pub fn contains(&self, prefix: Ipv6Addr, len: u8) -> bool {
        len == self.delegated_len && self.prefix.contains(&prefix)
    }
}

/// An IPv4 subnet: prefix, pools and the per-subnet allocation
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet4 {
    pub id: SubnetId,
    pub prefix: Ipv4Net,
    pub pools: Vec<Pool4>,
    /// Name of the shared network this subnet belongs to, if any. A subnet
    /// belongs to at most one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_network: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
    pub valid_lft: u32,
    pub t1: u32,
    pub t2: u32,
    #[serde(default)]
    pub picker: PickerKind,
    /// Overrides the engine-wide allocation retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl Subnet4 {
    pub fn new(id: SubnetId, prefix: Ipv4Net, valid_lft: u32) -> Self {
        Subnet4 {
            id,
            prefix,
            pools: Vec::new(),
            shared_network: None,
            client_class: None,
            valid_lft,
            t1: valid_lft / 2,
            t2: valid_lft * 7 / 8,
            picker: PickerKind::default(),
            max_retries: None,
            stamp: StampedInfo::default(),
        }
    }

    /// Pools must sit inside the prefix and be pairwise disjoint.
    pub fn validate(&self) -> Result<()> {
        for pool in &self.pools {
            if !self.prefix.contains(&pool.start) || !self.prefix.contains(&pool.end) {
                return Err(Error::BadValue(format!(
                    "pool {}-{} extends beyond subnet prefix {}",
                    pool.start, pool.end, self.prefix
                )));
            }
        }
        for (i, a) in self.pools.iter().enumerate() {
            for b in &self.pools[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::BadValue(format!(
                        "pools {}-{} and {}-{} overlap in subnet {}",
                        a.start, a.end, b.start, b.end, self.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn in_pool(&self, addr: Ipv4Addr) -> bool {
        self.pools.iter().any(|p| p.contains(addr))
    }
}

/// An IPv6 subnet with address pools and prefix-delegation pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet6 {
    pub id: SubnetId,
    pub prefix: Ipv6Net,
    pub pools: Vec<Pool6>,
    pub pd_pools: Vec<PdPool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_network: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
    pub preferred_lft: u32,
    pub valid_lft: u32,
    pub t1: u32,
    pub t2: u32,
    #[serde(default)]
    pub picker: PickerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl Subnet6 {
    pub fn new(id: SubnetId, prefix: Ipv6Net, valid_lft: u32) -> Self {
        Subnet6 {
            id,
            prefix,
            pools: Vec::new(),
            pd_pools: Vec::new(),
            shared_network: None,
            client_class: None,
            preferred_lft: valid_lft / 2,
            valid_lft,
            t1: valid_lft / 4,
            t2: valid_lft * 2 / 5,
            picker: PickerKind::default(),
            max_retries: None,
            stamp: StampedInfo::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for pool in &self.pools {
            if !self.prefix.contains(&pool.start) || !self.prefix.contains(&pool.end) {
                return Err(Error::BadValue(format!(
                    "pool {}-{} extends beyond subnet prefix {}",
                    pool.start, pool.end, self.prefix
                )));
            }
        }
        for (i, a) in self.pools.iter().enumerate() {
            for b in &self.pools[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::BadValue(format!(
                        "pools {}-{} and {}-{} overlap in subnet {}",
                        a.start, a.end, b.start, b.end, self.id
                    )));
                }
            }
        }
        for pd in &self.pd_pools {
            // pd-pool prefixes commonly sit outside the subnet prefix, but
            // the delegated length still has to be coherent
            PdPool::new(pd.prefix, pd.delegated_len)?;
        }
        Ok(())
    }

    pub fn in_pool(&self, addr: Ipv6Addr) -> bool {
        self.pools.iter().any(|p| p.contains(addr))
    }

    pub fn in_pd_pool(&self, prefix: Ipv6Addr, len: u8) -> bool {
        self.pd_pools.iter().any(|p| p.contains(prefix, len))
    }
}

/// A set of subnets treated as one allocation pool. Subnets reference the
/// network by name; membership lives on the subnet side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedNetwork4 {
    pub name: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_lft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<u32>,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl SharedNetwork4 {
    pub fn new(name: impl Into<CompactString>) -> Self {
        SharedNetwork4 {
            name: name.into(),
            client_class: None,
            valid_lft: None,
            t1: None,
            t2: None,
            stamp: StampedInfo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedNetwork6 {
    pub name: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_class: Option<CompactString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_lft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_lft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<u32>,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl SharedNetwork6 {
    pub fn new(name: impl Into<CompactString>) -> Self {
        SharedNetwork6 {
            name: name.into(),
            client_class: None,
            preferred_lft: None,
            valid_lft: None,
            t1: None,
            t2: None,
            stamp: StampedInfo::default(),
        }
    }
}

/// Codes below this value are standard options whose definitions ship
/// with the server; custom definitions may not shadow them.
pub const FIRST_CUSTOM_OPTION_CODE: u16 = 224;

/// The spaces holding standard top-level options.
pub const STANDARD_SPACES: &[&str] = &["dhcp4", "dhcp6"];

/// Shape of a custom option: code, space, payload type and layout flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDefinition {
    pub code: u16,
    pub space: CompactString,
    pub name: CompactString,
    /// Payload type, e.g. `uint32`, `string`, `record`.
    pub data_type: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encapsulated_space: Option<CompactString>,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl OptionDefinition {
    /// Custom definitions in the standard spaces may only use codes above
    /// the standard range.
    pub fn validate(&self) -> Result<()> {
        if STANDARD_SPACES.contains(&self.space.as_str())
            && self.code < FIRST_CUSTOM_OPTION_CODE
        {
            return Err(Error::BadValue(format!(
                "code {} in space `{}` is inside the standard option range",
                self.code, self.space
            )));
        }
        Ok(())
    }
}

/// One configured option instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub code: u16,
    pub space: CompactString,
    /// The option payload in its text form.
    pub value: CompactString,
    /// Whether the option is always sent, even unrequested.
    pub persistent: bool,
    /// A cancelled option suppresses a same-code option inherited from a
    /// wider scope.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub stamp: StampedInfo,
}

/// Where an option instance attaches. No two scopes share a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "scope")]
pub enum OptionScope {
    Global,
    SharedNetwork { name: CompactString },
    Subnet { subnet_id: SubnetId },
    Pool {
        start: std::net::IpAddr,
        end: std::net::IpAddr,
    },
    PdPool { prefix: Ipv6Net },
}

impl fmt::Display for OptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionScope::Global => f.write_str("global"),
            OptionScope::SharedNetwork { name } => write!(f, "shared-network:{name}"),
            OptionScope::Subnet { subnet_id } => write!(f, "subnet:{subnet_id}"),
            OptionScope::Pool { start, end } => write!(f, "pool:{start}-{end}"),
            OptionScope::PdPool { prefix } => write!(f, "pd-pool:{prefix}"),
        }
    }
}

/// A named global parameter: a stamped primitive plus its server scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalParameter {
    pub value: StampedValue,
    #[serde(default)]
    pub stamp: StampedInfo,
}

impl GlobalParameter {
    pub fn new(value: StampedValue) -> Self {
        GlobalParameter {
            value,
            stamp: StampedInfo::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.value.name()
    }
}

impl_stamped!(
    Subnet4,
    Subnet6,
    SharedNetwork4,
    SharedNetwork6,
    OptionDefinition,
    OptionDescriptor
);

impl Stamped for GlobalParameter {
    fn stamp(&self) -> &StampedInfo {
        &self.stamp
    }
    fn stamp_mut(&mut self) -> &mut StampedInfo {
        &mut self.stamp
    }
    fn stamp_applied(&mut self) {
        self.value.set_modified_at(self.stamp.modified_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bounds_checked() {
        assert!(Pool4::new(Ipv4Addr::new(192, 0, 2, 6), Ipv4Addr::new(192, 0, 2, 2)).is_err());
        let pool = Pool4::new(Ipv4Addr::new(192, 0, 2, 2), Ipv4Addr::new(192, 0, 2, 6)).unwrap();
        assert_eq!(pool.size(), 5);
        assert!(pool.contains(Ipv4Addr::new(192, 0, 2, 4)));
        assert!(!pool.contains(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[test]
    fn subnet_rejects_pool_outside_prefix() {
        let mut subnet = Subnet4::new(
            SubnetId::from_raw(1),
            "192.0.2.0/29".parse().unwrap(),
            3600,
        );
        subnet.pools.push(
            Pool4::new(Ipv4Addr::new(192, 0, 2, 2), Ipv4Addr::new(192, 0, 2, 6)).unwrap(),
        );
        assert!(subnet.validate().is_ok());

        subnet.pools.push(
            Pool4::new(Ipv4Addr::new(192, 0, 2, 8), Ipv4Addr::new(192, 0, 2, 9)).unwrap(),
        );
        assert!(subnet.validate().is_err());
    }

    #[test]
    fn subnet_rejects_overlapping_pools() {
        let mut subnet = Subnet4::new(
            SubnetId::from_raw(1),
            "10.0.0.0/24".parse().unwrap(),
            3600,
        );
        subnet.pools.push(
            Pool4::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 50)).unwrap(),
        );
        subnet.pools.push(
            Pool4::new(Ipv4Addr::new(10, 0, 0, 40), Ipv4Addr::new(10, 0, 0, 60)).unwrap(),
        );
        assert!(subnet.validate().is_err());
    }

    #[test]
    fn pd_pool_prefix_enumeration() {
        let pool = PdPool::new("2001:db8::/48".parse().unwrap(), 56).unwrap();
        assert_eq!(pool.size(), 256);
        assert_eq!(
            pool.prefix_at(0).unwrap(),
            "2001:db8::/56".parse::<Ipv6Net>().unwrap()
        );
        assert_eq!(
            pool.prefix_at(1).unwrap(),
            "2001:db8:0:100::/56".parse::<Ipv6Net>().unwrap()
        );
        assert!(pool.prefix_at(256).is_none());
        assert!(pool.contains("2001:db8:0:ff00::".parse().unwrap(), 56));
        assert!(!pool.contains("2001:db8:1::".parse().unwrap(), 56));
    }

    #[test]
    fn standard_option_codes_protected() {
        let mut def = OptionDefinition {
            code: 5,
            space: "dhcp4".into(),
            name: "custom".into(),
            data_type: "uint32".into(),
            encapsulated_space: None,
            is_array: false,
            stamp: StampedInfo::default(),
        };
        assert!(def.validate().is_err());
        def.code = 230;
        assert!(def.validate().is_ok());
        def.code = 5;
        def.space = "vendor-4491".into();
        assert!(def.validate().is_ok());
    }

    #[test]
    fn option_scope_display_keys_are_distinct() {
        let scopes = [
            OptionScope::Global,
            OptionScope::SharedNetwork { name: "floor-2".into() },
            OptionScope::Subnet { subnet_id: SubnetId::from_raw(7) },
            OptionScope::Pool {
                start: "192.0.2.2".parse().unwrap(),
                end: "192.0.2.6".parse().unwrap(),
            },
            OptionScope::PdPool { prefix: "2001:db8::/56".parse().unwrap() },
        ];
        let keys: std::collections::BTreeSet<String> =
            scopes.iter().map(ToString::to_string).collect();
        assert_eq!(keys.len(), scopes.len());
    }
}
