//! shadowlease - lease allocation and configuration persistence engine for
//! DHCPv4/DHCPv6 servers.
//!
//! The crate is the storage and allocation core of a DHCP server: packet
//! parsing, option rendering and the command channel live upstream and talk
//! to this crate through plain Rust types.
//!
//! * [`leasedb`] - the lease store contract and its in-memory, SQLite and
//!   wide-column backends
//! * [`configdb`] - persistent server configuration (subnets, shared
//!   networks, option definitions, options, global parameters) scoped by
//!   server selector, with an audit log
//! * [`snapshot`] - immutable resolved configuration views published with a
//!   single pointer swap, rebuilt by tailing the audit log
//! * [`alloc`] - the allocation engine that turns a client request plus the
//!   current snapshot into a committed lease
//! * [`reclaim`] - the expired-lease reclamation pass

use std::fmt;

use advmac::MacAddr6;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod alloc;
pub mod configdb;
pub mod error;
pub mod lease;
pub mod leasedb;
pub mod logging;
pub mod reclaim;
pub mod reservations;
pub mod snapshot;
pub mod stamped;
pub mod threading;

pub use error::{Error, Result};
pub use lease::{Lease4, Lease6, Lease6Type, LeaseState};

/// Unique subnet identifier within one server configuration. Zero is
/// reserved and never names a real subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(u32);

impl SubnetId {
    pub fn new(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(Error::BadValue("subnet id 0 is reserved".into()));
        }
        Ok(SubnetId(id))
    }

    /// Bypasses the zero check for trusted values such as rows read back
    /// from a backend.
    pub const fn from_raw(id: u32) -> Self {
        SubnetId(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DHCPv4 client identifier (option 61), 2-255 opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Vec<u8>);

impl ClientId {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 2 || data.len() > 255 {
            return Err(Error::BadValue(format!(
                "client id must be 2-255 bytes, got {}",
                data.len()
            )));
        }
        Ok(ClientId(data))
    }

    /// The common hardware-address form: type 01 followed by the MAC.
    pub fn from_mac(mac: MacAddr6) -> Self {
        let mut data = Vec::with_capacity(7);
        data.push(0x01);
        data.extend_from_slice(&mac.to_array());
        ClientId(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_colon_hex(f, &self.0)
    }
}

/// Client hardware address: a type tag (1 = Ethernet) plus 1-20 bytes of
/// address data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HwAddr {
    htype: u8,
    data: Vec<u8>,
}

impl HwAddr {
    pub const HTYPE_ETHER: u8 = 1;

    pub fn new(htype: u8, data: Vec<u8>) -> Result<Self> {
        if data.is_empty() || data.len() > 20 {
            return Err(Error::BadValue(format!(
                "hardware address must be 1-20 bytes, got {}",
                data.len()
            )));
        }
        Ok(HwAddr { htype, data })
    }

    pub fn htype(&self) -> u8 {
        self.htype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl From<MacAddr6> for HwAddr {
    fn from(mac: MacAddr6) -> Self {
        HwAddr {
            htype: HwAddr::HTYPE_ETHER,
            data: mac.to_array().to_vec(),
        }
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_colon_hex(f, &self.data)
    }
}

/// DHCPv6 unique identifier, 1-128 opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Duid(Vec<u8>);

impl Duid {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() || data.len() > 128 {
            return Err(Error::BadValue(format!(
                "duid must be 1-128 bytes, got {}",
                data.len()
            )));
        }
        Ok(Duid(data))
    }

    /// The one-byte zero DUID used after a lease is declined and its
    /// client identity scrubbed.
    pub fn empty() -> Self {
        Duid(vec![0])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_colon_hex(f, &self.0)
    }
}

/// On-disk schema version of a backend. Opening fails when the stored
/// major differs from the one the code was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        SchemaVersion { major, minor }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn write_colon_hex(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            write!(f, ":")?;
        }
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Parses `00:11:22` / `00-11-22` style hex strings, as used by
/// reservation files and test fixtures.
pub(crate) fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    s.split(|c| c == ':' || c == '-')
        .map(|part| {
            u8::from_str_radix(part, 16)
                .map_err(|_| Error::BadValue(format!("invalid hex byte `{part}` in `{s}`")))
        })
        .collect()
}

macro_rules! hex_string_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let bytes = parse_hex_bytes(&s).map_err(de::Error::custom)?;
                $ty::new(bytes).map_err(de::Error::custom)
            }
        }
    };
}

hex_string_serde!(ClientId);
hex_string_serde!(Duid);

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = parse_hex_bytes(&s).map_err(de::Error::custom)?;
        HwAddr::new(HwAddr::HTYPE_ETHER, bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_id_zero_is_reserved() {
        assert!(SubnetId::new(0).is_err());
        assert_eq!(SubnetId::new(7).unwrap().get(), 7);
    }

    #[test]
    fn client_id_length_bounds() {
        assert!(ClientId::new(vec![0x01]).is_err());
        assert!(ClientId::new(vec![0u8; 256]).is_err());
        let cid = ClientId::new(vec![0x01, 0x02, 0x03]).unwrap();
        assert_eq!(cid.to_string(), "01:02:03");
    }

    #[test]
    fn client_id_from_mac() {
        let mac: MacAddr6 = "00:11:22:33:44:55".parse().unwrap();
        let cid = ClientId::from_mac(mac);
        assert_eq!(cid.as_bytes(), &[0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn hwaddr_display_and_serde() {
        let hw: HwAddr = serde_json::from_str(r#""00-11-22-33-44-55""#).unwrap();
        assert_eq!(hw.htype(), HwAddr::HTYPE_ETHER);
        assert_eq!(hw.to_string(), "00:11:22:33:44:55");
        assert_eq!(serde_json::to_string(&hw).unwrap(), r#""00:11:22:33:44:55""#);
    }

    #[test]
    fn duid_length_bounds() {
        assert!(Duid::new(vec![]).is_err());
        assert!(Duid::new(vec![0u8; 129]).is_err());
        assert!(Duid::new(vec![0xde, 0xad]).is_ok());
    }
}
