//! Host reservations consulted by the allocation engine.
//!
//! A reservation pins a client, identified by hardware address, client-id
//! or DUID, to fixed addresses inside one subnet. The database is a set of
//! concurrent maps so lookups on the packet path never block behind a
//! writer.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use crate::{ClientId, Duid, HwAddr, SubnetId};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ReservationKey {
    Hw(HwAddr),
    ClientId(ClientId),
    Duid(Duid),
}

/// Fixed addresses for one client in one subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub subnet_id: SubnetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_na: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_pd: Option<Ipv6Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwaddr: Option<HwAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duid: Option<Duid>,
}

impl Reservation {
    fn keys(&self) -> impl Iterator<Item = ReservationKey> + '_ {
        self.hwaddr
            .clone()
            .map(ReservationKey::Hw)
            .into_iter()
            .chain(self.client_id.clone().map(ReservationKey::ClientId))
            .chain(self.duid.clone().map(ReservationKey::Duid))
    }
}

pub struct ReservationDb {
    by_key: DashMap<(SubnetId, ReservationKey), Arc<Reservation>>,
    by_addr4: DashMap<Ipv4Addr, Arc<Reservation>>,
    by_addr6: DashMap<Ipv6Addr, Arc<Reservation>>,
}

impl ReservationDb {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_addr4: DashMap::new(),
            by_addr6: DashMap::new(),
        }
    }

    pub fn insert(&self, reservation: Reservation) {
        let stored = Arc::new(reservation);

        for key in stored.keys() {
            self.by_key
                .insert((stored.subnet_id, key), Arc::clone(&stored));
        }
        if let Some(addr) = stored.ipv4 {
            self.by_addr4.insert(addr, Arc::clone(&stored));
        }
        if let Some(addr) = stored.ipv6_na {
            self.by_addr6.insert(addr, Arc::clone(&stored));
        }
    }

    pub fn load(&self, reservations: Vec<Reservation>) {
        for reservation in reservations {
            self.insert(reservation);
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn by_hwaddr(&self, subnet_id: SubnetId, hw: &HwAddr) -> Option<Arc<Reservation>> {
        self.by_key
            .get(&(subnet_id, ReservationKey::Hw(hw.clone())))
            .map(|r| Arc::clone(r.value()))
    }

    pub fn by_client_id(&self, subnet_id: SubnetId, id: &ClientId) -> Option<Arc<Reservation>> {
        self.by_key
            .get(&(subnet_id, ReservationKey::ClientId(id.clone())))
            .map(|r| Arc::clone(r.value()))
    }

    pub fn by_duid(&self, subnet_id: SubnetId, duid: &Duid) -> Option<Arc<Reservation>> {
        self.by_key
            .get(&(subnet_id, ReservationKey::Duid(duid.clone())))
            .map(|r| Arc::clone(r.value()))
    }

    /// The reservation holding this IPv4 address, if any. The allocator
    /// skips dynamically picking an address that is promised to someone
    /// else.
    pub fn holder_of4(&self, addr: Ipv4Addr) -> Option<Arc<Reservation>> {
        self.by_addr4.get(&addr).map(|r| Arc::clone(r.value()))
    }

    pub fn holder_of6(&self, addr: Ipv6Addr) -> Option<Arc<Reservation>> {
        self.by_addr6.get(&addr).map(|r| Arc::clone(r.value()))
    }
}

impl Default for ReservationDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advmac::MacAddr6;

    #[test]
    fn reservation_lookups() {
        let db = ReservationDb::new();

        let json_str = r#"
        [
            {
                "subnet_id": 1,
                "ipv4": "192.168.1.109",
                "ipv6_na": "2001:db8:1:2::1",
                "ipv6_pd": "2001:db8:1:3::/56",
                "hwaddr": "00-11-22-33-44-55"
            },
            {
                "subnet_id": 1,
                "ipv4": "192.168.1.112",
                "duid": "00:11:22:33:44:55:66",
                "hostname": "printer-9"
            },
            {
                "subnet_id": 2,
                "ipv4": "10.0.9.20",
                "client_id": "01:00:11:22:33:44:57"
            }
        ]
        "#;
        let reservations: Vec<Reservation> = serde_json::from_str(json_str).unwrap();
        db.load(reservations);

        let subnet1 = SubnetId::from_raw(1);
        let subnet2 = SubnetId::from_raw(2);

        let mac: MacAddr6 = "00:11:22:33:44:55".parse().unwrap();
        let hw = HwAddr::from(mac);
        assert_eq!(
            db.by_hwaddr(subnet1, &hw).unwrap().ipv4,
            Some(Ipv4Addr::new(192, 168, 1, 109))
        );
        // same key, wrong subnet
        assert!(db.by_hwaddr(subnet2, &hw).is_none());

        let duid = Duid::new(vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]).unwrap();
        let by_duid = db.by_duid(subnet1, &duid).unwrap();
        assert_eq!(by_duid.ipv4, Some(Ipv4Addr::new(192, 168, 1, 112)));
        assert_eq!(by_duid.hostname.as_deref(), Some("printer-9"));

        let cid = ClientId::new(vec![0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x57]).unwrap();
        assert_eq!(
            db.by_client_id(subnet2, &cid).unwrap().ipv4,
            Some(Ipv4Addr::new(10, 0, 9, 20))
        );

        assert!(db.holder_of4(Ipv4Addr::new(192, 168, 1, 109)).is_some());
        assert!(db.holder_of4(Ipv4Addr::new(192, 168, 1, 1)).is_none());
        assert!(db.holder_of6("2001:db8:1:2::1".parse().unwrap()).is_some());
    }
}
