//! ClickHouse-backed lease store.
//!
//! Deployments that already ship DHCP analytics into a ClickHouse cluster
//! can keep leases there too. Lease tables use `ReplacingMergeTree` keyed
//! by the lease primary key and every read selects with `FINAL`, so the
//! latest written image wins. The client is async; the store owns a small
//! current-thread runtime and exposes the same blocking contract as the
//! other backends.

use std::net::{Ipv4Addr, Ipv6Addr};

use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{check_max, LeaseStore, LEASE_SCHEMA_VERSION};
use crate::{
    ClientId, Duid, Error, HwAddr, Lease4, Lease6, Lease6Type, LeaseState, Result, SchemaVersion,
    SubnetId,
};

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        major UInt32,
        minor UInt32
    ) ENGINE = TinyLog",
    "CREATE TABLE IF NOT EXISTS lease4 (
        address UInt32,
        hwtype UInt8,
        hwaddr String,
        client_id String,
        valid_lft UInt32,
        t1 UInt32,
        t2 UInt32,
        cltt Int64,
        subnet_id UInt32,
        fixed UInt8,
        hostname String,
        fqdn_fwd UInt8,
        fqdn_rev UInt8,
        state UInt8,
        user_context String,
        version UInt64
    ) ENGINE = ReplacingMergeTree(version) ORDER BY address",
    "CREATE TABLE IF NOT EXISTS lease6 (
        address String,
        lease_type UInt8,
        prefix_len UInt8,
        duid String,
        iaid UInt32,
        hwtype UInt8,
        hwaddr String,
        preferred_lft UInt32,
        valid_lft UInt32,
        t1 UInt32,
        t2 UInt32,
        cltt Int64,
        subnet_id UInt32,
        fixed UInt8,
        hostname String,
        fqdn_fwd UInt8,
        fqdn_rev UInt8,
        state UInt8,
        user_context String,
        version UInt64
    ) ENGINE = ReplacingMergeTree(version) ORDER BY (address, lease_type)",
];

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
struct VersionRow {
    major: u32,
    minor: u32,
}

// Wide-column rows flatten optional fields to empty-string/zero sentinels;
// a hardware address is absent when `hwaddr` is empty.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
struct Lease4Row {
    address: u32,
    hwtype: u8,
    hwaddr: String,
    client_id: String,
    valid_lft: u32,
    t1: u32,
    t2: u32,
    cltt: i64,
    subnet_id: u32,
    fixed: u8,
    hostname: String,
    fqdn_fwd: u8,
    fqdn_rev: u8,
    state: u8,
    user_context: String,
    version: u64,
}

impl Lease4Row {
    fn from_lease(lease: &Lease4, version: u64) -> Result<Self> {
        let user_context = lease
            .user_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        Ok(Lease4Row {
            address: u32::from(lease.addr),
            hwtype: lease.hwaddr.as_ref().map(HwAddr::htype).unwrap_or(0),
            hwaddr: lease
                .hwaddr
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            client_id: lease
                .client_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            valid_lft: lease.valid_lft,
            t1: lease.t1,
            t2: lease.t2,
            cltt: lease.cltt,
            subnet_id: lease.subnet_id.get(),
            fixed: lease.fixed as u8,
            hostname: lease.hostname.to_string(),
            fqdn_fwd: lease.fqdn_fwd as u8,
            fqdn_rev: lease.fqdn_rev as u8,
            state: lease.state.as_u8(),
            user_context,
            version,
        })
    }

    fn into_lease(self) -> Result<Lease4> {
        let hwaddr = if self.hwaddr.is_empty() {
            None
        } else {
            Some(HwAddr::new(self.hwtype, crate::parse_hex_bytes(&self.hwaddr)?)?)
        };
        let client_id = if self.client_id.is_empty() {
            None
        } else {
            Some(ClientId::new(crate::parse_hex_bytes(&self.client_id)?)?)
        };
        let user_context = if self.user_context.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&self.user_context)?)
        };
        Ok(Lease4 {
            addr: Ipv4Addr::from(self.address),
            hwaddr,
            client_id,
            valid_lft: self.valid_lft,
            t1: self.t1,
            t2: self.t2,
            cltt: self.cltt,
            subnet_id: SubnetId::from_raw(self.subnet_id),
            fixed: self.fixed != 0,
            hostname: self.hostname.into(),
            fqdn_fwd: self.fqdn_fwd != 0,
            fqdn_rev: self.fqdn_rev != 0,
            state: LeaseState::from_u8(self.state)?,
            user_context,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
struct Lease6Row {
    address: String,
    lease_type: u8,
    prefix_len: u8,
    duid: String,
    iaid: u32,
    hwtype: u8,
    hwaddr: String,
    preferred_lft: u32,
    valid_lft: u32,
    t1: u32,
    t2: u32,
    cltt: i64,
    subnet_id: u32,
    fixed: u8,
    hostname: String,
    fqdn_fwd: u8,
    fqdn_rev: u8,
    state: u8,
    user_context: String,
    version: u64,
}

impl Lease6Row {
    fn from_lease(lease: &Lease6, version: u64) -> Result<Self> {
        let user_context = lease
            .user_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();
        Ok(Lease6Row {
            address: lease.addr.to_string(),
            lease_type: lease.ty.as_u8(),
            prefix_len: lease.prefix_len,
            duid: lease.duid.to_string(),
            iaid: lease.iaid,
            hwtype: lease.hwaddr.as_ref().map(HwAddr::htype).unwrap_or(0),
            hwaddr: lease
                .hwaddr
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            preferred_lft: lease.preferred_lft,
            valid_lft: lease.valid_lft,
            t1: lease.t1,
            t2: lease.t2,
            cltt: lease.cltt,
            subnet_id: lease.subnet_id.get(),
            fixed: lease.fixed as u8,
            hostname: lease.hostname.to_string(),
            fqdn_fwd: lease.fqdn_fwd as u8,
            fqdn_rev: lease.fqdn_rev as u8,
            state: lease.state.as_u8(),
            user_context,
            version,
        })
    }

    fn into_lease(self) -> Result<Lease6> {
        let addr: Ipv6Addr = self
            .address
            .parse()
            .map_err(|_| Error::BadValue(format!("corrupt lease6 address `{}`", self.address)))?;
        let hwaddr = if self.hwaddr.is_empty() {
            None
        } else {
            Some(HwAddr::new(self.hwtype, crate::parse_hex_bytes(&self.hwaddr)?)?)
        };
        let user_context = if self.user_context.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&self.user_context)?)
        };
        Ok(Lease6 {
            addr,
            prefix_len: self.prefix_len,
            ty: Lease6Type::from_u8(self.lease_type)?,
            duid: Duid::new(crate::parse_hex_bytes(&self.duid)?)?,
            iaid: self.iaid,
            hwaddr,
            preferred_lft: self.preferred_lft,
            valid_lft: self.valid_lft,
            t1: self.t1,
            t2: self.t2,
            cltt: self.cltt,
            subnet_id: SubnetId::from_raw(self.subnet_id),
            fixed: self.fixed != 0,
            hostname: self.hostname.into(),
            fqdn_fwd: self.fqdn_fwd != 0,
            fqdn_rev: self.fqdn_rev != 0,
            state: LeaseState::from_u8(self.state)?,
            user_context,
        })
    }
}

pub struct WideLeaseStore {
    client: Client,
    runtime: tokio::runtime::Runtime,
    version_counter: std::sync::atomic::AtomicU64,
}

impl WideLeaseStore {
    /// Connects, creates the lease tables when missing and verifies the
    /// stored schema major.
    pub fn connect(url: &str, database: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::DbOperation(e.to_string()))?;
        let client = Client::default().with_url(url).with_database(database);
        let store = WideLeaseStore {
            client,
            runtime,
            version_counter: std::sync::atomic::AtomicU64::new(1),
        };
        store.init_schema()?;
        info!(url, database, "opened clickhouse lease database");
        Ok(store)
    }

    fn block_on<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, clickhouse::error::Error>>,
    {
        self.runtime
            .block_on(fut)
            .map_err(|e| Error::DbOperation(e.to_string()))
    }

    fn next_version(&self) -> u64 {
        self.version_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn init_schema(&self) -> Result<()> {
        for ddl in DDL {
            self.block_on(self.client.query(ddl).execute())?;
        }
        let stored: Option<VersionRow> = self.block_on(
            self.client
                .query("SELECT ?fields FROM schema_version LIMIT 1")
                .fetch_optional::<VersionRow>(),
        )?;
        match stored {
            None => {
                let row = VersionRow {
                    major: LEASE_SCHEMA_VERSION.major,
                    minor: LEASE_SCHEMA_VERSION.minor,
                };
                self.block_on(async {
                    let mut insert = self.client.insert("schema_version")?;
                    insert.write(&row).await?;
                    insert.end().await
                })?;
                Ok(())
            }
            Some(row) if row.major == LEASE_SCHEMA_VERSION.major => Ok(()),
            Some(row) => Err(Error::DbIncompatible {
                found: SchemaVersion::new(row.major, row.minor),
                expected_major: LEASE_SCHEMA_VERSION.major,
            }),
        }
    }

    fn fetch4(&self, where_clause: &str, bind: impl FnOnce(clickhouse::query::Query) -> clickhouse::query::Query) -> Result<Vec<Lease4>> {
        let query = self
            .client
            .query(&format!("SELECT ?fields FROM lease4 FINAL {where_clause}"));
        let rows: Vec<Lease4Row> = self.block_on(bind(query).fetch_all::<Lease4Row>())?;
        rows.into_iter().map(Lease4Row::into_lease).collect()
    }

    fn fetch6(&self, where_clause: &str, bind: impl FnOnce(clickhouse::query::Query) -> clickhouse::query::Query) -> Result<Vec<Lease6>> {
        let query = self
            .client
            .query(&format!("SELECT ?fields FROM lease6 FINAL {where_clause}"));
        let rows: Vec<Lease6Row> = self.block_on(bind(query).fetch_all::<Lease6Row>())?;
        rows.into_iter().map(Lease6Row::into_lease).collect()
    }

    fn write4(&self, lease: &Lease4) -> Result<()> {
        let row = Lease4Row::from_lease(lease, self.next_version())?;
        self.block_on(async {
            let mut insert = self.client.insert("lease4")?;
            insert.write(&row).await?;
            insert.end().await
        })
    }

    fn write6(&self, lease: &Lease6) -> Result<()> {
        let row = Lease6Row::from_lease(lease, self.next_version())?;
        self.block_on(async {
            let mut insert = self.client.insert("lease6")?;
            insert.write(&row).await?;
            insert.end().await
        })
    }
}

impl LeaseStore for WideLeaseStore {
    fn add_lease4(&self, lease: Lease4) -> Result<bool> {
        lease.validate()?;
        // Uniqueness relies on the single-writer discipline of the engine's
        // per-subnet critical section plus the ReplacingMergeTree key; a
        // racing insert of the same address resolves to the newest version.
        let existing = self.lease4_by_addr(lease.addr)?;
        if matches!(existing, Some(l) if l.state != LeaseState::ExpiredReclaimed) {
            return Ok(false);
        }
        self.write4(&lease)?;
        Ok(true)
    }

    fn lease4_by_addr(&self, addr: Ipv4Addr) -> Result<Option<Lease4>> {
        Ok(self
            .fetch4("WHERE address = ?", |q| q.bind(u32::from(addr)))?
            .into_iter()
            .next())
    }

    fn leases4_by_hwaddr(&self, hw: &HwAddr) -> Result<Vec<Lease4>> {
        self.fetch4("WHERE hwaddr = ? ORDER BY address", |q| {
            q.bind(hw.to_string())
        })
    }

    fn lease4_by_hwaddr_in(&self, hw: &HwAddr, subnet_id: SubnetId) -> Result<Option<Lease4>> {
        Ok(self
            .fetch4("WHERE hwaddr = ? AND subnet_id = ?", |q| {
                q.bind(hw.to_string()).bind(subnet_id.get())
            })?
            .into_iter()
            .next())
    }

    fn leases4_by_client_id(&self, id: &ClientId) -> Result<Vec<Lease4>> {
        self.fetch4("WHERE client_id = ? ORDER BY address", |q| {
            q.bind(id.to_string())
        })
    }

    fn lease4_by_client_id_in(
        &self,
        id: &ClientId,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease4>> {
        Ok(self
            .fetch4("WHERE client_id = ? AND subnet_id = ?", |q| {
                q.bind(id.to_string()).bind(subnet_id.get())
            })?
            .into_iter()
            .next())
    }

    fn leases4_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease4>> {
        self.fetch4("WHERE subnet_id = ? ORDER BY address", |q| {
            q.bind(subnet_id.get())
        })
    }

    fn expired4(&self, now: i64, max: usize) -> Result<Vec<Lease4>> {
        check_max(max)?;
        self.fetch4(
            "WHERE state != 2 AND (valid_lft = 0 OR cltt + valid_lft <= ?) \
             ORDER BY cltt + valid_lft ASC LIMIT ?",
            |q| q.bind(now).bind(max as u64),
        )
    }

    fn modified4_since(&self, since: i64) -> Result<Vec<Lease4>> {
        self.fetch4("WHERE cltt > ? ORDER BY cltt ASC", |q| q.bind(since))
    }

    fn update_lease4(&self, lease: &Lease4) -> Result<()> {
        lease.validate()?;
        if self.lease4_by_addr(lease.addr)?.is_none() {
            return Err(Error::NoSuchLease(lease.addr.to_string()));
        }
        self.write4(lease)
    }

    fn delete_lease4(&self, addr: Ipv4Addr) -> Result<bool> {
        let existed = self.lease4_by_addr(addr)?.is_some();
        if existed {
            self.block_on(
                self.client
                    .query("DELETE FROM lease4 WHERE address = ?")
                    .bind(u32::from(addr))
                    .execute(),
            )?;
        }
        Ok(existed)
    }

    fn purge_reclaimed4(&self, before: i64) -> Result<u64> {
        let doomed = self.fetch4(
            "WHERE state = 2 AND cltt + valid_lft < ?",
            |q| q.bind(before),
        )?;
        if !doomed.is_empty() {
            self.block_on(
                self.client
                    .query("DELETE FROM lease4 WHERE state = 2 AND cltt + valid_lft < ?")
                    .bind(before)
                    .execute(),
            )?;
        }
        Ok(doomed.len() as u64)
    }

    fn add_lease6(&self, lease: Lease6) -> Result<bool> {
        lease.validate()?;
        let existing = self.lease6_by_addr(lease.addr, lease.ty)?;
        if matches!(existing, Some(l) if l.state != LeaseState::ExpiredReclaimed) {
            return Ok(false);
        }
        self.write6(&lease)?;
        Ok(true)
    }

    fn lease6_by_addr(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<Option<Lease6>> {
        Ok(self
            .fetch6("WHERE address = ? AND lease_type = ?", |q| {
                q.bind(addr.to_string()).bind(ty.as_u8())
            })?
            .into_iter()
            .next())
    }

    fn leases6_by_duid_iaid(&self, duid: &Duid, iaid: u32) -> Result<Vec<Lease6>> {
        self.fetch6(
            "WHERE duid = ? AND iaid = ? ORDER BY address, lease_type",
            |q| q.bind(duid.to_string()).bind(iaid),
        )
    }

    fn lease6_by_duid_iaid_in(
        &self,
        duid: &Duid,
        iaid: u32,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease6>> {
        Ok(self
            .fetch6("WHERE duid = ? AND iaid = ? AND subnet_id = ?", |q| {
                q.bind(duid.to_string()).bind(iaid).bind(subnet_id.get())
            })?
            .into_iter()
            .next())
    }

    fn leases6_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease6>> {
        self.fetch6("WHERE subnet_id = ? ORDER BY address, lease_type", |q| {
            q.bind(subnet_id.get())
        })
    }

    fn expired6(&self, now: i64, max: usize) -> Result<Vec<Lease6>> {
        check_max(max)?;
        self.fetch6(
            "WHERE state != 2 AND (valid_lft = 0 OR cltt + valid_lft <= ?) \
             ORDER BY cltt + valid_lft ASC LIMIT ?",
            |q| q.bind(now).bind(max as u64),
        )
    }

    fn modified6_since(&self, since: i64) -> Result<Vec<Lease6>> {
        self.fetch6("WHERE cltt > ? ORDER BY cltt ASC", |q| q.bind(since))
    }

    fn update_lease6(&self, lease: &Lease6) -> Result<()> {
        lease.validate()?;
        if self.lease6_by_addr(lease.addr, lease.ty)?.is_none() {
            return Err(Error::NoSuchLease(format!("{}/{:?}", lease.addr, lease.ty)));
        }
        self.write6(lease)
    }

    fn delete_lease6(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<bool> {
        let existed = self.lease6_by_addr(addr, ty)?.is_some();
        if existed {
            self.block_on(
                self.client
                    .query("DELETE FROM lease6 WHERE address = ? AND lease_type = ?")
                    .bind(addr.to_string())
                    .bind(ty.as_u8())
                    .execute(),
            )?;
        }
        Ok(existed)
    }

    fn purge_reclaimed6(&self, before: i64) -> Result<u64> {
        let doomed = self.fetch6(
            "WHERE state = 2 AND cltt + valid_lft < ?",
            |q| q.bind(before),
        )?;
        if !doomed.is_empty() {
            self.block_on(
                self.client
                    .query("DELETE FROM lease6 WHERE state = 2 AND cltt + valid_lft < ?")
                    .bind(before)
                    .execute(),
            )?;
        }
        Ok(doomed.len() as u64)
    }

    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn description(&self) -> &'static str {
        "wide-column lease database on a ClickHouse cluster"
    }

    fn schema_version(&self) -> Result<SchemaVersion> {
        let row: VersionRow = self.block_on(
            self.client
                .query("SELECT ?fields FROM schema_version LIMIT 1")
                .fetch_one::<VersionRow>(),
        )?;
        Ok(SchemaVersion::new(row.major, row.minor))
    }
}
