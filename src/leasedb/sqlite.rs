//! SQLite lease store.
//!
//! A single database file with WAL journaling. The connection lives behind
//! a mutex; SQLite serializes writers anyway, so one connection per store
//! keeps the transaction semantics simple. The `schema_version` table is
//! checked on open and a major mismatch is fatal.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{check_max, LeaseStore, LEASE_SCHEMA_VERSION};
use crate::{
    ClientId, Duid, Error, HwAddr, Lease4, Lease6, Lease6Type, LeaseState, Result, SchemaVersion,
    SubnetId,
};

const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    major INTEGER NOT NULL,
    minor INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS lease4 (
    address INTEGER PRIMARY KEY,
    hwtype INTEGER,
    hwaddr BLOB,
    client_id BLOB,
    valid_lft INTEGER NOT NULL,
    t1 INTEGER NOT NULL,
    t2 INTEGER NOT NULL,
    cltt INTEGER NOT NULL,
    subnet_id INTEGER NOT NULL,
    fixed INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    fqdn_fwd INTEGER NOT NULL,
    fqdn_rev INTEGER NOT NULL,
    state INTEGER NOT NULL,
    user_context TEXT
);
CREATE INDEX IF NOT EXISTS lease4_hwaddr ON lease4(hwaddr);
CREATE INDEX IF NOT EXISTS lease4_client_id ON lease4(client_id);
CREATE INDEX IF NOT EXISTS lease4_subnet ON lease4(subnet_id);
CREATE TABLE IF NOT EXISTS lease6 (
    address TEXT NOT NULL,
    lease_type INTEGER NOT NULL,
    prefix_len INTEGER NOT NULL,
    duid BLOB NOT NULL,
    iaid INTEGER NOT NULL,
    hwtype INTEGER,
    hwaddr BLOB,
    preferred_lft INTEGER NOT NULL,
    valid_lft INTEGER NOT NULL,
    t1 INTEGER NOT NULL,
    t2 INTEGER NOT NULL,
    cltt INTEGER NOT NULL,
    subnet_id INTEGER NOT NULL,
    fixed INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    fqdn_fwd INTEGER NOT NULL,
    fqdn_rev INTEGER NOT NULL,
    state INTEGER NOT NULL,
    user_context TEXT,
    PRIMARY KEY (address, lease_type)
);
CREATE INDEX IF NOT EXISTS lease6_duid_iaid ON lease6(duid, iaid);
CREATE INDEX IF NOT EXISTS lease6_subnet ON lease6(subnet_id);
";

const LEASE4_COLUMNS: &str = "address, hwtype, hwaddr, client_id, valid_lft, t1, t2, cltt, \
                              subnet_id, fixed, hostname, fqdn_fwd, fqdn_rev, state, user_context";
const LEASE6_COLUMNS: &str = "address, lease_type, prefix_len, duid, iaid, hwtype, hwaddr, \
                              preferred_lft, valid_lft, t1, t2, cltt, subnet_id, fixed, hostname, \
                              fqdn_fwd, fqdn_rev, state, user_context";

#[derive(Debug)]
pub struct SqliteLeaseStore {
    conn: Mutex<Connection>,
}

impl SqliteLeaseStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "opened sqlite lease database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Mutex poisoning only happens if a holder panicked; propagating the
        // panic is the right call for a storage handle.
        self.conn.lock().expect("lease store mutex poisoned")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(INIT_SQL)?;
        let stored: Option<(u32, u32)> = conn
            .query_row(
                "SELECT major, minor FROM schema_version",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (major, minor) VALUES (?1, ?2)",
                    params![LEASE_SCHEMA_VERSION.major, LEASE_SCHEMA_VERSION.minor],
                )?;
                Ok(())
            }
            Some((major, minor)) if major == LEASE_SCHEMA_VERSION.major => {
                let _ = minor;
                Ok(())
            }
            Some((major, minor)) => Err(Error::DbIncompatible {
                found: SchemaVersion::new(major, minor),
                expected_major: LEASE_SCHEMA_VERSION.major,
            }),
        }
    }

    fn query4(&self, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Lease4>> {
        let conn = self.conn();
        let sql = format!("SELECT {LEASE4_COLUMNS} FROM lease4 {where_clause}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, read_lease4_row)?;
        let mut leases = Vec::new();
        for row in rows {
            leases.push(finish_lease4(row?)?);
        }
        Ok(leases)
    }

    fn query6(&self, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Lease6>> {
        let conn = self.conn();
        let sql = format!("SELECT {LEASE6_COLUMNS} FROM lease6 {where_clause}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, read_lease6_row)?;
        let mut leases = Vec::new();
        for row in rows {
            leases.push(finish_lease6(row?)?);
        }
        Ok(leases)
    }
}

// Raw row images; identifier validation happens in finish_* so a corrupt
// row surfaces as BadValue instead of a panic.
struct RawLease4 {
    address: u32,
    hwtype: Option<u8>,
    hwaddr: Option<Vec<u8>>,
    client_id: Option<Vec<u8>>,
    valid_lft: u32,
    t1: u32,
    t2: u32,
    cltt: i64,
    subnet_id: u32,
    fixed: bool,
    hostname: String,
    fqdn_fwd: bool,
    fqdn_rev: bool,
    state: u8,
    user_context: Option<String>,
}

fn read_lease4_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLease4> {
    Ok(RawLease4 {
        address: row.get(0)?,
        hwtype: row.get(1)?,
        hwaddr: row.get(2)?,
        client_id: row.get(3)?,
        valid_lft: row.get(4)?,
        t1: row.get(5)?,
        t2: row.get(6)?,
        cltt: row.get(7)?,
        subnet_id: row.get(8)?,
        fixed: row.get(9)?,
        hostname: row.get(10)?,
        fqdn_fwd: row.get(11)?,
        fqdn_rev: row.get(12)?,
        state: row.get(13)?,
        user_context: row.get(14)?,
    })
}

fn finish_lease4(raw: RawLease4) -> Result<Lease4> {
    let hwaddr = match (raw.hwtype, raw.hwaddr) {
        (Some(htype), Some(data)) => Some(HwAddr::new(htype, data)?),
        _ => None,
    };
    let client_id = raw.client_id.map(ClientId::new).transpose()?;
    let user_context = raw
        .user_context
        .map(|text| serde_json::from_str(&text))
        .transpose()?;
    Ok(Lease4 {
        addr: Ipv4Addr::from(raw.address),
        hwaddr,
        client_id,
        valid_lft: raw.valid_lft,
        t1: raw.t1,
        t2: raw.t2,
        cltt: raw.cltt,
        subnet_id: SubnetId::from_raw(raw.subnet_id),
        fixed: raw.fixed,
        hostname: raw.hostname.into(),
        fqdn_fwd: raw.fqdn_fwd,
        fqdn_rev: raw.fqdn_rev,
        state: LeaseState::from_u8(raw.state)?,
        user_context,
    })
}

struct RawLease6 {
    address: String,
    lease_type: u8,
    prefix_len: u8,
    duid: Vec<u8>,
    iaid: u32,
    hwtype: Option<u8>,
    hwaddr: Option<Vec<u8>>,
    preferred_lft: u32,
    valid_lft: u32,
    t1: u32,
    t2: u32,
    cltt: i64,
    subnet_id: u32,
    fixed: bool,
    hostname: String,
    fqdn_fwd: bool,
    fqdn_rev: bool,
    state: u8,
    user_context: Option<String>,
}

fn read_lease6_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLease6> {
    Ok(RawLease6 {
        address: row.get(0)?,
        lease_type: row.get(1)?,
        prefix_len: row.get(2)?,
        duid: row.get(3)?,
        iaid: row.get(4)?,
        hwtype: row.get(5)?,
        hwaddr: row.get(6)?,
        preferred_lft: row.get(7)?,
        valid_lft: row.get(8)?,
        t1: row.get(9)?,
        t2: row.get(10)?,
        cltt: row.get(11)?,
        subnet_id: row.get(12)?,
        fixed: row.get(13)?,
        hostname: row.get(14)?,
        fqdn_fwd: row.get(15)?,
        fqdn_rev: row.get(16)?,
        state: row.get(17)?,
        user_context: row.get(18)?,
    })
}

fn finish_lease6(raw: RawLease6) -> Result<Lease6> {
    let addr: Ipv6Addr = raw
        .address
        .parse()
        .map_err(|_| Error::BadValue(format!("corrupt lease6 address `{}`", raw.address)))?;
    let hwaddr = match (raw.hwtype, raw.hwaddr) {
        (Some(htype), Some(data)) => Some(HwAddr::new(htype, data)?),
        _ => None,
    };
    let user_context = raw
        .user_context
        .map(|text| serde_json::from_str(&text))
        .transpose()?;
    Ok(Lease6 {
        addr,
        prefix_len: raw.prefix_len,
        ty: Lease6Type::from_u8(raw.lease_type)?,
        duid: Duid::new(raw.duid)?,
        iaid: raw.iaid,
        hwaddr,
        preferred_lft: raw.preferred_lft,
        valid_lft: raw.valid_lft,
        t1: raw.t1,
        t2: raw.t2,
        cltt: raw.cltt,
        subnet_id: SubnetId::from_raw(raw.subnet_id),
        fixed: raw.fixed,
        hostname: raw.hostname.into(),
        fqdn_fwd: raw.fqdn_fwd,
        fqdn_rev: raw.fqdn_rev,
        state: LeaseState::from_u8(raw.state)?,
        user_context,
    })
}

fn lease4_params(lease: &Lease4) -> Result<[Box<dyn rusqlite::ToSql>; 15]> {
    let user_context = lease
        .user_context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok([
        Box::new(u32::from(lease.addr)),
        Box::new(lease.hwaddr.as_ref().map(HwAddr::htype)),
        Box::new(lease.hwaddr.as_ref().map(|hw| hw.as_bytes().to_vec())),
        Box::new(lease.client_id.as_ref().map(|id| id.as_bytes().to_vec())),
        Box::new(lease.valid_lft),
        Box::new(lease.t1),
        Box::new(lease.t2),
        Box::new(lease.cltt),
        Box::new(lease.subnet_id.get()),
        Box::new(lease.fixed),
        Box::new(lease.hostname.as_str().to_owned()),
        Box::new(lease.fqdn_fwd),
        Box::new(lease.fqdn_rev),
        Box::new(lease.state.as_u8()),
        Box::new(user_context),
    ])
}

fn lease6_params(lease: &Lease6) -> Result<[Box<dyn rusqlite::ToSql>; 19]> {
    let user_context = lease
        .user_context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok([
        Box::new(lease.addr.to_string()),
        Box::new(lease.ty.as_u8()),
        Box::new(lease.prefix_len),
        Box::new(lease.duid.as_bytes().to_vec()),
        Box::new(lease.iaid),
        Box::new(lease.hwaddr.as_ref().map(HwAddr::htype)),
        Box::new(lease.hwaddr.as_ref().map(|hw| hw.as_bytes().to_vec())),
        Box::new(lease.preferred_lft),
        Box::new(lease.valid_lft),
        Box::new(lease.t1),
        Box::new(lease.t2),
        Box::new(lease.cltt),
        Box::new(lease.subnet_id.get()),
        Box::new(lease.fixed),
        Box::new(lease.hostname.as_str().to_owned()),
        Box::new(lease.fqdn_fwd),
        Box::new(lease.fqdn_rev),
        Box::new(lease.state.as_u8()),
        Box::new(user_context),
    ])
}

impl LeaseStore for SqliteLeaseStore {
    fn add_lease4(&self, lease: Lease4) -> Result<bool> {
        lease.validate()?;
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let existing: Option<u8> = tx
            .query_row(
                "SELECT state FROM lease4 WHERE address = ?1",
                params![u32::from(lease.addr)],
                |row| row.get(0),
            )
            .optional()?;
        if matches!(existing, Some(state) if state != LeaseState::ExpiredReclaimed.as_u8()) {
            return Ok(false);
        }
        let values = lease4_params(&lease)?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO lease4 ({LEASE4_COLUMNS}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"
            ),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn lease4_by_addr(&self, addr: Ipv4Addr) -> Result<Option<Lease4>> {
        Ok(self
            .query4("WHERE address = ?1", &[&u32::from(addr)])?
            .into_iter()
            .next())
    }

    fn leases4_by_hwaddr(&self, hw: &HwAddr) -> Result<Vec<Lease4>> {
        self.query4(
            "WHERE hwaddr = ?1 ORDER BY address",
            &[&hw.as_bytes().to_vec()],
        )
    }

    fn lease4_by_hwaddr_in(&self, hw: &HwAddr, subnet_id: SubnetId) -> Result<Option<Lease4>> {
        Ok(self
            .query4(
                "WHERE hwaddr = ?1 AND subnet_id = ?2",
                &[&hw.as_bytes().to_vec(), &subnet_id.get()],
            )?
            .into_iter()
            .next())
    }

    fn leases4_by_client_id(&self, id: &ClientId) -> Result<Vec<Lease4>> {
        self.query4(
            "WHERE client_id = ?1 ORDER BY address",
            &[&id.as_bytes().to_vec()],
        )
    }

    fn lease4_by_client_id_in(
        &self,
        id: &ClientId,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease4>> {
        Ok(self
            .query4(
                "WHERE client_id = ?1 AND subnet_id = ?2",
                &[&id.as_bytes().to_vec(), &subnet_id.get()],
            )?
            .into_iter()
            .next())
    }

    fn leases4_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease4>> {
        self.query4("WHERE subnet_id = ?1 ORDER BY address", &[&subnet_id.get()])
    }

    fn expired4(&self, now: i64, max: usize) -> Result<Vec<Lease4>> {
        check_max(max)?;
        self.query4(
            "WHERE state != 2 AND (valid_lft = 0 OR cltt + valid_lft <= ?1) \
             ORDER BY cltt + valid_lft ASC LIMIT ?2",
            &[&now, &(max as i64)],
        )
    }

    fn modified4_since(&self, since: i64) -> Result<Vec<Lease4>> {
        self.query4("WHERE cltt > ?1 ORDER BY cltt ASC", &[&since])
    }

    fn update_lease4(&self, lease: &Lease4) -> Result<()> {
        lease.validate()?;
        let conn = self.conn();
        let values = lease4_params(lease)?;
        let changed = conn.execute(
            "UPDATE lease4 SET hwtype = ?2, hwaddr = ?3, client_id = ?4, valid_lft = ?5, \
             t1 = ?6, t2 = ?7, cltt = ?8, subnet_id = ?9, fixed = ?10, hostname = ?11, \
             fqdn_fwd = ?12, fqdn_rev = ?13, state = ?14, user_context = ?15 \
             WHERE address = ?1",
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        if changed == 0 {
            return Err(Error::NoSuchLease(lease.addr.to_string()));
        }
        Ok(())
    }

    fn delete_lease4(&self, addr: Ipv4Addr) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM lease4 WHERE address = ?1",
            params![u32::from(addr)],
        )?;
        Ok(changed > 0)
    }

    fn purge_reclaimed4(&self, before: i64) -> Result<u64> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM lease4 WHERE state = 2 AND cltt + valid_lft < ?1",
            params![before],
        )?;
        Ok(changed as u64)
    }

    fn add_lease6(&self, lease: Lease6) -> Result<bool> {
        lease.validate()?;
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let existing: Option<u8> = tx
            .query_row(
                "SELECT state FROM lease6 WHERE address = ?1 AND lease_type = ?2",
                params![lease.addr.to_string(), lease.ty.as_u8()],
                |row| row.get(0),
            )
            .optional()?;
        if matches!(existing, Some(state) if state != LeaseState::ExpiredReclaimed.as_u8()) {
            return Ok(false);
        }
        let values = lease6_params(&lease)?;
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO lease6 ({LEASE6_COLUMNS}) VALUES \
                 (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)"
            ),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn lease6_by_addr(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<Option<Lease6>> {
        Ok(self
            .query6(
                "WHERE address = ?1 AND lease_type = ?2",
                &[&addr.to_string(), &ty.as_u8()],
            )?
            .into_iter()
            .next())
    }

    fn leases6_by_duid_iaid(&self, duid: &Duid, iaid: u32) -> Result<Vec<Lease6>> {
        self.query6(
            "WHERE duid = ?1 AND iaid = ?2 ORDER BY address, lease_type",
            &[&duid.as_bytes().to_vec(), &iaid],
        )
    }

    fn lease6_by_duid_iaid_in(
        &self,
        duid: &Duid,
        iaid: u32,
        subnet_id: SubnetId,
    ) -> Result<Option<Lease6>> {
        Ok(self
            .query6(
                "WHERE duid = ?1 AND iaid = ?2 AND subnet_id = ?3",
                &[&duid.as_bytes().to_vec(), &iaid, &subnet_id.get()],
            )?
            .into_iter()
            .next())
    }

    fn leases6_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease6>> {
        self.query6(
            "WHERE subnet_id = ?1 ORDER BY address, lease_type",
            &[&subnet_id.get()],
        )
    }

    fn expired6(&self, now: i64, max: usize) -> Result<Vec<Lease6>> {
        check_max(max)?;
        self.query6(
            "WHERE state != 2 AND (valid_lft = 0 OR cltt + valid_lft <= ?1) \
             ORDER BY cltt + valid_lft ASC LIMIT ?2",
            &[&now, &(max as i64)],
        )
    }

    fn modified6_since(&self, since: i64) -> Result<Vec<Lease6>> {
        self.query6("WHERE cltt > ?1 ORDER BY cltt ASC", &[&since])
    }

    fn update_lease6(&self, lease: &Lease6) -> Result<()> {
        lease.validate()?;
        let conn = self.conn();
        let values = lease6_params(lease)?;
        let changed = conn.execute(
            "UPDATE lease6 SET prefix_len = ?3, duid = ?4, iaid = ?5, hwtype = ?6, \
             hwaddr = ?7, preferred_lft = ?8, valid_lft = ?9, t1 = ?10, t2 = ?11, cltt = ?12, \
             subnet_id = ?13, fixed = ?14, hostname = ?15, fqdn_fwd = ?16, fqdn_rev = ?17, \
             state = ?18, user_context = ?19 WHERE address = ?1 AND lease_type = ?2",
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        if changed == 0 {
            return Err(Error::NoSuchLease(format!("{}/{:?}", lease.addr, lease.ty)));
        }
        Ok(())
    }

    fn delete_lease6(&self, addr: Ipv6Addr, ty: Lease6Type) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM lease6 WHERE address = ?1 AND lease_type = ?2",
            params![addr.to_string(), ty.as_u8()],
        )?;
        Ok(changed > 0)
    }

    fn purge_reclaimed6(&self, before: i64) -> Result<u64> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM lease6 WHERE state = 2 AND cltt + valid_lft < ?1",
            params![before],
        )?;
        Ok(changed as u64)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn description(&self) -> &'static str {
        "single-file SQLite lease database with WAL journaling"
    }

    fn schema_version(&self) -> Result<SchemaVersion> {
        let conn = self.conn();
        let (major, minor) = conn.query_row("SELECT major, minor FROM schema_version", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(SchemaVersion::new(major, minor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(addr: [u8; 4], cltt: i64) -> Lease4 {
        let mut lease = Lease4::new(Ipv4Addr::from(addr), SubnetId::from_raw(7), 3600, cltt);
        lease.client_id = Some(ClientId::new(vec![1, 2, 3]).unwrap());
        lease.set_hostname("Host-A.Example.Org");
        lease
    }

    #[test]
    fn round_trips_lease4_fields() {
        let store = SqliteLeaseStore::open_in_memory().unwrap();
        let mut original = lease([192, 0, 2, 3], 1_000);
        original.user_context = Some(serde_json::json!({"switch-port": 12}));
        assert!(store.add_lease4(original.clone()).unwrap());

        let read = store
            .lease4_by_addr(Ipv4Addr::new(192, 0, 2, 3))
            .unwrap()
            .unwrap();
        assert_eq!(read, original);
        assert_eq!(read.hostname, "host-a.example.org");
    }

    #[test]
    fn duplicate_insert_is_rejected_until_reclaimed() {
        let store = SqliteLeaseStore::open_in_memory().unwrap();
        assert!(store.add_lease4(lease([192, 0, 2, 3], 100)).unwrap());
        assert!(!store.add_lease4(lease([192, 0, 2, 3], 200)).unwrap());

        let mut reclaimed = lease([192, 0, 2, 3], 100);
        reclaimed.state = LeaseState::ExpiredReclaimed;
        store.update_lease4(&reclaimed).unwrap();
        assert!(store.add_lease4(lease([192, 0, 2, 3], 300)).unwrap());
    }

    #[test]
    fn update_missing_row_is_no_such_lease() {
        let store = SqliteLeaseStore::open_in_memory().unwrap();
        let err = store.update_lease4(&lease([192, 0, 2, 9], 0)).unwrap_err();
        assert!(matches!(err, Error::NoSuchLease(_)));
    }

    #[test]
    fn expired_query_orders_by_expiry() {
        let store = SqliteLeaseStore::open_in_memory().unwrap();
        for (octet, cltt) in [(3u8, 300i64), (4, 100), (5, 200)] {
            store.add_lease4(lease([192, 0, 2, octet], cltt)).unwrap();
        }
        let expired = store.expired4(100_000, 10).unwrap();
        let cltts: Vec<i64> = expired.iter().map(|l| l.cltt).collect();
        assert_eq!(cltts, vec![100, 200, 300]);
    }

    #[test]
    fn lease6_composite_key() {
        let store = SqliteLeaseStore::open_in_memory().unwrap();
        let duid = Duid::new(vec![0xaa, 0xbb]).unwrap();
        let pd = Lease6::new(
            Lease6Type::Pd,
            "2001:db8::".parse().unwrap(),
            56,
            duid.clone(),
            9,
            SubnetId::from_raw(1),
            7200,
            50,
        );
        let na = Lease6::new(
            Lease6Type::Na,
            "2001:db8::".parse().unwrap(),
            128,
            duid.clone(),
            9,
            SubnetId::from_raw(1),
            7200,
            50,
        );
        assert!(store.add_lease6(pd.clone()).unwrap());
        assert!(!store.add_lease6(pd).unwrap());
        assert!(store.add_lease6(na).unwrap());
        assert_eq!(store.leases6_by_duid_iaid(&duid, 9).unwrap().len(), 2);
    }

    #[test]
    fn schema_version_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        {
            let store = SqliteLeaseStore::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), LEASE_SCHEMA_VERSION);
        }
        let reopened = SqliteLeaseStore::open(&path).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), LEASE_SCHEMA_VERSION);
    }

    #[test]
    fn major_mismatch_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        {
            let store = SqliteLeaseStore::open(&path).unwrap();
            let conn = store.conn();
            conn.execute("UPDATE schema_version SET major = 99", []).unwrap();
        }
        let err = SqliteLeaseStore::open(&path).unwrap_err();
        assert!(matches!(err, Error::DbIncompatible { .. }));
    }
}
