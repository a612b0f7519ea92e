//! SQLite configuration backend.
//!
//! Entity rows are stored as `(key, data, modified_at, tags)` where `data`
//! is the serialized entity; the logical schema invariants (key
//! uniqueness, audit ordering, selector scoping) are what the contract
//! promises, not a column-per-field layout. The audit log is a plain
//! table whose `revision` primary key doubles as the backend revision
//! counter across restarts.
//!
//! Bulk reconfiguration goes through [`SqliteConfigBackend::transaction`]:
//! every write inside the closure, including its audit rows, commits or
//! rolls back as one unit, and observers see the batch only after commit.

use std::cell::RefCell;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    check_prefix4_disjoint, check_prefix6_disjoint, AuditCallback, AuditClock, AuditEntry,
    ConfigBackend, GlobalParameter, ModificationKind, ObserverList, OptionDefinition,
    OptionDescriptor, OptionScope, ServerSelector, SharedNetwork4, SharedNetwork6, Stamped,
    StampedInfo, Subnet4, Subnet6, CONFIG_SCHEMA_VERSION,
};
use crate::{Error, Result, SchemaVersion, SubnetId};

const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    major INTEGER NOT NULL,
    minor INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS subnet4 (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS subnet6 (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS shared_network4 (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS shared_network6 (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS option_def (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS option_instance (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS global_parameter (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    revision INTEGER PRIMARY KEY,
    object_type TEXT NOT NULL,
    object_id TEXT NOT NULL,
    modification TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    tags TEXT NOT NULL
);
";

// Options persist together with their scope so one table serves all five
// addressing shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptionRow {
    scope: OptionScope,
    option: OptionDescriptor,
}

impl Stamped for OptionRow {
    fn stamp(&self) -> &StampedInfo {
        &self.option.stamp
    }
    fn stamp_mut(&mut self) -> &mut StampedInfo {
        &mut self.option.stamp
    }
}

struct Inner {
    conn: Connection,
    /// When a transaction is active, committed-entry notification is
    /// deferred here until COMMIT.
    pending: Option<Vec<AuditEntry>>,
}

pub struct SqliteConfigBackend {
    inner: Mutex<Inner>,
    clock: AuditClock,
    observers: ObserverList,
}

impl SqliteConfigBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let backend = Self::finish_open(conn)?;
        info!(path = %path.as_ref().display(), "opened sqlite config database");
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::finish_open(Connection::open_in_memory()?)
    }

    fn finish_open(conn: Connection) -> Result<Self> {
        conn.execute_batch(INIT_SQL)?;
        let stored: Option<(u32, u32)> = conn
            .query_row("SELECT major, minor FROM schema_version", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (major, minor) VALUES (?1, ?2)",
                    params![CONFIG_SCHEMA_VERSION.major, CONFIG_SCHEMA_VERSION.minor],
                )?;
            }
            Some((major, _)) if major == CONFIG_SCHEMA_VERSION.major => {}
            Some((major, minor)) => {
                return Err(Error::DbIncompatible {
                    found: SchemaVersion::new(major, minor),
                    expected_major: CONFIG_SCHEMA_VERSION.major,
                });
            }
        }
        let last_revision: u64 = conn
            .query_row("SELECT COALESCE(MAX(revision), 0) FROM audit_log", [], |r| {
                r.get::<_, i64>(0)
            })
            .map(|v| v as u64)?;
        Ok(SqliteConfigBackend {
            inner: Mutex::new(Inner {
                conn,
                pending: None,
            }),
            clock: AuditClock::resume_from(last_revision),
            observers: ObserverList::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("config store mutex poisoned")
    }

    /// Runs `f` with every write, including audit rows, inside one SQLite
    /// transaction. On error nothing is stored and observers hear
    /// nothing; `modified_*` reads afterwards see either all of the batch
    /// or none of it.
    pub fn transaction<T>(&self, f: impl FnOnce(&ConfigTx<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        guard.conn.execute_batch("BEGIN IMMEDIATE")?;
        guard.pending = Some(Vec::new());
        let tx = ConfigTx {
            backend: self,
            guard: RefCell::new(guard),
        };
        let result = f(&tx);
        let mut guard = tx.guard.into_inner();
        match result {
            Ok(value) => {
                guard.conn.execute_batch("COMMIT")?;
                let entries = guard.pending.take().unwrap_or_default();
                drop(guard);
                self.observers.notify(&entries);
                Ok(value)
            }
            Err(err) => {
                let _ = guard.conn.execute_batch("ROLLBACK");
                guard.pending = None;
                Err(err)
            }
        }
    }

    // ---- generic row plumbing -------------------------------------------

    fn load_all<V: DeserializeOwned>(conn: &Connection, table: &str) -> Result<Vec<V>> {
        let mut stmt = conn.prepare(&format!("SELECT data FROM {table}"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(serde_json::from_str(&row?)?);
        }
        Ok(entities)
    }

    fn load_one<V: DeserializeOwned>(
        conn: &Connection,
        table: &str,
        key: &str,
    ) -> Result<Option<V>> {
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {table} WHERE key = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    fn append_audit(conn: &Connection, entry: &AuditEntry) -> Result<()> {
        conn.execute(
            "INSERT INTO audit_log (revision, object_type, object_id, modification, \
             modified_at, tags) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.revision as i64,
                entry.object_type.as_str(),
                entry.object_id.as_str(),
                entry.modification.to_string(),
                entry.modified_at.to_rfc3339(),
                serde_json::to_string(&entry.server_tags)?,
            ],
        )?;
        Ok(())
    }

    fn put_in<V: Serialize + Stamped>(
        &self,
        conn: &Connection,
        table: &str,
        key: &str,
        mut entity: V,
        sel: &ServerSelector,
        object_type: &str,
        object_id: CompactString,
    ) -> Result<AuditEntry> {
        let tags = sel.write_tags()?;
        in_own_txn(conn, || {
            let (modified_at, revision) = self.clock.next();
            entity.stamp_mut().modified_at = modified_at;
            entity.stamp_mut().server_tags = tags.clone();
            entity.stamp_applied();

            let existed: bool = conn.query_row(
                &format!("SELECT COUNT(*) > 0 FROM {table} WHERE key = ?1"),
                params![key],
                |row| row.get(0),
            )?;
            conn.execute(
                &format!(
                    "INSERT INTO {table} (key, data, modified_at, tags) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data, \
                     modified_at = excluded.modified_at, tags = excluded.tags"
                ),
                params![
                    key,
                    serde_json::to_string(&entity)?,
                    modified_at.to_rfc3339(),
                    serde_json::to_string(&tags)?,
                ],
            )?;

            let entry = AuditEntry {
                object_type: object_type.to_compact_string(),
                object_id,
                modification: if existed {
                    ModificationKind::Update
                } else {
                    ModificationKind::Create
                },
                modified_at,
                revision,
                server_tags: tags,
            };
            Self::append_audit(conn, &entry)?;
            Ok(entry)
        })
    }

    fn delete_in<V: DeserializeOwned + Stamped>(
        &self,
        conn: &Connection,
        table: &str,
        key: &str,
        sel: &ServerSelector,
        object_type: &str,
        object_id: CompactString,
    ) -> Result<Option<AuditEntry>> {
        sel.write_tags()?;
        in_own_txn(conn, || {
            let Some(entity) = Self::load_one::<V>(conn, table, key)? else {
                return Ok(None);
            };
            if !sel.matches_delete(&entity.stamp().server_tags) {
                return Ok(None);
            }
            conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
            let (modified_at, revision) = self.clock.next();
            let entry = AuditEntry {
                object_type: object_type.to_compact_string(),
                object_id,
                modification: ModificationKind::Delete,
                modified_at,
                revision,
                server_tags: entity.stamp().server_tags.clone(),
            };
            Self::append_audit(conn, &entry)?;
            Ok(Some(entry))
        })
    }

    fn visible<V: DeserializeOwned + Stamped>(
        conn: &Connection,
        table: &str,
        sel: &ServerSelector,
    ) -> Result<Vec<V>> {
        sel.check_read()?;
        let mut entities = Self::load_all::<V>(conn, table)?;
        entities.retain(|e| sel.matches_read(&e.stamp().server_tags));
        Ok(entities)
    }

    // ---- per-entity internals shared with ConfigTx ----------------------

    fn upsert_subnet4_in(
        &self,
        conn: &Connection,
        sel: &ServerSelector,
        mut subnet: Subnet4,
    ) -> Result<AuditEntry> {
        subnet.validate()?;
        subnet.stamp.server_tags = sel.write_tags()?;
        let existing = Self::load_all::<Subnet4>(conn, "subnet4")?;
        check_prefix4_disjoint(&subnet, &existing)?;
        let id = subnet.id;
        self.put_in(
            conn,
            "subnet4",
            &id.to_string(),
            subnet,
            sel,
            "subnet4",
            id.to_compact_string(),
        )
    }

    fn upsert_subnet6_in(
        &self,
        conn: &Connection,
        sel: &ServerSelector,
        mut subnet: Subnet6,
    ) -> Result<AuditEntry> {
        subnet.validate()?;
        subnet.stamp.server_tags = sel.write_tags()?;
        let existing = Self::load_all::<Subnet6>(conn, "subnet6")?;
        check_prefix6_disjoint(&subnet, &existing)?;
        let id = subnet.id;
        self.put_in(
            conn,
            "subnet6",
            &id.to_string(),
            subnet,
            sel,
            "subnet6",
            id.to_compact_string(),
        )
    }

    fn delete_all_in<V: DeserializeOwned + Stamped>(
        &self,
        conn: &Connection,
        table: &str,
        sel: &ServerSelector,
        object_type: &str,
        key_of: impl Fn(&V) -> CompactString,
    ) -> Result<Vec<AuditEntry>> {
        sel.write_tags()?;
        let rows = Self::load_all::<V>(conn, table)?;
        let mut entries = Vec::new();
        for row in rows {
            let key = key_of(&row);
            if let Some(entry) =
                self.delete_in::<V>(conn, table, &key, sel, object_type, key.clone())?
            {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Routes one write's audit entry: buffered during a transaction,
    /// otherwise persisted already and published immediately.
    fn finish_write(&self, mut guard: MutexGuard<'_, Inner>, entries: Vec<AuditEntry>) {
        if let Some(pending) = guard.pending.as_mut() {
            pending.extend(entries);
            return;
        }
        drop(guard);
        self.observers.notify(&entries);
    }
}

/// Runs `f` inside its own transaction unless one is already active, so
/// a single write call is crash-atomic with its audit row.
fn in_own_txn<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if !conn.is_autocommit() {
        return f();
    }
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f() {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn option_key(scope: &OptionScope, code: u16, space: &str) -> String {
    format!("{scope}|{space}|{code}")
}

fn option_def_key(code: u16, space: &str) -> String {
    format!("{space}|{code}")
}

impl ConfigBackend for SqliteConfigBackend {
    fn subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet4>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(
            Self::load_one::<Subnet4>(&guard.conn, "subnet4", &id.to_string())?
                .filter(|s| sel.matches_read(&s.stamp.server_tags)),
        )
    }

    fn all_subnets4(&self, sel: &ServerSelector) -> Result<Vec<Subnet4>> {
        let guard = self.lock();
        let mut subnets = Self::visible::<Subnet4>(&guard.conn, "subnet4", sel)?;
        subnets.sort_by_key(|s| s.id);
        Ok(subnets)
    }

    fn modified_subnets4(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<Subnet4>> {
        let guard = self.lock();
        let mut subnets = Self::visible::<Subnet4>(&guard.conn, "subnet4", sel)?;
        subnets.retain(|s| s.stamp.modified_at > since);
        subnets.sort_by_key(|s| s.stamp.modified_at);
        Ok(subnets)
    }

    fn upsert_subnet4(&self, sel: &ServerSelector, subnet: Subnet4) -> Result<()> {
        let guard = self.lock();
        let entry = self.upsert_subnet4_in(&guard.conn, sel, subnet)?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<Subnet4>(
            &guard.conn,
            "subnet4",
            &id.to_string(),
            sel,
            "subnet4",
            id.to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_subnets4(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<Subnet4>(&guard.conn, "subnet4", sel, "subnet4", |s| {
            s.id.to_compact_string()
        })?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet6>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(
            Self::load_one::<Subnet6>(&guard.conn, "subnet6", &id.to_string())?
                .filter(|s| sel.matches_read(&s.stamp.server_tags)),
        )
    }

    fn all_subnets6(&self, sel: &ServerSelector) -> Result<Vec<Subnet6>> {
        let guard = self.lock();
        let mut subnets = Self::visible::<Subnet6>(&guard.conn, "subnet6", sel)?;
        subnets.sort_by_key(|s| s.id);
        Ok(subnets)
    }

    fn modified_subnets6(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<Subnet6>> {
        let guard = self.lock();
        let mut subnets = Self::visible::<Subnet6>(&guard.conn, "subnet6", sel)?;
        subnets.retain(|s| s.stamp.modified_at > since);
        subnets.sort_by_key(|s| s.stamp.modified_at);
        Ok(subnets)
    }

    fn upsert_subnet6(&self, sel: &ServerSelector, subnet: Subnet6) -> Result<()> {
        let guard = self.lock();
        let entry = self.upsert_subnet6_in(&guard.conn, sel, subnet)?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<Subnet6>(
            &guard.conn,
            "subnet6",
            &id.to_string(),
            sel,
            "subnet6",
            id.to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_subnets6(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<Subnet6>(&guard.conn, "subnet6", sel, "subnet6", |s| {
            s.id.to_compact_string()
        })?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn shared_network4(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<SharedNetwork4>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(
            Self::load_one::<SharedNetwork4>(&guard.conn, "shared_network4", name)?
                .filter(|n| sel.matches_read(&n.stamp.server_tags)),
        )
    }

    fn all_shared_networks4(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork4>> {
        let guard = self.lock();
        let mut networks = Self::visible::<SharedNetwork4>(&guard.conn, "shared_network4", sel)?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn modified_shared_networks4(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork4>> {
        let guard = self.lock();
        let mut networks = Self::visible::<SharedNetwork4>(&guard.conn, "shared_network4", sel)?;
        networks.retain(|n| n.stamp.modified_at > since);
        networks.sort_by_key(|n| n.stamp.modified_at);
        Ok(networks)
    }

    fn upsert_shared_network4(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork4,
    ) -> Result<()> {
        let guard = self.lock();
        let name = network.name.clone();
        let entry = self.put_in(
            &guard.conn,
            "shared_network4",
            name.as_str(),
            network,
            sel,
            "shared-network4",
            name.clone(),
        )?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_shared_network4(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<SharedNetwork4>(
            &guard.conn,
            "shared_network4",
            name,
            sel,
            "shared-network4",
            name.to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_shared_networks4(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<SharedNetwork4>(
            &guard.conn,
            "shared_network4",
            sel,
            "shared-network4",
            |n| n.name.clone(),
        )?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn shared_network6(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<SharedNetwork6>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(
            Self::load_one::<SharedNetwork6>(&guard.conn, "shared_network6", name)?
                .filter(|n| sel.matches_read(&n.stamp.server_tags)),
        )
    }

    fn all_shared_networks6(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork6>> {
        let guard = self.lock();
        let mut networks = Self::visible::<SharedNetwork6>(&guard.conn, "shared_network6", sel)?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn modified_shared_networks6(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork6>> {
        let guard = self.lock();
        let mut networks = Self::visible::<SharedNetwork6>(&guard.conn, "shared_network6", sel)?;
        networks.retain(|n| n.stamp.modified_at > since);
        networks.sort_by_key(|n| n.stamp.modified_at);
        Ok(networks)
    }

    fn upsert_shared_network6(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork6,
    ) -> Result<()> {
        let guard = self.lock();
        let name = network.name.clone();
        let entry = self.put_in(
            &guard.conn,
            "shared_network6",
            name.as_str(),
            network,
            sel,
            "shared-network6",
            name.clone(),
        )?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_shared_network6(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<SharedNetwork6>(
            &guard.conn,
            "shared_network6",
            name,
            sel,
            "shared-network6",
            name.to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_shared_networks6(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<SharedNetwork6>(
            &guard.conn,
            "shared_network6",
            sel,
            "shared-network6",
            |n| n.name.clone(),
        )?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn option_def(
        &self,
        sel: &ServerSelector,
        code: u16,
        space: &str,
    ) -> Result<Option<OptionDefinition>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(Self::load_one::<OptionDefinition>(
            &guard.conn,
            "option_def",
            &option_def_key(code, space),
        )?
        .filter(|d| sel.matches_read(&d.stamp.server_tags)))
    }

    fn all_option_defs(&self, sel: &ServerSelector) -> Result<Vec<OptionDefinition>> {
        let guard = self.lock();
        let mut defs = Self::visible::<OptionDefinition>(&guard.conn, "option_def", sel)?;
        defs.sort_by(|a, b| (a.space.clone(), a.code).cmp(&(b.space.clone(), b.code)));
        Ok(defs)
    }

    fn modified_option_defs(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<OptionDefinition>> {
        let guard = self.lock();
        let mut defs = Self::visible::<OptionDefinition>(&guard.conn, "option_def", sel)?;
        defs.retain(|d| d.stamp.modified_at > since);
        defs.sort_by_key(|d| d.stamp.modified_at);
        Ok(defs)
    }

    fn upsert_option_def(&self, sel: &ServerSelector, def: OptionDefinition) -> Result<()> {
        def.validate()?;
        let guard = self.lock();
        let key = option_def_key(def.code, &def.space);
        let object_id = format!("{}:{}", def.space, def.code).to_compact_string();
        let entry = self.put_in(&guard.conn, "option_def", &key, def, sel, "option-def", object_id)?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_option_def(&self, sel: &ServerSelector, code: u16, space: &str) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<OptionDefinition>(
            &guard.conn,
            "option_def",
            &option_def_key(code, space),
            sel,
            "option-def",
            format!("{space}:{code}").to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_option_defs(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<OptionDefinition>(
            &guard.conn,
            "option_def",
            sel,
            "option-def",
            |d| format!("{}|{}", d.space, d.code).to_compact_string(),
        )?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        code: u16,
        space: &str,
    ) -> Result<Option<OptionDescriptor>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(Self::load_one::<OptionRow>(
            &guard.conn,
            "option_instance",
            &option_key(scope, code, space),
        )?
        .filter(|row| sel.matches_read(&row.option.stamp.server_tags))
        .map(|row| row.option))
    }

    fn all_options(&self, sel: &ServerSelector) -> Result<Vec<(OptionScope, OptionDescriptor)>> {
        let guard = self.lock();
        let rows = Self::visible::<OptionRow>(&guard.conn, "option_instance", sel)?;
        let mut options: Vec<(OptionScope, OptionDescriptor)> =
            rows.into_iter().map(|row| (row.scope, row.option)).collect();
        options.sort_by(|a, b| {
            (a.0.to_string(), a.1.space.clone(), a.1.code)
                .cmp(&(b.0.to_string(), b.1.space.clone(), b.1.code))
        });
        Ok(options)
    }

    fn modified_options(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<(OptionScope, OptionDescriptor)>> {
        let guard = self.lock();
        let rows = Self::visible::<OptionRow>(&guard.conn, "option_instance", sel)?;
        let mut options: Vec<(OptionScope, OptionDescriptor)> = rows
            .into_iter()
            .filter(|row| row.option.stamp.modified_at > since)
            .map(|row| (row.scope, row.option))
            .collect();
        options.sort_by_key(|(_, o)| o.stamp.modified_at);
        Ok(options)
    }

    fn upsert_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        option: OptionDescriptor,
    ) -> Result<()> {
        let guard = self.lock();
        let key = option_key(scope, option.code, &option.space);
        let object_id =
            format!("{scope}:{}:{}", option.space, option.code).to_compact_string();
        let row = OptionRow {
            scope: scope.clone(),
            option,
        };
        let entry = self.put_in(&guard.conn, "option_instance", &key, row, sel, "option", object_id)?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        code: u16,
        space: &str,
    ) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<OptionRow>(
            &guard.conn,
            "option_instance",
            &option_key(scope, code, space),
            sel,
            "option",
            format!("{scope}:{space}:{code}").to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_options(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<OptionRow>(
            &guard.conn,
            "option_instance",
            sel,
            "option",
            |row| option_key(&row.scope, row.option.code, &row.option.space).to_compact_string(),
        )?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn global_parameter(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<GlobalParameter>> {
        sel.check_read()?;
        let guard = self.lock();
        Ok(
            Self::load_one::<GlobalParameter>(&guard.conn, "global_parameter", name)?
                .filter(|p| sel.matches_read(&p.stamp.server_tags)),
        )
    }

    fn all_global_parameters(&self, sel: &ServerSelector) -> Result<Vec<GlobalParameter>> {
        let guard = self.lock();
        let mut parameters =
            Self::visible::<GlobalParameter>(&guard.conn, "global_parameter", sel)?;
        parameters.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(parameters)
    }

    fn modified_global_parameters(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalParameter>> {
        let guard = self.lock();
        let mut parameters =
            Self::visible::<GlobalParameter>(&guard.conn, "global_parameter", sel)?;
        parameters.retain(|p| p.stamp.modified_at > since);
        parameters.sort_by_key(|p| p.stamp.modified_at);
        Ok(parameters)
    }

    fn upsert_global_parameter(
        &self,
        sel: &ServerSelector,
        parameter: GlobalParameter,
    ) -> Result<()> {
        let guard = self.lock();
        let name = parameter.name().to_compact_string();
        let entry = self.put_in(
            &guard.conn,
            "global_parameter",
            name.as_str(),
            parameter,
            sel,
            "global-parameter",
            name.clone(),
        )?;
        self.finish_write(guard, vec![entry]);
        Ok(())
    }

    fn delete_global_parameter(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let guard = self.lock();
        let entry = self.delete_in::<GlobalParameter>(
            &guard.conn,
            "global_parameter",
            name,
            sel,
            "global-parameter",
            name.to_compact_string(),
        )?;
        match entry {
            Some(entry) => {
                self.finish_write(guard, vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_global_parameters(&self, sel: &ServerSelector) -> Result<u64> {
        let guard = self.lock();
        let entries = self.delete_all_in::<GlobalParameter>(
            &guard.conn,
            "global_parameter",
            sel,
            "global-parameter",
            |p| p.name().to_compact_string(),
        )?;
        let count = entries.len() as u64;
        self.finish_write(guard, entries);
        Ok(count)
    }

    fn recent_audit_entries(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        sel.check_read()?;
        let guard = self.lock();
        let mut stmt = guard.conn.prepare(
            "SELECT revision, object_type, object_id, modification, modified_at, tags \
             FROM audit_log ORDER BY modified_at, revision",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (revision, object_type, object_id, modification, modified_at, tags) = row?;
            let modified_at = DateTime::parse_from_rfc3339(&modified_at)
                .map_err(|e| Error::BadValue(format!("corrupt audit timestamp: {e}")))?
                .with_timezone(&Utc);
            let entry = AuditEntry {
                object_type: object_type.into(),
                object_id: object_id.into(),
                modification: ModificationKind::parse(&modification)?,
                modified_at,
                revision: revision as u64,
                server_tags: serde_json::from_str(&tags)?,
            };
            if entry.modified_at > since && sel.matches_read(&entry.server_tags) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| (e.modified_at, e.revision));
        Ok(entries)
    }

    fn subscribe(&self, name: &str, callback: AuditCallback) -> Result<()> {
        self.observers.subscribe(name, callback)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn schema_version(&self) -> Result<SchemaVersion> {
        let guard = self.lock();
        let (major, minor) =
            guard
                .conn
                .query_row("SELECT major, minor FROM schema_version", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
        Ok(SchemaVersion::new(major, minor))
    }
}

/// Write surface available inside [`SqliteConfigBackend::transaction`].
pub struct ConfigTx<'a> {
    backend: &'a SqliteConfigBackend,
    guard: RefCell<MutexGuard<'a, Inner>>,
}

impl ConfigTx<'_> {
    fn push(&self, entries: Vec<AuditEntry>) {
        let mut guard = self.guard.borrow_mut();
        guard
            .pending
            .as_mut()
            .expect("transaction pending buffer missing")
            .extend(entries);
    }

    pub fn upsert_subnet4(&self, sel: &ServerSelector, subnet: Subnet4) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            self.backend.upsert_subnet4_in(&guard.conn, sel, subnet)?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn upsert_subnet6(&self, sel: &ServerSelector, subnet: Subnet6) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            self.backend.upsert_subnet6_in(&guard.conn, sel, subnet)?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn delete_all_subnets4(&self, sel: &ServerSelector) -> Result<u64> {
        let entries = {
            let guard = self.guard.borrow();
            self.backend
                .delete_all_in::<Subnet4>(&guard.conn, "subnet4", sel, "subnet4", |s| {
                    s.id.to_compact_string()
                })?
        };
        let count = entries.len() as u64;
        self.push(entries);
        Ok(count)
    }

    pub fn delete_all_subnets6(&self, sel: &ServerSelector) -> Result<u64> {
        let entries = {
            let guard = self.guard.borrow();
            self.backend
                .delete_all_in::<Subnet6>(&guard.conn, "subnet6", sel, "subnet6", |s| {
                    s.id.to_compact_string()
                })?
        };
        let count = entries.len() as u64;
        self.push(entries);
        Ok(count)
    }

    pub fn upsert_shared_network4(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork4,
    ) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            let name = network.name.clone();
            self.backend.put_in(
                &guard.conn,
                "shared_network4",
                name.as_str(),
                network,
                sel,
                "shared-network4",
                name.clone(),
            )?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn upsert_shared_network6(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork6,
    ) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            let name = network.name.clone();
            self.backend.put_in(
                &guard.conn,
                "shared_network6",
                name.as_str(),
                network,
                sel,
                "shared-network6",
                name.clone(),
            )?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn upsert_option_def(&self, sel: &ServerSelector, def: OptionDefinition) -> Result<()> {
        def.validate()?;
        let entry = {
            let guard = self.guard.borrow();
            let key = option_def_key(def.code, &def.space);
            let object_id = format!("{}:{}", def.space, def.code).to_compact_string();
            self.backend
                .put_in(&guard.conn, "option_def", &key, def, sel, "option-def", object_id)?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn upsert_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        option: OptionDescriptor,
    ) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            let key = option_key(scope, option.code, &option.space);
            let object_id =
                format!("{scope}:{}:{}", option.space, option.code).to_compact_string();
            let row = OptionRow {
                scope: scope.clone(),
                option,
            };
            self.backend
                .put_in(&guard.conn, "option_instance", &key, row, sel, "option", object_id)?
        };
        self.push(vec![entry]);
        Ok(())
    }

    pub fn upsert_global_parameter(
        &self,
        sel: &ServerSelector,
        parameter: GlobalParameter,
    ) -> Result<()> {
        let entry = {
            let guard = self.guard.borrow();
            let name = parameter.name().to_compact_string();
            self.backend.put_in(
                &guard.conn,
                "global_parameter",
                name.as_str(),
                parameter,
                sel,
                "global-parameter",
                name.clone(),
            )?
        };
        self.push(vec![entry]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamped::{ElementValue, StampedValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn subnet(id: u32, prefix: &str) -> Subnet4 {
        Subnet4::new(SubnetId::from_raw(id), prefix.parse().unwrap(), 3600)
    }

    #[test]
    fn entities_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.db");
        let sel = ServerSelector::one("edge-1");
        {
            let backend = SqliteConfigBackend::open(&path).unwrap();
            backend.upsert_subnet4(&sel, subnet(1, "192.0.2.0/24")).unwrap();
            backend
                .upsert_global_parameter(
                    &sel,
                    GlobalParameter::new(StampedValue::with_value(
                        "renew-timer",
                        ElementValue::Integer(1000),
                    )),
                )
                .unwrap();
        }
        let backend = SqliteConfigBackend::open(&path).unwrap();
        let stored = backend.subnet4(&sel, SubnetId::from_raw(1)).unwrap().unwrap();
        assert_eq!(stored.prefix.to_string(), "192.0.2.0/24");
        let param = backend.global_parameter(&sel, "renew-timer").unwrap().unwrap();
        assert_eq!(param.value.get_integer().unwrap(), 1000);

        // audit revisions resume past what is on disk
        backend.delete_subnet4(&sel, SubnetId::from_raw(1)).unwrap();
        let entries = backend
            .recent_audit_entries(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let revisions: Vec<u64> = entries.iter().map(|e| e.revision).collect();
        let mut sorted = revisions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(revisions.len(), sorted.len());
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let backend = SqliteConfigBackend::open_in_memory().unwrap();
        let sel = ServerSelector::one("edge-1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        backend
            .subscribe(
                "watcher",
                Box::new(move |batch| {
                    counter.fetch_add(batch.len(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        let result: Result<()> = backend.transaction(|tx| {
            tx.upsert_subnet4(&sel, subnet(1, "192.0.2.0/24"))?;
            tx.upsert_subnet4(&sel, subnet(2, "198.51.100.0/24"))?;
            // overlapping prefix aborts the whole batch
            tx.upsert_subnet4(&sel, subnet(3, "192.0.2.0/25"))?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(backend.all_subnets4(&sel).unwrap().is_empty());
        assert!(backend
            .recent_audit_entries(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap()
            .is_empty());
        assert!(backend
            .modified_subnets4(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn committed_transaction_publishes_whole_batch() {
        let backend = SqliteConfigBackend::open_in_memory().unwrap();
        let sel = ServerSelector::one("edge-1");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        backend
            .subscribe(
                "watcher",
                Box::new(move |batch| {
                    counter.fetch_add(batch.len(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        backend
            .transaction(|tx| {
                tx.upsert_subnet4(&sel, subnet(1, "192.0.2.0/24"))?;
                tx.upsert_subnet4(&sel, subnet(2, "198.51.100.0/24"))?;
                tx.upsert_shared_network4(&sel, SharedNetwork4::new("floor-2"))?;
                Ok(())
            })
            .unwrap();

        // one notification covering the full batch, after commit
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(backend.all_subnets4(&sel).unwrap().len(), 2);
        assert_eq!(
            backend
                .modified_subnets4(&sel, DateTime::<Utc>::MIN_UTC)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn delete_returns_count_never_error() {
        let backend = SqliteConfigBackend::open_in_memory().unwrap();
        let sel = ServerSelector::one("edge-1");
        assert_eq!(backend.delete_subnet4(&sel, SubnetId::from_raw(9)).unwrap(), 0);
        backend.upsert_subnet4(&sel, subnet(9, "192.0.2.0/24")).unwrap();
        assert_eq!(backend.delete_subnet4(&sel, SubnetId::from_raw(9)).unwrap(), 1);
        assert_eq!(backend.delete_subnet4(&sel, SubnetId::from_raw(9)).unwrap(), 0);
    }

    #[test]
    fn option_scope_routing_in_sql() {
        let backend = SqliteConfigBackend::open_in_memory().unwrap();
        let sel = ServerSelector::AllServers;
        let descriptor = OptionDescriptor {
            code: 23,
            space: "dhcp6".into(),
            value: "2001:db8::53".into(),
            persistent: false,
            cancelled: false,
            stamp: Default::default(),
        };
        let pool_scope = OptionScope::Pool {
            start: "2001:db8::100".parse().unwrap(),
            end: "2001:db8::1ff".parse().unwrap(),
        };
        backend
            .upsert_option(&sel, &OptionScope::Global, descriptor.clone())
            .unwrap();
        backend.upsert_option(&sel, &pool_scope, descriptor).unwrap();

        assert_eq!(backend.all_options(&sel).unwrap().len(), 2);
        let (scope, option) = backend
            .all_options(&sel)
            .unwrap()
            .into_iter()
            .find(|(s, _)| matches!(s, OptionScope::Pool { .. }))
            .unwrap();
        assert_eq!(scope, pool_scope);
        assert_eq!(option.code, 23);
    }
}
