//! Configuration backends.
//!
//! Server configuration (subnets, shared networks, option definitions,
//! option instances, global parameters) is persisted per entity, scoped by
//! a [`ServerSelector`], and every committed write appends an
//! [`AuditEntry`]. Peer servers and the in-process reconfiguration task
//! tail the audit log to learn that something changed, then re-read the
//! entities they care about.
//!
//! An entity key owns a single row. Writing the same key under a different
//! selector reassigns the entity's server tags, so reads under
//! `AnyServer` never see two rows for one key; the latest write wins by
//! construction.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use compact_str::{CompactString, ToCompactString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, SubnetId};

pub mod entities;
pub mod memory;
pub mod sqlite;

pub use entities::{
    GlobalParameter, OptionDefinition, OptionDescriptor, OptionScope, PdPool, PickerKind, Pool4,
    Pool6, SharedNetwork4, SharedNetwork6, Stamped, StampedInfo, Subnet4, Subnet6,
};
pub use memory::MemoryConfigBackend;
pub use sqlite::SqliteConfigBackend;

use crate::SchemaVersion;

/// Schema version of the configuration store.
pub const CONFIG_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(3, 0);

/// The reserved tag carried by entities that apply to every server.
pub const ALL_TAG: &str = "all";

/// Scopes a configuration read or write to a subset of the configured
/// servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerSelector {
    /// No server association yet. Rejected by every operation here.
    Unassigned,
    /// Entities explicitly shared by all servers.
    AllServers,
    OneServer(CompactString),
    MultipleServers(BTreeSet<CompactString>),
    /// Query-only: the union across all tags.
    AnyServer,
}

impl ServerSelector {
    pub fn one(tag: impl Into<CompactString>) -> Self {
        ServerSelector::OneServer(tag.into())
    }

    /// Parses the wire form: `all`, `any`, `unassigned`, a single tag, or
    /// a comma-separated tag set.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim() {
            "" => Err(Error::BadValue("empty server selector".into())),
            "all" => Ok(ServerSelector::AllServers),
            "any" => Ok(ServerSelector::AnyServer),
            "unassigned" => Ok(ServerSelector::Unassigned),
            one if !one.contains(',') => Ok(ServerSelector::one(one)),
            many => {
                let tags: BTreeSet<CompactString> = many
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| t.to_compact_string())
                    .collect();
                if tags.is_empty() {
                    return Err(Error::BadValue("empty server selector set".into()));
                }
                Ok(ServerSelector::MultipleServers(tags))
            }
        }
    }

    /// The tags a write under this selector assigns to the entity.
    /// Writes reject `Unassigned` and the query-only `AnyServer`.
    pub fn write_tags(&self) -> Result<BTreeSet<CompactString>> {
        match self {
            ServerSelector::Unassigned => Err(Error::NotImplemented(
                "writes require an assigned server selector".into(),
            )),
            ServerSelector::AnyServer => Err(Error::BadValue(
                "`any` is a query-only server selector".into(),
            )),
            ServerSelector::AllServers => {
                Ok(std::iter::once(CompactString::const_new(ALL_TAG)).collect())
            }
            ServerSelector::OneServer(tag) => {
                check_plain_tag(tag)?;
                Ok(std::iter::once(tag.clone()).collect())
            }
            ServerSelector::MultipleServers(tags) => {
                if tags.is_empty() {
                    return Err(Error::BadValue("empty server selector set".into()));
                }
                for tag in tags {
                    check_plain_tag(tag)?;
                }
                Ok(tags.clone())
            }
        }
    }

    /// Visibility for reads: a server sees entities carrying its own tag
    /// or the `all` tag.
    pub fn matches_read(&self, tags: &BTreeSet<CompactString>) -> bool {
        match self {
            ServerSelector::Unassigned => false,
            ServerSelector::AnyServer => true,
            ServerSelector::AllServers => tags.iter().any(|t| t == ALL_TAG),
            ServerSelector::OneServer(tag) => tags.iter().any(|t| t == tag || t == ALL_TAG),
            ServerSelector::MultipleServers(wanted) => tags
                .iter()
                .any(|t| t == ALL_TAG || wanted.contains(t.as_str())),
        }
    }

    /// Deletes remove only entities explicitly carrying one of the
    /// selector's literal tags; `all`-tagged entities survive per-server
    /// deletes.
    pub fn matches_delete(&self, tags: &BTreeSet<CompactString>) -> bool {
        match self {
            ServerSelector::Unassigned | ServerSelector::AnyServer => false,
            ServerSelector::AllServers => tags.iter().any(|t| t == ALL_TAG),
            ServerSelector::OneServer(tag) => tags.contains(tag),
            ServerSelector::MultipleServers(wanted) => {
                tags.iter().any(|t| wanted.contains(t.as_str()))
            }
        }
    }

    /// Guard for read operations, which support everything except
    /// `Unassigned`.
    pub fn check_read(&self) -> Result<()> {
        if matches!(self, ServerSelector::Unassigned) {
            return Err(Error::NotImplemented(
                "reads require an assigned server selector".into(),
            ));
        }
        Ok(())
    }
}

fn check_plain_tag(tag: &CompactString) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::BadValue("empty server tag".into()));
    }
    if matches!(tag.as_str(), "all" | "any" | "unassigned") {
        return Err(Error::BadValue(format!(
            "`{tag}` is a reserved selector literal, not a server tag"
        )));
    }
    Ok(())
}

impl fmt::Display for ServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerSelector::Unassigned => f.write_str("unassigned"),
            ServerSelector::AllServers => f.write_str("all"),
            ServerSelector::AnyServer => f.write_str("any"),
            ServerSelector::OneServer(tag) => f.write_str(tag),
            ServerSelector::MultipleServers(tags) => {
                let mut first = true;
                for tag in tags {
                    if !first {
                        f.write_str(",")?;
                    }
                    f.write_str(tag)?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// What a committed write did to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModificationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModificationKind::Create => "create",
            ModificationKind::Update => "update",
            ModificationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl ModificationKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ModificationKind::Create),
            "update" => Ok(ModificationKind::Update),
            "delete" => Ok(ModificationKind::Delete),
            other => Err(Error::BadValue(format!("unknown modification `{other}`"))),
        }
    }
}

/// One committed configuration change.
///
/// Within one server tag, entries are totally ordered by
/// `(modified_at, revision)`; timestamps are strictly increasing per
/// backend instance, revisions per backend lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub object_type: CompactString,
    pub object_id: CompactString,
    pub modification: ModificationKind,
    pub modified_at: DateTime<Utc>,
    pub revision: u64,
    pub server_tags: BTreeSet<CompactString>,
}

/// Callback receiving committed audit batches.
pub type AuditCallback = Box<dyn Fn(&[AuditEntry]) + Send + Sync>;

/// The configuration store contract.
///
/// Key shapes: subnets by id, shared networks by name, option definitions
/// by `(code, space)`, option instances by `(scope, code, space)`, global
/// parameters by name. `delete_*` return the number of rows removed (0 or
/// 1 for keyed deletes); removing nothing is never an error.
pub trait ConfigBackend: Send + Sync {
    fn subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet4>>;
    fn all_subnets4(&self, sel: &ServerSelector) -> Result<Vec<Subnet4>>;
    fn modified_subnets4(&self, sel: &ServerSelector, since: DateTime<Utc>)
        -> Result<Vec<Subnet4>>;
    fn upsert_subnet4(&self, sel: &ServerSelector, subnet: Subnet4) -> Result<()>;
    fn delete_subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64>;
    fn delete_all_subnets4(&self, sel: &ServerSelector) -> Result<u64>;

    fn subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet6>>;
    fn all_subnets6(&self, sel: &ServerSelector) -> Result<Vec<Subnet6>>;
    fn modified_subnets6(&self, sel: &ServerSelector, since: DateTime<Utc>)
        -> Result<Vec<Subnet6>>;
    fn upsert_subnet6(&self, sel: &ServerSelector, subnet: Subnet6) -> Result<()>;
    fn delete_subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64>;
    fn delete_all_subnets6(&self, sel: &ServerSelector) -> Result<u64>;

    fn shared_network4(&self, sel: &ServerSelector, name: &str)
        -> Result<Option<SharedNetwork4>>;
    fn all_shared_networks4(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork4>>;
    fn modified_shared_networks4(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork4>>;
    fn upsert_shared_network4(&self, sel: &ServerSelector, network: SharedNetwork4)
        -> Result<()>;
    fn delete_shared_network4(&self, sel: &ServerSelector, name: &str) -> Result<u64>;
    fn delete_all_shared_networks4(&self, sel: &ServerSelector) -> Result<u64>;

    fn shared_network6(&self, sel: &ServerSelector, name: &str)
        -> Result<Option<SharedNetwork6>>;
    fn all_shared_networks6(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork6>>;
    fn modified_shared_networks6(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork6>>;
    fn upsert_shared_network6(&self, sel: &ServerSelector, network: SharedNetwork6)
        -> Result<()>;
    fn delete_shared_network6(&self, sel: &ServerSelector, name: &str) -> Result<u64>;
    fn delete_all_shared_networks6(&self, sel: &ServerSelector) -> Result<u64>;

    fn option_def(
        &self,
        sel: &ServerSelector,
        code: u16,
        space: &str,
    ) -> Result<Option<OptionDefinition>>;
    fn all_option_defs(&self, sel: &ServerSelector) -> Result<Vec<OptionDefinition>>;
    fn modified_option_defs(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<OptionDefinition>>;
    fn upsert_option_def(&self, sel: &ServerSelector, def: OptionDefinition) -> Result<()>;
    fn delete_option_def(&self, sel: &ServerSelector, code: u16, space: &str) -> Result<u64>;
    fn delete_all_option_defs(&self, sel: &ServerSelector) -> Result<u64>;

    fn option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        code: u16,
        space: &str,
    ) -> Result<Option<OptionDescriptor>>;
    fn all_options(&self, sel: &ServerSelector) -> Result<Vec<(OptionScope, OptionDescriptor)>>;
    fn modified_options(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<(OptionScope, OptionDescriptor)>>;
    fn upsert_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        option: OptionDescriptor,
    ) -> Result<()>;
    fn delete_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        code: u16,
        space: &str,
    ) -> Result<u64>;
    fn delete_all_options(&self, sel: &ServerSelector) -> Result<u64>;

    fn global_parameter(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<GlobalParameter>>;
    fn all_global_parameters(&self, sel: &ServerSelector) -> Result<Vec<GlobalParameter>>;
    fn modified_global_parameters(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalParameter>>;
    fn upsert_global_parameter(
        &self,
        sel: &ServerSelector,
        parameter: GlobalParameter,
    ) -> Result<()>;
    fn delete_global_parameter(&self, sel: &ServerSelector, name: &str) -> Result<u64>;
    fn delete_all_global_parameters(&self, sel: &ServerSelector) -> Result<u64>;

    /// Entries visible to the selector with `modified_at` strictly after
    /// `since`, ordered by `(modified_at, revision)`.
    fn recent_audit_entries(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>>;

    /// Registers an observer that receives every committed audit batch.
    /// The name identifies the subscriber in logs and must not be empty.
    fn subscribe(&self, name: &str, callback: AuditCallback) -> Result<()>;

    fn name(&self) -> &'static str;
    fn schema_version(&self) -> Result<SchemaVersion>;
}

/// Hands out strictly increasing audit timestamps and revisions.
///
/// Wall clocks can stand still between two writes; nudging the stamp one
/// microsecond past the previous one keeps the `(timestamp, revision)`
/// order total and makes "strictly after" filters deterministic.
pub(crate) struct AuditClock {
    last: Mutex<DateTime<Utc>>,
    revision: AtomicU64,
}

impl AuditClock {
    pub(crate) fn new() -> Self {
        AuditClock {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
            revision: AtomicU64::new(0),
        }
    }

    pub(crate) fn resume_from(last_revision: u64) -> Self {
        AuditClock {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
            revision: AtomicU64::new(last_revision),
        }
    }

    pub(crate) fn next(&self) -> (DateTime<Utc>, u64) {
        let mut last = self.last.lock().expect("audit clock mutex poisoned");
        let mut now = Utc::now();
        if now <= *last {
            now = *last + Duration::microseconds(1);
        }
        *last = now;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        (now, revision)
    }
}

/// Observer list shared by the backends.
pub(crate) struct ObserverList {
    observers: Mutex<Vec<(CompactString, AuditCallback)>>,
}

impl ObserverList {
    pub(crate) fn new() -> Self {
        ObserverList {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, name: &str, callback: AuditCallback) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidParameter(
                "audit subscriber name must not be empty".into(),
            ));
        }
        self.observers
            .lock()
            .expect("observer list mutex poisoned")
            .push((name.to_compact_string(), callback));
        Ok(())
    }

    pub(crate) fn notify(&self, batch: &[AuditEntry]) {
        if batch.is_empty() {
            return;
        }
        let observers = self.observers.lock().expect("observer list mutex poisoned");
        for (name, callback) in observers.iter() {
            tracing::trace!(subscriber = %name, entries = batch.len(), "audit notify");
            callback(batch);
        }
    }
}

/// Subnet prefixes visible to one server tag must never overlap.
/// `existing` holds the currently stored subnets; rows whose tags do not
/// intersect the new subnet's are ignored.
pub(crate) fn check_prefix4_disjoint(subnet: &Subnet4, existing: &[Subnet4]) -> Result<()> {
    for other in existing {
        if other.id == subnet.id {
            continue;
        }
        if !subnet.stamp.tags_intersect(&other.stamp) {
            continue;
        }
        if subnet.prefix.contains(&other.prefix) || other.prefix.contains(&subnet.prefix) {
            return Err(Error::BadValue(format!(
                "subnet {} prefix {} overlaps subnet {} prefix {}",
                subnet.id, subnet.prefix, other.id, other.prefix
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_prefix6_disjoint(subnet: &Subnet6, existing: &[Subnet6]) -> Result<()> {
    for other in existing {
        if other.id == subnet.id {
            continue;
        }
        if !subnet.stamp.tags_intersect(&other.stamp) {
            continue;
        }
        if subnet.prefix.contains(&other.prefix) || other.prefix.contains(&subnet.prefix) {
            return Err(Error::BadValue(format!(
                "subnet {} prefix {} overlaps subnet {} prefix {}",
                subnet.id, subnet.prefix, other.id, other.prefix
            )));
        }
    }
    Ok(())
}
