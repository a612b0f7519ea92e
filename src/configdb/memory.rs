//! In-memory configuration backend.
//!
//! Entities live in concurrent maps; the audit log is an append-only
//! vector. Writes serialize on one gate so audit order matches map order
//! exactly. This backend carries no durability and exists for tests and
//! single-host deployments.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString};
use dashmap::DashMap;

use super::{
    check_prefix4_disjoint, check_prefix6_disjoint, AuditCallback, AuditClock, AuditEntry,
    ConfigBackend, GlobalParameter, ModificationKind, ObserverList, OptionDefinition,
    OptionDescriptor, OptionScope, ServerSelector, SharedNetwork4, SharedNetwork6, Stamped,
    Subnet4, Subnet6, CONFIG_SCHEMA_VERSION,
};
use crate::{Result, SchemaVersion, SubnetId};

type OptionKey = (CompactString, u16, CompactString);

pub struct MemoryConfigBackend {
    subnets4: DashMap<SubnetId, Subnet4>,
    subnets6: DashMap<SubnetId, Subnet6>,
    networks4: DashMap<CompactString, SharedNetwork4>,
    networks6: DashMap<CompactString, SharedNetwork6>,
    option_defs: DashMap<(u16, CompactString), OptionDefinition>,
    options: DashMap<OptionKey, (OptionScope, OptionDescriptor)>,
    parameters: DashMap<CompactString, GlobalParameter>,
    audit: Mutex<Vec<AuditEntry>>,
    clock: AuditClock,
    observers: ObserverList,
    write_gate: Mutex<()>,
}

impl MemoryConfigBackend {
    pub fn new() -> Self {
        MemoryConfigBackend {
            subnets4: DashMap::new(),
            subnets6: DashMap::new(),
            networks4: DashMap::new(),
            networks6: DashMap::new(),
            option_defs: DashMap::new(),
            options: DashMap::new(),
            parameters: DashMap::new(),
            audit: Mutex::new(Vec::new()),
            clock: AuditClock::new(),
            observers: ObserverList::new(),
            write_gate: Mutex::new(()),
        }
    }

    fn commit(&self, entries: Vec<AuditEntry>) {
        if entries.is_empty() {
            return;
        }
        self.audit
            .lock()
            .expect("audit log mutex poisoned")
            .extend(entries.iter().cloned());
        self.observers.notify(&entries);
    }

    fn upsert_row<K: Eq + Hash, V: Stamped>(
        &self,
        map: &DashMap<K, V>,
        key: K,
        mut value: V,
        tags: BTreeSet<CompactString>,
        object_type: &str,
        object_id: CompactString,
    ) -> AuditEntry {
        let (modified_at, revision) = self.clock.next();
        value.stamp_mut().modified_at = modified_at;
        value.stamp_mut().server_tags = tags.clone();
        value.stamp_applied();
        let modification = if map.insert(key, value).is_some() {
            ModificationKind::Update
        } else {
            ModificationKind::Create
        };
        AuditEntry {
            object_type: object_type.to_compact_string(),
            object_id,
            modification,
            modified_at,
            revision,
            server_tags: tags,
        }
    }

    fn delete_row<K: Eq + Hash, V: Stamped>(
        &self,
        map: &DashMap<K, V>,
        key: &K,
        sel: &ServerSelector,
        object_type: &str,
        object_id: CompactString,
    ) -> Option<AuditEntry> {
        let tags = {
            let row = map.get(key)?;
            if !sel.matches_delete(&row.stamp().server_tags) {
                return None;
            }
            row.stamp().server_tags.clone()
        };
        map.remove(key)?;
        let (modified_at, revision) = self.clock.next();
        Some(AuditEntry {
            object_type: object_type.to_compact_string(),
            object_id,
            modification: ModificationKind::Delete,
            modified_at,
            revision,
            server_tags: tags,
        })
    }

    fn get_visible<K: Eq + Hash, V: Stamped + Clone>(
        map: &DashMap<K, V>,
        sel: &ServerSelector,
        key: &K,
    ) -> Result<Option<V>> {
        sel.check_read()?;
        Ok(map
            .get(key)
            .filter(|row| sel.matches_read(&row.stamp().server_tags))
            .map(|row| row.value().clone()))
    }

    fn all_visible<K: Eq + Hash, V: Stamped + Clone>(
        map: &DashMap<K, V>,
        sel: &ServerSelector,
    ) -> Result<Vec<V>> {
        sel.check_read()?;
        Ok(map
            .iter()
            .filter(|row| sel.matches_read(&row.value().stamp().server_tags))
            .map(|row| row.value().clone())
            .collect())
    }
}

impl Default for MemoryConfigBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBackend for MemoryConfigBackend {
    fn subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet4>> {
        Self::get_visible(&self.subnets4, sel, &id)
    }

    fn all_subnets4(&self, sel: &ServerSelector) -> Result<Vec<Subnet4>> {
        let mut subnets = Self::all_visible(&self.subnets4, sel)?;
        subnets.sort_by_key(|s| s.id);
        Ok(subnets)
    }

    fn modified_subnets4(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<Subnet4>> {
        let mut subnets = Self::all_visible(&self.subnets4, sel)?;
        subnets.retain(|s| s.stamp.modified_at > since);
        subnets.sort_by_key(|s| s.stamp.modified_at);
        Ok(subnets)
    }

    fn upsert_subnet4(&self, sel: &ServerSelector, mut subnet: Subnet4) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        subnet.validate()?;
        subnet.stamp.server_tags = tags.clone();
        let existing: Vec<Subnet4> = self.subnets4.iter().map(|r| r.value().clone()).collect();
        check_prefix4_disjoint(&subnet, &existing)?;

        let id = subnet.id;
        let entry = self.upsert_row(
            &self.subnets4,
            id,
            subnet,
            tags,
            "subnet4",
            id.to_compact_string(),
        );
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_subnet4(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        match self.delete_row(&self.subnets4, &id, sel, "subnet4", id.to_compact_string()) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_subnets4(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let ids: Vec<SubnetId> = self.subnets4.iter().map(|r| r.value().id).collect();
        let mut entries = Vec::new();
        for id in ids {
            if let Some(entry) =
                self.delete_row(&self.subnets4, &id, sel, "subnet4", id.to_compact_string())
            {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
        Ok(count)
    }

    fn subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<Option<Subnet6>> {
        Self::get_visible(&self.subnets6, sel, &id)
    }

    fn all_subnets6(&self, sel: &ServerSelector) -> Result<Vec<Subnet6>> {
        let mut subnets = Self::all_visible(&self.subnets6, sel)?;
        subnets.sort_by_key(|s| s.id);
        Ok(subnets)
    }

    fn modified_subnets6(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<Subnet6>> {
        let mut subnets = Self::all_visible(&self.subnets6, sel)?;
        subnets.retain(|s| s.stamp.modified_at > since);
        subnets.sort_by_key(|s| s.stamp.modified_at);
        Ok(subnets)
    }

    fn upsert_subnet6(&self, sel: &ServerSelector, mut subnet: Subnet6) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        subnet.validate()?;
        subnet.stamp.server_tags = tags.clone();
        let existing: Vec<Subnet6> = self.subnets6.iter().map(|r| r.value().clone()).collect();
        check_prefix6_disjoint(&subnet, &existing)?;

        let id = subnet.id;
        let entry = self.upsert_row(
            &self.subnets6,
            id,
            subnet,
            tags,
            "subnet6",
            id.to_compact_string(),
        );
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_subnet6(&self, sel: &ServerSelector, id: SubnetId) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        match self.delete_row(&self.subnets6, &id, sel, "subnet6", id.to_compact_string()) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_subnets6(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let ids: Vec<SubnetId> = self.subnets6.iter().map(|r| r.value().id).collect();
        let mut entries = Vec::new();
        for id in ids {
            if let Some(entry) =
                self.delete_row(&self.subnets6, &id, sel, "subnet6", id.to_compact_string())
            {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
        Ok(count)
    }

    fn shared_network4(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<SharedNetwork4>> {
        Self::get_visible(&self.networks4, sel, &name.to_compact_string())
    }

    fn all_shared_networks4(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork4>> {
        let mut networks = Self::all_visible(&self.networks4, sel)?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn modified_shared_networks4(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork4>> {
        let mut networks = Self::all_visible(&self.networks4, sel)?;
        networks.retain(|n| n.stamp.modified_at > since);
        networks.sort_by_key(|n| n.stamp.modified_at);
        Ok(networks)
    }

    fn upsert_shared_network4(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork4,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        let name = network.name.clone();
        let entry = self.upsert_row(
            &self.networks4,
            name.clone(),
            network,
            tags,
            "shared-network4",
            name,
        );
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_shared_network4(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let key = name.to_compact_string();
        match self.delete_row(&self.networks4, &key, sel, "shared-network4", key.clone()) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_shared_networks4(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let names: Vec<CompactString> = self.networks4.iter().map(|r| r.key().clone()).collect();
        let mut entries = Vec::new();
        for name in names {
            if let Some(entry) =
                self.delete_row(&self.networks4, &name, sel, "shared-network4", name.clone())
            {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
        Ok(count)
    }

    fn shared_network6(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<SharedNetwork6>> {
        Self::get_visible(&self.networks6, sel, &name.to_compact_string())
    }

    fn all_shared_networks6(&self, sel: &ServerSelector) -> Result<Vec<SharedNetwork6>> {
        let mut networks = Self::all_visible(&self.networks6, sel)?;
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn modified_shared_networks6(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<SharedNetwork6>> {
        let mut networks = Self::all_visible(&self.networks6, sel)?;
        networks.retain(|n| n.stamp.modified_at > since);
        networks.sort_by_key(|n| n.stamp.modified_at);
        Ok(networks)
    }

    fn upsert_shared_network6(
        &self,
        sel: &ServerSelector,
        network: SharedNetwork6,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        let name = network.name.clone();
        let entry = self.upsert_row(
            &self.networks6,
            name.clone(),
            network,
            tags,
            "shared-network6",
            name,
        );
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_shared_network6(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let key = name.to_compact_string();
        match self.delete_row(&self.networks6, &key, sel, "shared-network6", key.clone()) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_shared_networks6(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let names: Vec<CompactString> = self.networks6.iter().map(|r| r.key().clone()).collect();
        let mut entries = Vec::new();
        for name in names {
            if let Some(entry) =
                self.delete_row(&self.networks6, &name, sel, "shared-network6", name.clone())
            {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
        Ok(count)
    }

    fn option_def(
        &self,
        sel: &ServerSelector,
        code: u16,
        space: &str,
    ) -> Result<Option<OptionDefinition>> {
        Self::get_visible(&self.option_defs, sel, &(code, space.to_compact_string()))
    }

    fn all_option_defs(&self, sel: &ServerSelector) -> Result<Vec<OptionDefinition>> {
        let mut defs = Self::all_visible(&self.option_defs, sel)?;
        defs.sort_by(|a, b| (a.space.clone(), a.code).cmp(&(b.space.clone(), b.code)));
        Ok(defs)
    }

    fn modified_option_defs(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<OptionDefinition>> {
        let mut defs = Self::all_visible(&self.option_defs, sel)?;
        defs.retain(|d| d.stamp.modified_at > since);
        defs.sort_by_key(|d| d.stamp.modified_at);
        Ok(defs)
    }

    fn upsert_option_def(&self, sel: &ServerSelector, def: OptionDefinition) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        def.validate()?;
        let object_id = format!("{}:{}", def.space, def.code).to_compact_string();
        let key = (def.code, def.space.clone());
        let entry = self.upsert_row(&self.option_defs, key, def, tags, "option-def", object_id);
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_option_def(&self, sel: &ServerSelector, code: u16, space: &str) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let key = (code, space.to_compact_string());
        let object_id = format!("{space}:{code}").to_compact_string();
        match self.delete_row(&self.option_defs, &key, sel, "option-def", object_id) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_option_defs(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let keys: Vec<(u16, CompactString)> =
            self.option_defs.iter().map(|r| r.key().clone()).collect();
        let mut entries = Vec::new();
        for key in keys {
            let object_id = format!("{}:{}", key.1, key.0).to_compact_string();
            if let Some(entry) =
                self.delete_row(&self.option_defs, &key, sel, "option-def", object_id)
            {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
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
        let key = (
            scope.to_compact_string(),
            code,
            space.to_compact_string(),
        );
        Ok(self
            .options
            .get(&key)
            .filter(|row| sel.matches_read(&row.value().1.stamp.server_tags))
            .map(|row| row.value().1.clone()))
    }

    fn all_options(&self, sel: &ServerSelector) -> Result<Vec<(OptionScope, OptionDescriptor)>> {
        sel.check_read()?;
        let mut options: Vec<(OptionScope, OptionDescriptor)> = self
            .options
            .iter()
            .filter(|row| sel.matches_read(&row.value().1.stamp.server_tags))
            .map(|row| row.value().clone())
            .collect();
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
        sel.check_read()?;
        let mut options: Vec<(OptionScope, OptionDescriptor)> = self
            .options
            .iter()
            .filter(|row| {
                let option = &row.value().1;
                sel.matches_read(&option.stamp.server_tags) && option.stamp.modified_at > since
            })
            .map(|row| row.value().clone())
            .collect();
        options.sort_by_key(|(_, o)| o.stamp.modified_at);
        Ok(options)
    }

    fn upsert_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        mut option: OptionDescriptor,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        let key = (
            scope.to_compact_string(),
            option.code,
            option.space.clone(),
        );
        let object_id = format!("{scope}:{}:{}", option.space, option.code).to_compact_string();

        let (modified_at, revision) = self.clock.next();
        option.stamp.modified_at = modified_at;
        option.stamp.server_tags = tags.clone();
        let modification = if self
            .options
            .insert(key, (scope.clone(), option))
            .is_some()
        {
            ModificationKind::Update
        } else {
            ModificationKind::Create
        };
        self.commit(vec![AuditEntry {
            object_type: "option".to_compact_string(),
            object_id,
            modification,
            modified_at,
            revision,
            server_tags: tags,
        }]);
        Ok(())
    }

    fn delete_option(
        &self,
        sel: &ServerSelector,
        scope: &OptionScope,
        code: u16,
        space: &str,
    ) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let key = (scope.to_compact_string(), code, space.to_compact_string());
        let tags = {
            let Some(row) = self.options.get(&key) else {
                return Ok(0);
            };
            if !sel.matches_delete(&row.value().1.stamp.server_tags) {
                return Ok(0);
            }
            row.value().1.stamp.server_tags.clone()
        };
        self.options.remove(&key);
        let (modified_at, revision) = self.clock.next();
        self.commit(vec![AuditEntry {
            object_type: "option".to_compact_string(),
            object_id: format!("{scope}:{space}:{code}").to_compact_string(),
            modification: ModificationKind::Delete,
            modified_at,
            revision,
            server_tags: tags,
        }]);
        Ok(1)
    }

    fn delete_all_options(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let rows: Vec<(OptionKey, OptionScope)> = self
            .options
            .iter()
            .map(|r| (r.key().clone(), r.value().0.clone()))
            .collect();
        let mut count = 0;
        let mut entries = Vec::new();
        for ((scope_key, code, space), scope) in rows {
            let key = (scope_key, code, space.clone());
            let tags = {
                let Some(row) = self.options.get(&key) else {
                    continue;
                };
                if !sel.matches_delete(&row.value().1.stamp.server_tags) {
                    continue;
                }
                row.value().1.stamp.server_tags.clone()
            };
            self.options.remove(&key);
            let (modified_at, revision) = self.clock.next();
            entries.push(AuditEntry {
                object_type: "option".to_compact_string(),
                object_id: format!("{scope}:{space}:{code}").to_compact_string(),
                modification: ModificationKind::Delete,
                modified_at,
                revision,
                server_tags: tags,
            });
            count += 1;
        }
        self.commit(entries);
        Ok(count)
    }

    fn global_parameter(
        &self,
        sel: &ServerSelector,
        name: &str,
    ) -> Result<Option<GlobalParameter>> {
        Self::get_visible(&self.parameters, sel, &name.to_compact_string())
    }

    fn all_global_parameters(&self, sel: &ServerSelector) -> Result<Vec<GlobalParameter>> {
        let mut parameters = Self::all_visible(&self.parameters, sel)?;
        parameters.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(parameters)
    }

    fn modified_global_parameters(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<GlobalParameter>> {
        let mut parameters = Self::all_visible(&self.parameters, sel)?;
        parameters.retain(|p| p.stamp.modified_at > since);
        parameters.sort_by_key(|p| p.stamp.modified_at);
        Ok(parameters)
    }

    fn upsert_global_parameter(
        &self,
        sel: &ServerSelector,
        parameter: GlobalParameter,
    ) -> Result<()> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        let tags = sel.write_tags()?;
        let name = parameter.name().to_compact_string();
        let entry = self.upsert_row(
            &self.parameters,
            name.clone(),
            parameter,
            tags,
            "global-parameter",
            name,
        );
        self.commit(vec![entry]);
        Ok(())
    }

    fn delete_global_parameter(&self, sel: &ServerSelector, name: &str) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let key = name.to_compact_string();
        match self.delete_row(&self.parameters, &key, sel, "global-parameter", key.clone()) {
            Some(entry) => {
                self.commit(vec![entry]);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn delete_all_global_parameters(&self, sel: &ServerSelector) -> Result<u64> {
        let _gate = self.write_gate.lock().expect("config write gate poisoned");
        sel.write_tags()?;
        let names: Vec<CompactString> =
            self.parameters.iter().map(|r| r.key().clone()).collect();
        let mut entries = Vec::new();
        for name in names {
            if let Some(entry) = self.delete_row(
                &self.parameters,
                &name,
                sel,
                "global-parameter",
                name.clone(),
            ) {
                entries.push(entry);
            }
        }
        let count = entries.len() as u64;
        self.commit(entries);
        Ok(count)
    }

    fn recent_audit_entries(
        &self,
        sel: &ServerSelector,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        sel.check_read()?;
        let log = self.audit.lock().expect("audit log mutex poisoned");
        let mut entries: Vec<AuditEntry> = log
            .iter()
            .filter(|e| e.modified_at > since && sel.matches_read(&e.server_tags))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.modified_at, e.revision));
        Ok(entries)
    }

    fn subscribe(&self, name: &str, callback: AuditCallback) -> Result<()> {
        self.observers.subscribe(name, callback)
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn schema_version(&self) -> Result<SchemaVersion> {
        Ok(CONFIG_SCHEMA_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamped::{ElementValue, StampedValue};
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn subnet(id: u32, prefix: &str) -> Subnet4 {
        Subnet4::new(SubnetId::from_raw(id), prefix.parse().unwrap(), 3600)
    }

    #[test]
    fn unassigned_selector_rejected_for_writes() {
        let backend = MemoryConfigBackend::new();
        let err = backend
            .upsert_subnet4(&ServerSelector::Unassigned, subnet(1, "192.0.2.0/24"))
            .unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[test]
    fn idempotent_upsert_creates_then_updates() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::one("edge-1");
        let s = subnet(1, "192.0.2.0/24");
        backend.upsert_subnet4(&sel, s.clone()).unwrap();
        backend.upsert_subnet4(&sel, s.clone()).unwrap();

        let entries = backend
            .recent_audit_entries(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].modification, ModificationKind::Create);
        assert_eq!(entries[1].modification, ModificationKind::Update);

        let stored = backend.subnet4(&sel, s.id).unwrap().unwrap();
        assert_eq!(stored.prefix, s.prefix);
        assert_eq!(stored.pools, s.pools);
    }

    #[test]
    fn audit_tail_is_strictly_after() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::one("edge-1");
        backend
            .upsert_subnet4(&sel, subnet(1, "192.0.2.0/24"))
            .unwrap();
        let after_create = backend
            .recent_audit_entries(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap()[0]
            .modified_at;
        backend.delete_subnet4(&sel, SubnetId::from_raw(1)).unwrap();

        let both = backend
            .recent_audit_entries(&sel, after_create - chrono::Duration::microseconds(1))
            .unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].modification, ModificationKind::Create);
        assert_eq!(both[1].modification, ModificationKind::Delete);

        let only_delete = backend.recent_audit_entries(&sel, after_create).unwrap();
        assert_eq!(only_delete.len(), 1);
        assert_eq!(only_delete[0].modification, ModificationKind::Delete);
    }

    #[test]
    fn audit_timestamps_non_decreasing() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::one("edge-1");
        for i in 1..=5 {
            backend
                .upsert_subnet4(&sel, subnet(i, &format!("10.{i}.0.0/24")))
                .unwrap();
        }
        let entries = backend
            .recent_audit_entries(&sel, DateTime::<Utc>::MIN_UTC)
            .unwrap();
        for pair in entries.windows(2) {
            assert!(pair[0].modified_at <= pair[1].modified_at);
            assert!(pair[0].revision < pair[1].revision);
        }
    }

    #[test]
    fn overlapping_prefixes_rejected_per_tag() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::one("edge-1");
        backend
            .upsert_subnet4(&sel, subnet(1, "10.0.0.0/16"))
            .unwrap();
        let err = backend
            .upsert_subnet4(&sel, subnet(2, "10.0.1.0/24"))
            .unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));

        // disjoint tag sets may hold overlapping prefixes
        backend
            .upsert_subnet4(&ServerSelector::one("edge-2"), subnet(3, "10.0.2.0/24"))
            .unwrap();
    }

    #[test]
    fn all_servers_delete_leaves_per_server_rows() {
        let backend = MemoryConfigBackend::new();
        backend
            .upsert_subnet4(&ServerSelector::AllServers, subnet(1, "192.0.2.0/24"))
            .unwrap();
        backend
            .upsert_subnet4(&ServerSelector::one("edge-1"), subnet(2, "198.51.100.0/24"))
            .unwrap();

        assert_eq!(
            backend.delete_all_subnets4(&ServerSelector::AllServers).unwrap(),
            1
        );
        assert!(backend
            .subnet4(&ServerSelector::AnyServer, SubnetId::from_raw(2))
            .unwrap()
            .is_some());
    }

    #[test]
    fn option_scopes_do_not_collide() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::AllServers;
        let descriptor = OptionDescriptor {
            code: 6,
            space: "dhcp4".into(),
            value: "192.0.2.53".into(),
            persistent: true,
            cancelled: false,
            stamp: Default::default(),
        };
        backend
            .upsert_option(&sel, &OptionScope::Global, descriptor.clone())
            .unwrap();
        backend
            .upsert_option(
                &sel,
                &OptionScope::Subnet {
                    subnet_id: SubnetId::from_raw(7),
                },
                descriptor.clone(),
            )
            .unwrap();

        assert_eq!(backend.all_options(&sel).unwrap().len(), 2);
        assert!(backend
            .option(&sel, &OptionScope::Global, 6, "dhcp4")
            .unwrap()
            .is_some());
        assert_eq!(
            backend
                .delete_option(&sel, &OptionScope::Global, 6, "dhcp4")
                .unwrap(),
            1
        );
        assert!(backend
            .option(
                &sel,
                &OptionScope::Subnet {
                    subnet_id: SubnetId::from_raw(7)
                },
                6,
                "dhcp4"
            )
            .unwrap()
            .is_some());
    }

    #[test]
    fn observers_receive_committed_batches() {
        let backend = MemoryConfigBackend::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        backend
            .subscribe(
                "reconfig",
                Box::new(move |batch| {
                    counter.fetch_add(batch.len(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        let sel = ServerSelector::one("edge-1");
        backend
            .upsert_subnet4(&sel, subnet(1, "192.0.2.0/24"))
            .unwrap();
        backend.delete_subnet4(&sel, SubnetId::from_raw(1)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn global_parameter_round_trip() {
        let backend = MemoryConfigBackend::new();
        let sel = ServerSelector::AllServers;
        let param = GlobalParameter::new(StampedValue::with_value(
            "renew-timer",
            ElementValue::Integer(1000),
        ));
        backend.upsert_global_parameter(&sel, param).unwrap();

        let read = backend
            .global_parameter(&sel, "renew-timer")
            .unwrap()
            .unwrap();
        assert_eq!(read.value.get_integer().unwrap(), 1000);
        // stamp on the wrapper and the value stay in sync
        assert_eq!(read.stamp.modified_at, read.value.modified_at());
    }
}
