//! In-memory document tree
//!
//! Groups and entries live in flat maps keyed by UUID; parent/child links are
//! UUID references. The root group owns the whole forest.

use crate::binary::{BinaryId, BinaryPool};
use crate::document::node::XmlNode;
use crate::entry::{Entry, FieldValue, SecureString};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::header::SavePolicy;
use crate::meta::Meta;
use crate::protect::{ProtectedValue, ProtectionKey};
use crate::rules::FormatVersion;
use crate::times::now;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Record of a deleted group or entry, used by clients when merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

/// A KeePass database with entries and groups
#[derive(Debug)]
pub struct Database {
    pub meta: Meta,
    /// All entries indexed by UUID
    entries: HashMap<Uuid, Entry>,
    /// All groups indexed by UUID
    groups: HashMap<Uuid, Group>,
    /// Root group UUID
    root_group: Uuid,
    binaries: BinaryPool,
    pub deleted_objects: Vec<DeletedObject>,
    protection: ProtectionKey,
    /// First keystream offset not used by any protected value
    next_protected_offset: u64,
    policy: SavePolicy,
    /// Unrecognised children of `KeePassFile`
    pub(crate) unknown: Vec<XmlNode>,
    /// Unrecognised children of `Root`
    pub(crate) root_unknown: Vec<XmlNode>,
}

/// Everything the document reader recovers from a file
pub(crate) struct DocumentParts {
    pub meta: Meta,
    pub entries: HashMap<Uuid, Entry>,
    pub groups: HashMap<Uuid, Group>,
    pub root_group: Uuid,
    pub binaries: BinaryPool,
    pub deleted_objects: Vec<DeletedObject>,
    pub protection: ProtectionKey,
    pub next_protected_offset: u64,
    pub unknown: Vec<XmlNode>,
    pub root_unknown: Vec<XmlNode>,
}

/// Metadata about the database (for display)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub entry_count: usize,
    pub group_count: usize,
    pub attachment_count: usize,
}

impl Database {
    /// Create a new empty database written as KDBX 4 by default
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_policy(name, SavePolicy::default())
    }

    pub fn with_policy(name: impl Into<String>, policy: SavePolicy) -> Self {
        let name = name.into();
        let root = Group::new(name.clone());
        let root_uuid = root.uuid;

        let mut groups = HashMap::new();
        groups.insert(root_uuid, root);

        Self {
            meta: Meta::new(name),
            entries: HashMap::new(),
            groups,
            root_group: root_uuid,
            binaries: BinaryPool::new(),
            deleted_objects: Vec::new(),
            protection: ProtectionKey::generate(policy.inner_stream()),
            next_protected_offset: 0,
            policy,
            unknown: Vec::new(),
            root_unknown: Vec::new(),
        }
    }

    pub(crate) fn from_parts(parts: DocumentParts, policy: SavePolicy) -> Self {
        Self {
            meta: parts.meta,
            entries: parts.entries,
            groups: parts.groups,
            root_group: parts.root_group,
            binaries: parts.binaries,
            deleted_objects: parts.deleted_objects,
            protection: parts.protection,
            next_protected_offset: parts.next_protected_offset,
            policy,
            unknown: parts.unknown,
            root_unknown: parts.root_unknown,
        }
    }

    /// Get database metadata
    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.meta.database_name.clone(),
            description: self.meta.database_description.clone(),
            version: self.policy.version.to_string(),
            entry_count: self.entries.len(),
            group_count: self.groups.len(),
            attachment_count: self
                .entries
                .values()
                .flat_map(Entry::referenced_binaries)
                .collect::<HashSet<_>>()
                .len(),
        }
    }

    /// Format the database was read from, or will be written as
    pub fn format_version(&self) -> FormatVersion {
        self.policy.version
    }

    /// Policy used by [`Database::save`]
    pub fn policy(&self) -> &SavePolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: SavePolicy) -> Result<()> {
        policy.validate()?;
        self.policy = policy;
        Ok(())
    }

    pub(crate) fn protection_key(&self) -> &ProtectionKey {
        &self.protection
    }

    pub fn binaries(&self) -> &BinaryPool {
        &self.binaries
    }

    pub fn attachment_data(&self, id: &BinaryId) -> Option<&[u8]> {
        self.binaries.get(id).map(|b| b.data.as_slice())
    }

    pub fn root_uuid(&self) -> Uuid {
        self.root_group
    }

    /// Get the root group
    pub fn root_group(&self) -> &Group {
        &self.groups[&self.root_group]
    }

    /// Get all entries, in no particular order
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Get an entry by UUID
    pub fn get_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    /// Get a mutable entry by UUID. Use [`Database::move_entry`] rather than
    /// changing `parent_group` here.
    pub fn get_entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        self.entries.get_mut(uuid)
    }

    /// Get all groups, in no particular order
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get a group by UUID
    pub fn get_group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    /// Get a mutable group by UUID. Use the move operations rather than
    /// changing `parent`, `children` or `entries` here.
    pub fn get_group_mut(&mut self, uuid: &Uuid) -> Option<&mut Group> {
        self.groups.get_mut(uuid)
    }

    /// Get entries in a specific group
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| {
                group
                    .entries
                    .iter()
                    .filter_map(|uuid| self.entries.get(uuid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every entry in document order (each group's entries before its subgroups)
    pub fn entries_in_order(&self) -> Vec<&Entry> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut stack = vec![self.root_group];
        while let Some(uuid) = stack.pop() {
            let Some(group) = self.groups.get(&uuid) else {
                continue;
            };
            out.extend(group.entries.iter().filter_map(|e| self.entries.get(e)));
            stack.extend(group.children.iter().rev());
        }
        out
    }

    /// Path of group names from the root down to `group_uuid`
    pub fn group_path(&self, group_uuid: &Uuid) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self.groups.get(group_uuid);
        while let Some(group) = current {
            path.push(group.name.as_str());
            current = group.parent.and_then(|p| self.groups.get(&p));
            if path.len() > self.groups.len() {
                break;
            }
        }
        path.reverse();
        path
    }

    fn ensure_unused(&self, uuid: Uuid) -> Result<()> {
        if self.entries.contains_key(&uuid) || self.groups.contains_key(&uuid) {
            return Err(Error::DuplicateUuid(uuid));
        }
        Ok(())
    }

    /// Add a group to the database, under the root unless a parent is set
    pub fn add_group(&mut self, mut group: Group) -> Result<Uuid> {
        let group_uuid = group.uuid;
        self.ensure_unused(group_uuid)?;

        let parent_uuid = *group.parent.get_or_insert(self.root_group);
        let parent = self
            .groups
            .get_mut(&parent_uuid)
            .ok_or(Error::GroupNotFound(parent_uuid))?;
        parent.add_child(group_uuid);

        group.children.clear();
        group.entries.clear();
        tracing::debug!("Added group {}", group_uuid);
        self.groups.insert(group_uuid, group);
        Ok(group_uuid)
    }

    /// Add an entry to the database, under the root unless a parent is set.
    ///
    /// Plain values of fields covered by the memory protection settings are
    /// protected on insertion.
    pub fn add_entry(&mut self, mut entry: Entry) -> Result<Uuid> {
        let entry_uuid = entry.uuid;
        self.ensure_unused(entry_uuid)?;

        let parent_uuid = *entry.parent_group.get_or_insert(self.root_group);
        if !self.groups.contains_key(&parent_uuid) {
            return Err(Error::GroupNotFound(parent_uuid));
        }

        for snapshot in &mut entry.history {
            snapshot.history.clear();
            snapshot.parent_group = None;
        }
        for field in entry.fields_mut() {
            if !self.meta.memory_protection.protects(&field.key) {
                continue;
            }
            if let FieldValue::Plain(text) = &mut field.value {
                let protected = self.protection.protect_at(self.next_protected_offset, text.as_bytes())?;
                self.next_protected_offset = protected.end();
                zeroize::Zeroize::zeroize(text);
                field.value = FieldValue::Protected(protected);
            }
        }

        if let Some(group) = self.groups.get_mut(&parent_uuid) {
            group.add_entry(entry_uuid);
        }
        tracing::debug!("Added entry {}", entry_uuid);
        self.entries.insert(entry_uuid, entry);
        Ok(entry_uuid)
    }

    /// Delete an entry
    pub fn remove_entry(&mut self, uuid: &Uuid) -> Result<Entry> {
        let entry = self
            .entries
            .remove(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;

        // Remove from parent group
        if let Some(parent_uuid) = entry.parent_group {
            if let Some(group) = self.groups.get_mut(&parent_uuid) {
                group.remove_entry(uuid);
            }
        }
        self.record_deletion(*uuid);
        self.prune_binaries();
        Ok(entry)
    }

    /// Delete a group with everything below it
    pub fn remove_group(&mut self, uuid: &Uuid) -> Result<()> {
        if uuid == &self.root_group {
            return Err(Error::InvalidGroup("Cannot delete root group".to_string()));
        }
        let parent = self
            .groups
            .get(uuid)
            .ok_or(Error::GroupNotFound(*uuid))?
            .parent;

        if let Some(parent) = parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.remove_child(uuid);
        }

        let mut stack = vec![*uuid];
        while let Some(current) = stack.pop() {
            let Some(group) = self.groups.remove(&current) else {
                continue;
            };
            for entry_uuid in &group.entries {
                if self.entries.remove(entry_uuid).is_some() {
                    self.record_deletion(*entry_uuid);
                }
            }
            stack.extend(group.children.iter().copied());
            self.record_deletion(current);
        }
        self.prune_binaries();
        Ok(())
    }

    /// Drop pool payloads that no entry or history revision references
    fn prune_binaries(&mut self) {
        let before = self.binaries.len();
        self.binaries
            .retain_referenced(self.entries.values().flat_map(Entry::referenced_binaries));
        let dropped = before - self.binaries.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} unreferenced attachments", dropped);
        }
    }

    fn record_deletion(&mut self, uuid: Uuid) {
        self.deleted_objects.push(DeletedObject {
            uuid,
            deletion_time: now(),
        });
    }

    /// Whether `ancestor` is `node` or lies on the path from `node` to the root
    pub fn is_ancestor(&self, ancestor: &Uuid, node: &Uuid) -> bool {
        let mut current = Some(*node);
        let mut steps = 0;
        while let Some(uuid) = current {
            if &uuid == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.groups.len() {
                return false;
            }
            current = self.groups.get(&uuid).and_then(|g| g.parent);
        }
        false
    }

    pub fn move_entry(&mut self, uuid: &Uuid, target_group: &Uuid) -> Result<()> {
        if !self.groups.contains_key(target_group) {
            return Err(Error::GroupNotFound(*target_group));
        }
        let entry = self
            .entries
            .get_mut(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;
        let old_parent = entry.parent_group.replace(*target_group);
        entry.times.location_changed = now();

        if let Some(old) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            old.remove_entry(uuid);
        }
        if let Some(target) = self.groups.get_mut(target_group) {
            target.add_entry(*uuid);
        }
        Ok(())
    }

    /// Reparent a group. Moving a group into itself or one of its
    /// descendants is rejected.
    pub fn move_group(&mut self, uuid: &Uuid, target_group: &Uuid) -> Result<()> {
        if uuid == &self.root_group {
            return Err(Error::InvalidMove("the root group cannot be moved".to_string()));
        }
        if !self.groups.contains_key(uuid) {
            return Err(Error::GroupNotFound(*uuid));
        }
        if !self.groups.contains_key(target_group) {
            return Err(Error::GroupNotFound(*target_group));
        }
        if self.is_ancestor(uuid, target_group) {
            return Err(Error::InvalidMove(format!(
                "group {} cannot be moved into its own subtree",
                uuid
            )));
        }

        let old_parent = self.groups.get_mut(uuid).and_then(|group| {
            group.times.location_changed = now();
            group.parent.replace(*target_group)
        });
        if let Some(old) = old_parent.and_then(|p| self.groups.get_mut(&p)) {
            old.remove_child(uuid);
        }
        if let Some(target) = self.groups.get_mut(target_group) {
            target.add_child(*uuid);
        }
        Ok(())
    }

    fn editor(&mut self, uuid: &Uuid) -> Result<EntryEditor<'_>> {
        let entry = self
            .entries
            .get_mut(uuid)
            .ok_or(Error::EntryNotFound(*uuid))?;
        Ok(EntryEditor {
            entry,
            protection: &self.protection,
            next_offset: &mut self.next_protected_offset,
            binaries: &mut self.binaries,
            meta: &self.meta,
        })
    }

    /// Set a field, protected when the memory protection settings say so or
    /// the existing value already is
    pub fn set_field(&mut self, entry_uuid: &Uuid, key: &str, value: &str) -> Result<()> {
        self.editor(entry_uuid)?.set_field(key, value)
    }

    pub fn set_field_protected(
        &mut self,
        entry_uuid: &Uuid,
        key: &str,
        value: &str,
        protect: bool,
    ) -> Result<()> {
        self.editor(entry_uuid)?.set_field_protected(key, value, protect)
    }

    pub fn remove_field(&mut self, entry_uuid: &Uuid, key: &str) -> Result<Option<FieldValue>> {
        Ok(self.editor(entry_uuid)?.remove_field(key))
    }

    /// Attach `data` under `name`, replacing an attachment of the same name
    pub fn add_attachment(&mut self, entry_uuid: &Uuid, name: &str, data: Vec<u8>) -> Result<BinaryId> {
        let id = self.editor(entry_uuid)?.add_attachment(name, data)?;
        self.prune_binaries();
        Ok(id)
    }

    /// Detach `name`; returns whether the entry had it
    pub fn remove_attachment(&mut self, entry_uuid: &Uuid, name: &str) -> Result<bool> {
        let removed = self.editor(entry_uuid)?.remove_attachment(name);
        if removed {
            self.prune_binaries();
        }
        Ok(removed)
    }

    /// Store the current state of an entry in its history and trim the
    /// history to the configured limits
    pub fn push_history(&mut self, entry_uuid: &Uuid) -> Result<()> {
        let entry = self
            .entries
            .get_mut(entry_uuid)
            .ok_or(Error::EntryNotFound(*entry_uuid))?;
        let snapshot = entry.snapshot();
        entry.history.push(snapshot);
        self.trim_history(entry_uuid);
        Ok(())
    }

    fn trim_history(&mut self, entry_uuid: &Uuid) {
        let Some(entry) = self.entries.get_mut(entry_uuid) else {
            return;
        };
        let start = history_window(entry, &self.meta, &self.binaries);
        if start > 0 {
            tracing::debug!("Dropping {} old revisions of {}", start, entry_uuid);
            entry.history.drain(..start);
        }
        self.prune_binaries();
    }

    /// Apply `edit` and keep the previous state as a history revision.
    ///
    /// When `edit` fails the entry is restored and no revision is added.
    pub fn edit_entry<R>(
        &mut self,
        entry_uuid: &Uuid,
        edit: impl FnOnce(&mut EntryEditor<'_>) -> Result<R>,
    ) -> Result<R> {
        let before = self
            .entries
            .get(entry_uuid)
            .ok_or(Error::EntryNotFound(*entry_uuid))?
            .clone();
        let mut editor = self.editor(entry_uuid)?;
        match edit(&mut editor) {
            Ok(result) => {
                editor.entry.history.push(before.snapshot());
                editor.entry.mark_modified();
                self.trim_history(entry_uuid);
                Ok(result)
            }
            Err(err) => {
                *editor.entry = before;
                self.prune_binaries();
                Err(err)
            }
        }
    }

    /// Decode a protected value of this document
    pub fn reveal(&self, value: &ProtectedValue) -> Result<SecureString> {
        let text = self.protection.reveal_string(value)?;
        Ok(SecureString::new(text.as_str()))
    }

    /// Text of a field whether protected or not
    pub fn field_text(&self, entry_uuid: &Uuid, key: &str) -> Result<Option<SecureString>> {
        let entry = self
            .entries
            .get(entry_uuid)
            .ok_or(Error::EntryNotFound(*entry_uuid))?;
        match entry.get(key) {
            None => Ok(None),
            Some(FieldValue::Plain(text)) => Ok(Some(SecureString::new(text.as_str()))),
            Some(FieldValue::Protected(value)) => self.reveal(value).map(Some),
        }
    }

    /// Get the group tree structure (for sidebar display)
    pub fn group_tree(&self) -> GroupTreeNode {
        self.build_group_tree(self.root_group(), 0)
    }

    fn build_group_tree(&self, group: &Group, depth: usize) -> GroupTreeNode {
        let children = if depth > self.groups.len() {
            Vec::new()
        } else {
            group
                .children
                .iter()
                .filter_map(|child_uuid| self.groups.get(child_uuid))
                .map(|child| self.build_group_tree(child, depth + 1))
                .collect()
        };

        GroupTreeNode {
            uuid: group.uuid,
            name: group.name.clone(),
            entry_count: group.entries.len(),
            children,
        }
    }

    /// Check the structural invariants: one parent per node, links in both
    /// directions, every node reachable from the root
    pub fn validate(&self) -> Result<()> {
        let mut seen_groups = HashSet::new();
        let mut seen_entries = HashSet::new();
        let mut stack = vec![self.root_group];

        while let Some(uuid) = stack.pop() {
            if !seen_groups.insert(uuid) {
                return Err(Error::InvalidGroup(format!("group {} reachable twice", uuid)));
            }
            let group = self.groups.get(&uuid).ok_or(Error::GroupNotFound(uuid))?;
            for entry_uuid in &group.entries {
                let entry = self
                    .entries
                    .get(entry_uuid)
                    .ok_or(Error::EntryNotFound(*entry_uuid))?;
                if entry.parent_group != Some(uuid) || !seen_entries.insert(*entry_uuid) {
                    return Err(Error::InvalidGroup(format!(
                        "entry {} has inconsistent parent",
                        entry_uuid
                    )));
                }
                if entry.history.iter().any(|h| !h.history.is_empty()) {
                    return Err(Error::InvalidGroup(format!(
                        "history of entry {} is nested",
                        entry_uuid
                    )));
                }
            }
            for child in &group.children {
                if self.groups.get(child).and_then(|c| c.parent) != Some(uuid) {
                    return Err(Error::InvalidGroup(format!(
                        "group {} has inconsistent parent",
                        child
                    )));
                }
                stack.push(*child);
            }
        }

        if seen_groups.len() != self.groups.len() || seen_entries.len() != self.entries.len() {
            return Err(Error::InvalidGroup("unreachable nodes".to_string()));
        }
        Ok(())
    }
}

/// Index of the oldest history revision kept under the count and size limits
pub(crate) fn history_window(entry: &Entry, meta: &Meta, binaries: &BinaryPool) -> usize {
    let len = entry.history.len();
    let mut start = 0;

    if meta.history_max_items >= 0 {
        start = len.saturating_sub(meta.history_max_items as usize);
    }
    if meta.history_max_size >= 0 {
        let limit = meta.history_max_size as usize;
        let mut total: usize = entry.history[start..]
            .iter()
            .map(|h| h.estimated_size(binaries))
            .sum();
        while start < len && total > limit {
            total -= entry.history[start].estimated_size(binaries);
            start += 1;
        }
    }
    start
}

/// Mutable access to one entry together with the document state needed to
/// protect values and store attachments
pub struct EntryEditor<'a> {
    entry: &'a mut Entry,
    protection: &'a ProtectionKey,
    next_offset: &'a mut u64,
    binaries: &'a mut BinaryPool,
    meta: &'a Meta,
}

impl EntryEditor<'_> {
    pub fn entry(&mut self) -> &mut Entry {
        self.entry
    }

    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        let protect = self.meta.memory_protection.protects(key)
            || self.entry.get(key).is_some_and(FieldValue::is_protected);
        self.set_field_protected(key, value, protect)
    }

    pub fn set_field_protected(&mut self, key: &str, value: &str, protect: bool) -> Result<()> {
        let value = if protect {
            let protected = self.protection.protect_at(*self.next_offset, value.as_bytes())?;
            *self.next_offset = protected.end();
            FieldValue::Protected(protected)
        } else {
            FieldValue::Plain(value.to_string())
        };
        self.entry.set_value(key, value);
        Ok(())
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        self.entry.remove_field(key)
    }

    pub fn add_attachment(&mut self, name: &str, data: Vec<u8>) -> Result<BinaryId> {
        let id = self.binaries.insert(data, false);
        match self.entry.attachments.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.binary = id,
            None => self.entry.attachments.push(crate::entry::Attachment {
                name: name.to_string(),
                binary: id,
            }),
        }
        Ok(id)
    }

    pub fn remove_attachment(&mut self, name: &str) -> bool {
        let before = self.entry.attachments.len();
        self.entry.attachments.retain(|a| a.name != name);
        self.entry.attachments.len() != before
    }
}

/// A tree node for displaying the group hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTreeNode {
    pub uuid: Uuid,
    pub name: String,
    pub entry_count: usize,
    pub children: Vec<GroupTreeNode>,
}
