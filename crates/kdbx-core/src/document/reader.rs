//! XML document → database model

use super::node::XmlNode;
use super::MAX_DEPTH;
use super::values::{
    decode_base64, decode_bool, decode_datetime, decode_number, decode_optional_bool, decode_uuid,
};
use crate::binary::{Binary, BinaryId, BinaryPool};
use crate::compression::gunzip;
use crate::database::{DeletedObject, DocumentParts};
use crate::entry::{Attachment, Entry, FieldValue};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::meta::{CustomDataItem, CustomIcon, MemoryProtection, Meta};
use crate::protect::{ProtectionKey, ProtectionStream};
use crate::rules::FormatRules;
use crate::times::Times;
use std::collections::HashMap;
use uuid::Uuid;

/// What the reader needs besides the XML text
pub(crate) struct ReadContext {
    pub rules: FormatRules,
    pub protection: ProtectionKey,
    /// KDBX 4 attachment pool from the inner header, by index
    pub inner_binaries: Vec<Binary>,
    /// Limit for decompressed KDBX 3 attachments
    pub max_binary_size: usize,
}

/// Result of a read besides the model itself
pub(crate) struct ReadOutcome {
    pub parts: DocumentParts,
    /// `Meta/HeaderHash` as stored (KDBX 3)
    pub header_hash: Option<Vec<u8>>,
}

pub(crate) fn read_document(xml: &[u8], ctx: ReadContext) -> Result<ReadOutcome> {
    let root = XmlNode::parse(xml)?;
    if root.name != "KeePassFile" {
        return Err(Error::document(&root.name, "expected KeePassFile"));
    }

    let ReadContext {
        rules,
        protection,
        inner_binaries,
        max_binary_size,
    } = ctx;
    let mut reader = Reader {
        rules,
        stream: protection.stream(),
        protection: &protection,
        pool: BinaryPool::new(),
        refs: HashMap::new(),
        max_binary_size,
        groups: HashMap::new(),
        entries: HashMap::new(),
    };

    for (index, binary) in inner_binaries.into_iter().enumerate() {
        let id = reader.pool.insert(binary.data, binary.protected);
        reader.refs.insert(index as u64, id);
    }

    let mut meta = None;
    let mut header_hash = None;
    let mut root_content = None;
    let mut unknown = Vec::new();

    for child in &root.children {
        match child.name.as_str() {
            "Meta" => {
                let (parsed, hash) = reader.read_meta(child, "KeePassFile/Meta")?;
                meta = Some(parsed);
                header_hash = hash;
            }
            "Root" => root_content = Some(reader.read_root(child, "KeePassFile/Root")?),
            _ => unknown.push(child.clone()),
        }
    }

    let meta = meta.ok_or_else(|| Error::document("KeePassFile", "missing Meta"))?;
    let (root_group, deleted_objects, root_unknown) =
        root_content.ok_or_else(|| Error::document("KeePassFile", "missing Root"))?;

    let next_protected_offset = reader.stream.position();
    let Reader {
        pool,
        groups,
        entries,
        ..
    } = reader;

    Ok(ReadOutcome {
        parts: DocumentParts {
            meta,
            entries,
            groups,
            root_group,
            binaries: pool,
            deleted_objects,
            protection,
            next_protected_offset,
            unknown,
            root_unknown,
        },
        header_hash,
    })
}

struct Reader<'a> {
    rules: FormatRules,
    stream: ProtectionStream<'a>,
    protection: &'a ProtectionKey,
    pool: BinaryPool,
    /// File-level binary index → pooled id
    refs: HashMap<u64, BinaryId>,
    max_binary_size: usize,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
}

fn child_path(path: &str, name: &str) -> String {
    format!("{}/{}", path, name)
}

impl Reader<'_> {
    fn date(&self, node: &XmlNode, path: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        decode_datetime(&node.text, self.rules, &child_path(path, &node.name))
    }

    fn read_meta(&mut self, node: &XmlNode, path: &str) -> Result<(Meta, Option<Vec<u8>>)> {
        let mut meta = Meta::new("");
        meta.generator.clear();
        meta.settings_changed = None;
        meta.database_name_changed = None;
        meta.database_description_changed = None;
        meta.default_user_name_changed = None;
        meta.master_key_changed = None;
        meta.recycle_bin_changed = None;
        let mut header_hash = None;

        for child in &node.children {
            let here = child_path(path, &child.name);
            match child.name.as_str() {
                "Generator" => meta.generator = child.text.clone(),
                "HeaderHash" if self.rules.header_hash_in_meta() => {
                    header_hash = Some(decode_base64(&child.text, &here)?)
                }
                "SettingsChanged" if self.rules.has_v41_fields() => {
                    meta.settings_changed = Some(self.date(child, path)?)
                }
                "DatabaseName" => meta.database_name = child.text.clone(),
                "DatabaseNameChanged" => meta.database_name_changed = Some(self.date(child, path)?),
                "DatabaseDescription" => meta.database_description = child.text.clone(),
                "DatabaseDescriptionChanged" => {
                    meta.database_description_changed = Some(self.date(child, path)?)
                }
                "DefaultUserName" => meta.default_user_name = child.text.clone(),
                "DefaultUserNameChanged" => {
                    meta.default_user_name_changed = Some(self.date(child, path)?)
                }
                "MaintenanceHistoryDays" => {
                    meta.maintenance_history_days = decode_number(&child.text, &here)?
                }
                "Color" => meta.color = child.text.clone(),
                "MasterKeyChanged" => meta.master_key_changed = Some(self.date(child, path)?),
                "MemoryProtection" => {
                    meta.memory_protection = read_memory_protection(child, &here)?
                }
                "CustomIcons" => meta.custom_icons = self.read_custom_icons(child, &here)?,
                "RecycleBinEnabled" => meta.recycle_bin_enabled = decode_bool(&child.text, &here)?,
                "RecycleBinUUID" => meta.recycle_bin_uuid = decode_uuid(&child.text, &here)?,
                "RecycleBinChanged" => meta.recycle_bin_changed = Some(self.date(child, path)?),
                "HistoryMaxItems" => meta.history_max_items = decode_number(&child.text, &here)?,
                "HistoryMaxSize" => meta.history_max_size = decode_number(&child.text, &here)?,
                "Binaries" if self.rules.binaries_in_meta() => self.read_meta_binaries(child, &here)?,
                "CustomData" => meta.custom_data = self.read_custom_data(child, &here)?,
                _ => meta.unknown.push(child.clone()),
            }
        }
        Ok((meta, header_hash))
    }

    fn read_custom_icons(&self, node: &XmlNode, path: &str) -> Result<Vec<CustomIcon>> {
        let mut icons = Vec::new();
        for icon in node.children_named("Icon") {
            let here = child_path(path, "Icon");
            let uuid = icon
                .child("UUID")
                .ok_or_else(|| Error::document(&here, "missing UUID"))?;
            let data = icon
                .child("Data")
                .ok_or_else(|| Error::document(&here, "missing Data"))?;
            icons.push(CustomIcon {
                uuid: decode_uuid(&uuid.text, &here)?,
                data: decode_base64(&data.text, &here)?,
                name: icon.child("Name").map(|n| n.text.clone()),
                last_modified: icon
                    .child("LastModificationTime")
                    .map(|t| self.date(t, &here))
                    .transpose()?,
            });
        }
        Ok(icons)
    }

    fn read_custom_data(&self, node: &XmlNode, path: &str) -> Result<Vec<CustomDataItem>> {
        let mut items = Vec::new();
        for item in node.children_named("Item") {
            let here = child_path(path, "Item");
            let key = item
                .child("Key")
                .ok_or_else(|| Error::document(&here, "missing Key"))?;
            items.push(CustomDataItem {
                key: key.text.clone(),
                value: item.child("Value").map(|v| v.text.clone()).unwrap_or_default(),
                last_modified: item
                    .child("LastModificationTime")
                    .map(|t| self.date(t, &here))
                    .transpose()?,
            });
        }
        Ok(items)
    }

    /// KDBX 3 pool: `<Binary ID="n" Compressed="True">base64</Binary>`
    fn read_meta_binaries(&mut self, node: &XmlNode, path: &str) -> Result<()> {
        for binary in node.children_named("Binary") {
            let here = child_path(path, "Binary");
            let id: u64 = binary
                .attr("ID")
                .ok_or_else(|| Error::document(&here, "missing ID"))
                .and_then(|id| decode_number(id, &here))?;
            let (data, protected) = self.binary_content(binary, &here)?;
            let pooled = self.pool.insert(data, protected);
            if self.refs.insert(id, pooled).is_some() {
                return Err(Error::document(&here, format!("duplicate binary ID {}", id)));
            }
        }
        Ok(())
    }

    /// Inline binary content, possibly protected and/or gzip-compressed
    fn binary_content(&mut self, node: &XmlNode, path: &str) -> Result<(Vec<u8>, bool)> {
        let raw = decode_base64(&node.text, path)?;
        let protected = is_true(node.attr("Protected"));
        let raw = if protected {
            let value = self.stream.take(raw);
            self.protection.reveal(&value)?.to_vec()
        } else {
            raw
        };
        let data = if is_true(node.attr("Compressed")) {
            gunzip(&raw, self.max_binary_size).map_err(|e| match e {
                Error::CorruptBody(reason) => Error::document(path, reason),
                other => other,
            })?
        } else {
            raw
        };
        Ok((data, protected))
    }

    fn read_root(
        &mut self,
        node: &XmlNode,
        path: &str,
    ) -> Result<(Uuid, Vec<DeletedObject>, Vec<XmlNode>)> {
        let mut root_group = None;
        let mut deleted = Vec::new();
        let mut unknown = Vec::new();

        for child in &node.children {
            let here = child_path(path, &child.name);
            match child.name.as_str() {
                "Group" => {
                    if root_group.is_some() {
                        return Err(Error::document(&here, "more than one root group"));
                    }
                    root_group = Some(self.read_group(child, None, &here, 0)?);
                }
                "Entry" => return Err(Error::document(&here, "entry outside of any group")),
                "DeletedObjects" => deleted = self.read_deleted_objects(child, &here)?,
                _ => unknown.push(child.clone()),
            }
        }

        let root_group = root_group.ok_or_else(|| Error::document(path, "missing root group"))?;
        Ok((root_group, deleted, unknown))
    }

    fn read_deleted_objects(&self, node: &XmlNode, path: &str) -> Result<Vec<DeletedObject>> {
        let mut deleted = Vec::new();
        for object in node.children_named("DeletedObject") {
            let here = child_path(path, "DeletedObject");
            let uuid = object
                .child("UUID")
                .ok_or_else(|| Error::document(&here, "missing UUID"))?;
            let time = object
                .child("DeletionTime")
                .ok_or_else(|| Error::document(&here, "missing DeletionTime"))?;
            deleted.push(DeletedObject {
                uuid: decode_uuid(&uuid.text, &here)?,
                deletion_time: self.date(time, &here)?,
            });
        }
        Ok(deleted)
    }

    fn claim(&self, uuid: Uuid, path: &str) -> Result<()> {
        if self.groups.contains_key(&uuid) || self.entries.contains_key(&uuid) {
            return Err(Error::document(path, format!("duplicate UUID {}", uuid)));
        }
        Ok(())
    }

    fn read_group(
        &mut self,
        node: &XmlNode,
        parent: Option<Uuid>,
        path: &str,
        depth: usize,
    ) -> Result<Uuid> {
        if depth > MAX_DEPTH {
            return Err(Error::document(path, "groups nested too deeply"));
        }
        let uuid_node = node
            .child("UUID")
            .ok_or_else(|| Error::document(path, "missing UUID"))?;
        let uuid = decode_uuid(&uuid_node.text, &child_path(path, "UUID"))?;
        self.claim(uuid, path)?;

        let mut group = Group::with_uuid(uuid, "");
        group.parent = parent;
        group.unknown_attributes = node.attributes.clone();
        // Reserve the UUID before descending so children cannot reuse it
        self.groups.insert(uuid, group.clone());

        for child in &node.children {
            let here = child_path(path, &child.name);
            match child.name.as_str() {
                "UUID" => {}
                "Name" => group.name = child.text.clone(),
                "Notes" => group.notes = child.text.clone(),
                "IconID" => group.icon_id = decode_number(&child.text, &here)?,
                "CustomIconUUID" => group.custom_icon = Some(decode_uuid(&child.text, &here)?),
                "Times" => group.times = self.read_times(child, &here)?,
                "IsExpanded" => group.expanded = decode_bool(&child.text, &here)?,
                "DefaultAutoTypeSequence" => group.default_auto_type_sequence = child.text.clone(),
                "EnableAutoType" => group.enable_auto_type = decode_optional_bool(&child.text, &here)?,
                "EnableSearching" => {
                    group.enable_searching = decode_optional_bool(&child.text, &here)?
                }
                "LastTopVisibleEntry" => {
                    group.last_top_visible_entry = decode_uuid(&child.text, &here)?
                }
                "Tags" if self.rules.has_v41_fields() => group.tags = split_tags(&child.text),
                "CustomData" => group.custom_data = self.read_custom_data(child, &here)?,
                "Entry" => {
                    let entry = self.read_entry(child, &here, false)?;
                    self.claim(entry.uuid, &here)?;
                    let mut entry = entry;
                    entry.parent_group = Some(uuid);
                    group.entries.push(entry.uuid);
                    self.entries.insert(entry.uuid, entry);
                }
                "Group" => {
                    let child_uuid = self.read_group(child, Some(uuid), &here, depth + 1)?;
                    group.children.push(child_uuid);
                }
                _ => group.unknown.push(child.clone()),
            }
        }

        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    fn read_times(&self, node: &XmlNode, path: &str) -> Result<Times> {
        let mut times = Times::new();
        for child in &node.children {
            let here = child_path(path, &child.name);
            match child.name.as_str() {
                "CreationTime" => times.created = self.date(child, path)?,
                "LastModificationTime" => times.modified = self.date(child, path)?,
                "LastAccessTime" => times.accessed = self.date(child, path)?,
                "ExpiryTime" => times.expiry = self.date(child, path)?,
                "Expires" => times.expires = decode_bool(&child.text, &here)?,
                "UsageCount" => times.usage_count = decode_number(&child.text, &here)?,
                "LocationChanged" => times.location_changed = self.date(child, path)?,
                _ => times.unknown.push(child.clone()),
            }
        }
        Ok(times)
    }

    fn read_entry(&mut self, node: &XmlNode, path: &str, in_history: bool) -> Result<Entry> {
        let uuid_node = node
            .child("UUID")
            .ok_or_else(|| Error::document(path, "missing UUID"))?;
        let mut entry = Entry::with_uuid(decode_uuid(&uuid_node.text, &child_path(path, "UUID"))?);
        entry.unknown_attributes = node.attributes.clone();

        for child in &node.children {
            let here = child_path(path, &child.name);
            match child.name.as_str() {
                "UUID" => {}
                "IconID" => entry.icon_id = decode_number(&child.text, &here)?,
                "CustomIconUUID" => entry.custom_icon = Some(decode_uuid(&child.text, &here)?),
                "ForegroundColor" => entry.foreground_color = child.text.clone(),
                "BackgroundColor" => entry.background_color = child.text.clone(),
                "OverrideURL" => entry.override_url = child.text.clone(),
                "Tags" => entry.tags = split_tags(&child.text),
                "Times" => entry.times = self.read_times(child, &here)?,
                "String" => {
                    let (key, value) = self.read_string(child, &here)?;
                    entry.set_value(key, value);
                }
                "Binary" => entry.attachments.push(self.read_attachment(child, &here)?),
                "AutoType" => entry.auto_type = Some(child.clone()),
                "CustomData" => entry.custom_data = self.read_custom_data(child, &here)?,
                "History" => {
                    if in_history {
                        return Err(Error::document(&here, "history entry contains history"));
                    }
                    for revision in &child.children {
                        let revision_path = child_path(&here, &revision.name);
                        if revision.name != "Entry" {
                            return Err(Error::document(&revision_path, "unexpected element in history"));
                        }
                        let snapshot = self.read_entry(revision, &revision_path, true)?;
                        if snapshot.uuid != entry.uuid {
                            return Err(Error::document(&revision_path, "history UUID differs from entry"));
                        }
                        entry.history.push(snapshot);
                    }
                }
                _ => entry.unknown.push(child.clone()),
            }
        }
        Ok(entry)
    }

    fn read_string(&mut self, node: &XmlNode, path: &str) -> Result<(String, FieldValue)> {
        let key = node
            .child("Key")
            .ok_or_else(|| Error::document(path, "missing Key"))?
            .text
            .clone();
        let value = match node.child("Value") {
            None => FieldValue::Plain(String::new()),
            Some(value) if is_true(value.attr("Protected")) => {
                let here = child_path(path, "Value");
                let ciphertext = decode_base64(&value.text, &here)?;
                FieldValue::Protected(self.stream.take(ciphertext))
            }
            Some(value) => FieldValue::Plain(value.text.clone()),
        };
        Ok((key, value))
    }

    fn read_attachment(&mut self, node: &XmlNode, path: &str) -> Result<Attachment> {
        let name = node
            .child("Key")
            .ok_or_else(|| Error::document(path, "missing Key"))?
            .text
            .clone();
        let value = node
            .child("Value")
            .ok_or_else(|| Error::document(path, "missing Value"))?;
        let here = child_path(path, "Value");

        let binary = match value.attr("Ref") {
            Some(reference) => {
                let index: u64 = decode_number(reference, &here)?;
                *self
                    .refs
                    .get(&index)
                    .ok_or_else(|| Error::document(&here, format!("unknown binary reference {}", index)))?
            }
            None => {
                let (data, protected) = self.binary_content(value, &here)?;
                self.pool.insert(data, protected)
            }
        };
        Ok(Attachment { name, binary })
    }
}

fn is_true(attr: Option<&str>) -> bool {
    attr.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn read_memory_protection(node: &XmlNode, path: &str) -> Result<MemoryProtection> {
    let mut protection = MemoryProtection::default();
    for child in &node.children {
        let here = child_path(path, &child.name);
        let flag = decode_bool(&child.text, &here)?;
        match child.name.as_str() {
            "ProtectTitle" => protection.protect_title = flag,
            "ProtectUserName" => protection.protect_user_name = flag,
            "ProtectPassword" => protection.protect_password = flag,
            "ProtectURL" => protection.protect_url = flag,
            "ProtectNotes" => protection.protect_notes = flag,
            _ => tracing::debug!("Ignoring memory protection flag {}", here),
        }
    }
    Ok(protection)
}

/// KeePass separates tags with `;`; some clients use `,`
pub(crate) fn split_tags(text: &str) -> Vec<String> {
    let separator = if text.contains(';') { ';' } else { ',' };
    text.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
