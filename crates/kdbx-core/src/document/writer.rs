//! Database model → XML document

use super::node::XmlNode;
use super::MAX_DEPTH;
use super::values::{
    encode_base64, encode_bool, encode_datetime, encode_optional_bool, encode_uuid,
};
use crate::binary::{Binary, BinaryId};
use crate::compression::gzip;
use crate::database::{history_window, Database};
use crate::entry::{Entry, FieldValue};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::meta::{CustomDataItem, Meta};
use crate::protect::ProtectionStream;
use crate::rules::FormatRules;
use crate::times::Times;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// How protected values are written
pub(crate) enum Protection<'a> {
    /// Re-obfuscate with a fresh keystream, in document order
    Stream(ProtectionStream<'a>),
    /// Revealed text, keeping the `Protected` marker; used for comparisons
    Plain,
}

pub(crate) struct WriteOptions<'a> {
    pub rules: FormatRules,
    /// SHA-256 of the outer header (KDBX 3 stores it in `Meta`)
    pub header_hash: Option<[u8; 32]>,
    /// Gzip attachments kept in `Meta/Binaries`
    pub compress_binaries: bool,
    pub protection: Protection<'a>,
}

pub(crate) struct WriteOutput {
    pub xml: Vec<u8>,
    /// Attachment pool in reference order, for the KDBX 4 inner header
    pub binaries: Vec<Binary>,
}

pub(crate) fn write_document(db: &Database, options: WriteOptions<'_>) -> Result<WriteOutput> {
    let order = binary_order(db);
    let mut writer = Writer {
        db,
        rules: options.rules,
        protection: options.protection,
        refs: order
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index))
            .collect(),
    };

    let mut pool = Vec::with_capacity(order.len());
    for id in &order {
        let binary = db
            .binaries()
            .get(id)
            .ok_or_else(|| Error::document("KeePassFile/Meta/Binaries", format!("missing payload {}", id)))?;
        pool.push(binary.clone());
    }

    let mut file = XmlNode::new("KeePassFile");
    file.push(writer.meta(&db.meta, options.header_hash, &pool, options.compress_binaries)?);
    file.push(writer.root()?);
    file.children.extend(db.unknown.iter().cloned());

    let mut xml = Vec::new();
    file.write_document(&mut xml)?;

    let binaries = if writer.rules.has_inner_header() {
        pool
    } else {
        Vec::new()
    };
    Ok(WriteOutput { xml, binaries })
}

/// Deterministic rendering with protected values revealed
pub(crate) fn canonical_xml(db: &Database, rules: FormatRules) -> Result<Vec<u8>> {
    let output = write_document(
        db,
        WriteOptions {
            rules,
            header_hash: None,
            compress_binaries: false,
            protection: Protection::Plain,
        },
    )?;
    Ok(output.xml)
}

/// First-reference order of attachment payloads, skipping pruned history
fn binary_order(db: &Database) -> Vec<BinaryId> {
    fn visit(db: &Database, group: &Group, seen: &mut Vec<BinaryId>) {
        for entry in group.entries.iter().filter_map(|uuid| db.get_entry(uuid)) {
            let start = history_window(entry, &db.meta, db.binaries());
            let revisions = std::iter::once(entry).chain(entry.history[start..].iter());
            for attachment in revisions.flat_map(|e| e.attachments.iter()) {
                if !seen.contains(&attachment.binary) {
                    seen.push(attachment.binary);
                }
            }
        }
        for child in group.children.iter().filter_map(|uuid| db.get_group(uuid)) {
            visit(db, child, seen);
        }
    }

    let mut seen = Vec::new();
    visit(db, db.root_group(), &mut seen);
    seen
}

struct Writer<'a> {
    db: &'a Database,
    rules: FormatRules,
    protection: Protection<'a>,
    refs: HashMap<BinaryId, usize>,
}

fn leaf(name: &str, text: impl Into<String>) -> XmlNode {
    XmlNode::text(name, text)
}

impl Writer<'_> {
    fn date(&self, name: &str, value: &DateTime<Utc>) -> XmlNode {
        leaf(name, encode_datetime(value, self.rules))
    }

    fn optional_date(&self, node: &mut XmlNode, name: &str, value: &Option<DateTime<Utc>>) {
        if let Some(value) = value {
            node.push(self.date(name, value));
        }
    }

    /// Text and attributes for a protected payload
    fn protect(&mut self, plaintext: &[u8]) -> Result<String> {
        match &mut self.protection {
            Protection::Stream(stream) => Ok(encode_base64(&stream.protect(plaintext)?.ciphertext)),
            Protection::Plain => Ok(encode_base64(plaintext)),
        }
    }

    fn meta(
        &mut self,
        meta: &Meta,
        header_hash: Option<[u8; 32]>,
        pool: &[Binary],
        compress_binaries: bool,
    ) -> Result<XmlNode> {
        let mut node = XmlNode::new("Meta");
        node.push(leaf("Generator", meta.generator.as_str()));
        if let (Some(hash), true) = (header_hash, self.rules.header_hash_in_meta()) {
            node.push(leaf("HeaderHash", encode_base64(&hash)));
        }
        if self.rules.has_v41_fields() {
            self.optional_date(&mut node, "SettingsChanged", &meta.settings_changed);
        }
        node.push(leaf("DatabaseName", meta.database_name.as_str()));
        self.optional_date(&mut node, "DatabaseNameChanged", &meta.database_name_changed);
        node.push(leaf("DatabaseDescription", meta.database_description.as_str()));
        self.optional_date(
            &mut node,
            "DatabaseDescriptionChanged",
            &meta.database_description_changed,
        );
        node.push(leaf("DefaultUserName", meta.default_user_name.as_str()));
        self.optional_date(&mut node, "DefaultUserNameChanged", &meta.default_user_name_changed);
        node.push(leaf(
            "MaintenanceHistoryDays",
            meta.maintenance_history_days.to_string(),
        ));
        node.push(leaf("Color", meta.color.as_str()));
        self.optional_date(&mut node, "MasterKeyChanged", &meta.master_key_changed);

        let protection = &meta.memory_protection;
        node.push(
            XmlNode::new("MemoryProtection")
                .with_child(leaf("ProtectTitle", encode_bool(protection.protect_title)))
                .with_child(leaf("ProtectUserName", encode_bool(protection.protect_user_name)))
                .with_child(leaf("ProtectPassword", encode_bool(protection.protect_password)))
                .with_child(leaf("ProtectURL", encode_bool(protection.protect_url)))
                .with_child(leaf("ProtectNotes", encode_bool(protection.protect_notes))),
        );

        if !meta.custom_icons.is_empty() {
            let mut icons = XmlNode::new("CustomIcons");
            for icon in &meta.custom_icons {
                let mut item = XmlNode::new("Icon")
                    .with_child(leaf("UUID", encode_uuid(&icon.uuid)))
                    .with_child(leaf("Data", encode_base64(&icon.data)));
                if self.rules.has_v41_fields() {
                    if let Some(name) = &icon.name {
                        item.push(leaf("Name", name.as_str()));
                    }
                    self.optional_date(&mut item, "LastModificationTime", &icon.last_modified);
                }
                icons.push(item);
            }
            node.push(icons);
        }

        node.push(leaf("RecycleBinEnabled", encode_bool(meta.recycle_bin_enabled)));
        node.push(leaf("RecycleBinUUID", encode_uuid(&meta.recycle_bin_uuid)));
        self.optional_date(&mut node, "RecycleBinChanged", &meta.recycle_bin_changed);
        node.push(leaf("HistoryMaxItems", meta.history_max_items.to_string()));
        node.push(leaf("HistoryMaxSize", meta.history_max_size.to_string()));

        // Plain renderings inline the pool so comparisons cover payloads too
        let inline_pool =
            self.rules.binaries_in_meta() || matches!(self.protection, Protection::Plain);
        if inline_pool && !pool.is_empty() {
            let mut binaries = XmlNode::new("Binaries");
            for (index, binary) in pool.iter().enumerate() {
                let mut item = XmlNode::new("Binary").with_attr("ID", index.to_string());
                let payload = if compress_binaries {
                    item = item.with_attr("Compressed", "True");
                    gzip(&binary.data)?
                } else {
                    binary.data.clone()
                };
                if binary.protected {
                    item = item.with_attr("Protected", "True");
                }
                item.text = if binary.protected {
                    self.protect(&payload)?
                } else {
                    encode_base64(&payload)
                };
                binaries.push(item);
            }
            node.push(binaries);
        }

        if let Some(custom) = self.custom_data(&meta.custom_data) {
            node.push(custom);
        }
        node.children.extend(meta.unknown.iter().cloned());
        Ok(node)
    }

    fn custom_data(&self, items: &[CustomDataItem]) -> Option<XmlNode> {
        if items.is_empty() {
            return None;
        }
        let mut node = XmlNode::new("CustomData");
        for item in items {
            let mut child = XmlNode::new("Item")
                .with_child(leaf("Key", item.key.as_str()))
                .with_child(leaf("Value", item.value.as_str()));
            if self.rules.has_v41_fields() {
                self.optional_date(&mut child, "LastModificationTime", &item.last_modified);
            }
            node.push(child);
        }
        Some(node)
    }

    fn times(&self, times: &Times) -> XmlNode {
        let mut node = XmlNode::new("Times")
            .with_child(self.date("CreationTime", &times.created))
            .with_child(self.date("LastModificationTime", &times.modified))
            .with_child(self.date("LastAccessTime", &times.accessed))
            .with_child(self.date("ExpiryTime", &times.expiry))
            .with_child(leaf("Expires", encode_bool(times.expires)))
            .with_child(leaf("UsageCount", times.usage_count.to_string()))
            .with_child(self.date("LocationChanged", &times.location_changed));
        node.children.extend(times.unknown.iter().cloned());
        node
    }

    fn root(&mut self) -> Result<XmlNode> {
        let db = self.db;
        let mut node = XmlNode::new("Root");
        node.push(self.group(db.root_group(), 0)?);

        let mut deleted = XmlNode::new("DeletedObjects");
        for object in &db.deleted_objects {
            deleted.push(
                XmlNode::new("DeletedObject")
                    .with_child(leaf("UUID", encode_uuid(&object.uuid)))
                    .with_child(self.date("DeletionTime", &object.deletion_time)),
            );
        }
        node.push(deleted);
        node.children.extend(db.root_unknown.iter().cloned());
        Ok(node)
    }

    fn group(&mut self, group: &Group, depth: usize) -> Result<XmlNode> {
        if depth > MAX_DEPTH {
            return Err(Error::InvalidGroup(format!(
                "group tree deeper than {} levels",
                MAX_DEPTH
            )));
        }
        let db = self.db;
        let mut node = XmlNode::new("Group");
        node.attributes = group.unknown_attributes.clone();
        node.push(leaf("UUID", encode_uuid(&group.uuid)));
        node.push(leaf("Name", group.name.as_str()));
        node.push(leaf("Notes", group.notes.as_str()));
        node.push(leaf("IconID", group.icon_id.to_string()));
        if let Some(icon) = &group.custom_icon {
            node.push(leaf("CustomIconUUID", encode_uuid(icon)));
        }
        node.push(self.times(&group.times));
        node.push(leaf("IsExpanded", encode_bool(group.expanded)));
        node.push(leaf(
            "DefaultAutoTypeSequence",
            group.default_auto_type_sequence.as_str(),
        ));
        node.push(leaf("EnableAutoType", encode_optional_bool(group.enable_auto_type)));
        node.push(leaf("EnableSearching", encode_optional_bool(group.enable_searching)));
        node.push(leaf("LastTopVisibleEntry", encode_uuid(&group.last_top_visible_entry)));
        if self.rules.has_v41_fields() && !group.tags.is_empty() {
            node.push(leaf("Tags", group.tags.join(";")));
        }
        if let Some(custom) = self.custom_data(&group.custom_data) {
            node.push(custom);
        }

        for uuid in &group.entries {
            let entry = db.get_entry(uuid).ok_or(Error::EntryNotFound(*uuid))?;
            let start = history_window(entry, &db.meta, db.binaries());
            node.push(self.entry(entry, Some(&entry.history[start..]))?);
        }
        for uuid in &group.children {
            let child = db.get_group(uuid).ok_or(Error::GroupNotFound(*uuid))?;
            node.push(self.group(child, depth + 1)?);
        }
        node.children.extend(group.unknown.iter().cloned());
        Ok(node)
    }

    /// `history` is `None` for snapshots, which never nest
    fn entry(&mut self, entry: &Entry, history: Option<&[Entry]>) -> Result<XmlNode> {
        let mut node = XmlNode::new("Entry");
        node.attributes = entry.unknown_attributes.clone();
        node.push(leaf("UUID", encode_uuid(&entry.uuid)));
        node.push(leaf("IconID", entry.icon_id.to_string()));
        if let Some(icon) = &entry.custom_icon {
            node.push(leaf("CustomIconUUID", encode_uuid(icon)));
        }
        node.push(leaf("ForegroundColor", entry.foreground_color.as_str()));
        node.push(leaf("BackgroundColor", entry.background_color.as_str()));
        node.push(leaf("OverrideURL", entry.override_url.as_str()));
        node.push(leaf("Tags", entry.tags.join(";")));
        node.push(self.times(&entry.times));

        for field in entry.fields() {
            let value = match &field.value {
                FieldValue::Plain(text) => leaf("Value", text.as_str()),
                FieldValue::Protected(value) => {
                    let plaintext = self.db.protection_key().reveal(value)?;
                    let text = if matches!(self.protection, Protection::Plain) {
                        String::from_utf8_lossy(&plaintext).into_owned()
                    } else {
                        self.protect(&plaintext)?
                    };
                    leaf("Value", text).with_attr("Protected", "True")
                }
            };
            node.push(
                XmlNode::new("String")
                    .with_child(leaf("Key", field.key.as_str()))
                    .with_child(value),
            );
        }

        for attachment in &entry.attachments {
            let index = self.refs.get(&attachment.binary).ok_or_else(|| {
                Error::document(
                    format!("Entry {}", entry.uuid),
                    format!("attachment {:?} has no payload", attachment.name),
                )
            })?;
            node.push(
                XmlNode::new("Binary")
                    .with_child(leaf("Key", attachment.name.as_str()))
                    .with_child(XmlNode::new("Value").with_attr("Ref", index.to_string())),
            );
        }

        if let Some(auto_type) = &entry.auto_type {
            node.push(auto_type.clone());
        }
        if let Some(custom) = self.custom_data(&entry.custom_data) {
            node.push(custom);
        }
        if let Some(history) = history {
            let mut revisions = XmlNode::new("History");
            for snapshot in history {
                revisions.push(self.entry(snapshot, None)?);
            }
            node.push(revisions);
        }
        node.children.extend(entry.unknown.iter().cloned());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::entry::{EntryBuilder, PASSWORD};
    use crate::group::GroupBuilder;
    use crate::protect::{InnerStreamAlgorithm, ProtectionKey};

    const V4: FormatRules = FormatRules::V4 { minor: 0 };
    const V3: FormatRules = FormatRules::V3 { minor: 1 };

    fn parse(output: &[u8]) -> XmlNode {
        XmlNode::parse(output).unwrap()
    }

    fn names(node: &XmlNode) -> Vec<&str> {
        node.children.iter().map(|c| c.name.as_str()).collect()
    }

    fn write(db: &Database, rules: FormatRules, key: &ProtectionKey) -> WriteOutput {
        write_document(
            db,
            WriteOptions {
                rules,
                header_hash: Some([9u8; 32]),
                compress_binaries: false,
                protection: Protection::Stream(key.stream()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_entry_element_order() {
        let mut db = Database::new("Vault");
        db.add_entry(EntryBuilder::new("Bank").password("pw").build())
            .unwrap();
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let doc = parse(&write(&db, V4, &key).xml);

        assert_eq!(names(&doc), vec!["Meta", "Root"]);
        let root = doc.child("Root").unwrap();
        assert_eq!(names(root), vec!["Group", "DeletedObjects"]);
        let entry = root.child("Group").unwrap().child("Entry").unwrap();
        assert_eq!(
            names(entry),
            vec![
                "UUID",
                "IconID",
                "ForegroundColor",
                "BackgroundColor",
                "OverrideURL",
                "Tags",
                "Times",
                "String",
                "String",
                "History"
            ]
        );
        let times = entry.child("Times").unwrap();
        assert_eq!(
            names(times),
            vec![
                "CreationTime",
                "LastModificationTime",
                "LastAccessTime",
                "ExpiryTime",
                "Expires",
                "UsageCount",
                "LocationChanged"
            ]
        );
    }

    #[test]
    fn test_protected_values_are_restreamed() {
        let mut db = Database::new("Vault");
        db.add_entry(EntryBuilder::new("Bank").password("pw").build())
            .unwrap();
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let doc = parse(&write(&db, V4, &key).xml);

        let entry = doc
            .child("Root")
            .and_then(|r| r.child("Group"))
            .and_then(|g| g.child("Entry"))
            .unwrap();
        let password = entry
            .children_named("String")
            .find(|s| s.child("Key").map(|k| k.text.as_str()) == Some(PASSWORD))
            .and_then(|s| s.child("Value"))
            .unwrap();
        assert_eq!(password.attr("Protected"), Some("True"));

        let ciphertext = crate::document::values::decode_base64(&password.text, "Value").unwrap();
        let value = key.stream().take(ciphertext);
        assert_eq!(key.reveal(&value).unwrap().as_slice(), b"pw");
    }

    #[test]
    fn test_header_hash_only_in_kdbx3() {
        let db = Database::new("Vault");
        let key = ProtectionKey::generate(InnerStreamAlgorithm::Salsa20);

        let v3 = parse(&write(&db, V3, &key).xml);
        let meta = v3.child("Meta").unwrap();
        assert_eq!(names(meta)[..2], ["Generator", "HeaderHash"]);

        let v4 = parse(&write(&db, V4, &key).xml);
        assert!(v4.child("Meta").unwrap().child("HeaderHash").is_none());
    }

    #[test]
    fn test_binary_pool_order_and_dedup() {
        let mut db = Database::new("Vault");
        let sub = db.add_group(GroupBuilder::new("Sub").build()).unwrap();
        let nested = db
            .add_entry(EntryBuilder::new("Nested").parent_group(sub).build())
            .unwrap();
        let top = db.add_entry(EntryBuilder::new("Top").build()).unwrap();
        db.add_attachment(&nested, "late.bin", b"second".to_vec()).unwrap();
        db.add_attachment(&top, "early.bin", b"first".to_vec()).unwrap();
        db.add_attachment(&top, "dup.bin", b"second".to_vec()).unwrap();

        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let output = write(&db, V4, &key);
        let pool: Vec<&[u8]> = output.binaries.iter().map(|b| b.data.as_slice()).collect();
        assert_eq!(pool, vec![&b"first"[..], &b"second"[..]]);

        let v3 = write(&db, V3, &key);
        assert!(v3.binaries.is_empty());
        let meta = parse(&v3.xml);
        let binaries = meta.child("Meta").and_then(|m| m.child("Binaries")).unwrap();
        assert_eq!(binaries.children.len(), 2);
        assert_eq!(binaries.children[1].attr("ID"), Some("1"));
    }

    #[test]
    fn test_canonical_is_stable() {
        let mut db = Database::new("Vault");
        db.add_entry(EntryBuilder::new("Bank").password("pw").build())
            .unwrap();
        let first = canonical_xml(&db, V4).unwrap();
        let second = canonical_xml(&db, V4).unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("<Value Protected=\"True\">pw</Value>"));
    }

    #[test]
    fn test_group_tags_only_for_kdbx41() {
        let mut db = Database::new("Vault");
        db.add_group(GroupBuilder::new("Tagged").tag("t").build())
            .unwrap();
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);

        let v40 = String::from_utf8(write(&db, V4, &key).xml).unwrap();
        assert!(!v40.contains("<Tags>t</Tags>"));
        let v41 = String::from_utf8(write(&db, FormatRules::V4 { minor: 1 }, &key).xml).unwrap();
        assert!(v41.contains("<Tags>t</Tags>"));
    }
}
