//! Entry types and operations

use crate::binary::{BinaryId, BinaryPool};
use crate::document::node::XmlNode;
use crate::meta::CustomDataItem;
use crate::protect::ProtectedValue;
use crate::times::Times;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const TITLE: &str = "Title";
pub const USER_NAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

/// Fields every KeePass entry carries, in the order KeePass writes them
pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USER_NAME, PASSWORD, URL, NOTES];

/// Value of an entry field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Plain(String),
    /// Obfuscated with the document keystream; see [`crate::Database::reveal`]
    Protected(ProtectedValue),
}

impl FieldValue {
    pub fn is_protected(&self) -> bool {
        matches!(self, FieldValue::Protected(_))
    }

    /// Byte length of the (plain or obfuscated) value
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Plain(text) => text.len(),
            FieldValue::Protected(value) => value.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: FieldValue,
}

/// Named reference to a pooled attachment payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub binary: BinaryId,
}

/// A password entry in a KeePass database
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Unique identifier for this entry
    pub uuid: Uuid,
    /// UUID of the parent group; history snapshots have none
    pub parent_group: Option<Uuid>,
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub tags: Vec<String>,
    pub times: Times,
    fields: Vec<Field>,
    pub attachments: Vec<Attachment>,
    /// Auto-type settings, kept verbatim
    pub auto_type: Option<XmlNode>,
    pub custom_data: Vec<CustomDataItem>,
    /// Previous revisions, oldest first. Snapshots never carry history.
    pub history: Vec<Entry>,
    /// Child elements this crate does not interpret
    pub unknown: Vec<XmlNode>,
    pub unknown_attributes: Vec<(String, String)>,
}

/// A secure string that is zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureString(***)")
    }
}

impl PartialEq<str> for SecureString {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl Entry {
    /// Create a new entry with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let mut entry = Self::with_uuid(Uuid::new_v4());
        entry.set_plain(TITLE, title);
        entry
    }

    /// Empty entry with a specific UUID (used when loading from a file)
    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            parent_group: None,
            icon_id: 0,
            custom_icon: None,
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: Vec::new(),
            times: Times::new(),
            fields: Vec::new(),
            attachments: Vec::new(),
            auto_type: None,
            custom_data: Vec::new(),
            history: Vec::new(),
            unknown: Vec::new(),
            unknown_attributes: Vec::new(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Plain text of a field; `None` if missing or protected
    pub fn get_plain(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(FieldValue::Plain(text)) => Some(text),
            _ => None,
        }
    }

    pub fn title(&self) -> &str {
        self.get_plain(TITLE).unwrap_or("")
    }

    pub fn username(&self) -> &str {
        self.get_plain(USER_NAME).unwrap_or("")
    }

    pub fn url(&self) -> &str {
        self.get_plain(URL).unwrap_or("")
    }

    pub fn notes(&self) -> &str {
        self.get_plain(NOTES).unwrap_or("")
    }

    /// Insert or replace a field, keeping its position when it exists
    pub(crate) fn set_value(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|f| f.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(Field { key, value }),
        }
    }

    /// Set an unprotected field
    pub fn set_plain(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set_value(key, FieldValue::Plain(value.into()));
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|f| f.key == key)?;
        Some(self.fields.remove(pos).value)
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = &mut Field> {
        self.fields.iter_mut()
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    /// Every payload referenced by this entry and its history
    pub fn referenced_binaries(&self) -> impl Iterator<Item = &BinaryId> {
        self.attachments
            .iter()
            .chain(self.history.iter().flat_map(|h| h.attachments.iter()))
            .map(|a| &a.binary)
    }

    /// Approximate storage size, used by the history size limit
    pub fn estimated_size(&self, binaries: &BinaryPool) -> usize {
        let fields: usize = self.fields.iter().map(|f| f.key.len() + f.value.len()).sum();
        let attachments: usize = self
            .attachments
            .iter()
            .map(|a| a.name.len() + binaries.get(&a.binary).map_or(0, |b| b.data.len()))
            .sum();
        let tags: usize = self.tags.iter().map(|t| t.len()).sum();
        let custom: usize = self
            .custom_data
            .iter()
            .map(|c| c.key.len() + c.value.len())
            .sum();
        128 + fields + attachments + tags + custom + self.override_url.len()
    }

    /// Copy of this entry suitable for storing in history
    pub fn snapshot(&self) -> Entry {
        let mut snapshot = self.clone();
        snapshot.history.clear();
        snapshot.parent_group = None;
        snapshot
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    /// Update the accessed timestamp
    pub fn touch(&mut self) {
        self.times.touch();
    }

    /// Mark as modified
    pub fn mark_modified(&mut self) {
        self.times.mark_modified();
    }
}

/// Builder for creating entries
///
/// Values are plain until the entry is added to a database, which protects
/// them according to the database's memory protection settings.
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.entry.set_plain(USER_NAME, username);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.entry.set_plain(PASSWORD, password);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.entry.set_plain(URL, url);
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.entry.set_plain(NOTES, notes);
        self
    }

    pub fn custom_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.set_plain(key, value);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.entry.tags.push(tag.into());
        self
    }

    pub fn icon_id(mut self, icon_id: u32) -> Self {
        self.entry.icon_id = icon_id;
        self
    }

    pub fn parent_group(mut self, group_uuid: Uuid) -> Self {
        self.entry.parent_group = Some(group_uuid);
        self
    }

    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.entry.times.expiry = expires;
        self.entry.times.expires = true;
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}
