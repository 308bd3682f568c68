//! Database-wide metadata (`KeePassFile/Meta`)

use crate::document::node::XmlNode;
use crate::entry::{NOTES, PASSWORD, TITLE, URL, USER_NAME};
use crate::times::now;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;
pub const DEFAULT_MAINTENANCE_HISTORY_DAYS: u32 = 365;

/// Which standard fields are protected in memory by default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_user_name: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl MemoryProtection {
    /// Whether a newly set value for `key` should be protected
    pub fn protects(&self, key: &str) -> bool {
        match key {
            TITLE => self.protect_title,
            USER_NAME => self.protect_user_name,
            PASSWORD => self.protect_password,
            URL => self.protect_url,
            NOTES => self.protect_notes,
            _ => false,
        }
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

/// Key/value pair stored by plugins and other clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomDataItem {
    pub key: String,
    pub value: String,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub name: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub generator: String,
    pub settings_changed: Option<DateTime<Utc>>,
    pub database_name: String,
    pub database_name_changed: Option<DateTime<Utc>>,
    pub database_description: String,
    pub database_description_changed: Option<DateTime<Utc>>,
    pub default_user_name: String,
    pub default_user_name_changed: Option<DateTime<Utc>>,
    pub maintenance_history_days: u32,
    pub color: String,
    pub master_key_changed: Option<DateTime<Utc>>,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    /// Nil when no recycle bin exists yet
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: Option<DateTime<Utc>>,
    /// Negative means unlimited
    pub history_max_items: i32,
    /// Bytes; negative means unlimited
    pub history_max_size: i64,
    pub custom_data: Vec<CustomDataItem>,
    /// Elements this crate does not interpret
    pub unknown: Vec<XmlNode>,
}

impl Meta {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now();
        Self {
            generator: crate::GENERATOR.to_string(),
            settings_changed: Some(now),
            database_name: name.into(),
            database_name_changed: Some(now),
            database_description: String::new(),
            database_description_changed: Some(now),
            default_user_name: String::new(),
            default_user_name_changed: Some(now),
            maintenance_history_days: DEFAULT_MAINTENANCE_HISTORY_DAYS,
            color: String::new(),
            master_key_changed: Some(now),
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: Some(now),
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            custom_data: Vec::new(),
            unknown: Vec::new(),
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.database_name = name.into();
        self.database_name_changed = Some(now());
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.database_description = description.into();
        self.database_description_changed = Some(now());
    }

    pub fn recycle_bin(&self) -> Option<Uuid> {
        if self.recycle_bin_enabled && !self.recycle_bin_uuid.is_nil() {
            Some(self.recycle_bin_uuid)
        } else {
            None
        }
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protection() {
        let protection = MemoryProtection::default();
        assert!(protection.protects(PASSWORD));
        assert!(!protection.protects(TITLE));
        assert!(!protection.protects("Custom"));
    }

    #[test]
    fn test_history_defaults() {
        let meta = Meta::new("Vault");
        assert_eq!(meta.database_name, "Vault");
        assert_eq!(meta.history_max_items, 10);
        assert_eq!(meta.history_max_size, 6 * 1024 * 1024);
        assert_eq!(meta.recycle_bin(), None);
    }
}
