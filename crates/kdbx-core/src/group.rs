//! Group types and operations

use crate::document::node::XmlNode;
use crate::meta::CustomDataItem;
use crate::times::Times;
use uuid::Uuid;

/// Standard folder icon
pub const DEFAULT_GROUP_ICON: u32 = 48;

/// A group (folder) in a KeePass database that contains entries and subgroups
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Unique identifier for this group
    pub uuid: Uuid,
    /// Group name
    pub name: String,
    /// Notes for this group
    pub notes: String,
    /// Icon ID
    pub icon_id: u32,
    pub custom_icon: Option<Uuid>,
    /// UUID of the parent group (None for root)
    pub parent: Option<Uuid>,
    /// UUIDs of child groups, in document order
    pub children: Vec<Uuid>,
    /// UUIDs of entries in this group, in document order
    pub entries: Vec<Uuid>,
    pub times: Times,
    /// Whether this group is expanded in the UI
    pub expanded: bool,
    pub default_auto_type_sequence: String,
    /// `None` inherits from the parent group
    pub enable_auto_type: Option<bool>,
    /// `None` inherits from the parent group
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    /// Only stored by KDBX 4.1 and later
    pub tags: Vec<String>,
    pub custom_data: Vec<CustomDataItem>,
    /// Child elements this crate does not interpret
    pub unknown: Vec<XmlNode>,
    pub unknown_attributes: Vec<(String, String)>,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    /// Create a new group with a specific UUID (used when loading from database)
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            notes: String::new(),
            icon_id: DEFAULT_GROUP_ICON,
            custom_icon: None,
            parent: None,
            children: Vec::new(),
            entries: Vec::new(),
            times: Times::new(),
            expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            tags: Vec::new(),
            custom_data: Vec::new(),
            unknown: Vec::new(),
            unknown_attributes: Vec::new(),
        }
    }

    /// Add a child group UUID
    pub fn add_child(&mut self, child_uuid: Uuid) {
        if !self.children.contains(&child_uuid) {
            self.children.push(child_uuid);
            self.mark_modified();
        }
    }

    /// Remove a child group UUID
    pub fn remove_child(&mut self, child_uuid: &Uuid) -> bool {
        if let Some(pos) = self.children.iter().position(|u| u == child_uuid) {
            self.children.remove(pos);
            self.mark_modified();
            true
        } else {
            false
        }
    }

    /// Add an entry UUID to this group
    pub fn add_entry(&mut self, entry_uuid: Uuid) {
        if !self.entries.contains(&entry_uuid) {
            self.entries.push(entry_uuid);
            self.mark_modified();
        }
    }

    /// Remove an entry UUID from this group
    pub fn remove_entry(&mut self, entry_uuid: &Uuid) -> bool {
        if let Some(pos) = self.entries.iter().position(|u| u == entry_uuid) {
            self.entries.remove(pos);
            self.mark_modified();
            true
        } else {
            false
        }
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Mark as modified
    pub fn mark_modified(&mut self) {
        self.times.mark_modified();
    }
}

/// Builder for creating groups
pub struct GroupBuilder {
    group: Group,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group: Group::new(name),
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.group.notes = notes.into();
        self
    }

    pub fn icon_id(mut self, icon_id: u32) -> Self {
        self.group.icon_id = icon_id;
        self
    }

    pub fn parent(mut self, parent_uuid: Uuid) -> Self {
        self.group.parent = Some(parent_uuid);
        self
    }

    pub fn expanded(mut self, expanded: bool) -> Self {
        self.group.expanded = expanded;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.group.tags.push(tag.into());
        self
    }

    pub fn build(self) -> Group {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creation() {
        let group = Group::new("My Passwords");
        assert_eq!(group.name, "My Passwords");
        assert_eq!(group.icon_id, DEFAULT_GROUP_ICON);
        assert!(group.is_root());
        assert!(group.children.is_empty());
        assert!(group.entries.is_empty());
        assert_eq!(group.enable_searching, None);
    }

    #[test]
    fn test_group_builder() {
        let parent_uuid = Uuid::new_v4();
        let group = GroupBuilder::new("Work")
            .notes("Work-related passwords")
            .icon_id(1)
            .parent(parent_uuid)
            .expanded(false)
            .tag("job")
            .build();

        assert_eq!(group.name, "Work");
        assert_eq!(group.notes, "Work-related passwords");
        assert_eq!(group.icon_id, 1);
        assert_eq!(group.parent, Some(parent_uuid));
        assert!(!group.expanded);
        assert_eq!(group.tags, vec!["job"]);
    }

    #[test]
    fn test_group_children() {
        let mut group = Group::new("Parent");
        let child_uuid = Uuid::new_v4();

        group.add_child(child_uuid);
        assert_eq!(group.children.len(), 1);
        assert!(group.children.contains(&child_uuid));

        // Adding same child again should not duplicate
        group.add_child(child_uuid);
        assert_eq!(group.children.len(), 1);

        // Remove child
        assert!(group.remove_child(&child_uuid));
        assert!(group.children.is_empty());

        // Removing non-existent child returns false
        assert!(!group.remove_child(&child_uuid));
    }

    #[test]
    fn test_group_entries() {
        let mut group = Group::new("Parent");
        let entry_uuid = Uuid::new_v4();

        group.add_entry(entry_uuid);
        assert_eq!(group.entries.len(), 1);
        assert!(group.entries.contains(&entry_uuid));

        assert!(group.remove_entry(&entry_uuid));
        assert!(group.entries.is_empty());
    }
}
