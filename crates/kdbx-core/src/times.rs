//! Timestamps shared by groups and entries

use crate::document::node::XmlNode;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Current time truncated to whole seconds, the resolution the file stores
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// The `Times` block of a group or entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Times {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    /// Whether `expiry` is in effect
    pub expires: bool,
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
    #[serde(skip)]
    pub unknown: Vec<XmlNode>,
}

impl Times {
    pub fn new() -> Self {
        let now = now();
        Self {
            created: now,
            modified: now,
            accessed: now,
            expiry: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
            unknown: Vec::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry < Utc::now()
    }

    pub fn touch(&mut self) {
        self.accessed = now();
    }

    pub fn mark_modified(&mut self) {
        let now = now();
        self.modified = now;
        self.accessed = now;
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::new()
    }
}
