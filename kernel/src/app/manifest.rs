//! Registry of installed applications.
//!
//! Built once at boot (built-ins first, then the flash scan) and never
//! mutated afterwards, so it carries no lock. Records live for the life
//! of the process.

use alloc::string::String;
use alloc::vec::Vec;

use quartzos_app_proto::ApplicationHeader;

use crate::app::AppEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppType {
    /// Privileged UI behavior: the select button dispatches into the menu
    /// instead of leaving the app.
    System,
    /// Watchface.
    Face,
    Watchapp,
}

pub struct AppRecord {
    pub name: String,
    pub app_type: AppType,
    /// Host-linked entry for built-ins; `None` for flash apps, whose
    /// entry address only exists once the loader has produced an image.
    pub entry: Option<AppEntry>,
    pub is_internal: bool,
    pub slot_id: u8,
    pub header: Option<ApplicationHeader>,
}

impl AppRecord {
    pub fn internal(name: &str, app_type: AppType, entry: AppEntry) -> Self {
        Self {
            name: String::from(name),
            app_type,
            entry: Some(entry),
            is_internal: true,
            slot_id: 0,
            header: None,
        }
    }
}

/// Insertion-ordered, append-only collection of [`AppRecord`]s.
#[derive(Default)]
pub struct Manifest {
    records: Vec<AppRecord>,
}

impl Manifest {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Append a record. Duplicate names are accepted; lookup returns the
    /// first match.
    pub fn add(&mut self, record: AppRecord) {
        self.records.push(record);
    }

    /// Find an app by name. A stored name of length n matches any query
    /// whose first n bytes equal it, so `"System"` also answers a query
    /// of `"SystemFoo"`; menu-driven callers depend on this staying
    /// order-stable.
    pub fn lookup(&self, name: &str) -> Option<&AppRecord> {
        self.lookup_index(name).map(|i| &self.records[i])
    }

    pub fn lookup_index(&self, name: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| name.as_bytes().starts_with(r.name.as_bytes()))
    }

    pub fn get(&self, index: usize) -> Option<&AppRecord> {
        self.records.get(index)
    }

    /// First record, for UI enumeration.
    pub fn head(&self) -> Option<&AppRecord> {
        self.records.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
