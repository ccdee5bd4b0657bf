//! 2D resource table
//!
//! Live resources keyed by their guest-chosen id. The table is only touched
//! from the single-threaded queue pump; there is no interior locking here.

use std::collections::BTreeMap;

use crate::image::{HostPixelFormat, SharedImage};
use crate::memory::GuestSlice;

/// A guest-created 2D resource: host pixels plus optional guest backing.
#[derive(Debug)]
pub struct Resource2d {
    /// Guest-chosen non-zero id, unique across live resources.
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub format: HostPixelFormat,
    /// Host pixel buffer; shared with the display while a surface over it
    /// is published.
    pub image: SharedImage,
    /// Translated guest scatter list, in guest order. `None` while detached.
    pub backing: Option<Vec<GuestSlice>>,
}

/// Mapping from resource id to resource. Insertion requires a fresh id;
/// iteration order is irrelevant.
#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: BTreeMap<u32, Resource2d>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: u32) -> Option<&Resource2d> {
        self.resources.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Resource2d> {
        self.resources.get_mut(&id)
    }

    /// Insert a new resource. Returns the resource back when the id is
    /// already taken, leaving the table unchanged.
    pub fn insert(&mut self, resource: Resource2d) -> Result<(), Resource2d> {
        match self.resources.entry(resource.id) {
            std::collections::btree_map::Entry::Occupied(_) => Err(resource),
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(resource);
                Ok(())
            }
        }
    }

    /// Remove a resource, dropping our image ref and the backing vector.
    pub fn remove(&mut self, id: u32) -> Option<Resource2d> {
        self.resources.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource2d> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Drop every resource. Used on device reset and teardown.
    pub fn clear(&mut self) {
        self.resources.clear();
    }
}
