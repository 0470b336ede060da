//! In-flight reference to one PIN.

use smallvec::SmallVec;

use crate::types::{PageAddr, PinId, PropId, Value};

/// Record-level metadata bits carried by a handle.
pub mod meta {
    /// Body is marked hidden from ordinary queries.
    pub const HIDDEN: u32 = 1 << 0;
    /// Body carries a tombstone.
    pub const DELETED: u32 = 1 << 1;
    /// A row lock is held on behalf of the session.
    pub const LOCKED: u32 = 1 << 2;
    /// ACL grants read but not write access.
    pub const READ_ONLY: u32 = 1 << 3;
    /// Body was loaded for update.
    pub const FOR_UPDATE: u32 = 1 << 4;
}

/// Lazily resolved reference: identity, optional cached address, and an
/// optional partially loaded property set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PinHandle {
    id: Option<PinId>,
    addr: Option<PageAddr>,
    props: SmallVec<[(PropId, Value); 4]>,
    meta: u32,
    body_loaded: bool,
}

impl PinHandle {
    /// Handle bound to `id` with nothing loaded.
    pub fn new(id: PinId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Handle with no identity; the empty side of an outer join row.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rebinds the slot to a new row, dropping everything loaded.
    pub fn bind(&mut self, id: PinId) {
        self.cleanup();
        self.id = Some(id);
    }

    /// Releases loaded properties, address, and metadata between rows.
    pub fn cleanup(&mut self) {
        self.addr = None;
        self.props.clear();
        self.meta = 0;
        self.body_loaded = false;
    }

    /// Clears the identity too; the slot becomes [`PinHandle::empty`].
    pub fn clear(&mut self) {
        self.cleanup();
        self.id = None;
    }

    /// Identity carried by the handle.
    pub fn id(&self) -> Option<PinId> {
        self.id
    }

    /// Returns true when the handle has no identity.
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }

    /// Cached storage address.
    pub fn addr(&self) -> Option<PageAddr> {
        self.addr
    }

    /// Caches the resolved storage address.
    pub fn set_addr(&mut self, addr: PageAddr) {
        self.addr = Some(addr);
    }

    /// Whether the body has been fetched by the store.
    pub fn body_loaded(&self) -> bool {
        self.body_loaded
    }

    /// Marks the body as fetched.
    pub fn mark_loaded(&mut self) {
        self.body_loaded = true;
    }

    /// Metadata bits, see [`meta`].
    pub fn meta(&self) -> u32 {
        self.meta
    }

    /// ORs metadata bits into the handle.
    pub fn add_meta(&mut self, bits: u32) {
        self.meta |= bits;
    }

    /// Loaded value of `prop`, if resident.
    pub fn prop(&self, prop: PropId) -> Option<&Value> {
        self.props
            .iter()
            .find_map(|(id, value)| if *id == prop { Some(value) } else { None })
    }

    /// Inserts or replaces a resident property.
    pub fn set_prop(&mut self, prop: PropId, value: Value) {
        if let Some(slot) = self.props.iter_mut().find(|(id, _)| *id == prop) {
            slot.1 = value;
        } else {
            self.props.push((prop, value));
        }
    }

    /// Returns true when every listed property is resident.
    pub fn has_props(&self, props: &[PropId]) -> bool {
        props.iter().all(|prop| self.prop(*prop).is_some())
    }

    /// Properties from `props` that are not resident yet.
    pub fn missing(&self, props: &[PropId]) -> SmallVec<[PropId; 4]> {
        props
            .iter()
            .copied()
            .filter(|prop| self.prop(*prop).is_none())
            .collect()
    }

    /// Iterates resident properties in load order.
    pub fn props(&self) -> impl Iterator<Item = &(PropId, Value)> {
        self.props.iter()
    }
}
