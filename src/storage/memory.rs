//! In-memory [`PinStore`] used by the CLI and the test suites.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::handle::{meta, PinHandle};
use crate::storage::store::{Cardinality, Intent, KeyRange, OpKind, PinStore};
use crate::types::{ClassId, PageAddr, PinError, PinId, PropId, Result, Value};

const SLOTS_PER_PAGE: u64 = 64;

/// One stored PIN.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinRecord {
    /// Identity.
    pub id: PinId,
    /// Classes the PIN belongs to.
    pub classes: Vec<ClassId>,
    /// Property values.
    pub props: Vec<(PropId, Value)>,
    /// Hidden from ordinary queries.
    pub hidden: bool,
    /// Carries a tombstone.
    pub deleted: bool,
    /// ACL denies every access.
    pub denied: bool,
    /// ACL denies writes.
    pub read_only: bool,
}

impl PinRecord {
    /// Record with identity `id` and nothing else.
    pub fn new(id: u64) -> Self {
        Self {
            id: PinId(id),
            ..Self::default()
        }
    }

    /// Adds a class membership.
    pub fn with_class(mut self, class: u32) -> Self {
        self.classes.push(ClassId(class));
        self
    }

    /// Sets a property value.
    pub fn with_prop(mut self, prop: u32, value: impl Into<Value>) -> Self {
        self.props.push((PropId(prop), value.into()));
        self
    }

    /// Marks the record hidden.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Marks the record deleted.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Makes the ACL reject the record.
    pub fn denied(mut self) -> Self {
        self.denied = true;
        self
    }

    fn prop(&self, prop: PropId) -> Option<&Value> {
        self.props
            .iter()
            .find_map(|(id, value)| (*id == prop).then_some(value))
    }

    fn visible(&self, include_deleted: bool) -> bool {
        !self.hidden && (include_deleted || !self.deleted)
    }
}

/// Dataset file format accepted by [`MemStore::from_json`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    /// Stored PINs.
    pub pins: Vec<PinRecord>,
    /// Properties carrying a value index.
    pub indexes: Vec<PropId>,
}

#[derive(Default)]
struct Inner {
    pins: BTreeMap<PinId, PinRecord>,
    indexes: BTreeSet<PropId>,
}

/// Thread-safe in-memory PIN store.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a dataset.
    pub fn from_dataset(dataset: Dataset) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write();
            for record in dataset.pins {
                inner.pins.insert(record.id, record);
            }
            inner.indexes.extend(dataset.indexes);
        }
        store
    }

    /// Parses a JSON dataset.
    pub fn from_json(json: &str) -> Result<Self> {
        let dataset: Dataset = serde_json::from_str(json)?;
        debug!(
            pins = dataset.pins.len(),
            indexes = dataset.indexes.len(),
            "memstore.load"
        );
        Ok(Self::from_dataset(dataset))
    }

    /// Reads and parses a JSON dataset file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Adds a record, replacing any previous record with the same identity.
    pub fn with_pin(self, record: PinRecord) -> Self {
        self.insert(record);
        self
    }

    /// Declares a value index on `prop`.
    pub fn with_index(self, prop: u32) -> Self {
        self.inner.write().indexes.insert(PropId(prop));
        self
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: PinRecord) {
        self.inner.write().pins.insert(record.id, record);
    }

    /// Flips the ACL denial flag of an existing record.
    pub fn set_denied(&self, id: PinId, denied: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.pins.get_mut(&id).ok_or(PinError::NotFound)?;
        record.denied = denied;
        Ok(())
    }

    /// Number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().pins.len()
    }

    /// Returns true when the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.read().pins.is_empty()
    }
}

fn handle_id(handle: &PinHandle) -> Result<PinId> {
    handle
        .id()
        .ok_or(PinError::Invalid("handle carries no identity"))
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

fn has_word(value: &Value, word: &str) -> bool {
    match value {
        Value::String(s) => tokenize(s).any(|token| token == word),
        Value::Coll(items) => items.iter().any(|item| has_word(item, word)),
        _ => false,
    }
}

impl PinStore for MemStore {
    fn resolve_address(&self, id: PinId) -> Result<PageAddr> {
        if !self.inner.read().pins.contains_key(&id) {
            return Err(PinError::NotFound);
        }
        let raw = id.0 & !PinId::REMOTE_BIT;
        let page = u32::try_from(raw / SLOTS_PER_PAGE)
            .map_err(|_| PinError::Corruption("identity outside addressable pages"))?;
        Ok(PageAddr {
            page,
            slot: (raw % SLOTS_PER_PAGE) as u16,
        })
    }

    fn load_body(&self, handle: &mut PinHandle, intent: Intent) -> Result<()> {
        let id = handle_id(handle)?;
        let addr = match handle.addr() {
            Some(addr) => addr,
            None => self.resolve_address(id)?,
        };
        let inner = self.inner.read();
        let record = inner.pins.get(&id).ok_or(PinError::NotFound)?;
        let mut bits = 0;
        if record.hidden {
            bits |= meta::HIDDEN;
        }
        if record.deleted {
            bits |= meta::DELETED;
        }
        if record.read_only {
            bits |= meta::READ_ONLY;
        }
        if intent == Intent::Write {
            bits |= meta::FOR_UPDATE;
        }
        handle.set_addr(addr);
        handle.add_meta(bits);
        handle.mark_loaded();
        Ok(())
    }

    fn get_property(
        &self,
        handle: &PinHandle,
        prop: PropId,
        mode: Cardinality,
    ) -> Result<Value> {
        let id = handle_id(handle)?;
        let inner = self.inner.read();
        let record = inner.pins.get(&id).ok_or(PinError::NotFound)?;
        let value = match (record.prop(prop), mode) {
            (None, _) => Value::Null,
            (Some(value), Cardinality::All) => value.clone(),
            (Some(value), Cardinality::Single) => value.element(0).cloned().unwrap_or(Value::Null),
        };
        Ok(value)
    }

    fn check_lock_and_acl(&self, handle: &PinHandle, op: OpKind) -> Result<()> {
        let id = handle_id(handle)?;
        let inner = self.inner.read();
        let record = inner.pins.get(&id).ok_or(PinError::NotFound)?;
        if record.denied {
            return Err(PinError::NoAccess);
        }
        if record.read_only && op != OpKind::Read {
            return Err(PinError::NoAccess);
        }
        Ok(())
    }

    fn has_index(&self, prop: PropId) -> bool {
        self.inner.read().indexes.contains(&prop)
    }

    fn full_scan(&self, include_deleted: bool) -> Result<Vec<PinId>> {
        let inner = self.inner.read();
        Ok(inner
            .pins
            .values()
            .filter(|record| record.visible(include_deleted))
            .map(|record| record.id)
            .collect())
    }

    fn class_scan(&self, class: ClassId, include_deleted: bool) -> Result<Vec<PinId>> {
        let inner = self.inner.read();
        Ok(inner
            .pins
            .values()
            .filter(|record| record.visible(include_deleted) && record.classes.contains(&class))
            .map(|record| record.id)
            .collect())
    }

    fn index_scan(&self, prop: PropId, range: &KeyRange) -> Result<Vec<(Value, PinId)>> {
        let inner = self.inner.read();
        if !inner.indexes.contains(&prop) {
            return Err(PinError::Invalid("property is not indexed"));
        }
        let mut entries = Vec::new();
        for record in inner.pins.values().filter(|record| record.visible(false)) {
            let Some(value) = record.prop(prop) else {
                continue;
            };
            let elements: Vec<&Value> = match value {
                Value::Coll(items) => items.iter().collect(),
                other => vec![other],
            };
            for element in elements {
                // Index entries only exist for kinds comparable with the bound.
                match range.contains(element) {
                    Ok(true) => entries.push((element.clone(), record.id)),
                    Ok(false) | Err(PinError::TypeMismatch(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0, false).then(a.1.cmp(&b.1)));
        Ok(entries)
    }

    fn text_scan(&self, prop: Option<PropId>, word: &str) -> Result<Vec<PinId>> {
        let word = word.to_lowercase();
        let inner = self.inner.read();
        Ok(inner
            .pins
            .values()
            .filter(|record| record.visible(false))
            .filter(|record| match prop {
                Some(prop) => record.prop(prop).is_some_and(|value| has_word(value, &word)),
                None => record.props.iter().any(|(_, value)| has_word(value, &word)),
            })
            .map(|record| record.id)
            .collect())
    }
}
