//! Storage-side contracts and the in-memory reference store.

mod dedup;
mod handle;
mod memory;
mod store;

pub use dedup::DedupStore;
pub use handle::{meta, PinHandle};
pub use memory::{Dataset, MemStore, PinRecord};
pub use store::{Cardinality, Intent, KeyRange, OpKind, PinStore};
