//! PIN store query execution engine.
//!
//! Physical operators pull rows of [`storage::PinHandle`] slots from their
//! inputs; [`query::BuildCtx`] turns declarative query descriptions into
//! operator trees and [`query::Cursor`] drives them.

pub mod query;
pub mod storage;
pub mod types;

pub use query::{BuildCtx, Cursor, QueryConfig, QueryCtx, QueryVar};
pub use storage::{MemStore, PinHandle, PinStore};
pub use types::{PinError, PinId, PropId, Result, Value};
