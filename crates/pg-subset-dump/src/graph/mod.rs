//! Record-level data model and the relationship traversal engine.

mod records;
mod traverser;

pub use records::{PkValue, RawValue, RecordData, RecordIdentifier};
pub use traverser::{TraversalOptions, Traverser};
