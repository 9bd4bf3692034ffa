//! Run configuration: types, environment defaults, and input validation.

mod types;
mod validation;

pub use types::{
    CacheConfig, ConnectionConfig, OutputTarget, ReadOnlyPosture, RunConfig, SeedSpec,
    TimeframeFilter, TraversalMode,
};
pub use validation::{parse_pk_list, parse_timeframe};
