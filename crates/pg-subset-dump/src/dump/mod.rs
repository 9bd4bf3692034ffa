//! Replay generation: dependency ordering, key remap planning, SQL and DDL
//! generation, and the output sink.

mod ddl;
mod remap;
mod sorter;
mod sql;
mod writer;

pub use ddl::DdlGenerator;
pub use remap::{build_pk_map, serialize_pk, PkMap, RemapEntry};
pub use sorter::{topo_sort, SortOutcome};
pub use sql::{format_value, GenerateOptions, SqlGenerator};
pub use writer::{default_dump_path, dump_filename, write_output};
