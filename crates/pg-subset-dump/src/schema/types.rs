//! Schema metadata types: tables, columns, constraints, and the schema graph.
//!
//! These types are the in-memory image of the source catalog. They are
//! built once per table by the introspector, shared read-only with the
//! traversal engine and the generators, and serialized wholesale into the
//! schema cache.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ident;

/// A (schema, table) pair naming one table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a user-supplied `"schema.table"` or bare `"table"` (which
    /// takes the given default schema). Both segments are validated here,
    /// so everything downstream can quote them unchecked.
    pub fn parse(input: &str, default_schema: &str) -> Result<Self> {
        let (schema, name) = match input.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => (default_schema, input),
        };
        ident::validate_identifier(schema)?;
        ident::validate_identifier(name)?;
        Ok(Self::new(schema, name))
    }

    /// The quoted, qualified SQL form: `"schema"."table"`.
    pub fn qualified(&self) -> String {
        ident::qualify(&self.schema, &self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Ordinal position (1-based).
    pub ordinal: i32,

    /// Verbose type name from the catalog (e.g. "integer", "character
    /// varying", "timestamp without time zone", "ARRAY", "USER-DEFINED").
    pub data_type: String,

    /// Low-level type name (e.g. "int4", "_text" for text arrays, the enum
    /// name for user-defined types). Literal formatting keys off this.
    pub udt_name: String,

    /// Whether the column allows NULL.
    pub nullable: bool,

    /// Default expression, if any.
    pub default_expr: Option<String>,

    /// Whether the column value is auto-generated (declared identity or
    /// sequence-backed serial).
    pub is_identity: bool,
}

/// A unique constraint (ordered column list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

/// Foreign key metadata. Column lists are ordered and of equal length;
/// composite keys are supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Constrained (referencing) table.
    pub from_table: TableRef,

    /// Constrained columns, in constraint order.
    pub from_columns: Vec<String>,

    /// Referenced table.
    pub to_table: TableRef,

    /// Referenced columns, in constraint order.
    pub to_columns: Vec<String>,

    /// ON DELETE action.
    pub on_delete: String,
}

impl ForeignKey {
    /// A self-referencing constraint points back at its own table.
    pub fn is_self_referencing(&self) -> bool {
        self.from_table == self.to_table
    }
}

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// The table's identity.
    pub table_ref: TableRef,

    /// Column definitions, in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,

    /// Unique constraints (excluding the primary key).
    pub unique_constraints: Vec<UniqueConstraint>,

    /// Foreign keys from this table to others.
    pub outgoing_fks: Vec<ForeignKey>,

    /// Foreign keys from other tables to this one (the inverse index over
    /// the whole schema graph).
    pub incoming_fks: Vec<ForeignKey>,
}

impl Table {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        self.table_ref.to_string()
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Check if the table has a single-column primary key.
    pub fn has_single_pk(&self) -> bool {
        self.primary_key.len() == 1
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns, in key order.
    pub fn pk_columns(&self) -> Vec<&Column> {
        self.primary_key
            .iter()
            .filter_map(|name| self.column(name))
            .collect()
    }

    /// True when the primary key is a single auto-generated column. Only
    /// such tables are eligible for primary-key remapping; any non-identity
    /// or composite component disqualifies the table.
    pub fn has_remappable_pk(&self) -> bool {
        self.has_single_pk()
            && self
                .column(&self.primary_key[0])
                .map(|c| c.is_identity)
                .unwrap_or(false)
    }
}

/// Mapping from table reference to introspected table, populated lazily.
///
/// Serializes as a flat table list so it can live in the schema cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphRepr", into = "GraphRepr")]
pub struct SchemaGraph {
    tables: BTreeMap<TableRef, Table>,
    foreign_keys: Vec<ForeignKey>,
}

/// Serialized form of [`SchemaGraph`].
#[derive(Serialize, Deserialize)]
struct GraphRepr {
    tables: Vec<Table>,
    foreign_keys: Vec<ForeignKey>,
}

impl From<GraphRepr> for SchemaGraph {
    fn from(repr: GraphRepr) -> Self {
        Self {
            tables: repr
                .tables
                .into_iter()
                .map(|t| (t.table_ref.clone(), t))
                .collect(),
            foreign_keys: repr.foreign_keys,
        }
    }
}

impl From<SchemaGraph> for GraphRepr {
    fn from(graph: SchemaGraph) -> Self {
        Self {
            tables: graph.tables.into_values().collect(),
            foreign_keys: graph.foreign_keys,
        }
    }
}

impl SchemaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_ref: &TableRef) -> Option<&Table> {
        self.tables.get(table_ref)
    }

    pub fn contains(&self, table_ref: &TableRef) -> bool {
        self.tables.contains_key(table_ref)
    }

    pub fn insert(&mut self, table: Table) {
        self.tables.insert(table.table_ref.clone(), table);
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// All foreign key constraints known to the graph, both directions
    /// already indexed onto the member tables.
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn set_foreign_keys(&mut self, fks: Vec<ForeignKey>) {
        self.foreign_keys = fks;
    }
}
