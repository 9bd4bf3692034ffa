//! Record-level types: primary key values, record identifiers, raw column
//! values, and the per-record data collected during traversal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::schema::TableRef;

/// A primary key component value.
///
/// Kept deliberately narrow: integers, UUIDs, and text cover the key types
/// the tool supports, and all three are hashable and totally ordered, which
/// the visited set and the deterministic sort both rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PkValue {
    /// Integer key (covers smallint, integer, bigint).
    Int(i64),
    /// UUID key.
    Uuid(Uuid),
    /// Text key (varchar, text, char).
    Text(String),
}

impl PkValue {
    /// Parse a user-supplied key string according to the column's catalog
    /// type, so seed identifiers compare equal to fetched ones.
    pub fn parse(input: &str, udt_name: &str) -> Self {
        match udt_name {
            "int2" | "int4" | "int8" => input
                .trim()
                .parse::<i64>()
                .map(PkValue::Int)
                .unwrap_or_else(|_| PkValue::Text(input.to_string())),
            "uuid" => Uuid::parse_str(input.trim())
                .map(PkValue::Uuid)
                .unwrap_or_else(|_| PkValue::Text(input.to_string())),
            _ => PkValue::Text(input.to_string()),
        }
    }

    /// Render as a SQL literal for use in WHERE clauses. Single quotes in
    /// text keys are doubled.
    pub fn to_sql_literal(&self) -> String {
        match self {
            PkValue::Int(v) => v.to_string(),
            PkValue::Uuid(v) => format!("'{}'", v),
            PkValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
        }
    }
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{}", v),
            PkValue::Uuid(v) => write!(f, "{}", v),
            PkValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for PkValue {
    fn from(v: i64) -> Self {
        PkValue::Int(v)
    }
}

impl From<&str> for PkValue {
    fn from(v: &str) -> Self {
        PkValue::Text(v.to_string())
    }
}

/// Uniquely names one row: table plus primary key tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordIdentifier {
    pub table: TableRef,
    pub pk: Vec<PkValue>,
}

impl RecordIdentifier {
    pub fn new(table: TableRef, pk: Vec<PkValue>) -> Self {
        Self { table, pk }
    }
}

impl fmt::Display for RecordIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pk = self
            .pk
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({})", self.table, pk)
    }
}

/// A raw column value as fetched from the source, typed by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
    Array(Vec<RawValue>),
    /// Textual fallback for types without a dedicated variant (enums and
    /// other user-defined types).
    Other(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Narrow to a primary key value, when the runtime type allows it.
    pub fn as_pk_value(&self) -> Option<PkValue> {
        match self {
            RawValue::I16(v) => Some(PkValue::Int(*v as i64)),
            RawValue::I32(v) => Some(PkValue::Int(*v as i64)),
            RawValue::I64(v) => Some(PkValue::Int(*v)),
            RawValue::Uuid(v) => Some(PkValue::Uuid(*v)),
            RawValue::Text(v) => Some(PkValue::Text(v.clone())),
            RawValue::Other(v) => Some(PkValue::Text(v.clone())),
            _ => None,
        }
    }
}

/// One collected record: identity, raw column values, and the identifiers
/// of records it depends on through resolved outgoing foreign keys.
#[derive(Debug, Clone)]
pub struct RecordData {
    pub identifier: RecordIdentifier,
    pub values: BTreeMap<String, RawValue>,
    pub dependencies: BTreeSet<RecordIdentifier>,
}

impl RecordData {
    pub fn new(identifier: RecordIdentifier, values: BTreeMap<String, RawValue>) -> Self {
        Self {
            identifier,
            values,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn value(&self, column: &str) -> Option<&RawValue> {
        self.values.get(column)
    }
}
