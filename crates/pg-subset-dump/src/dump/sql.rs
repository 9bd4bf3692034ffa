//! Replay stream generation.
//!
//! Turns the topologically ordered records into one SQL script. Values are
//! formatted by declared column type, never by runtime inspection.
//! Identifiers are always double-quoted and columns are listed explicitly
//! in ordinal order.
//!
//! Two shapes of output:
//! - keep-pks: multi-row `INSERT ... ON CONFLICT (pk) DO NOTHING` batches,
//!   one per run of consecutive same-table records.
//! - remap: a single PL/pgSQL `DO` block that inserts remapped rows without
//!   their key column, captures the target-assigned key into a temp mapping
//!   table, and resolves referencing columns through it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use chrono::{SecondsFormat, Utc};

use crate::dump::remap::{serialize_pk, PkMap};
use crate::error::{DumpError, Result};
use crate::graph::{RawValue, RecordData, RecordIdentifier};
use crate::ident;
use crate::schema::{Column, SchemaGraph, Table};

/// Rows per multi-row INSERT statement.
const MAX_ROWS_PER_INSERT: usize = 100;

/// Name of the session-temp table that carries captured keys.
const PK_MAP_TABLE: &str = "_pg_subset_pk_map";

/// Options for one generation pass.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub keep_pks: bool,
    pub include_transaction: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            keep_pks: true,
            include_transaction: true,
        }
    }
}

/// Replay stream generator. Borrows the schema graph read-only; records are
/// borrowed in topological order and not retained.
pub struct SqlGenerator<'a> {
    graph: &'a SchemaGraph,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(graph: &'a SchemaGraph) -> Self {
        Self { graph }
    }

    /// Generate the full replay script.
    pub fn generate(
        &self,
        ordered: &[RecordIdentifier],
        records: &BTreeMap<RecordIdentifier, RecordData>,
        pk_map: &PkMap,
        cycle_members: &BTreeSet<RecordIdentifier>,
        ddl_prelude: Option<&str>,
        opts: &GenerateOptions,
    ) -> Result<String> {
        let mut out = String::new();

        writeln!(out, "-- Generated by pg-subset-dump {}", env!("CARGO_PKG_VERSION")).ok();
        writeln!(
            out,
            "-- Date: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .ok();
        writeln!(out, "-- Records: {}", ordered.len()).ok();
        out.push('\n');

        // CREATE DATABASE cannot run inside a transaction, so the DDL
        // prelude precedes the BEGIN.
        if let Some(ddl) = ddl_prelude {
            out.push_str(ddl);
            if !ddl.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }

        if opts.include_transaction {
            out.push_str("BEGIN;\n\n");
        }
        if !cycle_members.is_empty() {
            out.push_str("-- Dependency cycles present; constraint checks are deferred.\n");
            out.push_str("SET CONSTRAINTS ALL DEFERRED;\n\n");
        }

        if opts.keep_pks {
            self.generate_plain(&mut out, ordered, records)?;
        } else {
            self.generate_remapped(&mut out, ordered, records, pk_map)?;
        }

        if opts.include_transaction {
            out.push_str("COMMIT;\n");
        }

        Ok(out)
    }

    /// Multi-row inserts with literal keys.
    fn generate_plain(
        &self,
        out: &mut String,
        ordered: &[RecordIdentifier],
        records: &BTreeMap<RecordIdentifier, RecordData>,
    ) -> Result<()> {
        for group in consecutive_table_groups(ordered) {
            let table = self.table_of(&group[0])?;
            writeln!(
                out,
                "-- Table: {} ({} records)",
                table.table_ref.qualified(),
                group.len()
            )
            .ok();

            for chunk in group.chunks(MAX_ROWS_PER_INSERT) {
                let columns = &table.columns;
                let column_list = columns
                    .iter()
                    .map(|c| ident::quote(&c.name))
                    .collect::<Vec<_>>()
                    .join(", ");

                let mut rows = Vec::with_capacity(chunk.len());
                for id in chunk {
                    let record = records.get(id).ok_or_else(|| {
                        DumpError::Output(format!("record {} missing from collection", id))
                    })?;
                    let values = columns
                        .iter()
                        .map(|c| format_value(record.value(&c.name).unwrap_or(&RawValue::Null), c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    rows.push(format!("    ({})", values));
                }

                writeln!(
                    out,
                    "INSERT INTO {} ({})\nVALUES\n{}{};",
                    table.table_ref.qualified(),
                    column_list,
                    rows.join(",\n"),
                    on_conflict_clause(&table)
                )
                .ok();
            }
            out.push('\n');
        }
        Ok(())
    }

    /// One PL/pgSQL block: remapped rows capture their new keys, everything
    /// referencing them resolves through the mapping table.
    fn generate_remapped(
        &self,
        out: &mut String,
        ordered: &[RecordIdentifier],
        records: &BTreeMap<RecordIdentifier, RecordData>,
        pk_map: &PkMap,
    ) -> Result<()> {
        out.push_str("DO $$\n");
        out.push_str("DECLARE\n");
        out.push_str("    v_new_pk TEXT;\n");
        out.push_str("BEGIN\n");
        writeln!(out, "    CREATE TEMP TABLE IF NOT EXISTS {} (", PK_MAP_TABLE).ok();
        out.push_str("        table_name TEXT NOT NULL,\n");
        out.push_str("        old_pk TEXT NOT NULL,\n");
        out.push_str("        new_pk TEXT NOT NULL,\n");
        out.push_str("        PRIMARY KEY (table_name, old_pk)\n");
        out.push_str("    );\n\n");

        for id in ordered {
            let record = records.get(id).ok_or_else(|| {
                DumpError::Output(format!("record {} missing from collection", id))
            })?;
            let table = self.table_of(id)?;
            if pk_map.contains_key(id) {
                self.emit_remapped_insert(out, &table, record, pk_map)?;
            } else {
                self.emit_literal_insert(out, &table, record, pk_map)?;
            }
        }

        writeln!(out, "    DROP TABLE IF EXISTS {};", PK_MAP_TABLE).ok();
        out.push_str("END $$;\n\n");
        Ok(())
    }

    /// Insert without the key column, capture the assigned key.
    fn emit_remapped_insert(
        &self,
        out: &mut String,
        table: &Table,
        record: &RecordData,
        pk_map: &PkMap,
    ) -> Result<()> {
        let pk_name = &table.primary_key[0];
        let columns: Vec<&Column> = table
            .columns
            .iter()
            .filter(|c| &c.name != pk_name)
            .collect();

        let column_list = columns
            .iter()
            .map(|c| ident::quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let values = columns
            .iter()
            .map(|c| self.render_column_value(table, record, c, pk_map))
            .collect::<Vec<_>>()
            .join(", ");

        out.push_str("    v_new_pk := NULL;\n");
        if let Some(constraint) = table.unique_constraints.first() {
            writeln!(
                out,
                "    INSERT INTO {} ({})\n    VALUES ({})\n    ON CONFLICT DO NOTHING\n    RETURNING {}::text INTO v_new_pk;",
                table.table_ref.qualified(),
                column_list,
                values,
                ident::quote(pk_name)
            )
            .ok();
            // The row already exists: read its key back instead.
            let conditions = constraint
                .columns
                .iter()
                .map(|name| {
                    let col = table.column(name);
                    let rendered = col
                        .map(|c| self.render_column_value(table, record, c, pk_map))
                        .unwrap_or_else(|| "NULL".to_string());
                    format!("{} IS NOT DISTINCT FROM {}", ident::quote(name), rendered)
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            writeln!(out, "    IF v_new_pk IS NULL THEN").ok();
            writeln!(
                out,
                "        SELECT {}::text INTO v_new_pk FROM {} WHERE {};",
                ident::quote(pk_name),
                table.table_ref.qualified(),
                conditions
            )
            .ok();
            writeln!(out, "    END IF;").ok();
        } else {
            writeln!(
                out,
                "    INSERT INTO {} ({})\n    VALUES ({})\n    RETURNING {}::text INTO v_new_pk;",
                table.table_ref.qualified(),
                column_list,
                values,
                ident::quote(pk_name)
            )
            .ok();
        }
        writeln!(
            out,
            "    INSERT INTO {} VALUES ('{}', '{}', v_new_pk);\n",
            PK_MAP_TABLE,
            escape_str(&table.table_ref.qualified()),
            escape_str(&serialize_pk(&record.identifier.pk))
        )
        .ok();
        Ok(())
    }

    /// Insert with literal keys; referencing columns still resolve through
    /// the mapping table when their target was remapped.
    fn emit_literal_insert(
        &self,
        out: &mut String,
        table: &Table,
        record: &RecordData,
        pk_map: &PkMap,
    ) -> Result<()> {
        let column_list = table
            .columns
            .iter()
            .map(|c| ident::quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let values = table
            .columns
            .iter()
            .map(|c| self.render_column_value(table, record, c, pk_map))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "    INSERT INTO {} ({})\n    VALUES ({}){};\n",
            table.table_ref.qualified(),
            column_list,
            values,
            on_conflict_clause(table)
        )
        .ok();
        Ok(())
    }

    /// Render one column of one record, substituting a mapping-table lookup
    /// for foreign keys into remapped tables.
    fn render_column_value(
        &self,
        table: &Table,
        record: &RecordData,
        column: &Column,
        pk_map: &PkMap,
    ) -> String {
        let value = record.value(&column.name).unwrap_or(&RawValue::Null);
        if value.is_null() {
            return "NULL".to_string();
        }

        if let Some(fk) = table
            .outgoing_fks
            .iter()
            .find(|fk| fk.from_columns.len() == 1 && fk.from_columns[0] == column.name)
        {
            if let Some(key) = value.as_pk_value() {
                let target = RecordIdentifier::new(fk.to_table.clone(), vec![key]);
                if let Some(entry) = pk_map.get(&target) {
                    return format!(
                        "(SELECT new_pk::{} FROM {} WHERE table_name = '{}' AND old_pk = '{}')",
                        sql_type_for_cast(&column.udt_name),
                        PK_MAP_TABLE,
                        escape_str(&entry.table_key),
                        escape_str(&entry.old_pk)
                    );
                }
            }
        }

        format_value(value, column)
    }

    fn table_of(&self, id: &RecordIdentifier) -> Result<Table> {
        self.graph
            .get(&id.table)
            .cloned()
            .ok_or_else(|| DumpError::Output(format!("table {} missing from schema graph", id.table)))
    }
}

/// Split the ordered identifiers into runs of consecutive same-table ids.
fn consecutive_table_groups(ordered: &[RecordIdentifier]) -> Vec<Vec<RecordIdentifier>> {
    let mut groups: Vec<Vec<RecordIdentifier>> = Vec::new();
    for id in ordered {
        match groups.last_mut() {
            Some(group) if group[0].table == id.table => group.push(id.clone()),
            _ => groups.push(vec![id.clone()]),
        }
    }
    groups
}

/// Conflict-skip clause keyed on the primary key, when there is one.
fn on_conflict_clause(table: &Table) -> String {
    if !table.has_pk() {
        return String::new();
    }
    let cols = table
        .primary_key
        .iter()
        .map(|c| ident::quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("\nON CONFLICT ({}) DO NOTHING", cols)
}

fn escape_str(s: &str) -> String {
    s.replace('\'', "''")
}

fn quote_str(s: &str) -> String {
    format!("'{}'", escape_str(s))
}

/// Map a low-level type name to its SQL spelling for casts.
fn sql_type_for_cast(udt_name: &str) -> String {
    match udt_name {
        "int2" => "smallint".to_string(),
        "int4" => "integer".to_string(),
        "int8" => "bigint".to_string(),
        "float4" => "real".to_string(),
        "float8" => "double precision".to_string(),
        "bool" => "boolean".to_string(),
        "varchar" => "character varying".to_string(),
        "bpchar" => "character".to_string(),
        other => other.to_string(),
    }
}

/// Element type for array literals: `_int4` becomes `integer`, unknown
/// element types keep their name.
fn array_element_type(udt_name: &str) -> String {
    sql_type_for_cast(udt_name.strip_prefix('_').unwrap_or(udt_name))
}

/// Format one value as a SQL literal, by the column's declared type.
pub fn format_value(value: &RawValue, column: &Column) -> String {
    match value {
        RawValue::Null => "NULL".to_string(),
        RawValue::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        RawValue::I16(v) => v.to_string(),
        RawValue::I32(v) => v.to_string(),
        RawValue::I64(v) => v.to_string(),
        RawValue::F32(v) => format_float(*v as f64),
        RawValue::F64(v) => format_float(*v),
        RawValue::Decimal(v) => v.to_string(),
        RawValue::Text(v) => quote_str(v),
        RawValue::Bytes(v) => format!("'\\x{}'", hex_encode(v)),
        RawValue::Uuid(v) => format!("'{}'", v),
        RawValue::Date(v) => format!("'{}'", v.format("%Y-%m-%d")),
        RawValue::Time(v) => format!("'{}'", v.format("%H:%M:%S")),
        RawValue::Timestamp(v) => format!("'{}'", v.format("%Y-%m-%dT%H:%M:%S%.f")),
        RawValue::TimestampTz(v) => format!("'{}'", v.to_rfc3339()),
        RawValue::Json(v) => format!("{}::{}", quote_str(&v.to_string()), column.udt_name),
        RawValue::Array(items) => format_array(items, &array_element_type(&column.udt_name)),
        RawValue::Other(v) => {
            if column.data_type == "USER-DEFINED" {
                format!("{}::{}", quote_str(v), ident::quote(&column.udt_name))
            } else {
                quote_str(v)
            }
        }
    }
}

/// Typed array literal. Elements format as scalars; the cast keeps empty
/// arrays and all-null arrays typed.
fn format_array(items: &[RawValue], element_type: &str) -> String {
    let rendered = items
        .iter()
        .map(format_array_element)
        .collect::<Vec<_>>()
        .join(", ");
    format!("ARRAY[{}]::{}[]", rendered, element_type)
}

fn format_array_element(value: &RawValue) -> String {
    match value {
        RawValue::Null => "NULL".to_string(),
        RawValue::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        RawValue::I16(v) => v.to_string(),
        RawValue::I32(v) => v.to_string(),
        RawValue::I64(v) => v.to_string(),
        RawValue::F32(v) => format_float(*v as f64),
        RawValue::F64(v) => format_float(*v),
        RawValue::Decimal(v) => v.to_string(),
        RawValue::Text(v) | RawValue::Other(v) => quote_str(v),
        RawValue::Uuid(v) => format!("'{}'", v),
        other => quote_str(&format!("{:?}", other)),
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "'NaN'".to_string()
    } else if v.is_infinite() {
        if v > 0.0 {
            "'Infinity'".to_string()
        } else {
            "'-Infinity'".to_string()
        }
    } else {
        v.to_string()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
