//! Idempotent schema-creation prelude.
//!
//! Emits, in order: `CREATE DATABASE` (unconditionally; the engine has no
//! `IF NOT EXISTS` form for it and a failure is acceptable to the replay
//! author), `CREATE SCHEMA IF NOT EXISTS` per referenced schema, and
//! `CREATE TABLE IF NOT EXISTS` per table in topological order of
//! outgoing-FK dependency. Constraints that cannot be ordered (cycles and
//! self-references) are added afterwards as guarded `ALTER TABLE`
//! statements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::ident;
use crate::schema::{Column, ForeignKey, SchemaGraph, Table, TableRef};

/// DDL prelude generator. Shares the schema graph read-only.
pub struct DdlGenerator<'a> {
    graph: &'a SchemaGraph,
}

impl<'a> DdlGenerator<'a> {
    pub fn new(graph: &'a SchemaGraph) -> Self {
        Self { graph }
    }

    /// Generate the full prelude for the given tables.
    pub fn generate(&self, database: &str, tables: &BTreeSet<TableRef>) -> String {
        if tables.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        writeln!(out, "CREATE DATABASE {};", ident::quote(database)).ok();

        let schemas: BTreeSet<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
        for schema in schemas {
            writeln!(out, "CREATE SCHEMA IF NOT EXISTS {};", ident::quote(schema)).ok();
        }
        out.push('\n');

        let (ordered, deferred) = order_tables(self.graph, tables);

        for tref in &ordered {
            if let Some(table) = self.graph.get(tref) {
                out.push_str(&create_table_sql(table, &ordered, &deferred));
                out.push('\n');
            }
        }

        for fk in &deferred {
            out.push_str(&add_constraint_sql(fk));
        }

        out
    }
}

/// Topologically order the tables by outgoing-FK dependency. Returns the
/// order plus the constraints that must be added after creation: edges that
/// participate in cycles, self-references, and edges to tables outside the
/// set.
fn order_tables(
    graph: &SchemaGraph,
    tables: &BTreeSet<TableRef>,
) -> (Vec<TableRef>, Vec<ForeignKey>) {
    let mut in_degree: BTreeMap<&TableRef, usize> = tables.iter().map(|t| (t, 0)).collect();
    let mut dependents: BTreeMap<&TableRef, Vec<&TableRef>> = BTreeMap::new();

    for tref in tables {
        let Some(table) = graph.get(tref) else { continue };
        for fk in &table.outgoing_fks {
            if fk.is_self_referencing() || !tables.contains(&fk.to_table) {
                continue;
            }
            *in_degree.entry(tref).or_insert(0) += 1;
            dependents
                .entry(tables.get(&fk.to_table).expect("checked contains"))
                .or_default()
                .push(tref);
        }
    }

    let mut ready: BTreeSet<&TableRef> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(t, _)| *t)
        .collect();
    let mut remaining: BTreeSet<&TableRef> = tables.iter().collect();
    let mut ordered = Vec::with_capacity(tables.len());
    let mut cyclic: BTreeSet<TableRef> = BTreeSet::new();

    while !remaining.is_empty() {
        let (next, forced) = match ready.pop_first() {
            Some(next) if remaining.contains(next) => (next, false),
            Some(_) => continue,
            None => {
                let next = *remaining.iter().next().expect("remaining is non-empty");
                (next, true)
            }
        };
        remaining.remove(next);
        if forced {
            cyclic.insert(next.clone());
        }
        ordered.push(next.clone());
        if let Some(deps) = dependents.get(next) {
            for &dependent in deps {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 && remaining.contains(dependent) {
                        ready.insert(dependent);
                    }
                }
            }
        }
    }

    // Collect the deferred constraints: self-references always, plus every
    // outgoing edge of a cycle-broken table.
    let mut deferred = Vec::new();
    for tref in &ordered {
        let Some(table) = graph.get(tref) else { continue };
        for fk in &table.outgoing_fks {
            if !tables.contains(&fk.to_table) {
                continue;
            }
            if fk.is_self_referencing() || cyclic.contains(tref) || cyclic.contains(&fk.to_table) {
                deferred.push(fk.clone());
            }
        }
    }

    (ordered, deferred)
}

/// Render one `CREATE TABLE IF NOT EXISTS` statement with inline primary
/// key, unique constraints, and the foreign keys that are safe to inline.
fn create_table_sql(table: &Table, ordered: &[TableRef], deferred: &[ForeignKey]) -> String {
    let mut lines: Vec<String> = table.columns.iter().map(column_def).collect();

    if table.has_pk() {
        let cols = table
            .primary_key
            .iter()
            .map(|c| ident::quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("PRIMARY KEY ({})", cols));
    }

    for constraint in &table.unique_constraints {
        let cols = constraint
            .columns
            .iter()
            .map(|c| ident::quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!(
            "CONSTRAINT {} UNIQUE ({})",
            ident::quote(&constraint.name),
            cols
        ));
    }

    let own_position = ordered.iter().position(|t| t == &table.table_ref);
    for fk in &table.outgoing_fks {
        if deferred.contains(fk) {
            continue;
        }
        // Inline only when the referenced table is created earlier.
        let target_position = ordered.iter().position(|t| t == &fk.to_table);
        match (own_position, target_position) {
            (Some(own), Some(target)) if target < own => {
                lines.push(foreign_key_clause(fk));
            }
            _ => {}
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
        table.table_ref.qualified(),
        lines.join(",\n    ")
    )
}

/// Render one column definition.
fn column_def(column: &Column) -> String {
    let mut def = format!("{} {}", ident::quote(&column.name), column_type(column));
    if column.is_identity {
        def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    } else if let Some(default) = &column.default_expr {
        def.push_str(&format!(" DEFAULT {}", default));
    }
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

/// The SQL type spelling of a column.
fn column_type(column: &Column) -> String {
    match column.data_type.as_str() {
        "ARRAY" => {
            let elem = column.udt_name.strip_prefix('_').unwrap_or(&column.udt_name);
            format!("{}[]", spell_type(elem))
        }
        "USER-DEFINED" => ident::quote(&column.udt_name),
        other => other.to_string(),
    }
}

fn spell_type(udt_name: &str) -> String {
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

fn foreign_key_clause(fk: &ForeignKey) -> String {
    let from_cols = fk
        .from_columns
        .iter()
        .map(|c| ident::quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    let to_cols = fk
        .to_columns
        .iter()
        .map(|c| ident::quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
        ident::quote(&fk.name),
        from_cols,
        fk.to_table.qualified(),
        to_cols,
        fk.on_delete
    )
}

/// Deferred constraint addition, guarded so a re-run is a no-op.
fn add_constraint_sql(fk: &ForeignKey) -> String {
    format!(
        "DO $$ BEGIN\n    ALTER TABLE {} ADD {};\nEXCEPTION WHEN duplicate_object THEN NULL;\nEND $$;\n",
        fk.from_table.qualified(),
        foreign_key_clause(fk)
    )
}
