//! Catalog introspection.
//!
//! Tables are introspected lazily, one catalog pass per table, except for
//! foreign keys: incoming edges can only be discovered by scanning every
//! foreign-key constraint in the catalog, so all constraints are loaded
//! once on first use and indexed in both directions.

use std::fmt::Write as _;

use tracing::{debug, info};

use crate::error::{DumpError, Result};
use crate::schema::types::{Column, ForeignKey, SchemaGraph, Table, TableRef, UniqueConstraint};
use crate::source::PgSource;

const COLUMNS_QUERY: &str = r#"
    SELECT
        column_name,
        data_type,
        udt_name,
        ordinal_position::int4,
        CASE WHEN is_nullable = 'YES' THEN true ELSE false END,
        column_default,
        COALESCE(
            (SELECT a.attidentity IN ('a', 'd') FROM pg_catalog.pg_class c
             JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = columns.table_schema
               AND c.relname = columns.table_name
               AND a.attname = columns.column_name),
            false
        ) AS is_identity
    FROM information_schema.columns
    WHERE table_schema = $1 AND table_name = $2
    ORDER BY ordinal_position
"#;

const PRIMARY_KEY_QUERY: &str = r#"
    SELECT a.attname
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype = 'p'
      AND a.attnum = ANY(c.conkey)
    ORDER BY array_position(c.conkey, a.attnum)
"#;

const UNIQUE_CONSTRAINTS_QUERY: &str = r#"
    SELECT
        c.conname,
        array_agg(a.attname ORDER BY array_position(c.conkey, a.attnum)) AS columns
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(c.conkey)
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype = 'u'
    GROUP BY c.conname
    ORDER BY c.conname
"#;

// One pass over every FK constraint outside the system schemas. The
// unnest-with-ordinality join keeps composite column lists aligned.
const FOREIGN_KEYS_QUERY: &str = r#"
    SELECT
        c.conname,
        n.nspname AS from_schema,
        t.relname AS from_table,
        array_agg(a.attname ORDER BY k.ord) AS from_columns,
        rn.nspname AS to_schema,
        rt.relname AS to_table,
        array_agg(ra.attname ORDER BY k.ord) AS to_columns,
        CASE c.confdeltype
            WHEN 'a' THEN 'NO ACTION'
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
            ELSE 'NO ACTION'
        END AS on_delete
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
    JOIN pg_catalog.pg_namespace rn ON rn.oid = rt.relnamespace
    CROSS JOIN LATERAL unnest(c.conkey, c.confkey) WITH ORDINALITY AS k(attnum, fattnum, ord)
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
    JOIN pg_catalog.pg_attribute ra ON ra.attrelid = rt.oid AND ra.attnum = k.fattnum
    WHERE c.contype = 'f'
      AND n.nspname NOT IN ('pg_catalog', 'information_schema')
    GROUP BY c.oid, c.conname, n.nspname, t.relname, rn.nspname, rt.relname, c.confdeltype
    ORDER BY n.nspname, t.relname, c.conname
"#;

const LIST_TABLES_QUERY: &str = r#"
    SELECT table_schema, table_name
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
      AND table_schema = $1
    ORDER BY table_name
"#;

/// Lazily populated catalog image.
pub struct SchemaIntrospector {
    graph: SchemaGraph,
    fks_loaded: bool,
}

impl SchemaIntrospector {
    pub fn new() -> Self {
        Self {
            graph: SchemaGraph::new(),
            fks_loaded: false,
        }
    }

    /// Resume from a cached graph; the foreign-key pass is trusted to have
    /// run when the graph was built.
    pub fn from_cache(graph: SchemaGraph) -> Self {
        let fks_loaded = !graph.is_empty();
        Self { graph, fks_loaded }
    }

    /// The current graph, for serializing into the cache.
    pub fn graph(&self) -> &SchemaGraph {
        &self.graph
    }

    /// Fully populated metadata for one table, introspecting on first
    /// access. Returns a clone; tables are immutable once introspected.
    pub async fn get_table(&mut self, source: &PgSource, table_ref: &TableRef) -> Result<Table> {
        if let Some(table) = self.graph.get(table_ref) {
            return Ok(table.clone());
        }

        self.ensure_foreign_keys(source).await?;

        let table = self.introspect_table(source, table_ref).await?;
        self.graph.insert(table.clone());
        Ok(table)
    }

    async fn ensure_foreign_keys(&mut self, source: &PgSource) -> Result<()> {
        if self.fks_loaded {
            return Ok(());
        }

        let rows = source
            .query_params(FOREIGN_KEYS_QUERY, &[])
            .await
            .map_err(|e| DumpError::Introspection(format!("loading foreign keys: {}", e)))?;

        let mut fks = Vec::with_capacity(rows.len());
        for row in rows {
            fks.push(ForeignKey {
                name: row.get(0),
                from_table: TableRef::new(row.get::<_, String>(1), row.get::<_, String>(2)),
                from_columns: row.get(3),
                to_table: TableRef::new(row.get::<_, String>(4), row.get::<_, String>(5)),
                to_columns: row.get(6),
                on_delete: row.get(7),
            });
        }

        info!("Loaded {} foreign key constraints", fks.len());
        self.graph.set_foreign_keys(fks);
        self.fks_loaded = true;
        Ok(())
    }

    async fn introspect_table(&self, source: &PgSource, table_ref: &TableRef) -> Result<Table> {
        let rows = source
            .query_params(COLUMNS_QUERY, &[&table_ref.schema, &table_ref.name])
            .await
            .map_err(|e| {
                DumpError::Introspection(format!("loading columns for {}: {}", table_ref, e))
            })?;

        if rows.is_empty() {
            return Err(DumpError::SchemaNotFound(table_ref.to_string()));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let default_expr: Option<String> = row.get(5);
            // Declared identity, or a serial column backed by a sequence.
            let is_identity = row.get::<_, bool>(6)
                || default_expr
                    .as_deref()
                    .map(|d| d.starts_with("nextval("))
                    .unwrap_or(false);
            columns.push(Column {
                name: row.get(0),
                data_type: row.get(1),
                udt_name: row.get(2),
                ordinal: row.get(3),
                nullable: row.get(4),
                default_expr,
                is_identity,
            });
        }

        let pk_rows = source
            .query_params(PRIMARY_KEY_QUERY, &[&table_ref.schema, &table_ref.name])
            .await
            .map_err(|e| {
                DumpError::Introspection(format!("loading primary key for {}: {}", table_ref, e))
            })?;
        let primary_key: Vec<String> = pk_rows.iter().map(|r| r.get(0)).collect();

        let uc_rows = source
            .query_params(
                UNIQUE_CONSTRAINTS_QUERY,
                &[&table_ref.schema, &table_ref.name],
            )
            .await
            .map_err(|e| {
                DumpError::Introspection(format!(
                    "loading unique constraints for {}: {}",
                    table_ref, e
                ))
            })?;
        let unique_constraints = uc_rows
            .iter()
            .map(|r| UniqueConstraint {
                name: r.get(0),
                columns: r.get(1),
            })
            .collect();

        let outgoing_fks: Vec<ForeignKey> = self
            .graph
            .foreign_keys()
            .iter()
            .filter(|fk| &fk.from_table == table_ref)
            .cloned()
            .collect();
        let incoming_fks: Vec<ForeignKey> = self
            .graph
            .foreign_keys()
            .iter()
            .filter(|fk| &fk.to_table == table_ref)
            .cloned()
            .collect();

        debug!(
            "Introspected {}: {} columns, pk {:?}, {} outgoing / {} incoming FKs",
            table_ref,
            columns.len(),
            primary_key,
            outgoing_fks.len(),
            incoming_fks.len()
        );

        Ok(Table {
            table_ref: table_ref.clone(),
            columns,
            primary_key,
            unique_constraints,
            outgoing_fks,
            incoming_fks,
        })
    }

    /// List base tables in a schema.
    pub async fn list_tables(&self, source: &PgSource, schema: &str) -> Result<Vec<TableRef>> {
        let rows = source
            .query_params(LIST_TABLES_QUERY, &[&schema])
            .await
            .map_err(|e| DumpError::Introspection(format!("listing tables: {}", e)))?;
        Ok(rows
            .iter()
            .map(|r| TableRef::new(r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }

    /// Human-readable description of one table, for `--describe`.
    pub async fn describe(&mut self, source: &PgSource, table_ref: &TableRef) -> Result<String> {
        let table = self.get_table(source, table_ref).await?;
        let mut out = String::new();
        writeln!(out, "Table {}", table.full_name()).ok();
        writeln!(out, "  Columns:").ok();
        for col in &table.columns {
            let mut attrs = Vec::new();
            if !col.nullable {
                attrs.push("NOT NULL".to_string());
            }
            if col.is_identity {
                attrs.push("identity".to_string());
            }
            if table.primary_key.contains(&col.name) {
                attrs.push("PK".to_string());
            }
            let suffix = if attrs.is_empty() {
                String::new()
            } else {
                format!(" [{}]", attrs.join(", "))
            };
            writeln!(out, "    {} {}{}", col.name, col.data_type, suffix).ok();
        }
        if !table.outgoing_fks.is_empty() {
            writeln!(out, "  References:").ok();
            for fk in &table.outgoing_fks {
                writeln!(
                    out,
                    "    {} ({}) -> {} ({})",
                    fk.name,
                    fk.from_columns.join(", "),
                    fk.to_table,
                    fk.to_columns.join(", ")
                )
                .ok();
            }
        }
        if !table.incoming_fks.is_empty() {
            writeln!(out, "  Referenced by:").ok();
            for fk in &table.incoming_fks {
                writeln!(
                    out,
                    "    {} ({}) via {}",
                    fk.from_table,
                    fk.from_columns.join(", "),
                    fk.name
                )
                .ok();
            }
        }
        Ok(out)
    }

    /// Render the foreign-key graph of a schema, for `--graph`.
    pub async fn fk_graph(&mut self, source: &PgSource, schema: &str) -> Result<String> {
        self.ensure_foreign_keys(source).await?;
        let mut out = String::new();
        for fk in self.graph.foreign_keys() {
            if fk.from_table.schema != schema && fk.to_table.schema != schema {
                continue;
            }
            writeln!(
                out,
                "{} ({}) -> {} ({})",
                fk.from_table,
                fk.from_columns.join(", "),
                fk.to_table,
                fk.to_columns.join(", ")
            )
            .ok();
        }
        if out.is_empty() {
            out.push_str("(no foreign keys)\n");
        }
        Ok(out)
    }
}

impl Default for SchemaIntrospector {
    fn default() -> Self {
        Self::new()
    }
}
