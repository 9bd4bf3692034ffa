//! Bidirectional breadth-first traversal over foreign-key edges.
//!
//! Starting from the seed identifiers, the traverser walks outgoing
//! (forward) and incoming (reverse) foreign keys until the collected set is
//! referentially closed. Fetches are batched per (table, key column list):
//! dequeued identifiers of the same table collapse into one `IN (...)`
//! select, and reverse discovery runs one query per (referencing table,
//! FK column list) across the whole fetched batch. Deduplication is purely
//! by record identifier.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{TimeframeFilter, TraversalMode};
use crate::error::{DumpError, Result};
use crate::graph::records::{PkValue, RawValue, RecordData, RecordIdentifier};
use crate::ident;
use crate::schema::{ForeignKey, SchemaIntrospector, Table, TableRef};
use crate::source::{convert_row_value, PgSource};

/// Upper bound on identifiers per batched select.
const FETCH_BATCH_SIZE: usize = 500;

/// Knobs for one traversal run.
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub mode: TraversalMode,
    pub max_depth: Option<u32>,
    pub filters: Vec<TimeframeFilter>,
    /// Promote dangling references from warnings to fatal errors.
    pub strict_references: bool,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            mode: TraversalMode::Strict,
            max_depth: None,
            filters: Vec::new(),
            strict_references: false,
        }
    }
}

/// The traversal engine. Owns nothing: borrows the connection and the
/// introspector for the duration of one run.
pub struct Traverser<'a> {
    source: &'a PgSource,
    introspector: &'a mut SchemaIntrospector,
    options: TraversalOptions,
    cancel: watch::Receiver<bool>,
    /// FKs already reported as unfollowable (referencing non-PK columns).
    warned_fks: HashSet<String>,
}

impl<'a> Traverser<'a> {
    pub fn new(
        source: &'a PgSource,
        introspector: &'a mut SchemaIntrospector,
        options: TraversalOptions,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            introspector,
            options,
            cancel,
            warned_fks: HashSet::new(),
        }
    }

    /// Validate every timeframe filter against the catalog before any data
    /// fetch: the column must exist and be of a date/time type.
    pub async fn validate_filters(&mut self) -> Result<()> {
        let filters = self.options.filters.clone();
        for filter in &filters {
            let table = self
                .introspector
                .get_table(self.source, &filter.table)
                .await
                .map_err(|e| match e {
                    DumpError::SchemaNotFound(t) => {
                        DumpError::InvalidFilter(format!("table {} does not exist", t))
                    }
                    other => other,
                })?;
            let column = table.column(&filter.column).ok_or_else(|| {
                DumpError::InvalidFilter(format!(
                    "column {}.{} does not exist",
                    filter.table, filter.column
                ))
            })?;
            if !is_temporal_type(&column.udt_name) {
                return Err(DumpError::InvalidFilter(format!(
                    "column {}.{} has type {}, expected a date/time type",
                    filter.table, filter.column, column.data_type
                )));
            }
        }
        Ok(())
    }

    /// Build seed identifiers from user-supplied primary key values, parsed
    /// against the seed table's key column type.
    pub async fn seeds_from_pks(
        &mut self,
        table_ref: &TableRef,
        pks: &[String],
    ) -> Result<Vec<RecordIdentifier>> {
        let table = self.introspector.get_table(self.source, table_ref).await?;
        if !table.has_pk() {
            return Err(DumpError::Usage(format!(
                "table {} has no primary key and cannot be used as a seed",
                table_ref
            )));
        }
        if !table.has_single_pk() {
            return Err(DumpError::Usage(format!(
                "table {} has a composite primary key; seed by timeframe instead",
                table_ref
            )));
        }
        let pk_col = table.column(&table.primary_key[0]).ok_or_else(|| {
            DumpError::Introspection(format!("primary key column missing on {}", table_ref))
        })?;
        Ok(pks
            .iter()
            .map(|raw| {
                RecordIdentifier::new(
                    table_ref.clone(),
                    vec![PkValue::parse(raw, &pk_col.udt_name)],
                )
            })
            .collect())
    }

    /// Build seed identifiers from every row of the table inside the given
    /// time window.
    pub async fn seeds_from_timeframe(
        &mut self,
        table_ref: &TableRef,
        filter: &TimeframeFilter,
    ) -> Result<Vec<RecordIdentifier>> {
        let table = self.introspector.get_table(self.source, table_ref).await?;
        if !table.has_pk() {
            return Err(DumpError::Usage(format!(
                "table {} has no primary key and cannot be used as a seed",
                table_ref
            )));
        }
        let sql = timeframe_seed_sql(&table, filter);
        let rows = self
            .source
            .query(&sql)
            .await
            .map_err(|e| DumpError::fetch(table.full_name(), e.to_string()))?;

        let mut seeds = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(id) = identifier_from_key_row(&table, &row) {
                seeds.push(id);
            }
        }
        info!("Selected {} seed rows from {}", seeds.len(), table_ref);
        Ok(seeds)
    }

    /// Run the traversal to closure and return the collected records.
    pub async fn traverse(
        &mut self,
        seeds: Vec<RecordIdentifier>,
    ) -> Result<BTreeMap<RecordIdentifier, RecordData>> {
        let seed_set: HashSet<RecordIdentifier> = seeds.iter().cloned().collect();
        let mut visited: HashSet<RecordIdentifier> = HashSet::new();
        let mut records: BTreeMap<RecordIdentifier, RecordData> = BTreeMap::new();
        let mut referrers: HashMap<RecordIdentifier, RecordIdentifier> = HashMap::new();
        let mut queue: VecDeque<(RecordIdentifier, u32)> =
            seeds.into_iter().map(|s| (s, 0)).collect();

        while let Some((first_id, depth)) = queue.pop_front() {
            if visited.contains(&first_id) {
                continue;
            }
            self.check_cancel()?;

            let table = self
                .introspector
                .get_table(self.source, &first_id.table)
                .await?;

            // Collapse same-table, same-depth identifiers into one fetch.
            let mut batch = vec![first_id];
            if table.has_single_pk() {
                let tref = batch[0].table.clone();
                let mut kept = VecDeque::with_capacity(queue.len());
                while let Some((id, d)) = queue.pop_front() {
                    if d == depth
                        && id.table == tref
                        && !visited.contains(&id)
                        && !batch.contains(&id)
                        && batch.len() < FETCH_BATCH_SIZE
                    {
                        batch.push(id);
                    } else {
                        kept.push_back((id, d));
                    }
                }
                queue = kept;
            }
            for id in &batch {
                visited.insert(id.clone());
            }
            batch.sort();

            let fetched = self.fetch_batch(&table, &batch).await?;
            self.report_missing(&batch, &fetched, &seed_set, &referrers)?;

            let expand = self.options.max_depth.map(|m| depth < m).unwrap_or(true);

            for mut record in fetched {
                let is_seed = seed_set.contains(&record.identifier);
                self.resolve_outgoing(
                    &table,
                    &mut record,
                    is_seed,
                    expand,
                    depth,
                    &mut visited,
                    &mut referrers,
                    &mut queue,
                )
                .await?;
                records.insert(record.identifier.clone(), record);
            }

            if expand {
                self.expand_incoming(&table, &records, &batch, depth, &visited, &mut queue)
                    .await?;
            }
        }

        strip_external_dependencies(&mut records);
        info!("Collected {} records", records.len());
        Ok(records)
    }

    fn check_cancel(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(DumpError::Cancelled);
        }
        Ok(())
    }

    /// Fetch the rows for a batch of identifiers of one table.
    async fn fetch_batch(
        &mut self,
        table: &Table,
        batch: &[RecordIdentifier],
    ) -> Result<Vec<RecordData>> {
        self.check_cancel()?;
        let mut out = Vec::with_capacity(batch.len());

        if table.has_single_pk() {
            let sql = batch_fetch_sql(table, batch);
            let rows = self
                .source
                .query(&sql)
                .await
                .map_err(|e| DumpError::fetch(table.full_name(), e.to_string()))?;
            for row in rows {
                if let Some(record) = record_from_row(table, &row) {
                    out.push(record);
                }
            }
        } else {
            // Composite keys fetch row by row.
            for id in batch {
                let sql = row_fetch_sql(table, id);
                let rows = self
                    .source
                    .query(&sql)
                    .await
                    .map_err(|e| DumpError::fetch(table.full_name(), e.to_string()))?;
                for row in rows {
                    if let Some(record) = record_from_row(table, &row) {
                        out.push(record);
                    }
                }
            }
        }

        debug!(
            "Fetched {}/{} rows from {}",
            out.len(),
            batch.len(),
            table.full_name()
        );
        Ok(out)
    }

    /// Warn (or fail, under strict references) about requested rows the
    /// source did not return.
    fn report_missing(
        &self,
        batch: &[RecordIdentifier],
        fetched: &[RecordData],
        seed_set: &HashSet<RecordIdentifier>,
        referrers: &HashMap<RecordIdentifier, RecordIdentifier>,
    ) -> Result<()> {
        let fetched_ids: HashSet<&RecordIdentifier> =
            fetched.iter().map(|r| &r.identifier).collect();
        for id in batch {
            if fetched_ids.contains(id) {
                continue;
            }
            if seed_set.contains(id) {
                warn!("seed row {} not found in source", id);
                continue;
            }
            let source = referrers
                .get(id)
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            if self.options.strict_references {
                return Err(DumpError::DanglingReference {
                    referenced_by: source,
                    target: id.to_string(),
                });
            }
            warn!("dangling reference: {} (referenced by {})", id, source);
        }
        Ok(())
    }

    /// Resolve the outgoing foreign keys of one fetched record: register
    /// dependency edges and enqueue unvisited targets.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_outgoing(
        &mut self,
        table: &Table,
        record: &mut RecordData,
        is_seed: bool,
        expand: bool,
        depth: u32,
        visited: &mut HashSet<RecordIdentifier>,
        referrers: &mut HashMap<RecordIdentifier, RecordIdentifier>,
        queue: &mut VecDeque<(RecordIdentifier, u32)>,
    ) -> Result<()> {
        for fk in &table.outgoing_fks {
            if fk.is_self_referencing()
                && self.options.mode == TraversalMode::Strict
                && !is_seed
            {
                continue;
            }

            // Null in any key column means no reference.
            let key: Option<Vec<PkValue>> = fk
                .from_columns
                .iter()
                .map(|c| record.value(c).and_then(RawValue::as_pk_value))
                .collect();
            let Some(key) = key else { continue };

            let target_table = self.introspector.get_table(self.source, &fk.to_table).await?;
            if target_table.primary_key != fk.to_columns {
                if self.warned_fks.insert(fk.name.clone()) {
                    warn!(
                        "foreign key {} references non-primary-key columns of {}; edge not followed",
                        fk.name, fk.to_table
                    );
                }
                continue;
            }

            let target = RecordIdentifier::new(fk.to_table.clone(), key);
            record.dependencies.insert(target.clone());
            if expand && !visited.contains(&target) {
                referrers
                    .entry(target.clone())
                    .or_insert_with(|| record.identifier.clone());
                queue.push_back((target, depth + 1));
            }
        }
        Ok(())
    }

    /// Discover rows referencing the fetched batch through incoming foreign
    /// keys, one query per (referencing table, key column list).
    async fn expand_incoming(
        &mut self,
        table: &Table,
        records: &BTreeMap<RecordIdentifier, RecordData>,
        batch: &[RecordIdentifier],
        depth: u32,
        visited: &HashSet<RecordIdentifier>,
        queue: &mut VecDeque<(RecordIdentifier, u32)>,
    ) -> Result<()> {
        let incoming = table.incoming_fks.clone();
        for fk in &incoming {
            if fk.is_self_referencing() && self.options.mode == TraversalMode::Strict {
                continue;
            }
            if fk.to_columns != table.primary_key {
                if self.warned_fks.insert(fk.name.clone()) {
                    warn!(
                        "foreign key {} references non-primary-key columns of {}; edge not followed",
                        fk.name, fk.to_table
                    );
                }
                continue;
            }

            // The referenced key values are exactly the batch identifiers.
            let keys: Vec<&[PkValue]> = batch
                .iter()
                .filter(|id| records.contains_key(*id))
                .map(|id| id.pk.as_slice())
                .collect();
            if keys.is_empty() {
                continue;
            }

            let ref_table = self
                .introspector
                .get_table(self.source, &fk.from_table)
                .await?;
            if !ref_table.has_pk() {
                if self.warned_fks.insert(fk.name.clone()) {
                    warn!(
                        "table {} has no primary key; rows referencing via {} are not collected",
                        fk.from_table, fk.name
                    );
                }
                continue;
            }

            let filter = self.filter_for(&fk.from_table);
            let sql = incoming_fetch_sql(&ref_table, fk, &keys, filter);
            self.check_cancel()?;
            let rows = self
                .source
                .query(&sql)
                .await
                .map_err(|e| DumpError::fetch(ref_table.full_name(), e.to_string()))?;

            let mut enqueued = 0usize;
            for row in rows {
                if let Some(id) = identifier_from_key_row(&ref_table, &row) {
                    if !visited.contains(&id) {
                        queue.push_back((id, depth + 1));
                        enqueued += 1;
                    }
                }
            }
            debug!(
                "Incoming {}: enqueued {} rows of {}",
                fk.name, enqueued, fk.from_table
            );
        }
        Ok(())
    }

    fn filter_for(&self, table_ref: &TableRef) -> Option<&TimeframeFilter> {
        self.options.filters.iter().find(|f| &f.table == table_ref)
    }
}

/// True for the catalog types a timeframe filter may scope on.
fn is_temporal_type(udt_name: &str) -> bool {
    matches!(udt_name, "date" | "time" | "timetz" | "timestamp" | "timestamptz")
}

fn quoted_column_list(table: &Table) -> String {
    table
        .columns
        .iter()
        .map(|c| ident::quote(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quoted_pk_list(table: &Table) -> String {
    table
        .primary_key
        .iter()
        .map(|c| ident::quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn timestamp_literal(value: &chrono::NaiveDateTime) -> String {
    format!("'{}'", value.format("%Y-%m-%d %H:%M:%S"))
}

fn between_clause(filter: &TimeframeFilter) -> String {
    format!(
        "{} BETWEEN {} AND {}",
        ident::quote(&filter.column),
        timestamp_literal(&filter.start),
        timestamp_literal(&filter.end)
    )
}

/// `SELECT <cols> FROM t WHERE pk IN (...)` for a scalar-key batch.
fn batch_fetch_sql(table: &Table, batch: &[RecordIdentifier]) -> String {
    let pk = ident::quote(&table.primary_key[0]);
    let values = batch
        .iter()
        .map(|id| id.pk[0].to_sql_literal())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {} WHERE {} IN ({}) ORDER BY {}",
        quoted_column_list(table),
        table.table_ref.qualified(),
        pk,
        values,
        pk
    )
}

/// Single-row select for a composite-key identifier.
fn row_fetch_sql(table: &Table, id: &RecordIdentifier) -> String {
    let conditions = table
        .primary_key
        .iter()
        .zip(&id.pk)
        .map(|(col, val)| format!("{} = {}", ident::quote(col), val.to_sql_literal()))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT {} FROM {} WHERE {}",
        quoted_column_list(table),
        table.table_ref.qualified(),
        conditions
    )
}

/// Key-only select of every row in the seed table inside the window.
fn timeframe_seed_sql(table: &Table, filter: &TimeframeFilter) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {}",
        quoted_pk_list(table),
        table.table_ref.qualified(),
        between_clause(filter),
        quoted_pk_list(table)
    )
}

/// Key-only select of rows in `ref_table` whose FK columns match any of the
/// referenced key tuples, with an optional timeframe restriction.
fn incoming_fetch_sql(
    ref_table: &Table,
    fk: &ForeignKey,
    keys: &[&[PkValue]],
    filter: Option<&TimeframeFilter>,
) -> String {
    let condition = if fk.from_columns.len() == 1 {
        let values = keys
            .iter()
            .map(|k| k[0].to_sql_literal())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({})", ident::quote(&fk.from_columns[0]), values)
    } else {
        let cols = fk
            .from_columns
            .iter()
            .map(|c| ident::quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        let tuples = keys
            .iter()
            .map(|k| {
                let vals = k
                    .iter()
                    .map(|v| v.to_sql_literal())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({})", vals)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("({}) IN ({})", cols, tuples)
    };

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}",
        quoted_pk_list(ref_table),
        ref_table.table_ref.qualified(),
        condition
    );
    if let Some(filter) = filter {
        sql.push_str(&format!(" AND {}", between_clause(filter)));
    }
    sql.push_str(&format!(" ORDER BY {}", quoted_pk_list(ref_table)));
    sql
}

/// Build a full record from a row fetched with [`quoted_column_list`].
fn record_from_row(table: &Table, row: &tokio_postgres::Row) -> Option<RecordData> {
    let mut values = BTreeMap::new();
    for (idx, col) in table.columns.iter().enumerate() {
        values.insert(col.name.clone(), convert_row_value(row, idx, &col.udt_name));
    }
    let pk: Option<Vec<PkValue>> = table
        .primary_key
        .iter()
        .map(|c| values.get(c).and_then(RawValue::as_pk_value))
        .collect();
    let pk = pk?;
    Some(RecordData::new(
        RecordIdentifier::new(table.table_ref.clone(), pk),
        values,
    ))
}

/// Build an identifier from a key-only row fetched with [`quoted_pk_list`].
fn identifier_from_key_row(table: &Table, row: &tokio_postgres::Row) -> Option<RecordIdentifier> {
    let pk: Option<Vec<PkValue>> = table
        .primary_key
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let col = table.column(name)?;
            convert_row_value(row, idx, &col.udt_name).as_pk_value()
        })
        .collect();
    Some(RecordIdentifier::new(table.table_ref.clone(), pk?))
}

/// Drop dependency edges whose target was not collected (dangling rows and
/// edges across scoping boundaries); the sorter and writer only see edges
/// inside the closed set.
fn strip_external_dependencies(records: &mut BTreeMap<RecordIdentifier, RecordData>) {
    let collected: HashSet<RecordIdentifier> = records.keys().cloned().collect();
    for record in records.values_mut() {
        let before = record.dependencies.len();
        record.dependencies.retain(|d| collected.contains(d));
        let dropped = before - record.dependencies.len();
        if dropped > 0 {
            debug!("{}: dropped {} external dependencies", record.identifier, dropped);
        }
    }
}
