//! Run orchestration.
//!
//! Wires the pipeline together: connect, resolve the schema graph (cache or
//! catalog), traverse from the seeds, order, plan the key remap, generate
//! DDL and the replay stream, and hand the result to the output sink.
//! Cancellation is observed at every stage boundary; the sink is not
//! touched until the stream is complete.

use std::collections::BTreeSet;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::SchemaCache;
use crate::config::{CacheConfig, OutputTarget, RunConfig, SeedSpec};
use crate::dump::{
    build_pk_map, dump_filename, topo_sort, write_output, DdlGenerator, GenerateOptions, PkMap,
    SqlGenerator,
};
use crate::error::{DumpError, Result};
use crate::graph::{TraversalOptions, Traverser};
use crate::schema::{SchemaIntrospector, TableRef};
use crate::source::PgSource;

/// Summary of one completed dump.
#[derive(Debug, Clone)]
pub struct DumpResult {
    pub record_count: usize,
    pub table_count: usize,
    pub remapped_count: usize,
    pub cycle_count: usize,
    pub bytes_written: usize,
    pub duration_seconds: f64,
    pub output: OutputTarget,
}

/// The assembled pipeline for one run.
pub struct DumpService {
    config: RunConfig,
    source: PgSource,
    introspector: SchemaIntrospector,
}

impl DumpService {
    /// Connect to the source and seed the introspector from the schema
    /// cache when one is available.
    pub async fn connect(config: RunConfig) -> Result<Self> {
        let source = PgSource::connect(&config.connection, config.read_only).await?;

        let introspector = match load_cached_graph(&config) {
            Some(graph) => SchemaIntrospector::from_cache(graph),
            None => SchemaIntrospector::new(),
        };

        Ok(Self {
            config,
            source,
            introspector,
        })
    }

    /// Execute the dump and write the replay stream.
    pub async fn run(&mut self, cancel: watch::Receiver<bool>) -> Result<DumpResult> {
        let started = Instant::now();
        let schema = self.config.connection.schema.clone();
        let seed_table = TableRef::parse(self.config.seed.table(), &schema)?;

        // The seed timeframe also scopes later rediscovery of seed-table
        // rows, so it joins the filter list.
        let mut filters = self.config.filters.clone();
        if let SeedSpec::Timeframe { filter, .. } = &self.config.seed {
            let mut filter = filter.clone();
            filter.table = seed_table.clone();
            filters.push(filter);
        }

        let options = TraversalOptions {
            mode: self.config.mode,
            max_depth: self.config.max_depth,
            filters,
            strict_references: self.config.strict_references,
        };

        let seed_spec = self.config.seed.clone();
        let mut traverser = Traverser::new(
            &self.source,
            &mut self.introspector,
            options,
            cancel.clone(),
        );

        traverser.validate_filters().await?;

        let seeds = match &seed_spec {
            SeedSpec::Pks { pks, .. } => traverser.seeds_from_pks(&seed_table, pks).await?,
            SeedSpec::Timeframe { filter, .. } => {
                let mut filter = filter.clone();
                filter.table = seed_table.clone();
                traverser.seeds_from_timeframe(&seed_table, &filter).await?
            }
        };
        if seeds.is_empty() {
            warn!("no seed rows selected; the replay stream will be empty");
        }
        let first_seed_pk = seeds
            .first()
            .map(|id| id.pk[0].to_string())
            .unwrap_or_else(|| "empty".to_string());

        let records = traverser.traverse(seeds).await?;

        store_cached_graph(&self.config, self.introspector.graph());

        check_cancel(&cancel)?;
        let outcome = topo_sort(&records);
        if outcome.has_cycles() {
            info!(
                "{} records participate in dependency cycles",
                outcome.cycle_members.len()
            );
        }

        let graph = self.introspector.graph();
        let pk_map = if self.config.keep_pks {
            PkMap::new()
        } else {
            build_pk_map(&records, graph, &outcome.cycle_members)?
        };

        let ddl = if self.config.create_schema {
            let tables: BTreeSet<TableRef> =
                records.keys().map(|id| id.table.clone()).collect();
            Some(DdlGenerator::new(graph).generate(&self.config.connection.database, &tables))
        } else {
            None
        };

        check_cancel(&cancel)?;
        let generator = SqlGenerator::new(graph);
        let sql = generator.generate(
            &outcome.ordered,
            &records,
            &pk_map,
            &outcome.cycle_members,
            ddl.as_deref(),
            &GenerateOptions {
                keep_pks: self.config.keep_pks,
                include_transaction: true,
            },
        )?;

        check_cancel(&cancel)?;
        // A directory target gets the conventional dump filename inside it.
        let output = match &self.config.output {
            OutputTarget::File(path) if path.is_dir() => OutputTarget::File(path.join(
                dump_filename(&seed_table.schema, &seed_table.name, &first_seed_pk),
            )),
            other => other.clone(),
        };
        write_output(&output, &sql)?;

        let table_count = records
            .keys()
            .map(|id| &id.table)
            .collect::<BTreeSet<_>>()
            .len();

        Ok(DumpResult {
            record_count: records.len(),
            table_count,
            remapped_count: pk_map.len(),
            cycle_count: outcome.cycle_members.len(),
            bytes_written: sql.len(),
            duration_seconds: started.elapsed().as_secs_f64(),
            output,
        })
    }

    /// List the base tables of the configured schema.
    pub async fn list_tables(&mut self) -> Result<String> {
        let tables = self
            .introspector
            .list_tables(&self.source, &self.config.connection.schema)
            .await?;
        let mut out = String::new();
        for table in tables {
            out.push_str(&table.to_string());
            out.push('\n');
        }
        Ok(out)
    }

    /// Describe one table: columns, keys, and both FK directions.
    pub async fn describe(&mut self, table: &str) -> Result<String> {
        let table_ref = TableRef::parse(table, &self.config.connection.schema)?;
        self.introspector.describe(&self.source, &table_ref).await
    }

    /// Render the foreign-key graph of the configured schema.
    pub async fn fk_graph(&mut self) -> Result<String> {
        self.introspector
            .fk_graph(&self.source, &self.config.connection.schema)
            .await
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        return Err(DumpError::Cancelled);
    }
    Ok(())
}

fn cache_path(cache: &CacheConfig) -> Option<std::path::PathBuf> {
    cache.path.clone().or_else(SchemaCache::default_path)
}

/// Best-effort cache read; any cache failure degrades to a fresh
/// introspection.
fn load_cached_graph(config: &RunConfig) -> Option<crate::schema::SchemaGraph> {
    if !config.cache.enabled {
        return None;
    }
    let path = cache_path(&config.cache)?;
    match SchemaCache::open(&path, config.cache.ttl_hours)
        .and_then(|cache| cache.load(&config.connection.host, &config.connection.database))
    {
        Ok(graph) => graph,
        Err(e) => {
            warn!("schema cache unavailable: {}", e);
            None
        }
    }
}

/// Best-effort cache write; failures are logged and ignored.
fn store_cached_graph(config: &RunConfig, graph: &crate::schema::SchemaGraph) {
    if !config.cache.enabled || graph.is_empty() {
        return;
    }
    let Some(path) = cache_path(&config.cache) else {
        return;
    };
    let result = SchemaCache::open(&path, config.cache.ttl_hours)
        .and_then(|cache| cache.store(&config.connection.host, &config.connection.database, graph));
    if let Err(e) = result {
        warn!("could not update schema cache: {}", e);
    }
}

/// Clear every schema cache entry; used by the cache maintenance flag.
pub fn clear_schema_cache(cache: &CacheConfig) -> Result<usize> {
    let Some(path) = cache_path(cache) else {
        return Ok(0);
    };
    if !path.exists() {
        return Ok(0);
    }
    SchemaCache::open(&path, cache.ttl_hours)?.clear()
}
