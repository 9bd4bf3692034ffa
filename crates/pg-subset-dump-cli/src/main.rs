//! pg-subset-dump CLI - extract a referentially-closed PostgreSQL subset.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pg_subset_dump::{
    clear_schema_cache, parse_pk_list, parse_timeframe, CacheConfig, ConnectionConfig, DumpError,
    DumpService, OutputTarget, ReadOnlyPosture, RunConfig, SeedSpec, TraversalMode,
};
use tokio::sync::watch;
use tracing::Level;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-subset-dump")]
#[command(about = "Extract PostgreSQL records with all related data via FK relationships")]
#[command(version)]
struct Cli {
    /// Database host (default: DB_HOST or localhost)
    #[arg(long)]
    host: Option<String>,

    /// Database port (default: DB_PORT or 5432)
    #[arg(long)]
    port: Option<u16>,

    /// Database user (default: DB_USER)
    #[arg(long)]
    user: Option<String>,

    /// Database name (default: DB_NAME)
    #[arg(long)]
    database: Option<String>,

    /// Database schema (default: DB_SCHEMA or public)
    #[arg(long)]
    schema: Option<String>,

    /// Table to dump from (enables dump mode)
    #[arg(long)]
    table: Option<String>,

    /// Primary key value(s), comma-separated (e.g. '42' or '1,2,3')
    #[arg(long)]
    pks: Option<String>,

    /// Select all seed rows in a time window (format: column:start:end)
    #[arg(long)]
    timeframe: Option<String>,

    /// Timeframe filter on a related table (format: table:column:start:end).
    /// Can be repeated.
    #[arg(long)]
    truncate: Vec<String>,

    /// Wide mode: follow all relationships including self-referencing FKs
    #[arg(long)]
    wide: bool,

    /// Keep original primary key values (default: remap auto-generated PKs)
    #[arg(long)]
    keep_pks: bool,

    /// Include DDL statements (CREATE DATABASE/SCHEMA/TABLE) in the dump
    #[arg(long)]
    create_schema: bool,

    /// Maximum traversal depth
    #[arg(long)]
    max_depth: Option<u32>,

    /// Treat dangling foreign-key references as fatal
    #[arg(long)]
    strict_references: bool,

    /// Output file path (default: stdout)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Fail unless the session can be made read-only
    #[arg(long, conflicts_with = "allow_write_connection")]
    require_read_only: bool,

    /// Proceed silently on a writable connection
    #[arg(long)]
    allow_write_connection: bool,

    /// Disable schema caching
    #[arg(long)]
    no_cache: bool,

    /// Clear schema cache and exit
    #[arg(long)]
    clear_cache: bool,

    /// List tables in the schema and exit
    #[arg(long)]
    tables: bool,

    /// Describe one table and exit
    #[arg(long, value_name = "TABLE")]
    describe: Option<String>,

    /// Print the foreign-key graph and exit
    #[arg(long)]
    graph: bool,

    /// Statement timeout in seconds
    #[arg(long)]
    statement_timeout: Option<u64>,

    /// Log level: debug, info, warn, error (logging disabled unless set)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), DumpError> {
    let cli = Cli::parse();

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok());
    if let Some(level) = &log_level {
        setup_logging(level);
    }

    let cache = cache_config(&cli);
    if cli.clear_cache {
        let removed = clear_schema_cache(&cache)?;
        eprintln!("Cleared {} cached schema graph(s)", removed);
        return Ok(());
    }

    let connection = connection_config(&cli)?;
    let inspection_only = cli.tables || cli.describe.is_some() || cli.graph;

    let seed = if inspection_only {
        // Placeholder; inspection modes never traverse.
        SeedSpec::Pks {
            table: String::new(),
            pks: vec![],
        }
    } else {
        build_seed(&cli, &connection.schema)?
    };

    let filters = cli
        .truncate
        .iter()
        .map(|spec| parse_timeframe(spec, &connection.schema, None))
        .collect::<Result<Vec<_>, _>>()?;

    let output = match &cli.output {
        Some(path) => OutputTarget::File(path.clone()),
        None => OutputTarget::Stdout,
    };

    let config = RunConfig {
        connection,
        seed,
        mode: if cli.wide {
            TraversalMode::Wide
        } else {
            TraversalMode::Strict
        },
        filters,
        keep_pks: cli.keep_pks,
        create_schema: cli.create_schema,
        max_depth: cli.max_depth,
        strict_references: cli.strict_references,
        read_only: if cli.require_read_only {
            ReadOnlyPosture::Require
        } else if cli.allow_write_connection {
            ReadOnlyPosture::AllowWrite
        } else {
            ReadOnlyPosture::Advisory
        },
        cache,
        output,
    };

    let cancel_rx = setup_signal_handler();
    let mut service = DumpService::connect(config).await?;

    if cli.tables {
        print!("{}", service.list_tables().await?);
        return Ok(());
    }
    if let Some(table) = &cli.describe {
        print!("{}", service.describe(table).await?);
        return Ok(());
    }
    if cli.graph {
        print!("{}", service.fk_graph().await?);
        return Ok(());
    }

    let result = service.run(cancel_rx).await?;

    eprintln!(
        "Dumped {} records across {} tables in {:.2}s",
        result.record_count, result.table_count, result.duration_seconds
    );
    if result.remapped_count > 0 {
        eprintln!("  Remapped keys: {}", result.remapped_count);
    }
    if result.cycle_count > 0 {
        eprintln!("  Cycle members (deferred constraints): {}", result.cycle_count);
    }
    if let OutputTarget::File(path) = &result.output {
        eprintln!("  Wrote {} bytes to {}", result.bytes_written, path.display());
    }

    Ok(())
}

fn connection_config(cli: &Cli) -> Result<ConnectionConfig, DumpError> {
    let mut config = ConnectionConfig::from_env();
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(user) = &cli.user {
        config.user = user.clone();
    }
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    if let Some(schema) = &cli.schema {
        config.schema = schema.clone();
    }
    if let Some(timeout) = cli.statement_timeout {
        config.statement_timeout_secs = timeout;
    }

    if config.host.is_empty() || config.user.is_empty() || config.database.is_empty() {
        return Err(DumpError::Usage(
            "missing connection parameters: --host, --user and --database (or DB_HOST, DB_USER, DB_NAME)"
                .to_string(),
        ));
    }
    if config.password.is_empty() {
        return Err(DumpError::Usage(
            "no password: set PGPASSWORD in the environment".to_string(),
        ));
    }
    Ok(config)
}

fn cache_config(cli: &Cli) -> CacheConfig {
    let mut cache = CacheConfig::from_env();
    if cli.no_cache {
        cache.enabled = false;
    }
    cache
}

fn build_seed(cli: &Cli, default_schema: &str) -> Result<SeedSpec, DumpError> {
    let Some(table) = &cli.table else {
        return Err(DumpError::Usage(
            "--table is required (or use --tables/--describe/--graph/--clear-cache)".to_string(),
        ));
    };
    match (&cli.pks, &cli.timeframe) {
        (Some(_), Some(_)) => Err(DumpError::Usage(
            "--pks and --timeframe are mutually exclusive".to_string(),
        )),
        (Some(pks), None) => Ok(SeedSpec::Pks {
            table: table.clone(),
            pks: parse_pk_list(pks)?,
        }),
        (None, Some(spec)) => Ok(SeedSpec::Timeframe {
            table: table.clone(),
            filter: parse_timeframe(spec, default_schema, Some(table))?,
        }),
        (None, None) => Err(DumpError::Usage(
            "--table requires either --pks or --timeframe".to_string(),
        )),
    }
}

fn setup_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Install SIGINT/SIGTERM handlers. The returned receiver flips to true
/// when a signal arrives; the engine aborts at its next stage boundary.
#[cfg(unix)]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let tx_int = cancel_tx.clone();
    let tx_term = cancel_tx;

    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Aborting...");
        let _ = tx_int.send(true);
    });

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Aborting...");
        let _ = tx_term.send(true);
    });

    cancel_rx
}

#[cfg(not(unix))]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Aborting...");
            let _ = cancel_tx.send(true);
        }
    });

    cancel_rx
}
