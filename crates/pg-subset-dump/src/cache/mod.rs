//! Durable schema cache.
//!
//! A small SQLite database holding one serialized schema graph per
//! (host, database), with a freshness timestamp. SQLite serializes
//! concurrent access from other processes; a corrupt or stale entry is
//! purged and treated as a miss. The engine is fully correct with caching
//! disabled.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::schema::SchemaGraph;

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_graphs (
  host TEXT NOT NULL,
  database TEXT NOT NULL,
  cached_at TEXT NOT NULL,
  graph_json TEXT NOT NULL,
  PRIMARY KEY (host, database)
);
";

/// Durable key/value store for introspected schema graphs.
pub struct SchemaCache {
    conn: Connection,
    ttl: Duration,
}

impl SchemaCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path, ttl_hours: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(INIT_SQL)?;
        Ok(Self {
            conn,
            ttl: Duration::hours(ttl_hours),
        })
    }

    /// The default cache location under the user's cache directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("pg-subset-dump").join("schema_cache.db"))
    }

    /// Load the cached graph for (host, database), if present and fresh.
    /// Unreadable entries are purged and reported as a miss.
    pub fn load(&self, host: &str, database: &str) -> Result<Option<SchemaGraph>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT cached_at, graph_json FROM schema_graphs WHERE host = ?1 AND database = ?2",
                params![host, database],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((cached_at, graph_json)) = row else {
            debug!("schema cache miss for {}/{}", host, database);
            return Ok(None);
        };

        let cached_at = match DateTime::parse_from_rfc3339(&cached_at) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                warn!("purging unreadable cache entry for {}/{}: {}", host, database, e);
                self.invalidate(host, database)?;
                return Ok(None);
            }
        };

        if Utc::now() - cached_at > self.ttl {
            debug!("schema cache expired for {}/{}", host, database);
            self.invalidate(host, database)?;
            return Ok(None);
        }

        match serde_json::from_str::<SchemaGraph>(&graph_json) {
            Ok(graph) => {
                info!(
                    "Loaded schema graph for {}/{} from cache ({} tables)",
                    host,
                    database,
                    graph.len()
                );
                Ok(Some(graph))
            }
            Err(e) => {
                warn!("purging corrupt cache entry for {}/{}: {}", host, database, e);
                self.invalidate(host, database)?;
                Ok(None)
            }
        }
    }

    /// Store a graph, atomically replacing any previous entry.
    pub fn store(&self, host: &str, database: &str, graph: &SchemaGraph) -> Result<()> {
        let graph_json = serde_json::to_string(graph)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_graphs (host, database, cached_at, graph_json) \
             VALUES (?1, ?2, ?3, ?4)",
            params![host, database, Utc::now().to_rfc3339(), graph_json],
        )?;
        debug!("stored schema graph for {}/{} ({} tables)", host, database, graph.len());
        Ok(())
    }

    /// Drop the entry for (host, database).
    pub fn invalidate(&self, host: &str, database: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM schema_graphs WHERE host = ?1 AND database = ?2",
            params![host, database],
        )?;
        Ok(())
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM schema_graphs", [])?;
        info!("cleared {} schema cache entries", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table, TableRef};

    fn sample_graph() -> SchemaGraph {
        let mut graph = SchemaGraph::new();
        graph.insert(Table {
            table_ref: TableRef::new("public", "users"),
            columns: vec![Column {
                name: "id".to_string(),
                ordinal: 1,
                data_type: "integer".to_string(),
                udt_name: "int4".to_string(),
                nullable: false,
                default_expr: None,
                is_identity: true,
            }],
            primary_key: vec!["id".to_string()],
            unique_constraints: vec![],
            outgoing_fks: vec![],
            incoming_fks: vec![],
        });
        graph
    }

    fn open_cache(dir: &tempfile::TempDir, ttl_hours: i64) -> SchemaCache {
        SchemaCache::open(&dir.path().join("cache.db"), ttl_hours).unwrap()
    }

    #[test]
    fn test_miss_on_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        assert!(cache.load("localhost", "app").unwrap().is_none());
    }

    #[test]
    fn test_store_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache.store("localhost", "app", &sample_graph()).unwrap();

        let loaded = cache.load("localhost", "app").unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains(&TableRef::new("public", "users")));
    }

    #[test]
    fn test_keyed_by_host_and_database() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache.store("localhost", "app", &sample_graph()).unwrap();

        assert!(cache.load("otherhost", "app").unwrap().is_none());
        assert!(cache.load("localhost", "other").unwrap().is_none());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 0);
        cache.store("localhost", "app", &sample_graph()).unwrap();
        // TTL of zero hours: anything stored is already stale.
        assert!(cache.load("localhost", "app").unwrap().is_none());
    }

    #[test]
    fn test_store_replaces_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache.store("localhost", "app", &SchemaGraph::new()).unwrap();
        cache.store("localhost", "app", &sample_graph()).unwrap();

        let loaded = cache.load("localhost", "app").unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_corrupt_entry_purged_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache
            .conn
            .execute(
                "INSERT INTO schema_graphs VALUES ('localhost', 'app', ?1, 'not json')",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();

        assert!(cache.load("localhost", "app").unwrap().is_none());
        // The bad row is gone.
        let count: i64 = cache
            .conn
            .query_row("SELECT COUNT(*) FROM schema_graphs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unparseable_timestamp_purged_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache
            .conn
            .execute(
                "INSERT INTO schema_graphs VALUES ('localhost', 'app', 'whenever', '{}')",
                [],
            )
            .unwrap();
        assert!(cache.load("localhost", "app").unwrap().is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(&dir, 24);
        cache.store("a", "x", &sample_graph()).unwrap();
        cache.store("b", "y", &sample_graph()).unwrap();

        cache.invalidate("a", "x").unwrap();
        assert!(cache.load("a", "x").unwrap().is_none());
        assert!(cache.load("b", "y").unwrap().is_some());

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.load("b", "y").unwrap().is_none());
    }
}
