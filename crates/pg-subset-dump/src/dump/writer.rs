//! Output sink handling.
//!
//! The sink is write-once: nothing is flushed until the whole stream is
//! generated, and file output goes through a temp file in the destination
//! directory followed by a rename, so consumers never observe a truncated
//! script.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::config::OutputTarget;
use crate::error::{DumpError, Result};

/// Write the finished replay stream to its sink.
pub fn write_output(target: &OutputTarget, sql: &str) -> Result<()> {
    match target {
        OutputTarget::Stdout => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(sql.as_bytes())
                .and_then(|_| handle.flush())
                .map_err(|e| DumpError::Output(format!("writing to stdout: {}", e)))
        }
        OutputTarget::File(path) => write_file_atomic(path, sql),
    }
}

fn write_file_atomic(path: &Path, sql: &str) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)
            .map_err(|e| DumpError::Output(format!("creating {}: {}", parent.display(), e)))?;
    }
    let dir = parent.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| DumpError::Output(format!("creating temp file in {}: {}", dir.display(), e)))?;
    tmp.write_all(sql.as_bytes())
        .map_err(|e| DumpError::Output(format!("writing {}: {}", path.display(), e)))?;
    tmp.persist(path)
        .map_err(|e| DumpError::Output(format!("renaming into {}: {}", path.display(), e)))?;

    info!(
        "Wrote {} bytes ({} lines) to {}",
        sql.len(),
        sql.matches('\n').count(),
        path.display()
    );
    Ok(())
}

/// Dump filename: `{schema}_{table}_{firstpk}_{timestamp}.sql`.
pub fn dump_filename(schema: &str, table: &str, first_pk: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}_{}_{}.sql", schema, table, sanitize(first_pk), timestamp)
}

/// Default dump path under the user's home directory:
/// `~/.pg-subset-dump/dumps/{schema}_{table}_{firstpk}_{timestamp}.sql`.
/// `PG_SUBSET_DUMP_DIR` overrides the directory.
pub fn default_dump_path(schema: &str, table: &str, first_pk: &str) -> Option<PathBuf> {
    let base = std::env::var("PG_SUBSET_DUMP_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".pg-subset-dump").join("dumps")))?;
    Some(base.join(dump_filename(schema, table, first_pk)))
}

/// Keep filesystem-hostile characters out of the filename.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
