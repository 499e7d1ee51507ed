//! Sources for tables the host already holds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::debug;

use ferry_core::emit;
use ferry_core::metrics::events::TableCopied;

use super::Source;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, IoSnafu, Result};
use crate::sink::{Sink, SinkWriter};
use crate::table::{HostTable, InMemoryTable};

#[derive(Debug, Default)]
struct FactoryState {
    copies: Vec<PathBuf>,
    closed: bool,
}

/// Turns host tables into [`Source`]s.
///
/// Columnar tables are read in place. In-memory tables are copied into a
/// fresh IPC file that lives until [`SourceFactory::close`].
#[derive(Debug)]
pub struct SourceFactory {
    temp_dir: PathBuf,
    offset_wait_timeout: Duration,
    state: Mutex<FactoryState>,
}

impl SourceFactory {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            temp_dir: config.temp_dir(),
            offset_wait_timeout: config.offset_wait_timeout(),
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// Create a source for `table`. Copies in-memory tables, which blocks on
    /// file I/O.
    pub fn create_source(&self, table: &HostTable) -> Result<Source> {
        match table {
            HostTable::Columnar(table) => table.source(),
            HostTable::InMemory(table) => self.copy(table),
        }
    }

    /// Number of copies currently owned by the factory.
    pub fn num_copies(&self) -> usize {
        self.state.lock().copies.len()
    }

    /// Delete every copy. Idempotent; later copies are rejected.
    pub fn close(&self) {
        let copies = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.copies)
        };
        for path in &copies {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                debug!(path = %path.display(), error = %e, "Failed to delete table copy");
            }
        }
        if !copies.is_empty() {
            debug!(count = copies.len(), "Deleted table copies");
        }
    }

    fn copy(&self, table: &InMemoryTable) -> Result<Source> {
        let path = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ExchangeError::contract("source factory is closed"));
            }
            let path = reserve_path(&self.temp_dir, "ferry-copy-")?;
            state.copies.push(path.clone());
            path
        };

        let sink = Arc::new(Sink::new(&path, self.offset_wait_timeout));
        let mut writer = SinkWriter::try_new(sink, Arc::clone(table.schema()))?;
        for batch in table.batches() {
            writer.write(batch)?;
        }
        let rows = writer.finish()?;
        emit!(TableCopied { rows });
        debug!(path = %path.display(), rows, "Copied in-memory table");

        let source = Source::finalized(path);
        Ok(match table.column_names() {
            Some(names) => source.with_column_names(names.to_vec()),
            None => source,
        })
    }
}

/// Create an empty, uniquely named IPC file in `dir` and return its path.
pub(crate) fn reserve_path(dir: &std::path::Path, prefix: &str) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".arrow")
        .tempfile_in(dir)
        .context(IoSnafu { path: dir })?;
    let (_, path) = file.keep().map_err(|e| e.error).context(IoSnafu { path: dir })?;
    Ok(path)
}
