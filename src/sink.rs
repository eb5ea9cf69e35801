//! Consumers at the end of the pipeline. A sink is driven by exactly one
//! task, which makes it the only place IDs are handed out.

use std::io::Write;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::db;
use crate::normalize::Normalizer;
use crate::record::RawDocument;

pub trait Sink {
    /// Persist or serialize one document. Errors are fatal for the run.
    fn accept(&mut self, doc: RawDocument) -> Result<()>;

    /// Called once after the last document.
    fn finish(&mut self) -> Result<()>;
}

/// Normalizes documents and writes them to SQLite; keys go last.
pub struct DbSink {
    conn: Connection,
    normalizer: Normalizer,
    values: usize,
}

impl DbSink {
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_schema(&conn)?;
        Ok(DbSink {
            conn,
            normalizer: Normalizer::new(),
            values: 0,
        })
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

impl Sink for DbSink {
    fn accept(&mut self, doc: RawDocument) -> Result<()> {
        let source = doc.id.clone();
        let record = self.normalizer.normalize(doc);
        db::store_record(&self.conn, &record)
            .with_context(|| format!("cannot store {}", source))?;
        self.values += record.values.len();
        debug!("stored entry {} ({}) with {} values", record.id, source, record.values.len());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let keys = self.normalizer.keys().rows();
        let n = db::store_keys(&self.conn, &keys).context("cannot store keys")?;
        info!(
            "Stored {} entries, {} values, {} keys",
            self.normalizer.count(),
            self.values,
            n
        );
        Ok(())
    }
}

/// One JSON object per line, in arrival order.
pub struct JsonLinesSink<W: Write> {
    out: W,
    lines: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        JsonLinesSink { out, lines: 0 }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn accept(&mut self, doc: RawDocument) -> Result<()> {
        serde_json::to_writer(&mut self.out, &doc.to_json()).context("cannot write JSON")?;
        self.out.write_all(b"\n").context("cannot write to output")?;
        self.lines += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().context("cannot flush output")?;
        info!("Wrote {} lines", self.lines);
        Ok(())
    }
}
