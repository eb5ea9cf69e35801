use std::io::BufRead;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::warn;

use crate::record::RawDocument;
use crate::sink::Sink;

pub struct ImportStats {
    pub lines: usize,
    pub imported: usize,
    pub skipped: usize,
}

/// Feed a JSON-lines export into `sink`, then finish it.
///
/// Lines that are not JSON objects are logged and skipped; a metadata
/// field of the wrong shape stops the import.
pub fn read_lines<R: BufRead, S: Sink>(mut reader: R, sink: &mut S) -> Result<ImportStats> {
    let mut stats = ImportStats {
        lines: 0,
        imported: 0,
        skipped: 0,
    };
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).context("cannot read input")? == 0 {
            break;
        }
        stats.lines += 1;
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        // Bytes, not str: a line that is not UTF-8 is just another bad line.
        let map: Map<String, Value> = match serde_json::from_slice(&buf) {
            Ok(m) => m,
            Err(e) => {
                warn!("line {}: cannot unmarshal JSON: {}", stats.lines, e);
                stats.skipped += 1;
                continue;
            }
        };
        let doc = RawDocument::from_json(format!("line {}", stats.lines), map)?;
        sink.accept(doc)?;
        stats.imported += 1;
    }
    sink.finish()?;
    Ok(stats)
}
