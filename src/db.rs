use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::SecondsFormat;
use rusqlite::Connection;

use crate::record::{KeyRow, Record};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Create the tables. Also turns per-statement foreign key enforcement off
/// on `conn`: keys are only written at the end of a run, so references are
/// checked by `store_keys` instead.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = OFF;

        CREATE TABLE IF NOT EXISTS entries (
            id          INTEGER PRIMARY KEY,
            title_text  TEXT NOT NULL,
            title_url   TEXT NOT NULL,
            author_name TEXT NOT NULL,
            author_url  TEXT NOT NULL,
            date        TEXT
        );

        CREATE TABLE IF NOT EXISTS "keys" (
            id   INTEGER PRIMARY KEY,
            name TEXT UNIQUE NOT NULL
        );

        CREATE TABLE IF NOT EXISTS "values" (
            id       INTEGER PRIMARY KEY,
            entry_id INTEGER NOT NULL REFERENCES entries(id),
            key_id   INTEGER NOT NULL REFERENCES "keys"(id),
            data     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_values_entry ON "values"(entry_id);
        CREATE INDEX IF NOT EXISTS idx_values_key ON "values"(key_id);
        "#,
    )?;
    Ok(())
}

// ── Rows ──

/// Entry row plus its value rows, in one transaction.
pub fn store_record(conn: &Connection, record: &Record) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut entry = tx.prepare_cached(
            "INSERT INTO entries (id, title_text, title_url, author_name, author_url, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        entry
            .execute(rusqlite::params![
                record.id,
                record.title.text,
                record.title.url,
                record.author.name,
                record.author.url,
                record
                    .date
                    .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ])
            .with_context(|| format!("cannot store entry {}", record.id))?;

        let mut value = tx.prepare_cached(
            r#"INSERT INTO "values" (entry_id, key_id, data) VALUES (?1, ?2, ?3)"#,
        )?;
        for v in &record.values {
            value
                .execute(rusqlite::params![record.id, v.key_id, v.data])
                .with_context(|| format!("cannot store value for entry {}", record.id))?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Write the key dictionary, then verify every stored value points at a
/// known key and entry. Nothing is committed if the check fails.
pub fn store_keys(conn: &Connection, keys: &[KeyRow]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(r#"INSERT INTO "keys" (id, name) VALUES (?1, ?2)"#)?;
        for k in keys {
            count += stmt
                .execute(rusqlite::params![k.id, k.name])
                .with_context(|| format!("cannot store key {} ({})", k.id, k.name))?;
        }

        let mut check = tx.prepare("PRAGMA foreign_key_check")?;
        let dangling = check.query_map([], |_| Ok(()))?.count();
        if dangling > 0 {
            bail!("{} rows reference missing keys or entries", dangling);
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Stats ──

pub struct Stats {
    pub entries: usize,
    pub values: usize,
    pub keys: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let entries: usize = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
    let values: usize = conn.query_row(r#"SELECT COUNT(*) FROM "values""#, [], |r| r.get(0))?;
    let keys: usize = conn.query_row(r#"SELECT COUNT(*) FROM "keys""#, [], |r| r.get(0))?;
    Ok(Stats {
        entries,
        values,
        keys,
    })
}
