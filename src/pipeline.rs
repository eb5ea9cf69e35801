//! Fan-out/fan-in extraction.
//!
//! producer -> id channel -> N extraction workers -> output channel -> sink.
//! A document whose content cannot be fetched is dropped; a record the sink
//! cannot persist ends the run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dispatch::{CacheStats, FetchDispatcher};
use crate::fetch::Fetcher;
use crate::parser::Extractor;
use crate::record::RawDocument;
use crate::sink::Sink;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub discovered: usize,
    pub dropped: usize,
    pub persisted: usize,
    pub cache: CacheStats,
}

pub struct Pipeline {
    source: Arc<dyn Fetcher>,
    dispatcher: FetchDispatcher,
    extractor: Arc<Extractor>,
    workers: usize,
    doc_queue: usize,
    out_queue: usize,
    progress: bool,
}

impl Pipeline {
    pub fn new(source: Arc<dyn Fetcher>, dispatcher: FetchDispatcher, extractor: Extractor) -> Self {
        let defaults = Settings::default();
        Pipeline {
            source,
            dispatcher,
            extractor: Arc::new(extractor),
            workers: defaults.workers,
            doc_queue: defaults.doc_queue,
            out_queue: defaults.out_queue,
            progress: false,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        source: Arc<dyn Fetcher>,
        dispatcher: FetchDispatcher,
    ) -> Self {
        Pipeline::new(source, dispatcher, Extractor::new(settings.domain.clone()))
            .workers(settings.workers)
            .queues(settings.doc_queue, settings.out_queue)
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn queues(mut self, doc_queue: usize, out_queue: usize) -> Self {
        self.doc_queue = doc_queue.max(1);
        self.out_queue = out_queue.max(1);
        self
    }

    pub fn progress(mut self, show: bool) -> Self {
        self.progress = show;
        self
    }

    /// Process every document id and hand the results to `sink`.
    ///
    /// The sink sees documents in completion order. `Sink::finish` runs
    /// only when every document went through without a fatal error.
    pub async fn run<I, S>(&self, ids: I, sink: &mut S) -> Result<RunStats>
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
        S: Sink,
    {
        let (id_tx, id_rx) = mpsc::channel::<String>(self.doc_queue);
        let (out_tx, mut out_rx) = mpsc::channel::<RawDocument>(self.out_queue);

        let ids = ids.into_iter();
        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            for id in ids {
                if id_tx.send(id).await.is_err() {
                    break;
                }
                sent += 1;
            }
            sent
        });

        let id_rx = Arc::new(Mutex::new(id_rx));
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let ctx = Worker {
                id: worker,
                ids: Arc::clone(&id_rx),
                out: out_tx.clone(),
                source: Arc::clone(&self.source),
                dispatcher: self.dispatcher.clone(),
                extractor: Arc::clone(&self.extractor),
                dropped: Arc::clone(&dropped),
            };
            workers.spawn(ctx.run());
        }
        // Workers hold the remaining senders; the channel closes when they finish.
        drop(out_tx);

        let pb = self.progress_bar()?;
        let mut persisted = 0usize;
        loop {
            tokio::select! {
                doc = out_rx.recv() => match doc {
                    Some(doc) => {
                        sink.accept(doc)?;
                        persisted += 1;
                        pb.inc(1);
                    }
                    None => break,
                },
                Some(joined) = workers.join_next() => {
                    joined.context("extraction worker panicked")?;
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            joined.context("extraction worker panicked")?;
        }
        pb.finish_and_clear();

        let discovered = producer.await.context("document producer panicked")?;
        sink.finish()?;

        let stats = RunStats {
            discovered,
            dropped: dropped.load(Ordering::Relaxed),
            persisted,
            cache: self.dispatcher.stats(),
        };
        info!(
            "Processed {} documents ({} persisted, {} dropped); resources: {} hits, {} misses, {} failed",
            stats.discovered,
            stats.persisted,
            stats.dropped,
            stats.cache.hits,
            stats.cache.misses,
            stats.cache.failures,
        );
        Ok(stats)
    }

    fn progress_bar(&self) -> Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {pos} documents ({per_sec})")?,
        );
        Ok(pb)
    }
}

struct Worker {
    id: usize,
    ids: Arc<Mutex<mpsc::Receiver<String>>>,
    out: mpsc::Sender<RawDocument>,
    source: Arc<dyn Fetcher>,
    dispatcher: FetchDispatcher,
    extractor: Arc<Extractor>,
    dropped: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.ids.lock().await.recv().await;
            let Some(url) = next else { break };
            debug!(worker = self.id, "processing start: {}", url);

            let content = match self.source.fetch(&url).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}: cannot read page content: {}", url, e);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let page = self.extractor.parse(&url, &content.data);
            let images = page.image_count();
            let doc = page.embed(&self.dispatcher).await;
            debug!(worker = self.id, images, "processing done: {}", url);

            if self.out.send(doc).await.is_err() {
                // Sink is gone; the run is already failing.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::dispatch::tests::FakeFetcher;
    use crate::parser::IMAGE_UNAVAILABLE;
    use crate::sink::DbSink;
    use rusqlite::Connection;
    use std::collections::BTreeSet;
    use std::num::NonZeroUsize;

    fn page(title: &str, attrs: &[(&str, &str)]) -> Vec<u8> {
        let rows: String = attrs
            .iter()
            .map(|(k, v)| format!("<tr><td>{}</td><td>{}</td></tr>", k, v))
            .collect();
        format!(
            r#"<html><body>
            <h1 id="title-text"><a href="/display/OPI/{title}">{title}</a></h1>
            <div id="main-content"><table class="confluenceTable">{rows}</table></div>
            </body></html>"#
        )
        .into_bytes()
    }

    fn pipeline(docs: FakeFetcher, images: FakeFetcher) -> Pipeline {
        let dispatcher = FetchDispatcher::spawn(Arc::new(images), 2, NonZeroUsize::new(16).unwrap(), 4);
        Pipeline::new(Arc::new(docs), dispatcher, Extractor::new("http://wiki.local"))
            .workers(4)
            .queues(8, 4)
    }

    fn memory_sink() -> DbSink {
        DbSink::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn rows(conn: &Connection, sql: &str) -> Vec<(i64, String)> {
        let mut stmt = conn.prepare(sql).unwrap();
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    #[tokio::test]
    async fn two_documents_end_to_end() {
        let doc1 = page("doc1", &[("Owner", "Alice")]);
        let doc2 = page("doc2", &[("Owner", "Bob"), ("Team", "X")]);
        let docs = FakeFetcher::with(&[
            ("doc1", "text/html", doc1.as_slice()),
            ("doc2", "text/html", doc2.as_slice()),
        ]);
        let p = pipeline(docs, FakeFetcher::default());

        let mut sink = memory_sink();
        let stats = p.run(vec!["doc1".to_string(), "doc2".to_string()], &mut sink).await.unwrap();
        assert_eq!((stats.discovered, stats.persisted, stats.dropped), (2, 2, 0));

        let conn = sink.connection();
        assert_eq!(
            rows(conn, r#"SELECT id, name FROM "keys" ORDER BY id"#),
            [(1, "Owner".to_string()), (2, "Team".to_string())]
        );
        let mut values = rows(conn, r#"SELECT key_id, data FROM "values""#);
        values.sort();
        assert_eq!(
            values,
            [(1, "Alice".to_string()), (1, "Bob".to_string()), (2, "X".to_string())]
        );
        let entries: BTreeSet<(i64, String)> =
            rows(conn, "SELECT id, title_text FROM entries").into_iter().collect();
        let ids: Vec<i64> = entries.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [1, 2]);
        let titles: BTreeSet<&str> = entries.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(titles, BTreeSet::from(["doc1", "doc2"]));
    }

    #[tokio::test]
    async fn sequence_ids_have_no_gaps() {
        const N: usize = 60;
        let bodies: Vec<(String, Vec<u8>)> = (0..N)
            .map(|i| {
                let id = format!("doc{i}");
                let body = page(&id, &[("Index", i.to_string().as_str())]);
                (id, body)
            })
            .collect();
        let entries: Vec<(&str, &str, &[u8])> = bodies
            .iter()
            .map(|(id, body)| (id.as_str(), "text/html", body.as_slice()))
            .collect();
        let p = pipeline(FakeFetcher::with(&entries), FakeFetcher::default());

        let mut sink = memory_sink();
        let ids: Vec<String> = bodies.iter().map(|(id, _)| id.clone()).collect();
        let stats = p.run(ids, &mut sink).await.unwrap();
        assert_eq!(stats.persisted, N);

        let conn = sink.connection();
        let got: BTreeSet<i64> = rows(conn, "SELECT id, title_text FROM entries")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(got, (1..=N as i64).collect::<BTreeSet<_>>());
        assert_eq!(db::get_stats(conn).unwrap().keys, 1);
    }

    #[tokio::test]
    async fn unreachable_documents_are_dropped() {
        let doc1 = page("doc1", &[("Owner", "Alice")]);
        let docs = FakeFetcher::with(&[("doc1", "text/html", doc1.as_slice())]);
        let p = pipeline(docs, FakeFetcher::default());

        let mut sink = memory_sink();
        let stats = p
            .run(vec!["gone".to_string(), "doc1".to_string()], &mut sink)
            .await
            .unwrap();
        assert_eq!((stats.discovered, stats.persisted, stats.dropped), (2, 1, 1));
        assert_eq!(db::get_stats(sink.connection()).unwrap().entries, 1);
    }

    #[tokio::test]
    async fn failed_embed_still_emits_the_document() {
        let body = page("doc1", &[("Diagram", r#"<img src="/download/arch.png">"#)]);
        let docs = FakeFetcher::with(&[("doc1", "text/html", body.as_slice())]);
        let p = pipeline(docs, FakeFetcher::default());

        let mut sink = memory_sink();
        let stats = p.run(vec!["doc1".to_string()], &mut sink).await.unwrap();
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.cache.failures, 1);
        assert_eq!(
            rows(sink.connection(), r#"SELECT key_id, data FROM "values""#),
            [(1, IMAGE_UNAVAILABLE.to_string())]
        );
    }

    #[tokio::test]
    async fn shared_images_are_fetched_once() {
        let img = r#"<img src="/download/logo.png">"#;
        let doc1 = page("doc1", &[("Logo", img)]);
        let doc2 = page("doc2", &[("Logo", img)]);
        let docs = FakeFetcher::with(&[
            ("doc1", "text/html", doc1.as_slice()),
            ("doc2", "text/html", doc2.as_slice()),
        ]);
        let images = FakeFetcher::with(&[(
            "http://wiki.local/download/logo.png",
            "image/png",
            b"png",
        )]);
        // One extraction worker so the second lookup happens after the first insert.
        let p = pipeline(docs, images).workers(1);

        let mut sink = memory_sink();
        let stats = p
            .run(vec!["doc1".to_string(), "doc2".to_string()], &mut sink)
            .await
            .unwrap();
        assert_eq!((stats.cache.misses, stats.cache.hits), (1, 1));
    }

    #[tokio::test]
    async fn non_utf8_page_is_still_extracted() {
        let doc1 = page("doc1", &[("Owner", "Alice")]);
        let mut latin1 = page("latin1", &[("Owner", "Ren")]);
        let at = latin1.windows(3).position(|w| w == b"Ren").unwrap() + 3;
        latin1.insert(at, 0xe9);
        let docs = FakeFetcher::with(&[
            ("doc1", "text/html", doc1.as_slice()),
            ("latin1", "text/html", latin1.as_slice()),
        ]);
        let p = pipeline(docs, FakeFetcher::default());

        let mut sink = memory_sink();
        let stats = p
            .run(vec!["doc1".to_string(), "latin1".to_string()], &mut sink)
            .await
            .unwrap();
        assert_eq!((stats.persisted, stats.dropped), (2, 0));
        let mut values = rows(sink.connection(), r#"SELECT key_id, data FROM "values""#);
        values.sort();
        assert_eq!(
            values,
            [(1, "Alice".to_string()), (1, "Ren\u{fffd}".to_string())]
        );
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        let doc1 = page("doc1", &[("Owner", "Alice")]);
        let doc2 = page("doc2", &[("Owner", "Bob")]);
        let docs = FakeFetcher::with(&[
            ("doc1", "text/html", doc1.as_slice()),
            ("doc2", "text/html", doc2.as_slice()),
        ]);
        let p = pipeline(docs, FakeFetcher::default());

        // Entry 1 already exists, so the first record cannot be stored.
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO entries (id, title_text, title_url, author_name, author_url)
             VALUES (1, 'old', '', '', '')",
            [],
        )
        .unwrap();
        let mut sink = DbSink::new(conn).unwrap();

        let err = p
            .run(vec!["doc1".to_string(), "doc2".to_string()], &mut sink)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("cannot store"));
        // Keys are never flushed for a failed run.
        assert_eq!(db::get_stats(sink.connection()).unwrap().keys, 0);
    }
}
