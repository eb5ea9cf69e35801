mod cache;
mod config;
mod db;
mod dispatch;
mod error;
mod fetch;
mod import;
mod keys;
mod normalize;
mod parser;
mod pipeline;
mod record;
mod sink;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::dispatch::FetchDispatcher;
use crate::fetch::{Fetcher, HttpFetcher, Resolver};
use crate::pipeline::{Pipeline, RunStats};
use crate::sink::{DbSink, JsonLinesSink};

#[derive(Parser)]
#[command(name = "wiki_extract", about = "Extract attribute tables from wiki pages")]
struct Cli {
    /// Settings file; a missing file means defaults
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// SQLite database (overrides `db_path`)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Extraction workers (overrides `workers`)
    #[arg(short = 'w', long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every page listed on the index and write JSON lines
    Extract {
        /// Index page, path or URL (default: `index` setting)
        #[arg(short, long)]
        index: Option<String>,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a JSON-lines export into the database
    Import {
        /// JSON-lines file, `-` for stdin
        file: PathBuf,
    },
    /// Extract every page listed on the index straight into the database
    Run {
        /// Index page, path or URL (default: `index` setting)
        #[arg(short, long)]
        index: Option<String>,
    },
    /// Show row counts
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config)?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(n) = cli.workers {
        settings.workers = n;
    }
    settings.validate()?;

    let result = match cli.command {
        Commands::Extract { index, output } => {
            let (source, dispatcher) = fetchers(&settings)?;
            let urls = discover(source.as_ref(), index.as_deref().unwrap_or(&settings.index), &settings.domain).await?;
            let pipeline = Pipeline::from_settings(&settings, source, dispatcher);
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(
                    File::create(path).with_context(|| format!("cannot create {:?}", path))?,
                )),
                None => Box::new(BufWriter::new(io::stdout().lock())),
            };
            let mut sink = JsonLinesSink::new(out);
            let stats = pipeline.run(urls, &mut sink).await?;
            if output.is_some() {
                print_run(&stats);
            }
            Ok(())
        }
        Commands::Import { file } => {
            let conn = db::connect(&settings.db_path)?;
            let mut sink = DbSink::new(conn)?;
            let stats = if file.as_os_str() == "-" {
                import::read_lines(io::stdin().lock(), &mut sink)?
            } else {
                let f = File::open(&file).with_context(|| format!("cannot open {:?}", file))?;
                import::read_lines(BufReader::new(f), &mut sink)?
            };
            println!(
                "Imported {} documents from {} lines ({} skipped), {} keys.",
                stats.imported,
                stats.lines,
                stats.skipped,
                sink.normalizer().keys().len()
            );
            Ok(())
        }
        Commands::Run { index } => {
            let conn = db::connect(&settings.db_path)?;
            let mut sink = DbSink::new(conn)?;
            let (source, dispatcher) = fetchers(&settings)?;
            let urls = discover(source.as_ref(), index.as_deref().unwrap_or(&settings.index), &settings.domain).await?;
            if urls.is_empty() {
                println!("No pages listed on the index.");
                return Ok(());
            }
            println!("Extracting {} pages into {:?}...", urls.len(), settings.db_path);
            let pipeline = Pipeline::from_settings(&settings, source, dispatcher)
                .progress(io::stderr().is_terminal());
            let stats = pipeline.run(urls, &mut sink).await?;
            print_run(&stats);
            println!("Keys:      {}", sink.normalizer().keys().len());
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Entries: {}", s.entries);
            println!("Values:  {}", s.values);
            println!("Keys:    {}", s.keys);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        info!("Done in {}", format_duration(elapsed));
    }

    result
}

/// Document source plus the dispatcher used for embedded resources.
/// Both go through the same resolver, so images get the same retries.
fn fetchers(settings: &Settings) -> anyhow::Result<(Arc<dyn Fetcher>, FetchDispatcher)> {
    let http = HttpFetcher::new(settings.timeout(), &settings.user_agent)?;
    let source: Arc<dyn Fetcher> = Arc::new(Resolver::new(http, settings.retries));
    let dispatcher = FetchDispatcher::spawn(
        Arc::clone(&source),
        settings.fetch_workers,
        settings.cache_capacity(),
        settings.dispatch_queue,
    );
    Ok((source, dispatcher))
}

async fn discover(source: &dyn Fetcher, index: &str, domain: &str) -> anyhow::Result<Vec<String>> {
    let page = source
        .fetch(index)
        .await
        .with_context(|| format!("cannot read index {}", index))?;
    let html = std::str::from_utf8(&page.data).with_context(|| format!("index {} is not UTF-8", index))?;
    let urls = parser::discover::subpages(html, domain);
    info!("Found {} pages on {}", urls.len(), index);
    Ok(urls)
}

fn print_run(stats: &RunStats) {
    println!("Discovered: {}", stats.discovered);
    println!("Persisted:  {}", stats.persisted);
    println!("Dropped:    {}", stats.dropped);
    println!(
        "Resources:  {} hits, {} misses, {} failed",
        stats.cache.hits, stats.cache.misses, stats.cache.failures
    );
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
