pub mod discover;
pub mod render;

use std::borrow::Cow;
use std::sync::LazyLock;

use chrono::{NaiveDate, SecondsFormat};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dispatch::FetchDispatcher;
use crate::record::{Author, RawDocument, Title};
use render::{absolute_url, render_cell, Fragment, Rendered};

/// Emitted in place of an embedded resource that could not be fetched.
pub const IMAGE_UNAVAILABLE: &str = "[image unavailable]";

static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("#title-text a").unwrap());
static AUTHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".page-metadata-modification-info .author a").unwrap());
static MODIFIED_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".page-metadata-modification-info .last-modified a").unwrap());
static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#main-content table.confluenceTable").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,2} [A-Z][a-z]{2} \d{4}").unwrap());

/// Pulls metadata and the attribute tables out of wiki pages.
#[derive(Debug, Clone)]
pub struct Extractor {
    domain: String,
}

/// A page after markup parsing, before embedded resources are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub id: String,
    pub title: Option<Title>,
    pub author: Option<Author>,
    pub date: Option<String>,
    pub cells: Vec<(Rendered, Rendered)>,
}

impl Extractor {
    pub fn new(domain: impl Into<String>) -> Self {
        Extractor {
            domain: domain.into(),
        }
    }

    /// Parse one page. Synchronous: the markup tree never crosses an await.
    ///
    /// Bytes that are not UTF-8 are replaced, the way a browser would
    /// render them, rather than failing the page.
    pub fn parse(&self, id: &str, body: &[u8]) -> ParsedPage {
        let html = String::from_utf8_lossy(body);
        if matches!(html, Cow::Owned(_)) {
            warn!("{}: body is not valid UTF-8, invalid bytes replaced", id);
        }
        let doc = Html::parse_document(&html);

        let title = doc.select(&TITLE_SEL).next().map(|a| Title {
            text: link_text(a),
            url: self.link_url(a),
        });
        let author = doc.select(&AUTHOR_SEL).next().map(|a| Author {
            name: link_text(a),
            url: self.link_url(a),
        });
        let date = doc.select(&MODIFIED_SEL).next().and_then(|a| {
            let text = link_text(a);
            let parsed = parse_modified(&text);
            if parsed.is_none() {
                debug!("{}: cannot parse modification date '{}'", id, text);
            }
            parsed
        });

        let mut cells = Vec::new();
        for table in doc.select(&TABLE_SEL) {
            for row in table.select(&ROW_SEL) {
                let mut key: Option<Rendered> = None;
                for td in row.select(&CELL_SEL) {
                    let data = render_cell(td, &self.domain);
                    match key.take() {
                        Some(k) => cells.push((k, data)),
                        None => key = Some(data),
                    }
                }
                // Odd cell out: a key with no value.
                if let Some(k) = key {
                    cells.push((k, Rendered::default()));
                }
            }
        }

        ParsedPage {
            id: id.to_string(),
            title,
            author,
            date,
            cells,
        }
    }

    fn link_url(&self, a: ElementRef<'_>) -> String {
        a.value()
            .attr("href")
            .map(|href| absolute_url(&self.domain, href))
            .unwrap_or_default()
    }
}

impl ParsedPage {
    pub fn image_count(&self) -> usize {
        self.cells
            .iter()
            .map(|(k, v)| k.images().count() + v.images().count())
            .sum()
    }

    /// Resolve embedded images through the dispatcher and flatten every
    /// cell to text. A failed fetch degrades to [`IMAGE_UNAVAILABLE`].
    pub async fn embed(self, dispatcher: &FetchDispatcher) -> RawDocument {
        let mut attributes = Map::new();
        for (key, value) in &self.cells {
            let key = flatten(&self.id, key, dispatcher).await;
            let value = flatten(&self.id, value, dispatcher).await;
            attributes.insert(key, Value::String(value));
        }
        RawDocument {
            id: self.id,
            title: self.title,
            author: self.author,
            date: self.date,
            attributes,
        }
    }
}

async fn flatten(id: &str, cell: &Rendered, dispatcher: &FetchDispatcher) -> String {
    let mut out = String::new();
    for part in &cell.parts {
        match part {
            Fragment::Text(t) => out.push_str(t),
            Fragment::Image(url) if url.starts_with("data:") => {
                out.push_str(&format!("<img src=\"{}\">", url));
            }
            Fragment::Image(url) => match dispatcher.fetch(url).await {
                Ok(res) => out.push_str(&format!("<img src=\"{}\">", res.data_uri())),
                Err(e) => {
                    warn!("{}: cannot embed image: {}", id, e);
                    out.push_str(IMAGE_UNAVAILABLE);
                }
            },
        }
    }
    out
}

fn link_text(a: ElementRef<'_>) -> String {
    a.text().collect::<String>().trim().to_string()
}

/// `05 Dec 2018` (possibly inside longer text) -> `2018-12-05T00:00:00Z`.
fn parse_modified(text: &str) -> Option<String> {
    let m = DATE_RE.find(text)?;
    let date = NaiveDate::parse_from_str(m.as_str(), "%d %b %Y").ok()?;
    let ts = date.and_hms_opt(0, 0, 0)?.and_utc();
    Some(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}
