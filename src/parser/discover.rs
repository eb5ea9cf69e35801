use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};

use super::render::absolute_url;

static CHILDREN_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#page-children a[href]").unwrap());

/// Child page URLs listed on an index page, in page order, without repeats.
pub fn subpages(index_html: &str, domain: &str) -> Vec<String> {
    let doc = Html::parse_document(index_html);
    let mut seen = HashSet::new();
    doc.select(&CHILDREN_SEL)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.is_empty())
        .map(|href| absolute_url(domain, href))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}
