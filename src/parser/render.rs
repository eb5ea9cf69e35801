use scraper::{node::Node, ElementRef};

/// Piece of rendered cell text. Images stay unresolved until the
/// page is handed to the fetch dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Image(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub parts: Vec<Fragment>,
}

impl Rendered {
    fn push_text(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(Fragment::Text(last)) = self.parts.last_mut() {
            last.push_str(s);
        } else {
            self.parts.push(Fragment::Text(s.to_string()));
        }
    }

    fn push_image(&mut self, url: String) {
        self.parts.push(Fragment::Image(url));
    }

    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Fragment::Image(url) => Some(url.as_str()),
            Fragment::Text(_) => None,
        })
    }

    /// Text only, images left out.
    #[cfg(test)]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Fragment::Text(t) => Some(t.as_str()),
                Fragment::Image(_) => None,
            })
            .collect()
    }
}

/// Render the children of `el` (a table cell) to text.
///
/// Text nodes are trimmed and concatenated; list items, line breaks and
/// links keep a minimal markup, images become [`Fragment::Image`].
pub fn render_cell(el: ElementRef<'_>, domain: &str) -> Rendered {
    let mut out = Rendered::default();
    render_children(el, domain, &mut out);
    out
}

fn render_children(el: ElementRef<'_>, domain: &str, out: &mut Rendered) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_text(text.trim()),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    render_element(child, domain, out);
                }
            }
            _ => {}
        }
    }
}

fn render_element(el: ElementRef<'_>, domain: &str, out: &mut Rendered) {
    let mut after = None;
    match el.value().name() {
        "script" | "style" => return,
        "li" => {
            out.push_text("\t* ");
            after = Some("\n");
        }
        "br" => out.push_text("\n"),
        "a" => {
            if let Some(href) = el.value().attr("href").filter(|h| !h.is_empty()) {
                out.push_text(&format!(" <a href=\"{}\">", href));
                after = Some("</a>");
            }
        }
        "img" => {
            if let Some(src) = el.value().attr("src").filter(|s| !s.is_empty()) {
                out.push_image(absolute_url(domain, src));
            }
        }
        _ => {}
    }
    render_children(el, domain, out);
    if let Some(s) = after {
        out.push_text(s);
    }
}

/// Resolve a site-relative reference against `domain`.
pub fn absolute_url(domain: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") || href.starts_with("data:") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        let scheme = domain.split("//").next().unwrap_or("http:");
        format!("{}//{}", scheme, rest)
    } else if href.starts_with('/') {
        format!("{}{}", domain.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", domain.trim_end_matches('/'), href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    fn cell(html: &str) -> Rendered {
        let doc = Html::parse_fragment(&format!("<table><tr><td>{}</td></tr></table>", html));
        let td = doc.select(&Selector::parse("td").unwrap()).next().unwrap();
        render_cell(td, "http://wiki.local")
    }

    #[test]
    fn plain_text_is_trimmed() {
        assert_eq!(cell("  Alice  ").text(), "Alice");
        assert_eq!(cell("<p> one </p><p>two</p>").text(), "onetwo");
    }

    #[test]
    fn list_items_and_breaks() {
        let r = cell("<ul><li>a</li><li>b</li></ul>x<br/>y");
        assert_eq!(r.text(), "\t* a\n\t* b\nx\ny");
    }

    #[test]
    fn links_keep_href() {
        let r = cell(r#"see <a href="/display/OPI/Team">Team</a>"#);
        assert_eq!(r.text(), r#"see <a href="/display/OPI/Team">Team</a>"#);
        assert_eq!(cell("<a>bare</a>").text(), "bare");
    }

    #[test]
    fn images_become_fragments() {
        let r = cell(r#"logo <img src="/download/logo.png"> end"#);
        assert_eq!(
            r.parts,
            [
                Fragment::Text("logo".into()),
                Fragment::Image("http://wiki.local/download/logo.png".into()),
                Fragment::Text("end".into()),
            ]
        );
        assert_eq!(r.images().collect::<Vec<_>>(), ["http://wiki.local/download/logo.png"]);
    }

    #[test]
    fn resolves_relative_urls() {
        assert_eq!(absolute_url("http://w", "/a.png"), "http://w/a.png");
        assert_eq!(absolute_url("http://w/", "a.png"), "http://w/a.png");
        assert_eq!(absolute_url("https://w", "//cdn/a.png"), "https://cdn/a.png");
        assert_eq!(absolute_url("http://w", "https://x/a.png"), "https://x/a.png");
    }
}
