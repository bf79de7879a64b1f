//! HTML parsing utilities for locating rewritable links.

use std::collections::HashSet;

use scraper::{Html, Selector};
use tracing::debug;

/// Extract all absolute http(s) link URLs from `<a href>` elements
/// (deduplicated, document order).
pub fn extract_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("Invalid selector");

    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for a in document.select(&selector) {
        if let Some(href) = a.value().attr("href") {
            let href = href.trim();
            if is_absolute_http(href) && seen.insert(href.to_string()) {
                urls.push(href.to_string());
            }
        }
    }

    debug!(count = urls.len(), "Extracted links");
    urls
}

/// Count `<form>` elements, used to log landing pages without capture points.
pub fn count_forms(html: &str) -> usize {
    let document = Html::parse_document(html);
    let selector = Selector::parse("form").expect("Invalid selector");
    document.select(&selector).count()
}

pub fn is_absolute_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_links_deduplicates() {
        let html = r#"
            <html>
                <a href="https://example.com/page1">Link 1</a>
                <a href="https://example.com/page1">Link 1 again</a>
                <a href="https://example.com/page2">Link 2</a>
            </html>
        "#;

        let links = extract_links(html);
        assert_eq!(links, vec!["https://example.com/page1", "https://example.com/page2"]);
    }

    #[test]
    fn test_extract_links_skips_non_http() {
        let html = r##"
            <a href="mailto:helpdesk@example.com">Mail</a>
            <a href="/relative">Relative</a>
            <a href="#top">Anchor</a>
            <a href="HTTPS://EXAMPLE.COM/upper">Upper</a>
        "##;

        assert_eq!(extract_links(html), vec!["HTTPS://EXAMPLE.COM/upper"]);
    }

    #[test]
    fn test_extract_links_decodes_entities() {
        let html = r#"<a href="https://example.com/?a=1&amp;b=2">Query</a>"#;
        assert_eq!(extract_links(html), vec!["https://example.com/?a=1&b=2"]);
    }

    #[test]
    fn test_count_forms() {
        assert_eq!(count_forms("<form></form><form action='/x'></form>"), 2);
        assert_eq!(count_forms("<p>none</p>"), 0);
    }
}
