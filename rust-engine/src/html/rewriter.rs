//! Link rewriting for outbound email and landing-page bodies.
//!
//! Every absolute link in an email is routed through the click endpoint with
//! the recipient token, campaign id and landing-page id attached, and an open
//! pixel is added. Landing-page forms are pointed at the submit endpoint.

use std::collections::HashSet;

use tracing::debug;
use url::Url;

use super::parser::extract_links;

/// Tracking URLs for one (campaign, recipient, landing page) triple.
#[derive(Debug, Clone)]
pub struct TrackingLinks {
    base: Url,
    token: String,
    campaign_id: i64,
    page_id: i64,
}

impl TrackingLinks {
    pub fn new(
        base_url: &str,
        token: &str,
        campaign_id: i64,
        page_id: i64,
    ) -> Result<Self, url::ParseError> {
        let base = Url::parse(base_url.trim_end_matches('/'))?;
        Ok(Self {
            base,
            token: token.to_string(),
            campaign_id,
            page_id,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Click endpoint that redirects to `destination` after recording.
    pub fn click_url(&self, destination: &str) -> String {
        let mut url = self.endpoint(&["track", "click"]);
        url.query_pairs_mut()
            .append_pair("rid", &self.token)
            .append_pair("campaign", &self.campaign_id.to_string())
            .append_pair("page", &self.page_id.to_string())
            .append_pair("url", destination);
        url.into()
    }

    pub fn open_url(&self) -> String {
        self.simple_track_url("open")
    }

    pub fn submit_url(&self) -> String {
        self.simple_track_url("submit")
    }

    pub fn report_url(&self) -> String {
        self.simple_track_url("report")
    }

    fn simple_track_url(&self, kind: &str) -> String {
        let mut url = self.endpoint(&["track", kind]);
        url.query_pairs_mut().append_pair("rid", &self.token);
        url.into()
    }

    /// The landing page this recipient's campaign serves.
    pub fn landing_url(&self) -> String {
        let page = self.page_id.to_string();
        let mut url = self.endpoint(&["landing", page.as_str()]);
        url.query_pairs_mut()
            .append_pair("rid", &self.token)
            .append_pair("campaign", &self.campaign_id.to_string());
        url.into()
    }

    /// Invisible image tag pointing at the open endpoint.
    pub fn pixel_tag(&self) -> String {
        format!(
            r#"<img alt="" src="{}" width="1" height="1" style="display:none" />"#,
            escape_attr(&self.open_url())
        )
    }

    /// Whether `url` already points at this tracking server.
    pub fn is_tracking_url(&self, url: &str) -> bool {
        Url::parse(url)
            .map(|u| u.origin() == self.base.origin() && u.path().starts_with(self.base.path().trim_end_matches('/')))
            .unwrap_or(false)
    }
}

/// Route every absolute `<a href>` through the click endpoint.
///
/// Links that already point at the tracking server are left alone.
pub fn rewrite_links(html: &str, links: &TrackingLinks) -> String {
    let targets: HashSet<String> = extract_links(html).into_iter().collect();
    let mut rewritten = 0usize;

    let out = rewrite_attribute(html, "a", "href", None, |value| {
        let value = value.trim();
        if targets.contains(value) && !links.is_tracking_url(value) {
            rewritten += 1;
            Some(links.click_url(value))
        } else {
            None
        }
    });

    debug!(links_found = targets.len(), links_rewritten = rewritten, "Rewrote links");
    out
}

/// Insert the open pixel before `</body>`, or append it when there is none.
///
/// Bodies that already reference the open endpoint are returned unchanged.
pub fn append_tracking_pixel(html: &str, links: &TrackingLinks) -> String {
    if html.contains(&escape_attr(&links.open_url())) || html.contains(&links.open_url()) {
        return html.to_string();
    }

    let pixel = links.pixel_tag();
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => {
            let mut out = String::with_capacity(html.len() + pixel.len());
            out.push_str(&html[..idx]);
            out.push_str(&pixel);
            out.push_str(&html[idx..]);
            out
        }
        None => format!("{html}{pixel}"),
    }
}

/// Point every `<form>` at the submit endpoint, adding `action` where absent.
pub fn rewrite_form_actions(html: &str, links: &TrackingLinks) -> String {
    let submit = links.submit_url();
    rewrite_attribute(html, "form", "action", Some(&submit), |_| Some(submit.clone()))
}

/// Walk the start tags named `tag` and offer each `attr` value (entity
/// decoded) to `replace`. A returned value is written back double-quoted and
/// escaped. When `insert_missing` is set, tags lacking the attribute get it.
///
/// Everything else, including comments and quoted `>` characters, is copied
/// through byte for byte.
fn rewrite_attribute<F>(
    html: &str,
    tag: &str,
    attr: &str,
    insert_missing: Option<&str>,
    mut replace: F,
) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let bytes = html.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len + 256);
    let mut copied = 0;
    let mut i = 0;

    while let Some(offset) = html[i..].find('<') {
        let start = i + offset;

        if html[start..].starts_with("<!--") {
            i = html[start..].find("-->").map(|e| start + e + 3).unwrap_or(len);
            continue;
        }

        let name_start = start + 1;
        let name_end = html[name_start..]
            .find(|c: char| !c.is_ascii_alphanumeric())
            .map(|e| name_start + e)
            .unwrap_or(len);
        if name_end == name_start && !matches!(bytes.get(name_start), Some(b'/' | b'!')) {
            // A bare '<' in text.
            i = name_start;
            continue;
        }
        let is_target = name_end > name_start && html[name_start..name_end].eq_ignore_ascii_case(tag);
        let mut seen_attr = false;
        let mut j = name_end;

        loop {
            while j < len && (bytes[j].is_ascii_whitespace() || bytes[j] == b'/') {
                j += 1;
            }
            if j >= len || bytes[j] == b'>' {
                break;
            }

            let attr_start = j;
            while j < len && !bytes[j].is_ascii_whitespace() && !matches!(bytes[j], b'=' | b'>' | b'/') {
                j += 1;
            }
            if j == attr_start {
                // Stray '=' with no name.
                j += 1;
                continue;
            }
            let attr_name = &html[attr_start..j];
            let is_attr = is_target && attr_name.eq_ignore_ascii_case(attr);

            let mut k = j;
            while k < len && bytes[k].is_ascii_whitespace() {
                k += 1;
            }
            if k >= len || bytes[k] != b'=' {
                if is_attr {
                    seen_attr = true;
                }
                continue;
            }
            k += 1;
            while k < len && bytes[k].is_ascii_whitespace() {
                k += 1;
            }

            let (value_start, value_end, next) = match bytes.get(k) {
                Some(&q) if q == b'"' || q == b'\'' => {
                    let close = html[k + 1..]
                        .find(q as char)
                        .map(|e| k + 1 + e)
                        .unwrap_or(len);
                    (k + 1, close, (close + 1).min(len))
                }
                _ => {
                    let end = html[k..]
                        .find(|c: char| c.is_ascii_whitespace() || c == '>')
                        .map(|e| k + e)
                        .unwrap_or(len);
                    (k, end, end)
                }
            };

            if is_attr {
                seen_attr = true;
                if let Some(new_value) = replace(&decode_entities(&html[value_start..value_end])) {
                    out.push_str(&html[copied..attr_start]);
                    out.push_str(attr_name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(&new_value));
                    out.push('"');
                    copied = next;
                }
            }
            j = next;
        }

        if is_target && !seen_attr && j < len {
            if let Some(value) = insert_missing {
                out.push_str(&html[copied..j]);
                out.push(' ');
                out.push_str(attr);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
                copied = j;
            }
        }

        if j >= len {
            break;
        }
        i = j;
    }

    out.push_str(&html[copied..]);
    out
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

pub(crate) fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    fn links() -> TrackingLinks {
        TrackingLinks::new("https://track.example.org/", "abc123", 7, 3).unwrap()
    }

    fn hrefs(html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse("a[href]").unwrap();
        document
            .select(&selector)
            .filter_map(|a| a.value().attr("href"))
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_click_url_embeds_triple() {
        let url = Url::parse(&links().click_url("https://example.com/a?b=1&c=2")).unwrap();
        assert_eq!(url.path(), "/track/click");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("rid".to_string(), "abc123".to_string()),
                ("campaign".to_string(), "7".to_string()),
                ("page".to_string(), "3".to_string()),
                ("url".to_string(), "https://example.com/a?b=1&c=2".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoints_keep_base_path() {
        let links = TrackingLinks::new("https://example.org/phish", "tok", 1, 2).unwrap();
        assert_eq!(links.open_url(), "https://example.org/phish/track/open?rid=tok");
        assert_eq!(links.landing_url(), "https://example.org/phish/landing/2?rid=tok&campaign=1");
        assert!(links.is_tracking_url("https://example.org/phish/track/open?rid=tok"));
        assert!(!links.is_tracking_url("https://example.org/other"));
    }

    #[test]
    fn test_rewrite_links_routes_through_tracker() {
        let html = r#"<p><a href="https://example.com/one">One</a> <A HREF='https://example.com/two?x=1&amp;y=2' class="btn">Two</A> <a href="mailto:x@example.com">Mail</a></p>"#;
        let out = rewrite_links(html, &links());

        let found = hrefs(&out);
        assert_eq!(found.len(), 3);
        assert!(found[0].starts_with("https://track.example.org/track/click?rid=abc123"));
        let second = Url::parse(&found[1]).unwrap();
        let dest = second.query_pairs().find(|(k, _)| k == "url").unwrap().1.to_string();
        assert_eq!(dest, "https://example.com/two?x=1&y=2");
        assert_eq!(found[2], "mailto:x@example.com");
        assert!(out.contains(r#"class="btn""#));
    }

    #[test]
    fn test_rewrite_links_leaves_tracking_links() {
        let links = links();
        let landing = links.click_url(&links.landing_url());
        let html = format!(r#"<a href="{}">Go</a>"#, escape_attr(&landing));
        let out = rewrite_links(&html, &links);
        assert_eq!(hrefs(&out), vec![landing]);
    }

    #[test]
    fn test_rewrite_links_ignores_comments_and_quoted_brackets() {
        let html = r#"<!-- <a href="https://example.com/hidden"> --><a title="a > b" href="https://example.com/x">X</a>"#;
        let out = rewrite_links(html, &links());
        assert!(out.starts_with(r#"<!-- <a href="https://example.com/hidden"> -->"#));
        assert!(out.contains(r#"title="a > b""#));
        assert!(hrefs(&out)[0].contains("/track/click"));
    }

    #[test]
    fn test_rewrite_links_after_bare_less_than() {
        let html = r#"<p>Revenue Q1 < Q2 see <a href="https://example.com/report">report</a></p>"#;
        let out = rewrite_links(html, &links());
        assert!(out.starts_with("<p>Revenue Q1 < Q2 see <a href="));
        let found = hrefs(&out);
        assert_eq!(found.len(), 1);
        assert!(found[0].starts_with("https://track.example.org/track/click?rid=abc123"));
    }

    #[test]
    fn test_append_tracking_pixel_before_body_close() {
        let out = append_tracking_pixel("<html><body><p>Hi</p></BODY></html>", &links());
        let pixel_at = out.find("/track/open?rid=abc123").unwrap();
        let body_close = out.find("</BODY>").unwrap();
        assert!(pixel_at < body_close);

        // Already present: untouched.
        assert_eq!(append_tracking_pixel(&out, &links()), out);
    }

    #[test]
    fn test_append_tracking_pixel_without_body() {
        let out = append_tracking_pixel("<p>Hi</p>", &links());
        assert!(out.starts_with("<p>Hi</p><img"));
    }

    #[test]
    fn test_rewrite_form_actions() {
        let html = r#"<form method="post" action="/login"><input name="u"></form><form method=post><input name="p"></form>"#;
        let out = rewrite_form_actions(html, &links());

        let document = Html::parse_document(&out);
        let selector = Selector::parse("form").unwrap();
        let actions: Vec<_> = document
            .select(&selector)
            .map(|f| f.value().attr("action").unwrap_or_default().to_string())
            .collect();
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a == "https://track.example.org/track/submit?rid=abc123"));
    }
}
