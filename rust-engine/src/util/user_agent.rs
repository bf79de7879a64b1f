//! User agent parsing for tracking events.
//!
//! Only the browser family, its major.minor version and the operating system
//! are extracted; the raw string is stored alongside for anything finer.

/// Browser and OS extracted from a user agent string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAgent {
    pub browser: String,
    pub os: String,
}

/// Browser tokens in match order. Chromium derivatives advertise `Chrome/`
/// and `Safari/` as well, so they must be tested first.
const BROWSER_TOKENS: &[(&str, &str)] = &[
    ("Edg/", "Edge"),
    ("EdgiOS/", "Edge"),
    ("OPR/", "Opera"),
    ("SamsungBrowser/", "Samsung Internet"),
    ("CriOS/", "Chrome"),
    ("FxiOS/", "Firefox"),
    ("Firefox/", "Firefox"),
    ("Chrome/", "Chrome"),
    ("Thunderbird/", "Thunderbird"),
    ("curl/", "curl"),
];

/// OS tokens in match order. iOS agents mention `Mac OS X` too.
const OS_TOKENS: &[(&str, &str)] = &[
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("Android", "Android"),
    ("Windows NT 10.0", "Windows 10"),
    ("Windows NT 6.3", "Windows 8.1"),
    ("Windows NT 6.1", "Windows 7"),
    ("Windows", "Windows"),
    ("CrOS", "Chrome OS"),
    ("Mac OS X", "macOS"),
    ("Linux", "Linux"),
];

pub fn parse_user_agent(raw: &str) -> ParsedAgent {
    ParsedAgent {
        browser: parse_browser(raw),
        os: parse_os(raw),
    }
}

fn parse_browser(raw: &str) -> String {
    for (token, name) in BROWSER_TOKENS {
        if let Some(version) = version_after(raw, token) {
            return format!("{name} {version}");
        }
    }

    // Safari reports its marketing version under `Version/`.
    if raw.contains("Safari/") {
        return match version_after(raw, "Version/") {
            Some(version) => format!("Safari {version}"),
            None => "Safari".to_string(),
        };
    }

    if raw.contains("Trident/") || raw.contains("MSIE ") {
        return "Internet Explorer".to_string();
    }

    "Unknown".to_string()
}

fn parse_os(raw: &str) -> String {
    OS_TOKENS
        .iter()
        .find(|(token, _)| raw.contains(token))
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Return the `major.minor` version following `token`, if present.
fn version_after<'a>(raw: &'a str, token: &str) -> Option<&'a str> {
    let start = raw.find(token)? + token.len();
    let rest = &raw[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let full = &rest[..end];
    if full.is_empty() {
        return None;
    }

    let cut = full
        .match_indices('.')
        .nth(1)
        .map(|(i, _)| i)
        .unwrap_or(full.len());
    Some(&full[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chrome_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let parsed = parse_user_agent(ua);
        assert_eq!(parsed.browser, "Chrome 120.0");
        assert_eq!(parsed.os, "Windows 10");
    }

    #[test]
    fn test_parse_firefox_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0";
        let parsed = parse_user_agent(ua);
        assert_eq!(parsed.browser, "Firefox 121.0");
        assert_eq!(parsed.os, "Windows 10");
    }

    #[test]
    fn test_parse_safari_macos() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15";
        let parsed = parse_user_agent(ua);
        assert_eq!(parsed.browser, "Safari 17.2");
        assert_eq!(parsed.os, "macOS");
    }

    #[test]
    fn test_parse_iphone() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1";
        let parsed = parse_user_agent(ua);
        assert_eq!(parsed.browser, "Safari 17.2");
        assert_eq!(parsed.os, "iOS");
    }

    #[test]
    fn test_parse_edge_before_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
        assert_eq!(parse_user_agent(ua).browser, "Edge 120.0");
    }

    #[test]
    fn test_parse_android() {
        let ua = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
        let parsed = parse_user_agent(ua);
        assert_eq!(parsed.browser, "Chrome 120.0");
        assert_eq!(parsed.os, "Android");
    }

    #[test]
    fn test_parse_unknown() {
        let parsed = parse_user_agent("");
        assert_eq!(parsed.browser, "Unknown");
        assert_eq!(parsed.os, "Unknown");
        assert_eq!(parse_user_agent("curl/8.4.0").browser, "curl 8.4");
    }
}
