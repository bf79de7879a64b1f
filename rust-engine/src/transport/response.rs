//! SMTP reply parsing.

use super::error::{Result, TransportError};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .map(|k| k.eq_ignore_ascii_case(keyword))
                .unwrap_or(false)
        })
    }

    /// SASL mechanisms listed on the `AUTH` extension line.
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                match words.next() {
                    Some(k) if k.eq_ignore_ascii_case("AUTH") => {
                        Some(words.map(|w| w.to_ascii_uppercase()).collect::<Vec<_>>())
                    }
                    _ => None,
                }
            })
            .flatten()
            .collect()
    }

    /// Parse one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// more data is needed.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut lines = Vec::new();
        let mut first_code = None;

        while let Some(newline) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + newline];
            consumed += newline + 1;

            let line = std::str::from_utf8(raw)?.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.len() < 3 {
                return Err(TransportError::Parse(format!("Reply line too short: '{line}'")));
            }

            let code = line
                .get(..3)
                .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse::<u16>().ok())
                .ok_or_else(|| TransportError::Parse(format!("Invalid status code: '{line}'")))?;

            if let Some(expected) = first_code {
                if expected != code {
                    return Err(TransportError::Parse(format!(
                        "Status code mismatch in multi-line reply: expected {expected}, got {code}"
                    )));
                }
            }
            first_code = Some(code);

            let is_last = match line.as_bytes().get(3) {
                None | Some(b' ') => true,
                Some(b'-') => false,
                Some(c) => {
                    return Err(TransportError::Parse(format!(
                        "Invalid separator character: '{}'",
                        *c as char
                    )))
                }
            };
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if is_last {
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line() {
        let (response, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response, Response::new(250, vec!["OK".to_string()]));
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_multi_line_ehlo() {
        let data = b"250-mail.example.com\r\n250-STARTTLS\r\n250-AUTH LOGIN PLAIN\r\n250 SIZE 10240000\r\nextra";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines.len(), 4);
        assert_eq!(consumed, data.len() - "extra".len());
        assert!(response.has_extension("starttls"));
        assert!(!response.has_extension("SMTPUTF8"));
        assert_eq!(response.auth_mechanisms(), vec!["LOGIN", "PLAIN"]);
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(Response::parse(b"250-mail.example.com\r\n250-SIZE").unwrap().is_none());
        assert!(Response::parse(b"").unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_mismatched_codes() {
        assert!(Response::parse(b"250-a\r\n251 b\r\n").is_err());
    }

    #[test]
    fn test_parse_rejects_non_ascii_code() {
        let err = Response::parse("1\u{20ac}\r\n".as_bytes()).unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));

        assert!(Response::parse(b"+25 OK\r\n").is_err());
    }

    #[test]
    fn test_is_success() {
        assert!(Response::new(235, vec![]).is_success());
        assert!(!Response::new(535, vec![]).is_success());
    }
}
