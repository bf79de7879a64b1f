//! RFC 5322 message assembly.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::store::ProfileHeader;

/// Value of the `X-Mailer` header on every message.
pub const MAILER: &str = "lure";

/// A fully rendered message ready for submission.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Address used in MAIL FROM
    pub envelope_from: String,
    /// Address used in RCPT TO
    pub recipient: String,
    /// Complete message with headers, CRLF line endings
    pub data: String,
}

/// Builder for a single-recipient message.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    from: String,
    to: String,
    subject: String,
    text: Option<String>,
    html: Option<String>,
    headers: Vec<ProfileHeader>,
}

impl MessageBuilder {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            ..Default::default()
        }
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = subject.to_string();
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = (!text.trim().is_empty()).then(|| text.to_string());
        self
    }

    pub fn html(mut self, html: &str) -> Self {
        self.html = (!html.trim().is_empty()).then(|| html.to_string());
        self
    }

    pub fn headers(mut self, headers: &[ProfileHeader]) -> Self {
        self.headers = headers.to_vec();
        self
    }

    pub fn build(self) -> String {
        let mut out = String::new();
        push_header(&mut out, "From", &self.from);
        push_header(&mut out, "To", &self.to);
        push_header(&mut out, "Subject", &encode_word(&self.subject));
        push_header(&mut out, "Date", &Utc::now().to_rfc2822());
        push_header(&mut out, "Message-ID", &message_id(&self.from));
        push_header(&mut out, "MIME-Version", "1.0");
        push_header(&mut out, "X-Mailer", MAILER);
        for header in &self.headers {
            if is_valid_header_name(&header.key) {
                push_header(&mut out, &header.key, &header.value);
            }
        }

        match (self.text, self.html) {
            (Some(text), Some(html)) => {
                let boundary = random_hex(12);
                push_header(
                    &mut out,
                    "Content-Type",
                    &format!("multipart/alternative; boundary=\"{boundary}\""),
                );
                out.push_str("\r\n");
                push_part(&mut out, &boundary, "text/plain", &text);
                push_part(&mut out, &boundary, "text/html", &html);
                out.push_str(&format!("--{boundary}--\r\n"));
            }
            (text, html) => {
                let (content_type, body) = match (text, html) {
                    (_, Some(html)) => ("text/html", html),
                    (Some(text), None) => ("text/plain", text),
                    (None, None) => ("text/plain", String::new()),
                };
                push_header(&mut out, "Content-Type", &format!("{content_type}; charset=UTF-8"));
                push_header(&mut out, "Content-Transfer-Encoding", "base64");
                out.push_str("\r\n");
                push_base64(&mut out, &body);
            }
        }

        out
    }
}

/// Bare address from a display form like `IT Support <it@example.com>`.
pub fn extract_address(value: &str) -> String {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_string(),
        _ => value.trim().to_string(),
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    // Header values come from templates and target data; never let them
    // start a new header line.
    let value: String = value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value);
    out.push_str("\r\n");
}

fn push_part(out: &mut String, boundary: &str, content_type: &str, body: &str) {
    out.push_str(&format!("--{boundary}\r\n"));
    push_header(out, "Content-Type", &format!("{content_type}; charset=UTF-8"));
    push_header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");
    push_base64(out, body);
}

fn push_base64(out: &mut String, body: &str) {
    let encoded = BASE64.encode(body.as_bytes());
    for chunk in encoded.as_bytes().chunks(76) {
        // Base64 output is ASCII.
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push_str("\r\n");
    }
}

/// RFC 2047 encoded-word for non-ASCII header text.
fn encode_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
    }
}

fn message_id(from: &str) -> String {
    let address = extract_address(from);
    let domain = address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", random_hex(16), domain)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}
