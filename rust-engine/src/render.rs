//! Per-recipient email rendering.
//!
//! Templates use `{{.Name}}` placeholders. HTML bodies then go through the
//! link rewriter and get an open pixel.

use crate::html::rewriter::escape_attr;
use crate::html::{append_tracking_pixel, rewrite_links, TrackingLinks};
use crate::store::{EmailTemplate, Recipient};

/// Subject and bodies for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Values available to placeholders.
pub struct RenderContext<'a> {
    pub recipient: &'a Recipient,
    pub from: &'a str,
    pub links: &'a TrackingLinks,
}

impl RenderContext<'_> {
    fn lookup(&self, name: &str, html: bool) -> Option<String> {
        let value = match name {
            ".FirstName" => self.recipient.first_name.clone(),
            ".LastName" => self.recipient.last_name.clone(),
            ".Email" => self.recipient.email.clone(),
            ".Position" => self.recipient.position.clone(),
            ".From" => self.from.to_string(),
            ".RId" => self.links.token().to_string(),
            ".URL" => self.links.click_url(&self.links.landing_url()),
            ".TrackingURL" => self.links.open_url(),
            ".ReportURL" => self.links.report_url(),
            ".Tracker" if html => return Some(self.links.pixel_tag()),
            ".Tracker" => String::new(),
            _ => return None,
        };
        Some(if html { escape_attr(&value) } else { value })
    }
}

pub fn render_email(template: &EmailTemplate, ctx: &RenderContext<'_>) -> RenderedEmail {
    let html = if template.html.trim().is_empty() {
        String::new()
    } else {
        let substituted = substitute(&template.html, ctx, true);
        append_tracking_pixel(&rewrite_links(&substituted, ctx.links), ctx.links)
    };

    RenderedEmail {
        subject: substitute(&template.subject, ctx, false),
        html,
        text: substitute(&template.text, ctx, false),
    }
}

/// Replace known `{{ .Name }}` placeholders; unknown ones are left as written.
fn substitute(input: &str, ctx: &RenderContext<'_>, html: bool) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match ctx.lookup(name, html) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[open..open + 2 + close + 2]),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecipientStatus;
    use chrono::Utc;

    fn recipient() -> Recipient {
        Recipient {
            id: 1,
            campaign_id: 7,
            member_id: 1,
            token: "abc123".to_string(),
            email: "alice@example.com".to_string(),
            first_name: "Alice".to_string(),
            last_name: "O'Hara & Co".to_string(),
            position: "Finance".to_string(),
            status: RecipientStatus::Pending,
            error: None,
            send_date: Utc::now(),
            modified_at: None,
        }
    }

    fn links() -> TrackingLinks {
        TrackingLinks::new("https://track.example.org", "abc123", 7, 3).unwrap()
    }

    #[test]
    fn test_substitute_placeholders() {
        let recipient = recipient();
        let links = links();
        let ctx = RenderContext { recipient: &recipient, from: "it@example.com", links: &links };

        assert_eq!(
            substitute("Hi {{.FirstName}} ({{ .Email }}) {{.Unknown}} {{", &ctx, false),
            "Hi Alice (alice@example.com) {{.Unknown}} {{"
        );
        assert_eq!(substitute("{{.LastName}}", &ctx, true), "O'Hara &amp; Co");
        assert_eq!(substitute("{{.Tracker}}", &ctx, false), "");
        assert_eq!(
            substitute("{{.ReportURL}}", &ctx, false),
            "https://track.example.org/track/report?rid=abc123"
        );
    }

    #[test]
    fn test_render_email_tracks_everything() {
        let recipient = recipient();
        let links = links();
        let ctx = RenderContext { recipient: &recipient, from: "it@example.com", links: &links };
        let template = EmailTemplate {
            subject: "Payroll update for {{.FirstName}}".to_string(),
            html: r#"<html><body><a href="{{.URL}}">Portal</a> <a href="https://example.com/news">News</a></body></html>"#.to_string(),
            text: "Log in at {{.URL}}".to_string(),
            ..Default::default()
        };

        let rendered = render_email(&template, &ctx);
        assert_eq!(rendered.subject, "Payroll update for Alice");

        let links_out = crate::html::extract_links(&rendered.html);
        assert_eq!(links_out.len(), 2);
        assert!(links_out.iter().all(|l| l.starts_with("https://track.example.org/track/click?rid=abc123")));
        // The landing link is not wrapped twice.
        assert_eq!(links_out[0], links.click_url(&links.landing_url()));
        assert!(rendered.html.contains("/track/open?rid=abc123"));
        assert!(rendered.text.contains("/track/click?rid=abc123"));
    }

    #[test]
    fn test_render_email_with_explicit_tracker() {
        let recipient = recipient();
        let links = links();
        let ctx = RenderContext { recipient: &recipient, from: "it@example.com", links: &links };
        let template = EmailTemplate {
            html: "<p>Hello</p>{{.Tracker}}".to_string(),
            ..Default::default()
        };

        let rendered = render_email(&template, &ctx);
        assert_eq!(rendered.html.matches("/track/open?rid=abc123").count(), 1);
    }

    #[test]
    fn test_render_email_text_only() {
        let recipient = recipient();
        let links = links();
        let ctx = RenderContext { recipient: &recipient, from: "it@example.com", links: &links };
        let template = EmailTemplate {
            text: "Plain {{.Position}}".to_string(),
            ..Default::default()
        };

        let rendered = render_email(&template, &ctx);
        assert!(rendered.html.is_empty());
        assert_eq!(rendered.text, "Plain Finance");
    }
}
