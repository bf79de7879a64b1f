//! Engagement tracking: turn an inbound callback into at most one event.
//!
//! The correlator is independent of HTTP. The web layer extracts a
//! [`TrackRequest`] and maps the returned [`TrackOutcome`] to a response.

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::store::{CampaignStatus, EventKind, NewEvent, Store, StoreError, TrackedRecipient};
use crate::util::parse_user_agent;
use crate::util::token::is_well_formed;

/// Substrings that mark a form field as a password.
const PASSWORD_FIELD_MARKERS: &[&str] = &["pass", "pwd"];

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("missing recipient token")]
    MissingToken,

    #[error("unknown recipient token")]
    UnknownToken,

    #[error("invalid redirect target: {0}")]
    InvalidRedirect(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything the correlator needs from one callback.
#[derive(Debug, Default, Clone)]
pub struct TrackRequest {
    /// Path segment naming the event kind
    pub kind: String,
    pub token: Option<String>,
    /// Query parameters other than the token
    pub query: Vec<(String, String)>,
    /// Form fields of a POST body
    pub form: Vec<(String, String)>,
    pub ip: String,
    pub user_agent: String,
    pub referrer: Option<String>,
}

impl TrackRequest {
    fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// What the caller should answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Serve the 1x1 image
    Pixel,
    /// Redirect to this absolute URL
    Redirect(String),
    /// Acknowledge a report
    Reported,
    /// Empty success
    NoContent,
    /// Unrecognized kind; nothing recorded
    Ignored,
}

pub struct Correlator {
    store: Store,
    submit_redirect_url: String,
    redirect_allow_domains: Option<Vec<String>>,
}

impl Correlator {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            submit_redirect_url: config.submit_redirect_url.clone(),
            redirect_allow_domains: config
                .redirect_allow_domains
                .as_ref()
                .map(|domains| domains.iter().map(|d| d.to_ascii_lowercase()).collect()),
        }
    }

    /// Resolve the token, record the event once, and pick the response.
    pub async fn track(&self, request: &TrackRequest) -> Result<TrackOutcome, TrackError> {
        let Some(kind) = EventKind::from_path(&request.kind) else {
            debug!(kind = %request.kind, "track_unknown_kind");
            return Ok(TrackOutcome::Ignored);
        };

        let token = request
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(TrackError::MissingToken)?;

        let recipient = self.resolve(token).await?;

        let outcome = match kind {
            EventKind::Opened => TrackOutcome::Pixel,
            EventKind::Clicked => {
                let target = request.param("url").unwrap_or_default();
                TrackOutcome::Redirect(self.validate_redirect(target)?)
            }
            EventKind::Submitted => TrackOutcome::Redirect(
                recipient
                    .redirect_url
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or_else(|| self.submit_redirect_url.clone()),
            ),
            EventKind::Reported => TrackOutcome::Reported,
            EventKind::AttachmentClicked => TrackOutcome::NoContent,
        };

        let agent = parse_user_agent(&request.user_agent);
        let event = NewEvent {
            recipient_id: recipient.recipient_id,
            campaign_id: recipient.campaign_id,
            kind,
            ip: request.ip.clone(),
            user_agent: request.user_agent.clone(),
            browser: agent.browser,
            os: agent.os,
            metadata: build_metadata(request, &recipient),
        };

        let recorded = self.store.record_event(&event).await?;
        if recorded {
            info!(
                campaign_id = recipient.campaign_id,
                recipient_id = recipient.recipient_id,
                kind = kind.as_str(),
                ip = %request.ip,
                "event_recorded"
            );
        } else {
            debug!(
                campaign_id = recipient.campaign_id,
                recipient_id = recipient.recipient_id,
                kind = kind.as_str(),
                "event_duplicate"
            );
        }

        Ok(outcome)
    }

    /// Look up a live recipient. Completed campaigns no longer resolve.
    pub async fn resolve(&self, token: &str) -> Result<TrackedRecipient, TrackError> {
        if !is_well_formed(token) {
            return Err(TrackError::UnknownToken);
        }
        match self.store.find_tracked_recipient(token).await? {
            Some(r) if r.campaign_status != CampaignStatus::Completed => Ok(r),
            Some(r) => {
                debug!(campaign_id = r.campaign_id, "track_campaign_completed");
                Err(TrackError::UnknownToken)
            }
            None => Err(TrackError::UnknownToken),
        }
    }

    /// Accept absolute http(s) targets, restricted to the allow-list if set.
    fn validate_redirect(&self, target: &str) -> Result<String, TrackError> {
        let parsed = Url::parse(target.trim())
            .map_err(|_| TrackError::InvalidRedirect(target.to_string()))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TrackError::InvalidRedirect(target.to_string()));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| TrackError::InvalidRedirect(target.to_string()))?
            .to_ascii_lowercase();

        if let Some(allowed) = &self.redirect_allow_domains {
            let permitted = allowed
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")));
            if !permitted {
                warn!(host = %host, "track_redirect_not_allowed");
                return Err(TrackError::InvalidRedirect(target.to_string()));
            }
        }

        Ok(parsed.to_string())
    }
}

/// Event metadata: query, referrer and the form fields the page may keep.
fn build_metadata(request: &TrackRequest, recipient: &TrackedRecipient) -> Value {
    let form: Vec<&(String, String)> = if recipient.capture_credentials {
        request
            .form
            .iter()
            .filter(|(k, _)| recipient.capture_passwords || !is_password_field(k))
            .collect()
    } else {
        Vec::new()
    };

    json!({
        "query": group_values(request.query.iter()),
        "form": group_values(form.into_iter()),
        "referrer": request.referrer,
    })
}

/// `{key: [values...]}`, keeping repeated keys.
fn group_values<'a>(pairs: impl Iterator<Item = &'a (String, String)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        let entry = map.entry(key.clone()).or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.clone()));
        }
    }
    Value::Object(map)
}

fn is_password_field(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    PASSWORD_FIELD_MARKERS.iter().any(|m| name.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{file_store, seed_campaign};
    use crate::store::{Member, Recipient};
    use chrono::Utc;
    use std::sync::Arc;

    async fn setup(config: &Config) -> (Store, Correlator, Recipient) {
        setup_on(Store::in_memory().await.unwrap(), config).await
    }

    async fn setup_on(store: Store, config: &Config) -> (Store, Correlator, Recipient) {
        let seeded = seed_campaign(&store, 1, Utc::now()).await;
        let members: Vec<Member> = seeded.group.members.clone();
        let recipients = store
            .create_recipients(seeded.campaign_id, &members, &[Utc::now()], crate::util::mint_token)
            .await
            .unwrap();
        let correlator = Correlator::new(store.clone(), config);
        (store, correlator, recipients[0].clone())
    }

    fn request(kind: &str, token: &str) -> TrackRequest {
        TrackRequest {
            kind: kind.to_string(),
            token: Some(token.to_string()),
            ip: "203.0.113.9".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_records_once() {
        let (store, correlator, recipient) = setup(&Config::default()).await;

        let outcome = correlator.track(&request("open", &recipient.token)).await.unwrap();
        assert_eq!(outcome, TrackOutcome::Pixel);
        correlator.track(&request("open", &recipient.token)).await.unwrap();

        let events = store.events_for_recipient(recipient.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Opened);
        assert_eq!(events[0].ip, "203.0.113.9");
        assert_eq!(events[0].browser, "Chrome 120.0");
        assert_eq!(events[0].os, "Windows 10");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_create_one_event() {
        let (store, _dir) = file_store().await;
        let (store, correlator, recipient) = setup_on(store, &Config::default()).await;
        let correlator = Arc::new(correlator);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                let req = request("opened", &recipient.token);
                tokio::spawn(async move { correlator.track(&req).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), TrackOutcome::Pixel);
        }

        let events = store.events_for_recipient(recipient.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_click_redirects_and_records() {
        let (store, correlator, recipient) = setup(&Config::default()).await;

        let mut req = request("click", &recipient.token);
        req.query = vec![("url".to_string(), "https://portal.example.com/reset".to_string())];

        let outcome = correlator.track(&req).await.unwrap();
        assert_eq!(outcome, TrackOutcome::Redirect("https://portal.example.com/reset".to_string()));

        let events = store.events_for_recipient(recipient.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Clicked);
        let metadata: Value = serde_json::from_str(&events[0].metadata).unwrap();
        assert_eq!(metadata["query"]["url"][0], "https://portal.example.com/reset");
    }

    #[tokio::test]
    async fn test_click_rejects_bad_targets_without_recording() {
        let (store, correlator, recipient) = setup(&Config::default()).await;

        for target in ["", "javascript:alert(1)", "/relative", "ftp://example.com/file"] {
            let mut req = request("click", &recipient.token);
            req.query = vec![("url".to_string(), target.to_string())];
            let err = correlator.track(&req).await.unwrap_err();
            assert!(matches!(err, TrackError::InvalidRedirect(_)), "{target}");
        }

        assert!(store.events_for_recipient(recipient.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_click_allow_list() {
        let config = Config {
            redirect_allow_domains: Some(vec!["Example.com".to_string()]),
            ..Default::default()
        };
        let (_store, correlator, recipient) = setup(&config).await;

        let mut req = request("click", &recipient.token);
        req.query = vec![("url".to_string(), "https://intranet.example.com/".to_string())];
        assert!(correlator.track(&req).await.is_ok());

        req.query = vec![("url".to_string(), "https://evil.test/".to_string())];
        assert!(matches!(correlator.track(&req).await, Err(TrackError::InvalidRedirect(_))));

        req.query = vec![("url".to_string(), "https://notexample.com/".to_string())];
        assert!(matches!(correlator.track(&req).await, Err(TrackError::InvalidRedirect(_))));
    }

    #[tokio::test]
    async fn test_submit_drops_passwords() {
        let config = Config {
            submit_redirect_url: "https://intranet.example.com/done".to_string(),
            ..Default::default()
        };
        let (store, correlator, recipient) = setup(&config).await;

        let mut req = request("submit", &recipient.token);
        req.form = vec![
            ("username".to_string(), "alice".to_string()),
            ("Password".to_string(), "hunter2".to_string()),
        ];

        let outcome = correlator.track(&req).await.unwrap();
        assert_eq!(outcome, TrackOutcome::Redirect("https://intranet.example.com/done".to_string()));

        let events = store.events_for_recipient(recipient.id).await.unwrap();
        let metadata: Value = serde_json::from_str(&events[0].metadata).unwrap();
        assert_eq!(metadata["form"]["username"][0], "alice");
        assert!(metadata["form"].get("Password").is_none());
    }

    #[tokio::test]
    async fn test_submit_without_capture_keeps_no_fields() {
        let (store, correlator, recipient) = setup(&Config::default()).await;
        sqlx::query("UPDATE pages SET capture_credentials = 0, redirect_url = 'https://sso.example.com/'")
            .execute(store.pool())
            .await
            .unwrap();

        let mut req = request("submitted", &recipient.token);
        req.form = vec![("username".to_string(), "alice".to_string())];

        let outcome = correlator.track(&req).await.unwrap();
        assert_eq!(outcome, TrackOutcome::Redirect("https://sso.example.com/".to_string()));

        let events = store.events_for_recipient(recipient.id).await.unwrap();
        let metadata: Value = serde_json::from_str(&events[0].metadata).unwrap();
        assert_eq!(metadata["form"], json!({}));
    }

    #[tokio::test]
    async fn test_token_errors() {
        let (store, correlator, recipient) = setup(&Config::default()).await;

        let mut req = request("open", "");
        req.token = None;
        assert!(matches!(correlator.track(&req).await, Err(TrackError::MissingToken)));

        assert!(matches!(
            correlator.track(&request("open", "deadbeef")).await,
            Err(TrackError::UnknownToken)
        ));

        sqlx::query("UPDATE campaigns SET status = 'completed'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            correlator.track(&request("open", &recipient.token)).await,
            Err(TrackError::UnknownToken)
        ));
    }

    #[tokio::test]
    async fn test_other_kinds() {
        let (store, correlator, recipient) = setup(&Config::default()).await;

        assert_eq!(correlator.track(&request("report", &recipient.token)).await.unwrap(), TrackOutcome::Reported);
        assert_eq!(
            correlator.track(&request("attachment", &recipient.token)).await.unwrap(),
            TrackOutcome::NoContent
        );
        assert_eq!(correlator.track(&request("bogus", &recipient.token)).await.unwrap(), TrackOutcome::Ignored);

        let kinds: Vec<_> = store
            .events_for_recipient(recipient.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Reported, EventKind::AttachmentClicked]);
    }

    #[test]
    fn test_is_password_field() {
        assert!(is_password_field("password"));
        assert!(is_password_field("user_pwd"));
        assert!(is_password_field("Passcode"));
        assert!(!is_password_field("username"));
    }
}
