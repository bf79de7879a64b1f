//! Row types shared by the store, the dispatcher and the tracking server.
//!
//! Campaigns, groups, templates, landing pages and sending profiles belong to
//! the admin layer; recipients and events are written by this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle of a campaign. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sent,
    InProgress,
    Completed,
}

/// Delivery state of a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

/// Trackable recipient actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Opened,
    Clicked,
    Submitted,
    Reported,
    AttachmentClicked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
            EventKind::Submitted => "submitted",
            EventKind::Reported => "reported",
            EventKind::AttachmentClicked => "attachment_clicked",
        }
    }

    /// Map a callback path segment to an event kind.
    ///
    /// Both the verb (`open`) and the past tense (`opened`) are accepted.
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "open" | "opened" => Some(EventKind::Opened),
            "click" | "clicked" => Some(EventKind::Clicked),
            "submit" | "submitted" => Some(EventKind::Submitted),
            "report" | "reported" => Some(EventKind::Reported),
            "attachment" | "attachment_clicked" => Some(EventKind::AttachmentClicked),
            _ => None,
        }
    }
}

// =============================================================================
// Collaborator Rows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub status: CampaignStatus,
    pub launch_date: DateTime<Utc>,
    pub send_by_date: Option<DateTime<Utc>>,
    pub group_id: i64,
    pub template_id: i64,
    pub page_id: i64,
    pub smtp_id: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A target inside a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct Member {
    pub id: i64,
    pub group_id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
}

impl Member {
    pub fn new(email: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailTemplate {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Overrides the profile's envelope sender in MAIL FROM
    pub envelope_sender: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct LandingPage {
    pub id: i64,
    pub name: String,
    pub html: String,
    pub capture_credentials: bool,
    pub capture_passwords: bool,
    pub redirect_url: Option<String>,
}

/// Extra header added to every message sent through a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileHeader {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct SendingProfile {
    pub id: i64,
    pub name: String,
    /// SMTP submission endpoint as `host:port`
    pub host: String,
    /// RFC 5322 From value, e.g. `IT Support <it@example.com>`
    pub from_address: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ignore_cert_errors: bool,
    pub max_concurrency: Option<i64>,
    #[sqlx(json)]
    pub headers: Vec<ProfileHeader>,
}

/// A campaign with everything dispatch needs already loaded.
#[derive(Debug, Clone)]
pub struct LoadedCampaign {
    pub campaign: Campaign,
    pub group: Group,
    pub template: EmailTemplate,
    pub page: LandingPage,
    pub profile: SendingProfile,
}

// =============================================================================
// Engine Rows
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: i64,
    pub campaign_id: i64,
    pub member_id: i64,
    pub token: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    pub status: RecipientStatus,
    pub error: Option<String>,
    pub send_date: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// What a tracking callback needs to know about the token it carries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackedRecipient {
    pub recipient_id: i64,
    pub campaign_id: i64,
    pub email: String,
    pub campaign_status: CampaignStatus,
    pub page_id: i64,
    pub capture_credentials: bool,
    pub capture_passwords: bool,
    pub redirect_url: Option<String>,
}

/// Event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub recipient_id: i64,
    pub campaign_id: i64,
    pub kind: EventKind,
    pub ip: String,
    pub user_agent: String,
    pub browser: String,
    pub os: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub recipient_id: i64,
    pub campaign_id: i64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub browser: String,
    pub os: String,
    pub metadata: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_path() {
        assert_eq!(EventKind::from_path("open"), Some(EventKind::Opened));
        assert_eq!(EventKind::from_path("Clicked"), Some(EventKind::Clicked));
        assert_eq!(EventKind::from_path("submit"), Some(EventKind::Submitted));
        assert_eq!(EventKind::from_path("report"), Some(EventKind::Reported));
        assert_eq!(
            EventKind::from_path("attachment"),
            Some(EventKind::AttachmentClicked)
        );
        assert_eq!(EventKind::from_path("favicon.ico"), None);
    }

    #[test]
    fn test_event_kind_serialization() {
        let json = serde_json::to_string(&EventKind::AttachmentClicked).unwrap();
        assert_eq!(json, r#""attachment_clicked""#);
        assert_eq!(EventKind::AttachmentClicked.as_str(), "attachment_clicked");
    }

    #[test]
    fn test_campaign_status_deserialization() {
        let status: CampaignStatus = serde_json::from_str(r#""in_progress""#).unwrap();
        assert_eq!(status, CampaignStatus::InProgress);
    }
}
