//! SQLite-backed store.
//!
//! Every cross-task guarantee lives here rather than in process memory:
//! - campaigns are claimed with a conditional `UPDATE ... WHERE status = 'draft'`
//! - recipient tokens are unique and `(campaign_id, member_id)` pairs are unique
//! - at most one event exists per `(recipient_id, kind)`

pub mod types;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use types::{
    Campaign, CampaignStatus, EmailTemplate, Event, EventKind, Group, LandingPage,
    LoadedCampaign, Member, NewEvent, ProfileHeader, Recipient, RecipientStatus,
    SendingProfile, TrackedRecipient,
};

/// Attempts at inserting a recipient before giving up on token collisions.
const TOKEN_ATTEMPTS: usize = 3;

const RECIPIENT_COLUMNS: &str = "id, campaign_id, member_id, token, email, first_name, \
     last_name, position, status, error, send_date, modified_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("could not mint a unique token for member {member_id}")]
    TokenExhausted { member_id: i64 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Cloneable handle over the connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        info!(url = %url, "store_connected");
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection keeps every caller on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Scheduler
    // =========================================================================

    /// Draft campaigns whose launch date has passed, with associations loaded.
    ///
    /// A campaign whose associations are missing is logged and left in draft.
    pub async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<LoadedCampaign>> {
        let campaigns: Vec<Campaign> = sqlx::query_as(
            "SELECT * FROM campaigns \
             WHERE status = 'draft' AND julianday(launch_date) <= julianday(?) \
             ORDER BY launch_date, id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            match self.load_associations(campaign).await {
                Ok(c) => loaded.push(c),
                Err(StoreError::NotFound { entity, id }) => {
                    warn!(entity = entity, id = id, "campaign_association_missing");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(loaded)
    }

    async fn load_associations(&self, campaign: Campaign) -> Result<LoadedCampaign> {
        let group = self.load_group(campaign.group_id).await?;

        let template: EmailTemplate = sqlx::query_as("SELECT * FROM templates WHERE id = ?")
            .bind(campaign.template_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "template", id: campaign.template_id })?;

        let page = self
            .load_page(campaign.page_id)
            .await?
            .ok_or(StoreError::NotFound { entity: "page", id: campaign.page_id })?;

        let profile: SendingProfile = sqlx::query_as("SELECT * FROM smtp_profiles WHERE id = ?")
            .bind(campaign.smtp_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound { entity: "sending profile", id: campaign.smtp_id })?;

        Ok(LoadedCampaign { campaign, group, template, page, profile })
    }

    async fn load_group(&self, id: i64) -> Result<Group> {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let name = name.ok_or(StoreError::NotFound { entity: "group", id })?;

        let members: Vec<Member> =
            sqlx::query_as("SELECT * FROM members WHERE group_id = ? ORDER BY id")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Group { id, name, members })
    }

    /// Atomically move a campaign from draft to scheduled.
    ///
    /// Returns `false` when another tick already claimed it.
    pub async fn claim_campaign(&self, id: i64) -> Result<bool> {
        self.advance_campaign(id, CampaignStatus::Draft, CampaignStatus::Scheduled)
            .await
    }

    /// Mark a claimed campaign as sent once its fan-out is submitted.
    pub async fn mark_campaign_sent(&self, id: i64) -> Result<bool> {
        self.advance_campaign(id, CampaignStatus::Scheduled, CampaignStatus::Sent)
            .await
    }

    /// Return a claimed campaign to draft so a later tick can retry it.
    ///
    /// Only applies while no recipient rows exist for the campaign; once
    /// fan-out has been recorded the claim stands.
    pub async fn release_claim(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'draft', modified_at = ? \
             WHERE id = ? AND status = 'scheduled' \
             AND NOT EXISTS (SELECT 1 FROM recipients WHERE campaign_id = ?)",
        )
        .bind(Utc::now())
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() == 1;
        debug!(campaign_id = id, released = released, "campaign_claim_release");
        Ok(released)
    }

    /// Move scheduled campaigns that already have recipients to sent.
    ///
    /// Picks up campaigns whose fan-out was submitted but whose final status
    /// update failed.
    pub async fn settle_dispatched_campaigns(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE campaigns SET status = 'sent', modified_at = ? \
             WHERE status = 'scheduled' \
             AND EXISTS (SELECT 1 FROM recipients WHERE campaign_id = campaigns.id) \
             RETURNING id",
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            info!(campaigns = ?ids, "campaigns_settled_as_sent");
        }
        Ok(ids)
    }

    async fn advance_campaign(
        &self,
        id: i64,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = ?, modified_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        let advanced = result.rows_affected() == 1;
        debug!(campaign_id = id, from = ?from, to = ?to, advanced = advanced, "campaign_status_update");
        Ok(advanced)
    }

    pub async fn campaign(&self, id: i64) -> Result<Option<Campaign>> {
        Ok(sqlx::query_as("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // =========================================================================
    // Recipients
    // =========================================================================

    /// Create one pending recipient per member inside a single transaction.
    ///
    /// `mint` supplies tokens; a token collision is retried with a fresh one.
    /// Members that already have a recipient for this campaign are skipped.
    /// `send_dates` gives the planned send time for each member, by position.
    pub async fn create_recipients<F>(
        &self,
        campaign_id: i64,
        members: &[Member],
        send_dates: &[DateTime<Utc>],
        mint: F,
    ) -> Result<Vec<Recipient>>
    where
        F: Fn() -> String,
    {
        let sql = format!(
            "INSERT INTO recipients \
             (campaign_id, member_id, token, email, first_name, last_name, position, status, send_date) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?) \
             ON CONFLICT (campaign_id, member_id) DO NOTHING \
             RETURNING {RECIPIENT_COLUMNS}"
        );

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(members.len());

        for (idx, member) in members.iter().enumerate() {
            let send_date = send_dates.get(idx).copied().unwrap_or_else(Utc::now);
            let mut inserted = None;

            for attempt in 0..TOKEN_ATTEMPTS {
                let outcome = sqlx::query_as::<_, Recipient>(&sql)
                    .bind(campaign_id)
                    .bind(member.id)
                    .bind(mint())
                    .bind(&member.email)
                    .bind(&member.first_name)
                    .bind(&member.last_name)
                    .bind(&member.position)
                    .bind(send_date)
                    .fetch_optional(&mut *tx)
                    .await;

                match outcome {
                    Ok(row) => {
                        inserted = Some(row);
                        break;
                    }
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                        warn!(campaign_id = campaign_id, member_id = member.id, attempt = attempt, "recipient_token_collision");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            match inserted {
                Some(Some(recipient)) => created.push(recipient),
                Some(None) => {
                    debug!(campaign_id = campaign_id, member_id = member.id, "recipient_already_exists");
                }
                None => return Err(StoreError::TokenExhausted { member_id: member.id }),
            }
        }

        tx.commit().await?;
        Ok(created)
    }

    pub async fn mark_recipient_sent(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE recipients SET status = 'sent', error = NULL, modified_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_recipient_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE recipients SET status = 'failed', error = ?, modified_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recipients_for_campaign(&self, campaign_id: i64) -> Result<Vec<Recipient>> {
        let sql = format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE campaign_id = ? ORDER BY id");
        Ok(sqlx::query_as(&sql)
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?)
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    /// Resolve a token to its recipient, campaign state and page settings.
    pub async fn find_tracked_recipient(&self, token: &str) -> Result<Option<TrackedRecipient>> {
        Ok(sqlx::query_as(
            "SELECT r.id AS recipient_id, r.campaign_id, r.email, \
                    c.status AS campaign_status, c.page_id, \
                    p.capture_credentials, p.capture_passwords, p.redirect_url \
             FROM recipients r \
             JOIN campaigns c ON c.id = r.campaign_id \
             JOIN pages p ON p.id = c.page_id \
             WHERE r.token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Insert the event unless one of the same kind already exists for the
    /// recipient. Returns `true` when a row was created.
    pub async fn record_event(&self, event: &NewEvent) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO events \
             (recipient_id, campaign_id, kind, timestamp, ip, user_agent, browser, os, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (recipient_id, kind) DO NOTHING",
        )
        .bind(event.recipient_id)
        .bind(event.campaign_id)
        .bind(event.kind)
        .bind(Utc::now())
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.browser)
        .bind(&event.os)
        .bind(event.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn events_for_recipient(&self, recipient_id: i64) -> Result<Vec<Event>> {
        Ok(sqlx::query_as("SELECT * FROM events WHERE recipient_id = ? ORDER BY id")
            .bind(recipient_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn load_page(&self, id: i64) -> Result<Option<LandingPage>> {
        Ok(sqlx::query_as("SELECT * FROM pages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // =========================================================================
    // Collaborator Inserts
    // =========================================================================

    /// Insert a group and its members, returning it with ids filled in.
    pub async fn insert_group(&self, name: &str, members: &[Member]) -> Result<Group> {
        let mut tx = self.pool.begin().await?;

        let group_id = sqlx::query("INSERT INTO groups (name, modified_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for member in members {
            sqlx::query(
                "INSERT INTO members (group_id, email, first_name, last_name, position) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(group_id)
            .bind(&member.email)
            .bind(&member.first_name)
            .bind(&member.last_name)
            .bind(&member.position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.load_group(group_id).await
    }

    pub async fn insert_template(&self, template: &EmailTemplate) -> Result<i64> {
        Ok(sqlx::query(
            "INSERT INTO templates (name, subject, html, text, envelope_sender) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.html)
        .bind(&template.text)
        .bind(&template.envelope_sender)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    pub async fn insert_page(&self, page: &LandingPage) -> Result<i64> {
        Ok(sqlx::query(
            "INSERT INTO pages (name, html, capture_credentials, capture_passwords, redirect_url) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&page.name)
        .bind(&page.html)
        .bind(page.capture_credentials)
        .bind(page.capture_passwords)
        .bind(&page.redirect_url)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    pub async fn insert_profile(&self, profile: &SendingProfile) -> Result<i64> {
        Ok(sqlx::query(
            "INSERT INTO smtp_profiles \
             (name, host, from_address, username, password, ignore_cert_errors, max_concurrency, headers) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.name)
        .bind(&profile.host)
        .bind(&profile.from_address)
        .bind(&profile.username)
        .bind(&profile.password)
        .bind(profile.ignore_cert_errors)
        .bind(profile.max_concurrency)
        .bind(sqlx::types::Json(&profile.headers))
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }

    /// Insert a campaign in draft status.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_campaign(
        &self,
        name: &str,
        launch_date: DateTime<Utc>,
        send_by_date: Option<DateTime<Utc>>,
        group_id: i64,
        template_id: i64,
        page_id: i64,
        smtp_id: i64,
    ) -> Result<i64> {
        let now = Utc::now();
        Ok(sqlx::query(
            "INSERT INTO campaigns \
             (name, status, launch_date, send_by_date, group_id, template_id, page_id, smtp_id, created_at, modified_at) \
             VALUES (?, 'draft', ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(launch_date)
        .bind(send_by_date)
        .bind(group_id)
        .bind(template_id)
        .bind(page_id)
        .bind(smtp_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid())
    }
}
