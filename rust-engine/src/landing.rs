//! Landing page gatekeeper.
//!
//! A token may only open the landing page of its own campaign. Forms in the
//! served page are pointed at the submit endpoint for that token.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::html::{count_forms, rewrite_form_actions, TrackingLinks};
use crate::store::{CampaignStatus, Store, StoreError};
use crate::util::token::is_well_formed;

#[derive(Error, Debug)]
pub enum LandingError {
    #[error("missing recipient token")]
    MissingToken,

    #[error("unknown recipient token")]
    UnknownToken,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("invalid tracking base URL: {0}")]
    BaseUrl(#[from] url::ParseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Gatekeeper {
    store: Store,
    base_url: String,
}

impl Gatekeeper {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            base_url: config.phish_base_url.clone(),
        }
    }

    /// HTML for `page_id` as seen by the holder of `token`.
    ///
    /// `campaign`, when present, must name the token's campaign.
    pub async fn serve(
        &self,
        page_id: i64,
        token: Option<&str>,
        campaign: Option<&str>,
    ) -> Result<String, LandingError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(LandingError::MissingToken)?;

        if !is_well_formed(token) {
            return Err(LandingError::UnknownToken);
        }

        let recipient = match self.store.find_tracked_recipient(token).await? {
            Some(r) if r.campaign_status != CampaignStatus::Completed => r,
            _ => return Err(LandingError::UnknownToken),
        };

        if let Some(requested) = campaign.map(str::trim).filter(|c| !c.is_empty()) {
            if requested.parse::<i64>().ok() != Some(recipient.campaign_id) {
                warn!(
                    recipient_id = recipient.recipient_id,
                    campaign_id = recipient.campaign_id,
                    requested_campaign = %requested,
                    "landing_campaign_mismatch"
                );
                return Err(LandingError::Forbidden("campaign does not match token"));
            }
        }

        if page_id != recipient.page_id {
            warn!(
                recipient_id = recipient.recipient_id,
                campaign_id = recipient.campaign_id,
                requested_page = page_id,
                "landing_page_mismatch"
            );
            return Err(LandingError::Forbidden("page does not belong to campaign"));
        }

        let page = self
            .store
            .load_page(page_id)
            .await?
            .ok_or(StoreError::NotFound { entity: "page", id: page_id })?;

        let links = TrackingLinks::new(&self.base_url, token, recipient.campaign_id, page_id)?;
        let html = rewrite_form_actions(&page.html, &links);

        debug!(page_id = page_id, forms = count_forms(&html), "landing_forms_rewritten");
        info!(
            campaign_id = recipient.campaign_id,
            recipient_id = recipient.recipient_id,
            page_id = page_id,
            "landing_page_served"
        );

        Ok(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{seed_campaign, Seeded};
    use crate::store::Recipient;
    use crate::util::mint_token;
    use chrono::Utc;

    async fn recipient_for(store: &Store, seeded: &Seeded) -> Recipient {
        store
            .create_recipients(seeded.campaign_id, &seeded.group.members, &[Utc::now()], mint_token)
            .await
            .unwrap()
            .remove(0)
    }

    fn gatekeeper(store: &Store) -> Gatekeeper {
        let config = Config {
            phish_base_url: "https://track.example.org".to_string(),
            ..Default::default()
        };
        Gatekeeper::new(store.clone(), &config)
    }

    #[tokio::test]
    async fn test_serves_own_page_with_rewritten_form() {
        let store = Store::in_memory().await.unwrap();
        let seeded = seed_campaign(&store, 1, Utc::now()).await;
        let recipient = recipient_for(&store, &seeded).await;

        let campaign = seeded.campaign_id.to_string();
        let html = gatekeeper(&store)
            .serve(seeded.page_id, Some(&recipient.token), Some(&campaign))
            .await
            .unwrap();

        let expected = format!(r#"action="https://track.example.org/track/submit?rid={}""#, recipient.token);
        assert!(html.contains(&expected), "{html}");
        assert!(!html.contains(r#"action="/login""#));
    }

    #[tokio::test]
    async fn test_cross_campaign_request_is_forbidden() {
        let store = Store::in_memory().await.unwrap();
        let first = seed_campaign(&store, 1, Utc::now()).await;
        let second = seed_campaign(&store, 1, Utc::now()).await;
        let recipient = recipient_for(&store, &first).await;
        let gatekeeper = gatekeeper(&store);

        let other_campaign = second.campaign_id.to_string();
        let err = gatekeeper
            .serve(first.page_id, Some(&recipient.token), Some(&other_campaign))
            .await
            .unwrap_err();
        assert!(matches!(err, LandingError::Forbidden(_)));

        let err = gatekeeper
            .serve(second.page_id, Some(&recipient.token), None)
            .await
            .unwrap_err();
        assert!(matches!(err, LandingError::Forbidden(_)));

        let err = gatekeeper
            .serve(first.page_id, Some(&recipient.token), Some("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, LandingError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_token_errors() {
        let store = Store::in_memory().await.unwrap();
        let seeded = seed_campaign(&store, 1, Utc::now()).await;
        let gatekeeper = gatekeeper(&store);

        assert!(matches!(
            gatekeeper.serve(seeded.page_id, None, None).await,
            Err(LandingError::MissingToken)
        ));
        assert!(matches!(
            gatekeeper.serve(seeded.page_id, Some("nope"), None).await,
            Err(LandingError::UnknownToken)
        ));
    }
}
