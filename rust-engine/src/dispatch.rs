//! Recipient dispatch: fan a claimed campaign out to one send task per member.
//!
//! Recipients are created in a single transaction before any task starts, so
//! every token exists before the first message can be opened. Sends are then
//! bounded by a semaphore per sending profile. The campaign moves to `sent`
//! as soon as fan-out is submitted; delivery results land on each recipient.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::html::TrackingLinks;
use crate::render::{render_email, RenderContext};
use crate::store::{LoadedCampaign, Recipient, Store, StoreError};
use crate::transport::{extract_address, MailTransport, MessageBuilder, OutboundMessage};
use crate::util::mint_token;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid tracking base URL: {0}")]
    BaseUrl(#[from] url::ParseError),
}

/// Terminal result of one recipient's send task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed(String),
}

/// Counts gathered by [`DispatchHandle::join`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub campaign_id: i64,
    pub sent: usize,
    pub failed: usize,
    /// Tasks that panicked or were cancelled by runtime shutdown
    pub aborted: usize,
}

/// Task handles for one campaign's fan-out.
///
/// Dropping the handle does not cancel the sends.
#[derive(Debug)]
pub struct DispatchHandle {
    pub campaign_id: i64,
    tasks: Vec<(i64, JoinHandle<SendOutcome>)>,
}

impl DispatchHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether every send task has finished.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|(_, task)| task.is_finished())
    }

    pub fn recipient_ids(&self) -> Vec<i64> {
        self.tasks.iter().map(|(id, _)| *id).collect()
    }

    /// Wait for every send task and tally the outcomes.
    pub async fn join(self) -> DispatchSummary {
        let campaign_id = self.campaign_id;
        let (ids, tasks): (Vec<i64>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = join_all(tasks).await;

        let mut summary = DispatchSummary {
            campaign_id,
            ..Default::default()
        };
        for (recipient_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(SendOutcome::Sent) => summary.sent += 1,
                Ok(SendOutcome::Failed(_)) => summary.failed += 1,
                Err(e) => {
                    error!(campaign_id = campaign_id, recipient_id = recipient_id, error = %e, "dispatch_task_aborted");
                    summary.aborted += 1;
                }
            }
        }

        summary
    }
}

/// Shared dispatcher. Clone the `Arc` into whatever claims campaigns.
pub struct Dispatcher {
    store: Store,
    transport: Arc<dyn MailTransport>,
    base_url: Arc<str>,
    default_concurrency: usize,
    /// Per sending profile: the size it was built with and the semaphore
    limits: DashMap<i64, (usize, Arc<Semaphore>)>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        transport: Arc<dyn MailTransport>,
        config: &Config,
    ) -> Result<Self, DispatchError> {
        url::Url::parse(&config.phish_base_url)?;
        Ok(Self {
            store,
            transport,
            base_url: Arc::from(config.phish_base_url.as_str()),
            default_concurrency: config.send_concurrency.max(1),
            limits: DashMap::new(),
        })
    }

    /// Semaphore bounding simultaneous sends through one profile.
    fn limiter(&self, loaded: &LoadedCampaign) -> Arc<Semaphore> {
        let size = loaded
            .profile
            .max_concurrency
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(self.default_concurrency);

        let mut entry = self
            .limits
            .entry(loaded.profile.id)
            .or_insert_with(|| (size, Arc::new(Semaphore::new(size))));
        if entry.0 != size {
            // Tasks already holding the old semaphore keep draining it.
            info!(profile_id = loaded.profile.id, from = entry.0, to = size, "send_limit_resized");
            *entry = (size, Arc::new(Semaphore::new(size)));
        }
        Arc::clone(&entry.1)
    }

    /// Create recipients for a claimed campaign and submit its send tasks.
    pub async fn dispatch(&self, loaded: LoadedCampaign) -> Result<DispatchHandle, DispatchError> {
        let campaign_id = loaded.campaign.id;
        let members = &loaded.group.members;
        let send_dates = spread_send_dates(
            loaded.campaign.launch_date,
            loaded.campaign.send_by_date,
            members.len(),
        );

        let recipients = match self
            .store
            .create_recipients(campaign_id, members, &send_dates, mint_token)
            .await
        {
            Ok(recipients) => recipients,
            Err(e) => {
                match self.store.release_claim(campaign_id).await {
                    Ok(released) => {
                        warn!(campaign_id = campaign_id, released = released, error = %e, "dispatch_recipients_failed")
                    }
                    Err(release_err) => {
                        error!(campaign_id = campaign_id, error = %e, release_error = %release_err, "dispatch_claim_release_failed")
                    }
                }
                return Err(e.into());
            }
        };

        info!(
            campaign_id = campaign_id,
            group_id = loaded.group.id,
            members = members.len(),
            recipients_created = recipients.len(),
            "dispatch_recipients_created"
        );

        let limiter = self.limiter(&loaded);
        let loaded = Arc::new(loaded);
        let mut tasks = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let recipient_id = recipient.id;
            let job = SendJob {
                store: self.store.clone(),
                transport: Arc::clone(&self.transport),
                limiter: Arc::clone(&limiter),
                campaign: Arc::clone(&loaded),
                base_url: Arc::clone(&self.base_url),
                recipient,
            };
            tasks.push((recipient_id, tokio::spawn(job.run())));
        }

        // Sends are already running; a failed update is settled by a later tick.
        match self.store.mark_campaign_sent(campaign_id).await {
            Ok(true) => {}
            Ok(false) => debug!(campaign_id = campaign_id, "dispatch_campaign_already_settled"),
            Err(e) => error!(campaign_id = campaign_id, error = %e, "dispatch_mark_sent_failed"),
        }

        info!(
            campaign_id = campaign_id,
            tasks = tasks.len(),
            concurrency = limiter.available_permits(),
            "dispatch_fanout_submitted"
        );

        Ok(DispatchHandle { campaign_id, tasks })
    }
}

/// Everything one send task owns.
struct SendJob {
    store: Store,
    transport: Arc<dyn MailTransport>,
    limiter: Arc<Semaphore>,
    campaign: Arc<LoadedCampaign>,
    base_url: Arc<str>,
    recipient: Recipient,
}

impl SendJob {
    async fn run(self) -> SendOutcome {
        let recipient_id = self.recipient.id;
        let campaign_id = self.campaign.campaign.id;

        let wait = (self.recipient.send_date - Utc::now()).to_std().unwrap_or_default();
        if !wait.is_zero() {
            sleep(wait).await;
        }

        let outcome = match self.limiter.acquire().await {
            Ok(_permit) => self.deliver().await,
            Err(e) => Err(format!("send limiter closed: {e}")),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.mark_recipient_sent(recipient_id).await {
                    error!(campaign_id = campaign_id, recipient_id = recipient_id, error = %e, "recipient_status_update_failed");
                }
                info!(campaign_id = campaign_id, recipient_id = recipient_id, "recipient_sent");
                SendOutcome::Sent
            }
            Err(message) => {
                if let Err(e) = self.store.mark_recipient_failed(recipient_id, &message).await {
                    error!(campaign_id = campaign_id, recipient_id = recipient_id, error = %e, "recipient_status_update_failed");
                }
                warn!(campaign_id = campaign_id, recipient_id = recipient_id, error = %message, "recipient_send_failed");
                SendOutcome::Failed(message)
            }
        }
    }

    async fn deliver(&self) -> Result<(), String> {
        let loaded = &self.campaign;
        let links = TrackingLinks::new(
            &self.base_url,
            &self.recipient.token,
            loaded.campaign.id,
            loaded.campaign.page_id,
        )
        .map_err(|e| e.to_string())?;

        let ctx = RenderContext {
            recipient: &self.recipient,
            from: &loaded.profile.from_address,
            links: &links,
        };
        let rendered = render_email(&loaded.template, &ctx);

        let envelope_from = loaded
            .template
            .envelope_sender
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&loaded.profile.from_address);

        let message = OutboundMessage {
            envelope_from: extract_address(envelope_from),
            recipient: self.recipient.email.clone(),
            data: MessageBuilder::new(&loaded.profile.from_address, &self.recipient.email)
                .subject(&rendered.subject)
                .text(&rendered.text)
                .html(&rendered.html)
                .headers(&loaded.profile.headers)
                .build(),
        };

        self.transport
            .send(&loaded.profile, &message)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Planned send time per recipient.
///
/// With a send-by date the sends are spread evenly over the window starting
/// at launch; otherwise everyone is sent at launch.
pub fn spread_send_dates(
    launch: DateTime<Utc>,
    send_by: Option<DateTime<Utc>>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    match send_by {
        Some(end) if end > launch && count > 1 => {
            let step = (end - launch) / count as i32;
            (0..count).map(|i| launch + step * i as i32).collect()
        }
        _ => vec![launch; count],
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::store::SendingProfile;
    use crate::transport::{MailTransport, OutboundMessage, TransportError};

    /// Transport that records messages instead of sending them.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<OutboundMessage>>,
        pub reject: HashSet<String>,
        pub delay: Option<Duration>,
        /// When set, every send waits for a permit before completing
        pub gate: Option<Semaphore>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl RecordingTransport {
        pub fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|m| m.recipient.clone()).collect()
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(
            &self,
            _profile: &SendingProfile,
            message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.reject.contains(&message.recipient) {
                return Err(TransportError::Rejected {
                    command: "RCPT TO",
                    code: 550,
                    message: "mailbox unavailable".to_string(),
                });
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }
}
