//! Delivery transport: submits one rendered message through a sending profile.
//!
//! ```text
//! connect → greeting → EHLO → STARTTLS → EHLO → AUTH → MAIL → RCPT → DATA → QUIT
//! ```

pub mod client;
pub mod error;
pub mod message;
pub mod response;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::store::SendingProfile;

pub use client::SmtpClient;
pub use error::TransportError;
pub use message::{extract_address, MessageBuilder, OutboundMessage};
pub use response::Response;

/// Port on which TLS starts before the SMTP greeting.
const IMPLICIT_TLS_PORT: u16 = 465;

/// Anything that can deliver a rendered message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        profile: &SendingProfile,
        message: &OutboundMessage,
    ) -> Result<(), TransportError>;
}

/// SMTP submission over TCP, upgraded with STARTTLS when offered.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    helo_name: String,
    timeout: Duration,
}

impl SmtpTransport {
    pub fn new(helo_name: &str, timeout: Duration) -> Self {
        Self {
            helo_name: helo_name.to_string(),
            timeout,
        }
    }

    async fn transaction(
        &self,
        profile: &SendingProfile,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let (host, port) = split_host(&profile.host)?;
        let addr = format!("{host}:{port}");

        if profile.ignore_cert_errors {
            warn!(host = %host, profile_id = profile.id, "smtp_certificate_verification_disabled");
        }

        let mut client = if port == IMPLICIT_TLS_PORT {
            SmtpClient::connect_tls(&addr, host, profile.ignore_cert_errors).await?
        } else {
            SmtpClient::connect(&addr, host, profile.ignore_cert_errors).await?
        };

        client.read_greeting().await?;
        let mut ehlo = client.hello(&self.helo_name).await?;

        if !client.is_tls() && ehlo.has_extension("STARTTLS") {
            client.starttls().await?;
            ehlo = client.hello(&self.helo_name).await?;
            debug!(host = %host, "smtp_starttls_negotiated");
        }

        if let Some(username) = profile.username.as_deref().filter(|u| !u.is_empty()) {
            if !client.is_tls() && !is_loopback(host) {
                return Err(TransportError::Auth(
                    "refusing to send credentials over an unencrypted connection".to_string(),
                ));
            }
            let password = profile.password.as_deref().unwrap_or_default();
            client
                .authenticate(&ehlo.auth_mechanisms(), username, password)
                .await?;
        }

        client.mail_from(&message.envelope_from).await?;
        client.rcpt_to(&message.recipient).await?;
        client.data(&message.data).await?;

        if let Err(e) = client.quit().await {
            debug!(host = %host, error = %e, "smtp_quit_failed_after_delivery");
        }

        Ok(())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(
        &self,
        profile: &SendingProfile,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(self.timeout, self.transaction(profile, message)).await {
            Ok(Ok(())) => {
                info!(
                    host = %profile.host,
                    recipient = %message.recipient,
                    size = message.data.len(),
                    "smtp_message_accepted"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

/// Split `host:port`, defaulting to the submission port.
fn split_host(value: &str) -> Result<(&str, u16), TransportError> {
    let value = value.trim();
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| TransportError::InvalidProfile(format!("invalid port in '{value}'")))?;
            Ok((host, port))
        }
        None if !value.is_empty() => Ok((value, 587)),
        _ => Err(TransportError::InvalidProfile(format!("invalid host '{value}'"))),
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
