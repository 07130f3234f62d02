//! `lettre`-backed `HealthNotifier` adapter (spec §4.8, §6).

use domain::{HealthNotifier, Notification, NotifyError};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Sends health notifications over SMTP. Port 465 implies implicit TLS;
/// anything else falls back to STARTTLS, matching common mail-relay setups.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn from_config(
        smtp_host: &str,
        smtp_port: Option<u16>,
        smtp_tls: Option<bool>,
        from: &str,
        to: &[String],
    ) -> Result<Self, NotifyError> {
        let from_mailbox: Mailbox =
            from.parse().map_err(|err| NotifyError::DeliveryFailed(format!("invalid from address: {err}")))?;
        let to_mailboxes = to
            .iter()
            .map(|addr| addr.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| NotifyError::DeliveryFailed(format!("invalid to address: {err}")))?;
        if to_mailboxes.is_empty() {
            return Err(NotifyError::DeliveryFailed("no recipients configured".to_owned()));
        }

        let implicit_tls = smtp_tls.unwrap_or(smtp_port == Some(465));
        let mut builder = if implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
        }
        .map_err(|err| NotifyError::DeliveryFailed(err.to_string()))?;

        if let Some(port) = smtp_port {
            builder = builder.port(port);
        }

        if let (Ok(username), Ok(password)) = (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD")) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self { transport: builder.build(), from: from_mailbox, to: to_mailboxes })
    }
}

impl HealthNotifier for EmailNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(notification.subject);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        let email = builder
            .body(notification.body)
            .map_err(|err| NotifyError::DeliveryFailed(err.to_string()))?;

        self.transport.send(email).await.map_err(|err| NotifyError::DeliveryFailed(err.to_string()))?;
        Ok(())
    }
}
