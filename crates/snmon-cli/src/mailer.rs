use anyhow::Result;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use snmon_core::{NotificationSink, NotifyError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct MailSettings {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Defaults to `username`.
    pub from: Option<String>,
}

struct Relay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// SMTP delivery over a STARTTLS relay. Without a host and sender
/// credentials every send fails with `NotConfigured`.
pub struct SmtpSink {
    relay: Option<Relay>,
}

impl SmtpSink {
    pub fn new(settings: &MailSettings) -> Result<Self> {
        let (Some(host), Some(username), Some(password)) =
            (&settings.host, &settings.username, &settings.password)
        else {
            warn!("smtp host or credentials not set, alert mail is disabled");
            return Ok(Self::disabled());
        };

        let from: Mailbox = settings.from.as_ref().unwrap_or(username).parse()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?
            .port(settings.port)
            .credentials(Credentials::new(username.clone(), password.clone()))
            .build();

        debug!(host = %host, port = settings.port, from = %from, "smtp relay configured");
        Ok(Self {
            relay: Some(Relay { transport, from }),
        })
    }

    pub fn disabled() -> Self {
        Self { relay: None }
    }

    pub fn is_configured(&self) -> bool {
        self.relay.is_some()
    }
}

#[async_trait]
impl NotificationSink for SmtpSink {
    async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NotifyError> {
        let Some(relay) = &self.relay else {
            return Err(NotifyError::NotConfigured);
        };
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }

        let mut builder = Message::builder()
            .from(relay.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|_| NotifyError::Address(recipient.clone()))?;
            builder = builder.to(mailbox);
        }
        let message = builder
            .body(body.to_string())
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        relay
            .transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        Ok(())
    }
}
