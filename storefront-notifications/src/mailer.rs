//! Outbound email.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Sender used when none is configured.
pub const DEFAULT_FROM: &str = "Storefront <no-reply@storefront.local>";

/// Submission port used when `SMTP_PORT` is unset.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Mail delivery errors.
#[derive(Debug, Error)]
pub enum MailError {
    /// Recipient address is unusable
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Mail server refused or could not be reached
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Mailer settings are unusable
    #[error("mailer configuration error: {0}")]
    Configuration(String),
}

/// A plain-text email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub text: String,
}

impl Email {
    /// Build an email, rejecting an obviously malformed recipient.
    pub fn new(
        to: impl Into<String>,
        subject: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, MailError> {
        let to = to.into().trim().to_string();
        if !to.contains('@') {
            return Err(MailError::InvalidRecipient(to));
        }
        Ok(Self {
            to,
            subject: subject.into(),
            text: text.into(),
        })
    }
}

/// Mail delivery contract.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one email.
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Mailer that logs emails instead of sending them.
///
/// For development and for deployments without an SMTP relay.
#[derive(Debug, Clone)]
pub struct ConsoleMailer {
    from: String,
}

impl ConsoleMailer {
    /// Create a console mailer with the given sender.
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

impl Default for ConsoleMailer {
    fn default() -> Self {
        Self::new(DEFAULT_FROM)
    }
}

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        info!(
            from = %self.from,
            to = %email.to,
            subject = %email.subject,
            text = %email.text,
            "Email (console)"
        );
        Ok(())
    }
}

/// SMTP relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Relay host name
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Login user; the relay is used without authentication when unset
    pub username: Option<String>,
    /// Login password
    pub password: Option<String>,
    /// Sender mailbox, e.g. `Storefront <no-reply@example.com>`
    pub from: String,
}

impl SmtpConfig {
    /// Read `SMTP_HOST`, `SMTP_PORT`, `SMTP_USER`, `SMTP_PASSWORD` and
    /// `FROM_EMAIL`. `None` when `SMTP_HOST` is unset.
    pub fn from_env() -> Result<Option<Self>, MailError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SmtpConfig::from_env`] through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, MailError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(host) = lookup("SMTP_HOST").filter(|host| !host.trim().is_empty()) else {
            return Ok(None);
        };
        let port = match lookup("SMTP_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| MailError::Configuration(format!("SMTP_PORT is not a port: {raw}")))?,
            None => DEFAULT_SMTP_PORT,
        };

        Ok(Some(Self {
            host: host.trim().to_string(),
            port,
            username: lookup("SMTP_USER"),
            password: lookup("SMTP_PASSWORD"),
            from: lookup("FROM_EMAIL").unwrap_or_else(|| DEFAULT_FROM.to_string()),
        }))
    }
}

/// Mailer delivering through an SMTP relay over TLS.
///
/// The transport is built once and pools its connections; nothing touches
/// the network until the first send.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Create a mailer for `config`.
    ///
    /// # Errors
    ///
    /// [`MailError::Configuration`] when the sender is not a valid mailbox
    /// or the relay host cannot be used for TLS.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MailError::Configuration(format!("invalid sender {}: {e}", config.from)))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| MailError::Configuration(format!("SMTP relay error: {e}")))?
            .port(config.port);
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        info!(host = %config.host, port = config.port, from = %from, "SMTP mailer configured");
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn message(&self, email: &Email) -> Result<Message, MailError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| MailError::InvalidRecipient(format!("{}: {e}", email.to)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(email.text.clone())
            .map_err(|e| MailError::Delivery(format!("failed to build email: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let message = self.message(email)?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| MailError::Delivery(e.to_string()))?;
        debug!(to = %email.to, code = %response.code(), "Email accepted by relay");
        Ok(())
    }
}

/// Mailer that keeps sent emails in memory.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Email>>,
    failing: AtomicBool,
}

impl MemoryMailer {
    /// Create an empty mailer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Emails sent so far.
    pub fn sent(&self) -> Vec<Email> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError::Delivery("mail server unavailable".to_string()));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| MailError::Delivery("mailbox lock poisoned".to_string()))?;
        sent.push(email.clone());
        Ok(())
    }
}
