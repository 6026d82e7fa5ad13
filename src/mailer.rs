use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{error, info};

use crate::config::SmtpConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("mail task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub from: String,
    pub from_name: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Delivers mail through an SMTP relay using STARTTLS.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::starttls_relay(&config.server)?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        info!(server = %config.server, port = config.port, "SMTP mailer initialized");

        Ok(Self { transport })
    }
}

pub fn build_message(mail: &OutgoingMail) -> Result<Message, MailError> {
    let from = Mailbox::new(Some(mail.from_name.clone()), mail.from.parse()?);
    let message = Message::builder()
        .from(from)
        .to(mail.to.parse()?)
        .subject(&mail.subject)
        .header(ContentType::TEXT_PLAIN)
        .body(mail.body.clone())?;
    Ok(message)
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = build_message(mail)?;

        // lettre's SmtpTransport blocks, keep it off the async workers.
        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&message)).await?;

        match result {
            Ok(_) => {
                info!(to = %mail.to, subject = %mail.subject, "Email sent");
                Ok(())
            }
            Err(e) => {
                error!(to = %mail.to, error = %e, "Failed to send email");
                Err(e.into())
            }
        }
    }
}

/// Writes outgoing mail to the log instead of sending it. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        build_message(mail)?;
        info!(to = %mail.to, subject = %mail.subject, body = %mail.body, "Email not sent (no SMTP configured)");
        Ok(())
    }
}
