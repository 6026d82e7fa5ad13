use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::mailer::{MailError, Mailer, OutgoingMail};
use crate::pending::PendingRequests;
use crate::token::{self, GenerationError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("failed to send validation email: {0}")]
    Mail(#[from] MailError),

    /// Wrong code, unknown request and expired request are all reported
    /// through this one variant.
    #[error("Failed email validation")]
    AuthenticationFailed,
}

/// Settings the auth service needs to address validation emails.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub site_name: String,
    pub sender: String,
    pub sender_name: String,
}

/// A freshly minted session, not yet bound to a user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub email: String,
}

pub struct AuthService {
    config: AuthConfig,
    mailer: Arc<dyn Mailer>,
    pending: Arc<PendingRequests>,
}

impl AuthService {
    pub fn new(config: AuthConfig, mailer: Arc<dyn Mailer>, pending: Arc<PendingRequests>) -> Self {
        Self {
            config,
            mailer,
            pending,
        }
    }

    /// Emails a verification code to `email` and returns the request id the
    /// code must be presented with. Nothing is stored if the email fails.
    pub async fn start_email_validation(&self, email: &str) -> Result<String, AuthError> {
        let challenge = self.pending.prepare(email)?;

        let mail = self.validation_mail(email, &challenge.code);
        if let Err(e) = self.mailer.send(&mail).await {
            warn!(error = %e, "Validation email failed, challenge discarded");
            return Err(e.into());
        }

        let request_id = self.pending.commit(challenge);
        info!("Email validation started");
        Ok(request_id)
    }

    /// Consumes the challenge for `request_id`. On a matching code, returns a
    /// new session token together with the verified email.
    pub async fn complete_email_validation(
        &self,
        request_id: &str,
        code: &str,
    ) -> Result<Session, AuthError> {
        let email = self
            .pending
            .complete(request_id, code)
            .ok_or(AuthError::AuthenticationFailed)?;

        let token = token::random_key()?;
        info!("Email validation completed");
        Ok(Session { token, email })
    }

    fn validation_mail(&self, email: &str, code: &str) -> OutgoingMail {
        OutgoingMail {
            to: email.to_string(),
            from: self.config.sender.clone(),
            from_name: self.config.sender_name.clone(),
            subject: "Email Validation".to_string(),
            body: format!(
                "This is an email validation request from {}. Use the following code to prove you own {}:\r\n\r\n{}\r\n",
                self.config.site_name, email, code
            ),
        }
    }
}
