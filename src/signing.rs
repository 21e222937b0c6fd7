//! Document signing.
//!
//! "Signing" here is a password re-check followed by a status change on the
//! ticket. No cryptographic signature is produced.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::engine::{NegotiationEngine, TicketTransition};
use crate::error::{NegotiationError, Result};
use crate::metrics;
use crate::models::{MessageKind, Ticket};
use crate::session::Session;
use crate::validation::InputValidator;

/// Result of a completed signature
#[derive(Debug, Clone)]
pub struct SignatureReceipt {
    /// The ticket in its signed state
    pub ticket: Ticket,
    /// When the signature was recorded
    pub signed_at: DateTime<Utc>,
    /// Whether the chat notice went out
    pub notice_sent: bool,
}

/// Chat notice announcing a signature.
#[must_use]
pub fn signature_notice(signer: &str, at: DateTime<Utc>) -> String {
    format!("Documento assinado por {signer} em {}", at.format("%d/%m/%Y %H:%M"))
}

impl NegotiationEngine {
    /// Sign the contract of `ticket` after re-checking the user's password.
    ///
    /// A wrong password changes nothing. If the password checks out but the
    /// ticket cannot be updated, [`NegotiationError::SignatureNotRecorded`] is
    /// returned so the caller can tell the user to retry. A failed chat notice
    /// does not undo the signature.
    pub async fn sign_document(&self, session: &Session, ticket: &Ticket, password: &str) -> Result<SignatureReceipt> {
        InputValidator::password(password)?;
        if !TicketTransition::Sign.allowed_from(ticket.status.as_ref()) {
            return Err(NegotiationError::InvalidTransition {
                ticket_id: ticket.id,
                from: ticket.status_str().to_string(),
                to: TicketTransition::Sign.target().to_string(),
            });
        }

        let valid = self.gateway.validate_password(&session.user.email, password).await?;
        if !valid {
            warn!(ticket_id = ticket.id, user_id = session.user_id(), "signature refused, wrong password");
            return Err(NegotiationError::WrongPassword);
        }

        let signed = self
            .update_ticket_status(session, ticket, TicketTransition::Sign)
            .await
            .map_err(|e| {
                metrics::record_partial_failure("signature_not_recorded");
                error!(ticket_id = ticket.id, error = %e, "password accepted but signature not recorded");
                NegotiationError::SignatureNotRecorded {
                    ticket_id: ticket.id,
                    source: Box::new(e),
                }
            })?;
        let signed_at = signed.signed_at.unwrap_or_else(Utc::now);
        info!(ticket_id = ticket.id, user_id = session.user_id(), "document signed");

        let notice = signature_notice(&session.user.name, signed_at);
        let notice_sent = match self
            .messaging
            .send_message(session, ticket.conversation_id, &notice, MessageKind::Plain, None)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                metrics::record_partial_failure("signature_notice");
                warn!(ticket_id = ticket.id, error = %e, "signature recorded but chat notice failed");
                false
            }
        };

        Ok(SignatureReceipt {
            ticket: signed,
            signed_at,
            notice_sent,
        })
    }
}
