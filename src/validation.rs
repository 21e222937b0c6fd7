use crate::error::{NegotiationError, Result};
use crate::models::{Conversation, Money, Role, Step, StepDraft, StepPatch, StepStatus};
use crate::session::Session;

/// Upper bound for an uploaded contract
pub const MAX_CONTRACT_BYTES: usize = 20 * 1024 * 1024;

/// Validation utilities run before anything reaches the gateway
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Only providers propose, and never to another provider.
    pub fn authorize_proposal(session: &Session, conversation: &Conversation) -> Result<()> {
        if !session.is_provider() {
            return Err(NegotiationError::Unauthorized(
                "only providers can send proposals".to_string(),
            ));
        }

        if conversation.counterpart.role == Some(Role::Provider) {
            return Err(NegotiationError::Unauthorized(
                "proposals cannot be sent to another provider".to_string(),
            ));
        }

        Ok(())
    }

    /// Keep the drafts with a title and a positive price; fail if none remain.
    pub fn proposal_steps(drafts: &[StepDraft]) -> Result<Vec<StepDraft>> {
        if drafts.iter().any(|d| d.price.is_negative()) {
            return Err(NegotiationError::Validation("step prices cannot be negative".to_string()));
        }
        if drafts.iter().any(|d| d.price.exceeds_max()) {
            return Err(NegotiationError::Validation(format!("step prices cannot exceed {}", Money::MAX)));
        }

        let valid: Vec<StepDraft> = drafts
            .iter()
            .filter(|d| !d.title.trim().is_empty() && d.price.is_positive())
            .map(|d| StepDraft::new(d.title.trim(), d.price))
            .collect();

        if valid.is_empty() {
            return Err(NegotiationError::Validation(
                "at least one step with a title and a price above zero is required".to_string(),
            ));
        }

        Ok(valid)
    }

    /// Reject patches that would break a step's invariants.
    pub fn step_patch(step: &Step, patch: &StepPatch) -> Result<()> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(NegotiationError::Validation("step title cannot be empty".to_string()));
            }
        }

        if patch.price.is_some_and(|p| p.is_negative()) {
            return Err(NegotiationError::Validation("step price cannot be negative".to_string()));
        }
        if patch.price.is_some_and(Money::exceeds_max) {
            return Err(NegotiationError::Validation(format!("step price cannot exceed {}", Money::MAX)));
        }

        let after = patch.applied_to(step);
        if after.client_confirmed && !after.provider_completed {
            return Err(NegotiationError::Validation(
                "a step cannot be confirmed before the provider marks it completed".to_string(),
            ));
        }

        if after.status == StepStatus::Completed && !after.client_confirmed {
            return Err(NegotiationError::Validation(
                "a step cannot be completed without client confirmation".to_string(),
            ));
        }

        Ok(())
    }

    /// Passwords are sent as typed; only emptiness is checked.
    pub fn password(password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(NegotiationError::Validation("password cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Contracts must be non-empty PDFs within the size limit.
    pub fn contract_file(file_name: &str, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(NegotiationError::Validation("contract file is empty".to_string()));
        }

        if bytes.len() > MAX_CONTRACT_BYTES {
            return Err(NegotiationError::Validation(format!(
                "contract file too large (max {} MB)",
                MAX_CONTRACT_BYTES / (1024 * 1024)
            )));
        }

        let looks_pdf = bytes.starts_with(b"%PDF") || file_name.to_lowercase().ends_with(".pdf");
        if !looks_pdf {
            return Err(NegotiationError::Validation("contract must be a PDF".to_string()));
        }

        Ok(())
    }

    /// Accept PDF types, octet-stream, or no declared type.
    #[must_use]
    pub fn is_pdf_content_type(content_type: Option<&str>) -> bool {
        let Some(raw) = content_type else {
            return true;
        };
        let essence = raw.split(';').next().unwrap_or("").trim().to_lowercase();
        matches!(
            essence.as_str(),
            "" | "application/pdf" | "application/x-pdf" | "application/octet-stream"
        )
    }
}
