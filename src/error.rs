//! Error types for the negotiation core.
//!
//! Every public operation returns [`Result`]; nothing panics across the engine
//! boundary. Each variant also carries a short user-facing message through
//! [`NegotiationError::user_message`], and partial-failure states each get
//! their own distinct text.

use thiserror::Error;

use crate::models::{StepId, TicketId};

/// Errors that can occur while negotiating.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// An operation that needs a conversation was invoked without one
    #[error("no conversation selected")]
    NoConversationSelected,

    /// The session user may not perform the operation
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Input rejected before any network call
    #[error("invalid input: {0}")]
    Validation(String),

    /// Ticket status change not allowed from the current status
    #[error("ticket {ticket_id} cannot go from '{from}' to '{to}'")]
    InvalidTransition {
        /// Ticket being changed
        ticket_id: TicketId,
        /// Current status ("" when empty)
        from: String,
        /// Requested status
        to: String,
    },

    /// Non-success HTTP status from the backend
    #[error("{method} {endpoint} returned {status}: {message}")]
    Gateway {
        /// HTTP method
        method: String,
        /// Endpoint path
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Transport failure before a response was received
    #[error("request to {endpoint} failed: {message}")]
    Network {
        /// Endpoint path
        endpoint: String,
        /// Underlying error text
        message: String,
    },

    /// The request exceeded the configured timeout
    #[error("request to {endpoint} timed out")]
    Timeout {
        /// Endpoint path
        endpoint: String,
    },

    /// Response body did not match the expected shape
    #[error("response from {endpoint} could not be decoded: {message}")]
    Decode {
        /// Endpoint path
        endpoint: String,
        /// Decoder error text
        message: String,
    },

    /// Password re-check failed
    #[error("password rejected")]
    WrongPassword,

    /// Some steps of a proposal were created before one failed
    #[error("proposal on ticket {ticket_id} incomplete: {created} of {requested} steps created: {source}")]
    PartialProposal {
        /// Ticket the steps were created under
        ticket_id: TicketId,
        /// Steps that were created and remain in place
        created: usize,
        /// Steps the caller asked for
        requested: usize,
        /// Failure of the first step that could not be created
        #[source]
        source: Box<NegotiationError>,
    },

    /// Steps exist but the proposal message was not delivered
    #[error("proposal on ticket {ticket_id} saved but not announced: {source}")]
    ProposalNotAnnounced {
        /// Ticket holding the proposal
        ticket_id: TicketId,
        /// Messaging failure
        #[source]
        source: Box<NegotiationError>,
    },

    /// Password was accepted but the signed status could not be stored
    #[error("ticket {ticket_id}: password confirmed but signature not recorded: {source}")]
    SignatureNotRecorded {
        /// Ticket being signed
        ticket_id: TicketId,
        /// Status update failure
        #[source]
        source: Box<NegotiationError>,
    },

    /// The ticket was accepted but its first step could not be started
    #[error("ticket {ticket_id} accepted but first step not started: {source}")]
    FirstStepNotStarted {
        /// Accepted ticket
        ticket_id: TicketId,
        /// Step listing or update failure
        #[source]
        source: Box<NegotiationError>,
    },

    /// A step was confirmed but the one after it could not be started
    #[error("step {confirmed} of ticket {ticket_id} confirmed but next step not started: {source}")]
    NextStepNotStarted {
        /// Ticket holding the steps
        ticket_id: TicketId,
        /// Step whose confirmation was stored
        confirmed: StepId,
        /// Step listing or update failure
        #[source]
        source: Box<NegotiationError>,
    },

    /// No attachment could be located for a ticket
    #[error("attachment not found: {0}")]
    AttachmentNotFound(String),

    /// Downloaded content is not a PDF (e.g. an HTML error page)
    #[error("unexpected attachment content type: {0}")]
    UnexpectedContentType(String),

    /// Local artifact cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Binary serialization errors
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with NegotiationError
pub type Result<T> = std::result::Result<T, NegotiationError>;

impl NegotiationError {
    /// Short message suitable for showing to the person using the marketplace.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NoConversationSelected => "Selecione uma conversa primeiro.".to_string(),
            Self::Unauthorized(reason) => format!("Ação não permitida: {reason}."),
            Self::Validation(reason) => format!("Dados inválidos: {reason}."),
            Self::InvalidTransition { to, .. } => {
                format!("Não é possível marcar esta proposta como '{to}' agora.")
            }
            Self::Gateway { status, .. } => {
                format!("O servidor recusou a operação (código {status}). Tente novamente.")
            }
            Self::Network { .. } => "Falha de conexão com o servidor. Tente novamente.".to_string(),
            Self::Timeout { .. } => "O servidor demorou demais para responder.".to_string(),
            Self::Decode { .. } => "Resposta inesperada do servidor.".to_string(),
            Self::WrongPassword => "Senha incorreta.".to_string(),
            Self::PartialProposal { created, requested, .. } => format!(
                "Apenas {created} de {requested} etapas foram criadas. As etapas criadas foram mantidas; revise a proposta."
            ),
            Self::ProposalNotAnnounced { .. } => {
                "Etapas salvas, mas a mensagem da proposta não foi enviada.".to_string()
            }
            Self::SignatureNotRecorded { .. } => {
                "Senha confirmada, mas a assinatura não foi registrada. Tente assinar novamente.".to_string()
            }
            Self::FirstStepNotStarted { .. } => {
                "Proposta aceita, mas a primeira etapa não foi iniciada. Atualize e tente novamente.".to_string()
            }
            Self::NextStepNotStarted { .. } => {
                "Etapa confirmada, mas a próxima etapa não foi iniciada. Atualize e tente novamente.".to_string()
            }
            Self::AttachmentNotFound(_) => "Nenhum contrato anexado a esta proposta.".to_string(),
            Self::UnexpectedContentType(_) => "O arquivo do contrato não é um PDF válido.".to_string(),
            Self::Cache(_) | Self::Bincode(_) | Self::Io(_) => {
                "Falha ao acessar os arquivos locais.".to_string()
            }
            Self::Serialization(_) | Self::Config(_) | Self::Other(_) => {
                "Ocorreu um erro inesperado.".to_string()
            }
        }
    }

    /// True for states where part of an operation took effect.
    #[must_use]
    pub const fn is_partial_failure(&self) -> bool {
        matches!(
            self,
            Self::PartialProposal { .. }
                | Self::ProposalNotAnnounced { .. }
                | Self::SignatureNotRecorded { .. }
                | Self::FirstStepNotStarted { .. }
                | Self::NextStepNotStarted { .. }
        )
    }

    /// True for failures rejected locally, before any request was issued.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NoConversationSelected
                | Self::Unauthorized(_)
                | Self::Validation(_)
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<anyhow::Error> for NegotiationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<sled::Error> for NegotiationError {
    fn from(err: sled::Error) -> Self {
        Self::Cache(err.to_string())
    }
}
