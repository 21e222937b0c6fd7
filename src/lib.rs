//! Negotiation Core - Conversations, Proposals and Contracts
//!
//! A Rust library for the negotiation workflow of a client/provider services
//! marketplace: conversation → proposal → ticket → step → signature.
//!
//! # Features
//!
//! - Resolve conversations and their counterparts from a REST backend
//! - Idempotent active-ticket creation per conversation
//! - Proposals made of ordered, priced steps with a two-party completion handshake
//! - Contract PDFs with a persistent local cache
//! - Chat messages with polling and immutable proposal snapshots

/// Contract attachment upload and retrieval
pub mod attachments;
/// Local artifact cache on sled
pub mod cache;
/// Configuration management
pub mod config;
/// Ticket and step state machine
pub mod engine;
/// Error taxonomy
pub mod error;
/// Remote gateway trait and HTTP implementation
pub mod gateway;
/// Per-key async locks
pub mod locks;
/// Logging setup and utilities
pub mod logging;
/// Chat messages and polling
pub mod messaging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Conversation resolution
pub mod resolver;
/// Service facade
pub mod service;
/// Explicit session context
pub mod session;
/// Password-gated document signing
pub mod signing;
/// Input validation
pub mod validation;
/// Derived view cache and conversation selection
pub mod views;

// Re-export key components for easier access
pub use engine::{ActiveTicketPolicy, NegotiationEngine, ProposalDraft, TicketTransition};
pub use error::{NegotiationError, Result};
pub use gateway::{Gateway, HttpGateway};
pub use models::{Conversation, Message, Money, Step, Ticket, TicketView, User};
pub use service::NegotiationService;
pub use session::Session;
