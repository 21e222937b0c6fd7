//! Messaging channel: message listing, sending, drafts and polling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::Stream;
use regex::Regex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{NegotiationError, Result};
use crate::gateway::Gateway;
use crate::models::{ConversationId, Message, MessageKind, NewMessage, ProposalSnapshot, WireMessage};
use crate::session::Session;
use crate::views::{Selection, ViewCache};

/// Compatibility shim for messages stored without a kind tag.
///
/// Older messages only reveal that they are proposals through their text.
/// This is the single place that sniffs content; messages carrying an
/// explicit tag never reach it.
pub struct LegacyKindDetector {
    marker_regex: Regex,
    total_regex: Regex,
}

impl LegacyKindDetector {
    /// Compile the marker patterns.
    pub fn new() -> Result<Self> {
        let marker_regex = Regex::new(r"(?i)^\s*(?:📋\s*)?(?:proposta|proposal)\b")
            .map_err(|e| NegotiationError::Other(format!("Failed to compile marker regex: {e}")))?;
        let total_regex = Regex::new(r"(?i)\btotal\s*:?\s*R\$\s*\d")
            .map_err(|e| NegotiationError::Other(format!("Failed to compile total regex: {e}")))?;

        Ok(Self {
            marker_regex,
            total_regex,
        })
    }

    /// Guess the kind of an untagged message, recovering an embedded snapshot if there is one.
    #[must_use]
    pub fn detect(&self, content: &str) -> (MessageKind, Option<ProposalSnapshot>) {
        let trimmed = content.trim();
        if trimmed.starts_with('{') {
            if let Ok(snapshot) = serde_json::from_str::<ProposalSnapshot>(trimmed) {
                return (MessageKind::Proposal, Some(snapshot));
            }
        }

        if self.marker_regex.is_match(trimmed) || self.total_regex.is_match(trimmed) {
            (MessageKind::Proposal, None)
        } else {
            (MessageKind::Plain, None)
        }
    }
}

/// Human-readable text stored alongside a proposal snapshot.
#[must_use]
pub fn proposal_summary(snapshot: &ProposalSnapshot) -> String {
    let count = snapshot.steps.len();
    let noun = if count == 1 { "etapa" } else { "etapas" };
    format!(
        "📋 Proposta #{}: {count} {noun}, total R$ {}",
        snapshot.ticket_id, snapshot.total
    )
}

/// Sends and lists chat messages for conversations
#[derive(Clone)]
pub struct MessagingChannel {
    gateway: Arc<dyn Gateway>,
    views: Arc<ViewCache>,
    selection: Arc<Selection>,
    detector: Arc<LegacyKindDetector>,
    drafts: Arc<Mutex<HashMap<ConversationId, String>>>,
    poll_interval: Duration,
}

impl MessagingChannel {
    /// Create a channel polling every `poll_interval`.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        views: Arc<ViewCache>,
        selection: Arc<Selection>,
        poll_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            gateway,
            views,
            selection,
            detector: Arc::new(LegacyKindDetector::new()?),
            drafts: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
        })
    }

    /// The shared conversation selection
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Messages of `conversation`, oldest first, served from cache when valid.
    pub async fn list_messages(&self, session: &Session, conversation: ConversationId) -> Result<Vec<Message>> {
        if let Some(cached) = self.views.messages.get(&conversation) {
            return Ok(cached);
        }
        self.refresh_messages(session, conversation).await
    }

    /// Fetch messages from the gateway, bypassing the cache.
    pub async fn refresh_messages(&self, session: &Session, conversation: ConversationId) -> Result<Vec<Message>> {
        let generation = self.views.messages.generation(&conversation);
        let wire = self.gateway.list_messages(session, conversation).await?;
        let mut messages: Vec<Message> = wire.into_iter().map(|w| self.resolve(w)).collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        self.views.messages.store(conversation, generation, messages.clone());
        Ok(messages)
    }

    /// Append a message to `conversation`.
    pub async fn send_message(
        &self,
        session: &Session,
        conversation: ConversationId,
        content: &str,
        kind: MessageKind,
        proposal: Option<ProposalSnapshot>,
    ) -> Result<Message> {
        if kind == MessageKind::Plain && content.trim().is_empty() {
            return Err(NegotiationError::Validation("message cannot be empty".to_string()));
        }

        let outgoing = NewMessage {
            conversation_id: conversation,
            sender_id: session.user_id(),
            content: content.to_string(),
            kind,
            proposal,
        };

        let sent = self.gateway.send_message(session, &outgoing).await?;
        self.views.invalidate_messages(conversation);
        debug!(conversation_id = conversation, kind = kind.as_str(), "message sent");

        let mut message = self.resolve(sent);
        // The backend may echo a bare record; what we sent is authoritative.
        message.kind = kind;
        if message.proposal.is_none() {
            message.proposal = outgoing.proposal;
        }
        Ok(message)
    }

    /// Send the composer draft of `conversation` as a plain message, clearing it on success.
    pub async fn send_draft(&self, session: &Session, conversation: ConversationId) -> Result<Message> {
        let draft = self.draft(conversation);
        let message = self
            .send_message(session, conversation, &draft, MessageKind::Plain, None)
            .await?;
        self.drafts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conversation);
        Ok(message)
    }

    /// Replace the composer draft for `conversation`.
    pub fn set_draft(&self, conversation: ConversationId, text: impl Into<String>) {
        self.drafts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation, text.into());
    }

    /// Current composer draft for `conversation` (empty if none).
    #[must_use]
    pub fn draft(&self, conversation: ConversationId) -> String {
        self.drafts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Poll `conversation` at the configured interval while it stays selected.
    ///
    /// Each call starts a fresh sequence. The stream ends as soon as another
    /// conversation is selected, and a fetch that completes after the
    /// selection moved away is discarded rather than yielded. Failed polls are
    /// yielded as errors and polling goes on.
    pub fn poll_messages(
        &self,
        session: Session,
        conversation: ConversationId,
    ) -> impl Stream<Item = Result<Vec<Message>>> + Send + 'static {
        let channel = self.clone();
        async_stream::stream! {
            let mut ticker = tokio::time::interval(channel.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(conversation_id = conversation, "message polling started");
            loop {
                ticker.tick().await;
                if !channel.selection.is_current(conversation) {
                    break;
                }
                let result = channel.refresh_messages(&session, conversation).await;
                if !channel.selection.is_current(conversation) {
                    debug!(conversation_id = conversation, "discarding poll result for deselected conversation");
                    break;
                }
                if let Err(e) = &result {
                    warn!(conversation_id = conversation, error = %e, "message poll failed");
                }
                yield result;
            }
            info!(conversation_id = conversation, "message polling stopped");
        }
    }

    fn resolve(&self, wire: WireMessage) -> Message {
        let tagged = wire.kind.as_deref().and_then(|k| match k.trim().to_lowercase().as_str() {
            "plain" | "text" => Some(MessageKind::Plain),
            "proposal" | "proposta" => Some(MessageKind::Proposal),
            _ => None,
        });

        let (kind, proposal) = match tagged {
            Some(kind) => (kind, wire.proposal),
            None => {
                let (kind, embedded) = self.detector.detect(&wire.content);
                (kind, wire.proposal.or(embedded))
            }
        };

        Message {
            id: wire.id,
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            content: wire.content,
            created_at: wire.created_at,
            kind,
            proposal,
        }
    }
}
