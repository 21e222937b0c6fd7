//! Negotiation engine: tickets, proposals and the step completion handshake.
//!
//! A ticket's steps advance one at a time. Accepting a ticket starts its
//! first step; the provider then marks the live step completed, and only the
//! client's confirmation completes it and starts the next one.
//!
//! Every mutation invalidates the affected cached views after the gateway
//! acknowledged it, never before.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::cache::ArtifactCache;
use crate::error::{NegotiationError, Result};
use crate::gateway::Gateway;
use crate::locks::KeyedLocks;
use crate::logging::OperationTimer;
use crate::messaging::{proposal_summary, MessagingChannel};
use crate::metrics;
use crate::models::{
    order_steps, total_price, ContractFile, Conversation, ConversationId, Message, MessageKind, Money, NewStep,
    ProposalSnapshot, Step, StepDraft, StepPatch, StepStatus, Ticket, TicketId, TicketPatch, TicketStatus,
    TicketView,
};
use crate::session::Session;
use crate::validation::InputValidator;
use crate::views::ViewCache;

/// Statuses under which a ticket still receives newly proposed steps.
///
/// Kept explicit and configurable: the default mirrors the marketplace's
/// historical rule, which also counts `completed` and `cancelled` tickets
/// as active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTicketPolicy {
    statuses: HashSet<TicketStatus>,
    include_empty: bool,
}

impl ActiveTicketPolicy {
    /// Historical default: empty, pending, in progress, completed, cancelled
    pub const DEFAULT_STATUSES: [&'static str; 5] = ["", "pending", "in_progress", "completed", "cancelled"];

    /// Build from wire names; `""` stands for an empty status.
    pub fn from_statuses<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut include_empty = false;
        let mut set = HashSet::new();
        for raw in statuses {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                include_empty = true;
            } else {
                set.insert(TicketStatus::parse(raw));
            }
        }
        Self {
            statuses: set,
            include_empty,
        }
    }

    /// True when a ticket with `status` counts as active.
    #[must_use]
    pub fn is_active(&self, status: Option<&TicketStatus>) -> bool {
        status.map_or(self.include_empty, |s| self.statuses.contains(s))
    }
}

impl Default for ActiveTicketPolicy {
    fn default() -> Self {
        Self::from_statuses(Self::DEFAULT_STATUSES)
    }
}

/// Status changes a ticket can go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketTransition {
    /// pending → accepted; starts the first step
    Accept,
    /// pending → rejected
    Reject,
    /// accepted → signed; records signer and time
    Sign,
}

impl TicketTransition {
    /// Status the ticket ends up in
    #[must_use]
    pub fn target(self) -> TicketStatus {
        match self {
            Self::Accept => TicketStatus::Accepted,
            Self::Reject => TicketStatus::Rejected,
            Self::Sign => TicketStatus::Signed,
        }
    }

    /// Whether the transition may start from `current`.
    #[must_use]
    pub fn allowed_from(self, current: Option<&TicketStatus>) -> bool {
        match self {
            Self::Accept | Self::Reject => matches!(current, None | Some(TicketStatus::Pending)),
            Self::Sign => matches!(current, Some(TicketStatus::Accepted)),
        }
    }
}

/// What the provider is proposing
#[derive(Debug, Clone, Default)]
pub struct ProposalDraft {
    /// Steps in order
    pub steps: Vec<StepDraft>,
    /// Optional signed-contract document
    pub contract: Option<ContractFile>,
}

/// Outcome of the contract part of a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractStatus {
    /// No contract was supplied
    NotProvided,
    /// Uploaded and cached
    Attached,
    /// Proposal went out without the contract
    Missing {
        /// Why the upload failed
        reason: String,
    },
}

/// Result of a successful proposal
#[derive(Debug, Clone)]
pub struct ProposalReceipt {
    /// Ticket the steps were added to
    pub ticket_id: TicketId,
    /// Steps created by this proposal
    pub steps: Vec<Step>,
    /// Sum of the created steps' prices
    pub total: Money,
    /// Contract outcome
    pub contract: ContractStatus,
    /// The proposal message that went out
    pub message: Message,
}

impl ProposalReceipt {
    /// Message to show when the proposal only partly succeeded.
    #[must_use]
    pub fn notice(&self) -> Option<String> {
        match &self.contract {
            ContractStatus::Missing { .. } => {
                Some("Proposta enviada, mas o contrato não foi anexado. Envie o PDF novamente.".to_string())
            }
            ContractStatus::NotProvided | ContractStatus::Attached => None,
        }
    }
}

/// Outcome of a step deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDeletion {
    /// The ticket still has steps
    StepRemoved {
        /// Steps left on the ticket
        remaining: usize,
    },
    /// It was the last step, so the ticket went too
    TicketRemoved {
        /// The deleted ticket
        ticket_id: TicketId,
    },
}

/// Outcome of a client confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepAdvance {
    /// The step that is now completed
    pub confirmed: Step,
    /// The step that became live, if any
    pub activated: Option<Step>,
}

/// State machine over tickets and their steps
pub struct NegotiationEngine {
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) cache: ArtifactCache,
    pub(crate) views: Arc<ViewCache>,
    pub(crate) messaging: MessagingChannel,
    policy: ActiveTicketPolicy,
    ticket_locks: KeyedLocks<ConversationId>,
}

impl NegotiationEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: ArtifactCache,
        views: Arc<ViewCache>,
        messaging: MessagingChannel,
        policy: ActiveTicketPolicy,
    ) -> Self {
        Self {
            gateway,
            cache,
            views,
            messaging,
            policy,
            ticket_locks: KeyedLocks::default(),
        }
    }

    /// The active-ticket status set in use
    #[must_use]
    pub const fn policy(&self) -> &ActiveTicketPolicy {
        &self.policy
    }

    /// The messaging channel proposals are announced through
    #[must_use]
    pub const fn messaging(&self) -> &MessagingChannel {
        &self.messaging
    }

    /// Tickets of `conversation` with their steps and totals, newest first.
    pub async fn tickets(&self, session: &Session, conversation: &Conversation) -> Result<Vec<TicketView>> {
        if let Some(cached) = self.views.tickets.get(&conversation.id) {
            return Ok(cached);
        }

        let generation = self.views.tickets.generation(&conversation.id);
        let tickets = self.gateway.list_tickets(session, conversation.id).await?;
        let step_lists = join_all(tickets.iter().map(|t| self.gateway.list_steps(session, t.id))).await;

        let mut views = tickets
            .into_iter()
            .zip(step_lists)
            .map(|(ticket, steps)| Ok(TicketView::new(ticket, steps?)))
            .collect::<Result<Vec<_>>>()?;
        views.sort_by(|a, b| {
            b.ticket
                .created_at
                .cmp(&a.ticket.created_at)
                .then_with(|| b.ticket.id.cmp(&a.ticket.id))
        });

        self.views.tickets.store(conversation.id, generation, views.clone());
        Ok(views)
    }

    /// One ticket of `conversation` with its steps.
    pub async fn ticket_view(
        &self,
        session: &Session,
        conversation: &Conversation,
        ticket_id: TicketId,
    ) -> Result<Option<TicketView>> {
        Ok(self
            .tickets(session, conversation)
            .await?
            .into_iter()
            .find(|v| v.ticket.id == ticket_id))
    }

    /// The conversation's active ticket, created if there is none.
    ///
    /// Serialized per conversation, so concurrent callers share one ticket.
    pub async fn find_or_create_active_ticket(&self, session: &Session, conversation: &Conversation) -> Result<Ticket> {
        let _guard = self.ticket_locks.lock(&conversation.id).await;

        let existing = self
            .gateway
            .list_tickets(session, conversation.id)
            .await?
            .into_iter()
            .filter(|t| self.policy.is_active(t.status.as_ref()))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        if let Some(ticket) = existing {
            debug!(conversation_id = conversation.id, ticket_id = ticket.id, "reusing active ticket");
            return Ok(ticket);
        }

        let ticket = self.gateway.create_ticket(session, conversation.id).await?;
        info!(conversation_id = conversation.id, ticket_id = ticket.id, "ticket created");
        self.views.invalidate_tickets(conversation.id);
        Ok(ticket)
    }

    /// Add steps to the active ticket and announce them in the chat.
    ///
    /// Steps are created one by one; if one fails, those already created stay
    /// in place and [`NegotiationError::PartialProposal`] says how many. A
    /// failed contract upload does not fail the proposal and shows up as
    /// [`ContractStatus::Missing`].
    pub async fn create_proposal(
        &self,
        session: &Session,
        conversation: Option<&Conversation>,
        draft: ProposalDraft,
    ) -> Result<ProposalReceipt> {
        let conversation = conversation.ok_or(NegotiationError::NoConversationSelected)?;
        InputValidator::authorize_proposal(session, conversation)?;
        let drafts = InputValidator::proposal_steps(&draft.steps)?;
        if let Some(contract) = &draft.contract {
            InputValidator::contract_file(&contract.file_name, &contract.bytes)?;
        }

        let timer = OperationTimer::new("create_proposal");
        let ticket = self.find_or_create_active_ticket(session, conversation).await?;

        let mut created = Vec::with_capacity(drafts.len());
        for step in &drafts {
            let new_step = NewStep {
                ticket_id: ticket.id,
                title: step.title.clone(),
                price: step.price,
            };
            match self.gateway.create_step(session, &new_step).await {
                Ok(step) => created.push(step),
                Err(e) if created.is_empty() => {
                    error!(ticket_id = ticket.id, error = %e, "first proposal step could not be created");
                    return Err(e);
                }
                Err(e) => {
                    self.views.invalidate_tickets(conversation.id);
                    metrics::record_partial_failure("proposal_steps");
                    warn!(
                        ticket_id = ticket.id,
                        created = created.len(),
                        requested = drafts.len(),
                        error = %e,
                        "proposal step creation failed midway, created steps are kept"
                    );
                    return Err(NegotiationError::PartialProposal {
                        ticket_id: ticket.id,
                        created: created.len(),
                        requested: drafts.len(),
                        source: Box::new(e),
                    });
                }
            }
        }
        self.views.invalidate_tickets(conversation.id);

        let contract = match &draft.contract {
            None => ContractStatus::NotProvided,
            Some(file) => match self.upload_attachment(session, &ticket, file).await {
                Ok(()) => ContractStatus::Attached,
                Err(e) => {
                    metrics::record_partial_failure("contract_missing");
                    warn!(ticket_id = ticket.id, error = %e, "proposal continues without its contract");
                    ContractStatus::Missing { reason: e.to_string() }
                }
            },
        };

        order_steps(&mut created);
        let snapshot = ProposalSnapshot::capture(ticket.id, &created);
        let summary = proposal_summary(&snapshot);
        let message = self
            .messaging
            .send_message(session, conversation.id, &summary, MessageKind::Proposal, Some(snapshot))
            .await
            .map_err(|e| {
                metrics::record_partial_failure("proposal_not_announced");
                warn!(ticket_id = ticket.id, error = %e, "proposal steps saved but message failed");
                NegotiationError::ProposalNotAnnounced {
                    ticket_id: ticket.id,
                    source: Box::new(e),
                }
            })?;

        self.views.invalidate_tickets(conversation.id);
        self.views.invalidate_messages(conversation.id);
        self.views.invalidate_conversations();
        timer.finish();

        Ok(ProposalReceipt {
            ticket_id: ticket.id,
            total: total_price(&created),
            steps: created,
            contract,
            message,
        })
    }

    /// Move `ticket` to accepted, rejected or signed.
    ///
    /// Accepting also starts the first step.
    pub async fn update_ticket_status(
        &self,
        session: &Session,
        ticket: &Ticket,
        transition: TicketTransition,
    ) -> Result<Ticket> {
        let target = transition.target();
        if !transition.allowed_from(ticket.status.as_ref()) {
            warn!(ticket_id = ticket.id, from = ticket.status_str(), to = %target, "rejected ticket transition");
            return Err(NegotiationError::InvalidTransition {
                ticket_id: ticket.id,
                from: ticket.status_str().to_string(),
                to: target.to_string(),
            });
        }

        let patch = match transition {
            TicketTransition::Sign => TicketPatch {
                status: target.clone(),
                signed_at: Some(Utc::now()),
                signed_by: Some(session.user_id()),
            },
            TicketTransition::Accept | TicketTransition::Reject => TicketPatch {
                status: target.clone(),
                signed_at: None,
                signed_by: None,
            },
        };

        self.gateway
            .update_ticket(session, ticket.id, &patch)
            .await
            .inspect_err(|e| error!(ticket_id = ticket.id, to = %target, error = %e, "ticket status update failed"))?;
        self.views.invalidate_tickets(ticket.conversation_id);
        self.views.invalidate_messages(ticket.conversation_id);
        info!(ticket_id = ticket.id, status = %target, "ticket status updated");

        let mut updated = ticket.clone();
        updated.status = Some(target);
        if transition == TicketTransition::Sign {
            updated.signed_at = patch.signed_at;
            updated.signed_by = patch.signed_by;
        }

        if transition == TicketTransition::Accept {
            self.start_first_step(session, ticket).await.map_err(|e| {
                metrics::record_partial_failure("first_step_not_started");
                error!(ticket_id = ticket.id, error = %e, "ticket accepted but first step not started");
                NegotiationError::FirstStepNotStarted {
                    ticket_id: ticket.id,
                    source: Box::new(e),
                }
            })?;
        }

        Ok(updated)
    }

    async fn start_first_step(&self, session: &Session, ticket: &Ticket) -> Result<Option<Step>> {
        let steps = self.fresh_steps(session, ticket.id).await?;
        match steps.first().filter(|s| s.status == StepStatus::Pending) {
            Some(first) => self
                .set_step_status(session, ticket.conversation_id, first, StepStatus::InProgress)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Partially update a step, keeping the completion handshake consistent.
    ///
    /// Patches that touch the completion flags are checked against the step
    /// as the backend currently has it, not the caller's copy.
    pub async fn update_step(
        &self,
        session: &Session,
        conversation: ConversationId,
        step: &Step,
        patch: StepPatch,
    ) -> Result<Step> {
        if patch.touches_handshake() {
            let steps = self.fresh_steps(session, step.ticket_id).await?;
            let current = steps.iter().find(|s| s.id == step.id).ok_or_else(|| {
                NegotiationError::Validation(format!("step {} is not part of ticket {}", step.id, step.ticket_id))
            })?;
            return self.apply_step_patch(session, conversation, current, patch).await;
        }
        self.apply_step_patch(session, conversation, step, patch).await
    }

    /// Validate `patch` against `step` as given and write it.
    async fn apply_step_patch(
        &self,
        session: &Session,
        conversation: ConversationId,
        step: &Step,
        patch: StepPatch,
    ) -> Result<Step> {
        InputValidator::step_patch(step, &patch)?;
        self.gateway.update_step(session, step.id, &patch).await?;
        self.views.invalidate_tickets(conversation);
        debug!(step_id = step.id, ?patch, "step updated");
        Ok(patch.applied_to(step))
    }

    /// Delete a step; deleting the last one deletes its ticket as well.
    pub async fn delete_step(
        &self,
        session: &Session,
        conversation: Option<&Conversation>,
        step: &Step,
    ) -> Result<StepDeletion> {
        let conversation = conversation.ok_or(NegotiationError::NoConversationSelected)?;

        self.gateway.delete_step(session, step.id).await?;
        self.views.invalidate_tickets(conversation.id);

        let remaining = self.fresh_steps(session, step.ticket_id).await?;
        if !remaining.is_empty() {
            return Ok(StepDeletion::StepRemoved {
                remaining: remaining.len(),
            });
        }

        self.gateway.delete_ticket(session, step.ticket_id).await?;
        self.views.invalidate_tickets(conversation.id);
        if let Err(e) = self.cache.delete(&ArtifactCache::ticket_key(step.ticket_id)) {
            warn!(ticket_id = step.ticket_id, error = %e, "could not drop cached contract of deleted ticket");
        }
        info!(ticket_id = step.ticket_id, "last step deleted, ticket removed");
        Ok(StepDeletion::TicketRemoved {
            ticket_id: step.ticket_id,
        })
    }

    /// Provider side of the handshake: the work on `step` is done.
    ///
    /// Whether the caller is the provider is left to the presentation layer.
    pub async fn mark_step_completed(&self, session: &Session, conversation: ConversationId, step: &Step) -> Result<Step> {
        let patch = StepPatch {
            provider_completed: Some(true),
            status: Some(StepStatus::AwaitingConfirmation),
            ..StepPatch::default()
        };
        self.update_step(session, conversation, step, patch).await
    }

    /// Client side of the handshake: complete `step` and start the next one.
    ///
    /// Reads the step list fresh from the gateway both before confirming and
    /// before choosing the next step, so a stale view cannot skip a step or
    /// start two at once.
    pub async fn confirm_step_completion(&self, session: &Session, step: &Step, ticket: &Ticket) -> Result<StepAdvance> {
        let steps = self.fresh_steps(session, ticket.id).await?;
        let current = steps
            .iter()
            .find(|s| s.id == step.id)
            .ok_or_else(|| NegotiationError::Validation(format!("step {} is not part of ticket {}", step.id, ticket.id)))?;

        let patch = StepPatch {
            client_confirmed: Some(true),
            status: Some(StepStatus::Completed),
            ..StepPatch::default()
        };
        let confirmed = self
            .apply_step_patch(session, ticket.conversation_id, current, patch)
            .await?;

        let activated = self.start_next_step(session, ticket, &confirmed).await.map_err(|e| {
            metrics::record_partial_failure("next_step_not_started");
            error!(ticket_id = ticket.id, step_id = confirmed.id, error = %e, "step confirmed but next step not started");
            NegotiationError::NextStepNotStarted {
                ticket_id: ticket.id,
                confirmed: confirmed.id,
                source: Box::new(e),
            }
        })?;

        Ok(StepAdvance { confirmed, activated })
    }

    async fn start_next_step(&self, session: &Session, ticket: &Ticket, confirmed: &Step) -> Result<Option<Step>> {
        let remaining = self.fresh_steps(session, ticket.id).await?;
        match remaining.iter().find(|s| s.id > confirmed.id) {
            Some(next) if next.status == StepStatus::Pending => self
                .set_step_status(session, ticket.conversation_id, next, StepStatus::InProgress)
                .await
                .map(Some),
            Some(next) => {
                debug!(step_id = next.id, status = ?next.status, "next step left as is");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_step_status(
        &self,
        session: &Session,
        conversation: ConversationId,
        step: &Step,
        status: StepStatus,
    ) -> Result<Step> {
        let patch = StepPatch {
            status: Some(status),
            ..StepPatch::default()
        };
        self.apply_step_patch(session, conversation, step, patch).await
    }

    pub(crate) async fn fresh_steps(&self, session: &Session, ticket: TicketId) -> Result<Vec<Step>> {
        let mut steps = self.gateway.list_steps(session, ticket).await?;
        order_steps(&mut steps);
        Ok(steps)
    }
}
