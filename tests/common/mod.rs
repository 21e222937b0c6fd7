//! In-memory backend shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

use negotiation_core::config::AppConfig;
use negotiation_core::error::{NegotiationError, Result};
use negotiation_core::gateway::{Download, Gateway};
use negotiation_core::models::{
    Attachment, ContractFile, ConversationId, Money, NewMessage, NewStep, RawConversation, Role, Step, StepId,
    StepPatch, StepStatus, Ticket, TicketId, TicketPatch, TicketStatus, User, UserId, WireMessage,
};
use negotiation_core::service::NegotiationService;
use negotiation_core::session::Session;

pub const PROVIDER_ID: UserId = 1;
pub const CLIENT_ID: UserId = 2;
pub const OTHER_PROVIDER_ID: UserId = 3;
pub const PROVIDER_PASSWORD: &str = "segredo123";
pub const CLIENT_PASSWORD: &str = "cliente456";

#[derive(Default)]
struct State {
    next_id: i64,
    users: HashMap<UserId, User>,
    conversations: Vec<RawConversation>,
    messages: Vec<WireMessage>,
    tickets: Vec<Ticket>,
    steps: Vec<Step>,
    attachments: Vec<Attachment>,
    files: HashMap<String, Download>,
    passwords: HashMap<String, String>,
    calls: HashMap<&'static str, usize>,
    step_creations_left: Option<usize>,
    step_updates_left: Option<usize>,
    failing_users: HashSet<UserId>,
    fail_uploads: bool,
    fail_ticket_updates: bool,
    fail_messages: bool,
    fail_message_listing: bool,
}

/// Backend double with request counters and failure injection
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
    ticket_listing_delay: Mutex<Option<Duration>>,
}

fn at(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).single()
}

fn injected(method: &str, endpoint: &str) -> NegotiationError {
    NegotiationError::Gateway {
        method: method.to_string(),
        endpoint: endpoint.to_string(),
        status: 500,
        message: "injected failure".to_string(),
    }
}

impl FakeBackend {
    /// Backend preloaded with a provider, a client and a second provider.
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        {
            let mut state = backend.state.lock().unwrap();
            state.next_id = 100;
            for (id, name, email, role) in [
                (PROVIDER_ID, "Paula Prestadora", "paula@example.com", Role::Provider),
                (CLIENT_ID, "Carlos Cliente", "carlos@example.com", Role::Client),
                (OTHER_PROVIDER_ID, "Pedro Prestador", "pedro@example.com", Role::Provider),
            ] {
                state.users.insert(
                    id,
                    User {
                        id,
                        name: name.to_string(),
                        email: email.to_string(),
                        role: Some(role),
                    },
                );
            }
            state
                .passwords
                .insert("paula@example.com".to_string(), PROVIDER_PASSWORD.to_string());
            state
                .passwords
                .insert("carlos@example.com".to_string(), CLIENT_PASSWORD.to_string());
        }
        Arc::new(backend)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn record(&self, call: &'static str) {
        self.with_state(|s| *s.calls.entry(call).or_default() += 1);
    }

    /// Number of times `call` reached the backend.
    pub fn calls(&self, call: &'static str) -> usize {
        self.with_state(|s| s.calls.get(call).copied().unwrap_or(0))
    }

    /// Requests of any kind.
    pub fn total_calls(&self) -> usize {
        self.with_state(|s| s.calls.values().sum())
    }

    pub fn reset_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn add_user(&self, id: UserId, name: &str, role: Option<Role>) {
        self.with_state(|s| {
            s.users.insert(
                id,
                User {
                    id,
                    name: name.to_string(),
                    email: format!("user{id}@example.com"),
                    role,
                },
            );
        });
    }

    /// Store a raw conversation record; `id` may be any JSON value.
    pub fn add_raw_conversation(&self, id: serde_json::Value, first: UserId, second: UserId, activity: i64) {
        self.with_state(|s| {
            s.conversations.push(RawConversation {
                id: Some(id),
                first_user_id: Some(first),
                second_user_id: Some(second),
                created_at: at(0),
                updated_at: at(activity),
            });
        });
    }

    pub fn add_conversation(&self, id: ConversationId, first: UserId, second: UserId) {
        self.add_raw_conversation(json!(id), first, second, id);
    }

    pub fn add_ticket(&self, conversation: ConversationId, status: Option<TicketStatus>) -> Ticket {
        self.with_state(|s| {
            s.next_id += 1;
            let ticket = Ticket {
                id: s.next_id,
                conversation_id: conversation,
                status,
                created_at: at(s.next_id),
                updated_at: at(s.next_id),
                attachment_path: None,
                signed_by: None,
                signed_at: None,
            };
            s.tickets.push(ticket.clone());
            ticket
        })
    }

    pub fn add_step(&self, ticket: TicketId, title: &str, cents: i64) -> Step {
        self.with_state(|s| {
            s.next_id += 1;
            let step = Step {
                id: s.next_id,
                ticket_id: ticket,
                title: title.to_string(),
                price: Money::from_cents(cents),
                status: StepStatus::Pending,
                provider_completed: false,
                client_confirmed: false,
            };
            s.steps.push(step.clone());
            step
        })
    }

    pub fn set_attachment_path(&self, ticket: TicketId, locator: &str) {
        self.with_state(|s| {
            if let Some(t) = s.tickets.iter_mut().find(|t| t.id == ticket) {
                t.attachment_path = Some(locator.to_string());
            }
        });
    }

    pub fn add_file(&self, locator: &str, content_type: Option<&str>, bytes: &[u8]) {
        self.with_state(|s| {
            s.files.insert(
                locator.to_string(),
                Download {
                    content_type: content_type.map(str::to_string),
                    bytes: bytes.to_vec(),
                },
            );
        });
    }

    pub fn add_attachment(&self, ticket: TicketId, locator: &str, uploaded: i64) {
        self.with_state(|s| {
            s.next_id += 1;
            s.attachments.push(Attachment {
                id: s.next_id,
                ticket_id: Some(ticket),
                file_path: locator.to_string(),
                uploaded_at: at(uploaded),
            });
        });
    }

    pub fn add_legacy_message(&self, conversation: ConversationId, sender: UserId, content: &str, kind: Option<&str>) {
        self.with_state(|s| {
            s.next_id += 1;
            s.messages.push(WireMessage {
                id: s.next_id,
                conversation_id: conversation,
                sender_id: sender,
                content: content.to_string(),
                created_at: at(s.next_id),
                kind: kind.map(str::to_string),
                proposal: None,
            });
        });
    }

    pub fn conversations(&self) -> Vec<RawConversation> {
        self.with_state(|s| s.conversations.clone())
    }

    pub fn tickets_for(&self, conversation: ConversationId) -> Vec<Ticket> {
        self.with_state(|s| {
            s.tickets
                .iter()
                .filter(|t| t.conversation_id == conversation)
                .cloned()
                .collect()
        })
    }

    pub fn ticket(&self, id: TicketId) -> Option<Ticket> {
        self.with_state(|s| s.tickets.iter().find(|t| t.id == id).cloned())
    }

    pub fn steps_for(&self, ticket: TicketId) -> Vec<Step> {
        self.with_state(|s| {
            let mut steps: Vec<Step> = s.steps.iter().filter(|st| st.ticket_id == ticket).cloned().collect();
            steps.sort_by_key(|st| st.id);
            steps
        })
    }

    pub fn step(&self, id: StepId) -> Option<Step> {
        self.with_state(|s| s.steps.iter().find(|st| st.id == id).cloned())
    }

    pub fn messages_for(&self, conversation: ConversationId) -> Vec<WireMessage> {
        self.with_state(|s| {
            s.messages
                .iter()
                .filter(|m| m.conversation_id == conversation)
                .cloned()
                .collect()
        })
    }

    pub fn attachments_for(&self, ticket: TicketId) -> Vec<Attachment> {
        self.with_state(|s| {
            s.attachments
                .iter()
                .filter(|a| a.ticket_id == Some(ticket))
                .cloned()
                .collect()
        })
    }

    /// Let `n` more step creations succeed, then fail the rest.
    pub fn fail_step_creation_after(&self, n: usize) {
        self.with_state(|s| s.step_creations_left = Some(n));
    }

    /// Let `n` more step updates succeed, then fail the rest.
    pub fn fail_step_updates_after(&self, n: usize) {
        self.with_state(|s| s.step_updates_left = Some(n));
    }

    pub fn fail_uploads(&self) {
        self.with_state(|s| s.fail_uploads = true);
    }

    pub fn fail_ticket_updates(&self) {
        self.with_state(|s| s.fail_ticket_updates = true);
    }

    pub fn fail_messages(&self) {
        self.with_state(|s| s.fail_messages = true);
    }

    pub fn fail_message_listing(&self, fail: bool) {
        self.with_state(|s| s.fail_message_listing = fail);
    }

    pub fn fail_user_lookup(&self, id: UserId) {
        self.with_state(|s| {
            s.failing_users.insert(id);
        });
    }

    /// Slow down ticket listing so concurrent callers overlap.
    pub fn delay_ticket_listing(&self, delay: Duration) {
        *self.ticket_listing_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Gateway for FakeBackend {
    async fn list_conversations(&self, _session: &Session) -> Result<Vec<RawConversation>> {
        self.record("list_conversations");
        Ok(self.conversations())
    }

    async fn create_conversation(&self, _session: &Session, first: UserId, second: UserId) -> Result<RawConversation> {
        self.record("create_conversation");
        Ok(self.with_state(|s| {
            s.next_id += 1;
            let raw = RawConversation {
                id: Some(json!(s.next_id)),
                first_user_id: Some(first),
                second_user_id: Some(second),
                created_at: at(s.next_id),
                updated_at: at(s.next_id),
            };
            s.conversations.push(raw.clone());
            raw
        }))
    }

    async fn fetch_user(&self, _session: &Session, id: UserId) -> Result<User> {
        self.record("fetch_user");
        self.with_state(|s| {
            if s.failing_users.contains(&id) {
                return Err(injected("GET", &format!("/users/{id}")));
            }
            s.users.get(&id).cloned().ok_or_else(|| NegotiationError::Gateway {
                method: "GET".to_string(),
                endpoint: format!("/users/{id}"),
                status: 404,
                message: "not found".to_string(),
            })
        })
    }

    async fn list_messages(&self, _session: &Session, conversation: ConversationId) -> Result<Vec<WireMessage>> {
        self.record("list_messages");
        if self.with_state(|s| s.fail_message_listing) {
            return Err(injected("GET", "/message/conversation"));
        }
        Ok(self.messages_for(conversation))
    }

    async fn send_message(&self, _session: &Session, message: &NewMessage) -> Result<WireMessage> {
        self.record("send_message");
        self.with_state(|s| {
            if s.fail_messages {
                return Err(injected("POST", "/message"));
            }
            s.next_id += 1;
            let wire = WireMessage {
                id: s.next_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                content: message.content.clone(),
                created_at: at(s.next_id),
                kind: Some(message.kind.as_str().to_string()),
                proposal: message.proposal.clone(),
            };
            s.messages.push(wire.clone());
            Ok(wire)
        })
    }

    async fn list_tickets(&self, _session: &Session, conversation: ConversationId) -> Result<Vec<Ticket>> {
        self.record("list_tickets");
        let delay = *self.ticket_listing_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.tickets_for(conversation))
    }

    async fn create_ticket(&self, _session: &Session, conversation: ConversationId) -> Result<Ticket> {
        self.record("create_ticket");
        Ok(self.add_ticket(conversation, Some(TicketStatus::Pending)))
    }

    async fn update_ticket(&self, _session: &Session, ticket: TicketId, patch: &TicketPatch) -> Result<()> {
        self.record("update_ticket");
        self.with_state(|s| {
            if s.fail_ticket_updates {
                return Err(injected("PATCH", &format!("/ticket/{ticket}")));
            }
            let t = s
                .tickets
                .iter_mut()
                .find(|t| t.id == ticket)
                .ok_or_else(|| injected("PATCH", &format!("/ticket/{ticket}")))?;
            t.status = Some(patch.status.clone());
            if patch.signed_at.is_some() {
                t.signed_at = patch.signed_at;
            }
            if patch.signed_by.is_some() {
                t.signed_by = patch.signed_by;
            }
            Ok(())
        })
    }

    async fn delete_ticket(&self, _session: &Session, ticket: TicketId) -> Result<()> {
        self.record("delete_ticket");
        self.with_state(|s| s.tickets.retain(|t| t.id != ticket));
        Ok(())
    }

    async fn list_steps(&self, _session: &Session, ticket: TicketId) -> Result<Vec<Step>> {
        self.record("list_steps");
        // Reverse creation order, so callers must sort themselves.
        let mut steps = self.steps_for(ticket);
        steps.reverse();
        Ok(steps)
    }

    async fn create_step(&self, _session: &Session, step: &NewStep) -> Result<Step> {
        self.record("create_step");
        let allowed = self.with_state(|s| match s.step_creations_left.as_mut() {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        });
        if !allowed {
            return Err(injected("POST", "/step"));
        }
        Ok(self.add_step(step.ticket_id, &step.title, step.price.cents()))
    }

    async fn update_step(&self, _session: &Session, step: StepId, patch: &StepPatch) -> Result<()> {
        self.record("update_step");
        self.with_state(|s| {
            match s.step_updates_left.as_mut() {
                Some(0) => return Err(injected("PUT", &format!("/step/{step}"))),
                Some(left) => *left -= 1,
                None => {}
            }
            let existing = s
                .steps
                .iter_mut()
                .find(|st| st.id == step)
                .ok_or_else(|| injected("PUT", &format!("/step/{step}")))?;
            *existing = patch.applied_to(existing);
            Ok(())
        })
    }

    async fn delete_step(&self, _session: &Session, step: StepId) -> Result<()> {
        self.record("delete_step");
        self.with_state(|s| s.steps.retain(|st| st.id != step));
        Ok(())
    }

    async fn upload_pdf(&self, _session: &Session, ticket: TicketId, file: &ContractFile) -> Result<()> {
        self.record("upload_pdf");
        if self.with_state(|s| s.fail_uploads) {
            return Err(injected("POST", &format!("/upload/pdf/{ticket}")));
        }
        let locator = format!("/uploads/ticket-{ticket}-{}", file.file_name);
        self.add_file(&locator, Some("application/pdf"), &file.bytes);
        self.add_attachment(ticket, &locator, 10_000);
        Ok(())
    }

    async fn list_attachments(&self, _session: &Session, ticket: TicketId) -> Result<Vec<Attachment>> {
        self.record("list_attachments");
        Ok(self.attachments_for(ticket))
    }

    async fn download(&self, _session: &Session, locator: &str) -> Result<Download> {
        self.record("download");
        self.with_state(|s| {
            s.files.get(locator).cloned().ok_or_else(|| NegotiationError::Gateway {
                method: "GET".to_string(),
                endpoint: locator.to_string(),
                status: 404,
                message: "not found".to_string(),
            })
        })
    }

    async fn validate_password(&self, email: &str, password: &str) -> Result<bool> {
        self.record("validate_password");
        Ok(self.with_state(|s| s.passwords.get(email).is_some_and(|p| p == password)))
    }
}

/// A session for one of the preloaded users.
pub fn session(backend: &FakeBackend, id: UserId) -> Session {
    let user = backend.with_state(|s| s.users.get(&id).cloned()).unwrap_or_else(|| User::placeholder(id));
    Session::new(user, Some(format!("token-{id}")))
}

/// Service over `backend` with its artifact cache inside `dir`.
pub fn service(backend: &Arc<FakeBackend>, dir: &TempDir) -> NegotiationService {
    let mut config = AppConfig::default();
    config.cache.path = dir.path().join("artifacts").to_string_lossy().into_owned();
    config.polling.interval_ms = 20;
    let gateway: Arc<dyn Gateway> = backend.clone();
    NegotiationService::with_gateway(gateway, &config).unwrap()
}

/// A PDF-looking contract.
pub fn contract(name: &str) -> ContractFile {
    ContractFile {
        file_name: name.to_string(),
        bytes: b"%PDF-1.4 contract body".to_vec(),
    }
}
