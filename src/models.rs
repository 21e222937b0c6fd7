//! Data models for the negotiation workflow
//!
//! The backend's records are relational but loosely typed: ids may be missing,
//! flags arrive as `0`/`1` or strings, prices as numbers or decimal strings.
//! The wire structs here absorb that looseness at the boundary so the engine
//! only ever sees well-formed values.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// User identifier
pub type UserId = i64;
/// Conversation identifier
pub type ConversationId = i64;
/// Ticket identifier
pub type TicketId = i64;
/// Step identifier
pub type StepId = i64;
/// Message identifier
pub type MessageId = i64;
/// Attachment identifier
pub type AttachmentId = i64;

/// Which side of the marketplace a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Hires services ("contratante")
    #[serde(alias = "contratante")]
    Client,
    /// Offers services ("prestador")
    #[serde(alias = "prestador")]
    Provider,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "client" | "contratante" => Some(Self::Client),
            "provider" | "prestador" => Some(Self::Provider),
            _ => None,
        }
    }
}

/// A marketplace user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique id
    pub id: UserId,
    /// Display name
    #[serde(default, alias = "nome")]
    pub name: String,
    /// Login email
    #[serde(default)]
    pub email: String,
    /// Marketplace side, `None` when unknown
    #[serde(default, deserialize_with = "de::role")]
    pub role: Option<Role>,
}

impl User {
    /// Stand-in used when a counterpart lookup fails.
    #[must_use]
    pub fn placeholder(id: UserId) -> Self {
        Self {
            id,
            name: "Usuário".to_string(),
            email: String::new(),
            role: None,
        }
    }
}

/// A conversation record as the backend returns it, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConversation {
    /// Expected to be numeric; anything else makes the record unusable
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// First participant
    #[serde(default, alias = "user1_id", alias = "client_id", deserialize_with = "de::loose_id")]
    pub first_user_id: Option<UserId>,
    /// Second participant
    #[serde(default, alias = "user2_id", alias = "provider_id", deserialize_with = "de::loose_id")]
    pub second_user_id: Option<UserId>,
    /// Creation time
    #[serde(default, deserialize_with = "de::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last activity time
    #[serde(default, deserialize_with = "de::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RawConversation {
    /// The id as a number, if it is one. Numeric strings are accepted.
    #[must_use]
    pub fn numeric_id(&self) -> Option<ConversationId> {
        match self.id.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// True when `a` and `b` are this conversation's participants, in either order.
    #[must_use]
    pub fn connects(&self, a: UserId, b: UserId) -> bool {
        matches!(
            (self.first_user_id, self.second_user_id),
            (Some(x), Some(y)) if (x == a && y == b) || (x == b && y == a)
        )
    }
}

/// A validated conversation with its counterpart resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Numeric id
    pub id: ConversationId,
    /// Both participants, unordered
    pub participants: (UserId, UserId),
    /// The participant who is not the session user
    pub counterpart: User,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Last activity time
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Most recent known activity, used for ordering.
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

/// Kind of chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Free text
    Plain,
    /// A proposal announcement carrying a snapshot
    Proposal,
}

impl MessageKind {
    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Proposal => "proposal",
        }
    }
}

/// One step as frozen inside a proposal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStep {
    /// Step title at send time
    pub title: String,
    /// Step price at send time
    pub price: Money,
}

/// Immutable copy of a ticket's steps and total at the moment it was proposed.
///
/// Later changes to the live ticket never flow back into this snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSnapshot {
    /// Ticket the proposal belongs to
    pub ticket_id: TicketId,
    /// Steps in order
    pub steps: Vec<SnapshotStep>,
    /// Sum of step prices
    pub total: Money,
}

impl ProposalSnapshot {
    /// Freeze the given steps.
    #[must_use]
    pub fn capture(ticket_id: TicketId, steps: &[Step]) -> Self {
        Self {
            ticket_id,
            steps: steps
                .iter()
                .map(|s| SnapshotStep {
                    title: s.title.clone(),
                    price: s.price,
                })
                .collect(),
            total: total_price(steps),
        }
    }
}

/// A chat message as the backend returns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique id
    pub id: MessageId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Text content
    #[serde(default, alias = "text")]
    pub content: String,
    /// Creation time
    #[serde(default, deserialize_with = "de::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Explicit kind tag; older messages lack it
    #[serde(default)]
    pub kind: Option<String>,
    /// Embedded snapshot for proposal messages
    #[serde(default, alias = "proposal_data")]
    pub proposal: Option<ProposalSnapshot>,
}

/// A chat message after kind resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique id
    pub id: MessageId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Text content
    pub content: String,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Resolved kind
    pub kind: MessageKind,
    /// Snapshot, present for proposals that embedded one
    pub proposal: Option<ProposalSnapshot>,
}

/// Body of a message send
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Text content
    pub content: String,
    /// Explicit kind tag
    pub kind: MessageKind,
    /// Snapshot for proposal messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalSnapshot>,
}

/// Ticket status
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TicketStatus {
    /// Waiting for the client's decision
    Pending,
    /// Accepted by the client
    Accepted,
    /// Declined by the client (terminal)
    Rejected,
    /// Accepted and signed
    Signed,
    /// Work under way
    InProgress,
    /// Work finished
    Completed,
    /// Called off
    Cancelled,
    /// Any status this crate does not know
    Other(String),
}

impl TicketStatus {
    /// Parse a wire status. Unknown values are kept verbatim.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Self::Pending,
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            "signed" => Self::Signed,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "cancelled" | "canceled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Signed => "signed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TicketStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TicketStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A negotiation instance inside a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique id
    pub id: TicketId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// `None` when the backend sent an empty or missing status
    #[serde(default, deserialize_with = "de::ticket_status")]
    pub status: Option<TicketStatus>,
    /// Creation time
    #[serde(default, deserialize_with = "de::timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time
    #[serde(default, deserialize_with = "de::timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Direct locator of the attached contract, when the backend tracks one
    #[serde(default, alias = "pdf_path", alias = "contract_path", alias = "file_path")]
    pub attachment_path: Option<String>,
    /// Who signed
    #[serde(default)]
    pub signed_by: Option<UserId>,
    /// When it was signed
    #[serde(default, deserialize_with = "de::timestamp")]
    pub signed_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Status as a display string, `""` when empty.
    #[must_use]
    pub fn status_str(&self) -> &str {
        self.status.as_ref().map_or("", TicketStatus::as_str)
    }
}

/// Body of a ticket status update
#[derive(Debug, Clone, Serialize)]
pub struct TicketPatch {
    /// New status
    pub status: TicketStatus,
    /// Signing time, for signed tickets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    /// Signer, for signed tickets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<UserId>,
}

/// Step progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    #[default]
    Pending,
    /// The live step
    InProgress,
    /// Provider says done, client has not confirmed
    AwaitingConfirmation,
    /// Client confirmed
    Completed,
    /// Called off
    Cancelled,
}

impl StepStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "awaiting_confirmation" => Some(Self::AwaitingConfirmation),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One priced unit of work inside a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id
    pub id: StepId,
    /// Owning ticket
    pub ticket_id: TicketId,
    /// Short description
    #[serde(default)]
    pub title: String,
    /// Price
    #[serde(default)]
    pub price: Money,
    /// Progress
    #[serde(default, deserialize_with = "de::step_status")]
    pub status: StepStatus,
    /// Provider declared the work done
    #[serde(default, deserialize_with = "de::bool_ish")]
    pub provider_completed: bool,
    /// Client accepted the provider's declaration
    #[serde(default, deserialize_with = "de::bool_ish")]
    pub client_confirmed: bool,
}

/// Body of a step creation
#[derive(Debug, Clone, Serialize)]
pub struct NewStep {
    /// Owning ticket
    pub ticket_id: TicketId,
    /// Short description
    pub title: String,
    /// Price
    pub price: Money,
}

/// Partial step update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepPatch {
    /// New title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Money>,
    /// New status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    /// Provider completion flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_completed: Option<bool>,
    /// Client confirmation flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_confirmed: Option<bool>,
}

impl StepPatch {
    /// True when the patch sets either completion flag.
    #[must_use]
    pub const fn touches_handshake(&self) -> bool {
        self.provider_completed.is_some() || self.client_confirmed.is_some()
    }

    /// Apply the patch to a copy of `step`.
    #[must_use]
    pub fn applied_to(&self, step: &Step) -> Step {
        Step {
            id: step.id,
            ticket_id: step.ticket_id,
            title: self.title.clone().unwrap_or_else(|| step.title.clone()),
            price: self.price.unwrap_or(step.price),
            status: self.status.unwrap_or(step.status),
            provider_completed: self.provider_completed.unwrap_or(step.provider_completed),
            client_confirmed: self.client_confirmed.unwrap_or(step.client_confirmed),
        }
    }
}

/// A step as entered while composing a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDraft {
    /// Short description
    pub title: String,
    /// Price
    pub price: Money,
}

impl StepDraft {
    /// Build a draft.
    pub fn new(title: impl Into<String>, price: Money) -> Self {
        Self {
            title: title.into(),
            price,
        }
    }
}

/// A contract document on its way to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractFile {
    /// Original file name
    pub file_name: String,
    /// Raw PDF bytes
    pub bytes: Vec<u8>,
}

/// A stored attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique id
    pub id: AttachmentId,
    /// Owning ticket
    #[serde(default)]
    pub ticket_id: Option<TicketId>,
    /// Locator the file can be fetched from
    #[serde(alias = "path", alias = "file", alias = "url", alias = "pdf_path")]
    pub file_path: String,
    /// Upload time
    #[serde(default, alias = "created_at", deserialize_with = "de::timestamp")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// A ticket with its steps, as the presentation layer consumes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketView {
    /// The ticket
    pub ticket: Ticket,
    /// Steps in order
    pub steps: Vec<Step>,
    /// Sum of step prices, computed when the view is built
    pub total: Money,
}

impl TicketView {
    /// Order the steps and compute the total.
    #[must_use]
    pub fn new(ticket: Ticket, mut steps: Vec<Step>) -> Self {
        order_steps(&mut steps);
        let total = total_price(&steps);
        Self {
            ticket,
            steps,
            total,
        }
    }
}

/// Steps are ordered by creation, i.e. ascending id.
pub fn order_steps(steps: &mut [Step]) {
    steps.sort_by_key(|s| s.id);
}

/// Sum of the prices of `steps`.
#[must_use]
pub fn total_price(steps: &[Step]) -> Money {
    steps.iter().map(|s| s.price).sum()
}

/// Currency amount held as whole cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Largest amount accepted from input or the backend (one billion).
    pub const MAX: Self = Self(100_000_000_000);

    /// Amount from cents
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Amount in cents
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Amount from a decimal value, rounded to the cent; `None` when not
    /// finite or beyond [`Money::MAX`] in either direction.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn from_decimal(value: f64) -> Option<Self> {
        let cents = (value * 100.0).round();
        if !cents.is_finite() || cents.abs() > Self::MAX.0 as f64 {
            return None;
        }
        Some(Self(cents as i64))
    }

    /// Parse `"25.50"`, `"25,50"` or `"25"`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().replace(',', ".");
        if normalized.is_empty() {
            return None;
        }
        normalized.parse::<f64>().ok().and_then(Self::from_decimal)
    }

    /// Strictly above zero
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Strictly below zero
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Above [`Money::MAX`]
    #[must_use]
    pub const fn exceeds_max(self) -> bool {
        self.0 > Self::MAX.0
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_decimal())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self::from_decimal(n)
                .ok_or_else(|| serde::de::Error::custom(format!("amount out of range: {n}"))),
            Raw::Text(s) => Self::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {s:?}"))),
        }
    }
}

/// Lenient deserializers for loosely typed backend fields.
pub(crate) mod de {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    use super::{Role, StepStatus, TicketStatus};

    /// Above this an epoch number is taken as milliseconds.
    const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

    /// Strings in the usual formats or epoch numbers; anything else reads as `None`.
    pub(crate) fn timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
            Some(serde_json::Value::String(s)) => parse_timestamp(&s),
            Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|epoch| {
                if epoch.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD.unsigned_abs() {
                    DateTime::from_timestamp_millis(epoch)
                } else {
                    DateTime::from_timestamp(epoch, 0)
                }
            }),
            _ => None,
        })
    }

    /// Numbers or numeric strings; anything else reads as `None`.
    pub(crate) fn loose_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                    .map(|n| n.and_utc())
            })
    }

    pub(crate) fn bool_ish<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
            Text(String),
        }

        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Bool(b)) => b,
            Some(Raw::Int(n)) => n != 0,
            Some(Raw::Text(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
            None => false,
        })
    }

    pub(crate) fn role<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(Role::parse))
    }

    pub(crate) fn ticket_status<'de, D>(deserializer: D) -> Result<Option<TicketStatus>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .filter(|s| !s.trim().is_empty())
            .map(|s| TicketStatus::parse(&s)))
    }

    pub(crate) fn step_status<'de, D>(deserializer: D) -> Result<StepStatus, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(StepStatus::parse).unwrap_or_default())
    }
}
