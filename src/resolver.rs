//! Conversation resolver: joins raw conversation records with counterpart users.
//!
//! Malformed records are dropped with a diagnostic, never turned into errors,
//! and a failed user lookup degrades to [`User::placeholder`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{NegotiationError, Result};
use crate::gateway::Gateway;
use crate::locks::KeyedLocks;
use crate::models::{Conversation, ConversationId, RawConversation, User, UserId};
use crate::session::Session;
use crate::views::ViewCache;

/// Produces the session user's conversations with counterpart data resolved
pub struct ConversationResolver {
    gateway: Arc<dyn Gateway>,
    views: Arc<ViewCache>,
    start_locks: KeyedLocks<(UserId, UserId)>,
}

impl ConversationResolver {
    /// Create a resolver over `gateway`, caching into `views`.
    pub fn new(gateway: Arc<dyn Gateway>, views: Arc<ViewCache>) -> Self {
        Self {
            gateway,
            views,
            start_locks: KeyedLocks::default(),
        }
    }

    /// All valid conversations, most recent activity first.
    pub async fn conversations(&self, session: &Session) -> Result<Vec<Conversation>> {
        if let Some(cached) = self.views.conversations.get(&()) {
            return Ok(cached);
        }

        let generation = self.views.conversations.generation(&());
        let raw = self.gateway.list_conversations(session).await?;
        let users = self.fetch_counterparts(session, &raw).await;
        let conversations = derive_conversations(session.user_id(), &raw, &users);
        debug!(count = conversations.len(), "resolved conversations");

        self.views.conversations.store((), generation, conversations.clone());
        Ok(conversations)
    }

    /// The full list, or only the conversation with `counterpart` when one is requested.
    pub async fn resolve(&self, session: &Session, counterpart: Option<UserId>) -> Result<Vec<Conversation>> {
        let conversations = self.conversations(session).await?;
        Ok(match counterpart {
            Some(id) => conversations
                .into_iter()
                .filter(|c| c.counterpart.id == id)
                .take(1)
                .collect(),
            None => conversations,
        })
    }

    /// A single conversation by id.
    pub async fn conversation(&self, session: &Session, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self
            .conversations(session)
            .await?
            .into_iter()
            .find(|c| c.id == id))
    }

    /// Open a conversation with `counterpart`, reusing an existing one for the same pair.
    pub async fn start_conversation(&self, session: &Session, counterpart: UserId) -> Result<Conversation> {
        let me = session.user_id();
        if counterpart == me {
            return Err(NegotiationError::Validation(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let _guard = self.start_locks.lock(&(me.min(counterpart), me.max(counterpart))).await;

        let existing = self
            .gateway
            .list_conversations(session)
            .await?
            .into_iter()
            .find(|raw| raw.numeric_id().is_some() && raw.connects(me, counterpart));

        let (raw, created) = match existing {
            Some(raw) => (raw, false),
            None => (self.gateway.create_conversation(session, me, counterpart).await?, true),
        };

        let id = raw.numeric_id().ok_or_else(|| NegotiationError::Decode {
            endpoint: "/conversation".to_string(),
            message: "conversation record has no numeric id".to_string(),
        })?;

        if created {
            info!(conversation_id = id, counterpart, "conversation created");
            self.views.invalidate_conversations();
        } else {
            debug!(conversation_id = id, counterpart, "reusing existing conversation");
        }

        let user = self.fetch_user(session, counterpart).await;
        Ok(Conversation {
            id,
            participants: (me, counterpart),
            counterpart: user,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }

    /// One request per distinct counterpart, issued concurrently.
    async fn fetch_counterparts(&self, session: &Session, raw: &[RawConversation]) -> HashMap<UserId, User> {
        let me = session.user_id();
        let ids: BTreeSet<UserId> = raw.iter().filter_map(|r| counterpart_id(me, r)).collect();

        let users = join_all(ids.into_iter().map(|id| self.fetch_user(session, id))).await;
        users.into_iter().map(|u| (u.id, u)).collect()
    }

    async fn fetch_user(&self, session: &Session, id: UserId) -> User {
        match self.gateway.fetch_user(session, id).await {
            Ok(user) => user,
            Err(e) => {
                warn!(user_id = id, error = %e, "user lookup failed, using placeholder");
                User::placeholder(id)
            }
        }
    }
}

fn counterpart_id(me: UserId, raw: &RawConversation) -> Option<UserId> {
    match (raw.first_user_id, raw.second_user_id) {
        (Some(a), Some(b)) if a == me => Some(b),
        (Some(a), Some(b)) if b == me => Some(a),
        _ => None,
    }
}

/// Validate raw records and attach counterparts, most recent activity first.
///
/// Records without a numeric id, without both participants, or not involving
/// `me` are dropped. Missing users become placeholders.
#[must_use]
pub fn derive_conversations(me: UserId, raw: &[RawConversation], users: &HashMap<UserId, User>) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = raw
        .iter()
        .filter_map(|record| {
            let Some(id) = record.numeric_id() else {
                warn!(id = ?record.id, "dropping conversation without a numeric id");
                return None;
            };
            let Some(other) = counterpart_id(me, record) else {
                warn!(conversation_id = id, "dropping conversation the session user is not part of");
                return None;
            };
            let counterpart = users.get(&other).cloned().unwrap_or_else(|| User::placeholder(other));
            Some(Conversation {
                id,
                participants: (me, other),
                counterpart,
                created_at: record.created_at,
                updated_at: record.updated_at,
            })
        })
        .collect();

    conversations.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| b.id.cmp(&a.id))
    });
    conversations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn raw(id: serde_json::Value, a: UserId, b: UserId, day: u32) -> RawConversation {
        RawConversation {
            id: Some(id),
            first_user_id: Some(a),
            second_user_id: Some(b),
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single(),
            updated_at: None,
        }
    }

    #[test]
    fn test_derive_sorts_by_activity_and_drops_invalid() {
        let records = vec![
            raw(json!(1), 1, 2, 1),
            raw(json!("abc"), 1, 3, 5),
            raw(json!(3), 4, 1, 3),
            raw(json!(4), 5, 6, 4),
        ];
        let users = HashMap::from([(2, User::placeholder(2))]);
        let conversations = derive_conversations(1, &records, &users);

        let ids: Vec<_> = conversations.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(conversations[0].counterpart.id, 4);
        assert_eq!(conversations[0].counterpart.name, "Usuário");
    }
}
