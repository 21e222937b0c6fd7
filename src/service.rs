use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cache::ArtifactCache;
use crate::config::AppConfig;
use crate::engine::NegotiationEngine;
use crate::error::NegotiationError;
use crate::gateway::{Gateway, HttpGateway};
use crate::messaging::MessagingChannel;
use crate::models::{Conversation, ConversationId, User, UserId};
use crate::resolver::ConversationResolver;
use crate::session::Session;
use crate::views::{Selection, ViewCache};

/// Everything the presentation layer talks to, wired from one configuration.
pub struct NegotiationService {
    gateway: Arc<dyn Gateway>,
    resolver: ConversationResolver,
    engine: NegotiationEngine,
    selection: Arc<Selection>,
    views: Arc<ViewCache>,
    cache: ArtifactCache,
}

impl NegotiationService {
    /// Build against the REST backend named in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let gateway = HttpGateway::new(config.api.base_url.clone(), config.timeout())
            .context("Failed to build HTTP gateway")?;
        info!(base_url = %config.api.base_url, "using REST gateway");
        Self::with_gateway(Arc::new(gateway), config)
    }

    /// Build against any gateway; tests pass an in-memory backend here.
    pub fn with_gateway(gateway: Arc<dyn Gateway>, config: &AppConfig) -> Result<Self> {
        let cache_path = config.cache_path();
        let cache = ArtifactCache::open(&cache_path)
            .with_context(|| format!("Failed to open artifact cache at {}", cache_path.display()))?;

        let views = Arc::new(ViewCache::new());
        let selection = Arc::new(Selection::new());
        let messaging = MessagingChannel::new(
            Arc::clone(&gateway),
            Arc::clone(&views),
            Arc::clone(&selection),
            config.poll_interval(),
        )?;
        let resolver = ConversationResolver::new(Arc::clone(&gateway), Arc::clone(&views));
        let engine = NegotiationEngine::new(Arc::clone(&gateway), cache.clone(), Arc::clone(&views), messaging, config.active_policy());

        debug!(cache = %cache_path.display(), "negotiation service ready");
        Ok(Self {
            gateway,
            resolver,
            engine,
            selection,
            views,
            cache,
        })
    }

    /// Session for `user_id`, with the user's profile fetched from the backend.
    pub async fn session_for(&self, user_id: UserId, token: Option<String>) -> crate::error::Result<Session> {
        let anonymous = Session::new(User::placeholder(user_id), token);
        let user = self.gateway.fetch_user(&anonymous, user_id).await?;
        Ok(Session::new(user, anonymous.token))
    }

    /// Conversation resolver
    #[must_use]
    pub const fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    /// Negotiation engine
    #[must_use]
    pub const fn engine(&self) -> &NegotiationEngine {
        &self.engine
    }

    /// Messaging channel
    #[must_use]
    pub const fn messaging(&self) -> &MessagingChannel {
        self.engine.messaging()
    }

    /// Local artifact cache
    #[must_use]
    pub const fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Shared view caches
    #[must_use]
    pub fn views(&self) -> &ViewCache {
        &self.views
    }

    /// Currently open conversation
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Open `id`, making it the conversation polls and guarded results belong to.
    pub async fn select_conversation(
        &self,
        session: &Session,
        id: ConversationId,
    ) -> crate::error::Result<Conversation> {
        let conversation = self
            .resolver
            .conversation(session, id)
            .await?
            .ok_or_else(|| NegotiationError::Validation(format!("conversation {id} not found")))?;
        self.selection.select(Some(conversation.id));
        Ok(conversation)
    }

    /// Close whatever conversation is open; running polls stop.
    pub fn close_conversation(&self) {
        self.selection.select(None);
    }

    /// The open conversation, if any.
    pub async fn selected_conversation(&self, session: &Session) -> crate::error::Result<Option<Conversation>> {
        match self.selection.current() {
            Some(id) => self.resolver.conversation(session, id).await,
            None => Ok(None),
        }
    }
}
