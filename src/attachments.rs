//! Contract attachments: upload with write-through caching, cache-first fetch.

use tracing::{debug, info, warn};

use crate::cache::ArtifactCache;
use crate::engine::NegotiationEngine;
use crate::error::{NegotiationError, Result};
use crate::metrics;
use crate::models::{ContractFile, Ticket};
use crate::session::Session;
use crate::validation::InputValidator;

impl NegotiationEngine {
    /// Upload `file` as the contract of `ticket` and keep a local copy.
    ///
    /// Callers decide what a failure means; inside a proposal it only marks
    /// the contract as missing.
    pub async fn upload_attachment(&self, session: &Session, ticket: &Ticket, file: &ContractFile) -> Result<()> {
        InputValidator::contract_file(&file.file_name, &file.bytes)?;

        self.gateway.upload_pdf(session, ticket.id, file).await?;
        info!(ticket_id = ticket.id, bytes = file.bytes.len(), "contract uploaded");

        if let Err(e) = self.cache.put(&ArtifactCache::ticket_key(ticket.id), &file.bytes) {
            warn!(ticket_id = ticket.id, error = %e, "contract uploaded but not cached locally");
        }
        self.views.invalidate_tickets(ticket.conversation_id);
        Ok(())
    }

    /// The contract PDF of `ticket`.
    ///
    /// Resolution order: local cache, the ticket's own attachment reference,
    /// then the newest entry of the ticket's attachment list. Anything fetched
    /// over the network is written to the local cache.
    pub async fn fetch_attachment(&self, session: &Session, ticket: &Ticket) -> Result<Vec<u8>> {
        let key = ArtifactCache::ticket_key(ticket.id);
        match self.cache.get(&key) {
            Ok(Some(blob)) => {
                metrics::record_cache_lookup(true);
                debug!(ticket_id = ticket.id, "contract served from local cache");
                return Ok(blob);
            }
            Ok(None) => metrics::record_cache_lookup(false),
            Err(e) => warn!(ticket_id = ticket.id, error = %e, "local cache unreadable, fetching remotely"),
        }

        let locator = match ticket.attachment_path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => path.to_string(),
            None => self.latest_attachment_locator(session, ticket).await?,
        };

        let download = self.gateway.download(session, &locator).await?;
        if !InputValidator::is_pdf_content_type(download.content_type.as_deref()) {
            let declared = download.content_type.unwrap_or_default();
            warn!(ticket_id = ticket.id, content_type = %declared, "refusing non-PDF attachment");
            return Err(NegotiationError::UnexpectedContentType(declared));
        }
        if download.bytes.is_empty() {
            return Err(NegotiationError::AttachmentNotFound(format!("{locator} is empty")));
        }

        if let Err(e) = self.cache.put(&key, &download.bytes) {
            warn!(ticket_id = ticket.id, error = %e, "contract fetched but not cached locally");
        }
        Ok(download.bytes)
    }

    async fn latest_attachment_locator(&self, session: &Session, ticket: &Ticket) -> Result<String> {
        let attachments = self.gateway.list_attachments(session, ticket.id).await?;
        attachments
            .into_iter()
            .max_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)))
            .map(|a| a.file_path)
            .ok_or_else(|| NegotiationError::AttachmentNotFound(format!("ticket {} has no attachments", ticket.id)))
    }
}
