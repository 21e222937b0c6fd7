//! Contract attachments: cache-first retrieval and write-through

mod common;

use common::{FakeBackend, CLIENT_ID, PROVIDER_ID};
use negotiation_core::cache::ArtifactCache;
use negotiation_core::error::NegotiationError;
use negotiation_core::models::TicketStatus;
use tempfile::tempdir;

const CONVERSATION: i64 = 10;

#[tokio::test]
async fn test_cached_blob_is_served_without_requests() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/contrato.pdf", Some("application/pdf"), b"%PDF remote");
    backend.add_attachment(ticket.id, "/files/contrato.pdf", 1);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);
    service
        .cache()
        .put(&ArtifactCache::ticket_key(ticket.id), b"%PDF local")
        .unwrap();

    let blob = service.engine().fetch_attachment(&session, &ticket).await.unwrap();

    assert_eq!(blob, b"%PDF local".to_vec());
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_remote_fetch_is_cached_for_next_time() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/contrato.pdf", Some("application/pdf"), b"%PDF remote");
    backend.add_attachment(ticket.id, "/files/contrato.pdf", 1);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);

    let first = service.engine().fetch_attachment(&session, &ticket).await.unwrap();
    assert_eq!(first, b"%PDF remote".to_vec());
    assert_eq!(backend.calls("list_attachments"), 1);
    assert_eq!(backend.calls("download"), 1);

    backend.reset_calls();
    let second = service.engine().fetch_attachment(&session, &ticket).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_cache_survives_a_restart() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/contrato.pdf", None, b"%PDF remote");
    backend.set_attachment_path(ticket.id, "/files/contrato.pdf");
    let ticket = backend.ticket(ticket.id).unwrap();
    let dir = tempdir().unwrap();
    let session = common::session(&backend, CLIENT_ID);

    {
        let service = common::service(&backend, &dir);
        service.engine().fetch_attachment(&session, &ticket).await.unwrap();
    }

    backend.reset_calls();
    let service = common::service(&backend, &dir);
    let blob = service.engine().fetch_attachment(&session, &ticket).await.unwrap();
    assert_eq!(blob, b"%PDF remote".to_vec());
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_direct_reference_wins_over_listing() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/direto.pdf", Some("application/pdf"), b"%PDF direct");
    backend.add_file("/files/listado.pdf", Some("application/pdf"), b"%PDF listed");
    backend.add_attachment(ticket.id, "/files/listado.pdf", 5);
    backend.set_attachment_path(ticket.id, "/files/direto.pdf");
    let ticket = backend.ticket(ticket.id).unwrap();
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);

    let blob = service.engine().fetch_attachment(&session, &ticket).await.unwrap();

    assert_eq!(blob, b"%PDF direct".to_vec());
    assert_eq!(backend.calls("list_attachments"), 0);
}

#[tokio::test]
async fn test_latest_attachment_is_authoritative() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/v2.pdf", Some("application/pdf"), b"%PDF v2");
    backend.add_file("/files/v1.pdf", Some("application/pdf"), b"%PDF v1");
    backend.add_attachment(ticket.id, "/files/v2.pdf", 200);
    backend.add_attachment(ticket.id, "/files/v1.pdf", 100);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);

    let blob = service.engine().fetch_attachment(&session, &ticket).await.unwrap();

    assert_eq!(blob, b"%PDF v2".to_vec());
}

#[tokio::test]
async fn test_missing_attachment_is_reported() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);

    let err = service.engine().fetch_attachment(&session, &ticket).await.unwrap_err();

    assert!(matches!(err, NegotiationError::AttachmentNotFound(_)));
    assert_eq!(backend.calls("download"), 0);
}

#[tokio::test]
async fn test_html_error_page_is_not_a_contract() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted));
    backend.add_file("/files/contrato.pdf", Some("text/html; charset=utf-8"), b"<html>erro</html>");
    backend.add_attachment(ticket.id, "/files/contrato.pdf", 1);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, CLIENT_ID);

    let err = service.engine().fetch_attachment(&session, &ticket).await.unwrap_err();

    assert!(matches!(err, NegotiationError::UnexpectedContentType(_)));
    assert_eq!(
        service.cache().get(&ArtifactCache::ticket_key(ticket.id)).unwrap(),
        None
    );
}

#[tokio::test]
async fn test_upload_writes_through_to_cache() {
    let backend = FakeBackend::new();
    backend.add_conversation(CONVERSATION, PROVIDER_ID, CLIENT_ID);
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Pending));
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, PROVIDER_ID);
    let file = common::contract("contrato.pdf");

    service
        .engine()
        .upload_attachment(&session, &ticket, &file)
        .await
        .unwrap();
    assert_eq!(backend.calls("upload_pdf"), 1);

    backend.reset_calls();
    let blob = service.engine().fetch_attachment(&session, &ticket).await.unwrap();
    assert_eq!(blob, file.bytes);
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_upload_returns_error_and_caches_nothing() {
    let backend = FakeBackend::new();
    let ticket = backend.add_ticket(CONVERSATION, Some(TicketStatus::Pending));
    backend.fail_uploads();
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let session = common::session(&backend, PROVIDER_ID);

    let result = service
        .engine()
        .upload_attachment(&session, &ticket, &common::contract("contrato.pdf"))
        .await;

    assert!(matches!(result, Err(NegotiationError::Gateway { .. })));
    assert_eq!(
        service.cache().get(&ArtifactCache::ticket_key(ticket.id)).unwrap(),
        None
    );
}
