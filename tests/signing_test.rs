//! Password-gated signing of accepted contracts

mod common;

use common::{FakeBackend, CLIENT_ID, CLIENT_PASSWORD, PROVIDER_ID};
use negotiation_core::error::NegotiationError;
use negotiation_core::models::{Ticket, TicketStatus};
use tempfile::tempdir;

const CONVERSATION: i64 = 10;

fn accepted_ticket(backend: &FakeBackend) -> Ticket {
    backend.add_conversation(CONVERSATION, PROVIDER_ID, CLIENT_ID);
    backend.add_ticket(CONVERSATION, Some(TicketStatus::Accepted))
}

#[tokio::test]
async fn test_sign_records_signer_and_posts_notice() {
    let backend = FakeBackend::new();
    let ticket = accepted_ticket(&backend);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let receipt = service
        .engine()
        .sign_document(&client, &ticket, CLIENT_PASSWORD)
        .await
        .unwrap();

    assert!(receipt.notice_sent);
    assert_eq!(receipt.ticket.status, Some(TicketStatus::Signed));
    let stored = backend.ticket(ticket.id).unwrap();
    assert_eq!(stored.status, Some(TicketStatus::Signed));
    assert_eq!(stored.signed_by, Some(CLIENT_ID));
    assert!(stored.signed_at.is_some());

    let messages = backend.messages_for(CONVERSATION);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.starts_with("Documento assinado por Carlos Cliente em "));
    assert_eq!(messages[0].kind.as_deref(), Some("plain"));
}

#[tokio::test]
async fn test_wrong_password_changes_nothing() {
    let backend = FakeBackend::new();
    let ticket = accepted_ticket(&backend);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let err = service
        .engine()
        .sign_document(&client, &ticket, "errada")
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::WrongPassword));
    assert!(!err.is_partial_failure());
    assert_eq!(backend.ticket(ticket.id).unwrap().status, Some(TicketStatus::Accepted));
    assert_eq!(backend.calls("update_ticket"), 0);
    assert!(backend.messages_for(CONVERSATION).is_empty());
}

#[tokio::test]
async fn test_update_failure_after_password_is_partial() {
    let backend = FakeBackend::new();
    let ticket = accepted_ticket(&backend);
    backend.fail_ticket_updates();
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let err = service
        .engine()
        .sign_document(&client, &ticket, CLIENT_PASSWORD)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::SignatureNotRecorded { .. }));
    assert!(err.is_partial_failure());
    assert_ne!(err.user_message(), NegotiationError::WrongPassword.user_message());
    assert_eq!(backend.calls("validate_password"), 1);
    assert!(backend.messages_for(CONVERSATION).is_empty());
}

#[tokio::test]
async fn test_notice_failure_keeps_signature() {
    let backend = FakeBackend::new();
    let ticket = accepted_ticket(&backend);
    backend.fail_messages();
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let receipt = service
        .engine()
        .sign_document(&client, &ticket, CLIENT_PASSWORD)
        .await
        .unwrap();

    assert!(!receipt.notice_sent);
    assert_eq!(backend.ticket(ticket.id).unwrap().status, Some(TicketStatus::Signed));
}

#[tokio::test]
async fn test_only_accepted_tickets_can_be_signed() {
    let backend = FakeBackend::new();
    backend.add_conversation(CONVERSATION, PROVIDER_ID, CLIENT_ID);
    let pending = backend.add_ticket(CONVERSATION, Some(TicketStatus::Pending));
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let err = service
        .engine()
        .sign_document(&client, &pending, CLIENT_PASSWORD)
        .await
        .unwrap_err();

    assert!(matches!(err, NegotiationError::InvalidTransition { .. }));
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test]
async fn test_empty_password_is_rejected_locally() {
    let backend = FakeBackend::new();
    let ticket = accepted_ticket(&backend);
    let dir = tempdir().unwrap();
    let service = common::service(&backend, &dir);
    let client = common::session(&backend, CLIENT_ID);

    let err = service.engine().sign_document(&client, &ticket, "").await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(backend.total_calls(), 0);
}
