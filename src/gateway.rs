//! Remote gateway: the REST boundary the negotiation core talks to.
//!
//! [`Gateway`] is the seam the resolver, engine and messaging channel depend
//! on; [`HttpGateway`] is the `reqwest` implementation used in production.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{NegotiationError, Result};
use crate::metrics;
use crate::models::{
    Attachment, ContractFile, ConversationId, NewMessage, NewStep, RawConversation, Step, StepId,
    StepPatch, Ticket, TicketId, TicketPatch, User, UserId, WireMessage,
};
use crate::session::Session;

/// A fetched binary file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Declared `Content-Type`, if any
    pub content_type: Option<String>,
    /// Body bytes
    pub bytes: Vec<u8>,
}

/// Operations the backend exposes to the negotiation core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gateway: Send + Sync {
    /// `GET /conversation`
    async fn list_conversations(&self, session: &Session) -> Result<Vec<RawConversation>>;
    /// `POST /conversation`
    async fn create_conversation(&self, session: &Session, first: UserId, second: UserId) -> Result<RawConversation>;
    /// `GET /users/:id`
    async fn fetch_user(&self, session: &Session, id: UserId) -> Result<User>;
    /// `GET /message/conversation/:id`
    async fn list_messages(&self, session: &Session, conversation: ConversationId) -> Result<Vec<WireMessage>>;
    /// `POST /message`
    async fn send_message(&self, session: &Session, message: &NewMessage) -> Result<WireMessage>;
    /// `GET /ticket/conversation/:id`
    async fn list_tickets(&self, session: &Session, conversation: ConversationId) -> Result<Vec<Ticket>>;
    /// `POST /ticket`
    async fn create_ticket(&self, session: &Session, conversation: ConversationId) -> Result<Ticket>;
    /// `PATCH /ticket/:id`
    async fn update_ticket(&self, session: &Session, ticket: TicketId, patch: &TicketPatch) -> Result<()>;
    /// `DELETE /ticket/:id`
    async fn delete_ticket(&self, session: &Session, ticket: TicketId) -> Result<()>;
    /// `GET /step/:ticketId`
    async fn list_steps(&self, session: &Session, ticket: TicketId) -> Result<Vec<Step>>;
    /// `POST /step`
    async fn create_step(&self, session: &Session, step: &NewStep) -> Result<Step>;
    /// `PUT /step/:id`
    async fn update_step(&self, session: &Session, step: StepId, patch: &StepPatch) -> Result<()>;
    /// `DELETE /step/:id`
    async fn delete_step(&self, session: &Session, step: StepId) -> Result<()>;
    /// `POST /upload/pdf/:ticketId` (multipart)
    async fn upload_pdf(&self, session: &Session, ticket: TicketId, file: &ContractFile) -> Result<()>;
    /// `GET /attchment/ticket/:ticketId`
    async fn list_attachments(&self, session: &Session, ticket: TicketId) -> Result<Vec<Attachment>>;
    /// `GET <locator>`
    async fn download(&self, session: &Session, locator: &str) -> Result<Download>;
    /// `POST /auth/validate-password`; `Ok(false)` means the password was rejected
    async fn validate_password(&self, email: &str, password: &str) -> Result<bool>;
}

/// Bodies may come bare or wrapped in `{ "data": ... }`.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttachmentListing {
    Bare(Vec<Attachment>),
    Keyed {
        #[serde(alias = "attchments", alias = "attachment", alias = "data")]
        attachments: Vec<Attachment>,
    },
}

impl AttachmentListing {
    fn into_vec(self) -> Vec<Attachment> {
        match self {
            Self::Bare(list) | Self::Keyed { attachments: list } => list,
        }
    }
}

const VERDICT_KEYS: [&str; 3] = ["valid", "ok", "success"];

/// Read a 2xx password-check body. An empty body means accepted; otherwise an
/// explicit boolean is required, bare, keyed, or inside `data`.
fn password_verdict(path: &str, body: &str) -> Result<bool> {
    if body.trim().is_empty() {
        return Ok(true);
    }
    let undecodable = |message: String| NegotiationError::Decode {
        endpoint: path.to_string(),
        message,
    };
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| undecodable(e.to_string()))?;
    let keyed = |v: &serde_json::Value| VERDICT_KEYS.iter().find_map(|key| v.get(key)?.as_bool());
    value
        .as_bool()
        .or_else(|| keyed(&value))
        .or_else(|| value.get("data").and_then(|data| data.as_bool().or_else(|| keyed(data))))
        .ok_or_else(|| undecodable("password check response carries no verdict".to_string()))
}

/// `reqwest`-backed gateway
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    /// Create a gateway for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NegotiationError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are resolved against
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, path: &str, session: Option<&Session>) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match session.and_then(Session::bearer) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and return the response whatever its status.
    async fn execute_raw(&self, route: &'static str, method: &Method, path: &str, builder: RequestBuilder) -> Result<Response> {
        let started = Instant::now();
        let result = builder.send().await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                debug!(method = %method, endpoint = path, status = %response.status(), "gateway response");
                let outcome = if response.status().is_success() { "success" } else { "error" };
                metrics::record_gateway_call(route, outcome, elapsed);
                Ok(response)
            }
            Err(e) if e.is_timeout() => {
                warn!(method = %method, endpoint = path, "gateway request timed out");
                metrics::record_gateway_call(route, "timeout", elapsed);
                Err(NegotiationError::Timeout { endpoint: path.to_string() })
            }
            Err(e) => {
                warn!(method = %method, endpoint = path, error = %e, "gateway request failed");
                metrics::record_gateway_call(route, "network", elapsed);
                Err(NegotiationError::Network {
                    endpoint: path.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Send and turn non-success statuses into [`NegotiationError::Gateway`].
    async fn execute(&self, route: &'static str, method: Method, path: &str, builder: RequestBuilder) -> Result<Response> {
        let response = self.execute_raw(route, &method, path, builder).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(method = %method, endpoint = path, status = %status, "gateway returned an error status");
        Err(NegotiationError::Gateway {
            method: method.to_string(),
            endpoint: path.to_string(),
            status: status.as_u16(),
            message: if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            },
        })
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T> {
        let body = response.text().await.map_err(|e| NegotiationError::Network {
            endpoint: path.to_string(),
            message: format!("failed to read response body: {e}"),
        })?;
        decode_body(path, &body)
    }

    async fn get_json<T: DeserializeOwned>(&self, route: &'static str, path: &str, session: &Session) -> Result<T> {
        let builder = self.request(Method::GET, path, Some(session));
        let response = self.execute(route, Method::GET, path, builder).await?;
        Self::decode(path, response).await
    }

    async fn send_unit(&self, route: &'static str, method: Method, path: &str, builder: RequestBuilder) -> Result<()> {
        self.execute(route, method, path, builder).await.map(drop)
    }
}

pub(crate) fn decode_body<T: DeserializeOwned>(path: &str, body: &str) -> Result<T> {
    serde_json::from_str::<T>(body)
        .or_else(|bare_err| {
            serde_json::from_str::<Envelope<T>>(body)
                .map(|e| e.data)
                .map_err(|_| bare_err)
        })
        .map_err(|e| NegotiationError::Decode {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
}

/// Decode each conversation on its own so one bad record cannot sink the list.
fn conversation_records(records: Vec<serde_json::Value>) -> Vec<RawConversation> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<RawConversation>(record) {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                warn!(error = %e, "dropping undecodable conversation record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn list_conversations(&self, session: &Session) -> Result<Vec<RawConversation>> {
        let records: Vec<serde_json::Value> = self.get_json("/conversation", "/conversation", session).await?;
        Ok(conversation_records(records))
    }

    async fn create_conversation(&self, session: &Session, first: UserId, second: UserId) -> Result<RawConversation> {
        let path = "/conversation";
        let builder = self
            .request(Method::POST, path, Some(session))
            .json(&serde_json::json!({ "user1_id": first, "user2_id": second }));
        let response = self.execute(path, Method::POST, path, builder).await?;
        Self::decode(path, response).await
    }

    async fn fetch_user(&self, session: &Session, id: UserId) -> Result<User> {
        self.get_json("/users/:id", &format!("/users/{id}"), session).await
    }

    async fn list_messages(&self, session: &Session, conversation: ConversationId) -> Result<Vec<WireMessage>> {
        self.get_json("/message/conversation/:id", &format!("/message/conversation/{conversation}"), session)
            .await
    }

    async fn send_message(&self, session: &Session, message: &NewMessage) -> Result<WireMessage> {
        let path = "/message";
        let builder = self.request(Method::POST, path, Some(session)).json(message);
        let response = self.execute(path, Method::POST, path, builder).await?;
        Self::decode(path, response).await
    }

    async fn list_tickets(&self, session: &Session, conversation: ConversationId) -> Result<Vec<Ticket>> {
        self.get_json("/ticket/conversation/:id", &format!("/ticket/conversation/{conversation}"), session)
            .await
    }

    async fn create_ticket(&self, session: &Session, conversation: ConversationId) -> Result<Ticket> {
        let path = "/ticket";
        let builder = self
            .request(Method::POST, path, Some(session))
            .json(&serde_json::json!({ "conversation_id": conversation }));
        let response = self.execute(path, Method::POST, path, builder).await?;
        Self::decode(path, response).await
    }

    async fn update_ticket(&self, session: &Session, ticket: TicketId, patch: &TicketPatch) -> Result<()> {
        let path = format!("/ticket/{ticket}");
        let builder = self.request(Method::PATCH, &path, Some(session)).json(patch);
        self.send_unit("/ticket/:id", Method::PATCH, &path, builder).await
    }

    async fn delete_ticket(&self, session: &Session, ticket: TicketId) -> Result<()> {
        let path = format!("/ticket/{ticket}");
        let builder = self.request(Method::DELETE, &path, Some(session));
        self.send_unit("/ticket/:id", Method::DELETE, &path, builder).await
    }

    async fn list_steps(&self, session: &Session, ticket: TicketId) -> Result<Vec<Step>> {
        self.get_json("/step/:ticketId", &format!("/step/{ticket}"), session).await
    }

    async fn create_step(&self, session: &Session, step: &NewStep) -> Result<Step> {
        let path = "/step";
        let builder = self.request(Method::POST, path, Some(session)).json(step);
        let response = self.execute(path, Method::POST, path, builder).await?;
        Self::decode(path, response).await
    }

    async fn update_step(&self, session: &Session, step: StepId, patch: &StepPatch) -> Result<()> {
        let path = format!("/step/{step}");
        let builder = self.request(Method::PUT, &path, Some(session)).json(patch);
        self.send_unit("/step/:id", Method::PUT, &path, builder).await
    }

    async fn delete_step(&self, session: &Session, step: StepId) -> Result<()> {
        let path = format!("/step/{step}");
        let builder = self.request(Method::DELETE, &path, Some(session));
        self.send_unit("/step/:id", Method::DELETE, &path, builder).await
    }

    async fn upload_pdf(&self, session: &Session, ticket: TicketId, file: &ContractFile) -> Result<()> {
        let path = format!("/upload/pdf/{ticket}");
        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str("application/pdf")
            .map_err(|e| NegotiationError::Other(format!("invalid upload part: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let builder = self.request(Method::POST, &path, Some(session)).multipart(form);
        self.send_unit("/upload/pdf/:ticketId", Method::POST, &path, builder).await
    }

    async fn list_attachments(&self, session: &Session, ticket: TicketId) -> Result<Vec<Attachment>> {
        let route = "/attchment/ticket/:ticketId";
        let path = format!("/attchment/ticket/{ticket}");
        let builder = self.request(Method::GET, &path, Some(session));
        let response = self.execute_raw(route, &Method::GET, &path, builder).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(ticket_id = ticket, "no attachments listed");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NegotiationError::Gateway {
                method: Method::GET.to_string(),
                endpoint: path,
                status: status.as_u16(),
                message: body,
            });
        }
        let listing: AttachmentListing = Self::decode(&path, response).await?;
        Ok(listing.into_vec())
    }

    async fn download(&self, session: &Session, locator: &str) -> Result<Download> {
        let builder = self.request(Method::GET, locator, Some(session));
        let response = self.execute("download", Method::GET, locator, builder).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| NegotiationError::Network {
            endpoint: locator.to_string(),
            message: format!("failed to read download body: {e}"),
        })?;
        Ok(Download {
            content_type,
            bytes: bytes.to_vec(),
        })
    }

    async fn validate_password(&self, email: &str, password: &str) -> Result<bool> {
        let path = "/auth/validate-password";
        let builder = self
            .request(Method::POST, path, None)
            .json(&serde_json::json!({ "email": email, "password": password }));
        let response = self.execute_raw(path, &Method::POST, path, builder).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            status if status.is_success() => {
                let body = response.text().await.map_err(|e| NegotiationError::Network {
                    endpoint: path.to_string(),
                    message: format!("failed to read response body: {e}"),
                })?;
                password_verdict(path, &body)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(NegotiationError::Gateway {
                    method: Method::POST.to_string(),
                    endpoint: path.to_string(),
                    status: status.as_u16(),
                    message: body,
                })
            }
        }
    }
}
