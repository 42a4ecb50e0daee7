//! HTTP API
//!
//! Thin handlers over the chat core: conversation listing and creation,
//! paged message history, message send, join/leave and the health probe.
//! Every endpoint verifies the same credential as the WebSocket path.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ChatError;
use crate::models::Page;
use crate::server::AppState;
use crate::service::{CreateGroupRequest, SendMessageRequest};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Advisory RFC3339 upper bound on message timestamps.
    pub before: Option<String>,
}

impl ListQuery {
    fn page(&self) -> Page {
        let size = self.limit.unwrap_or(50).clamp(1, Page::MAX_SIZE);
        let number = self.offset.unwrap_or(0) / size;
        Page::new(number, size)
    }

    fn before(&self) -> Result<Option<DateTime<Utc>>, ChatError> {
        match &self.before {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|parsed| Some(parsed.with_timezone(&Utc)))
                .map_err(|_| {
                    ChatError::InvalidArgument(format!("'{}' is not an RFC3339 timestamp", raw))
                }),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub max_members: i32,
    #[serde(default)]
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub conversation_id: Uuid,
    pub content: String,
    pub message_type: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadBody {
    pub conversation_id: Uuid,
    pub message_ids: Vec<Uuid>,
}

/// GET /conversations
pub async fn list_conversations(
    req: HttpRequest,
    query: web::Query<ListQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let page = query.page();

    let (conversations, total) = state.chat.list_conversations(caller.user_id, page).await?;

    Ok(HttpResponse::Ok().json(json!({
        "conversations": conversations,
        "total": total,
        "limit": page.size,
        "offset": page.offset(),
    })))
}

/// POST /conversations
pub async fn create_conversation(
    req: HttpRequest,
    body: web::Json<CreateConversationBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let body = body.into_inner();

    let conversation = match body.kind.as_str() {
        "group" => {
            state
                .chat
                .create_group(
                    CreateGroupRequest {
                        name: body.name.unwrap_or_default(),
                        description: body.description,
                        is_private: body.is_private,
                        max_members: body.max_members,
                        participant_ids: body.participant_ids,
                    },
                    caller.user_id,
                )
                .await?
        }
        "direct" => {
            let [other] = body.participant_ids.as_slice() else {
                return Err(ChatError::InvalidArgument(
                    "a direct conversation takes exactly one participant".into(),
                ));
            };
            state.chat.create_or_get_direct(caller.user_id, *other).await?
        }
        other => {
            return Err(ChatError::InvalidArgument(format!(
                "unknown conversation type '{}'",
                other
            )))
        }
    };

    Ok(HttpResponse::Created().json(conversation))
}

/// GET /conversations/{id}/messages
pub async fn list_messages(
    req: HttpRequest,
    path: web::Path<Uuid>,
    query: web::Query<ListQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let conversation_id = path.into_inner();
    let page = query.page();
    let before = query.before()?;

    let (messages, total) = state
        .chat
        .list_messages(conversation_id, caller.user_id, page, before)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "messages": messages,
        "total": total,
        "limit": page.size,
        "offset": page.offset(),
    })))
}

/// POST /messages
pub async fn send_message(
    req: HttpRequest,
    body: web::Json<SendMessageBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let body = body.into_inner();

    let message = state
        .chat
        .send_message(
            body.conversation_id,
            caller.user_id,
            SendMessageRequest {
                content: body.content,
                message_type: body.message_type,
                parent_id: body.parent_id,
            },
        )
        .await?;

    Ok(HttpResponse::Created().json(message))
}

/// POST /messages/read
pub async fn mark_read(
    req: HttpRequest,
    body: web::Json<MarkReadBody>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let body = body.into_inner();

    state
        .chat
        .mark_read(caller.user_id, body.conversation_id, body.message_ids)
        .await?;

    Ok(HttpResponse::NoContent().finish())
}

/// POST /conversations/{id}/join
pub async fn join_conversation(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    let membership = state.chat.join(path.into_inner(), caller.user_id).await?;
    Ok(HttpResponse::Created().json(membership))
}

/// POST /conversations/{id}/leave
pub async fn leave_conversation(
    req: HttpRequest,
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ChatError> {
    let caller = state.verifier.verify_request(&req)?;
    state.chat.leave(path.into_inner(), caller.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /health, probing both stores and reporting local load.
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let store_ok = state.store.ping().await.is_ok();

    let body = json!({
        "status": if db_ok && store_ok { "healthy" } else { "degraded" },
        "database": db_ok,
        "fast_store": store_ok,
        "connections": state.hub.total_connections(),
        "draining": *state.drain.borrow(),
    });

    if db_ok && store_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_query_paging() {
        let query = ListQuery { limit: Some(20), offset: Some(40), before: None };
        let page = query.page();
        assert_eq!(page.size, 20);
        assert_eq!(page.offset(), 40);

        // Limits are clamped to the contract.
        let query = ListQuery { limit: Some(1000), offset: None, before: None };
        assert_eq!(query.page().size, Page::MAX_SIZE);

        let query = ListQuery { limit: None, offset: None, before: None };
        let page = query.page();
        assert_eq!(page.size, 50);
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn test_before_parsing() {
        let query = ListQuery {
            limit: None,
            offset: None,
            before: Some("2026-03-01T12:00:00Z".into()),
        };
        assert!(query.before().unwrap().is_some());

        let query = ListQuery { limit: None, offset: None, before: Some("yesterday".into()) };
        assert!(matches!(query.before(), Err(ChatError::InvalidArgument(_))));

        let query = ListQuery { limit: None, offset: None, before: None };
        assert!(query.before().unwrap().is_none());
    }
}
