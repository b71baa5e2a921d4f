use super::{ApiError, ApiResult, EndpointState};
use crate::config::SseReplyMode;
use crate::middleware::auth::Caller;
use crate::sse;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;
use relay_core::{parse_message, Frame, JsonRpcError, JsonRpcResponse, RequestId};
use relay_mcp::RequestContext;
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;

/// An empty body is as unparseable as malformed JSON.
fn read_frame(body: &Bytes) -> Frame {
    parse_message(body)
        .unwrap_or_else(|| {
            Frame::Invalid(JsonRpcResponse::error(
                RequestId::Null,
                JsonRpcError::parse_error(),
            ))
        })
}

/// POST a single JSON-RPC message; the reply is the response body.
pub async fn post_rpc(
    State(state): State<EndpointState>,
    Caller(principal): Caller,
    body: Bytes,
) -> Response {
    match read_frame(&body) {
        Frame::Invalid(reply) => Json(reply).into_response(),
        Frame::Response(_) => StatusCode::ACCEPTED.into_response(),
        Frame::Request(request) => {
            let handler = &state.endpoint.handler;
            let ctx = RequestContext::new(handler.connect()).with_principal(principal);
            match handler.handle(request, &ctx).await {
                Some(reply) => Json(reply).into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            }
        }
    }
}

/// Open an SSE session. The first event names the URL to POST messages to.
pub async fn open_sse(
    State(state): State<EndpointState>,
    Caller(principal): Caller,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let app = state.app.clone();
    let (id, replies) = app.sessions.open(state.endpoint.handler.clone(), principal);

    let base = sse::endpoint_base(&headers, app.config.http.public_url.as_deref());
    let endpoint = format!("{}{}/sse/message?sessionId={}", base, state.endpoint.prefix, id);
    tracing::info!(session_id = %id, endpoint = %endpoint, "SSE session opened");

    Sse::new(sse::event_stream(app, id, replies, endpoint))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<Uuid>,
}

/// POST a message into an open SSE session.
pub async fn post_sse_message(
    State(state): State<EndpointState>,
    Query(query): Query<MessageQuery>,
    Caller(principal): Caller,
    body: Bytes,
) -> ApiResult<Response> {
    let session = query
        .session_id
        .and_then(|id| state.app.sessions.get(id))
        .ok_or_else(|| ApiError::not_found("Unknown or missing sessionId"))?;
    let mode = state.app.config.sse.reply_mode;

    let request = match read_frame(&body) {
        Frame::Request(request) => request,
        Frame::Response(_) => return Ok(StatusCode::ACCEPTED.into_response()),
        Frame::Invalid(reply) => {
            return Ok(match mode {
                SseReplyMode::Stream => {
                    session.send(reply);
                    StatusCode::ACCEPTED.into_response()
                }
                SseReplyMode::Http => Json(reply).into_response(),
            });
        }
    };

    let ctx = RequestContext::new(session.connection.clone())
        .with_principal(principal.or_else(|| session.principal.clone()));
    match mode {
        SseReplyMode::Http => Ok(match session.handler.handle(request, &ctx).await {
            Some(reply) => Json(reply).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        }),
        SseReplyMode::Stream => {
            tokio::spawn(async move {
                if let Some(reply) = session.handler.handle(request, &ctx).await {
                    session.send(reply);
                }
            });
            Ok(StatusCode::ACCEPTED.into_response())
        }
    }
}
