//! Demo application wiring the PREP middleware into an `axum::Router`. This
//! is the external HTTP-handler layer the middleware itself leaves to the
//! host application, kept to the minimum needed to drive it: one resource
//! at `/` whose representation is a fixed string, mutated by `PATCH`/`PUT`/
//! `DELETE`.

use crate::connection::ConnectionControl;
use crate::negotiate::RequestedEvents;
use crate::session::{
    Modifiers, PrepEngine, PrepSession, RepresentationBody, RequestContext, SendArgs, SendOutcome,
    TriggerArgs,
};
use crate::structured;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

const REPRESENTATION: &str = "The quick fox jumps over the lazy dog.";
const RESOURCE_PATH: &str = "/";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PrepEngine>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: PrepEngine::from_env(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            get(handle_get)
                .patch(handle_mutation)
                .put(handle_mutation)
                .post(handle_mutation)
                .delete(handle_mutation),
        )
        .with_state(state)
}

async fn handle_get(
    State(state): State<AppState>,
    connection: Option<Extension<ConnectionControl>>,
    headers: HeaderMap,
) -> Response {
    let connection = connection.map(|Extension(connection)| connection);
    let mut session = PrepSession::new(
        state.engine.clone(),
        request_context(RESOURCE_PATH, "GET", &headers, connection),
    );
    if let Err(failed) = session.configure(None) {
        return failed_response(failed);
    }
    let outcome = session.send(SendArgs {
        status_code: 200,
        part_headers: vec![("Content-Type".to_owned(), "text/plain".to_owned())],
        body: RepresentationBody::Buffered(Bytes::from_static(REPRESENTATION.as_bytes())),
        modifiers: Modifiers::default(),
    });
    match outcome {
        SendOutcome::Streaming(response) => response.into_response(),
        SendOutcome::Failed(header) => failed_response(header),
    }
}

async fn handle_mutation(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let event_id = state.engine.event_ids.set_event_id(RESOURCE_PATH);
    info!(method = %method, event_id = %event_id, "prep mutation observed");

    let mut session = PrepSession::new(
        state.engine.clone(),
        request_context(RESOURCE_PATH, method.as_str(), &headers, None),
    );
    // The handler completes its own response before `trigger` schedules the
    // notification.
    session.trigger(TriggerArgs::default());
    session.run_deferred().await;

    StatusCode::NO_CONTENT.into_response()
}

fn request_context(
    path: &str,
    method: &str,
    headers: &HeaderMap,
    connection: Option<ConnectionControl>,
) -> RequestContext {
    let requested_events = parse_accept_events(headers);
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    RequestContext {
        path: path.to_owned(),
        method: method.to_owned(),
        user_agent,
        requested_events,
        last_event_id,
        connection,
    }
}

/// Parses the live `Accept-Events` request header. The adjacent middleware
/// that would normally populate this in a full deployment is out of scope
/// here; the demo stands in for that collaborator using the same
/// structured-field adapter the rest of the crate uses.
fn parse_accept_events(headers: &HeaderMap) -> RequestedEvents {
    let Some(raw) = headers.get("accept-events").and_then(|v| v.to_str().ok()) else {
        return RequestedEvents::default();
    };
    let Ok(items) = structured::parse_list(raw) else {
        return RequestedEvents::default();
    };
    let duration = items
        .first()
        .and_then(|item| item.params.get("duration"))
        .and_then(structured::ParamValue::as_scalar)
        .and_then(|v| v.parse().ok());
    // Absent a nested `accept=(...)`, the client proposed no media types at
    // all (e.g. a bare `"prep"` offer) and `negotiate_content` must default
    // to `*/*` — it must not be handed the outer `"prep"` item itself as a
    // requested media type, which would never match any server offer.
    let accept = items
        .first()
        .and_then(|item| item.extra_params.as_ref())
        .and_then(|extra| extra.get("accept"))
        .and_then(|value| match value {
            structured::ParamValue::Items(items) => Some(items.clone()),
            structured::ParamValue::List(bares) => Some(
                bares
                    .iter()
                    .map(|b| structured::StructuredItem::new(b.clone()))
                    .collect(),
            ),
            structured::ParamValue::Scalar(_) => None,
        });
    RequestedEvents { accept, duration }
}

fn failed_response(header: crate::session::EventsHeader) -> Response {
    let status = match header.0.get("status") {
        Some(structured::DictValue::Integer(code)) => {
            u16::try_from(*code).unwrap_or(500)
        }
        _ => 500,
    };
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status_code;
    response
        .headers_mut()
        .insert("events", axum::http::HeaderValue::from_str(&header.serialize()).unwrap_or_else(|_| axum::http::HeaderValue::from_static("")));
    response
}
