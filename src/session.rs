//! Per-request PREP lifecycle: `configure`, `send`, `trigger`,
//! `default_notification`.
//!
//! A JavaScript-style implementation would mutate a shared response object
//! with new method slots; here that becomes an explicit per-request context
//! struct, [`PrepSession`], built from the process-wide [`PrepEngine`]
//! singleton that owns the subscription index and event-id store.

use crate::config::Config;
use crate::connection::ConnectionControl;
use crate::event_id::EventIdStore;
use crate::negotiate::{
    cleanup, negotiate_content, AcceptEventsOffer, EventProfile, RequestedEvents,
};
use crate::structured::{
    self, append_item, serialize_item, DictValue, ParamValue, StructuredDict, StructuredItem,
};
use crate::subscription::{NotificationEvent, SubscriptionIndex};
use crate::template::{self, NotificationFields};

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures_util::Stream;
use rand::RngCore;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const BOUNDARY_LEN: usize = 20;
const QUIRK_PAD_CRLFS: usize = 240;

/// Statuses `send` is willing to continue streaming for.
const ELIGIBLE_STATUSES: [u16; 4] = [200, 204, 206, 226];

/// Process-wide PREP singleton: the subscription index and event-id store,
/// both process-global mutable singletons shared by every request, plus the
/// runtime config.
pub struct PrepEngine {
    pub config: Config,
    pub index: Arc<SubscriptionIndex>,
    pub event_ids: EventIdStore,
}

impl PrepEngine {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            index: Arc::new(SubscriptionIndex::new()),
            event_ids: EventIdStore::new(),
        })
    }

    #[must_use]
    pub fn from_env() -> Arc<Self> {
        Self::new(Config::from_env())
    }
}

/// The `Events` response header value.
#[derive(Debug, Clone, Default)]
pub struct EventsHeader(pub StructuredDict);

impl EventsHeader {
    #[must_use]
    pub fn with_status(status: u16) -> Self {
        let mut dict = StructuredDict::new();
        dict.insert("protocol".to_owned(), DictValue::Token("prep".to_owned()));
        dict.insert("status".to_owned(), DictValue::Integer(i64::from(status)));
        Self(dict)
    }

    #[must_use]
    pub fn serialize(&self) -> String {
        structured::serialize_dict(&self.0)
    }
}

/// Data needed to identify the request this session is serving. Populated
/// by the caller from whatever request-parsing layer it runs; this crate
/// never parses raw headers itself for the live `Accept-Events` value, only
/// the `configure`-side offer string.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
    pub requested_events: RequestedEvents,
    pub last_event_id: Option<String>,
    /// Handle onto this request's underlying socket, if the host
    /// application captured one at accept time. `send` uses it to extend
    /// the connection's keepalive once negotiation succeeds.
    pub connection: Option<ConnectionControl>,
}

/// The representation body handed to [`PrepSession::send`]: either already
/// buffered or a stream the caller wants piped through.
pub enum RepresentationBody {
    None,
    Buffered(Bytes),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>),
}

/// Application-supplied negotiation hooks, defaulting to identity.
pub struct Modifiers {
    pub negotiate_events: Box<dyn FnOnce(Option<EventProfile>) -> Option<EventProfile> + Send>,
    pub modify_events_header: Box<dyn FnOnce(&EventProfile) -> StructuredDict + Send>,
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            negotiate_events: Box::new(|p| p),
            modify_events_header: Box::new(|_| StructuredDict::new()),
        }
    }
}

/// Arguments for [`PrepSession::send`].
pub struct SendArgs {
    pub status_code: u16,
    /// Headers written on the representation part (`K: V\r\n` lines).
    pub part_headers: Vec<(String, String)>,
    pub body: RepresentationBody,
    pub modifiers: Modifiers,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            status_code: 200,
            part_headers: Vec::new(),
            body: RepresentationBody::None,
            modifiers: Modifiers::default(),
        }
    }
}

/// Outcome of [`PrepSession::send`]: either negotiation/preconditions
/// failed (caller serializes `outcome` into the `Events` header and
/// returns its own response) or the session took over the response and
/// streaming has begun.
pub enum SendOutcome {
    Failed(EventsHeader),
    Streaming(Response<Body>),
}

/// Per-request PREP context.
pub struct PrepSession {
    engine: Arc<PrepEngine>,
    request: RequestContext,
    config: Option<AcceptEventsOffer>,
    accept_events_header: Option<String>,
    deferred: Vec<DeferredNotify>,
}

struct DeferredNotify {
    path: String,
    generate: Box<dyn FnMut(&EventProfile) -> Option<String> + Send>,
    last_event: bool,
}

impl PrepSession {
    #[must_use]
    pub fn new(engine: Arc<PrepEngine>, request: RequestContext) -> Self {
        Self {
            engine,
            request,
            config: None,
            accept_events_header: None,
            deferred: Vec::new(),
        }
    }

    /// Value to append to the response `Accept-Events` header, if
    /// `configure` has run successfully.
    #[must_use]
    pub fn accept_events_header(&self) -> Option<&str> {
        self.accept_events_header.as_deref()
    }

    /// Builds the candidate `Accept-Events` offer item, parses it, and on
    /// success appends it to the response's `Accept-Events` header and
    /// stores the offer for later negotiation. Falls back to the engine's
    /// configured default content types when the caller doesn't supply its
    /// own config fragment.
    pub fn configure(&mut self, config: Option<&str>) -> Result<(), EventsHeader> {
        let config_str = match config {
            Some(config_str) => config_str.to_owned(),
            None => self.engine.config.default_accept_fragment(),
        };
        let candidate = format!("\"prep\";{config_str}");

        let item = structured::parse_item(&candidate).map_err(|err| {
            warn!(error = %err, candidate = %candidate, "prep configure: unparseable offer");
            EventsHeader::with_status(500)
        })?;

        let offer = AcceptEventsOffer::from_item(&item).ok_or_else(|| {
            warn!(candidate = %candidate, "prep configure: offer has no accept field");
            EventsHeader::with_status(500)
        })?;

        self.accept_events_header = Some(append_item(
            self.accept_events_header.as_deref(),
            &serialize_item(&item),
        ));
        self.config = Some(offer);
        Ok(())
    }

    /// Negotiates, registers with the subscription engine, and streams the
    /// nested multipart envelope. Returns [`SendOutcome::Failed`] without
    /// touching the response when any precondition or negotiation step
    /// fails.
    pub fn send(&self, mut args: SendArgs) -> SendOutcome {
        if !ELIGIBLE_STATUSES.contains(&args.status_code) {
            return SendOutcome::Failed(EventsHeader::with_status(412));
        }
        let Some(config) = &self.config else {
            return SendOutcome::Failed(EventsHeader::with_status(500));
        };
        if config.accept.is_empty() {
            return SendOutcome::Failed(EventsHeader::with_status(500));
        }

        // Quality is a request-side concern only; never stored.
        let mut requested = self.request.requested_events.clone();
        if let Some(accept) = &mut requested.accept {
            for item in accept.iter_mut() {
                item.params.shift_remove("q");
            }
        }

        let negotiated = negotiate_content(&requested, config);
        let negotiated = (args.modifiers.negotiate_events)(negotiated);
        let Some(negotiated) = negotiated else {
            return SendOutcome::Failed(EventsHeader::with_status(406));
        };
        let profile = cleanup(negotiated);

        let mut vary = vec!["Accept-Events".to_owned()];

        let duration_secs = self.engine.config.resolve_duration(requested.duration);
        let expires = chrono::Utc::now() + chrono::Duration::seconds(duration_secs as i64);
        let expires_rfc1123 = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut events_header = EventsHeader::with_status(200);
        events_header
            .0
            .insert("expires".to_owned(), DictValue::Str(expires_rfc1123));

        let has_body = !matches!(args.body, RepresentationBody::None);
        let last_event_id = self.request.last_event_id.as_deref();
        let should_skip_body = has_body
            && last_event_id.is_some_and(|id| {
                id == "*" || Some(id) == self.engine.event_ids.last_event_id(&self.request.path).as_deref()
            });
        if last_event_id.is_some() {
            vary.push("Last-Event-ID".to_owned());
        }
        if should_skip_body {
            args.body = RepresentationBody::None;
        }

        let mixed_boundary = random_boundary();
        let digest_boundary = random_boundary();

        let extra = (args.modifiers.modify_events_header)(&profile);
        for (k, v) in extra {
            events_header.0.insert(k, v);
        }

        let content_type = if should_skip_body {
            format!(r#"multipart/digest; boundary="{digest_boundary}""#)
        } else {
            format!(r#"multipart/mixed; boundary="{mixed_boundary}""#)
        };

        let quirk_mode = self
            .request
            .user_agent
            .as_deref()
            .is_some_and(is_firefox_user_agent);

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
        let engine = Arc::clone(&self.engine);
        let path = self.request.path.clone();
        let representation = if should_skip_body {
            None
        } else {
            Some((args.part_headers, args.body))
        };
        let duration = Duration::from_secs(duration_secs);
        if let Some(connection) = &self.request.connection {
            connection.extend_for(duration);
        }

        tokio::spawn(stream_envelope(
            engine,
            path,
            profile,
            mixed_boundary,
            digest_boundary,
            representation,
            should_skip_body,
            duration,
            quirk_mode,
            tx,
        ));

        let body = Body::from_stream(ReceiverStream::new(rx));
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, header_value(&content_type));
        headers.insert(header::VARY, header_value(&vary.join(", ")));
        if let Some(accept_events) = &self.accept_events_header {
            headers.insert("accept-events", header_value(accept_events));
        }
        headers.insert("events", header_value(&events_header.serialize()));

        SendOutcome::Streaming(response)
    }

    /// Schedules a notification for delivery after the caller's own
    /// synchronous handling completes. The caller drains these via
    /// [`PrepSession::run_deferred`] once it has finished building its own
    /// response.
    pub fn trigger(&mut self, args: TriggerArgs) {
        let path = args.path.unwrap_or_else(|| self.request.path.clone());
        let last_event = args
            .last_event
            .unwrap_or_else(|| path == self.request.path && self.request.method.eq_ignore_ascii_case("DELETE"));
        let generate: Box<dyn FnMut(&EventProfile) -> Option<String> + Send> =
            match args.generate_notification {
                Some(generate) => generate,
                // The per-part Content-Type line (non-default profiles
                // only) precedes the rendered rfc822 body.
                None => {
                    let rendered = self.default_notification(DefaultNotificationArgs::default());
                    Box::new(move |profile: &EventProfile| {
                        Some(format!("{}{}", template::header(profile), rendered))
                    })
                }
            };
        self.deferred.push(DeferredNotify {
            path,
            generate,
            last_event,
        });
        debug!(path = %self.request.path, "prep trigger scheduled");
    }

    /// Renders the default notification body from response/request
    /// context.
    #[must_use]
    pub fn default_notification(&self, args: DefaultNotificationArgs) -> String {
        let method = args.method.unwrap_or_else(|| self.request.method.clone());
        let date = args
            .date
            .unwrap_or_else(|| chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        let event_id = args
            .event_id
            .or_else(|| self.engine.event_ids.last_event_id(&self.request.path));
        let location = args.location.or_else(|| Some(self.request.path.clone()));
        let fields = NotificationFields {
            method,
            date,
            e_tag: args.e_tag,
            event_id,
            location,
            delta: args.delta,
        };
        format!("\r\n{}", template::rfc822(&fields))
    }

    /// Runs every notification scheduled via `trigger`, each preceded by a
    /// yield so the caller's own response has a chance to finish flushing
    /// first.
    pub async fn run_deferred(self) {
        for mut action in self.deferred {
            tokio::task::yield_now().await;
            self.engine
                .index
                .notify(&action.path, |profile| (action.generate)(profile), action.last_event);
        }
    }
}

/// Arguments for [`PrepSession::trigger`].
#[derive(Default)]
pub struct TriggerArgs {
    pub path: Option<String>,
    pub generate_notification: Option<Box<dyn FnMut(&EventProfile) -> Option<String> + Send>>,
    pub last_event: Option<bool>,
}

/// Arguments for [`PrepSession::default_notification`].
#[derive(Default)]
pub struct DefaultNotificationArgs {
    pub date: Option<String>,
    pub method: Option<String>,
    pub e_tag: Option<String>,
    pub event_id: Option<String>,
    pub location: Option<String>,
    pub delta: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn stream_envelope(
    engine: Arc<PrepEngine>,
    path: String,
    profile: EventProfile,
    mixed_boundary: String,
    digest_boundary: String,
    representation: Option<(Vec<(String, String)>, RepresentationBody)>,
    bare_digest: bool,
    duration: Duration,
    quirk_mode: bool,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    if let Some((part_headers, body)) = representation {
        if send_chunk(&tx, format!("--{mixed_boundary}\r\n")).await.is_err() {
            return;
        }
        for (k, v) in &part_headers {
            if send_chunk(&tx, format!("{k}: {v}\r\n")).await.is_err() {
                return;
            }
        }
        if send_chunk(&tx, "\r\n".to_owned()).await.is_err() {
            return;
        }
        match body {
            RepresentationBody::Buffered(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    return;
                }
            }
            RepresentationBody::Stream(mut stream) => {
                use futures_util::StreamExt;
                while let Some(chunk) = stream.next().await {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
            RepresentationBody::None => {}
        }
        let prologue = format!(
            "\r\n--{mixed_boundary}\r\nContent-Type: multipart/digest; boundary=\"{digest_boundary}\"\r\n\r\n--{digest_boundary}\r\n"
        );
        if send_chunk(&tx, prologue).await.is_err() {
            return;
        }
    } else if send_chunk(&tx, format!("--{digest_boundary}\r\n")).await.is_err() {
        return;
    }

    let (mut rx, unsubscribe) = engine.index.subscribe(path.clone(), profile);
    let deadline = tokio::time::Instant::now() + duration;
    let mut disconnected = false;

    loop {
        tokio::select! {
            () = tx.closed() => {
                // Socket close/response finish/request abort all collapse
                // to the outbound channel's receiver dropping; detect it
                // directly instead of waiting for the next write to fail
                // or the duration timer to expire.
                disconnected = true;
                break;
            }
            () = tokio::time::sleep_until(deadline) => {
                let _ = send_chunk(&tx, format!("\r\n--{digest_boundary}--\r\n")).await;
                break;
            }
            event = rx.recv() => {
                match event {
                    Some(NotificationEvent::Notification { body, last_event }) => {
                        let boundary_line = if last_event {
                            format!("--{digest_boundary}--\r\n")
                        } else {
                            format!("--{digest_boundary}\r\n")
                        };
                        if send_chunk(&tx, format!("\r\n{body}\r\n{boundary_line}")).await.is_err() {
                            disconnected = true;
                            break;
                        }
                        if quirk_mode && send_chunk(&tx, quirk_padding()).await.is_err() {
                            disconnected = true;
                            break;
                        }
                        if last_event {
                            break;
                        }
                    }
                    Some(NotificationEvent::End) | None => break,
                }
            }
        }
    }

    if !disconnected && !bare_digest {
        let _ = send_chunk(&tx, format!("\r\n--{mixed_boundary}--\r\n")).await;
    }
    unsubscribe.unsubscribe();
}

async fn send_chunk(
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
    chunk: String,
) -> Result<(), ()> {
    tx.send(Ok(Bytes::from(chunk))).await.map_err(|_| ())
}

/// Padding applied only after a written notification, never inline with
/// the boundary string, to defeat Firefox's buffering heuristics.
fn quirk_padding() -> String {
    "\r\n".repeat(QUIRK_PAD_CRLFS)
}

fn is_firefox_user_agent(user_agent: &str) -> bool {
    user_agent.to_ascii_lowercase().contains("firefox")
}

fn random_boundary() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut bytes = [0u8; BOUNDARY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    encoded.chars().take(BOUNDARY_LEN).collect()
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

impl AcceptEventsOffer {
    /// Extracts the nested `accept=(...)` list from a parsed
    /// `"prep";accept=(...)` item.
    #[must_use]
    pub fn from_item(item: &StructuredItem) -> Option<Self> {
        let extra = item.extra_params.as_ref()?;
        match extra.get("accept") {
            Some(ParamValue::Items(items)) => Some(Self {
                accept: items.clone(),
            }),
            Some(ParamValue::List(bares)) => Some(Self {
                accept: bares.iter().map(|b| StructuredItem::new(b.clone())).collect(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::StructuredItem;

    fn engine() -> Arc<PrepEngine> {
        PrepEngine::new(Config::default())
    }

    fn ctx(path: &str, method: &str) -> RequestContext {
        RequestContext {
            path: path.to_owned(),
            method: method.to_owned(),
            user_agent: None,
            requested_events: RequestedEvents::default(),
            last_event_id: None,
            connection: None,
        }
    }

    #[test]
    fn configure_appends_accept_events_header_and_stores_offer() {
        let mut session = PrepSession::new(engine(), ctx("/", "GET"));
        assert!(session.configure(None).is_ok());
        assert_eq!(
            session.accept_events_header(),
            Some(r#""prep";accept=("message/rfc822")"#)
        );
        assert!(session.config.is_some());
    }

    #[test]
    fn configure_rejects_offer_without_accept_field() {
        let mut session = PrepSession::new(engine(), ctx("/", "GET"));
        let err = session.configure(Some("foo=bar")).unwrap_err();
        assert_eq!(err.0.get("status"), Some(&DictValue::Integer(500)));
    }

    #[test]
    fn send_fails_412_when_status_ineligible() {
        let mut session = PrepSession::new(engine(), ctx("/", "GET"));
        session.configure(None).unwrap();
        let outcome = session.send(SendArgs {
            status_code: 404,
            ..Default::default()
        });
        match outcome {
            SendOutcome::Failed(header) => {
                assert_eq!(header.0.get("status"), Some(&DictValue::Integer(412)));
            }
            SendOutcome::Streaming(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn send_fails_500_without_prior_configure() {
        let session = PrepSession::new(engine(), ctx("/", "GET"));
        let outcome = session.send(SendArgs::default());
        match outcome {
            SendOutcome::Failed(header) => {
                assert_eq!(header.0.get("status"), Some(&DictValue::Integer(500)));
            }
            SendOutcome::Streaming(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn send_fails_406_when_no_media_type_overlaps() {
        let mut session = PrepSession::new(engine(), ctx("/", "GET"));
        session.configure(None).unwrap();
        session.request.requested_events = RequestedEvents {
            accept: Some(vec![StructuredItem::new("application/json")]),
            duration: None,
        };
        let outcome = session.send(SendArgs::default());
        match outcome {
            SendOutcome::Failed(header) => {
                assert_eq!(header.0.get("status"), Some(&DictValue::Integer(406)));
            }
            SendOutcome::Streaming(_) => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn send_succeeds_and_sets_expected_headers() {
        let mut session = PrepSession::new(engine(), ctx("/", "GET"));
        session.configure(None).unwrap();
        let outcome = session.send(SendArgs {
            status_code: 200,
            part_headers: vec![("Content-Type".to_owned(), "text/plain".to_owned())],
            body: RepresentationBody::Buffered(Bytes::from_static(b"The quick fox sees the dog.")),
            modifiers: Modifiers::default(),
        });
        let response = match outcome {
            SendOutcome::Streaming(response) => response,
            SendOutcome::Failed(_) => panic!("expected success"),
        };
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("multipart/mixed;"));
        let vary = response.headers().get(header::VARY).unwrap().to_str().unwrap();
        assert!(vary.contains("Accept-Events"));
        let events = response.headers().get("events").unwrap().to_str().unwrap();
        assert!(events.contains("status=200"));
    }

    #[test]
    fn is_firefox_user_agent_is_case_insensitive() {
        assert!(is_firefox_user_agent("Mozilla/5.0 (X11; Firefox/120.0)"));
        assert!(!is_firefox_user_agent("Mozilla/5.0 (Chrome)"));
    }

    #[test]
    fn trigger_defaults_last_event_to_true_only_for_delete_on_same_path() {
        let mut session = PrepSession::new(engine(), ctx("/r", "DELETE"));
        session.trigger(TriggerArgs::default());
        assert!(session.deferred[0].last_event);

        let mut session = PrepSession::new(engine(), ctx("/r", "PATCH"));
        session.trigger(TriggerArgs::default());
        assert!(!session.deferred[0].last_event);
    }
}
