use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::auth::require_actor;
use crate::engine::{
    now_ms, BookingParty, BookingRequest, Engine, EngineError, EventDraft, EventPatch, RangeQuery,
};
use crate::ledger::SessionSummary;
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

type AppState = Arc<Engine>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/schedule", get(schedule_range))
        .route("/api/schedule/public", get(public_schedule))
        .route("/api/schedule/events", post(create_event))
        .route(
            "/api/schedule/events/:id",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/api/schedule/events/:id/cancel", post(cancel_event))
        .route("/api/schedule/events/:id/merge", post(merge_event))
        .route("/api/schedule/workouts/:workout_id", get(events_by_workout))
        .route("/api/schedule/bookings", post(create_booking))
        .route("/api/schedule/bookings/:id/respond", post(respond_to_booking))
        .route("/api/schedule/sessions/summary", get(session_summary))
        .route_layer(middleware::from_fn(track_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(REQUESTS_TOTAL, "route" => route.clone(), "method" => method.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route, "method" => method)
        .record(start.elapsed().as_secs_f64());
    response
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        Self(EngineError::Validation(r.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(r: QueryRejection) -> Self {
        Self(EngineError::Validation(r.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            EngineError::Unauthorized(_) => (StatusCode::FORBIDDEN, "AUTHORIZATION_ERROR"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            EngineError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            EngineError::Collaborator(_) | EngineError::WalError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", self.0);
            "internal error".to_owned()
        } else {
            self.0.to_string()
        };
        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Wire format ─────────────────────────────────────────────────

fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// RFC 3339, or `YYYY-MM-DD` taken as UTC midnight.
pub fn parse_instant(value: &str) -> Result<Ms, EngineError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Ok(t.timestamp_millis());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc().timestamp_millis())
        .ok_or_else(|| EngineError::Validation(format!("invalid timestamp {value:?}")))
}

fn parse_id(value: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(value).map_err(|_| EngineError::Validation(format!("invalid id {value:?}")))
}

fn parse_opt_id(value: Option<&str>) -> Result<Option<Ulid>, EngineError> {
    value.map(parse_id).transpose()
}

fn parse_range(start: &str, end: &str) -> Result<Span, EngineError> {
    let (start, end) = (parse_instant(start)?, parse_instant(end)?);
    if end <= start {
        return Err(EngineError::Validation("endDate must be after startDate".into()));
    }
    Ok(Span::new(start, end))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    pub id: Ulid,
    pub trainer_id: UserId,
    pub client_id: Option<UserId>,
    pub start_date_time: String,
    pub end_date_time: String,
    pub event_type: EventType,
    pub status: EventStatus,
    pub availability_source: AvailabilitySource,
    pub recurrence_rule: Option<String>,
    pub recurrence_group_id: Option<Ulid>,
    pub workout_id: Option<Ulid>,
    pub session_type_id: Option<Ulid>,
    pub custom_client: Option<CustomClient>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub requested_by: Option<UserId>,
    pub cancelled_by: Option<UserId>,
    pub version: u64,
}

impl From<ScheduleEvent> for EventView {
    fn from(e: ScheduleEvent) -> Self {
        Self {
            id: e.id,
            trainer_id: e.trainer_id,
            client_id: e.client_id,
            start_date_time: format_instant(e.span.start),
            end_date_time: format_instant(e.span.end),
            event_type: e.event_type,
            status: e.status,
            availability_source: e.availability_source,
            recurrence_rule: e.recurrence_rule,
            recurrence_group_id: e.recurrence_group_id,
            workout_id: e.workout_id,
            session_type_id: e.session_type_id,
            custom_client: e.custom_client,
            title: e.title,
            notes: e.notes,
            requested_by: e.requested_by,
            cancelled_by: e.cancelled_by,
            version: e.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyView {
    pub trainer_id: UserId,
    pub start_date_time: String,
    pub end_date_time: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryView {
    Event(EventView),
    Busy(BusyView),
}

impl From<CalendarEntry> for EntryView {
    fn from(entry: CalendarEntry) -> Self {
        match entry {
            CalendarEntry::Event(e) => EntryView::Event(e.into()),
            CalendarEntry::Busy(b) => EntryView::Busy(BusyView {
                trainer_id: b.trainer_id,
                start_date_time: format_instant(b.span.start),
                end_date_time: format_instant(b.span.end),
            }),
        }
    }
}

fn entries(list: Vec<CalendarEntry>) -> Json<Vec<EntryView>> {
    Json(list.into_iter().map(EntryView::from).collect())
}

// ── Handlers ────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeParams {
    start_date: String,
    end_date: String,
    trainer_id: Option<String>,
    client_id: Option<String>,
    include_availability: Option<bool>,
}

impl RangeParams {
    fn into_query(self) -> Result<RangeQuery, EngineError> {
        Ok(RangeQuery {
            trainer_id: parse_opt_id(self.trainer_id.as_deref())?,
            client_id: parse_opt_id(self.client_id.as_deref())?,
            span: parse_range(&self.start_date, &self.end_date)?,
            include_availability: self.include_availability.unwrap_or(true),
        })
    }
}

async fn schedule_range(
    State(engine): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<RangeParams>, QueryRejection>,
) -> ApiResult<Json<Vec<EntryView>>> {
    let actor = require_actor(&headers)?;
    let Query(params) = params?;
    let list = engine
        .get_schedule_range(Viewer::Authenticated(actor), params.into_query()?)
        .await?;
    Ok(entries(list))
}

/// Anonymized view for any caller, identity headers are ignored.
async fn public_schedule(
    State(engine): State<AppState>,
    params: Result<Query<RangeParams>, QueryRejection>,
) -> ApiResult<Json<Vec<EntryView>>> {
    let Query(params) = params?;
    let mut q = params.into_query()?;
    q.client_id = None;
    Ok(entries(engine.get_schedule_range(Viewer::Public, q).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEventBody {
    start_date_time: String,
    end_date_time: String,
    event_type: EventType,
    status: Option<EventStatus>,
    availability_source: Option<AvailabilitySource>,
    client_id: Option<Ulid>,
    custom_client: Option<CustomClient>,
    recurrence_rule: Option<String>,
    recurrence_group_id: Option<Ulid>,
    workout_id: Option<Ulid>,
    session_type_id: Option<Ulid>,
    title: Option<String>,
    notes: Option<String>,
}

async fn create_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateEventBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EventView>)> {
    let actor = require_actor(&headers)?;
    let Json(body) = body?;
    let span = parse_range(&body.start_date_time, &body.end_date_time)?;
    let draft = EventDraft {
        status: body.status,
        availability_source: body.availability_source,
        client_id: body.client_id,
        custom_client: body.custom_client,
        recurrence_rule: body.recurrence_rule,
        recurrence_group_id: body.recurrence_group_id,
        workout_id: body.workout_id,
        session_type_id: body.session_type_id,
        title: body.title,
        notes: body.notes,
        ..EventDraft::new(span, body.event_type)
    };
    let event = engine.create_event(actor, draft).await?;
    Ok((StatusCode::CREATED, Json(event.into())))
}

async fn get_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let actor = require_actor(&headers)?;
    let event = engine.get_event(actor, parse_id(&id)?).await?;
    Ok(Json(event.into()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateEventBody {
    start_date_time: Option<String>,
    end_date_time: Option<String>,
    event_type: Option<EventType>,
    status: Option<EventStatus>,
    client_id: Option<Ulid>,
    custom_client: Option<CustomClient>,
    title: Option<String>,
    notes: Option<String>,
    workout_id: Option<Ulid>,
    session_type_id: Option<Ulid>,
    expected_version: Option<u64>,
}

async fn update_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdateEventBody>, JsonRejection>,
) -> ApiResult<Json<EventView>> {
    let actor = require_actor(&headers)?;
    let id = parse_id(&id)?;
    let Json(body) = body?;
    let patch = EventPatch {
        start: body.start_date_time.as_deref().map(parse_instant).transpose()?,
        end: body.end_date_time.as_deref().map(parse_instant).transpose()?,
        event_type: body.event_type,
        status: body.status,
        client_id: body.client_id,
        custom_client: body.custom_client,
        title: body.title,
        notes: body.notes,
        workout_id: body.workout_id,
        session_type_id: body.session_type_id,
    };
    let event = engine
        .update_event(actor, id, patch, body.expected_version)
        .await?;
    Ok(Json(event.into()))
}

async fn delete_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let actor = require_actor(&headers)?;
    engine.delete_event(actor, parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let actor = require_actor(&headers)?;
    let event = engine.cancel_event(actor, parse_id(&id)?).await?;
    Ok(Json(event.into()))
}

async fn merge_event(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<EventView>> {
    let actor = require_actor(&headers)?;
    let event = engine.merge_open_availability(actor, parse_id(&id)?).await?;
    Ok(Json(event.into()))
}

async fn events_by_workout(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(workout_id): Path<String>,
) -> ApiResult<Json<Vec<EventView>>> {
    let actor = require_actor(&headers)?;
    let events = engine
        .events_by_workout(actor, parse_id(&workout_id)?)
        .await?;
    Ok(Json(events.into_iter().map(EventView::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookingBody {
    trainer_id: Ulid,
    availability_id: Ulid,
    start_date_time: String,
    end_date_time: String,
    #[serde(default)]
    is_recurring: bool,
    client_id: Option<Ulid>,
    custom_client: Option<CustomClient>,
    workout_id: Option<Ulid>,
    session_type_id: Option<Ulid>,
    notes: Option<String>,
}

/// Clients request a booking; trainers book directly.
async fn create_booking(
    State(engine): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BookingBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EventView>)> {
    let actor = require_actor(&headers)?;
    let Json(body) = body?;
    let req = BookingRequest {
        trainer_id: body.trainer_id,
        availability_id: body.availability_id,
        span: parse_range(&body.start_date_time, &body.end_date_time)?,
        recurring: body.is_recurring,
        workout_id: body.workout_id,
        session_type_id: body.session_type_id,
        notes: body.notes,
    };
    let event = match actor.role {
        Role::Client => {
            if body.client_id.is_some_and(|c| c != actor.user_id) {
                return Err(EngineError::Unauthorized("clients book only for themselves".into()).into());
            }
            engine.request_booking(actor, req).await?
        }
        Role::Trainer => {
            let party = match (body.client_id, body.custom_client) {
                (Some(client_id), _) => BookingParty::Client(client_id),
                (None, Some(custom)) => BookingParty::Custom(custom),
                (None, None) => {
                    return Err(EngineError::Validation(
                        "clientId or customClient is required".into(),
                    )
                    .into());
                }
            };
            engine.trainer_book_availability(actor, party, req).await?
        }
    };
    Ok((StatusCode::CREATED, Json(event.into())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    status: EventStatus,
    start_date_time: Option<String>,
    end_date_time: Option<String>,
}

async fn respond_to_booking(
    State(engine): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<RespondBody>, JsonRejection>,
) -> ApiResult<Json<EventView>> {
    let actor = require_actor(&headers)?;
    let id = parse_id(&id)?;
    let Json(body) = body?;
    let start = body.start_date_time.as_deref().map(parse_instant).transpose()?;
    let end = body.end_date_time.as_deref().map(parse_instant).transpose()?;
    let event = engine
        .respond_to_booking(actor, id, body.status, start, end)
        .await?;
    Ok(Json(event.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryParams {
    trainer_id: String,
    client_id: String,
}

async fn session_summary(
    State(engine): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<SummaryParams>, QueryRejection>,
) -> ApiResult<Json<SessionSummary>> {
    let actor = require_actor(&headers)?;
    let Query(params) = params?;
    let summary = engine
        .session_summary(
            actor,
            parse_id(&params.trainer_id)?,
            parse_id(&params.client_id)?,
            now_ms(),
        )
        .await?;
    Ok(Json(summary))
}
