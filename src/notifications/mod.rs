pub mod delivery;
pub mod email;
pub mod events;
pub mod fanout;
pub mod push;

use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::realtime::relay::{self, RelayEnvelope, RelayScope};
use crate::realtime::WireEvent;
use crate::shared::error::EngineError;
use crate::shared::schema::{notification_delivery_log, notification_preferences, notifications};
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub ticket_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = notification_preferences)]
pub struct NotificationPreference {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub digest: String,
    pub quiet_hours_start: Option<chrono::NaiveTime>,
    pub quiet_hours_end: Option<chrono::NaiveTime>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = notification_delivery_log)]
pub struct DeliveryLogEntry {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn unread_count_for(pool: &DbPool, user_id: Uuid) -> Result<i64, EngineError> {
    let mut conn = pool.get()?;
    let count = notifications::table
        .filter(notifications::user_id.eq(user_id))
        .filter(notifications::is_read.eq(false))
        .count()
        .get_result(&mut conn)?;
    Ok(count)
}

/// Pushes the fresh unread count to every live connection of the user,
/// across processes.
pub async fn push_unread_count(state: &AppState, user_id: Uuid) {
    if let Ok(count) = unread_count_for(&state.conn, user_id) {
        relay::publish(
            state,
            RelayEnvelope {
                scope: RelayScope::User(user_id),
                event: WireEvent::unread_count(count),
            },
        )
        .await;
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Uuid,
    pub unread_only: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Notification>>, EngineError> {
    let mut conn = state.conn.get()?;
    let mut q = notifications::table
        .filter(notifications::user_id.eq(query.user_id))
        .into_boxed();
    if query.unread_only.unwrap_or(false) {
        q = q.filter(notifications::is_read.eq(false));
    }
    let rows: Vec<Notification> = q
        .order(notifications::created_at.desc())
        .limit(query.limit.unwrap_or(50))
        .offset(query.offset.unwrap_or(0))
        .load(&mut conn)?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

pub async fn get_unread_count(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let count = unread_count_for(&state.conn, query.user_id)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, EngineError> {
    let mut conn = state.conn.get()?;
    let now = Utc::now();
    diesel::update(notifications::table.filter(notifications::id.eq(id)))
        .set((
            notifications::is_read.eq(true),
            notifications::read_at.eq(Some(now)),
        ))
        .execute(&mut conn)?;
    let notification: Notification = notifications::table
        .filter(notifications::id.eq(id))
        .first(&mut conn)
        .map_err(|_| EngineError::NotificationNotFound(id))?;
    drop(conn);

    relay::publish(
        &state,
        RelayEnvelope {
            scope: RelayScope::User(notification.user_id),
            event: WireEvent::new(
                "notification:marked-read",
                serde_json::json!({ "id": id }),
            ),
        },
    )
    .await;
    push_unread_count(&state, notification.user_id).await;
    Ok(Json(notification))
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let mut conn = state.conn.get()?;
    let now = Utc::now();
    let updated = diesel::update(
        notifications::table
            .filter(notifications::user_id.eq(query.user_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set((
        notifications::is_read.eq(true),
        notifications::read_at.eq(Some(now)),
    ))
    .execute(&mut conn)?;
    drop(conn);

    relay::publish(
        &state,
        RelayEnvelope {
            scope: RelayScope::User(query.user_id),
            event: WireEvent::new(
                "notification:all-marked-read",
                serde_json::json!({ "updated": updated }),
            ),
        },
    )
    .await;
    push_unread_count(&state, query.user_id).await;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

/// Delivery-log read model: status/attempts/last error per channel for one
/// notification, the operational view behind the retry scheduler.
pub async fn get_delivery_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryLogEntry>>, EngineError> {
    let mut conn = state.conn.get()?;
    let rows: Vec<DeliveryLogEntry> = notification_delivery_log::table
        .filter(notification_delivery_log::notification_id.eq(id))
        .order(notification_delivery_log::created_at.asc())
        .load(&mut conn)?;
    Ok(Json(rows))
}

pub fn configure_notifications_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/unread-count", get(get_unread_count))
        .route("/api/notifications/read-all", put(mark_all_read))
        .route("/api/notifications/:id/read", put(mark_read))
        .route("/api/notifications/:id/delivery", get(get_delivery_log))
}
