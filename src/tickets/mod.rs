pub mod assignment;
pub mod state_machine;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::notifications::events::TicketEvent;
use crate::notifications::fanout::fan_out;
use crate::realtime::relay::{self, RelayEnvelope, RelayScope};
use crate::realtime::{admins_group, agents_group, WireEvent};
use crate::shared::error::EngineError;
use crate::shared::schema::{support_tickets, ticket_activities, ticket_comments};
use crate::shared::state::AppState;
use self::state_machine::{apply_and_notify, TicketPatch, TicketPriority, TicketStatus};

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = support_tickets)]
pub struct SupportTicket {
    pub id: Uuid,
    pub org_id: Uuid,
    pub ticket_number: String,
    pub subject: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub source: String,
    pub requester_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub first_response_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row; one per changed field category per transition.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_activities)]
pub struct TicketActivity {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub description: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = ticket_comments)]
pub struct TicketComment {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub author_id: Option<Uuid>,
    pub content: String,
    pub is_internal: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub source: Option<String>,
    pub requester_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    pub assignee_id: Option<Option<Uuid>>,
    pub team_id: Option<Option<Uuid>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub actor_id: Option<Uuid>,
}

impl UpdateTicketRequest {
    fn into_patch(self) -> Result<TicketPatch, EngineError> {
        Ok(TicketPatch {
            status: self.status.as_deref().map(TicketStatus::parse).transpose()?,
            priority: self
                .priority
                .as_deref()
                .map(TicketPriority::parse)
                .transpose()?,
            assignee_id: self.assignee_id,
            team_id: self.team_id,
            category: self.category,
            due_date: self.due_date,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AssignTicketRequest {
    pub assignee_id: Uuid,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: String,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub author_id: Option<Uuid>,
    pub content: String,
    pub is_internal: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub requester_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn generate_ticket_number(conn: &mut PgConnection, org_id: Uuid) -> String {
    let count: i64 = support_tickets::table
        .filter(support_tickets::org_id.eq(org_id))
        .count()
        .get_result(conn)
        .unwrap_or(0);
    format!("TKT-{:06}", count + 1)
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<SupportTicket>, EngineError> {
    let priority = req
        .priority
        .as_deref()
        .map(TicketPriority::parse)
        .transpose()?
        .unwrap_or(TicketPriority::Medium);
    let org_id = req.org_id.unwrap_or(Uuid::nil());
    let now = Utc::now();

    let ticket = {
        let mut conn = state.conn.get()?;
        let ticket = SupportTicket {
            id: Uuid::new_v4(),
            org_id,
            ticket_number: generate_ticket_number(&mut conn, org_id),
            subject: req.subject,
            description: req.description,
            status: TicketStatus::New.as_str().to_string(),
            priority: priority.as_str().to_string(),
            category: req.category,
            source: req.source.unwrap_or_else(|| "web".to_string()),
            requester_id: req.requester_id,
            assignee_id: None,
            team_id: None,
            due_date: None,
            first_response_at: None,
            resolved_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        };
        diesel::insert_into(support_tickets::table)
            .values(&ticket)
            .execute(&mut conn)?;
        ticket
    };

    // Routing first, so the created event already carries an assignee when a
    // rule or the load balancer found one.
    if let Err(e) = assignment::auto_assign(&state, ticket.id, false).await {
        log::warn!("Auto-assignment failed for ticket {}: {e}", ticket.id);
    }

    fan_out(
        &state,
        TicketEvent::TicketCreated {
            ticket_id: ticket.id,
            actor_id: req.requester_id,
            subject: ticket.subject.clone(),
        },
    )
    .await;

    Ok(Json(ticket))
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SupportTicket>>, EngineError> {
    let mut conn = state.conn.get()?;
    let mut q = support_tickets::table.into_boxed();
    if let Some(status) = query.status {
        q = q.filter(support_tickets::status.eq(status));
    }
    if let Some(priority) = query.priority {
        q = q.filter(support_tickets::priority.eq(priority));
    }
    if let Some(assignee_id) = query.assignee_id {
        q = q.filter(support_tickets::assignee_id.eq(assignee_id));
    }
    if let Some(requester_id) = query.requester_id {
        q = q.filter(support_tickets::requester_id.eq(requester_id));
    }
    let tickets: Vec<SupportTicket> = q
        .order(support_tickets::created_at.desc())
        .limit(query.limit.unwrap_or(50))
        .offset(query.offset.unwrap_or(0))
        .load(&mut conn)?;
    Ok(Json(tickets))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SupportTicket>, EngineError> {
    let mut conn = state.conn.get()?;
    let ticket: SupportTicket = support_tickets::table
        .filter(support_tickets::id.eq(id))
        .first(&mut conn)
        .map_err(|_| EngineError::TicketNotFound(id))?;
    Ok(Json(ticket))
}

pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<SupportTicket>, EngineError> {
    let actor = req.actor_id;
    let patch = req.into_patch()?;
    let ticket = apply_and_notify(&state, id, patch, actor).await?;
    Ok(Json(ticket))
}

pub async fn assign_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignTicketRequest>,
) -> Result<Json<SupportTicket>, EngineError> {
    let patch = TicketPatch {
        assignee_id: Some(Some(req.assignee_id)),
        ..Default::default()
    };
    let ticket = apply_and_notify(&state, id, patch, req.actor_id).await?;
    Ok(Json(ticket))
}

pub async fn change_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<SupportTicket>, EngineError> {
    let patch = TicketPatch {
        status: Some(TicketStatus::parse(&req.status)?),
        ..Default::default()
    };
    let ticket = apply_and_notify(&state, id, patch, req.actor_id).await?;
    Ok(Json(ticket))
}

/// A public customer reply on a RESOLVED ticket reopens it through the state
/// machine, so the reopen produces its activity row and fan-out like any
/// other transition.
pub async fn add_comment(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<Json<TicketComment>, EngineError> {
    let (comment, ticket) = {
        let mut conn = state.conn.get()?;
        let ticket: SupportTicket = support_tickets::table
            .filter(support_tickets::id.eq(ticket_id))
            .first(&mut conn)
            .map_err(|_| EngineError::TicketNotFound(ticket_id))?;
        let comment = TicketComment {
            id: Uuid::new_v4(),
            ticket_id,
            author_id: req.author_id,
            content: req.content,
            is_internal: req.is_internal.unwrap_or(false),
            created_at: Utc::now(),
        };
        diesel::insert_into(ticket_comments::table)
            .values(&comment)
            .execute(&mut conn)?;
        (comment, ticket)
    };

    if !comment.is_internal {
        let is_requester_reply =
            comment.author_id.is_some() && comment.author_id == ticket.requester_id;
        if is_requester_reply && ticket.status == TicketStatus::Resolved.as_str() {
            let patch = TicketPatch {
                status: Some(TicketStatus::Open),
                ..Default::default()
            };
            if let Err(e) = apply_and_notify(&state, ticket_id, patch, comment.author_id).await {
                log::warn!("Reopen on reply failed for ticket {ticket_id}: {e}");
            }
        }

        let excerpt: String = comment.content.chars().take(140).collect();
        fan_out(
            &state,
            TicketEvent::TicketReply {
                ticket_id,
                author_id: comment.author_id,
                subject: ticket.subject.clone(),
                excerpt,
            },
        )
        .await;
    }

    Ok(Json(comment))
}

pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Json<Vec<TicketComment>>, EngineError> {
    let mut conn = state.conn.get()?;
    let comments: Vec<TicketComment> = ticket_comments::table
        .filter(ticket_comments::ticket_id.eq(ticket_id))
        .order(ticket_comments::created_at.asc())
        .load(&mut conn)?;
    Ok(Json(comments))
}

pub async fn list_activities(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Json<Vec<TicketActivity>>, EngineError> {
    let mut conn = state.conn.get()?;
    let activities: Vec<TicketActivity> = ticket_activities::table
        .filter(ticket_activities::ticket_id.eq(ticket_id))
        .order(ticket_activities::created_at.asc())
        .load(&mut conn)?;
    Ok(Json(activities))
}

pub async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    let org_id = {
        let mut conn = state.conn.get()?;
        let org_id: Option<Uuid> = support_tickets::table
            .filter(support_tickets::id.eq(id))
            .select(support_tickets::org_id)
            .first(&mut conn)
            .optional()?;
        diesel::delete(support_tickets::table.filter(support_tickets::id.eq(id)))
            .execute(&mut conn)?;
        org_id
    };
    if let Some(org_id) = org_id {
        for group in [agents_group(org_id), admins_group(org_id)] {
            relay::publish(
                &state,
                RelayEnvelope {
                    scope: RelayScope::Group(group),
                    event: WireEvent::new("ticket:deleted", serde_json::json!({ "ticket_id": id })),
                },
            )
            .await;
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route(
            "/api/tickets/:id",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route("/api/tickets/:id/assign", put(assign_ticket))
        .route("/api/tickets/:id/status", put(change_status))
        .route(
            "/api/tickets/:id/comments",
            get(list_comments).post(add_comment),
        )
        .route("/api/tickets/:id/activities", get(list_activities))
}
