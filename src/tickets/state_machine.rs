use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::notifications::events::TicketEvent;
use crate::notifications::fanout::fan_out;
use crate::shared::error::EngineError;
use crate::shared::schema::{support_tickets, ticket_activities};
use crate::shared::state::AppState;
use crate::tickets::{SupportTicket, TicketActivity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    New,
    Open,
    InProgress,
    Pending,
    Resolved,
    Closed,
    InitiateRefund,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::InitiateRefund => "initiate_refund",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "new" => Ok(Self::New),
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            "initiate_refund" => Ok(Self::InitiateRefund),
            other => Err(EngineError::InvalidStatus(other.to_string())),
        }
    }

    /// States where an agent is actively working the ticket; the first
    /// transition into one of them stamps the first-response time.
    pub fn is_in_progress_like(&self) -> bool {
        matches!(self, Self::InProgress | Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InitiateRefund)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(EngineError::InvalidStatus(format!("priority: {other}"))),
        }
    }
}

/// The enumerated lifecycle graph. Forward moves follow the chain
/// NEW -> OPEN -> IN_PROGRESS -> PENDING -> RESOLVED -> CLOSED; any
/// non-terminal state can fall back to OPEN (reopen), and INITIATE_REFUND is
/// reachable from the resolved-adjacent states.
pub fn can_transition(from: TicketStatus, to: TicketStatus) -> bool {
    use TicketStatus::*;
    match (from, to) {
        (New, Open)
        | (Open, InProgress)
        | (InProgress, Pending)
        | (Pending, Resolved)
        | (Resolved, Closed) => true,
        (Pending, InitiateRefund) | (Resolved, InitiateRefund) | (Closed, InitiateRefund) => true,
        (from, Open) => !from.is_terminal() && from != Open,
        _ => false,
    }
}

/// Partial update routed through the state machine. `Some(None)` clears a
/// nullable field.
#[derive(Debug, Clone, Default)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub assignee_id: Option<Option<Uuid>>,
    pub team_id: Option<Option<Uuid>>,
    pub category: Option<String>,
    pub due_date: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    Status {
        from: TicketStatus,
        to: TicketStatus,
    },
    Priority {
        from: TicketPriority,
        to: TicketPriority,
    },
    Assignee {
        from: Option<Uuid>,
        to: Option<Uuid>,
    },
    Team {
        from: Option<Uuid>,
        to: Option<Uuid>,
    },
    Category {
        from: Option<String>,
        to: Option<String>,
    },
    DueDate {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
}

impl FieldChange {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status_changed",
            Self::Priority { .. } => "priority_changed",
            Self::Assignee { .. } => "assignee_changed",
            Self::Team { .. } => "team_changed",
            Self::Category { .. } => "category_changed",
            Self::DueDate { .. } => "due_date_changed",
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::Status { from, to } => json!({ "from": from.as_str(), "to": to.as_str() }),
            Self::Priority { from, to } => json!({ "from": from.as_str(), "to": to.as_str() }),
            Self::Assignee { from, to } | Self::Team { from, to } => {
                json!({ "from": from, "to": to })
            }
            Self::Category { from, to } => json!({ "from": from, "to": to }),
            Self::DueDate { from, to } => json!({ "from": from, "to": to }),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Status { from, to } => {
                format!("Status changed from {} to {}", from.as_str(), to.as_str())
            }
            Self::Priority { from, to } => {
                format!("Priority changed from {} to {}", from.as_str(), to.as_str())
            }
            Self::Assignee { to: Some(a), .. } => format!("Assigned to {a}"),
            Self::Assignee { to: None, .. } => "Assignment removed".to_string(),
            Self::Team { to: Some(t), .. } => format!("Moved to team {t}"),
            Self::Team { to: None, .. } => "Team removed".to_string(),
            Self::Category { to, .. } => {
                format!("Category set to {}", to.as_deref().unwrap_or("(none)"))
            }
            Self::DueDate { .. } => "Due date changed".to_string(),
        }
    }
}

/// Applies a validated partial update atomically: the ticket row, its
/// timestamp stamps and one activity row per changed field all commit in
/// one transaction, serialized against concurrent transitions by a row
/// lock on the ticket.
pub fn apply_transition(
    conn: &mut PgConnection,
    ticket_id: Uuid,
    patch: TicketPatch,
    actor: Option<Uuid>,
) -> Result<(SupportTicket, Vec<FieldChange>), EngineError> {
    conn.transaction::<_, EngineError, _>(|conn| {
        let ticket: SupportTicket = support_tickets::table
            .filter(support_tickets::id.eq(ticket_id))
            .for_update()
            .first(conn)
            .map_err(|_| EngineError::TicketNotFound(ticket_id))?;

        let now = Utc::now();
        let mut changes: Vec<FieldChange> = Vec::new();

        if let Some(to) = patch.status {
            let from = TicketStatus::parse(&ticket.status)?;
            if to != from {
                if !can_transition(from, to) {
                    return Err(EngineError::InvalidTransition {
                        from: from.as_str().to_string(),
                        to: to.as_str().to_string(),
                    });
                }
                changes.push(FieldChange::Status { from, to });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::status.eq(to.as_str()))
                    .execute(conn)?;
                if to.is_in_progress_like() && ticket.first_response_at.is_none() {
                    diesel::update(
                        support_tickets::table.filter(support_tickets::id.eq(ticket_id)),
                    )
                    .set(support_tickets::first_response_at.eq(Some(now)))
                    .execute(conn)?;
                }
                if to == TicketStatus::Resolved && ticket.resolved_at.is_none() {
                    diesel::update(
                        support_tickets::table.filter(support_tickets::id.eq(ticket_id)),
                    )
                    .set(support_tickets::resolved_at.eq(Some(now)))
                    .execute(conn)?;
                }
                if to == TicketStatus::Closed && ticket.closed_at.is_none() {
                    diesel::update(
                        support_tickets::table.filter(support_tickets::id.eq(ticket_id)),
                    )
                    .set(support_tickets::closed_at.eq(Some(now)))
                    .execute(conn)?;
                }
            }
        }

        if let Some(to) = patch.priority {
            let from = TicketPriority::parse(&ticket.priority)?;
            if to != from {
                changes.push(FieldChange::Priority { from, to });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::priority.eq(to.as_str()))
                    .execute(conn)?;
            }
        }

        if let Some(to) = patch.assignee_id {
            if to != ticket.assignee_id {
                changes.push(FieldChange::Assignee {
                    from: ticket.assignee_id,
                    to,
                });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::assignee_id.eq(to))
                    .execute(conn)?;
            }
        }

        if let Some(to) = patch.team_id {
            if to != ticket.team_id {
                changes.push(FieldChange::Team {
                    from: ticket.team_id,
                    to,
                });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::team_id.eq(to))
                    .execute(conn)?;
            }
        }

        if let Some(to) = patch.category {
            if Some(to.as_str()) != ticket.category.as_deref() {
                changes.push(FieldChange::Category {
                    from: ticket.category.clone(),
                    to: Some(to.clone()),
                });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::category.eq(Some(to)))
                    .execute(conn)?;
            }
        }

        if let Some(to) = patch.due_date {
            if to != ticket.due_date {
                changes.push(FieldChange::DueDate {
                    from: ticket.due_date,
                    to,
                });
                diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                    .set(support_tickets::due_date.eq(to))
                    .execute(conn)?;
            }
        }

        if !changes.is_empty() {
            diesel::update(support_tickets::table.filter(support_tickets::id.eq(ticket_id)))
                .set(support_tickets::updated_at.eq(now))
                .execute(conn)?;
            for change in &changes {
                let activity = TicketActivity {
                    id: Uuid::new_v4(),
                    ticket_id,
                    user_id: actor,
                    action: change.action().to_string(),
                    description: change.description(),
                    details: change.details(),
                    created_at: now,
                };
                diesel::insert_into(ticket_activities::table)
                    .values(&activity)
                    .execute(conn)?;
            }
        }

        let updated: SupportTicket = support_tickets::table
            .filter(support_tickets::id.eq(ticket_id))
            .first(conn)?;
        Ok((updated, changes))
    })
}

/// Maps a committed transition to the domain events the fan-out engine
/// consumes. Assignment and resolution get their own kinds; an escalation to
/// urgent priority is the critical kind; everything else folds into one
/// ticket-updated event carrying the change set.
pub fn derive_events(
    ticket: &SupportTicket,
    changes: &[FieldChange],
    actor: Option<Uuid>,
) -> Vec<TicketEvent> {
    let mut events = Vec::new();
    let mut updated = serde_json::Map::new();

    for change in changes {
        match change {
            FieldChange::Assignee { to: Some(assignee), .. } => {
                events.push(TicketEvent::TicketAssigned {
                    ticket_id: ticket.id,
                    actor_id: actor,
                    assignee_id: *assignee,
                    subject: ticket.subject.clone(),
                });
            }
            FieldChange::Status {
                to: TicketStatus::Resolved,
                ..
            } => {
                events.push(TicketEvent::TicketResolved {
                    ticket_id: ticket.id,
                    actor_id: actor,
                    subject: ticket.subject.clone(),
                });
            }
            FieldChange::Priority {
                from,
                to: TicketPriority::Urgent,
            } if *from != TicketPriority::Urgent => {
                events.push(TicketEvent::TicketEscalated {
                    ticket_id: ticket.id,
                    actor_id: actor,
                    subject: ticket.subject.clone(),
                });
            }
            other => {
                updated.insert(other.action().to_string(), other.details());
            }
        }
    }

    if !updated.is_empty() {
        events.push(TicketEvent::TicketUpdated {
            ticket_id: ticket.id,
            actor_id: actor,
            subject: ticket.subject.clone(),
            changes: serde_json::Value::Object(updated),
        });
    }
    events
}

/// The full transition path: apply, commit, then fan out. Fan-out failures
/// are logged inside `fan_out` and never reach the caller, so the ticket
/// mutation succeeds or fails strictly on its own merits.
pub async fn apply_and_notify(
    state: &Arc<AppState>,
    ticket_id: Uuid,
    patch: TicketPatch,
    actor: Option<Uuid>,
) -> Result<SupportTicket, EngineError> {
    let (ticket, changes) = {
        let mut conn = state.conn.get()?;
        apply_transition(&mut conn, ticket_id, patch, actor)?
    };
    for event in derive_events(&ticket, &changes, actor) {
        fan_out(state, event).await;
    }
    Ok(ticket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TicketStatus::*;

    #[test]
    fn forward_chain_is_legal() {
        assert!(can_transition(New, Open));
        assert!(can_transition(Open, InProgress));
        assert!(can_transition(InProgress, Pending));
        assert!(can_transition(Pending, Resolved));
        assert!(can_transition(Resolved, Closed));
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        assert!(!can_transition(New, Resolved));
        assert!(!can_transition(Open, Closed));
        assert!(!can_transition(New, InProgress));
    }

    #[test]
    fn any_non_terminal_state_reopens() {
        for from in [InProgress, Pending, Resolved, Closed] {
            assert!(can_transition(from, Open), "{from:?} should reopen");
        }
        assert!(!can_transition(InitiateRefund, Open));
    }

    #[test]
    fn refund_is_reachable_from_resolved_adjacent_states() {
        assert!(can_transition(Pending, InitiateRefund));
        assert!(can_transition(Resolved, InitiateRefund));
        assert!(can_transition(Closed, InitiateRefund));
        assert!(!can_transition(Open, InitiateRefund));
    }

    #[test]
    fn unknown_status_fails_to_parse() {
        match TicketStatus::parse("reticulating") {
            Err(EngineError::InvalidStatus(s)) => assert_eq!(s, "reticulating"),
            other => panic!("expected InvalidStatus, got {other:?}"),
        }
    }

    fn ticket() -> SupportTicket {
        let now = Utc::now();
        SupportTicket {
            id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            ticket_number: "TKT-000001".into(),
            subject: "Printer on fire".into(),
            description: None,
            status: "open".into(),
            priority: "medium".into(),
            category: None,
            source: "web".into(),
            requester_id: Some(Uuid::new_v4()),
            assignee_id: None,
            team_id: None,
            due_date: None,
            first_response_at: None,
            resolved_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reopen_produces_a_status_changed_update_event() {
        let ticket = ticket();
        let changes = vec![FieldChange::Status {
            from: Resolved,
            to: Open,
        }];
        let events = derive_events(&ticket, &changes, ticket.requester_id);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TicketEvent::TicketUpdated { changes, .. } => {
                assert_eq!(changes["status_changed"]["from"], "resolved");
                assert_eq!(changes["status_changed"]["to"], "open");
            }
            other => panic!("expected TicketUpdated, got {other:?}"),
        }
    }

    #[test]
    fn assignment_becomes_its_own_event() {
        let ticket = ticket();
        let assignee = Uuid::new_v4();
        let changes = vec![FieldChange::Assignee {
            from: None,
            to: Some(assignee),
        }];
        let events = derive_events(&ticket, &changes, None);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TicketEvent::TicketAssigned { assignee_id, .. } => assert_eq!(*assignee_id, assignee),
            other => panic!("expected TicketAssigned, got {other:?}"),
        }
    }

    #[test]
    fn escalation_to_urgent_is_critical() {
        let ticket = ticket();
        let changes = vec![FieldChange::Priority {
            from: TicketPriority::High,
            to: TicketPriority::Urgent,
        }];
        let events = derive_events(&ticket, &changes, None);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_critical());
    }

    #[test]
    fn mixed_patch_yields_specific_and_update_events() {
        let ticket = ticket();
        let changes = vec![
            FieldChange::Status {
                from: Pending,
                to: Resolved,
            },
            FieldChange::Category {
                from: None,
                to: Some("billing".into()),
            },
        ];
        let events = derive_events(&ticket, &changes, None);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TicketEvent::TicketResolved { .. }));
        assert!(matches!(events[1], TicketEvent::TicketUpdated { .. }));
    }
}
