use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::EngineError;
use crate::shared::schema::{assignment_rules, support_tickets, users};
use crate::shared::state::AppState;
use crate::tickets::state_machine::{apply_and_notify, TicketPatch};
use crate::tickets::SupportTicket;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = assignment_rules)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub org_id: Uuid,
    pub position: i32,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub assignee_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A rule matches when every set predicate matches; NULL is a wildcard.
pub fn rule_matches(rule: &AssignmentRule, ticket: &SupportTicket) -> bool {
    if let Some(category) = &rule.category {
        if ticket.category.as_deref() != Some(category.as_str()) {
            return false;
        }
    }
    if let Some(priority) = &rule.priority {
        if ticket.priority != *priority {
            return false;
        }
    }
    if let Some(source) = &rule.source {
        if ticket.source != *source {
            return false;
        }
    }
    true
}

/// Load-balancing fallback: the agent with the fewest open tickets wins,
/// ties broken by user id so repeated runs stay deterministic.
pub fn pick_least_loaded(loads: &[(Uuid, i64)]) -> Option<Uuid> {
    loads
        .iter()
        .min_by_key(|(id, count)| (*count, *id))
        .map(|(id, _)| *id)
}

/// Selects a target for a newly created or unassigned ticket and writes the
/// assignment through the state machine, so the activity row and the fan-out
/// happen exactly as they would for a manual assignment.
///
/// Idempotent: an already-assigned ticket is left alone unless `force`.
pub async fn auto_assign(
    state: &Arc<AppState>,
    ticket_id: Uuid,
    force: bool,
) -> Result<Option<Uuid>, EngineError> {
    let (ticket, target) = {
        let mut conn = state.conn.get()?;
        let ticket: SupportTicket = support_tickets::table
            .filter(support_tickets::id.eq(ticket_id))
            .first(&mut conn)
            .map_err(|_| EngineError::TicketNotFound(ticket_id))?;
        if ticket.assignee_id.is_some() && !force {
            return Ok(None);
        }

        let rules: Vec<AssignmentRule> = assignment_rules::table
            .filter(assignment_rules::org_id.eq(ticket.org_id))
            .filter(assignment_rules::is_active.eq(true))
            .order(assignment_rules::position.asc())
            .load(&mut conn)?;
        let matched = rules.iter().find(|rule| rule_matches(rule, &ticket));

        let target = match matched {
            Some(rule) => (rule.assignee_id, rule.team_id),
            None => (fallback_agent(&mut conn, ticket.org_id)?, None),
        };
        (ticket, target)
    };

    let (assignee, team) = target;
    if assignee.is_none() && team.is_none() {
        info!("No assignment target for ticket {}", ticket.ticket_number);
        return Ok(None);
    }

    let patch = TicketPatch {
        assignee_id: assignee.map(Some),
        team_id: team.map(Some),
        ..Default::default()
    };
    // System action: no acting user on the activity rows.
    apply_and_notify(state, ticket.id, patch, None).await?;
    Ok(assignee)
}

fn fallback_agent(conn: &mut PgConnection, org_id: Uuid) -> Result<Option<Uuid>, EngineError> {
    let agents: Vec<Uuid> = users::table
        .filter(users::org_id.eq(org_id))
        .filter(users::role.eq("agent"))
        .filter(users::is_active.eq(true))
        .select(users::id)
        .load(conn)?;

    let mut loads = Vec::with_capacity(agents.len());
    for agent in agents {
        let open: i64 = support_tickets::table
            .filter(support_tickets::assignee_id.eq(agent))
            .filter(support_tickets::status.ne("resolved"))
            .filter(support_tickets::status.ne("closed"))
            .count()
            .get_result(conn)?;
        loads.push((agent, open));
    }
    Ok(pick_least_loaded(&loads))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(category: Option<&str>, priority: &str, source: &str) -> SupportTicket {
        let now = Utc::now();
        SupportTicket {
            id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            ticket_number: "TKT-000001".into(),
            subject: "s".into(),
            description: None,
            status: "new".into(),
            priority: priority.into(),
            category: category.map(str::to_string),
            source: source.into(),
            requester_id: None,
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

    fn rule(category: Option<&str>, priority: Option<&str>, source: Option<&str>) -> AssignmentRule {
        AssignmentRule {
            id: Uuid::new_v4(),
            org_id: Uuid::nil(),
            position: 0,
            category: category.map(str::to_string),
            priority: priority.map(str::to_string),
            source: source.map(str::to_string),
            assignee_id: Some(Uuid::new_v4()),
            team_id: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn null_predicates_are_wildcards() {
        let r = rule(None, None, None);
        assert!(rule_matches(&r, &ticket(None, "low", "web")));
        assert!(rule_matches(&r, &ticket(Some("billing"), "urgent", "email")));
    }

    #[test]
    fn every_set_predicate_must_match() {
        let r = rule(Some("billing"), Some("high"), None);
        assert!(rule_matches(&r, &ticket(Some("billing"), "high", "web")));
        assert!(!rule_matches(&r, &ticket(Some("billing"), "low", "web")));
        assert!(!rule_matches(&r, &ticket(Some("shipping"), "high", "web")));
        assert!(!rule_matches(&r, &ticket(None, "high", "web")));
    }

    #[test]
    fn least_loaded_agent_wins() {
        // Two agents with 3 and 1 open tickets: the second one gets the work.
        let busy = Uuid::new_v4();
        let idle = Uuid::new_v4();
        let picked = pick_least_loaded(&[(busy, 3), (idle, 1)]);
        assert_eq!(picked, Some(idle));
    }

    #[test]
    fn ties_break_on_user_id() {
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let picked = pick_least_loaded(&[(ids[1], 2), (ids[0], 2)]);
        assert_eq!(picked, Some(ids[0]));
    }

    #[test]
    fn no_agents_means_no_pick() {
        assert_eq!(pick_least_loaded(&[]), None);
    }
}
