use serde_json::json;
use uuid::Uuid;

/// The closed set of domain events the engine fans out.
///
/// Each variant carries a fixed payload shape so recipient resolution stays
/// an exhaustive match instead of a bag of dynamic fields.
#[derive(Debug, Clone)]
pub enum TicketEvent {
    TicketCreated {
        ticket_id: Uuid,
        actor_id: Option<Uuid>,
        subject: String,
    },
    TicketAssigned {
        ticket_id: Uuid,
        actor_id: Option<Uuid>,
        assignee_id: Uuid,
        subject: String,
    },
    TicketUpdated {
        ticket_id: Uuid,
        actor_id: Option<Uuid>,
        subject: String,
        changes: serde_json::Value,
    },
    TicketReply {
        ticket_id: Uuid,
        author_id: Option<Uuid>,
        subject: String,
        excerpt: String,
    },
    TicketResolved {
        ticket_id: Uuid,
        actor_id: Option<Uuid>,
        subject: String,
    },
    /// Priority raised to urgent. The one kind that bypasses quiet hours.
    TicketEscalated {
        ticket_id: Uuid,
        actor_id: Option<Uuid>,
        subject: String,
    },
}

impl TicketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TicketCreated { .. } => "ticket-created",
            Self::TicketAssigned { .. } => "ticket-assigned",
            Self::TicketUpdated { .. } => "ticket-updated",
            Self::TicketReply { .. } => "ticket-reply",
            Self::TicketResolved { .. } => "ticket-resolved",
            Self::TicketEscalated { .. } => "ticket-escalated",
        }
    }

    /// Wire name for the group broadcast mirroring this event.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::TicketCreated { .. } => "ticket:created",
            _ => "ticket:updated",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::TicketEscalated { .. })
    }

    pub fn ticket_id(&self) -> Uuid {
        match self {
            Self::TicketCreated { ticket_id, .. }
            | Self::TicketAssigned { ticket_id, .. }
            | Self::TicketUpdated { ticket_id, .. }
            | Self::TicketReply { ticket_id, .. }
            | Self::TicketResolved { ticket_id, .. }
            | Self::TicketEscalated { ticket_id, .. } => *ticket_id,
        }
    }

    /// The user whose action produced the event. Excluded from fan-out,
    /// except for creation: the requester who files a ticket still gets
    /// their confirmation.
    pub fn actor_id(&self) -> Option<Uuid> {
        match self {
            Self::TicketCreated { actor_id, .. }
            | Self::TicketAssigned { actor_id, .. }
            | Self::TicketUpdated { actor_id, .. }
            | Self::TicketResolved { actor_id, .. }
            | Self::TicketEscalated { actor_id, .. } => *actor_id,
            Self::TicketReply { author_id, .. } => *author_id,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::TicketCreated {
                ticket_id, subject, ..
            } => json!({ "ticket_id": ticket_id, "subject": subject }),
            Self::TicketAssigned {
                ticket_id,
                assignee_id,
                subject,
                ..
            } => json!({
                "ticket_id": ticket_id,
                "assignee_id": assignee_id,
                "subject": subject,
            }),
            Self::TicketUpdated {
                ticket_id,
                subject,
                changes,
                ..
            } => json!({
                "ticket_id": ticket_id,
                "subject": subject,
                "changes": changes,
            }),
            Self::TicketReply {
                ticket_id,
                subject,
                excerpt,
                ..
            } => json!({
                "ticket_id": ticket_id,
                "subject": subject,
                "excerpt": excerpt,
            }),
            Self::TicketResolved {
                ticket_id, subject, ..
            }
            | Self::TicketEscalated {
                ticket_id, subject, ..
            } => json!({ "ticket_id": ticket_id, "subject": subject }),
        }
    }
}

/// Static recipient set for an event, before preference filtering.
///
/// Pure so the resolution table is testable without a database; the caller
/// supplies the ticket's parties and the admin set, and the actor is removed
/// last so an admin never hears about their own action.
pub fn resolve_recipients(
    requester: Option<Uuid>,
    assignee: Option<Uuid>,
    admins: &[Uuid],
    event: &TicketEvent,
) -> Vec<Uuid> {
    let mut recipients: Vec<Uuid> = Vec::new();
    let mut push = |id: Option<Uuid>| {
        if let Some(id) = id {
            if !recipients.contains(&id) {
                recipients.push(id);
            }
        }
    };

    match event {
        TicketEvent::TicketCreated { .. } => {
            push(requester);
            push(assignee);
            for admin in admins {
                push(Some(*admin));
            }
        }
        TicketEvent::TicketAssigned { assignee_id, .. } => {
            push(Some(*assignee_id));
            push(requester);
        }
        TicketEvent::TicketUpdated { .. } => {
            push(requester);
            push(assignee);
            for admin in admins {
                push(Some(*admin));
            }
        }
        TicketEvent::TicketReply { author_id, .. } => {
            // The other party of the thread, plus the admins.
            if *author_id == requester {
                push(assignee);
            } else {
                push(requester);
            }
            for admin in admins {
                push(Some(*admin));
            }
        }
        TicketEvent::TicketResolved { .. } => {
            push(requester);
            push(assignee);
        }
        TicketEvent::TicketEscalated { .. } => {
            push(assignee);
            for admin in admins {
                push(Some(*admin));
            }
        }
    }

    // Creation keeps its actor: the requester filing the ticket is also the
    // one who must be told it exists.
    if !matches!(event, TicketEvent::TicketCreated { .. }) {
        if let Some(actor) = event.actor_id() {
            recipients.retain(|id| *id != actor);
        }
    }
    recipients
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn created_reaches_customer_admins_and_assignee() {
        let v = ids(4);
        let (requester, assignee, admin_a, admin_b) = (v[0], v[1], v[2], v[3]);
        let event = TicketEvent::TicketCreated {
            ticket_id: Uuid::new_v4(),
            actor_id: None,
            subject: "s".into(),
        };
        let recipients =
            resolve_recipients(Some(requester), Some(assignee), &[admin_a, admin_b], &event);
        assert_eq!(recipients, vec![requester, assignee, admin_a, admin_b]);
    }

    #[test]
    fn created_keeps_the_requester_when_they_filed_it() {
        let v = ids(2);
        let (requester, admin) = (v[0], v[1]);
        let event = TicketEvent::TicketCreated {
            ticket_id: Uuid::new_v4(),
            actor_id: Some(requester),
            subject: "s".into(),
        };
        let recipients = resolve_recipients(Some(requester), None, &[admin], &event);
        assert_eq!(recipients, vec![requester, admin]);
    }

    #[test]
    fn reply_goes_to_other_party_excluding_author() {
        let v = ids(3);
        let (requester, assignee, admin) = (v[0], v[1], v[2]);
        let event = TicketEvent::TicketReply {
            ticket_id: Uuid::new_v4(),
            author_id: Some(requester),
            subject: "s".into(),
            excerpt: "e".into(),
        };
        let recipients = resolve_recipients(Some(requester), Some(assignee), &[admin], &event);
        assert_eq!(recipients, vec![assignee, admin]);
        assert!(!recipients.contains(&requester));
    }

    #[test]
    fn admin_author_never_notifies_itself() {
        let v = ids(2);
        let (requester, admin) = (v[0], v[1]);
        let event = TicketEvent::TicketReply {
            ticket_id: Uuid::new_v4(),
            author_id: Some(admin),
            subject: "s".into(),
            excerpt: "e".into(),
        };
        let recipients = resolve_recipients(Some(requester), None, &[admin], &event);
        assert_eq!(recipients, vec![requester]);
    }

    #[test]
    fn only_escalation_is_critical() {
        let escalated = TicketEvent::TicketEscalated {
            ticket_id: Uuid::new_v4(),
            actor_id: None,
            subject: "s".into(),
        };
        let created = TicketEvent::TicketCreated {
            ticket_id: Uuid::new_v4(),
            actor_id: None,
            subject: "s".into(),
        };
        assert!(escalated.is_critical());
        assert!(!created.is_critical());
    }
}
