use async_trait::async_trait;
use lettre::{transport::smtp::authentication::Credentials, Message, SmtpTransport, Transport};
use log::debug;

use crate::config::SmtpConfig;
use crate::notifications::delivery::{ChannelSender, DeliveryError};
use crate::notifications::Notification;
use crate::shared::models::User;

pub struct EmailSender {
    config: SmtpConfig,
}

impl EmailSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

/// Subject and plain-text body for one notification kind.
pub fn render(notification: &Notification) -> (String, String) {
    let subject_of = |v: &serde_json::Value| {
        v.get("subject")
            .and_then(|s| s.as_str())
            .unwrap_or("your ticket")
            .to_string()
    };
    let ticket = subject_of(&notification.payload);
    match notification.kind.as_str() {
        "ticket-created" => (
            format!("New ticket: {ticket}"),
            format!("A new support ticket \"{ticket}\" has been created."),
        ),
        "ticket-assigned" => (
            format!("Ticket assigned: {ticket}"),
            format!("The ticket \"{ticket}\" has been assigned."),
        ),
        "ticket-reply" => {
            let excerpt = notification
                .payload
                .get("excerpt")
                .and_then(|s| s.as_str())
                .unwrap_or("");
            (
                format!("New reply on: {ticket}"),
                format!("There is a new reply on \"{ticket}\":\n\n{excerpt}"),
            )
        }
        "ticket-resolved" => (
            format!("Ticket resolved: {ticket}"),
            format!("The ticket \"{ticket}\" has been marked resolved."),
        ),
        "ticket-escalated" => (
            format!("[URGENT] Ticket escalated: {ticket}"),
            format!("The ticket \"{ticket}\" was escalated to urgent priority."),
        ),
        _ => (
            format!("Ticket updated: {ticket}"),
            format!("The ticket \"{ticket}\" has been updated."),
        ),
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn send(
        &self,
        notification: &Notification,
        recipient: &User,
    ) -> Result<(), DeliveryError> {
        let (subject, body) = render(notification);

        let email = Message::builder()
            .from(
                self.config
                    .from
                    .parse()
                    .map_err(|e| DeliveryError::Permanent(format!("Invalid from address: {e}")))?,
            )
            .to(format!("{} <{}>", recipient.display_name, recipient.email)
                .parse()
                .map_err(|e| DeliveryError::Permanent(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body)
            .map_err(|e| DeliveryError::Permanent(format!("Message build failed: {e}")))?;

        let mailer = SmtpTransport::relay(&self.config.server)
            .map_err(|e| DeliveryError::Transient(format!("SMTP relay unavailable: {e}")))?
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ))
            .build();

        match mailer.send(&email) {
            Ok(_) => {
                debug!(
                    "Email sent to {} for notification {}",
                    recipient.email, notification.id
                );
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                Err(DeliveryError::Permanent(format!("SMTP rejected: {e}")))
            }
            Err(e) => Err(DeliveryError::Transient(format!("SMTP send failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn notification(kind: &str, payload: serde_json::Value) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: kind.to_string(),
            ticket_id: Some(Uuid::new_v4()),
            payload,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn renders_per_kind_templates() {
        let (subject, body) = render(&notification(
            "ticket-reply",
            serde_json::json!({"subject": "Printer on fire", "excerpt": "Still burning"}),
        ));
        assert_eq!(subject, "New reply on: Printer on fire");
        assert!(body.contains("Still burning"));

        let (subject, _) = render(&notification(
            "ticket-escalated",
            serde_json::json!({"subject": "Printer on fire"}),
        ));
        assert!(subject.starts_with("[URGENT]"));
    }

    #[test]
    fn unknown_kind_falls_back_to_updated() {
        let (subject, _) = render(&notification("ticket-updated", serde_json::json!({})));
        assert_eq!(subject, "Ticket updated: your ticket");
    }
}
