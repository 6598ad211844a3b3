use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use diesel::prelude::*;
use log::warn;
use std::sync::Arc;
use uuid::Uuid;

use crate::notifications::delivery::Channel;
use crate::notifications::events::{resolve_recipients, TicketEvent};
use crate::notifications::{DeliveryLogEntry, Notification, NotificationPreference};
use crate::realtime::relay::{self, RelayEnvelope, RelayScope};
use crate::realtime::{admins_group, agents_group, WireEvent};
use crate::shared::error::EngineError;
use crate::shared::schema::{
    notification_delivery_log, notification_preferences, notifications, support_tickets, users,
};
use crate::shared::state::AppState;

/// Email batching cadence from the user's preference row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Realtime,
    Hourly,
    Daily,
    Weekly,
}

impl Digest {
    pub fn parse(value: &str) -> Self {
        match value {
            "hourly" => Self::Hourly,
            "daily" => Self::Daily,
            "weekly" => Self::Weekly,
            _ => Self::Realtime,
        }
    }
}

/// Next send slot for a digest cadence: top of the next hour, next midnight,
/// or next Monday midnight. Realtime is due immediately.
pub fn next_digest_at(digest: Digest, now: DateTime<Utc>) -> DateTime<Utc> {
    match digest {
        Digest::Realtime => now,
        Digest::Hourly => {
            let truncated = now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            truncated + Duration::hours(1)
        }
        Digest::Daily => {
            let midnight = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_else(|| now.naive_utc());
            DateTime::from_naive_utc_and_offset(midnight, Utc) + Duration::days(1)
        }
        Digest::Weekly => {
            let midnight = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_else(|| now.naive_utc());
            let days_ahead = 7 - i64::from(now.date_naive().weekday().num_days_from_monday());
            DateTime::from_naive_utc_and_offset(midnight, Utc) + Duration::days(days_ahead)
        }
    }
}

/// A per-user quiet window over the clock face. `start > end` wraps past
/// midnight (22:00-07:00).
#[derive(Debug, Clone, Copy)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    /// First instant at or after `now` outside the window.
    pub fn defer_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let time = now.time();
        if !self.contains(time) {
            return now;
        }
        let date = now.date_naive();
        let end_today = DateTime::from_naive_utc_and_offset(date.and_time(self.end), Utc);
        if end_today > now {
            end_today
        } else {
            end_today + Duration::days(1)
        }
    }
}

impl NotificationPreference {
    pub fn quiet_window(&self) -> Option<QuietWindow> {
        match (self.quiet_hours_start, self.quiet_hours_end) {
            (Some(start), Some(end)) if start != end => Some(QuietWindow { start, end }),
            _ => None,
        }
    }

    fn defaults(user_id: Uuid, kind: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind: kind.to_string(),
            email_enabled: true,
            push_enabled: false,
            digest: "realtime".to_string(),
            quiet_hours_start: None,
            quiet_hours_end: None,
            updated_at: Utc::now(),
        }
    }
}

fn load_preference(
    conn: &mut PgConnection,
    user_id: Uuid,
    kind: &str,
) -> Result<NotificationPreference, EngineError> {
    let found: Option<NotificationPreference> = notification_preferences::table
        .filter(notification_preferences::user_id.eq(user_id))
        .filter(notification_preferences::kind.eq(kind))
        .first(conn)
        .optional()?;
    Ok(found.unwrap_or_else(|| NotificationPreference::defaults(user_id, kind)))
}

/// When a pending delivery-log row becomes due. Quiet hours push everything
/// non-critical past the window's end; the email digest cadence batches on
/// top of that, so a suppressed notification lands in the next digest cycle
/// rather than being dropped.
pub fn schedule_channel(
    channel: Channel,
    pref: &NotificationPreference,
    suppressed: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let quiet_floor = if suppressed {
        pref.quiet_window()
            .map(|w| w.defer_until(now))
            .unwrap_or(now)
    } else {
        now
    };
    match channel {
        Channel::Email => quiet_floor.max(next_digest_at(Digest::parse(&pref.digest), now)),
        Channel::Push => quiet_floor,
    }
}

/// Fire-and-forget entry point for callers outside the ticket module: turns
/// an event-type name plus context into a typed event and fans it out.
/// Unknown event types are logged and dropped.
pub async fn notify(
    state: &Arc<AppState>,
    event_type: &str,
    ticket_id: Uuid,
    actor_id: Option<Uuid>,
    extra: serde_json::Value,
) {
    let subject = {
        let Ok(mut conn) = state.conn.get() else {
            warn!("notify({event_type}): no database connection");
            return;
        };
        let loaded: Result<String, _> = support_tickets::table
            .filter(support_tickets::id.eq(ticket_id))
            .select(support_tickets::subject)
            .first(&mut conn);
        match loaded {
            Ok(subject) => subject,
            Err(_) => {
                warn!("notify({event_type}): ticket {ticket_id} not found");
                return;
            }
        }
    };

    let event = match event_type {
        "ticket-created" => TicketEvent::TicketCreated {
            ticket_id,
            actor_id,
            subject,
        },
        "ticket-reply" => TicketEvent::TicketReply {
            ticket_id,
            author_id: actor_id,
            subject,
            excerpt: extra
                .get("excerpt")
                .and_then(|e| e.as_str())
                .unwrap_or("")
                .to_string(),
        },
        "ticket-resolved" => TicketEvent::TicketResolved {
            ticket_id,
            actor_id,
            subject,
        },
        "ticket-escalated" => TicketEvent::TicketEscalated {
            ticket_id,
            actor_id,
            subject,
        },
        "ticket-updated" => TicketEvent::TicketUpdated {
            ticket_id,
            actor_id,
            subject,
            changes: extra,
        },
        other => {
            warn!("notify: unknown event type {other}");
            return;
        }
    };
    fan_out(state, event).await;
}

/// Turns one domain event into per-recipient, per-channel delivery intents.
///
/// Never fails the caller: the triggering ticket mutation has already
/// committed, so every failure here is logged and isolated.
pub async fn fan_out(state: &Arc<AppState>, event: TicketEvent) {
    if let Err(e) = fan_out_inner(state, &event).await {
        warn!("Notification fan-out failed for {}: {e}", event.kind());
    }
}

async fn fan_out_inner(state: &Arc<AppState>, event: &TicketEvent) -> Result<(), EngineError> {
    let (recipients, ticket_id, org_id) = {
        let mut conn = state.conn.get()?;
        let (org_id, requester, assignee): (Uuid, Option<Uuid>, Option<Uuid>) =
            support_tickets::table
                .filter(support_tickets::id.eq(event.ticket_id()))
                .select((
                    support_tickets::org_id,
                    support_tickets::requester_id,
                    support_tickets::assignee_id,
                ))
                .first(&mut conn)
                .map_err(|_| EngineError::TicketNotFound(event.ticket_id()))?;
        // Admins of the ticket's own org only.
        let admins: Vec<Uuid> = users::table
            .filter(users::org_id.eq(org_id))
            .filter(users::role.eq("admin"))
            .filter(users::is_active.eq(true))
            .select(users::id)
            .load(&mut conn)?;
        (
            resolve_recipients(requester, assignee, &admins, event),
            event.ticket_id(),
            org_id,
        )
    };

    for recipient in recipients {
        if let Err(e) = deliver_to_recipient(state, event, recipient, ticket_id).await {
            warn!(
                "Skipping recipient {recipient} for {}: {e}",
                event.kind()
            );
        }
    }

    // Lifecycle mirror for every connected agent and admin dashboard of
    // the ticket's org.
    for group in [agents_group(org_id), admins_group(org_id)] {
        relay::publish(
            state,
            RelayEnvelope {
                scope: RelayScope::Group(group),
                event: WireEvent::new(event.wire_name(), event.payload()),
            },
        )
        .await;
    }
    Ok(())
}

async fn deliver_to_recipient(
    state: &Arc<AppState>,
    event: &TicketEvent,
    recipient: Uuid,
    ticket_id: Uuid,
) -> Result<(), EngineError> {
    let now = Utc::now();
    let (notification, suppressed) = {
        let mut conn = state.conn.get()?;
        let pref = load_preference(&mut conn, recipient, event.kind())?;
        let in_quiet = pref
            .quiet_window()
            .map(|w| w.contains(now.time()))
            .unwrap_or(false);
        let suppressed = in_quiet && !event.is_critical();

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: recipient,
            kind: event.kind().to_string(),
            ticket_id: Some(ticket_id),
            payload: event.payload(),
            is_read: false,
            read_at: None,
            created_at: now,
        };
        diesel::insert_into(notifications::table)
            .values(&notification)
            .execute(&mut conn)?;

        let mut channels = Vec::new();
        if pref.email_enabled {
            channels.push(Channel::Email);
        }
        if pref.push_enabled {
            channels.push(Channel::Push);
        }
        for channel in channels {
            let entry = DeliveryLogEntry {
                id: Uuid::new_v4(),
                notification_id: notification.id,
                channel: channel.as_str().to_string(),
                status: "pending".to_string(),
                attempts: 0,
                last_error: None,
                next_attempt_at: schedule_channel(channel, &pref, suppressed, now),
                sent_at: None,
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(notification_delivery_log::table)
                .values(&entry)
                .execute(&mut conn)?;
        }
        (notification, suppressed)
    };

    if !suppressed {
        relay::publish(
            state,
            RelayEnvelope {
                scope: RelayScope::User(recipient),
                event: WireEvent::new(
                    "notification:new",
                    serde_json::to_value(&notification).unwrap_or_default(),
                ),
            },
        )
        .await;
        crate::notifications::push_unread_count(state, recipient).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn quiet_window_simple_range() {
        let w = QuietWindow {
            start: at(9, 0),
            end: at(17, 0),
        };
        assert!(w.contains(at(12, 0)));
        assert!(!w.contains(at(8, 59)));
        assert!(!w.contains(at(17, 0)));
    }

    #[test]
    fn quiet_window_wraps_past_midnight() {
        let w = QuietWindow {
            start: at(22, 0),
            end: at(7, 0),
        };
        assert!(w.contains(at(23, 30)));
        assert!(w.contains(at(3, 0)));
        assert!(!w.contains(at(12, 0)));
        assert!(!w.contains(at(7, 0)));
    }

    #[test]
    fn defer_until_reaches_window_end() {
        let w = QuietWindow {
            start: at(22, 0),
            end: at(7, 0),
        };
        // 23:00 -> 07:00 tomorrow
        let now = utc(2024, 3, 10, 23, 0);
        assert_eq!(w.defer_until(now), utc(2024, 3, 11, 7, 0));
        // 03:00 -> 07:00 same day
        let now = utc(2024, 3, 11, 3, 0);
        assert_eq!(w.defer_until(now), utc(2024, 3, 11, 7, 0));
        // Outside the window nothing is deferred.
        let now = utc(2024, 3, 11, 12, 0);
        assert_eq!(w.defer_until(now), now);
    }

    #[test]
    fn digest_slots() {
        let now = utc(2024, 3, 13, 14, 25); // a Wednesday
        assert_eq!(next_digest_at(Digest::Realtime, now), now);
        assert_eq!(next_digest_at(Digest::Hourly, now), utc(2024, 3, 13, 15, 0));
        assert_eq!(next_digest_at(Digest::Daily, now), utc(2024, 3, 14, 0, 0));
        let weekly = next_digest_at(Digest::Weekly, now);
        assert_eq!(weekly, utc(2024, 3, 18, 0, 0));
        assert_eq!(
            weekly.date_naive(),
            NaiveDate::from_ymd_opt(2024, 3, 18).unwrap()
        );
    }

    #[test]
    fn suppressed_email_waits_for_quiet_end_and_digest() {
        let mut pref = NotificationPreference::defaults(Uuid::new_v4(), "ticket-updated");
        pref.quiet_hours_start = Some(at(22, 0));
        pref.quiet_hours_end = Some(at(7, 0));
        let now = utc(2024, 3, 10, 23, 0);

        let email = schedule_channel(Channel::Email, &pref, true, now);
        assert_eq!(email, utc(2024, 3, 11, 7, 0));

        let push = schedule_channel(Channel::Push, &pref, true, now);
        assert_eq!(push, utc(2024, 3, 11, 7, 0));
    }

    #[test]
    fn critical_event_is_not_deferred() {
        let mut pref = NotificationPreference::defaults(Uuid::new_v4(), "ticket-escalated");
        pref.quiet_hours_start = Some(at(22, 0));
        pref.quiet_hours_end = Some(at(7, 0));
        let now = utc(2024, 3, 10, 23, 0);
        // Critical events reach scheduling with suppressed = false.
        assert_eq!(schedule_channel(Channel::Push, &pref, false, now), now);
    }

    #[test]
    fn hourly_digest_batches_email_but_not_push() {
        let mut pref = NotificationPreference::defaults(Uuid::new_v4(), "ticket-updated");
        pref.digest = "hourly".to_string();
        pref.push_enabled = true;
        let now = utc(2024, 3, 13, 14, 25);
        assert_eq!(
            schedule_channel(Channel::Email, &pref, false, now),
            utc(2024, 3, 13, 15, 0)
        );
        assert_eq!(schedule_channel(Channel::Push, &pref, false, now), now);
    }
}
