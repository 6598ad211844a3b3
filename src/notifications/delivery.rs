use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use futures_util::StreamExt;
use log::{info, warn};
use std::sync::Arc;

use crate::notifications::email::EmailSender;
use crate::notifications::push::PushSender;
use crate::notifications::{DeliveryLogEntry, Notification};
use crate::shared::error::EngineError;
use crate::shared::models::User;
use crate::shared::schema::{notification_delivery_log, notifications, users};
use crate::shared::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Push => "push",
        }
    }
}

/// Send failures, classified by the channel sender.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Network-ish trouble: retried with backoff up to the attempt ceiling.
    #[error("transient: {0}")]
    Transient(String),
    /// Bad address, expired subscription: no retry will ever succeed.
    #[error("permanent: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, notification: &Notification, recipient: &User)
        -> Result<(), DeliveryError>;
}

/// Where a delivery-log row goes after one attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Retry {
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        attempts: i32,
        error: String,
    },
}

pub fn backoff_delay(base_secs: i64, attempts: i32) -> Duration {
    Duration::seconds(base_secs << (attempts - 1).clamp(0, 16))
}

/// The PENDING -> SENT | FAILED step of the retry state machine. Pure, so
/// the schedule is testable without a database or a clock.
pub fn classify_outcome(
    prior_attempts: i32,
    max_attempts: i32,
    backoff_base_secs: i64,
    now: DateTime<Utc>,
    result: Result<(), DeliveryError>,
) -> Outcome {
    let attempts = prior_attempts + 1;
    match result {
        Ok(()) => Outcome::Sent,
        Err(DeliveryError::Permanent(e)) => Outcome::Failed { attempts, error: e },
        Err(DeliveryError::Transient(e)) => {
            if attempts >= max_attempts {
                Outcome::Failed { attempts, error: e }
            } else {
                Outcome::Retry {
                    attempts,
                    next_attempt_at: now + backoff_delay(backoff_base_secs, attempts),
                    error: e,
                }
            }
        }
    }
}

/// Spawns one polling worker per channel. Each worker claims due PENDING
/// rows oldest-first and processes them with bounded concurrency; a process
/// restart loses nothing because the schedule lives in the rows themselves.
pub fn run_delivery_workers(state: Arc<AppState>) {
    let email = Arc::new(EmailSender::new(state.config.smtp.clone()));
    let push = Arc::new(PushSender::new(state.conn.clone()));
    tokio::spawn(channel_worker(state.clone(), Channel::Email, email));
    tokio::spawn(channel_worker(state, Channel::Push, push));
}

async fn channel_worker(state: Arc<AppState>, channel: Channel, sender: Arc<dyn ChannelSender>) {
    let cfg = state.config.delivery.clone();
    info!("Delivery worker started for channel {}", channel.as_str());
    loop {
        match claim_due(&state, channel, cfg.batch_size) {
            Ok(batch) if !batch.is_empty() => {
                futures_util::stream::iter(batch)
                    .for_each_concurrent(cfg.max_in_flight, |entry| {
                        let state = state.clone();
                        let sender = sender.clone();
                        async move {
                            let id = entry.id;
                            if let Err(e) = process_entry(&state, sender.as_ref(), entry).await {
                                warn!("Delivery attempt errored for row {id}: {e}");
                            }
                        }
                    })
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(
                "Delivery poll failed for channel {}: {e}",
                channel.as_str()
            ),
        }
        tokio::time::sleep(std::time::Duration::from_secs(cfg.poll_interval_secs)).await;
    }
}

fn claim_due(
    state: &AppState,
    channel: Channel,
    batch_size: i64,
) -> Result<Vec<DeliveryLogEntry>, EngineError> {
    let mut conn = state.conn.get()?;
    let rows = notification_delivery_log::table
        .filter(notification_delivery_log::channel.eq(channel.as_str()))
        .filter(notification_delivery_log::status.eq("pending"))
        .filter(notification_delivery_log::next_attempt_at.le(Utc::now()))
        .order(notification_delivery_log::next_attempt_at.asc())
        .limit(batch_size)
        .load(&mut conn)?;
    Ok(rows)
}

async fn process_entry(
    state: &AppState,
    sender: &dyn ChannelSender,
    entry: DeliveryLogEntry,
) -> Result<(), EngineError> {
    let (notification, recipient) = {
        let mut conn = state.conn.get()?;
        let notification: Notification = notifications::table
            .filter(notifications::id.eq(entry.notification_id))
            .first(&mut conn)
            .map_err(|_| EngineError::NotificationNotFound(entry.notification_id))?;
        let recipient: User = users::table
            .filter(users::id.eq(notification.user_id))
            .first(&mut conn)?;
        (notification, recipient)
    };

    let result = sender.send(&notification, &recipient).await;
    let cfg = &state.config.delivery;
    let now = Utc::now();
    let outcome = classify_outcome(
        entry.attempts,
        cfg.max_attempts,
        cfg.backoff_base_secs,
        now,
        result,
    );

    let mut conn = state.conn.get()?;
    let row = notification_delivery_log::table.filter(notification_delivery_log::id.eq(entry.id));
    match outcome {
        Outcome::Sent => {
            diesel::update(row)
                .set((
                    notification_delivery_log::status.eq("sent"),
                    notification_delivery_log::attempts.eq(entry.attempts + 1),
                    notification_delivery_log::sent_at.eq(Some(now)),
                    notification_delivery_log::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
        }
        Outcome::Retry {
            attempts,
            next_attempt_at,
            error,
        } => {
            diesel::update(row)
                .set((
                    notification_delivery_log::attempts.eq(attempts),
                    notification_delivery_log::last_error.eq(Some(error)),
                    notification_delivery_log::next_attempt_at.eq(next_attempt_at),
                    notification_delivery_log::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
        }
        Outcome::Failed { attempts, error } => {
            warn!(
                "Delivery failed permanently for notification {} over {}: {error}",
                entry.notification_id, entry.channel
            );
            diesel::update(row)
                .set((
                    notification_delivery_log::status.eq("failed"),
                    notification_delivery_log::attempts.eq(attempts),
                    notification_delivery_log::last_error.eq(Some(error)),
                    notification_delivery_log::updated_at.eq(now),
                ))
                .execute(&mut conn)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: i64 = 30;
    const CEILING: i32 = 3;

    #[test]
    fn success_marks_sent() {
        let outcome = classify_outcome(0, CEILING, BASE, Utc::now(), Ok(()));
        assert_eq!(outcome, Outcome::Sent);
    }

    #[test]
    fn transient_failure_backs_off_exponentially() {
        let now = Utc::now();
        let first = classify_outcome(
            0,
            CEILING,
            BASE,
            now,
            Err(DeliveryError::Transient("timeout".into())),
        );
        match first {
            Outcome::Retry {
                attempts,
                next_attempt_at,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(next_attempt_at, now + Duration::seconds(30));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let second = classify_outcome(
            1,
            CEILING,
            BASE,
            now,
            Err(DeliveryError::Transient("timeout".into())),
        );
        match second {
            Outcome::Retry {
                attempts,
                next_attempt_at,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(next_attempt_at, now + Duration::seconds(60));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn transient_failure_at_ceiling_goes_failed() {
        let outcome = classify_outcome(
            2,
            CEILING,
            BASE,
            Utc::now(),
            Err(DeliveryError::Transient("timeout".into())),
        );
        assert_eq!(
            outcome,
            Outcome::Failed {
                attempts: 3,
                error: "timeout".into()
            }
        );
    }

    #[test]
    fn permanent_failure_never_retries() {
        // Expired push subscription on the first attempt: FAILED at
        // attempts=1, nothing rescheduled.
        let outcome = classify_outcome(
            0,
            CEILING,
            BASE,
            Utc::now(),
            Err(DeliveryError::Permanent("410 Gone: subscription expired".into())),
        );
        assert_eq!(
            outcome,
            Outcome::Failed {
                attempts: 1,
                error: "410 Gone: subscription expired".into()
            }
        );
    }
}
