use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notifications::delivery::{ChannelSender, DeliveryError};
use crate::notifications::Notification;
use crate::shared::models::User;
use crate::shared::schema::push_subscriptions;
use crate::shared::utils::DbPool;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = push_subscriptions)]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint: String,
    pub p256dh_key: String,
    pub auth_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of one per-subscription send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Delivered,
    /// 404/410 from the push service: the subscription is gone for good.
    Expired,
    Transient(String),
}

/// A push job fans out to every active subscription the recipient owns.
/// Individual failures are independent; the job fails only when no
/// subscription accepted the payload, and a job with only expired
/// subscriptions fails permanently.
pub fn aggregate_outcomes(outcomes: &[SubscriptionOutcome]) -> Result<(), DeliveryError> {
    if outcomes.is_empty() {
        return Err(DeliveryError::Permanent(
            "no active push subscriptions".to_string(),
        ));
    }
    if outcomes.contains(&SubscriptionOutcome::Delivered) {
        return Ok(());
    }
    if let Some(SubscriptionOutcome::Transient(e)) = outcomes
        .iter()
        .find(|o| matches!(o, SubscriptionOutcome::Transient(_)))
    {
        return Err(DeliveryError::Transient(e.clone()));
    }
    Err(DeliveryError::Permanent(
        "all push subscriptions expired".to_string(),
    ))
}

pub struct PushSender {
    client: reqwest::Client,
    pool: DbPool,
}

impl PushSender {
    pub fn new(pool: DbPool) -> Self {
        Self {
            client: reqwest::Client::new(),
            pool,
        }
    }

    async fn send_one(
        &self,
        subscription: &PushSubscription,
        payload: &serde_json::Value,
    ) -> SubscriptionOutcome {
        let response = self
            .client
            .post(&subscription.endpoint)
            .json(payload)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => SubscriptionOutcome::Delivered,
            Ok(resp)
                if resp.status() == reqwest::StatusCode::NOT_FOUND
                    || resp.status() == reqwest::StatusCode::GONE =>
            {
                SubscriptionOutcome::Expired
            }
            Ok(resp) => SubscriptionOutcome::Transient(format!(
                "push service returned {}",
                resp.status()
            )),
            Err(e) => SubscriptionOutcome::Transient(format!("push request failed: {e}")),
        }
    }

    fn deactivate(&self, subscription_id: Uuid) {
        let Ok(mut conn) = self.pool.get() else {
            return;
        };
        let deactivated = diesel::update(
            push_subscriptions::table.filter(push_subscriptions::id.eq(subscription_id)),
        )
        .set(push_subscriptions::is_active.eq(false))
        .execute(&mut conn);
        if deactivated.is_ok() {
            info!("Deactivated expired push subscription {subscription_id}");
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    async fn send(
        &self,
        notification: &Notification,
        recipient: &User,
    ) -> Result<(), DeliveryError> {
        let subscriptions: Vec<PushSubscription> = {
            let mut conn = self
                .pool
                .get()
                .map_err(|e| DeliveryError::Transient(format!("pool error: {e}")))?;
            push_subscriptions::table
                .filter(push_subscriptions::user_id.eq(recipient.id))
                .filter(push_subscriptions::is_active.eq(true))
                .load(&mut conn)
                .map_err(|e| DeliveryError::Transient(format!("query error: {e}")))?
        };

        let payload = serde_json::json!({
            "kind": notification.kind,
            "ticket_id": notification.ticket_id,
            "payload": notification.payload,
        });

        let mut outcomes = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let outcome = self.send_one(subscription, &payload).await;
            if outcome == SubscriptionOutcome::Expired {
                self.deactivate(subscription.id);
            } else if outcome == SubscriptionOutcome::Delivered {
                debug!(
                    "Push delivered to {} for notification {}",
                    subscription.endpoint, notification.id
                );
            }
            outcomes.push(outcome);
        }

        aggregate_outcomes(&outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_delivery_is_enough() {
        let outcomes = vec![
            SubscriptionOutcome::Expired,
            SubscriptionOutcome::Delivered,
            SubscriptionOutcome::Transient("503".into()),
        ];
        assert!(aggregate_outcomes(&outcomes).is_ok());
    }

    #[test]
    fn all_expired_is_permanent() {
        let outcomes = vec![SubscriptionOutcome::Expired, SubscriptionOutcome::Expired];
        match aggregate_outcomes(&outcomes) {
            Err(DeliveryError::Permanent(_)) => {}
            other => panic!("expected permanent failure, got {other:?}"),
        }
    }

    #[test]
    fn any_transient_failure_keeps_the_job_retryable() {
        let outcomes = vec![
            SubscriptionOutcome::Expired,
            SubscriptionOutcome::Transient("timeout".into()),
        ];
        match aggregate_outcomes(&outcomes) {
            Err(DeliveryError::Transient(e)) => assert_eq!(e, "timeout"),
            other => panic!("expected transient failure, got {other:?}"),
        }
    }

    #[test]
    fn no_subscriptions_is_permanent() {
        match aggregate_outcomes(&[]) {
            Err(DeliveryError::Permanent(e)) => assert!(e.contains("no active")),
            other => panic!("expected permanent failure, got {other:?}"),
        }
    }
}
