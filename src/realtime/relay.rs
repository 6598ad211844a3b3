use futures_util::StreamExt;
use log::{info, warn};
use redis::Client as RedisClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::realtime::{ConnectionRegistry, WireEvent};
use crate::shared::state::AppState;

pub const RELAY_TOPIC: &str = "deskserver:events";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RelayScope {
    User(Uuid),
    Group(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub scope: RelayScope,
    pub event: WireEvent,
}

/// Publishes an envelope to every process of the deployment, this one
/// included. When redis is not configured or the publish fails, delivery
/// degrades to process-local dispatch so same-process recipients never
/// lose the event.
pub async fn publish(state: &AppState, envelope: RelayEnvelope) {
    if let Some(client) = &state.cache {
        match publish_to_redis(client, &envelope).await {
            Ok(()) => return,
            Err(e) => warn!("Relay publish failed, dispatching locally only: {e}"),
        }
    }
    dispatch_local(&state.registry, envelope).await;
}

async fn publish_to_redis(client: &RedisClient, envelope: &RelayEnvelope) -> Result<(), String> {
    let payload = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| e.to_string())?;
    let _: i64 = redis::AsyncCommands::publish(&mut conn, RELAY_TOPIC, payload)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Re-dispatches a relayed envelope through the local registry.
///
/// A user-scoped event is forwarded only when this process actually holds the
/// user's connection: at most one process does, so a subscriber fleet never
/// produces duplicate deliveries for the same logical user.
pub async fn dispatch_local(registry: &ConnectionRegistry, envelope: RelayEnvelope) {
    match envelope.scope {
        RelayScope::User(user_id) => {
            if registry.has_connection(user_id).await {
                registry.emit_to_user(user_id, envelope.event).await;
            }
        }
        RelayScope::Group(group) => registry.emit_to_group(&group, envelope.event).await,
    }
}

/// Long-running subscriber task, spawned once per process at startup.
pub async fn run_subscriber(state: Arc<AppState>) {
    let Some(client) = state.cache.clone() else {
        info!("Relay disabled (no REDIS_URL); in-app delivery is process-local only");
        return;
    };
    loop {
        if let Err(e) = subscribe_loop(&client, &state).await {
            warn!("Relay subscription lost: {e}");
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

async fn subscribe_loop(client: &RedisClient, state: &Arc<AppState>) -> Result<(), String> {
    let conn = client
        .get_async_connection()
        .await
        .map_err(|e| e.to_string())?;
    let mut pubsub = conn.into_pubsub();
    pubsub
        .subscribe(RELAY_TOPIC)
        .await
        .map_err(|e| e.to_string())?;
    info!("Relay subscribed to {RELAY_TOPIC}");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("Relay payload unreadable: {e}");
                continue;
            }
        };
        match serde_json::from_str::<RelayEnvelope>(&payload) {
            Ok(envelope) => dispatch_local(&state.registry, envelope).await,
            Err(e) => warn!("Relay message ignored: {e}"),
        }
    }
    Err("relay message stream ended".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::UserRole;

    #[tokio::test]
    async fn user_scope_is_gated_on_local_connection() {
        let registry = ConnectionRegistry::new();
        let connected = Uuid::new_v4();
        let elsewhere = Uuid::new_v4();
        let mut handle = registry
            .register(connected, Uuid::new_v4(), UserRole::Agent)
            .await;

        // Held here: forwarded once.
        dispatch_local(
            &registry,
            RelayEnvelope {
                scope: RelayScope::User(connected),
                event: WireEvent::new("notification:new", serde_json::json!({"id": 1})),
            },
        )
        .await;
        // Held by another process: dropped here.
        dispatch_local(
            &registry,
            RelayEnvelope {
                scope: RelayScope::User(elsewhere),
                event: WireEvent::new("notification:new", serde_json::json!({"id": 2})),
            },
        )
        .await;

        let event = handle.user_rx.recv().await.unwrap();
        assert_eq!(event.data["id"], 1);
        assert!(handle.user_rx.try_recv().is_err());
    }

    #[test]
    fn envelope_survives_the_wire() {
        let envelope = RelayEnvelope {
            scope: RelayScope::Group("agents".to_string()),
            event: WireEvent::new("ticket:updated", serde_json::json!({"id": "t"})),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: RelayEnvelope = serde_json::from_str(&json).unwrap();
        match back.scope {
            RelayScope::Group(g) => assert_eq!(g, "agents"),
            RelayScope::User(_) => panic!("wrong scope"),
        }
        assert_eq!(back.event.event, "ticket:updated");
    }
}
