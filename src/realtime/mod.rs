pub mod relay;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use diesel::prelude::*;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::shared::models::{User, UserRole};
use crate::shared::schema::users;
use crate::shared::state::AppState;

const GROUP_CHANNEL_CAPACITY: usize = 256;

pub fn user_group(user_id: Uuid) -> String {
    format!("user:{user_id}")
}

// Role groups are tenant-scoped; a broadcast never crosses an org boundary.
pub fn agents_group(org_id: Uuid) -> String {
    format!("agents:{org_id}")
}

pub fn admins_group(org_id: Uuid) -> String {
    format!("admins:{org_id}")
}

/// One named event on the wire, JSON-serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl WireEvent {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn unread_count(count: i64) -> Self {
        Self::new(
            "notification:unread-count",
            serde_json::json!({ "count": count }),
        )
    }
}

/// Process-local registry of live websocket connections.
///
/// Purely ephemeral: rebuilt from reconnects, never the system of record.
/// Each broadcast group is a tokio broadcast channel; a connection subscribes
/// to its `user:<id>` group and, for agents/admins, to the role group.
pub struct ConnectionRegistry {
    groups: RwLock<HashMap<String, broadcast::Sender<WireEvent>>>,
    live: RwLock<HashMap<Uuid, usize>>,
}

pub struct ConnectionHandle {
    pub user_rx: broadcast::Receiver<WireEvent>,
    pub role_rx: Option<broadcast::Receiver<WireEvent>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, group: &str) -> broadcast::Sender<WireEvent> {
        let mut groups = self.groups.write().await;
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub async fn register(&self, user_id: Uuid, org_id: Uuid, role: UserRole) -> ConnectionHandle {
        let user_rx = self.sender_for(&user_group(user_id)).await.subscribe();
        let role_rx = match role {
            UserRole::Agent => Some(self.sender_for(&agents_group(org_id)).await.subscribe()),
            UserRole::Admin => Some(self.sender_for(&admins_group(org_id)).await.subscribe()),
            UserRole::Customer => None,
        };
        let mut live = self.live.write().await;
        *live.entry(user_id).or_insert(0) += 1;
        ConnectionHandle { user_rx, role_rx }
    }

    pub async fn unregister(&self, user_id: Uuid) {
        let mut live = self.live.write().await;
        if let Some(count) = live.get_mut(&user_id) {
            *count -= 1;
            if *count == 0 {
                live.remove(&user_id);
            }
        }
        drop(live);
        // Drop group channels nobody listens to anymore.
        let mut groups = self.groups.write().await;
        groups.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub async fn has_connection(&self, user_id: Uuid) -> bool {
        self.live.read().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.live.read().await.values().sum()
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Fire-and-forget: a recipient without a live connection simply misses
    /// the in-app push; the persisted notification row is the durable record.
    pub async fn emit_to_user(&self, user_id: Uuid, event: WireEvent) {
        let groups = self.groups.read().await;
        if let Some(tx) = groups.get(&user_group(user_id)) {
            let _ = tx.send(event);
        }
    }

    pub async fn emit_to_group(&self, group: &str, event: WireEvent) {
        let groups = self.groups.read().await;
        if let Some(tx) = groups.get(group) {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// Resolves the handshake bearer token to (user id, org, role).
///
/// Session issuance lives outside this engine; the token is the user id and
/// must match an active user row.
fn resolve_token(state: &AppState, token: &str) -> Result<(Uuid, Uuid, UserRole), String> {
    let user_id = Uuid::parse_str(token).map_err(|_| "Invalid token".to_string())?;
    let mut conn = state
        .conn
        .get()
        .map_err(|e| format!("DB error: {e}"))?;
    let user: User = users::table
        .filter(users::id.eq(user_id))
        .filter(users::is_active.eq(true))
        .first(&mut conn)
        .map_err(|_| "Unknown user".to_string())?;
    Ok((user.id, user.org_id, user.role()))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match resolve_token(&state, &query.token) {
        Ok((user_id, org_id, role)) => ws
            .on_upgrade(move |socket| handle_connection(socket, state, user_id, org_id, role))
            .into_response(),
        Err(e) => (StatusCode::UNAUTHORIZED, e).into_response(),
    }
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: Uuid,
    org_id: Uuid,
    role: UserRole,
) {
    let (mut sender, mut receiver) = socket.split();
    let handle = state.registry.register(user_id, org_id, role).await;
    info!("Websocket connected: user {user_id} ({})", role.as_str());

    // Current unread count is pushed right after the handshake.
    if let Ok(count) = crate::notifications::unread_count_for(&state.conn, user_id) {
        let payload = serde_json::to_string(&WireEvent::unread_count(count)).unwrap_or_default();
        if sender.send(Message::Text(payload)).await.is_err() {
            drop(handle);
            state.registry.unregister(user_id).await;
            return;
        }
    }

    let send_task = tokio::spawn(forward_events(sender, handle));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(other) => {
                // The duplex channel is push-only; client frames are ignored.
                debug!("Ignoring client frame from {user_id}: {other:?}");
            }
        }
    }

    // Wait for the aborted forwarder so its receivers are gone before the
    // registry prunes empty groups.
    send_task.abort();
    let _ = send_task.await;
    state.registry.unregister(user_id).await;
    info!("Websocket disconnected: user {user_id}");
}

async fn forward_events(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut handle: ConnectionHandle,
) {
    loop {
        let event = match handle.role_rx.as_mut() {
            Some(role_rx) => tokio::select! {
                v = handle.user_rx.recv() => v,
                v = role_rx.recv() => v,
            },
            None => handle.user_rx.recv().await,
        };
        match event {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Failed to serialize wire event: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Websocket forwarder lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn configure_realtime_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_emit_reaches_user_group() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let mut handle = registry
            .register(user_id, Uuid::new_v4(), UserRole::Customer)
            .await;

        registry
            .emit_to_user(user_id, WireEvent::unread_count(3))
            .await;

        let event = handle.user_rx.recv().await.expect("event");
        assert_eq!(event.event, "notification:unread-count");
        assert_eq!(event.data["count"], 3);
    }

    #[tokio::test]
    async fn emit_to_unknown_user_is_a_noop() {
        let registry = ConnectionRegistry::new();
        registry
            .emit_to_user(Uuid::new_v4(), WireEvent::unread_count(1))
            .await;
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn group_multicast_reaches_all_agents_but_not_customers() {
        let registry = ConnectionRegistry::new();
        let org = Uuid::new_v4();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();
        let customer = Uuid::new_v4();
        let mut a = registry.register(agent_a, org, UserRole::Agent).await;
        let mut b = registry.register(agent_b, org, UserRole::Agent).await;
        let mut c = registry.register(customer, org, UserRole::Customer).await;

        registry
            .emit_to_group(
                &agents_group(org),
                WireEvent::new("ticket:created", serde_json::json!({"id": "t1"})),
            )
            .await;

        assert_eq!(
            a.role_rx.as_mut().unwrap().recv().await.unwrap().event,
            "ticket:created"
        );
        assert_eq!(
            b.role_rx.as_mut().unwrap().recv().await.unwrap().event,
            "ticket:created"
        );
        assert!(c.role_rx.is_none());
        assert!(c.user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admins_join_their_own_role_group() {
        let registry = ConnectionRegistry::new();
        let org = Uuid::new_v4();
        let mut admin = registry
            .register(Uuid::new_v4(), org, UserRole::Admin)
            .await;
        let mut agent = registry
            .register(Uuid::new_v4(), org, UserRole::Agent)
            .await;

        registry
            .emit_to_group(
                &admins_group(org),
                WireEvent::new("ticket:updated", serde_json::json!({"id": "t1"})),
            )
            .await;

        assert_eq!(
            admin.role_rx.as_mut().unwrap().recv().await.unwrap().event,
            "ticket:updated"
        );
        assert!(agent.role_rx.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn role_groups_never_cross_org_boundaries() {
        let registry = ConnectionRegistry::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let mut in_org = registry
            .register(Uuid::new_v4(), org_a, UserRole::Agent)
            .await;
        let mut other_org = registry
            .register(Uuid::new_v4(), org_b, UserRole::Agent)
            .await;

        registry
            .emit_to_group(
                &agents_group(org_a),
                WireEvent::new("ticket:created", serde_json::json!({"id": "t1"})),
            )
            .await;

        assert_eq!(
            in_org.role_rx.as_mut().unwrap().recv().await.unwrap().event,
            "ticket:created"
        );
        assert!(other_org.role_rx.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_clears_liveness() {
        let registry = ConnectionRegistry::new();
        let org = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let first = registry.register(user_id, org, UserRole::Agent).await;
        let _second = registry.register(user_id, org, UserRole::Agent).await;

        registry.unregister(user_id).await;
        // One tab closed, the other still counts as a live connection.
        assert!(registry.has_connection(user_id).await);

        drop(first);
        registry.unregister(user_id).await;
        assert!(!registry.has_connection(user_id).await);
    }

    #[tokio::test]
    async fn dropped_handles_are_pruned_on_unregister() {
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let handle = registry
            .register(user_id, Uuid::new_v4(), UserRole::Agent)
            .await;
        assert!(registry.group_count().await > 0);

        // Receivers must be gone before unregister for the prune to land.
        drop(handle);
        registry.unregister(user_id).await;
        assert_eq!(registry.group_count().await, 0);
    }
}
