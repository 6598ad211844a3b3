use dotenvy::dotenv;
use log::info;
use std::sync::Arc;

use deskserver::config::AppConfig;
use deskserver::notifications::{configure_notifications_routes, delivery};
use deskserver::realtime::{configure_realtime_routes, relay, ConnectionRegistry};
use deskserver::shared::state::AppState;
use deskserver::shared::utils::create_conn;
use deskserver::tickets::configure_tickets_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env();
    let conn = create_conn(&config.database_url())?;

    let cache = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                log::warn!("Redis unavailable, relay disabled: {e}");
                None
            }
        },
        None => None,
    };

    let state = Arc::new(AppState {
        conn,
        cache,
        config: config.clone(),
        registry: Arc::new(ConnectionRegistry::new()),
    });

    tokio::spawn(relay::run_subscriber(state.clone()));
    delivery::run_delivery_workers(state.clone());

    let app = axum::Router::new()
        .merge(configure_tickets_routes())
        .merge(configure_notifications_routes())
        .merge(configure_realtime_routes())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("deskserver listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
