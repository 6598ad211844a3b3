use crate::config::AppConfig;
use crate::realtime::ConnectionRegistry;
use crate::shared::utils::DbPool;
use redis::Client as RedisClient;
use std::sync::Arc;

pub struct AppState {
    pub conn: DbPool,
    pub cache: Option<Arc<RedisClient>>,
    pub config: AppConfig,
    pub registry: Arc<ConnectionRegistry>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}
