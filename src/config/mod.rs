use std::env;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
    pub delivery: DeliveryConfig,
    pub redis_url: Option<String>,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

#[derive(Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Clone)]
pub struct DeliveryConfig {
    pub poll_interval_secs: u64,
    pub batch_size: i64,
    pub max_in_flight: usize,
    pub max_attempts: i32,
    pub backoff_base_secs: i64,
}

impl AppConfig {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }

    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_or("SERVER_PORT", "8080").parse().unwrap_or(8080),
            },
            database: DatabaseConfig {
                username: env_or("DB_USER", "deskserver"),
                password: env_or("DB_PASSWORD", "deskserver"),
                server: env_or("DB_HOST", "localhost"),
                port: env_or("DB_PORT", "5432").parse().unwrap_or(5432),
                database: env_or("DB_NAME", "deskserver"),
            },
            smtp: SmtpConfig {
                server: env_or("SMTP_SERVER", "localhost"),
                username: env_or("SMTP_USER", ""),
                password: env_or("SMTP_PASSWORD", ""),
                from: env_or("SMTP_FROM", "support@localhost"),
            },
            delivery: DeliveryConfig {
                poll_interval_secs: env_or("DELIVERY_POLL_SECS", "5").parse().unwrap_or(5),
                batch_size: env_or("DELIVERY_BATCH", "50").parse().unwrap_or(50),
                max_in_flight: env_or("DELIVERY_IN_FLIGHT", "8").parse().unwrap_or(8),
                max_attempts: env_or("DELIVERY_MAX_ATTEMPTS", "3").parse().unwrap_or(3),
                backoff_base_secs: env_or("DELIVERY_BACKOFF_SECS", "30").parse().unwrap_or(30),
            },
            redis_url: env::var("REDIS_URL").ok(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
