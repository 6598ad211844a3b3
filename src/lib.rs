pub mod config;
pub mod notifications;
pub mod realtime;
pub mod shared;
pub mod tickets;
