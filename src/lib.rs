pub mod compare;
pub mod config;
pub mod database;
pub mod executor;
pub mod filter;
pub mod fixture;
pub mod routes;
pub mod rows;
pub mod sandbox;
pub mod verifier;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
