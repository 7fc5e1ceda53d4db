pub mod config;
pub mod database;
pub mod invoker;
pub mod model;
pub mod parsers;
pub mod queue;
pub mod registry;
pub mod report;
pub mod routes;
pub mod scheduler;
pub mod status;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
