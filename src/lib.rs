//! Library crate for ws-scan-rs: TLS + WebSocket-upgrade endpoint probing,
//! stability ranking and deep quality assessment.
pub mod config;
pub mod ports;
pub mod probe;
pub mod quality;
pub mod report;
pub mod scanner;
pub mod server;
pub mod stability;
pub mod targets;
pub mod throttle;
pub mod types;
pub mod uri;
