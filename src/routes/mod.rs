//! HTTP routes for the audio gateway

pub mod health;

pub use health::{health_check, json_response, readiness_check, stats, version_info};
