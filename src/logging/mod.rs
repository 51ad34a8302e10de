//! Logging setup and lifecycle events
//!
//! Client connects and disconnects, batch emission and drops, and inference
//! outcomes are emitted as discrete events for external log shipping.

pub mod events;

pub use events::{EventLogger, EventType, PipelineEvent};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `log_level`.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("audio_gateway={},info", log_level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}
