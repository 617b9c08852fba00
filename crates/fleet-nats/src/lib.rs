//! NATS message bus handler for the fleet agent.

mod handler;
pub mod config;
pub mod metrics;

pub use config::NatsConfig;
pub use handler::NatsHandler;
pub use metrics::{MetricsSnapshot, NatsMetrics};
