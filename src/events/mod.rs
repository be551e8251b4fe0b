//! Domain events published after engine state changes commit.

pub mod publisher;
pub mod types;

pub use publisher::{EventPublisher, PublishedEvent};
pub use types::EngineEvent;
