//! Pacing between consecutive remote vehicle commands.
//!
//! Vehicles reject bursts of commands, so every step of a command sequence
//! waits on a [`CommandPacer`] before the next one is sent.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait CommandPacer: Send + Sync {
    async fn pace(&self);
}

/// Waits a fixed delay between commands.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelayPacer {
    delay: Duration,
}

impl FixedDelayPacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl CommandPacer for FixedDelayPacer {
    async fn pace(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

/// No delay at all. Used in tests and for command APIs without rate limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

#[async_trait]
impl CommandPacer for NoPacing {
    async fn pace(&self) {}
}
