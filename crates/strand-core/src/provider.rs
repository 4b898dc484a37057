use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::LlmContext;
use crate::errors::GatewayError;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Options controlling generation behavior.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub max_tokens: u32,
    pub thinking: ThinkingConfig,
    pub stop_sequences: Vec<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: 16_384,
            thinking: ThinkingConfig::Budget { tokens: 10_000 },
            stop_sequences: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingConfig {
    Disabled,
    Budget { tokens: u32 },
}

/// A streaming reasoning engine.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError>;
}
